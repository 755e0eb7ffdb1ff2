use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Retained samples per calculator.
const DEFAULT_MAX_SAMPLES: usize = 100;

// ---------------------------------------------------------------------------
// SpeedCalculator
// ---------------------------------------------------------------------------

struct SpeedSample {
    bytes: u64,
    timestamp: Instant,
}

/// Calculates transfer speed using a sliding window of samples.
pub struct SpeedCalculator {
    inner: Mutex<SpeedInner>,
}

struct SpeedInner {
    samples: Vec<SpeedSample>,
    max_samples: usize,
    window_size: Duration,
}

impl SpeedCalculator {
    /// Creates a new calculator.
    ///
    /// - `window_size`: time window for speed calculation (default 5 s).
    /// - `max_samples`: maximum retained samples (default 100).
    pub fn new(window_size: Option<Duration>, max_samples: Option<usize>) -> Self {
        Self {
            inner: Mutex::new(SpeedInner {
                samples: Vec::new(),
                max_samples: max_samples.unwrap_or(DEFAULT_MAX_SAMPLES),
                window_size: window_size.unwrap_or(Duration::from_secs(5)),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SpeedInner> {
        // Samples are plain data; a panic mid-update leaves them usable.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Records a sample of `bytes` transferred at the current instant.
    pub fn add_sample(&self, bytes: u64) {
        self.add_sample_at(bytes, Instant::now());
    }

    fn add_sample_at(&self, bytes: u64, now: Instant) {
        let mut s = self.lock();
        s.samples.push(SpeedSample {
            bytes,
            timestamp: now,
        });

        // Prune samples outside the window.
        if let Some(cutoff) = now.checked_sub(s.window_size) {
            s.samples.retain(|sample| sample.timestamp >= cutoff);
        }

        if s.samples.len() > s.max_samples {
            let excess = s.samples.len() - s.max_samples;
            s.samples.drain(..excess);
        }
    }

    /// Returns the average speed in bytes/second within the window.
    ///
    /// Returns 0.0 if fewer than 2 samples.
    pub fn bytes_per_second(&self) -> f64 {
        let s = self.lock();
        if s.samples.len() < 2 {
            return 0.0;
        }

        let first = &s.samples[0];
        let last = &s.samples[s.samples.len() - 1];
        let elapsed = last.timestamp.duration_since(first.timestamp);
        if elapsed.is_zero() {
            return 0.0;
        }

        let total_bytes: u64 = s.samples.iter().map(|sample| sample.bytes).sum();
        total_bytes as f64 / elapsed.as_secs_f64()
    }

    /// Estimates time remaining to transfer `remaining_bytes`.
    ///
    /// Returns `None` if speed is zero.
    pub fn eta(&self, remaining_bytes: u64) -> Option<Duration> {
        let speed = self.bytes_per_second();
        if speed <= 0.0 {
            return None;
        }
        Duration::try_from_secs_f64(remaining_bytes as f64 / speed).ok()
    }
}

// ---------------------------------------------------------------------------
// ThroughputMeters
// ---------------------------------------------------------------------------

/// One [`SpeedCalculator`] per session, kept in memory only.
///
/// Meters appear on the first committed chunk and go away when the session
/// ends. A restart simply starts them over.
pub struct ThroughputMeters {
    window: Duration,
    meters: Mutex<HashMap<String, Arc<SpeedCalculator>>>,
}

impl ThroughputMeters {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            meters: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<SpeedCalculator>>> {
        self.meters.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Records `bytes` for `session_id` and returns the updated rate.
    pub fn record(&self, session_id: &str, bytes: u64) -> f64 {
        let meter = {
            let mut meters = self.lock();
            Arc::clone(
                meters
                    .entry(session_id.to_string())
                    .or_insert_with(|| Arc::new(SpeedCalculator::new(Some(self.window), None))),
            )
        };
        meter.add_sample(bytes);
        meter.bytes_per_second()
    }

    /// Current rate for `session_id` in bytes/second (0.0 if unknown).
    pub fn rate(&self, session_id: &str) -> f64 {
        let meter = self.lock().get(session_id).cloned();
        meter.map_or(0.0, |m| m.bytes_per_second())
    }

    /// Estimated time to move `remaining_bytes` at the current rate.
    pub fn eta(&self, session_id: &str, remaining_bytes: u64) -> Option<Duration> {
        let meter = self.lock().get(session_id).cloned();
        meter.and_then(|m| m.eta(remaining_bytes))
    }

    pub fn remove(&self, session_id: &str) {
        self.lock().remove(session_id);
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
