//! Background expiry of idle sessions and orphaned scratch directories.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::types::{SESSION_KEY_PREFIX, parse_session_key};
use crate::{TransferError, UploadSessionManager};

/// Outcome of one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepReport {
    /// Session records loaded and checked.
    pub scanned: usize,
    pub expired: usize,
    /// Sessions left alone because a request held their lock.
    pub skipped_busy: usize,
    pub orphans_removed: usize,
}

impl SweepReport {
    fn is_quiet(&self) -> bool {
        self.expired == 0 && self.skipped_busy == 0 && self.orphans_removed == 0
    }
}

/// Periodically expires idle sessions.
///
/// Expiry goes through the same teardown as an explicit abort. The sweep
/// never waits on a session lock: a session busy with a request is skipped
/// and looked at again next time. A lock the sweep does take covers one
/// record load and one record delete; scratch directories are removed
/// after it is released.
pub struct Cleaner {
    manager: UploadSessionManager,
    inner: Arc<Mutex<CleanerInner>>,
}

#[derive(Default)]
struct CleanerInner {
    cancel: Option<CancellationToken>,
    task: Option<JoinHandle<()>>,
}

impl Cleaner {
    pub fn new(manager: UploadSessionManager) -> Self {
        Self {
            manager,
            inner: Arc::new(Mutex::new(CleanerInner::default())),
        }
    }

    /// Starts sweeping at the configured interval. Restarts the loop if it
    /// is already running.
    pub async fn start(&self) {
        let mut inner = self.inner.lock().await;

        if let Some(cancel) = inner.cancel.take() {
            cancel.cancel();
        }

        let cancel = CancellationToken::new();
        inner.cancel = Some(cancel.clone());

        let interval = self.manager.config().sweep_interval();
        let manager = self.manager.clone();
        inner.task = Some(tokio::spawn(async move {
            sweep_loop(manager, interval, cancel).await;
        }));

        info!(interval_secs = interval.as_secs(), "cleanup service started");
    }

    /// Stops the loop and waits for a sweep in progress to finish.
    pub async fn stop(&self) {
        let (cancel, task) = {
            let mut inner = self.inner.lock().await;
            (inner.cancel.take(), inner.task.take())
        };
        if let Some(cancel) = cancel {
            cancel.cancel();
            if let Some(task) = task {
                if let Err(e) = task.await {
                    warn!("cleanup task ended abnormally: {e}");
                }
            }
            info!("cleanup service stopped");
        }
    }

    pub async fn is_running(&self) -> bool {
        self.inner.lock().await.cancel.is_some()
    }

    /// Runs a single sweep as of `now`.
    pub async fn sweep_once(&self, now: DateTime<Utc>) -> Result<SweepReport, TransferError> {
        sweep(&self.manager, now).await
    }
}

async fn sweep_loop(manager: UploadSessionManager, interval: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // Skip the first immediate tick.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                if let Err(e) = sweep(&manager, Utc::now()).await {
                    warn!("sweep failed: {e}");
                }
            }
        }
    }
}

async fn sweep(
    manager: &UploadSessionManager,
    now: DateTime<Utc>,
) -> Result<SweepReport, TransferError> {
    let ctx = manager.context();
    let ttl = ctx.config.session_ttl();
    let mut report = SweepReport::default();

    let keys = ctx.store.keys_with_prefix(SESSION_KEY_PREFIX).await?;
    let mut known: HashSet<String> = HashSet::with_capacity(keys.len());

    for key in &keys {
        let Some((owner_id, session_id)) = parse_session_key(key) else {
            debug!(key, "skipping foreign key");
            continue;
        };
        known.insert(session_id.to_string());

        let Some(guard) = ctx.locks.try_lock(session_id) else {
            report.skipped_busy += 1;
            continue;
        };
        let session = match ctx.try_load(owner_id, session_id).await {
            Ok(Some(session)) => session,
            // Gone since listing: someone else already cleaned it up.
            Ok(None) => continue,
            Err(e) => {
                warn!(key, "cannot load session during sweep: {e}");
                continue;
            }
        };
        report.scanned += 1;

        if session.is_expired(now, ttl) {
            match manager.expire(session, guard).await {
                Ok(()) => report.expired += 1,
                Err(e) => warn!(session_id, "failed to expire session: {e}"),
            }
        }
    }

    report.orphans_removed = remove_orphans(manager, &known, now, ttl).await;

    if report.is_quiet() {
        debug!(scanned = report.scanned, "sweep finished");
    } else {
        info!(
            scanned = report.scanned,
            expired = report.expired,
            skipped_busy = report.skipped_busy,
            orphans_removed = report.orphans_removed,
            "sweep finished"
        );
    }
    Ok(report)
}

/// Removes scratch directories no stored session accounts for, once they
/// have been idle longer than the session TTL.
async fn remove_orphans(
    manager: &UploadSessionManager,
    known: &HashSet<String>,
    now: DateTime<Utc>,
    ttl: Duration,
) -> usize {
    let scratch = &manager.context().scratch;
    let dirs = match scratch.session_dirs().await {
        Ok(dirs) => dirs,
        Err(e) => {
            warn!(root = %scratch.root().display(), "cannot list scratch directories: {e}");
            return 0;
        }
    };
    let ttl = chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::weeks(5200));

    let mut removed = 0;
    for dir in dirs {
        if known.contains(&dir.session_id) {
            continue;
        }
        let modified: DateTime<Utc> = dir.modified.into();
        if now.signed_duration_since(modified) <= ttl {
            continue;
        }
        match scratch.remove_session(&dir.session_id).await {
            Ok(_) => {
                debug!(path = %dir.path.display(), "removed orphaned scratch directory");
                removed += 1;
            }
            Err(e) => warn!(path = %dir.path.display(), "failed to remove orphaned scratch: {e}"),
        }
    }
    removed
}
