//! Upload limits and storage locations.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// What to do when a registration repeats a `relativePath` already present
/// in the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DuplicatePathPolicy {
    /// Accept it; the last file finalized wins.
    Allow,
    /// Fail the registration with `DuplicatePath`.
    Reject,
}

/// Configuration for the upload subsystem.
///
/// Every field has a default so partial config files are valid.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadConfig {
    /// Root under which each owner gets `<storage_root>/<owner_id>`.
    #[serde(default = "default_storage_root")]
    pub storage_root: PathBuf,

    /// Scratch area for partially received files, one directory per session.
    #[serde(default = "default_scratch_root")]
    pub scratch_root: PathBuf,

    /// Live (active or paused) sessions one owner may hold.
    #[serde(default = "default_max_sessions_per_owner")]
    pub max_sessions_per_owner: usize,

    #[serde(default = "default_max_files_per_session")]
    pub max_files_per_session: usize,

    /// Upper bound on a declared file size; `None` means unlimited.
    #[serde(default)]
    pub max_file_size: Option<u64>,

    /// Simultaneous chunk writes within one session.
    #[serde(default = "default_max_uploads_per_session")]
    pub max_uploads_per_session: usize,

    /// Simultaneous chunk writes across all of an owner's sessions.
    #[serde(default = "default_max_uploads_per_owner")]
    pub max_uploads_per_owner: usize,

    /// Inactivity after which the sweep aborts a session.
    #[serde(default = "default_session_ttl_secs")]
    pub session_ttl_secs: u64,

    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,

    /// Size of the buffer used to move chunk bodies to disk.
    #[serde(default = "default_write_buffer_size")]
    pub write_buffer_size: usize,

    #[serde(default = "default_throughput_window_secs")]
    pub throughput_window_secs: u64,

    #[serde(default = "default_duplicate_paths")]
    pub duplicate_paths: DuplicatePathPolicy,

    /// Replace an existing destination file on finalize.
    #[serde(default = "default_true")]
    pub overwrite_existing: bool,
}

fn default_storage_root() -> PathBuf {
    PathBuf::from("/var/lib/landfall/files")
}

fn default_scratch_root() -> PathBuf {
    PathBuf::from("/var/lib/landfall/scratch")
}

fn default_max_sessions_per_owner() -> usize {
    8
}

fn default_max_files_per_session() -> usize {
    10_000
}

fn default_max_uploads_per_session() -> usize {
    4
}

fn default_max_uploads_per_owner() -> usize {
    16
}

fn default_session_ttl_secs() -> u64 {
    24 * 60 * 60
}

fn default_sweep_interval_secs() -> u64 {
    300
}

fn default_write_buffer_size() -> usize {
    crate::DEFAULT_WRITE_BUFFER_SIZE
}

fn default_throughput_window_secs() -> u64 {
    5
}

fn default_duplicate_paths() -> DuplicatePathPolicy {
    DuplicatePathPolicy::Allow
}

fn default_true() -> bool {
    true
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            storage_root: default_storage_root(),
            scratch_root: default_scratch_root(),
            max_sessions_per_owner: default_max_sessions_per_owner(),
            max_files_per_session: default_max_files_per_session(),
            max_file_size: None,
            max_uploads_per_session: default_max_uploads_per_session(),
            max_uploads_per_owner: default_max_uploads_per_owner(),
            session_ttl_secs: default_session_ttl_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            write_buffer_size: default_write_buffer_size(),
            throughput_window_secs: default_throughput_window_secs(),
            duplicate_paths: default_duplicate_paths(),
            overwrite_existing: default_true(),
        }
    }
}

impl UploadConfig {
    /// Config rooted in `base`, with `files/` and `scratch/` beneath it.
    pub fn with_base_dir(base: impl Into<PathBuf>) -> Self {
        let base = base.into();
        Self {
            storage_root: base.join("files"),
            scratch_root: base.join("scratch"),
            ..Self::default()
        }
    }

    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_secs)
    }

    /// TTL applied to store records. Twice the session TTL, so the sweep
    /// always sees an idle session before the store forgets it.
    pub fn record_ttl(&self) -> Duration {
        self.session_ttl().saturating_mul(2)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }

    pub fn throughput_window(&self) -> Duration {
        Duration::from_secs(self.throughput_window_secs.max(1))
    }

    /// Write buffer size, never below 4 KiB.
    pub fn buffer_size(&self) -> usize {
        self.write_buffer_size.max(4096)
    }
}
