use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use landfall_protocol::messages::{FileProgress, SessionDescriptor, SessionSummary};
use landfall_protocol::{FileStatus, SessionStatus};

use crate::TransferError;

/// Namespace shared by every session record in the store.
pub const SESSION_KEY_PREFIX: &str = "upload_session:";

/// Store key for a session: `upload_session:{owner_id}:{session_id}`.
pub fn session_key(owner_id: &str, session_id: &str) -> String {
    format!("{SESSION_KEY_PREFIX}{owner_id}:{session_id}")
}

/// Prefix matching every session of `owner_id`.
pub fn owner_prefix(owner_id: &str) -> String {
    format!("{SESSION_KEY_PREFIX}{owner_id}:")
}

/// Namespace of the session-to-owner index.
pub const OWNER_INDEX_PREFIX: &str = "upload_owner:";

/// Index key naming the owner of `session_id`. Lets a lookup under the
/// wrong owner answer `Forbidden` without scanning every session.
pub fn owner_index_key(session_id: &str) -> String {
    format!("{OWNER_INDEX_PREFIX}{session_id}")
}

/// Splits a session key into `(owner_id, session_id)`.
pub fn parse_session_key(key: &str) -> Option<(&str, &str)> {
    let rest = key.strip_prefix(SESSION_KEY_PREFIX)?;
    let (owner, session) = rest.split_once(':')?;
    if owner.is_empty() || session.is_empty() {
        return None;
    }
    Some((owner, session))
}

/// Persisted state of one file inside a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileUploadState {
    pub file_id: String,
    pub relative_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub declared_size: Option<u64>,
    /// Contiguous bytes committed to scratch storage.
    pub received_bytes: u64,
    pub status: FileStatus,
    /// Scratch file accumulating the bytes, from first write to finalize.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temp_storage: Option<PathBuf>,
    /// Declared SHA-256 hex digest of the whole file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

impl FileUploadState {
    /// Creates a pending file with a fresh id.
    pub fn new(
        relative_path: String,
        declared_size: Option<u64>,
        checksum: Option<String>,
    ) -> Self {
        Self {
            file_id: uuid::Uuid::new_v4().to_string(),
            relative_path,
            declared_size,
            received_bytes: 0,
            status: FileStatus::Pending,
            temp_storage: None,
            checksum,
        }
    }

    /// Returns `true` once every declared byte has been received.
    pub fn is_fully_received(&self) -> bool {
        self.declared_size == Some(self.received_bytes)
    }

    /// Bytes received and ready, but not yet moved to the destination.
    pub fn awaits_finalize(&self) -> bool {
        self.status == FileStatus::Uploading && self.is_fully_received()
    }

    /// Progress in percent (0-100); `None` while the size is unknown.
    pub fn percentage(&self) -> Option<f64> {
        match self.declared_size {
            Some(0) => Some(if self.status == FileStatus::Completed {
                100.0
            } else {
                0.0
            }),
            Some(size) => Some(self.received_bytes as f64 / size as f64 * 100.0),
            None => None,
        }
    }

    /// Advances the received-byte mark after a committed write.
    pub fn record_bytes(&mut self, bytes: u64, temp_storage: PathBuf) {
        self.received_bytes += bytes;
        self.status = FileStatus::Uploading;
        self.temp_storage = Some(temp_storage);
    }

    /// Marks the file failed and forgets its scratch bytes.
    pub fn fail(&mut self) {
        self.status = FileStatus::Failed;
        self.received_bytes = 0;
        self.temp_storage = None;
    }

    /// Marks the file finalized at its destination.
    pub fn complete(&mut self) {
        self.status = FileStatus::Completed;
        self.temp_storage = None;
    }

    pub fn progress(&self) -> FileProgress {
        FileProgress {
            file_id: self.file_id.clone(),
            relative_path: self.relative_path.clone(),
            received_bytes: self.received_bytes,
            size: self.declared_size,
            status: self.status,
            percentage: self.percentage(),
        }
    }
}

/// Persisted state of an upload session, including all of its files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadSession {
    pub id: String,
    pub owner_id: String,
    /// Normalized directory relative to the owner's storage root.
    pub target_path: String,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    #[serde(default)]
    pub files: HashMap<String, FileUploadState>,
    /// Last write of this session's owner index entry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_indexed_at: Option<DateTime<Utc>>,
}

impl UploadSession {
    /// Creates an active session with a fresh id.
    pub fn new(owner_id: String, target_path: String) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            owner_id,
            target_path,
            status: SessionStatus::Active,
            created_at: now,
            last_activity: now,
            files: HashMap::new(),
            owner_indexed_at: None,
        }
    }

    pub fn key(&self) -> String {
        session_key(&self.owner_id, &self.id)
    }

    /// Refreshes `last_activity`.
    pub fn touch(&mut self) {
        self.last_activity = Utc::now();
    }

    /// Active or paused.
    pub fn is_live(&self) -> bool {
        !self.status.is_terminal()
    }

    /// Returns `true` if the session has been idle longer than `ttl` at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        let ttl =
            chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::weeks(5200));
        now.signed_duration_since(self.last_activity) > ttl
    }

    /// At least one file, and every file completed.
    pub fn all_files_completed(&self) -> bool {
        !self.files.is_empty()
            && self
                .files
                .values()
                .all(|f| f.status == FileStatus::Completed)
    }

    /// Applies a status change, refusing transitions the lifecycle forbids.
    pub fn transition(&mut self, to: SessionStatus) -> Result<(), TransferError> {
        use SessionStatus::*;
        let allowed = matches!(
            (self.status, to),
            (Active, Paused)
                | (Paused, Active)
                | (Active, Completed)
                | (Paused, Completed)
                | (Active, Aborted)
                | (Paused, Aborted)
        );
        if !allowed {
            return Err(TransferError::InvalidState(format!(
                "session {} cannot go from {} to {}",
                self.id, self.status, to
            )));
        }
        self.status = to;
        self.touch();
        Ok(())
    }

    pub fn file(&self, file_id: &str) -> Result<&FileUploadState, TransferError> {
        self.files
            .get(file_id)
            .ok_or_else(|| TransferError::FileNotFound(file_id.to_string()))
    }

    pub fn file_mut(&mut self, file_id: &str) -> Result<&mut FileUploadState, TransferError> {
        self.files
            .get_mut(file_id)
            .ok_or_else(|| TransferError::FileNotFound(file_id.to_string()))
    }

    /// Sum of received bytes over all files.
    pub fn received_bytes(&self) -> u64 {
        self.files.values().map(|f| f.received_bytes).sum()
    }

    /// Sum of declared sizes, or `None` if any size is unknown.
    pub fn total_bytes(&self) -> Option<u64> {
        self.files.values().map(|f| f.declared_size).sum()
    }

    pub fn descriptor(&self) -> SessionDescriptor {
        SessionDescriptor {
            id: self.id.clone(),
            status: self.status,
            target_path: self.target_path.clone(),
            created_at: self.created_at,
        }
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            id: self.id.clone(),
            status: self.status,
            target_path: self.target_path.clone(),
            file_count: self.files.len(),
            last_activity: self.last_activity,
        }
    }
}
