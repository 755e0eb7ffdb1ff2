use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{FileStatus, SessionStatus};

// ---------------------------------------------------------------------------
// Request payloads
// ---------------------------------------------------------------------------

/// A file the client intends to upload into a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileDescriptor {
    pub relative_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    /// SHA-256 hex digest of the whole file, verified before finalize.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

impl FileDescriptor {
    pub fn new(relative_path: impl Into<String>, size: Option<u64>) -> Self {
        Self {
            relative_path: relative_path.into(),
            size,
            checksum: None,
        }
    }
}

/// Metadata accompanying a chunk body.
///
/// The body itself travels out of band (raw request body) and is streamed
/// straight to scratch storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkRequest {
    pub session_id: String,
    pub file_id: String,
    pub offset: u64,
    /// Declared length of the body in bytes.
    pub length: u64,
    /// SHA-256 hex digest of the body; verified when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
    /// Marks the final chunk of a file registered without a size.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_last: bool,
}

// ---------------------------------------------------------------------------
// Response payloads
// ---------------------------------------------------------------------------

/// Returned by session creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionDescriptor {
    pub id: String,
    pub status: SessionStatus,
    pub target_path: String,
    pub created_at: DateTime<Utc>,
}

/// One entry of a successful registration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisteredFile {
    pub file_id: String,
    pub relative_path: String,
}

/// Acknowledges an applied chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkAck {
    pub received_bytes: u64,
    /// `true` once the file has been finalized at its destination.
    pub completed: bool,
    pub session_status: SessionStatus,
    /// Bytes per second measured while writing this chunk.
    pub throughput: f64,
}

/// Per-file progress inside a [`StatusReport`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileProgress {
    pub file_id: String,
    pub relative_path: String,
    pub received_bytes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    pub status: FileStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub percentage: Option<f64>,
}

/// Point-in-time snapshot of a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub session_id: String,
    pub status: SessionStatus,
    pub target_path: String,
    pub files: Vec<FileProgress>,
    pub received_bytes: u64,
    /// Sum of declared sizes; absent while any file size is unknown.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_bytes: Option<u64>,
    /// Bytes per second over the recent throughput window.
    pub aggregate_throughput: f64,
    /// Seconds left at the current rate; absent while the rate or the
    /// total is unknown.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eta_secs: Option<f64>,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

/// Result of pause, resume, abort and complete.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub session_id: String,
    pub status: SessionStatus,
}

/// Compact listing entry for an owner's sessions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub id: String,
    pub status: SessionStatus,
    pub target_path: String,
    pub file_count: usize,
    pub last_activity: DateTime<Utc>,
}
