//! Stable, machine-readable error codes.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Error code carried in every failed response.
///
/// The string form never changes once published; clients match on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    InvalidPath,
    InvalidRequest,
    Forbidden,
    SessionNotFound,
    FileNotFound,
    InvalidState,
    SessionPaused,
    FileAlreadyCompleted,
    OffsetMismatch,
    ChunkLengthMismatch,
    SizeExceeded,
    IntegrityMismatch,
    QuotaExceeded,
    DuplicatePath,
    FinalizeFailed,
    ConflictInProgress,
    TooManyConcurrentUploads,
    StoreUnavailable,
    Internal,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::InvalidPath => "invalid_path",
            ErrorCode::InvalidRequest => "invalid_request",
            ErrorCode::Forbidden => "forbidden",
            ErrorCode::SessionNotFound => "session_not_found",
            ErrorCode::FileNotFound => "file_not_found",
            ErrorCode::InvalidState => "invalid_state",
            ErrorCode::SessionPaused => "session_paused",
            ErrorCode::FileAlreadyCompleted => "file_already_completed",
            ErrorCode::OffsetMismatch => "offset_mismatch",
            ErrorCode::ChunkLengthMismatch => "chunk_length_mismatch",
            ErrorCode::SizeExceeded => "size_exceeded",
            ErrorCode::IntegrityMismatch => "integrity_mismatch",
            ErrorCode::QuotaExceeded => "quota_exceeded",
            ErrorCode::DuplicatePath => "duplicate_path",
            ErrorCode::FinalizeFailed => "finalize_failed",
            ErrorCode::ConflictInProgress => "conflict_in_progress",
            ErrorCode::TooManyConcurrentUploads => "too_many_concurrent_uploads",
            ErrorCode::StoreUnavailable => "store_unavailable",
            ErrorCode::Internal => "internal",
        }
    }

    /// HTTP status an upstream layer should answer with.
    pub fn status_code(self) -> u16 {
        match self {
            ErrorCode::InvalidPath
            | ErrorCode::InvalidRequest
            | ErrorCode::ChunkLengthMismatch
            | ErrorCode::SizeExceeded
            | ErrorCode::IntegrityMismatch => 400,
            ErrorCode::Forbidden => 403,
            ErrorCode::SessionNotFound | ErrorCode::FileNotFound => 404,
            ErrorCode::InvalidState
            | ErrorCode::SessionPaused
            | ErrorCode::FileAlreadyCompleted
            | ErrorCode::OffsetMismatch
            | ErrorCode::DuplicatePath
            | ErrorCode::ConflictInProgress => 409,
            ErrorCode::QuotaExceeded | ErrorCode::TooManyConcurrentUploads => 429,
            ErrorCode::FinalizeFailed | ErrorCode::Internal => 500,
            ErrorCode::StoreUnavailable => 503,
        }
    }

    /// Returns `true` if the client should re-query status and resume.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorCode::OffsetMismatch
                | ErrorCode::IntegrityMismatch
                | ErrorCode::ChunkLengthMismatch
                | ErrorCode::FinalizeFailed
                | ErrorCode::ConflictInProgress
                | ErrorCode::TooManyConcurrentUploads
                | ErrorCode::StoreUnavailable
        )
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error payload: stable code plus a human-readable message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: ErrorCode,
    pub message: String,
}
