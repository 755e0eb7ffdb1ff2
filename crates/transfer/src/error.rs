//! Transfer error types.

use landfall_protocol::{ErrorBody, ErrorCode};
use landfall_store::StoreError;

/// Errors produced by the upload subsystem.
///
/// Every variant maps to a stable [`ErrorCode`] via [`TransferError::code`].
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("file not found: {0}")]
    FileNotFound(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("session paused: {0}")]
    SessionPaused(String),

    #[error("file already completed: {0}")]
    FileAlreadyCompleted(String),

    #[error("offset mismatch: expected {expected}, got {actual}")]
    OffsetMismatch { expected: u64, actual: u64 },

    #[error("chunk length mismatch: declared {declared}, received {received}")]
    ChunkLengthMismatch { declared: u64, received: u64 },

    #[error("chunk ends at {end}, past declared size {declared}")]
    SizeExceeded { declared: u64, end: u64 },

    #[error("integrity mismatch: {0}")]
    IntegrityMismatch(String),

    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("duplicate path: {0}")]
    DuplicatePath(String),

    #[error("finalize failed: {0}")]
    FinalizeFailed(String),

    #[error("upload already in progress for file {0}")]
    ConflictInProgress(String),

    #[error("too many concurrent uploads: {0}")]
    TooManyConcurrentUploads(String),

    #[error("session store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransferError {
    /// Stable machine-readable code for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            TransferError::InvalidPath(_) => ErrorCode::InvalidPath,
            TransferError::InvalidRequest(_) => ErrorCode::InvalidRequest,
            TransferError::Forbidden(_) => ErrorCode::Forbidden,
            TransferError::SessionNotFound(_) => ErrorCode::SessionNotFound,
            TransferError::FileNotFound(_) => ErrorCode::FileNotFound,
            TransferError::InvalidState(_) => ErrorCode::InvalidState,
            TransferError::SessionPaused(_) => ErrorCode::SessionPaused,
            TransferError::FileAlreadyCompleted(_) => ErrorCode::FileAlreadyCompleted,
            TransferError::OffsetMismatch { .. } => ErrorCode::OffsetMismatch,
            TransferError::ChunkLengthMismatch { .. } => ErrorCode::ChunkLengthMismatch,
            TransferError::SizeExceeded { .. } => ErrorCode::SizeExceeded,
            TransferError::IntegrityMismatch(_) => ErrorCode::IntegrityMismatch,
            TransferError::QuotaExceeded(_) => ErrorCode::QuotaExceeded,
            TransferError::DuplicatePath(_) => ErrorCode::DuplicatePath,
            TransferError::FinalizeFailed(_) => ErrorCode::FinalizeFailed,
            TransferError::ConflictInProgress(_) => ErrorCode::ConflictInProgress,
            TransferError::TooManyConcurrentUploads(_) => ErrorCode::TooManyConcurrentUploads,
            TransferError::StoreUnavailable(_) => ErrorCode::StoreUnavailable,
            TransferError::Io(_) => ErrorCode::Internal,
        }
    }

    /// Wire payload for this error.
    pub fn to_body(&self) -> ErrorBody {
        ErrorBody {
            code: self.code(),
            message: self.to_string(),
        }
    }
}

impl From<StoreError> for TransferError {
    fn from(e: StoreError) -> Self {
        TransferError::StoreUnavailable(e.to_string())
    }
}

impl From<serde_json::Error> for TransferError {
    fn from(e: serde_json::Error) -> Self {
        TransferError::StoreUnavailable(format!("corrupt session record: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offset_mismatch_body() {
        let err = TransferError::OffsetMismatch {
            expected: 0,
            actual: 5,
        };
        let body = err.to_body();
        assert_eq!(body.code, ErrorCode::OffsetMismatch);
        assert_eq!(body.message, "offset mismatch: expected 0, got 5");
    }

    #[test]
    fn store_errors_become_store_unavailable() {
        let err: TransferError = StoreError::Unavailable("down".into()).into();
        assert_eq!(err.code(), ErrorCode::StoreUnavailable);
    }

    #[test]
    fn io_errors_are_internal() {
        let err: TransferError = std::io::Error::other("disk on fire").into();
        assert_eq!(err.code(), ErrorCode::Internal);
    }
}
