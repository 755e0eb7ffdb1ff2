//! Resumable uploads: sessions, chunk ingestion, finalize and expiry.
//!
//! [`UploadSessionManager`] owns session state and limits. Its
//! [`ChunkIngestion`] appends offset-exact chunks to scratch storage and
//! moves finished files into the owner's storage root. [`Cleaner`] expires
//! idle sessions in the background.

mod admission;
mod chunked;
mod cleanup;
mod config;
mod context;
mod error;
mod ingest;
mod manager;
mod progress;
mod types;
mod validation;

pub use admission::{Admission, UploadPermit};
pub use chunked::{
    ChunkWrite, ScratchDir, ScratchSpace, calculate_file_checksum, checksum_bytes,
    move_into_place, write_chunk,
};
pub use cleanup::{Cleaner, SweepReport};
pub use config::{DuplicatePathPolicy, UploadConfig};
pub use error::TransferError;
pub use ingest::ChunkIngestion;
pub use manager::UploadSessionManager;
pub use progress::{SpeedCalculator, ThroughputMeters};
pub use types::{
    FileUploadState, SESSION_KEY_PREFIX, UploadSession, owner_prefix, parse_session_key,
    session_key,
};
pub use validation::{
    is_well_formed_id, normalize_digest, normalize_relative_path, normalize_target_path,
    resolve_within_root, validate_owner_id,
};

/// Default size of the buffer chunk bodies pass through: 256 KiB.
///
/// Peak memory per in-flight chunk is one buffer, whatever the chunk size.
pub const DEFAULT_WRITE_BUFFER_SIZE: usize = 256 * 1024;
