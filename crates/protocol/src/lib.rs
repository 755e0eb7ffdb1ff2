//! Wire-level types for the Landfall resumable upload service.
//!
//! Every operation exposed by `landfall-transfer` takes or returns one of
//! the payloads defined here. All JSON uses camelCase field names; status
//! values and error codes serialize as stable snake_case strings.

pub mod error;
pub mod messages;
pub mod types;

pub use error::{ErrorBody, ErrorCode};
pub use types::{FileStatus, SessionStatus};
