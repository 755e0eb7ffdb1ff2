//! Session state persistence.
//!
//! The upload subsystem keeps every session record in a [`SessionStore`]:
//! a key-value store with per-record TTLs and prefix enumeration. Two
//! implementations are provided:
//!
//! - [`FileStore`]: one JSON file per key, survives process restarts.
//! - [`MemoryStore`]: process-local, for tests and throwaway setups.
//!
//! Callers never fall back from one to the other; a failing store surfaces
//! as [`StoreError`].

mod error;
mod file;
mod memory;

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

pub use error::StoreError;
pub use file::FileStore;
pub use memory::MemoryStore;

/// A boxed future returned by store methods.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, StoreError>> + Send + 'a>>;

/// TTL-capable key-value persistence.
///
/// Values are JSON documents. Every `put` upserts and restarts the record's
/// TTL; expired records behave as absent.
pub trait SessionStore: Send + Sync {
    /// Upserts `value` under `key` with a fresh TTL.
    fn put<'a>(&'a self, key: &'a str, value: String, ttl: Duration) -> StoreFuture<'a, ()>;

    /// Returns the value for `key`, or `None` if absent or expired.
    fn get<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Option<String>>;

    /// Removes `key`. Returns `true` if a live value existed.
    fn delete<'a>(&'a self, key: &'a str) -> StoreFuture<'a, bool>;

    /// Lists keys starting with `prefix` without loading their values.
    ///
    /// The result may include records that expire before they are read.
    fn keys_with_prefix<'a>(&'a self, prefix: &'a str) -> StoreFuture<'a, Vec<String>>;
}
