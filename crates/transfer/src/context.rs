//! State shared by the session manager, the ingestion pipeline and the
//! cleanup service.

use std::borrow::Cow;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info, warn};

use landfall_protocol::SessionStatus;
use landfall_store::SessionStore;

use crate::admission::Admission;
use crate::chunked::{self, ScratchSpace};
use crate::progress::ThroughputMeters;
use crate::types::{FileUploadState, UploadSession, owner_index_key, session_key};
use crate::validation::{is_well_formed_id, resolve_within_root_async, validate_owner_id};
use crate::{TransferError, UploadConfig};

// ---------------------------------------------------------------------------
// SessionLocks
// ---------------------------------------------------------------------------

type LockMap = HashMap<String, Arc<tokio::sync::Mutex<()>>>;

/// Per-session locks serializing read-modify-write of a session record.
///
/// Held only around a load, a small mutation and a store write, never
/// while a chunk body is streamed or a file is hashed or moved. An entry
/// lives only while someone holds or waits for it.
#[derive(Default)]
pub(crate) struct SessionLocks {
    locks: Mutex<LockMap>,
}

/// A held session lock. Dropping it removes the map entry when nobody
/// else is holding or waiting.
pub(crate) struct SessionGuard<'a> {
    locks: &'a SessionLocks,
    key: String,
    held: Option<OwnedMutexGuard<()>>,
}

impl SessionLocks {
    fn map(&self) -> MutexGuard<'_, LockMap> {
        self.locks.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn entry(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        Arc::clone(self.map().entry(key.to_string()).or_default())
    }

    fn unheld(&self, key: &str) -> SessionGuard<'_> {
        SessionGuard {
            locks: self,
            key: key.to_string(),
            held: None,
        }
    }

    pub(crate) async fn lock(&self, key: &str) -> SessionGuard<'_> {
        // Created before waiting so a cancelled wait still cleans up.
        let mut guard = self.unheld(key);
        let mutex = self.entry(key);
        guard.held = Some(mutex.lock_owned().await);
        guard
    }

    /// Takes the lock only if nobody holds it.
    pub(crate) fn try_lock(&self, key: &str) -> Option<SessionGuard<'_>> {
        let mut guard = self.unheld(key);
        guard.held = Some(self.entry(key).try_lock_owned().ok()?);
        Some(guard)
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.map().len()
    }
}

impl Drop for SessionGuard<'_> {
    fn drop(&mut self) {
        drop(self.held.take());
        let mut map = self.locks.map();
        // Waiters hold their own clone of the Arc.
        if map
            .get(&self.key)
            .is_some_and(|mutex| Arc::strong_count(mutex) == 1)
        {
            map.remove(&self.key);
        }
    }
}

// ---------------------------------------------------------------------------
// UploadContext
// ---------------------------------------------------------------------------

/// Everything the upload components share. Owned by the manager and
/// handed to the other components by `Arc`.
pub(crate) struct UploadContext {
    pub store: Arc<dyn SessionStore>,
    pub config: UploadConfig,
    pub scratch: ScratchSpace,
    pub admission: Admission,
    pub locks: SessionLocks,
    pub meters: ThroughputMeters,
}

/// Session state after a finalize pass, with the files that did not make
/// it.
pub(crate) struct Finalized {
    pub session: UploadSession,
    pub failures: Vec<(String, TransferError)>,
}

/// What happened to one file on the file system.
enum Placed {
    Moved(PathBuf),
    /// Moved by an earlier attempt whose record update was lost.
    AlreadyThere,
    /// Whole-file checksum did not match.
    Corrupt(String),
}

impl UploadContext {
    pub(crate) fn new(store: Arc<dyn SessionStore>, config: UploadConfig) -> Self {
        Self {
            scratch: ScratchSpace::new(config.scratch_root.clone()),
            admission: Admission::new(config.max_uploads_per_session, config.max_uploads_per_owner),
            locks: SessionLocks::default(),
            meters: ThroughputMeters::new(config.throughput_window()),
            store,
            config,
        }
    }

    /// Storage root of one owner.
    pub(crate) fn owner_root(&self, owner_id: &str) -> PathBuf {
        self.config.storage_root.join(owner_id)
    }

    /// Scratch file of `file`, whether or not it has been written yet.
    pub(crate) fn temp_path(&self, session_id: &str, file: &FileUploadState) -> PathBuf {
        file.temp_storage
            .clone()
            .unwrap_or_else(|| self.scratch.part_path(session_id, &file.file_id))
    }

    /// Loads a session owned by `owner_id`.
    pub(crate) async fn load(
        &self,
        owner_id: &str,
        session_id: &str,
    ) -> Result<UploadSession, TransferError> {
        match self.try_load(owner_id, session_id).await? {
            Some(session) => Ok(session),
            None => Err(self.miss(owner_id, session_id).await),
        }
    }

    /// Like [`load`](Self::load), but a missing record is `None`.
    pub(crate) async fn try_load(
        &self,
        owner_id: &str,
        session_id: &str,
    ) -> Result<Option<UploadSession>, TransferError> {
        validate_owner_id(owner_id)?;
        if !is_well_formed_id(session_id) {
            return Err(TransferError::SessionNotFound(session_id.to_string()));
        }
        let key = session_key(owner_id, session_id);
        let Some(raw) = self.store.get(&key).await? else {
            return Ok(None);
        };
        let session: UploadSession = serde_json::from_str(&raw)?;
        Ok(Some(session))
    }

    /// Error for a session id missing under `owner_id`: `Forbidden` when
    /// the owner index names someone else. One store read.
    pub(crate) async fn miss(&self, owner_id: &str, session_id: &str) -> TransferError {
        let raw = match self.store.get(&owner_index_key(session_id)).await {
            Ok(raw) => raw,
            Err(e) => return e.into(),
        };
        match raw.as_deref().map(serde_json::from_str::<String>) {
            Some(Ok(owner)) if owner != owner_id => {
                TransferError::Forbidden(format!("session {session_id} belongs to another owner"))
            }
            Some(Err(e)) => {
                warn!(session_id, "unreadable owner index entry: {e}");
                TransferError::SessionNotFound(session_id.to_string())
            }
            _ => TransferError::SessionNotFound(session_id.to_string()),
        }
    }

    /// Persists a session and refreshes its record TTL.
    ///
    /// The owner index entry is written ahead of the record, once per
    /// session TTL, so it outlives any session the sweep has not expired.
    pub(crate) async fn save(&self, session: &UploadSession) -> Result<(), TransferError> {
        let ttl = self.config.record_ttl();
        let now = Utc::now();
        let mut record = Cow::Borrowed(session);

        if self.index_is_stale(session.owner_indexed_at, now) {
            let owner = serde_json::to_string(&session.owner_id)?;
            self.store
                .put(&owner_index_key(&session.id), owner, ttl)
                .await?;
            record.to_mut().owner_indexed_at = Some(now);
        }

        let value = serde_json::to_string(&*record)?;
        self.store.put(&session.key(), value, ttl).await?;
        Ok(())
    }

    fn index_is_stale(&self, indexed_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
        let Some(at) = indexed_at else {
            return true;
        };
        match chrono::Duration::from_std(self.config.session_ttl()) {
            Ok(ttl) => now.signed_duration_since(at) >= ttl,
            Err(_) => false,
        }
    }

    /// Tears down a session. The single path for abort and expiry.
    ///
    /// Record, owner index entry and meter go while the caller's `guard`
    /// is still held; scratch storage goes after it is released. A failed
    /// record delete leaves everything for a retry, a failed scratch
    /// removal leaves an orphan for the sweep.
    pub(crate) async fn release(
        &self,
        session: &UploadSession,
        guard: SessionGuard<'_>,
    ) -> Result<(), TransferError> {
        self.store.delete(&session.key()).await?;
        if let Err(e) = self.store.delete(&owner_index_key(&session.id)).await {
            warn!(session_id = %session.id, "failed to delete owner index entry: {e}");
        }
        self.meters.remove(&session.id);
        drop(guard);

        self.scratch.remove_session(&session.id).await?;
        Ok(())
    }

    /// Finalizes fully received files of a session, then completes the
    /// session if nothing is left.
    ///
    /// The caller holds the upload permit of every file in `file_ids`.
    /// Hashing and moving run without the session lock; the lock is taken
    /// only to record the outcomes. A failed save leaves the record saying
    /// "fully received", which the next pass resolves.
    pub(crate) async fn finalize_files(
        &self,
        owner_id: &str,
        session_id: &str,
        file_ids: &[String],
    ) -> Result<Finalized, TransferError> {
        let snapshot = self.load(owner_id, session_id).await?;
        let mut outcomes = Vec::with_capacity(file_ids.len());
        for file_id in file_ids {
            let Ok(file) = snapshot.file(file_id) else {
                continue;
            };
            if !file.awaits_finalize() {
                continue;
            }
            let received = file.received_bytes;
            let outcome = self.place(&snapshot, file).await;
            outcomes.push((file_id.clone(), received, outcome));
        }

        let guard = self.locks.lock(session_id).await;
        let Some(mut session) = self.try_load(owner_id, session_id).await? else {
            return Err(TransferError::SessionNotFound(session_id.to_string()));
        };

        let mut failures = Vec::new();
        let mut discard = Vec::new();
        for (file_id, received, outcome) in outcomes {
            let temp = match session.file(&file_id) {
                Ok(file) if file.awaits_finalize() && file.received_bytes == received => {
                    self.temp_path(session_id, file)
                }
                _ => {
                    debug!(session_id, file_id = %file_id, "file changed during finalize");
                    continue;
                }
            };
            let file = session.file_mut(&file_id)?;
            match outcome {
                Ok(Placed::Moved(dest)) => {
                    file.complete();
                    info!(
                        session_id,
                        file_id = %file_id,
                        bytes = received,
                        dest = %dest.display(),
                        "file finalized"
                    );
                }
                Ok(Placed::AlreadyThere) => {
                    file.complete();
                    debug!(session_id, file_id = %file_id, "file already at destination");
                }
                Ok(Placed::Corrupt(reason)) => {
                    warn!(session_id, file_id = %file_id, "whole-file checksum mismatch");
                    file.fail();
                    discard.push(temp);
                    failures.push((file_id, TransferError::IntegrityMismatch(reason)));
                }
                Err(e) => {
                    warn!(session_id, file_id = %file_id, "finalize failed: {e}");
                    failures.push((file_id, e));
                    continue;
                }
            }
            session.touch();
        }

        let mut completed = false;
        if session.status != SessionStatus::Completed && session.all_files_completed() {
            match session.transition(SessionStatus::Completed) {
                Ok(()) => completed = true,
                Err(e) => warn!(session_id, "cannot complete session: {e}"),
            }
        }

        self.save(&session).await?;
        drop(guard);

        for path in discard {
            if let Err(e) = self.scratch.remove_part(&path).await {
                // Restarting at offset 0 truncates it anyway.
                warn!(path = %path.display(), "failed to discard corrupt scratch file: {e}");
            }
        }
        if completed {
            if let Err(e) = self.scratch.remove_session(session_id).await {
                warn!(session_id, "failed to remove scratch directory: {e}");
            }
            info!(session_id, owner = owner_id, "session completed");
        }

        Ok(Finalized { session, failures })
    }

    /// Verifies one fully received file and moves it to its destination.
    /// Touches the file system only.
    async fn place(
        &self,
        session: &UploadSession,
        file: &FileUploadState,
    ) -> Result<Placed, TransferError> {
        let temp = self.temp_path(&session.id, file);
        let relative = if session.target_path.is_empty() {
            file.relative_path.clone()
        } else {
            format!("{}/{}", session.target_path, file.relative_path)
        };
        let received = file.received_bytes;

        let dest = resolve_within_root_async(self.owner_root(&session.owner_id), relative)
            .await
            .map_err(|e| TransferError::FinalizeFailed(e.to_string()))?;

        if !tokio::fs::try_exists(&temp).await.unwrap_or(false) {
            if received == 0 {
                // A zero-byte file may never have had a scratch file.
                self.scratch
                    .open_at(&temp, 0)
                    .await
                    .map_err(|e| TransferError::FinalizeFailed(e.to_string()))?;
            } else if already_in_place(&dest, received).await {
                return Ok(Placed::AlreadyThere);
            } else {
                return Err(TransferError::FinalizeFailed(format!(
                    "scratch file {} is missing",
                    temp.display()
                )));
            }
        }

        if let Some(expected) = &file.checksum {
            let actual = chunked::file_checksum(temp.clone())
                .await
                .map_err(|e| TransferError::FinalizeFailed(e.to_string()))?;
            if &actual != expected {
                return Ok(Placed::Corrupt(format!(
                    "file {}: expected {expected}, got {actual}",
                    file.file_id
                )));
            }
        }

        chunked::move_into_place(&temp, &dest, self.config.overwrite_existing).await?;
        Ok(Placed::Moved(dest))
    }
}

async fn already_in_place(dest: &Path, len: u64) -> bool {
    matches!(tokio::fs::metadata(dest).await, Ok(meta) if meta.is_file() && meta.len() == len)
}
