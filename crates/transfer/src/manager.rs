//! Session lifecycle: create, register, pause, resume, abort, complete,
//! status and listing.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};

use landfall_protocol::SessionStatus;
use landfall_protocol::messages::{
    FileDescriptor, RegisteredFile, SessionDescriptor, SessionSummary, StatusReport,
    StatusResponse,
};
use landfall_store::SessionStore;

use crate::config::DuplicatePathPolicy;
use crate::context::{SessionGuard, UploadContext};
use crate::ingest::ChunkIngestion;
use crate::types::{FileUploadState, UploadSession, owner_prefix, parse_session_key};
use crate::validation::{
    normalize_digest, normalize_relative_path, normalize_target_path, resolve_within_root_async,
    validate_owner_id,
};
use crate::{TransferError, UploadConfig};

/// Owns every session's lifecycle and the limits around it.
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct UploadSessionManager {
    ctx: Arc<UploadContext>,
}

impl UploadSessionManager {
    pub fn new(store: Arc<dyn SessionStore>, config: UploadConfig) -> Self {
        Self {
            ctx: Arc::new(UploadContext::new(store, config)),
        }
    }

    pub fn config(&self) -> &UploadConfig {
        &self.ctx.config
    }

    /// The chunk ingestion pipeline bound to this manager's state.
    pub fn ingestion(&self) -> ChunkIngestion {
        ChunkIngestion::new(Arc::clone(&self.ctx))
    }

    pub(crate) fn context(&self) -> &Arc<UploadContext> {
        &self.ctx
    }

    /// Opens a session for `owner_id` targeting `target_path` under the
    /// owner's storage root.
    pub async fn create_session(
        &self,
        owner_id: &str,
        target_path: &str,
    ) -> Result<SessionDescriptor, TransferError> {
        validate_owner_id(owner_id)?;
        let target = normalize_target_path(target_path)?;
        resolve_within_root_async(self.ctx.owner_root(owner_id), target.clone()).await?;

        // Serialize creations per owner so the quota check is exact.
        let _guard = self.ctx.locks.lock(&owner_prefix(owner_id)).await;

        let live = self.count_live_sessions(owner_id).await?;
        if live >= self.ctx.config.max_sessions_per_owner {
            return Err(TransferError::QuotaExceeded(format!(
                "owner {owner_id} already has {live} open sessions"
            )));
        }

        let session = UploadSession::new(owner_id.to_string(), target);
        self.ctx.save(&session).await?;
        info!(
            session_id = %session.id,
            owner = owner_id,
            target = %session.target_path,
            "upload session created"
        );
        Ok(session.descriptor())
    }

    async fn count_live_sessions(&self, owner_id: &str) -> Result<usize, TransferError> {
        let mut live = 0;
        for session in self.load_owner_sessions(owner_id).await? {
            if session.is_live() {
                live += 1;
            }
        }
        Ok(live)
    }

    async fn load_owner_sessions(
        &self,
        owner_id: &str,
    ) -> Result<Vec<UploadSession>, TransferError> {
        let keys = self.ctx.store.keys_with_prefix(&owner_prefix(owner_id)).await?;
        let mut sessions = Vec::with_capacity(keys.len());
        for key in keys {
            let Some((_, session_id)) = parse_session_key(&key) else {
                continue;
            };
            // Records may expire between listing and loading.
            if let Some(session) = self.ctx.try_load(owner_id, session_id).await? {
                sessions.push(session);
            }
        }
        Ok(sessions)
    }

    /// Adds files to an active session.
    ///
    /// All descriptors are validated before anything is stored; one bad
    /// descriptor rejects the whole batch.
    pub async fn register_files(
        &self,
        owner_id: &str,
        session_id: &str,
        files: Vec<FileDescriptor>,
    ) -> Result<Vec<RegisteredFile>, TransferError> {
        let config = &self.ctx.config;
        let mut prepared = Vec::with_capacity(files.len());
        for descriptor in files {
            let relative_path = normalize_relative_path(&descriptor.relative_path)?;
            if let (Some(size), Some(max)) = (descriptor.size, config.max_file_size) {
                if size > max {
                    return Err(TransferError::QuotaExceeded(format!(
                        "{relative_path} is {size} bytes, limit is {max}"
                    )));
                }
            }
            let checksum = descriptor
                .checksum
                .as_deref()
                .map(normalize_digest)
                .transpose()?;
            prepared.push(FileUploadState::new(relative_path, descriptor.size, checksum));
        }

        let _guard = self.ctx.locks.lock(session_id).await;
        let mut session = self.ctx.load(owner_id, session_id).await?;
        if session.status != SessionStatus::Active {
            return Err(TransferError::InvalidState(format!(
                "session {session_id} is {}, files can only be added while active",
                session.status
            )));
        }

        let total = session.files.len() + prepared.len();
        if total > config.max_files_per_session {
            return Err(TransferError::QuotaExceeded(format!(
                "session {session_id} would hold {total} files, limit is {}",
                config.max_files_per_session
            )));
        }

        if config.duplicate_paths == DuplicatePathPolicy::Reject {
            let mut seen: HashSet<&str> = session
                .files
                .values()
                .map(|f| f.relative_path.as_str())
                .collect();
            for file in &prepared {
                if !seen.insert(file.relative_path.as_str()) {
                    return Err(TransferError::DuplicatePath(file.relative_path.clone()));
                }
            }
        }

        let registered: Vec<RegisteredFile> = prepared
            .iter()
            .map(|f| RegisteredFile {
                file_id: f.file_id.clone(),
                relative_path: f.relative_path.clone(),
            })
            .collect();
        for file in prepared {
            session.files.insert(file.file_id.clone(), file);
        }
        session.touch();
        self.ctx.save(&session).await?;

        info!(
            session_id,
            owner = owner_id,
            count = registered.len(),
            total = session.files.len(),
            "files registered"
        );
        Ok(registered)
    }

    pub async fn pause(
        &self,
        owner_id: &str,
        session_id: &str,
    ) -> Result<StatusResponse, TransferError> {
        self.change_status(owner_id, session_id, SessionStatus::Paused)
            .await
    }

    pub async fn resume(
        &self,
        owner_id: &str,
        session_id: &str,
    ) -> Result<StatusResponse, TransferError> {
        self.change_status(owner_id, session_id, SessionStatus::Active)
            .await
    }

    async fn change_status(
        &self,
        owner_id: &str,
        session_id: &str,
        to: SessionStatus,
    ) -> Result<StatusResponse, TransferError> {
        let _guard = self.ctx.locks.lock(session_id).await;
        let mut session = self.ctx.load(owner_id, session_id).await?;
        if session.status == to {
            return Ok(status_response(&session));
        }
        session.transition(to)?;
        self.ctx.save(&session).await?;
        info!(session_id, owner = owner_id, status = %to, "session status changed");
        Ok(status_response(&session))
    }

    /// Aborts a session and releases its scratch storage.
    ///
    /// Idempotent: a session that is already gone reports `aborted`, and a
    /// completed session is left untouched.
    pub async fn abort(
        &self,
        owner_id: &str,
        session_id: &str,
    ) -> Result<StatusResponse, TransferError> {
        let guard = self.ctx.locks.lock(session_id).await;
        let Some(mut session) = self.ctx.try_load(owner_id, session_id).await? else {
            drop(guard);
            return match self.ctx.miss(owner_id, session_id).await {
                TransferError::SessionNotFound(_) => {
                    // Scratch left by an earlier abort whose removal failed.
                    self.ctx.scratch.remove_session(session_id).await?;
                    Ok(StatusResponse {
                        session_id: session_id.to_string(),
                        status: SessionStatus::Aborted,
                    })
                }
                other => Err(other),
            };
        };
        if session.status == SessionStatus::Completed {
            return Ok(status_response(&session));
        }

        session.transition(SessionStatus::Aborted)?;
        self.ctx.release(&session, guard).await?;
        info!(session_id, owner = owner_id, "session aborted");
        Ok(status_response(&session))
    }

    /// Marks a session completed once every registered file is.
    pub async fn complete(
        &self,
        owner_id: &str,
        session_id: &str,
    ) -> Result<StatusResponse, TransferError> {
        let _guard = self.ctx.locks.lock(session_id).await;
        let mut session = self.ctx.load(owner_id, session_id).await?;
        if session.status == SessionStatus::Completed {
            return Ok(status_response(&session));
        }
        if !session.all_files_completed() {
            let pending = session
                .files
                .values()
                .filter(|f| f.status != landfall_protocol::FileStatus::Completed)
                .count();
            return Err(TransferError::InvalidState(format!(
                "session {session_id} has {pending} unfinished files"
            )));
        }
        session.transition(SessionStatus::Completed)?;
        if let Err(e) = self.ctx.scratch.remove_session(&session.id).await {
            warn!(session_id, "failed to remove scratch directory: {e}");
        }
        self.ctx.save(&session).await?;
        info!(session_id, owner = owner_id, "session completed");
        Ok(status_response(&session))
    }

    /// Snapshot of a session with per-file progress.
    ///
    /// Files whose bytes are all in but whose finalize failed earlier are
    /// retried first; a retry failure is logged and the snapshot still
    /// returned.
    pub async fn get_status(
        &self,
        owner_id: &str,
        session_id: &str,
    ) -> Result<StatusReport, TransferError> {
        let mut session = self.ctx.load(owner_id, session_id).await?;

        let waiting: Vec<String> = session
            .files
            .values()
            .filter(|f| f.awaits_finalize())
            .map(|f| f.file_id.clone())
            .collect();
        if !waiting.is_empty() {
            // Files a chunk request is busy with are left to that request.
            let mut permits = Vec::with_capacity(waiting.len());
            let mut retry = Vec::with_capacity(waiting.len());
            for file_id in waiting {
                match self.ctx.admission.try_acquire(owner_id, session_id, &file_id) {
                    Ok(permit) => {
                        permits.push(permit);
                        retry.push(file_id);
                    }
                    Err(e) => debug!(session_id, file_id = %file_id, "finalize retry skipped: {e}"),
                }
            }
            if !retry.is_empty() {
                let finalized = self.ctx.finalize_files(owner_id, session_id, &retry).await?;
                if !finalized.failures.is_empty() {
                    debug!(
                        session_id,
                        failed = finalized.failures.len(),
                        "finalize retry incomplete"
                    );
                }
                session = finalized.session;
            }
            drop(permits);
        }

        let mut files: Vec<_> = session.files.values().map(|f| f.progress()).collect();
        files.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));

        let received_bytes = session.received_bytes();
        let total_bytes = session.total_bytes();
        let eta_secs = total_bytes
            .and_then(|total| {
                self.ctx
                    .meters
                    .eta(&session.id, total.saturating_sub(received_bytes))
            })
            .map(|eta| eta.as_secs_f64());

        debug!(session_id, owner = owner_id, "status read");
        Ok(StatusReport {
            session_id: session.id.clone(),
            status: session.status,
            target_path: session.target_path.clone(),
            received_bytes,
            total_bytes,
            aggregate_throughput: self.ctx.meters.rate(&session.id),
            eta_secs,
            created_at: session.created_at,
            last_activity: session.last_activity,
            files,
        })
    }

    /// Summaries of every session `owner_id` holds, most recent first.
    pub async fn list_sessions(&self, owner_id: &str) -> Result<Vec<SessionSummary>, TransferError> {
        validate_owner_id(owner_id)?;
        let mut sessions: Vec<_> = self
            .load_owner_sessions(owner_id)
            .await?
            .iter()
            .map(UploadSession::summary)
            .collect();
        sessions.sort_by(|a, b| b.last_activity.cmp(&a.last_activity));
        Ok(sessions)
    }

    /// Tears down an idle session found by the sweep, through the same
    /// path as [`abort`](Self::abort). `guard` is the session lock the
    /// sweep took.
    pub(crate) async fn expire(
        &self,
        mut session: UploadSession,
        guard: SessionGuard<'_>,
    ) -> Result<(), TransferError> {
        let idle = Utc::now().signed_duration_since(session.last_activity);
        if session.is_live() {
            session.transition(SessionStatus::Aborted)?;
        }
        self.ctx.release(&session, guard).await?;
        info!(
            session_id = %session.id,
            owner = %session.owner_id,
            idle_secs = idle.num_seconds(),
            "session expired"
        );
        Ok(())
    }
}

fn status_response(session: &UploadSession) -> StatusResponse {
    StatusResponse {
        session_id: session.id.clone(),
        status: session.status,
    }
}
