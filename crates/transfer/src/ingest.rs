//! Chunk ingestion: validate, stream to scratch, commit, finalize.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use tokio::io::AsyncRead;
use tracing::{debug, warn};

use landfall_protocol::messages::{ChunkAck, ChunkRequest};
use landfall_protocol::{FileStatus, SessionStatus};

use crate::TransferError;
use crate::chunked::write_chunk;
use crate::context::UploadContext;
use crate::types::UploadSession;
use crate::validation::{is_well_formed_id, normalize_digest};

/// Applies chunk bodies to registered files.
///
/// Obtained from [`UploadSessionManager::ingestion`](crate::UploadSessionManager::ingestion)
/// and shares its state.
#[derive(Clone)]
pub struct ChunkIngestion {
    ctx: Arc<UploadContext>,
}

impl ChunkIngestion {
    pub(crate) fn new(ctx: Arc<UploadContext>) -> Self {
        Self { ctx }
    }

    /// Appends `body` to a file at `req.offset`.
    ///
    /// The offset must equal the file's received byte count. Bytes reach
    /// disk before the session record advances, so a failure at any point
    /// leaves the recorded state behind the disk, never ahead of it. When
    /// the last byte arrives the file is finalized at its destination.
    pub async fn apply_chunk<R>(
        &self,
        owner_id: &str,
        req: &ChunkRequest,
        body: &mut R,
    ) -> Result<ChunkAck, TransferError>
    where
        R: AsyncRead + Unpin + Send + ?Sized,
    {
        let ctx = &self.ctx;
        let session_id = req.session_id.as_str();
        let file_id = req.file_id.as_str();

        if !is_well_formed_id(file_id) {
            return Err(TransferError::FileNotFound(file_id.to_string()));
        }
        let expected_digest = req.digest.as_deref().map(normalize_digest).transpose()?;
        let end = req.offset.checked_add(req.length).ok_or_else(|| {
            TransferError::InvalidRequest(format!(
                "chunk at {} with length {} overflows",
                req.offset, req.length
            ))
        })?;

        // Ownership and request checks come before admission, so a caller
        // without access sees `Forbidden` rather than a busy slot.
        let session = ctx.load(owner_id, session_id).await?;
        self.check(&session, req, end)?;
        drop(session);

        let _permit = ctx.admission.try_acquire(owner_id, session_id, file_id)?;

        // Another request may have advanced the file before the permit.
        let session = ctx.load(owner_id, session_id).await?;
        let temp = self.check(&session, req, end)?;
        drop(session);

        // Stream the body to scratch storage.
        let mut handle = match ctx.scratch.open_at(&temp, req.offset).await {
            Ok(handle) => handle,
            Err(TransferError::InvalidState(reason)) => {
                let err = self
                    .reset_lost_file(owner_id, session_id, file_id, req.offset, &reason)
                    .await;
                return Err(err);
            }
            Err(e) => return Err(e),
        };
        let started = Instant::now();
        let written = write_chunk(
            &mut handle,
            body,
            req.length,
            ctx.config.buffer_size(),
            expected_digest.is_some(),
        )
        .await;
        drop(handle);

        let written = match written {
            Ok(w) => w,
            Err(e) => {
                self.discard_tail(&temp, req.offset).await;
                return Err(e);
            }
        };
        if let (Some(expected), Some(actual)) = (&expected_digest, &written.digest) {
            if expected != actual {
                self.discard_tail(&temp, req.offset).await;
                return Err(TransferError::IntegrityMismatch(format!(
                    "chunk at {}: expected {expected}, got {actual}",
                    req.offset
                )));
            }
        }
        let elapsed = started.elapsed();

        // Commit under the session lock.
        let guard = ctx.locks.lock(session_id).await;
        let Some(mut session) = ctx.try_load(owner_id, session_id).await? else {
            drop(guard);
            // Aborted or expired while streaming.
            if let Err(e) = ctx.scratch.remove_session(session_id).await {
                warn!(session_id, "failed to remove scratch after abort: {e}");
            }
            return Err(TransferError::SessionNotFound(session_id.to_string()));
        };
        let file = session.file_mut(file_id)?;
        if file.received_bytes != req.offset {
            return Err(TransferError::OffsetMismatch {
                expected: file.received_bytes,
                actual: req.offset,
            });
        }
        file.record_bytes(written.bytes_written, temp);
        if req.is_last && file.declared_size.is_none() {
            file.declared_size = Some(file.received_bytes);
        }
        let fully_received = file.is_fully_received();
        session.touch();

        // The fully received state is durable before anything moves, so a
        // failed save here means the chunk is simply resent.
        ctx.save(&session).await?;
        drop(guard);
        ctx.meters.record(session_id, written.bytes_written);

        let mut finalize_err = None;
        if fully_received {
            let finalized = ctx
                .finalize_files(owner_id, session_id, &[file_id.to_string()])
                .await?;
            finalize_err = finalized
                .failures
                .into_iter()
                .find(|(id, _)| id == file_id)
                .map(|(_, e)| e);
            session = finalized.session;
        }

        let file = session.file(file_id)?;
        let received_bytes = file.received_bytes;
        let completed = file.status == FileStatus::Completed;

        let throughput = if elapsed.is_zero() {
            0.0
        } else {
            written.bytes_written as f64 / elapsed.as_secs_f64()
        };

        debug!(
            session_id,
            file_id,
            offset = req.offset,
            bytes = written.bytes_written,
            received = received_bytes,
            completed,
            "chunk applied"
        );

        if let Some(e) = finalize_err {
            return Err(e);
        }
        Ok(ChunkAck {
            received_bytes,
            completed,
            session_status: session.status,
            throughput,
        })
    }

    /// Validates a chunk request against session state and returns the
    /// file's scratch path.
    fn check(
        &self,
        session: &UploadSession,
        req: &ChunkRequest,
        end: u64,
    ) -> Result<PathBuf, TransferError> {
        match session.status {
            SessionStatus::Active => {}
            SessionStatus::Paused => {
                return Err(TransferError::SessionPaused(session.id.clone()));
            }
            SessionStatus::Completed | SessionStatus::Aborted => {
                return Err(TransferError::InvalidState(format!(
                    "session {} is {}",
                    session.id, session.status
                )));
            }
        }
        let file = session.file(&req.file_id)?;
        if file.status == FileStatus::Completed {
            return Err(TransferError::FileAlreadyCompleted(req.file_id.clone()));
        }
        if req.offset != file.received_bytes {
            return Err(TransferError::OffsetMismatch {
                expected: file.received_bytes,
                actual: req.offset,
            });
        }
        match file.declared_size {
            Some(declared) if end > declared => {
                return Err(TransferError::SizeExceeded { declared, end });
            }
            Some(declared) if req.is_last && end != declared => {
                return Err(TransferError::InvalidRequest(format!(
                    "last chunk ends at {end}, file is {declared} bytes"
                )));
            }
            Some(_) => {}
            None => {
                if let Some(max) = self.ctx.config.max_file_size {
                    if end > max {
                        return Err(TransferError::SizeExceeded { declared: max, end });
                    }
                }
            }
        }
        Ok(self.ctx.temp_path(&session.id, file))
    }

    /// Cuts a scratch file back to its committed length after a failed
    /// write.
    async fn discard_tail(&self, temp: &std::path::Path, offset: u64) {
        if let Err(e) = self.ctx.scratch.truncate(temp, offset).await {
            // The next write truncates again before appending.
            warn!(path = %temp.display(), offset, "failed to discard partial chunk: {e}");
        }
    }

    /// Scratch bytes the record counts on are gone. The file restarts from
    /// zero and the caller is told where to resume.
    async fn reset_lost_file(
        &self,
        owner_id: &str,
        session_id: &str,
        file_id: &str,
        offset: u64,
        reason: &str,
    ) -> TransferError {
        warn!(session_id, file_id, "scratch storage lost: {reason}");
        let ctx = &self.ctx;
        let _guard = ctx.locks.lock(session_id).await;
        let result = async {
            let mut session = ctx.load(owner_id, session_id).await?;
            let file = session.file_mut(file_id)?;
            if file.received_bytes == offset {
                file.fail();
                if let Some(path) = file.temp_storage.take() {
                    ctx.scratch.remove_part(&path).await?;
                }
                session.touch();
                ctx.save(&session).await?;
            }
            Ok::<_, TransferError>(())
        }
        .await;
        match result {
            Ok(()) => TransferError::OffsetMismatch {
                expected: 0,
                actual: offset,
            },
            Err(e) => e,
        }
    }
}
