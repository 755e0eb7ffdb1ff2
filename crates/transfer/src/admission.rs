//! Admission control for concurrent chunk writes.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::TransferError;

#[derive(Default)]
struct Slots {
    files: HashSet<(String, String)>,
    per_session: HashMap<String, usize>,
    per_owner: HashMap<String, usize>,
}

/// Tracks in-flight chunk writes and refuses new ones past the limits.
///
/// At most one write per `(session, file)`; at most `per_session` writes per
/// session and `per_owner` writes per owner. Refusals are immediate.
pub struct Admission {
    per_session: usize,
    per_owner: usize,
    slots: Arc<Mutex<Slots>>,
}

/// Proof of admission. Releases its slots when dropped.
pub struct UploadPermit {
    slots: Arc<Mutex<Slots>>,
    owner_id: String,
    session_id: String,
    file_id: String,
}

fn lock(slots: &Mutex<Slots>) -> MutexGuard<'_, Slots> {
    slots.lock().unwrap_or_else(|e| e.into_inner())
}

impl Admission {
    pub fn new(per_session: usize, per_owner: usize) -> Self {
        Self {
            per_session: per_session.max(1),
            per_owner: per_owner.max(1),
            slots: Arc::new(Mutex::new(Slots::default())),
        }
    }

    pub fn try_acquire(
        &self,
        owner_id: &str,
        session_id: &str,
        file_id: &str,
    ) -> Result<UploadPermit, TransferError> {
        let mut slots = lock(&self.slots);

        let file_key = (session_id.to_string(), file_id.to_string());
        if slots.files.contains(&file_key) {
            return Err(TransferError::ConflictInProgress(file_id.to_string()));
        }
        let in_session = slots.per_session.get(session_id).copied().unwrap_or(0);
        if in_session >= self.per_session {
            return Err(TransferError::TooManyConcurrentUploads(format!(
                "session {session_id} already has {in_session} uploads in flight"
            )));
        }
        let in_owner = slots.per_owner.get(owner_id).copied().unwrap_or(0);
        if in_owner >= self.per_owner {
            return Err(TransferError::TooManyConcurrentUploads(format!(
                "owner {owner_id} already has {in_owner} uploads in flight"
            )));
        }

        slots.files.insert(file_key);
        *slots.per_session.entry(session_id.to_string()).or_default() += 1;
        *slots.per_owner.entry(owner_id.to_string()).or_default() += 1;

        Ok(UploadPermit {
            slots: Arc::clone(&self.slots),
            owner_id: owner_id.to_string(),
            session_id: session_id.to_string(),
            file_id: file_id.to_string(),
        })
    }

    /// Writes currently in flight for `session_id`.
    pub fn in_flight(&self, session_id: &str) -> usize {
        lock(&self.slots)
            .per_session
            .get(session_id)
            .copied()
            .unwrap_or(0)
    }
}

fn release(counts: &mut HashMap<String, usize>, key: &str) {
    if let Some(n) = counts.get_mut(key) {
        *n -= 1;
        if *n == 0 {
            counts.remove(key);
        }
    }
}

impl Drop for UploadPermit {
    fn drop(&mut self) {
        let mut slots = lock(&self.slots);
        slots
            .files
            .remove(&(self.session_id.clone(), self.file_id.clone()));
        release(&mut slots.per_session, &self.session_id);
        release(&mut slots.per_owner, &self.owner_id);
    }
}
