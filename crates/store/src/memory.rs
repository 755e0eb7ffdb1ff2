//! In-process session store.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

use crate::{SessionStore, StoreError, StoreFuture};

struct Entry {
    value: String,
    expires_at: Instant,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

/// [`SessionStore`] kept in a process-local map.
///
/// State is lost on restart. Use [`FileStore`](crate::FileStore) wherever
/// sessions must outlive the process.
#[derive(Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<String, Entry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live records.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.read()
            .map(|entries| entries.values().filter(|e| e.is_live(now)).count())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read(
        &self,
    ) -> Result<std::sync::RwLockReadGuard<'_, HashMap<String, Entry>>, StoreError> {
        self.entries
            .read()
            .map_err(|_| StoreError::Unavailable("memory store lock poisoned".into()))
    }

    fn write(
        &self,
    ) -> Result<std::sync::RwLockWriteGuard<'_, HashMap<String, Entry>>, StoreError> {
        self.entries
            .write()
            .map_err(|_| StoreError::Unavailable("memory store lock poisoned".into()))
    }

    fn put_sync(&self, key: &str, value: String, ttl: Duration) -> Result<(), StoreError> {
        if key.is_empty() {
            return Err(StoreError::InvalidKey("empty key".into()));
        }
        let now = Instant::now();
        let expires_at = now
            .checked_add(ttl)
            .unwrap_or(now + Duration::from_secs(u32::MAX as u64));
        self.write()?
            .insert(key.to_string(), Entry { value, expires_at });
        Ok(())
    }

    fn get_sync(&self, key: &str) -> Result<Option<String>, StoreError> {
        let now = Instant::now();
        {
            let entries = self.read()?;
            match entries.get(key) {
                Some(entry) if entry.is_live(now) => return Ok(Some(entry.value.clone())),
                Some(_) => {}
                None => return Ok(None),
            }
        }
        // Expired: drop it.
        self.write()?.remove(key);
        Ok(None)
    }

    fn delete_sync(&self, key: &str) -> Result<bool, StoreError> {
        let now = Instant::now();
        Ok(self
            .write()?
            .remove(key)
            .is_some_and(|entry| entry.is_live(now)))
    }

    fn keys_sync(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let now = Instant::now();
        Ok(self
            .read()?
            .iter()
            .filter(|(k, e)| k.starts_with(prefix) && e.is_live(now))
            .map(|(k, _)| k.clone())
            .collect())
    }
}

impl SessionStore for MemoryStore {
    fn put<'a>(&'a self, key: &'a str, value: String, ttl: Duration) -> StoreFuture<'a, ()> {
        Box::pin(async move { self.put_sync(key, value, ttl) })
    }

    fn get<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Option<String>> {
        Box::pin(async move { self.get_sync(key) })
    }

    fn delete<'a>(&'a self, key: &'a str) -> StoreFuture<'a, bool> {
        Box::pin(async move { self.delete_sync(key) })
    }

    fn keys_with_prefix<'a>(&'a self, prefix: &'a str) -> StoreFuture<'a, Vec<String>> {
        Box::pin(async move { self.keys_sync(prefix) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOUR: Duration = Duration::from_secs(3600);

    #[tokio::test]
    async fn put_get_delete() {
        let store = MemoryStore::new();
        store.put("a", "1".into(), HOUR).await.unwrap();
        assert_eq!(store.get("a").await.unwrap().as_deref(), Some("1"));
        assert_eq!(store.len(), 1);

        assert!(store.delete("a").await.unwrap());
        assert!(!store.delete("a").await.unwrap());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn expired_entries_are_absent() {
        let store = MemoryStore::new();
        store.put("a", "1".into(), Duration::ZERO).await.unwrap();
        assert!(store.get("a").await.unwrap().is_none());
        assert!(store.keys_with_prefix("").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn put_refreshes_ttl() {
        let store = MemoryStore::new();
        store.put("a", "1".into(), Duration::ZERO).await.unwrap();
        store.put("a", "2".into(), HOUR).await.unwrap();
        assert_eq!(store.get("a").await.unwrap().as_deref(), Some("2"));
    }

    #[tokio::test]
    async fn prefix_listing() {
        let store = MemoryStore::new();
        store.put("upload_session:u1:a", "1".into(), HOUR).await.unwrap();
        store.put("upload_session:u2:b", "1".into(), HOUR).await.unwrap();

        let keys = store.keys_with_prefix("upload_session:u1:").await.unwrap();
        assert_eq!(keys, vec!["upload_session:u1:a"]);
    }

    #[tokio::test]
    async fn empty_key_rejected() {
        let store = MemoryStore::new();
        let result = store.put("", "1".into(), HOUR).await;
        assert!(matches!(result, Err(StoreError::InvalidKey(_))));
    }
}
