//! Filesystem-backed session store.
//!
//! Each key maps to `<root>/<hex(key)>.json`. Writes go to a uniquely named
//! sibling temp file which is fsynced and renamed into place, so a crash
//! never leaves a torn record behind.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::{SessionStore, StoreError, StoreFuture};

const RECORD_SUFFIX: &str = ".json";

/// Longest key whose hex-encoded file name still fits in 255 bytes.
const MAX_KEY_LEN: usize = 120;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RecordOut<'a> {
    expires_at_ms: i64,
    value: &'a RawValue,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RecordIn {
    expires_at_ms: i64,
    value: Box<RawValue>,
}

impl RecordIn {
    fn is_expired(&self, now_ms: i64) -> bool {
        self.expires_at_ms <= now_ms
    }
}

/// Durable [`SessionStore`] storing one JSON file per key.
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    /// Opens (and creates if needed) a store rooted at `root`.
    pub async fn open(root: impl AsRef<Path>) -> Result<Self, StoreError> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).await?;
        debug!(root = %root.display(), "file store opened");
        Ok(Self { root })
    }

    /// Returns the directory holding the records.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn record_path(&self, key: &str) -> Result<PathBuf, StoreError> {
        if key.is_empty() {
            return Err(StoreError::InvalidKey("empty key".into()));
        }
        if key.len() > MAX_KEY_LEN {
            return Err(StoreError::InvalidKey(format!(
                "key longer than {MAX_KEY_LEN} bytes"
            )));
        }
        Ok(self
            .root
            .join(format!("{}{RECORD_SUFFIX}", hex::encode(key))))
    }

    async fn read_record(path: &Path) -> Result<Option<RecordIn>, StoreError> {
        match fs::read(path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn remove_quietly(path: &Path) -> Result<bool, StoreError> {
        match fs::remove_file(path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn put_inner(&self, key: &str, value: String, ttl: Duration) -> Result<(), StoreError> {
        let path = self.record_path(key)?;
        let raw = RawValue::from_string(value)?;
        let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
        let record = RecordOut {
            expires_at_ms: Utc::now().timestamp_millis().saturating_add(ttl_ms),
            value: &raw,
        };
        let data = serde_json::to_vec(&record)?;

        let temp_path = path.with_file_name(format!(
            "{}{RECORD_SUFFIX}.tmp.{}",
            hex::encode(key),
            uuid::Uuid::new_v4()
        ));
        let written = async {
            let mut file = fs::File::create(&temp_path).await?;
            file.write_all(&data).await?;
            file.sync_all().await?;
            fs::rename(&temp_path, &path).await
        }
        .await;

        if let Err(e) = written {
            let _ = fs::remove_file(&temp_path).await;
            return Err(e.into());
        }
        Ok(())
    }

    async fn get_inner(&self, key: &str) -> Result<Option<String>, StoreError> {
        let path = self.record_path(key)?;
        let Some(record) = Self::read_record(&path).await? else {
            return Ok(None);
        };
        if record.is_expired(Utc::now().timestamp_millis()) {
            debug!(key, "dropping expired record");
            Self::remove_quietly(&path).await?;
            return Ok(None);
        }
        Ok(Some(record.value.get().to_owned()))
    }

    async fn delete_inner(&self, key: &str) -> Result<bool, StoreError> {
        let path = self.record_path(key)?;
        let live = match Self::read_record(&path).await {
            Ok(Some(record)) => !record.is_expired(Utc::now().timestamp_millis()),
            Ok(None) => return Ok(false),
            Err(StoreError::Serialization(e)) => {
                warn!(key, "removing unreadable record: {e}");
                false
            }
            Err(e) => return Err(e),
        };
        let removed = Self::remove_quietly(&path).await?;
        Ok(live && removed)
    }

    async fn keys_inner(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let mut keys = Vec::new();
        let mut entries = fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(key) = name.to_str().and_then(decode_file_name) else {
                continue;
            };
            if key.starts_with(prefix) {
                keys.push(key);
            }
        }
        Ok(keys)
    }
}

/// Maps `<hex>.json` back to its key; temp files and strays yield `None`.
fn decode_file_name(name: &str) -> Option<String> {
    let stem = name.strip_suffix(RECORD_SUFFIX)?;
    let bytes = hex::decode(stem).ok()?;
    String::from_utf8(bytes).ok()
}

impl SessionStore for FileStore {
    fn put<'a>(&'a self, key: &'a str, value: String, ttl: Duration) -> StoreFuture<'a, ()> {
        Box::pin(self.put_inner(key, value, ttl))
    }

    fn get<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Option<String>> {
        Box::pin(self.get_inner(key))
    }

    fn delete<'a>(&'a self, key: &'a str) -> StoreFuture<'a, bool> {
        Box::pin(self.delete_inner(key))
    }

    fn keys_with_prefix<'a>(&'a self, prefix: &'a str) -> StoreFuture<'a, Vec<String>> {
        Box::pin(self.keys_inner(prefix))
    }
}
