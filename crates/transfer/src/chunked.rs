use std::io::{ErrorKind, Read};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, warn};

use crate::TransferError;

/// Extension of scratch files holding partially received content.
const PART_SUFFIX: &str = "part";

// ---------------------------------------------------------------------------
// Checksum helpers
// ---------------------------------------------------------------------------

/// Computes SHA-256 of `data` and returns the hex-encoded digest.
pub fn checksum_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Computes SHA-256 of an entire file and returns the hex-encoded digest.
///
/// Blocking; run it under `spawn_blocking` from async code.
pub fn calculate_file_checksum(path: &Path) -> Result<String, TransferError> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

pub(crate) async fn file_checksum(path: PathBuf) -> Result<String, TransferError> {
    tokio::task::spawn_blocking(move || calculate_file_checksum(&path))
        .await
        .map_err(|e| TransferError::Io(std::io::Error::other(format!("checksum task failed: {e}"))))?
}

// ---------------------------------------------------------------------------
// ScratchSpace
// ---------------------------------------------------------------------------

/// Temporary storage for partially received files.
///
/// Layout: `<root>/<session_id>/<file_id>.part`. A session's directory is
/// owned by that session alone and removed as a unit.
#[derive(Debug, Clone)]
pub struct ScratchSpace {
    root: PathBuf,
}

/// A scratch directory found on disk.
#[derive(Debug, Clone)]
pub struct ScratchDir {
    pub session_id: String,
    pub path: PathBuf,
    pub modified: SystemTime,
}

impl ScratchSpace {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn session_dir(&self, session_id: &str) -> PathBuf {
        self.root.join(session_id)
    }

    pub fn part_path(&self, session_id: &str, file_id: &str) -> PathBuf {
        self.session_dir(session_id)
            .join(format!("{file_id}.{PART_SUFFIX}"))
    }

    /// Current on-disk length of a scratch file (0 if missing).
    pub async fn len(&self, path: &Path) -> Result<u64, TransferError> {
        match fs::metadata(path).await {
            Ok(meta) => Ok(meta.len()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    /// Opens a scratch file for appending at `offset`.
    ///
    /// Bytes past `offset` are left over from a write whose commit never
    /// happened; they are cut off so the next write replaces them.
    pub async fn open_at(&self, path: &Path, offset: u64) -> Result<fs::File, TransferError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let mut file = fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(path)
            .await?;

        let len = file.metadata().await?.len();
        if len < offset {
            return Err(TransferError::InvalidState(format!(
                "scratch file {} holds {len} bytes, expected {offset}",
                path.display()
            )));
        }
        if len > offset {
            debug!(path = %path.display(), len, offset, "discarding uncommitted scratch bytes");
            file.set_len(offset).await?;
        }
        file.seek(std::io::SeekFrom::Start(offset)).await?;
        Ok(file)
    }

    /// Shrinks a scratch file back to `len` bytes.
    pub async fn truncate(&self, path: &Path, len: u64) -> Result<(), TransferError> {
        match fs::OpenOptions::new().write(true).open(path).await {
            Ok(file) => {
                file.set_len(len).await?;
                file.sync_all().await?;
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound && len == 0 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Deletes one scratch file. Missing files are fine.
    pub async fn remove_part(&self, path: &Path) -> Result<(), TransferError> {
        match fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Deletes a session's scratch directory. Returns `true` if it existed.
    pub async fn remove_session(&self, session_id: &str) -> Result<bool, TransferError> {
        match fs::remove_dir_all(self.session_dir(session_id)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Lists session directories currently present under the root.
    pub async fn session_dirs(&self) -> Result<Vec<ScratchDir>, TransferError> {
        let mut dirs = Vec::new();
        let mut entries = match fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(dirs),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let file_type = entry.file_type().await?;
            if !file_type.is_dir() {
                continue;
            }
            let Some(session_id) = entry.file_name().to_str().map(str::to_owned) else {
                continue;
            };
            let modified = entry
                .metadata()
                .await?
                .modified()
                .unwrap_or(SystemTime::UNIX_EPOCH);
            dirs.push(ScratchDir {
                session_id,
                path: entry.path(),
                modified,
            });
        }
        Ok(dirs)
    }
}

/// Outcome of streaming one chunk body to disk.
#[derive(Debug)]
pub struct ChunkWrite {
    pub bytes_written: u64,
    /// Hex SHA-256 of the body, when hashing was requested.
    pub digest: Option<String>,
}

/// Streams exactly `declared_len` bytes from `body` into `file`.
///
/// Memory use is bounded by `buf_size` regardless of chunk size. A body
/// that ends early or runs past `declared_len` is a
/// [`TransferError::ChunkLengthMismatch`]; the caller is responsible for
/// truncating the partial write.
pub async fn write_chunk<R>(
    file: &mut fs::File,
    body: &mut R,
    declared_len: u64,
    buf_size: usize,
    hash: bool,
) -> Result<ChunkWrite, TransferError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut hasher = hash.then(Sha256::new);
    let mut buf = vec![0u8; buf_size.max(1)];
    let mut remaining = declared_len;
    let mut written: u64 = 0;

    while remaining > 0 {
        let to_read = usize::try_from(remaining).unwrap_or(usize::MAX).min(buf.len());
        let n = body.read(&mut buf[..to_read]).await?;
        if n == 0 {
            return Err(TransferError::ChunkLengthMismatch {
                declared: declared_len,
                received: written,
            });
        }
        file.write_all(&buf[..n]).await?;
        if let Some(h) = hasher.as_mut() {
            h.update(&buf[..n]);
        }
        remaining -= n as u64;
        written += n as u64;
    }

    // The body must end exactly at the declared length.
    let extra = body.read(&mut buf[..1]).await?;
    if extra > 0 {
        return Err(TransferError::ChunkLengthMismatch {
            declared: declared_len,
            received: written + extra as u64,
        });
    }

    file.flush().await?;
    file.sync_data().await?;

    Ok(ChunkWrite {
        bytes_written: written,
        digest: hasher.map(|h| hex::encode(h.finalize())),
    })
}

/// Moves a finished scratch file to `dest`, creating parent directories.
///
/// Uses an atomic rename. When scratch and destination live on different
/// filesystems the file is copied next to `dest`, verified (size and
/// SHA-256), renamed into place, and only then removed from scratch.
pub async fn move_into_place(
    src: &Path,
    dest: &Path,
    overwrite: bool,
) -> Result<(), TransferError> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)
            .await
            .map_err(|e| TransferError::FinalizeFailed(format!("create {}: {e}", parent.display())))?;
    }

    if !overwrite && fs::try_exists(dest).await.unwrap_or(false) {
        return Err(TransferError::FinalizeFailed(format!(
            "destination already exists: {}",
            dest.display()
        )));
    }

    match fs::rename(src, dest).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::CrossesDevices => {
            debug!(src = %src.display(), dest = %dest.display(), "cross-device finalize, copying");
            copy_verify_delete(src, dest).await
        }
        Err(e) => Err(TransferError::FinalizeFailed(format!(
            "rename {} -> {}: {e}",
            src.display(),
            dest.display()
        ))),
    }
}

async fn copy_verify_delete(src: &Path, dest: &Path) -> Result<(), TransferError> {
    let file_name = dest
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("upload");
    let staging = dest.with_file_name(format!(".{file_name}.{}.landfall", uuid::Uuid::new_v4()));

    let result = async {
        let copied = fs::copy(src, &staging).await?;
        let expected = fs::metadata(src).await?.len();
        if copied != expected {
            return Err(TransferError::FinalizeFailed(format!(
                "copied {copied} of {expected} bytes"
            )));
        }
        let (src_sum, dest_sum) = tokio::try_join!(
            file_checksum(src.to_path_buf()),
            file_checksum(staging.clone())
        )?;
        if src_sum != dest_sum {
            return Err(TransferError::FinalizeFailed(
                "copy does not match scratch file".into(),
            ));
        }
        fs::rename(&staging, dest).await?;
        Ok(())
    }
    .await;

    match result {
        Ok(()) => {
            if let Err(e) = fs::remove_file(src).await {
                warn!(src = %src.display(), "failed to remove scratch file after copy: {e}");
            }
            Ok(())
        }
        Err(e) => {
            let _ = fs::remove_file(&staging).await;
            Err(match e {
                TransferError::Io(io) => TransferError::FinalizeFailed(io.to_string()),
                other => other,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn checksum_bytes_deterministic() {
        let c1 = checksum_bytes(b"hello world");
        let c2 = checksum_bytes(b"hello world");
        assert_eq!(c1, c2);
        assert_eq!(c1.len(), 64); // SHA-256 = 64 hex chars.
    }

    #[test]
    fn checksum_bytes_different_data() {
        assert_ne!(checksum_bytes(b"hello"), checksum_bytes(b"world"));
    }

    #[test]
    fn calculate_file_checksum_matches_bytes() {
        let dir = TempDir::new().unwrap();
        let data = b"test content for checksum";
        let path = dir.path().join("test.bin");
        std::fs::write(&path, data).unwrap();

        assert_eq!(calculate_file_checksum(&path).unwrap(), checksum_bytes(data));
    }

    #[test]
    fn layout() {
        let scratch = ScratchSpace::new("/scratch");
        assert_eq!(scratch.session_dir("s1"), PathBuf::from("/scratch/s1"));
        assert_eq!(
            scratch.part_path("s1", "f1"),
            PathBuf::from("/scratch/s1/f1.part")
        );
    }

    #[tokio::test]
    async fn writes_at_offset() {
        let dir = TempDir::new().unwrap();
        let scratch = ScratchSpace::new(dir.path());
        let path = scratch.part_path("s1", "f1");

        let mut file = scratch.open_at(&path, 0).await.unwrap();
        let mut body: &[u8] = b"Hello ";
        let w = write_chunk(&mut file, &mut body, 6, 4, false).await.unwrap();
        assert_eq!(w.bytes_written, 6);
        assert!(w.digest.is_none());
        drop(file);

        let mut file = scratch.open_at(&path, 6).await.unwrap();
        let mut body: &[u8] = b"Work";
        write_chunk(&mut file, &mut body, 4, 4, false).await.unwrap();
        drop(file);

        assert_eq!(std::fs::read(&path).unwrap(), b"Hello Work");
        assert_eq!(scratch.len(&path).await.unwrap(), 10);
    }

    #[tokio::test]
    async fn open_at_discards_uncommitted_tail() {
        let dir = TempDir::new().unwrap();
        let scratch = ScratchSpace::new(dir.path());
        let path = scratch.part_path("s1", "f1");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, b"abcXYZ").unwrap();

        let mut file = scratch.open_at(&path, 3).await.unwrap();
        let mut body: &[u8] = b"def";
        write_chunk(&mut file, &mut body, 3, 64, false).await.unwrap();
        drop(file);

        assert_eq!(std::fs::read(&path).unwrap(), b"abcdef");
    }

    #[tokio::test]
    async fn open_at_rejects_missing_bytes() {
        let dir = TempDir::new().unwrap();
        let scratch = ScratchSpace::new(dir.path());
        let path = scratch.part_path("s1", "f1");

        let result = scratch.open_at(&path, 10).await;
        assert!(matches!(result, Err(TransferError::InvalidState(_))));
    }

    #[tokio::test]
    async fn short_body_is_length_mismatch() {
        let dir = TempDir::new().unwrap();
        let scratch = ScratchSpace::new(dir.path());
        let path = scratch.part_path("s1", "f1");
        let mut file = scratch.open_at(&path, 0).await.unwrap();

        let mut body: &[u8] = b"abc";
        let result = write_chunk(&mut file, &mut body, 5, 64, false).await;
        assert!(matches!(
            result,
            Err(TransferError::ChunkLengthMismatch {
                declared: 5,
                received: 3
            })
        ));
    }

    #[tokio::test]
    async fn long_body_is_length_mismatch() {
        let dir = TempDir::new().unwrap();
        let scratch = ScratchSpace::new(dir.path());
        let path = scratch.part_path("s1", "f1");
        let mut file = scratch.open_at(&path, 0).await.unwrap();

        let mut body: &[u8] = b"abcdef";
        let result = write_chunk(&mut file, &mut body, 3, 64, false).await;
        assert!(matches!(
            result,
            Err(TransferError::ChunkLengthMismatch { declared: 3, .. })
        ));
    }

    #[tokio::test]
    async fn digest_matches_checksum_bytes() {
        let dir = TempDir::new().unwrap();
        let scratch = ScratchSpace::new(dir.path());
        let path = scratch.part_path("s1", "f1");
        let mut file = scratch.open_at(&path, 0).await.unwrap();

        let data = vec![7u8; 10_000];
        let mut body: &[u8] = &data;
        let w = write_chunk(&mut file, &mut body, data.len() as u64, 512, true)
            .await
            .unwrap();
        assert_eq!(w.digest.unwrap(), checksum_bytes(&data));
    }

    #[tokio::test]
    async fn truncate_restores_length() {
        let dir = TempDir::new().unwrap();
        let scratch = ScratchSpace::new(dir.path());
        let path = scratch.part_path("s1", "f1");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, b"0123456789").unwrap();

        scratch.truncate(&path, 4).await.unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"0123");
    }

    #[tokio::test]
    async fn remove_session_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let scratch = ScratchSpace::new(dir.path());
        let path = scratch.part_path("s1", "f1");
        scratch.open_at(&path, 0).await.unwrap();

        assert!(scratch.remove_session("s1").await.unwrap());
        assert!(!scratch.remove_session("s1").await.unwrap());
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn session_dirs_lists_directories_only() {
        let dir = TempDir::new().unwrap();
        let scratch = ScratchSpace::new(dir.path());
        scratch.open_at(&scratch.part_path("s1", "f"), 0).await.unwrap();
        scratch.open_at(&scratch.part_path("s2", "f"), 0).await.unwrap();
        std::fs::write(dir.path().join("stray"), b"x").unwrap();

        let mut ids: Vec<_> = scratch
            .session_dirs()
            .await
            .unwrap()
            .into_iter()
            .map(|d| d.session_id)
            .collect();
        ids.sort();
        assert_eq!(ids, vec!["s1", "s2"]);
    }

    #[tokio::test]
    async fn session_dirs_of_missing_root_is_empty() {
        let dir = TempDir::new().unwrap();
        let scratch = ScratchSpace::new(dir.path().join("nope"));
        assert!(scratch.session_dirs().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn move_creates_subdirectories() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("f.part");
        std::fs::write(&src, b"data").unwrap();
        let dest = dir.path().join("out/sub/dir/file.txt");

        move_into_place(&src, &dest, true).await.unwrap();
        assert_eq!(std::fs::read(&dest).unwrap(), b"data");
        assert!(!src.exists());
    }

    #[tokio::test]
    async fn move_respects_overwrite_policy() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("f.part");
        std::fs::write(&src, b"new").unwrap();
        let dest = dir.path().join("file.txt");
        std::fs::write(&dest, b"old").unwrap();

        let result = move_into_place(&src, &dest, false).await;
        assert!(matches!(result, Err(TransferError::FinalizeFailed(_))));
        assert!(src.exists());
        assert_eq!(std::fs::read(&dest).unwrap(), b"old");

        move_into_place(&src, &dest, true).await.unwrap();
        assert_eq!(std::fs::read(&dest).unwrap(), b"new");
    }

    #[tokio::test]
    async fn copy_fallback_verifies_and_removes_source() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("f.part");
        std::fs::write(&src, b"cross device").unwrap();
        let dest = dir.path().join("dest/file.txt");
        std::fs::create_dir_all(dest.parent().unwrap()).unwrap();

        copy_verify_delete(&src, &dest).await.unwrap();
        assert_eq!(std::fs::read(&dest).unwrap(), b"cross device");
        assert!(!src.exists());
        // No staging leftovers.
        assert_eq!(std::fs::read_dir(dest.parent().unwrap()).unwrap().count(), 1);
    }
}
