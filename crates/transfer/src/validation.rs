use std::path::{Component, Path, PathBuf};

use crate::TransferError;

/// Longest accepted owner id; keeps store keys and directory names short.
const MAX_OWNER_ID_LEN: usize = 64;

/// Validates an owner id for use as a store key segment and directory name.
pub fn validate_owner_id(owner_id: &str) -> Result<(), TransferError> {
    if owner_id.is_empty() {
        return Err(TransferError::InvalidRequest("empty owner id".into()));
    }
    if owner_id.len() > MAX_OWNER_ID_LEN {
        return Err(TransferError::InvalidRequest(format!(
            "owner id longer than {MAX_OWNER_ID_LEN} characters"
        )));
    }
    if owner_id == "." || owner_id == ".." {
        return Err(TransferError::InvalidRequest(format!(
            "reserved owner id: {owner_id}"
        )));
    }
    let valid = owner_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '@'));
    if !valid {
        return Err(TransferError::InvalidRequest(format!(
            "owner id contains unsupported characters: {owner_id}"
        )));
    }
    Ok(())
}

/// Normalizes a file path relative to a session's target directory.
///
/// Drops `.` components and joins the rest with `/`. Rejects:
/// - Empty paths (including ones that normalize to nothing)
/// - Absolute paths (Unix `/` or Windows `C:\`)
/// - Parent directory traversal (`..`)
/// - Windows prefix components, drive letters and UNC paths
/// - Backslashes and NUL bytes
pub fn normalize_relative_path(file_path: &str) -> Result<String, TransferError> {
    let normalized = normalize(file_path)?;
    if normalized.is_empty() {
        return Err(TransferError::InvalidPath(format!(
            "path names no file: {file_path:?}"
        )));
    }
    Ok(normalized)
}

/// Normalizes a session target directory relative to the owner's root.
///
/// Same rules as [`normalize_relative_path`], except that an empty result
/// (the owner root itself) is allowed.
pub fn normalize_target_path(target_path: &str) -> Result<String, TransferError> {
    normalize(target_path)
}

fn normalize(raw: &str) -> Result<String, TransferError> {
    if raw.contains('\0') {
        return Err(TransferError::InvalidPath("NUL byte in path".into()));
    }
    if raw.contains('\\') {
        return Err(TransferError::InvalidPath(format!(
            "backslash not allowed: {raw}"
        )));
    }
    if raw.len() >= 2 && raw.as_bytes()[1] == b':' {
        return Err(TransferError::InvalidPath(format!(
            "drive prefix not allowed: {raw}"
        )));
    }

    let path = Path::new(raw);
    if path.is_absolute() {
        return Err(TransferError::InvalidPath(format!(
            "absolute path not allowed: {raw}"
        )));
    }

    let mut parts: Vec<&str> = Vec::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => {
                let part = part.to_str().ok_or_else(|| {
                    TransferError::InvalidPath(format!("non UTF-8 path: {raw}"))
                })?;
                parts.push(part);
            }
            Component::CurDir => {}
            Component::ParentDir => {
                return Err(TransferError::InvalidPath(format!(
                    "parent directory traversal not allowed: {raw}"
                )));
            }
            Component::Prefix(_) => {
                return Err(TransferError::InvalidPath(format!(
                    "path prefix not allowed: {raw}"
                )));
            }
            Component::RootDir => {
                return Err(TransferError::InvalidPath(format!(
                    "absolute path not allowed: {raw}"
                )));
            }
        }
    }

    Ok(parts.join("/"))
}

/// Joins `relative` (already normalized) onto `root` and verifies the
/// result cannot escape `root` through symlinks.
///
/// The nearest existing ancestor of the joined path is canonicalized and
/// must stay inside the canonical root. `root` is created if missing.
/// Blocking; call from `spawn_blocking` in async code.
pub fn resolve_within_root(root: &Path, relative: &str) -> Result<PathBuf, TransferError> {
    std::fs::create_dir_all(root)?;
    let root_canonical = root.canonicalize()?;
    let joined = if relative.is_empty() {
        root.to_path_buf()
    } else {
        root.join(relative)
    };

    let mut candidate = joined.as_path();
    loop {
        match std::fs::symlink_metadata(candidate) {
            Ok(_) => {
                let canonical = candidate.canonicalize().map_err(|_| {
                    TransferError::InvalidPath(format!(
                        "unresolvable path component: {}",
                        candidate.display()
                    ))
                })?;
                if !canonical.starts_with(&root_canonical) {
                    return Err(TransferError::InvalidPath(format!(
                        "path escapes storage root: {relative}"
                    )));
                }
                return Ok(joined);
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        match candidate.parent() {
            Some(parent) => candidate = parent,
            None => return Ok(joined),
        }
    }
}

/// Async wrapper around [`resolve_within_root`].
pub(crate) async fn resolve_within_root_async(
    root: PathBuf,
    relative: String,
) -> Result<PathBuf, TransferError> {
    tokio::task::spawn_blocking(move || resolve_within_root(&root, &relative))
        .await
        .map_err(|e| TransferError::Io(std::io::Error::other(format!("path check failed: {e}"))))?
}

/// Returns `true` if `id` looks like a generated session or file id.
///
/// Ids become directory and file names under scratch storage, so anything
/// beyond ASCII alphanumerics and `-` is refused outright.
pub fn is_well_formed_id(id: &str) -> bool {
    !id.is_empty() && id.len() <= 64 && id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
}

/// Validates a SHA-256 hex digest and returns it lowercased.
pub fn normalize_digest(digest: &str) -> Result<String, TransferError> {
    if digest.len() != 64 || !digest.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(TransferError::InvalidRequest(format!(
            "digest must be 64 hex characters: {digest:?}"
        )));
    }
    Ok(digest.to_ascii_lowercase())
}
