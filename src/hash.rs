//! Content hashing for tracked files.
//!
//! Steps record a lowercase hex SHA-256 per tracked file; change detection
//! compares the stored hash against the file's current content.

use crate::error::{Error, Result};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Hash raw bytes to a lowercase hex SHA-256 string
#[must_use]
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Hash a file's contents
///
/// # Errors
/// Returns an error if the file cannot be read.
pub async fn hash_file(path: &Path) -> Result<String> {
    let bytes = tokio::fs::read(path).await.map_err(|e| Error::Io {
        message: format!("reading {} for hashing: {e}", path.display()),
        source: e,
    })?;
    Ok(sha256_hex(&bytes))
}

/// Check that a string is a well-formed lowercase hex SHA-256 digest
#[must_use]
pub fn is_valid_hash(s: &str) -> bool {
    s.len() == 64 && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

/// Resolve a tracked file path against an optional task base path
#[must_use]
pub fn resolve_tracked_path(base: Option<&str>, file: &str) -> PathBuf {
    let p = Path::new(file);
    if p.is_absolute() {
        return p.to_path_buf();
    }
    match base {
        Some(b) => Path::new(b).join(p),
        None => p.to_path_buf(),
    }
}

/// Hash a set of tracked files, resolved against the task base path.
///
/// The result maps the file name as given (not the resolved path) to its
/// current digest, in a deterministic order.
///
/// # Errors
/// Returns an error if any file cannot be read.
pub async fn hash_tracked_files(
    base: Option<&str>,
    files: &[String],
) -> Result<BTreeMap<String, String>> {
    let mut out = BTreeMap::new();
    for file in files {
        let path = resolve_tracked_path(base, file);
        let digest = hash_file(&path).await?;
        out.insert(file.clone(), digest);
    }
    Ok(out)
}

/// Compare stored hashes against current file contents.
///
/// Returns the names of files whose digest differs or whose stored hash is
/// missing, empty or malformed. Files that cannot be read count as changed.
pub async fn changed_files(
    base: Option<&str>,
    stored: &BTreeMap<String, String>,
    files: &[String],
) -> Vec<String> {
    let mut changed = Vec::new();
    for file in files {
        let recorded = stored.get(file).map(String::as_str).unwrap_or("");
        if !is_valid_hash(recorded) {
            changed.push(file.clone());
            continue;
        }
        let path = resolve_tracked_path(base, file);
        match hash_file(&path).await {
            Ok(current) if current == recorded => {}
            _ => changed.push(file.clone()),
        }
    }
    changed
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_sha256_hex_known_vector() {
        // sha256("abc")
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_is_valid_hash() {
        assert!(is_valid_hash(&sha256_hex(b"")));
        assert!(!is_valid_hash(""));
        assert!(!is_valid_hash("ZZ7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"));
        assert!(!is_valid_hash("abc123"));
    }

    #[test]
    fn test_resolve_tracked_path() {
        assert_eq!(
            resolve_tracked_path(Some("/w/t"), "Dockerfile"),
            PathBuf::from("/w/t/Dockerfile")
        );
        assert_eq!(
            resolve_tracked_path(Some("/w/t"), "/abs/file"),
            PathBuf::from("/abs/file")
        );
        assert_eq!(resolve_tracked_path(None, "rel"), PathBuf::from("rel"));
    }

    #[tokio::test]
    async fn test_hash_and_change_detection() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tracked.txt");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(b"first").unwrap();
        drop(f);

        let base = dir.path().to_str().map(String::from);
        let files = vec!["tracked.txt".to_string()];
        let hashes = hash_tracked_files(base.as_deref(), &files).await.unwrap();
        assert!(is_valid_hash(&hashes["tracked.txt"]));

        // Unchanged content is not reported
        let changed = changed_files(base.as_deref(), &hashes, &files).await;
        assert!(changed.is_empty());

        // Rewriting the file flips the predicate
        std::fs::write(&path, b"second").unwrap();
        let changed = changed_files(base.as_deref(), &hashes, &files).await;
        assert_eq!(changed, files);
    }

    #[tokio::test]
    async fn test_missing_stored_hash_counts_as_changed() {
        let stored = BTreeMap::new();
        let changed = changed_files(None, &stored, &["whatever".to_string()]).await;
        assert_eq!(changed, vec!["whatever".to_string()]);
    }
}
