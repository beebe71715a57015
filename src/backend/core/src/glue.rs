//! Non-core utilities: task-directory fingerprinting.
//!
//! Grounded on the teacher's own use of `sha2` for content hashing elsewhere
//! in the stack; no teacher file fingerprints a directory directly, so this
//! is pack-enrichment rather than a copy of a specific teacher routine.
//!
//! Resolves spec.md §9's Open Question about the hash filename: fixed here
//! to [`FINGERPRINT_FILE_NAME`], never accepted as a parameter.

use std::path::Path;

use sha2::{Digest, Sha256};

use crate::error::{ErrorCode, QueueError, Result};

/// Fixed filename written into a task directory to cache its fingerprint.
/// The external TypeScript-codegen collaborator (`ANQUEUE_GENERATE_TYPES`,
/// out of scope per spec.md §1) reads this to decide whether to regenerate
/// types; this crate only maintains it.
pub const FINGERPRINT_FILE_NAME: &str = ".anqueue-types.hash";

/// Hash the sorted list of `(file name, modified time)` pairs for every
/// candidate file directly inside `dir` (non-recursive, matching
/// `executor.rs`'s discovery scope). Stable across runs as long as the
/// directory's contents and mtimes are unchanged; changes to either change
/// the hash.
pub async fn directory_fingerprint(dir: &Path) -> Result<String> {
    let mut entries = tokio::fs::read_dir(dir).await.map_err(|e| {
        QueueError::with_internal(ErrorCode::ExecutorDiscoveryFailed, "could not read task directory", e.to_string())
    })?;

    let mut names = Vec::new();
    while let Some(entry) = entries.next_entry().await.map_err(QueueError::from)? {
        let name = entry.file_name().to_string_lossy().into_owned();
        if name == FINGERPRINT_FILE_NAME {
            continue;
        }
        let modified = entry
            .metadata()
            .await
            .ok()
            .and_then(|m| m.modified().ok())
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_millis())
            .unwrap_or(0);
        names.push((name, modified));
    }
    names.sort();

    let mut hasher = Sha256::new();
    for (name, modified) in &names {
        hasher.update(name.as_bytes());
        hasher.update(modified.to_le_bytes());
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Read the previously cached fingerprint, if any. Absence (first run, or a
/// directory never scanned before) is not an error.
pub async fn read_cached_fingerprint(dir: &Path) -> Option<String> {
    tokio::fs::read_to_string(dir.join(FINGERPRINT_FILE_NAME)).await.ok().map(|s| s.trim().to_string())
}

/// Persist `fingerprint` under [`FINGERPRINT_FILE_NAME`] in `dir`. Best
/// effort: a read-only task directory should not prevent the queue from
/// running, so failures are logged rather than surfaced.
pub async fn write_cached_fingerprint(dir: &Path, fingerprint: &str) {
    if let Err(err) = tokio::fs::write(dir.join(FINGERPRINT_FILE_NAME), fingerprint).await {
        tracing::debug!(dir = %dir.display(), error = %err, "could not persist task directory fingerprint");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fingerprint_changes_when_a_file_is_added() {
        let dir = tempfile::tempdir().unwrap();
        let before = directory_fingerprint(dir.path()).await.unwrap();

        tokio::fs::write(dir.path().join("noop"), b"#!/bin/sh\n").await.unwrap();
        let after = directory_fingerprint(dir.path()).await.unwrap();

        assert_ne!(before, after);
    }

    #[tokio::test]
    async fn fingerprint_ignores_the_cache_file_itself() {
        let dir = tempfile::tempdir().unwrap();
        let fingerprint = directory_fingerprint(dir.path()).await.unwrap();
        write_cached_fingerprint(dir.path(), &fingerprint).await;

        let recomputed = directory_fingerprint(dir.path()).await.unwrap();
        assert_eq!(fingerprint, recomputed);
    }

    #[tokio::test]
    async fn round_trips_through_the_cache_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(read_cached_fingerprint(dir.path()).await.is_none());

        write_cached_fingerprint(dir.path(), "abc123").await;
        assert_eq!(read_cached_fingerprint(dir.path()).await.as_deref(), Some("abc123"));
    }
}
