//! Content-addressed page store.
//!
//! Bodies are stored under their SHA-256 digest with a two-level fan-out
//! (`ab/abcdef….html`) so directories stay small at crawl scale. Writes are
//! idempotent: an existing file for the digest is left untouched.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};

/// Disk-backed content-addressed store.
#[derive(Debug, Clone)]
pub struct ContentStore {
    root: PathBuf,
}

impl ContentStore {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// SHA-256 hex digest of a body.
    #[must_use]
    pub fn content_hash(body: &[u8]) -> String {
        hex::encode(Sha256::digest(body))
    }

    /// Persist a body under its digest. Returns `(hash, path)`.
    pub async fn put(&self, body: &[u8], extension: &str) -> Result<(String, PathBuf)> {
        let hash = Self::content_hash(body);
        let dir = self.root.join(&hash[..2]);
        tokio::fs::create_dir_all(&dir)
            .await
            .context("failed to create content store directory")?;

        let path = dir.join(format!("{hash}.{extension}"));
        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Ok((hash, path));
        }
        tokio::fs::write(&path, body)
            .await
            .context("failed to write content file")?;
        Ok((hash, path))
    }

    /// Path a digest would be stored at, if present.
    pub async fn get(&self, hash: &str, extension: &str) -> Option<PathBuf> {
        if hash.len() < 2 {
            return None;
        }
        let path = self.root.join(&hash[..2]).join(format!("{hash}.{extension}"));
        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            Some(path)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_is_idempotent_and_addressable() {
        let dir = tempfile::tempdir().unwrap();
        let store = ContentStore::new(dir.path());

        let (hash_a, path_a) = store.put(b"<html>x</html>", "html").await.unwrap();
        let (hash_b, path_b) = store.put(b"<html>x</html>", "html").await.unwrap();
        assert_eq!(hash_a, hash_b);
        assert_eq!(path_a, path_b);

        let found = store.get(&hash_a, "html").await;
        assert_eq!(found, Some(path_a));
        assert!(store.get(&ContentStore::content_hash(b"other"), "html").await.is_none());
    }
}
