//! Local filesystem blob store.
//!
//! Blobs land under a root directory and are served by the gateway's
//! `/media` route, so the returned URL is `<public_base_url>/<key>`.

use std::path::{Component, Path, PathBuf};

use anyhow::Result;
use async_trait::async_trait;
use tracing::debug;

use crate::BlobStore;

pub struct LocalBlobStore {
    root: PathBuf,
    public_base_url: String,
}

impl LocalBlobStore {
    pub fn new(root: PathBuf, public_base_url: impl Into<String>) -> Self {
        Self {
            root,
            public_base_url: public_base_url.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a key to a path inside the root, rejecting traversal.
    fn path_for(&self, key: &str) -> Result<PathBuf> {
        let rel = Path::new(key);
        if key.is_empty()
            || rel
                .components()
                .any(|c| !matches!(c, Component::Normal(_)))
        {
            anyhow::bail!("invalid blob key: {key:?}");
        }
        Ok(self.root.join(rel))
    }

    pub fn url_for(&self, key: &str) -> String {
        format!("{}/{}", self.public_base_url.trim_end_matches('/'), key)
    }
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    async fn put(&self, bytes: Vec<u8>, key: &str, content_type: &str) -> Result<String> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        debug!(key, content_type, bytes = bytes.len(), "Storing blob");
        tokio::fs::write(&path, bytes).await?;
        Ok(self.url_for(key))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let path = self.path_for(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_and_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalBlobStore::new(dir.path().to_path_buf(), "http://localhost:8000/media/");

        let url = store
            .put(b"video".to_vec(), "videos/s1/1.mp4", "video/mp4")
            .await
            .unwrap();
        assert_eq!(url, "http://localhost:8000/media/videos/s1/1.mp4");
        assert!(dir.path().join("videos/s1/1.mp4").exists());

        store.delete("videos/s1/1.mp4").await.unwrap();
        assert!(!dir.path().join("videos/s1/1.mp4").exists());

        // Deleting twice is fine.
        store.delete("videos/s1/1.mp4").await.unwrap();
    }

    #[tokio::test]
    async fn test_rejects_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalBlobStore::new(dir.path().to_path_buf(), "http://x");
        assert!(store.put(vec![], "../escape", "text/plain").await.is_err());
        assert!(store.put(vec![], "/abs", "text/plain").await.is_err());
        assert!(store.delete("").await.is_err());
    }
}
