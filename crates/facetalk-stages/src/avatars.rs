//! Filesystem avatar directory.

use std::path::PathBuf;

use anyhow::Result;
use async_trait::async_trait;

use crate::{AvatarDirectory, AvatarImage};

const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "webp"];

/// Looks up `<dir>/<avatar_id>.<ext>`. Sessions are not tracked here, so
/// every session counts as active.
pub struct FsAvatarDirectory {
    dir: PathBuf,
}

impl FsAvatarDirectory {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }
}

fn valid_id(avatar_id: &str) -> bool {
    !avatar_id.is_empty()
        && avatar_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

#[async_trait]
impl AvatarDirectory for FsAvatarDirectory {
    async fn image(&self, avatar_id: &str) -> Result<Option<AvatarImage>> {
        if !valid_id(avatar_id) {
            return Ok(None);
        }
        for ext in IMAGE_EXTENSIONS {
            let path = self.dir.join(format!("{avatar_id}.{ext}"));
            if tokio::fs::try_exists(&path).await? {
                return Ok(Some(AvatarImage {
                    avatar_id: avatar_id.to_string(),
                    path,
                }));
            }
        }
        Ok(None)
    }

    async fn session_active(&self, _session_id: &str) -> Result<bool> {
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_image_lookup() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("alice.png"), b"png").unwrap();
        let avatars = FsAvatarDirectory::new(dir.path().to_path_buf());

        let found = avatars.image("alice").await.unwrap().unwrap();
        assert_eq!(found.path, dir.path().join("alice.png"));
        assert!(avatars.image("bob").await.unwrap().is_none());
        assert!(avatars.image("../alice").await.unwrap().is_none());
        assert!(avatars.session_active("any").await.unwrap());
    }
}
