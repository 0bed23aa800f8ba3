use std::path::{Path, PathBuf};

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::AppError;

/// Result of a best-effort file removal. Deliberately separate from the
/// parent operation's `Result`: a failed cleanup leaves an orphan file for
/// the sweep to collect, it never fails the operation that triggered it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CleanupOutcome {
    Removed,
    AlreadyAbsent,
    Failed(String),
}

impl CleanupOutcome {
    pub fn log(&self, locator: &str) {
        if let CleanupOutcome::Failed(reason) = self {
            tracing::warn!("Failed to remove superseded avatar {}: {}", locator, reason);
        }
    }
}

/// Owns the on-disk lifecycle of avatar images. Writes are fatal on failure,
/// deletes are idempotent and best-effort.
#[async_trait]
pub trait AvatarStore: Send + Sync {
    /// Stores `bytes` under a freshly generated collision-free name and
    /// returns its public locator.
    async fn write(&self, bytes: &[u8], ext: &str) -> Result<String, AppError>;

    /// Removes the file behind `locator`. An already-absent target counts as
    /// success.
    async fn delete(&self, locator: &str) -> CleanupOutcome;

    async fn exists(&self, locator: &str) -> bool;
}

/// URL path the static-files layer serves the avatars directory under. The
/// uploads root may live anywhere on disk, but it is always mounted here.
pub const AVATAR_PUBLIC_PREFIX: &str = "/uploads/avatars";

/// Filesystem-backed store rooted at the configured avatars directory.
/// Locators are URL paths (`/uploads/avatars/<uuid>.<ext>`) so they can be
/// served verbatim by the static-files layer.
pub struct FsAvatarStore {
    root: PathBuf,
    public_prefix: String,
}

impl FsAvatarStore {
    /// `root` is the on-disk directory; `public_prefix` is the URL path the
    /// static-files layer serves it under. The two are independent: an
    /// absolute root like `/var/lib/sqlpilot/uploads/avatars` still yields
    /// `/uploads/avatars/...` locators.
    pub fn new(root: impl Into<PathBuf>, public_prefix: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            public_prefix: public_prefix.into().trim_end_matches('/').to_string(),
        }
    }

    /// Maps a public locator back to a path under the root. Only the file
    /// name component is honoured, so a hostile locator cannot escape the
    /// avatars directory.
    fn path_for(&self, locator: &str) -> Option<PathBuf> {
        let name = Path::new(locator).file_name()?;
        Some(self.root.join(name))
    }
}

#[async_trait]
impl AvatarStore for FsAvatarStore {
    async fn write(&self, bytes: &[u8], ext: &str) -> Result<String, AppError> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|e| AppError::Storage(format!("create {}: {}", self.root.display(), e)))?;

        let filename = format!("{}.{}", Uuid::new_v4(), ext);
        let path = self.root.join(&filename);

        tokio::fs::write(&path, bytes)
            .await
            .map_err(|e| AppError::Storage(format!("write {}: {}", path.display(), e)))?;

        Ok(format!("{}/{}", self.public_prefix, filename))
    }

    async fn delete(&self, locator: &str) -> CleanupOutcome {
        let Some(path) = self.path_for(locator) else {
            return CleanupOutcome::AlreadyAbsent;
        };

        match tokio::fs::remove_file(&path).await {
            Ok(()) => CleanupOutcome::Removed,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => CleanupOutcome::AlreadyAbsent,
            Err(e) => CleanupOutcome::Failed(e.to_string()),
        }
    }

    async fn exists(&self, locator: &str) -> bool {
        match self.path_for(locator) {
            Some(path) => tokio::fs::try_exists(path).await.unwrap_or(false),
            None => false,
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn write_then_exists_then_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsAvatarStore::new(dir.path().join("avatars"), AVATAR_PUBLIC_PREFIX);

        let locator = store.write(b"png bytes", "png").await.unwrap();
        assert!(locator.ends_with(".png"));
        assert!(store.exists(&locator).await);

        assert_eq!(store.delete(&locator).await, CleanupOutcome::Removed);
        assert!(!store.exists(&locator).await);
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsAvatarStore::new(dir.path().join("avatars"), AVATAR_PUBLIC_PREFIX);

        let locator = store.write(b"bytes", "png").await.unwrap();
        assert_eq!(store.delete(&locator).await, CleanupOutcome::Removed);
        assert_eq!(store.delete(&locator).await, CleanupOutcome::AlreadyAbsent);
    }

    #[tokio::test]
    async fn writes_never_collide() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsAvatarStore::new(dir.path().join("avatars"), AVATAR_PUBLIC_PREFIX);

        let a = store.write(b"one", "png").await.unwrap();
        let b = store.write(b"one", "png").await.unwrap();
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn locator_cannot_escape_the_root() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsAvatarStore::new(dir.path().join("avatars"), AVATAR_PUBLIC_PREFIX);

        let outside = dir.path().join("secret.txt");
        tokio::fs::write(&outside, b"keep me").await.unwrap();

        store.delete("/uploads/avatars/../secret.txt").await;
        assert!(tokio::fs::try_exists(&outside).await.unwrap());
    }

    #[tokio::test]
    async fn absolute_root_still_yields_public_locators() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("avatars");
        assert!(root.is_absolute());
        let store = FsAvatarStore::new(&root, AVATAR_PUBLIC_PREFIX);

        let locator = store.write(b"bytes", "png").await.unwrap();
        assert!(locator.starts_with("/uploads/avatars/"), "{}", locator);
        assert!(!locator.starts_with("//"));
        assert!(store.exists(&locator).await);
    }
}
