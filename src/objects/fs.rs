//! Object storage backed by a local directory.

use std::path::Component;

use tokio::fs;

use crate::prelude::*;

use super::ObjectStore;

/// Stores each object as a file under `root`, using the location as a
/// relative path.
#[derive(Debug, Clone)]
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    /// Create a store rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Map a location to a path, refusing anything that would escape `root`.
    fn resolve(&self, location: &str) -> Result<PathBuf, PipelineError> {
        let relative = Path::new(location);
        let safe = !location.is_empty()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !safe {
            return Err(PipelineError::new(
                ErrKind::StorageAccessError,
                format!("invalid object location: {location:?}"),
            ));
        }
        Ok(self.root.join(relative))
    }

    /// Make sure the parent directory of `path` exists.
    async fn ensure_parent(path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("cannot create directory {}", parent.display()))?;
        }
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn put(&self, location: &str, data: Vec<u8>) -> Result<(), PipelineError> {
        let path = self.resolve(location)?;
        async {
            Self::ensure_parent(&path).await?;
            // Write to a sibling temp file first so readers never see a
            // partial object.
            let tmp = path.with_extension(format!("tmp-{}", uuid::Uuid::new_v4()));
            fs::write(&tmp, &data)
                .await
                .with_context(|| format!("cannot write {}", tmp.display()))?;
            fs::rename(&tmp, &path)
                .await
                .with_context(|| format!("cannot rename into {}", path.display()))
        }
        .await
        .or_kind(ErrKind::StorageAccessError)
    }

    async fn get(&self, location: &str) -> Result<Vec<u8>, PipelineError> {
        let path = self.resolve(location)?;
        fs::read(&path)
            .await
            .with_context(|| format!("cannot read {location}"))
            .or_kind(ErrKind::StorageAccessError)
    }

    async fn copy(&self, from: &str, to: &str) -> Result<(), PipelineError> {
        let from_path = self.resolve(from)?;
        let to_path = self.resolve(to)?;
        async {
            Self::ensure_parent(&to_path).await?;
            fs::copy(&from_path, &to_path)
                .await
                .with_context(|| format!("cannot copy {from} to {to}"))?;
            Ok::<_, anyhow::Error>(())
        }
        .await
        .or_kind(ErrKind::StorageAccessError)
    }

    async fn delete(&self, location: &str) -> Result<(), PipelineError> {
        let path = self.resolve(location)?;
        fs::remove_file(&path)
            .await
            .with_context(|| format!("cannot delete {location}"))
            .or_kind(ErrKind::StorageAccessError)
    }

    async fn move_object(&self, from: &str, to: &str) -> Result<(), PipelineError> {
        let from_path = self.resolve(from)?;
        let to_path = self.resolve(to)?;
        async {
            Self::ensure_parent(&to_path).await?;
            fs::rename(&from_path, &to_path)
                .await
                .with_context(|| format!("cannot move {from} to {to}"))
        }
        .await
        .or_kind(ErrKind::StorageAccessError)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_get_move() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsObjectStore::new(dir.path());
        store.put_text("incoming/a_1.jpg", "bytes").await.unwrap();
        assert_eq!(store.get_text("incoming/a_1.jpg").await.unwrap(), "bytes");

        store
            .move_object("incoming/a_1.jpg", "complete/a/a_1.jpg")
            .await
            .unwrap();
        assert!(store.get("incoming/a_1.jpg").await.is_err());
        assert_eq!(store.get_text("complete/a/a_1.jpg").await.unwrap(), "bytes");
    }

    #[tokio::test]
    async fn test_rejects_escaping_locations() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsObjectStore::new(dir.path());
        for bad in ["../x", "/etc/passwd", "a/../../b", ""] {
            let err = store.get(bad).await.unwrap_err();
            assert_eq!(err.kind, ErrKind::StorageAccessError, "{bad}");
        }
    }

    #[tokio::test]
    async fn test_missing_object_is_storage_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsObjectStore::new(dir.path());
        let err = store.get("incoming/nope.pdf").await.unwrap_err();
        assert_eq!(err.kind, ErrKind::StorageAccessError);
    }
}
