use crate::error::{AppError, Result};
use crate::store::BlobStore;
use async_trait::async_trait;
use std::path::{Component, Path, PathBuf};

/// Filesystem blob store.
///
/// Objects are written under `root`; the returned URL is `base_url` joined
/// with the object path.
pub struct FsBlobStore {
    root: PathBuf,
    base_url: String,
}

impl FsBlobStore {
    /// Create a blob store rooted at `root`, serving URLs under `base_url`.
    pub fn new(root: impl Into<PathBuf>, base_url: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            base_url: base_url.into(),
        }
    }

    /// Resolve an object path under the root, rejecting traversal.
    fn full_path(&self, path: &str) -> Result<PathBuf> {
        let mut normalized = PathBuf::new();
        for component in Path::new(path).components() {
            match component {
                Component::Normal(c) => normalized.push(c),
                Component::CurDir => {}
                Component::ParentDir | Component::Prefix(_) | Component::RootDir => {
                    return Err(AppError::Storage(format!(
                        "Refusing blob path outside the store: {}",
                        path
                    )));
                }
            }
        }

        if normalized.as_os_str().is_empty() {
            return Err(AppError::Storage("Empty blob path".into()));
        }

        Ok(self.root.join(normalized))
    }

    fn url_for(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn upload(&self, path: &str, bytes: Vec<u8>, content_type: &str) -> Result<String> {
        let full_path = self.full_path(path)?;
        if let Some(parent) = full_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&full_path, &bytes).await?;

        tracing::debug!(
            path = %full_path.display(),
            bytes = bytes.len(),
            content_type,
            "Stored blob"
        );

        Ok(self.url_for(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_upload_writes_and_returns_url() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(dir.path(), "https://cdn.example/assets/");

        let url = store
            .upload("covers/book.jpg", vec![1, 2, 3], "image/jpeg")
            .await
            .unwrap();

        assert_eq!(url, "https://cdn.example/assets/covers/book.jpg");
        assert_eq!(
            std::fs::read(dir.path().join("covers/book.jpg")).unwrap(),
            vec![1, 2, 3]
        );
    }

    #[tokio::test]
    async fn test_traversal_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(dir.path(), "/assets");

        assert!(store.upload("../escape.jpg", vec![0], "image/jpeg").await.is_err());
        assert!(store.upload("/abs.jpg", vec![0], "image/jpeg").await.is_err());
    }
}
