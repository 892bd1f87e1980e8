//! Filesystem-backed key-value store.

use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use uuid::Uuid;

use crate::kv::KeyValueStore;
use tarotsync_common::{Error, Result};

/// Key-value store keeping one file per key under a root directory.
///
/// Writes go to a temporary file that is renamed over the target, so a
/// reader never sees a half-written value.
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    /// Create a new store rooted at `root`.
    ///
    /// # Postconditions
    /// - Root directory is created if it doesn't exist
    ///
    /// # Errors
    /// - Permission denied
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();

        if !root.exists() {
            std::fs::create_dir_all(&root)?;
        }

        Ok(Self { root })
    }

    /// Root directory of the store.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Map a key to its file, rejecting keys that could escape the root.
    fn key_path(&self, key: &str) -> Result<PathBuf> {
        let valid = !key.is_empty()
            && key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
            && !key.starts_with('.');

        if !valid {
            return Err(Error::InvalidInput(format!("Invalid storage key: {:?}", key)));
        }

        Ok(self.root.join(format!("{}.json", key)))
    }
}

#[async_trait]
impl KeyValueStore for FileStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let path = self.key_path(key)?;

        match fs::read_to_string(&path).await {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn set(&self, key: &str, value: String) -> Result<()> {
        let path = self.key_path(key)?;
        let tmp = self.root.join(format!(".{}.{}.tmp", key, Uuid::new_v4()));

        fs::write(&tmp, value.as_bytes()).await?;
        if let Err(e) = fs::rename(&tmp, &path).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(e.into());
        }

        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        let path = self.key_path(key)?;

        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_file_set_get() {
        let temp = TempDir::new().unwrap();
        let store = FileStore::new(temp.path()).unwrap();

        store.set("saved_spreads", "[]".to_string()).await.unwrap();

        assert_eq!(store.get("saved_spreads").await.unwrap().as_deref(), Some("[]"));
        assert!(temp.path().join("saved_spreads.json").exists());
    }

    #[tokio::test]
    async fn test_file_missing_key() {
        let temp = TempDir::new().unwrap();
        let store = FileStore::new(temp.path()).unwrap();

        assert_eq!(store.get("nothing").await.unwrap(), None);
        store.remove("nothing").await.unwrap();
    }

    #[tokio::test]
    async fn test_file_overwrite_leaves_no_temp_files() {
        let temp = TempDir::new().unwrap();
        let store = FileStore::new(temp.path()).unwrap();

        store.set("k", "one".to_string()).await.unwrap();
        store.set("k", "two".to_string()).await.unwrap();

        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("two"));
        let count = std::fs::read_dir(temp.path()).unwrap().count();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn test_file_rejects_traversal() {
        let temp = TempDir::new().unwrap();
        let store = FileStore::new(temp.path()).unwrap();

        assert!(store.get("../etc/passwd").await.is_err());
        assert!(store.set("a/b", "x".to_string()).await.is_err());
        assert!(store.set(".hidden", "x".to_string()).await.is_err());
    }

    #[tokio::test]
    async fn test_file_creates_root() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("nested").join("data");
        let store = FileStore::new(&root).unwrap();

        store.set("k", "v".to_string()).await.unwrap();
        assert!(root.exists());
    }
}
