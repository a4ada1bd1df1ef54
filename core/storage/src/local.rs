//! Local filesystem key-value store.

use async_trait::async_trait;
use percent_encoding::{percent_decode_str, utf8_percent_encode, NON_ALPHANUMERIC};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;
use uuid::Uuid;

use crate::provider::KeyValueStore;
use offsync_common::{Error, Result};

const VALUE_EXTENSION: &str = ".kv";

/// Local filesystem key-value store.
///
/// Stores each key in its own file under a root directory. Keys are
/// percent-encoded into file names, so any string is a valid key.
pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    /// Create a new local store with the given root directory.
    ///
    /// # Postconditions
    /// - Root directory is created if it doesn't exist
    ///
    /// # Errors
    /// - Invalid path
    /// - Permission denied
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();

        // Create root if it doesn't exist (sync for constructor)
        if !root.exists() {
            std::fs::create_dir_all(&root)?;
        }
        if !root.is_dir() {
            return Err(Error::InvalidInput(format!(
                "Store root is not a directory: {}",
                root.display()
            )));
        }

        Ok(Self { root })
    }

    /// Root directory of this store.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn file_for(&self, key: &str) -> PathBuf {
        let encoded = utf8_percent_encode(key, NON_ALPHANUMERIC).to_string();
        self.root.join(format!("{}{}", encoded, VALUE_EXTENSION))
    }

    fn key_for(file_name: &str) -> Option<String> {
        let encoded = file_name.strip_suffix(VALUE_EXTENSION)?;
        percent_decode_str(encoded)
            .decode_utf8()
            .ok()
            .map(|k| k.into_owned())
    }
}

#[async_trait]
impl KeyValueStore for LocalStore {
    fn name(&self) -> &str {
        "local"
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        match fs::read_to_string(self.file_for(key)).await {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::Storage(format!("read {}: {}", key, e))),
        }
    }

    async fn set(&self, key: &str, value: String) -> Result<()> {
        let target = self.file_for(key);
        let temp = self.root.join(format!(".tmp-{}", Uuid::new_v4()));

        // Write then rename so readers never observe a torn value
        fs::write(&temp, value.as_bytes())
            .await
            .map_err(|e| Error::Storage(format!("write {}: {}", key, e)))?;
        if let Err(e) = fs::rename(&temp, &target).await {
            let _ = fs::remove_file(&temp).await;
            return Err(Error::Storage(format!("commit {}: {}", key, e)));
        }

        debug!("Stored {} ({} bytes)", key, value.len());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        match fs::remove_file(self.file_for(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Storage(format!("delete {}: {}", key, e))),
        }
    }

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>> {
        let mut entries = fs::read_dir(&self.root)
            .await
            .map_err(|e| Error::Storage(format!("list {}: {}", self.root.display(), e)))?;

        let mut keys = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| Error::Storage(e.to_string()))?
        {
            let file_name = entry.file_name();
            let Some(name) = file_name.to_str() else {
                continue;
            };
            if let Some(key) = Self::key_for(name) {
                if key.starts_with(prefix) {
                    keys.push(key);
                }
            }
        }

        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_roundtrip_and_overwrite() {
        let temp = TempDir::new().unwrap();
        let store = LocalStore::new(temp.path()).unwrap();

        store.set("queue:pending", "[]".to_string()).await.unwrap();
        store.set("queue:pending", "[1]".to_string()).await.unwrap();

        assert_eq!(
            store.get("queue:pending").await.unwrap(),
            Some("[1]".to_string())
        );
        assert!(store.get("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_keys_with_special_characters() {
        let temp = TempDir::new().unwrap();
        let store = LocalStore::new(temp.path()).unwrap();

        let key = "cache:/api/users?page=2&sort=name";
        store.set(key, "v".to_string()).await.unwrap();

        let keys = store.list_keys("cache:").await.unwrap();
        assert_eq!(keys, vec![key.to_string()]);
    }

    #[tokio::test]
    async fn test_list_ignores_temp_files() {
        let temp = TempDir::new().unwrap();
        let store = LocalStore::new(temp.path()).unwrap();
        store.set("a", "1".to_string()).await.unwrap();
        std::fs::write(temp.path().join(".tmp-leftover"), "x").unwrap();

        assert_eq!(store.list_keys("").await.unwrap(), vec!["a".to_string()]);
    }

    #[tokio::test]
    async fn test_delete_missing_is_ok() {
        let temp = TempDir::new().unwrap();
        let store = LocalStore::new(temp.path()).unwrap();

        store.delete("nope").await.unwrap();
        store.set("k", "v".to_string()).await.unwrap();
        store.delete("k").await.unwrap();
        assert!(store.get("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_persists_across_instances() {
        let temp = TempDir::new().unwrap();
        {
            let store = LocalStore::new(temp.path()).unwrap();
            store.set("sync:state", "{}".to_string()).await.unwrap();
        }

        let store = LocalStore::new(temp.path()).unwrap();
        assert_eq!(store.get("sync:state").await.unwrap(), Some("{}".to_string()));
    }

    #[test]
    fn test_root_must_be_directory() {
        let temp = TempDir::new().unwrap();
        let file = temp.path().join("plain");
        std::fs::write(&file, "x").unwrap();
        assert!(LocalStore::new(&file).is_err());
    }
}
