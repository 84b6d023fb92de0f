//! File-backed storage: one pretty-printed JSON file per key.

use super::KeyValueStorage;
use crate::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::path::PathBuf;

const EXTENSION: &str = "json";

/// Directory-based storage implementation (native only).
///
/// Keys are percent-encoded into file names, so keys containing `/` or `:`
/// map to flat files inside `base_path`.
pub struct FileStorage {
    base_path: PathBuf,
}

impl FileStorage {
    pub fn new(base_path: impl Into<PathBuf>) -> Result<Self> {
        let base_path = base_path.into();
        std::fs::create_dir_all(&base_path)?;
        Ok(Self { base_path })
    }

    fn item_path(&self, key: &str) -> PathBuf {
        self.base_path
            .join(format!("{}.{}", urlencoding::encode(key), EXTENSION))
    }
}

#[async_trait]
impl KeyValueStorage for FileStorage {
    async fn get_item(&self, key: &str) -> Result<Option<Value>> {
        let path = self.item_path(key);
        if !path.exists() {
            return Ok(None);
        }
        let json = tokio::fs::read_to_string(path).await?;
        Ok(Some(serde_json::from_str(&json)?))
    }

    async fn set_item(&self, key: &str, value: Value) -> Result<()> {
        let json = serde_json::to_string_pretty(&value)?;
        tokio::fs::write(self.item_path(key), json).await?;
        Ok(())
    }

    async fn remove_item(&self, key: &str) -> Result<()> {
        let path = self.item_path(key);
        if path.exists() {
            tokio::fs::remove_file(path).await?;
        }
        Ok(())
    }

    async fn get_keys(&self) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.base_path).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(stem) = name
                .to_str()
                .and_then(|n| n.strip_suffix(&format!(".{}", EXTENSION)))
            else {
                continue;
            };
            if let Ok(key) = urlencoding::decode(stem) {
                keys.push(key.into_owned());
            }
        }
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_roundtrip_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let key = "wc@2:core:0.3//history";

        {
            let storage = FileStorage::new(dir.path()).unwrap();
            storage.set_item(key, json!([{"id": 1}])).await.unwrap();
        }

        let reopened = FileStorage::new(dir.path()).unwrap();
        assert_eq!(reopened.get_item(key).await.unwrap(), Some(json!([{"id": 1}])));
        assert_eq!(reopened.get_keys().await.unwrap(), vec![key.to_string()]);

        reopened.remove_item(key).await.unwrap();
        assert!(reopened.get_item(key).await.unwrap().is_none());
        assert!(reopened.get_keys().await.unwrap().is_empty());
    }
}
