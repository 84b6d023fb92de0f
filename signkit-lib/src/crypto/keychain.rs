use crate::storage::{KeyValueStorage, PersistedStore};
use crate::Result;
use std::sync::Arc;

/// Persisted map from tag to hex key material.
///
/// Tags are either a public key (value: the matching private key) or a topic
/// (value: the symmetric key protecting it).
pub struct Keychain {
    keys: PersistedStore<String>,
}

impl Keychain {
    pub fn new(storage: Arc<dyn KeyValueStorage>, storage_key: String) -> Self {
        Self {
            keys: PersistedStore::new(storage, storage_key, "keychain"),
        }
    }

    pub async fn init(&self) -> Result<()> {
        self.keys.init().await
    }

    pub async fn set(&self, tag: &str, key: &str) -> Result<()> {
        self.keys.set(tag, key.to_string()).await
    }

    /// Fails with `NoMatchingKey` for an unknown tag.
    pub async fn get(&self, tag: &str) -> Result<String> {
        self.keys.get(tag).await
    }

    pub async fn has(&self, tag: &str) -> bool {
        self.keys.contains(tag).await
    }

    pub async fn del(&self, tag: &str) -> Result<()> {
        self.keys.delete(tag, "keychain delete").await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    #[tokio::test]
    async fn test_keychain_persists() {
        let storage = MemoryStorage::new();
        let keychain = Keychain::new(Arc::new(storage.clone()), "kc".into());
        keychain.set("topic", "00ff").await.unwrap();
        assert!(keychain.has("topic").await);

        let restarted = Keychain::new(Arc::new(storage), "kc".into());
        restarted.init().await.unwrap();
        assert_eq!(restarted.get("topic").await.unwrap(), "00ff");
        restarted.del("topic").await.unwrap();
        assert!(restarted.get("topic").await.is_err());
    }
}
