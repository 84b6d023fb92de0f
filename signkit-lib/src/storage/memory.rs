//! In-memory storage implementation.
//!
//! # Thread Safety
//!
//! This storage uses `RwLock` for thread-safe access. Lock poisoning
//! is handled gracefully by returning an error rather than panicking.

use super::KeyValueStorage;
use crate::{Result, SignkitError};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Helper function to handle lock poisoning gracefully.
fn lock_error(context: &str) -> SignkitError {
    SignkitError::Storage(format!("MemoryStorage: lock poisoned during {}", context))
}

/// In-memory key-value storage.
///
/// Cloning yields another handle to the same map: a second client built on a
/// clone sees everything the first one persisted, like a process restart
/// over durable storage would.
#[derive(Clone, Default)]
pub struct MemoryStorage {
    items: Arc<RwLock<HashMap<String, Value>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys. Returns 0 if the lock is poisoned.
    pub fn len(&self) -> usize {
        self.items.read().map(|i| i.len()).unwrap_or(0)
    }

    /// Returns true if the lock is poisoned.
    pub fn is_empty(&self) -> bool {
        self.items.read().map(|i| i.is_empty()).unwrap_or(true)
    }
}

#[async_trait]
impl KeyValueStorage for MemoryStorage {
    async fn get_item(&self, key: &str) -> Result<Option<Value>> {
        let items = self.items.read().map_err(|_| lock_error("get_item"))?;
        Ok(items.get(key).cloned())
    }

    async fn set_item(&self, key: &str, value: Value) -> Result<()> {
        let mut items = self.items.write().map_err(|_| lock_error("set_item"))?;
        items.insert(key.to_string(), value);
        Ok(())
    }

    async fn remove_item(&self, key: &str) -> Result<()> {
        let mut items = self.items.write().map_err(|_| lock_error("remove_item"))?;
        items.remove(key);
        Ok(())
    }

    async fn get_keys(&self) -> Result<Vec<String>> {
        let items = self.items.read().map_err(|_| lock_error("get_keys"))?;
        Ok(items.keys().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_set_get_remove() {
        let storage = MemoryStorage::new();
        assert!(storage.get_item("a").await.unwrap().is_none());

        storage.set_item("a", json!({"x": 1})).await.unwrap();
        assert_eq!(storage.get_item("a").await.unwrap(), Some(json!({"x": 1})));
        assert_eq!(storage.len(), 1);

        storage.remove_item("a").await.unwrap();
        storage.remove_item("a").await.unwrap();
        assert!(storage.is_empty());
    }

    #[tokio::test]
    async fn test_clones_share_state() {
        let storage = MemoryStorage::new();
        let restarted = storage.clone();
        storage.set_item("k", json!(true)).await.unwrap();
        assert_eq!(restarted.get_item("k").await.unwrap(), Some(json!(true)));
        assert_eq!(restarted.get_keys().await.unwrap(), vec!["k".to_string()]);
    }
}
