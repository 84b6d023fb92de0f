use super::KeyValueStorage;
use crate::{Result, SignkitError};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// A typed keyed map persisted as a whole after every mutation.
///
/// The lock is held across the storage write, so persisted snapshots land in
/// the same order as the mutations that produced them.
pub struct PersistedStore<V> {
    storage: Arc<dyn KeyValueStorage>,
    storage_key: String,
    name: String,
    entries: Mutex<BTreeMap<String, V>>,
}

impl<V> PersistedStore<V>
where
    V: Serialize + DeserializeOwned + Clone + Send + Sync,
{
    /// `name` is used in error messages (e.g. "session", "proposal").
    pub fn new(
        storage: Arc<dyn KeyValueStorage>,
        storage_key: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            storage,
            storage_key: storage_key.into(),
            name: name.into(),
            entries: Mutex::new(BTreeMap::new()),
        }
    }

    /// Restore persisted entries. Entries already set in memory win over
    /// persisted ones with the same key.
    pub async fn init(&self) -> Result<()> {
        let Some(value) = self.storage.get_item(&self.storage_key).await? else {
            return Ok(());
        };
        let restored: BTreeMap<String, V> = serde_json::from_value(value)?;
        let mut entries = self.entries.lock().await;
        for (key, entry) in restored {
            entries.entry(key).or_insert(entry);
        }
        tracing::debug!(store = %self.name, count = entries.len(), "restored store");
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn set(&self, key: &str, value: V) -> Result<()> {
        let mut entries = self.entries.lock().await;
        entries.insert(key.to_string(), value);
        self.persist(&entries).await
    }

    /// Fails with `NoMatchingKey` when absent.
    pub async fn get(&self, key: &str) -> Result<V> {
        self.get_optional(key)
            .await
            .ok_or_else(|| SignkitError::no_matching_key(&self.name, key))
    }

    pub async fn get_optional(&self, key: &str) -> Option<V> {
        self.entries.lock().await.get(key).cloned()
    }

    pub async fn contains(&self, key: &str) -> bool {
        self.entries.lock().await.contains_key(key)
    }

    /// Mutate an existing entry in place and persist the result.
    pub async fn update<F>(&self, key: &str, f: F) -> Result<V>
    where
        F: FnOnce(&mut V),
    {
        let mut entries = self.entries.lock().await;
        let entry = entries
            .get_mut(key)
            .ok_or_else(|| SignkitError::no_matching_key(&self.name, key))?;
        f(entry);
        let updated = entry.clone();
        self.persist(&entries).await?;
        Ok(updated)
    }

    /// Remove an entry. Deleting a missing key is a no-op returning `None`.
    pub async fn delete(&self, key: &str, reason: &str) -> Result<Option<V>> {
        let mut entries = self.entries.lock().await;
        let removed = entries.remove(key);
        if removed.is_some() {
            tracing::debug!(store = %self.name, key, reason, "deleted entry");
            self.persist(&entries).await?;
        }
        Ok(removed)
    }

    /// Remove every entry matching `predicate`, persisting once.
    pub async fn remove_where<F>(&self, predicate: F, reason: &str) -> Result<Vec<V>>
    where
        F: Fn(&str, &V) -> bool,
    {
        let mut entries = self.entries.lock().await;
        let doomed: Vec<String> = entries
            .iter()
            .filter(|(k, v)| predicate(k, v))
            .map(|(k, _)| k.clone())
            .collect();
        if doomed.is_empty() {
            return Ok(Vec::new());
        }
        let removed: Vec<V> = doomed.iter().filter_map(|k| entries.remove(k)).collect();
        tracing::debug!(store = %self.name, count = removed.len(), reason, "deleted entries");
        self.persist(&entries).await?;
        Ok(removed)
    }

    /// Entries matching `predicate`.
    pub async fn filter<F>(&self, predicate: F) -> Vec<V>
    where
        F: Fn(&V) -> bool,
    {
        self.entries
            .lock()
            .await
            .values()
            .filter(|v| predicate(v))
            .cloned()
            .collect()
    }

    pub async fn keys(&self) -> Vec<String> {
        self.entries.lock().await.keys().cloned().collect()
    }

    pub async fn values(&self) -> Vec<V> {
        self.entries.lock().await.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    async fn persist(&self, entries: &BTreeMap<String, V>) -> Result<()> {
        let value = serde_json::to_value(entries)?;
        self.storage.set_item(&self.storage_key, value).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use serde::Deserialize;

    #[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
    struct Entry {
        value: u32,
    }

    fn store(storage: &MemoryStorage) -> PersistedStore<Entry> {
        PersistedStore::new(Arc::new(storage.clone()), "test//entries", "entry")
    }

    #[tokio::test]
    async fn test_missing_key_is_no_matching_key() {
        let storage = MemoryStorage::new();
        let entries = store(&storage);
        let err = entries.get("nope").await.unwrap_err();
        assert!(matches!(err, SignkitError::NoMatchingKey { .. }));
        assert!(entries.update("nope", |e| e.value = 1).await.is_err());
    }

    #[tokio::test]
    async fn test_mutations_survive_restart() {
        let storage = MemoryStorage::new();
        let entries = store(&storage);
        entries.set("a", Entry { value: 1 }).await.unwrap();
        entries.set("b", Entry { value: 2 }).await.unwrap();
        entries.update("a", |e| e.value = 10).await.unwrap();
        entries.delete("b", "test").await.unwrap();

        let restarted = store(&storage);
        restarted.init().await.unwrap();
        assert_eq!(restarted.get("a").await.unwrap(), Entry { value: 10 });
        assert!(!restarted.contains("b").await);
        assert_eq!(restarted.len().await, 1);
    }

    #[tokio::test]
    async fn test_remove_where() {
        let storage = MemoryStorage::new();
        let entries = store(&storage);
        for i in 0..5 {
            entries.set(&i.to_string(), Entry { value: i }).await.unwrap();
        }
        let removed = entries.remove_where(|_, e| e.value % 2 == 0, "even").await.unwrap();
        assert_eq!(removed.len(), 3);
        assert_eq!(entries.filter(|e| e.value > 0).await.len(), 2);
    }
}
