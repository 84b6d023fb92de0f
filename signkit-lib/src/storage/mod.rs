//! Key-value persistence consumed by every stateful component.
//!
//! The host application supplies a [`KeyValueStorage`]; two implementations
//! ship with the crate:
//!
//! - [`MemoryStorage`] keeps everything in process. Clones share state, which
//!   makes it easy to simulate a restart in tests.
//! - [`FileStorage`] writes one JSON document per key into a directory.
//!
//! [`PersistedStore`] layers a typed, keyed map on top of any backend and is
//! what the pairing, proposal, session and pending-request stores are built on.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use signkit_lib::storage::{KeyValueStorage, MemoryStorage, PersistedStore};
//!
//! let storage: Arc<dyn KeyValueStorage> = Arc::new(MemoryStorage::new());
//! let pairings: PersistedStore<Pairing> = PersistedStore::new(storage, "wc@2:core//pairing", "pairing");
//! pairings.init().await?;
//! pairings.set(&pairing.topic, pairing.clone()).await?;
//! ```

mod file;
mod memory;
mod store;

pub use file::FileStorage;
pub use memory::MemoryStorage;
pub use store::PersistedStore;

use crate::Result;
use async_trait::async_trait;
use serde_json::Value;

/// Async key-value backend.
///
/// Implementations must make a completed `set_item` visible to every later
/// `get_item`, including after a process restart for durable backends.
#[async_trait]
pub trait KeyValueStorage: Send + Sync {
    /// Read a value, `None` if the key was never written or was removed.
    async fn get_item(&self, key: &str) -> Result<Option<Value>>;

    /// Write a value, replacing any previous one.
    async fn set_item(&self, key: &str, value: Value) -> Result<()>;

    /// Remove a value. Removing a missing key is not an error.
    async fn remove_item(&self, key: &str) -> Result<()>;

    /// List every stored key.
    async fn get_keys(&self) -> Result<Vec<String>>;
}
