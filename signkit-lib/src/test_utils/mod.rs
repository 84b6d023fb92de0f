//! Test utilities for signkit.
//!
//! [`MemoryRelay`] is a relay server living in the test process. Each client
//! gets its own [`MemoryTransport`], so two full clients can pair, settle
//! and exchange requests without a network.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use signkit_lib::test_utils::MemoryRelay;
//!
//! let relay = MemoryRelay::new();
//! let alice = Core::new(config.clone(), Arc::new(MemoryStorage::new()), relay.transport());
//! let bob = Core::new(config, Arc::new(MemoryStorage::new()), relay.transport());
//!
//! // Simulate the relay dropping every connection.
//! relay.disconnect_all();
//! ```

mod memory_relay;

pub use memory_relay::{MemoryRelay, MemoryTransport};
