//! Signkit core library.
//!
//! The primitives two peers need to talk over an untrusted relay: key
//! agreement and envelope encryption, the JSON-RPC history ledger, the
//! expirer, the relayer with its subscription store, and the pairing
//! controller. Storage and the relay socket are injected through the
//! [`storage::KeyValueStorage`] and [`relay::RelayTransport`] traits.
//!
//! # Features
//!
//! - **Envelopes**: X25519 key agreement, ChaCha20-Poly1305 sealed payloads
//! - **Relay**: publish/subscribe with reconnect, resubscribe and deduplication
//! - **Pairing**: URI-bootstrapped topics reused across sessions
//!
//! # Example
//!
//! ```ignore
//! use signkit_lib::{Core, CoreConfig};
//! use signkit_lib::storage::MemoryStorage;
//!
//! let core = Core::new(CoreConfig::default(), Arc::new(MemoryStorage::new()), transport);
//! core.start().await?;
//!
//! let pairing = core.pairing.create().await?;
//! println!("share this: {}", pairing.uri);
//! ```

pub mod config;
pub mod constants;
pub mod crypto;
pub mod errors;
pub mod expirer;
pub mod history;
pub mod jsonrpc;
pub mod pairing;
pub mod prelude;
pub mod relay;
mod service;
pub mod storage;
pub mod uri;

/// Test utilities (in-memory relay).
///
/// This module is only available with the `test-utils` feature or in test builds.
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use config::CoreConfig;
pub use service::Core;
pub use errors::{SdkError, SignkitError, SignkitErrorCode};
pub use uri::{parse_uri, PairingUri};

/// Common result alias for signkit operations.
pub type Result<T> = std::result::Result<T, SignkitError>;

/// Current unix time in seconds.
pub fn now_secs() -> u64 {
    chrono::Utc::now().timestamp().max(0) as u64
}
