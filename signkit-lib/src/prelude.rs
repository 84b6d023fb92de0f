//! Prelude module for convenient imports.
//!
//! ```rust,ignore
//! use signkit_lib::prelude::*;
//! ```
//!
//! ## What's Included
//!
//! - Errors: `SignkitError`, `SignkitErrorCode`, `SdkError`, `Result`
//! - Services: `Core`, `CoreConfig`
//! - Seams: `KeyValueStorage`, `RelayTransport`
//! - Pairing: `Metadata`, `Pairing`, `PairingUri`

// Error handling
pub use crate::errors::{SdkError, SignkitError, SignkitErrorCode};
pub use crate::Result;

// Services
pub use crate::{Core, CoreConfig};

// Injection seams
pub use crate::relay::{RelayTransport, TransportEvent};
pub use crate::storage::{FileStorage, KeyValueStorage, MemoryStorage};

// Pairing
pub use crate::pairing::{Metadata, Pairing};
pub use crate::uri::{parse_uri, PairingUri};

// Events
pub use crate::expirer::{ExpirerEvent, ExpirerTarget};
pub use crate::pairing::PairingEvent;
pub use crate::relay::RelayerEvent;
