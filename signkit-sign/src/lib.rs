//! Signkit session layer.
//!
//! Proposes, settles and maintains sessions between a wallet and an app on
//! top of the pairing and relay primitives in `signkit-lib`.
//!
//! # Example
//!
//! ```ignore
//! use signkit_sign::{SignClient, SignConfig};
//! use signkit_lib::pairing::Metadata;
//!
//! let app = SignClient::init(SignConfig::new(Metadata::new("app", "https://app")), storage, transport).await?;
//! let connection = app.connect(params).await?;
//! println!("scan me: {}", connection.uri.unwrap_or_default());
//! let session = connection.approval.wait().await?;
//!
//! let signature = app
//!     .request(&session.topic, "eip155:1", "personal_sign", params, None)
//!     .await?;
//! ```

mod client;
pub mod config;
pub mod constants;
pub mod engine;
pub mod events;
pub mod types;
pub mod validation;

pub use client::SignClient;
pub use config::SignConfig;
pub use engine::{Acknowledgement, Approval, Approved, Connection, Engine};
pub use events::SignEvent;
pub use types::{
    ApproveParams, ConnectParams, EventPayload, Namespaces, PendingRequest, Proposal,
    ProposalNamespace, ProposalNamespaces, Session, SessionNamespace, SessionState,
};

pub use signkit_lib::{Result, SignkitError};
