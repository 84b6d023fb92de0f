//! Relay plumbing: the transport seam, the subscription store and the
//! relayer that ties them to crypto and history.
//!
//! The relay speaks JSON-RPC itself. Frames on the transport are plain
//! [`JsonRpcPayload`](crate::jsonrpc::JsonRpcPayload)s using the `irn_*`
//! methods below; the encrypted peer payloads travel inside them as opaque
//! base64 strings.

mod relayer;
mod subscriber;
mod transport;

pub use relayer::{PublishOptions, Relayer, RelayerEvent};
pub use subscriber::{Subscription, SubscriptionStore};
pub use transport::{RelayTransport, TransportEvent};

use crate::config::RELAY_PROTOCOL;
use serde::{Deserialize, Serialize};

pub const IRN_PUBLISH: &str = "irn_publish";
pub const IRN_SUBSCRIBE: &str = "irn_subscribe";
pub const IRN_UNSUBSCRIBE: &str = "irn_unsubscribe";
pub const IRN_SUBSCRIPTION: &str = "irn_subscription";

/// Relay protocol descriptor carried in URIs, proposals and sessions.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayProtocol {
    pub protocol: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
}

impl Default for RelayProtocol {
    fn default() -> Self {
        Self {
            protocol: RELAY_PROTOCOL.to_string(),
            data: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PublishParams {
    pub topic: String,
    pub message: String,
    pub ttl: u64,
    pub tag: u32,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SubscribeParams {
    pub topic: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UnsubscribeParams {
    pub topic: String,
    pub id: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionParams {
    pub id: String,
    pub data: SubscriptionData,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionData {
    pub topic: String,
    pub message: String,
    pub published_at: u64,
    #[serde(default)]
    pub tag: u32,
}
