use crate::relay::{PublishOptions, RelayProtocol};
use serde::{Deserialize, Serialize};

pub const WC_PAIRING_PING: &str = "wc_pairingPing";
pub const WC_PAIRING_DELETE: &str = "wc_pairingDelete";

/// Relay ttl/tag for pairing-scope messages.
pub(crate) fn pairing_rpc_opts(method: &str, response: bool) -> PublishOptions {
    match (method, response) {
        (WC_PAIRING_DELETE, false) => PublishOptions::new(24 * 60 * 60, 1000),
        (WC_PAIRING_DELETE, true) => PublishOptions::new(24 * 60 * 60, 1001),
        (WC_PAIRING_PING, false) => PublishOptions::new(30, 1002),
        (WC_PAIRING_PING, true) => PublishOptions::new(30, 1003),
        _ => PublishOptions::default(),
    }
}

/// Application metadata exchanged during pairing and settlement.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    pub name: String,
    pub description: String,
    pub url: String,
    #[serde(default)]
    pub icons: Vec<String>,
}

impl Metadata {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            ..Self::default()
        }
    }
}

/// A pre-session channel between two peers.
///
/// The symmetric key lives in the keychain under `topic`, not here.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pairing {
    pub topic: String,
    pub expiry: u64,
    pub relay: RelayProtocol,
    pub active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peer_metadata: Option<Metadata>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub methods: Option<Vec<String>>,
}

/// Result of [`PairingController::create`](super::PairingController::create).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CreatedPairing {
    pub topic: String,
    pub uri: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PairingEvent {
    Ping { topic: String, id: u64 },
    Delete { topic: String },
    Expire { topic: String },
}
