//! Session-layer data model and wire parameters.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use signkit_lib::pairing::Metadata;
use signkit_lib::relay::RelayProtocol;
use std::collections::{BTreeMap, BTreeSet};

/// What a proposer asks for under one namespace key.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProposalNamespace {
    #[serde(default)]
    pub chains: Vec<String>,
    pub methods: Vec<String>,
    pub events: Vec<String>,
}

/// What an approver grants under one namespace key.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionNamespace {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chains: Option<Vec<String>>,
    pub accounts: Vec<String>,
    pub methods: Vec<String>,
    pub events: Vec<String>,
}

impl SessionNamespace {
    /// Every chain covered by this namespace, explicit or implied by an
    /// account id.
    pub fn chain_ids(&self) -> BTreeSet<String> {
        let mut chains: BTreeSet<String> = self.chains.iter().flatten().cloned().collect();
        chains.extend(self.accounts.iter().filter_map(|a| account_chain(a)));
        chains
    }
}

/// `namespace:reference` of an account id `namespace:reference:address`.
pub fn account_chain(account: &str) -> Option<String> {
    let mut parts = account.splitn(3, ':');
    let namespace = parts.next()?;
    let reference = parts.next()?;
    parts.next()?;
    Some(format!("{}:{}", namespace, reference))
}

pub type ProposalNamespaces = BTreeMap<String, ProposalNamespace>;
pub type Namespaces = BTreeMap<String, SessionNamespace>;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub public_key: String,
    pub metadata: Metadata,
}

/// A session proposal, stored on both sides until approved, rejected or
/// expired. `id` is the JSON-RPC id of the `wc_sessionPropose` request.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Proposal {
    pub id: u64,
    pub expiry: u64,
    pub relays: Vec<RelayProtocol>,
    pub proposer: Participant,
    pub required_namespaces: ProposalNamespaces,
    #[serde(default)]
    pub optional_namespaces: ProposalNamespaces,
    pub pairing_topic: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_properties: Option<BTreeMap<String, String>>,
}

/// A locally applied change the peer has not acknowledged yet.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum ProvisionalChange {
    Namespaces { previous: Namespaces },
    Expiry { previous: u64 },
}

impl ProvisionalChange {
    pub(crate) fn same_kind(&self, other: &ProvisionalChange) -> bool {
        matches!(
            (self, other),
            (Self::Namespaces { .. }, Self::Namespaces { .. })
                | (Self::Expiry { .. }, Self::Expiry { .. })
        )
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Provisional {
    pub request_id: u64,
    pub change: ProvisionalChange,
}

/// Settlement state. A session becomes usable once the peer acknowledged
/// the settle request; acknowledged sessions track their in-flight
/// controller changes so a peer rejection can be rolled back.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum SessionState {
    Unacknowledged,
    Acknowledged {
        #[serde(default)]
        provisional: Vec<Provisional>,
    },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub topic: String,
    pub pairing_topic: String,
    pub relay: RelayProtocol,
    pub expiry: u64,
    pub namespaces: Namespaces,
    pub required_namespaces: ProposalNamespaces,
    #[serde(default)]
    pub optional_namespaces: ProposalNamespaces,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_properties: Option<BTreeMap<String, String>>,
    /// Public key of the side allowed to update and extend.
    pub controller: String,
    #[serde(rename = "self")]
    pub self_: Participant,
    pub peer: Participant,
    pub state: SessionState,
}

impl Session {
    pub fn is_acknowledged(&self) -> bool {
        matches!(self.state, SessionState::Acknowledged { .. })
    }

    /// Whether the local side is the controller.
    pub fn is_controller(&self) -> bool {
        self.controller == self.self_.public_key
    }

    /// Whether the peer is the controller.
    pub fn peer_is_controller(&self) -> bool {
        self.controller == self.peer.public_key
    }

    pub fn chain_ids(&self) -> BTreeSet<String> {
        self.namespaces
            .values()
            .flat_map(SessionNamespace::chain_ids)
            .collect()
    }

    pub fn provisional(&self) -> &[Provisional] {
        match &self.state {
            SessionState::Acknowledged { provisional } => provisional,
            SessionState::Unacknowledged => &[],
        }
    }

    /// Apply a controller change locally, remembering what it replaced.
    pub(crate) fn apply_provisional(&mut self, request_id: u64, change: Change) {
        let previous = match change {
            Change::Namespaces(namespaces) => ProvisionalChange::Namespaces {
                previous: std::mem::replace(&mut self.namespaces, namespaces),
            },
            Change::Expiry(expiry) => ProvisionalChange::Expiry {
                previous: std::mem::replace(&mut self.expiry, expiry),
            },
        };
        if let SessionState::Acknowledged { provisional } = &mut self.state {
            provisional.push(Provisional {
                request_id,
                change: previous,
            });
        }
    }

    /// The peer accepted change `request_id`. Older pending changes of the
    /// same kind can no longer be rolled back.
    pub(crate) fn confirm(&mut self, request_id: u64) -> bool {
        let SessionState::Acknowledged { provisional } = &mut self.state else {
            return false;
        };
        let Some(kind) = provisional
            .iter()
            .find(|p| p.request_id == request_id)
            .map(|p| p.change.clone())
        else {
            return false;
        };
        provisional.retain(|p| !(p.change.same_kind(&kind) && p.request_id <= request_id));
        true
    }

    /// The peer refused change `request_id`: restore what it replaced.
    ///
    /// If a newer change of the same kind is still pending, that one now
    /// replaces the restored value instead. Returns false when there was
    /// nothing to roll back.
    pub(crate) fn roll_back(&mut self, request_id: u64) -> bool {
        let SessionState::Acknowledged { provisional } = &mut self.state else {
            return false;
        };
        let Some(index) = provisional.iter().position(|p| p.request_id == request_id) else {
            return false;
        };
        let refused = provisional.remove(index);
        if let Some(newer) = provisional[index..]
            .iter_mut()
            .find(|p| p.change.same_kind(&refused.change))
        {
            newer.change = refused.change;
            return true;
        }
        match refused.change {
            ProvisionalChange::Namespaces { previous } => self.namespaces = previous,
            ProvisionalChange::Expiry { previous } => self.expiry = previous,
        }
        true
    }
}

/// A controller change about to be applied.
#[derive(Clone, Debug)]
pub(crate) enum Change {
    Namespaces(Namespaces),
    Expiry(u64),
}

/// `{method, params}` carried by `wc_sessionRequest`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestPayload {
    pub method: String,
    pub params: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiry_timestamp: Option<u64>,
}

/// `{name, data}` carried by `wc_sessionEvent`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EventPayload {
    pub name: String,
    #[serde(default)]
    pub data: Value,
}

/// An inbound session request awaiting a local answer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingRequest {
    pub id: u64,
    pub topic: String,
    pub request: RequestPayload,
    pub chain_id: String,
    pub expiry: u64,
}

// Wire parameters.

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionProposeParams {
    pub relays: Vec<RelayProtocol>,
    pub proposer: Participant,
    pub required_namespaces: ProposalNamespaces,
    #[serde(default)]
    pub optional_namespaces: ProposalNamespaces,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_properties: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiry_timestamp: Option<u64>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionProposeResponse {
    pub relay: RelayProtocol,
    pub responder_public_key: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSettleParams {
    pub relay: RelayProtocol,
    pub controller: Participant,
    pub namespaces: Namespaces,
    #[serde(default)]
    pub required_namespaces: ProposalNamespaces,
    #[serde(default)]
    pub optional_namespaces: ProposalNamespaces,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_properties: Option<BTreeMap<String, String>>,
    pub expiry: u64,
    pub pairing_topic: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionUpdateParams {
    pub namespaces: Namespaces,
}

/// The sender's new expiry travels along so both sides agree on it; a
/// receiver that gets none computes its own.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SessionExtendParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiry: Option<u64>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRequestParams {
    pub request: RequestPayload,
    pub chain_id: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionEventParams {
    pub event: EventPayload,
    pub chain_id: String,
}

// Caller-facing parameters.

/// Arguments to [`crate::SignClient::connect`].
#[derive(Clone, Debug, Default)]
pub struct ConnectParams {
    pub required_namespaces: ProposalNamespaces,
    pub optional_namespaces: ProposalNamespaces,
    /// Reuse this pairing instead of creating a fresh one.
    pub pairing_topic: Option<String>,
    pub session_properties: Option<BTreeMap<String, String>>,
}

/// Arguments to [`crate::SignClient::approve`].
#[derive(Clone, Debug)]
pub struct ApproveParams {
    pub id: u64,
    pub namespaces: Namespaces,
    pub session_properties: Option<BTreeMap<String, String>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_chain_ids_include_account_chains() {
        let ns = SessionNamespace {
            chains: Some(vec!["eip155:10".into()]),
            accounts: vec!["eip155:1:0xab".into(), "eip155:137:0xab".into()],
            methods: vec![],
            events: vec![],
        };
        let chains: Vec<String> = ns.chain_ids().into_iter().collect();
        assert_eq!(chains, vec!["eip155:1", "eip155:10", "eip155:137"]);
        assert_eq!(account_chain("eip155:1"), None);
    }

    #[test]
    fn test_session_state_wire_shape() {
        let state = SessionState::Acknowledged {
            provisional: vec![Provisional {
                request_id: 7,
                change: ProvisionalChange::Expiry { previous: 10 },
            }],
        };
        let value = serde_json::to_value(&state).unwrap();
        assert_eq!(value["status"], "acknowledged");
        assert_eq!(value["provisional"][0]["change"]["kind"], "expiry");
        assert_eq!(serde_json::from_value::<SessionState>(value).unwrap(), state);
    }

    fn acknowledged_session(expiry: u64) -> Session {
        let participant = Participant {
            public_key: "aa".into(),
            metadata: Metadata::new("x", "https://x"),
        };
        Session {
            topic: "t".into(),
            pairing_topic: "p".into(),
            relay: RelayProtocol::default(),
            expiry,
            namespaces: Namespaces::new(),
            required_namespaces: ProposalNamespaces::new(),
            optional_namespaces: ProposalNamespaces::new(),
            session_properties: None,
            controller: "aa".into(),
            self_: participant.clone(),
            peer: participant,
            state: SessionState::Acknowledged {
                provisional: Vec::new(),
            },
        }
    }

    #[test]
    fn test_roll_back_restores_previous_expiry() {
        let mut session = acknowledged_session(100);
        session.apply_provisional(1, Change::Expiry(200));
        assert_eq!(session.expiry, 200);
        assert!(session.roll_back(1));
        assert_eq!(session.expiry, 100);
        assert!(session.provisional().is_empty());
        assert!(!session.roll_back(1));
    }

    #[test]
    fn test_roll_back_under_newer_change_keeps_newer_value() {
        let mut session = acknowledged_session(100);
        session.apply_provisional(1, Change::Expiry(200));
        session.apply_provisional(2, Change::Expiry(300));
        assert!(session.roll_back(1));
        assert_eq!(session.expiry, 300);
        // Refusing the newer one now restores the original.
        assert!(session.roll_back(2));
        assert_eq!(session.expiry, 100);
    }

    #[test]
    fn test_confirm_supersedes_older_changes_of_same_kind() {
        let mut session = acknowledged_session(100);
        session.apply_provisional(1, Change::Expiry(200));
        session.apply_provisional(2, Change::Namespaces(Namespaces::new()));
        session.apply_provisional(3, Change::Expiry(300));
        assert!(session.confirm(3));
        let left: Vec<u64> = session.provisional().iter().map(|p| p.request_id).collect();
        assert_eq!(left, vec![2]);
        // A late refusal of 1 has nothing left to undo.
        assert!(!session.roll_back(1));
        assert_eq!(session.expiry, 300);
    }

    #[test]
    fn test_settle_params_camel_case() {
        let params: SessionSettleParams = serde_json::from_value(json!({
            "relay": {"protocol": "irn"},
            "controller": {"publicKey": "ab", "metadata": {"name": "w", "description": "", "url": "https://w", "icons": []}},
            "namespaces": {"eip155": {"accounts": ["eip155:1:0x1"], "methods": ["eth_sign"], "events": []}},
            "expiry": 99,
            "pairingTopic": "t"
        }))
        .unwrap();
        assert_eq!(params.controller.public_key, "ab");
        assert!(params.required_namespaces.is_empty());
    }
}
