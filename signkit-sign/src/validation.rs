//! Namespace, chain and request validation.
//!
//! Outbound calls turn a [`ValidationIssue`] into
//! [`SignkitError::ValidationFailed`] before any I/O. Inbound handlers turn it
//! into a JSON-RPC error object for the peer.

use crate::types::{Namespaces, ProposalNamespaces, Session, SessionNamespace};
use signkit_lib::constants::{FIVE_MINUTES, SEVEN_DAYS};
use signkit_lib::jsonrpc::JsonRpcError;
use signkit_lib::{SdkError, SignkitError};
use std::collections::BTreeSet;
use std::fmt;

/// A failed check: the protocol error kind plus what exactly was wrong.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ValidationIssue {
    pub kind: SdkError,
    pub reason: String,
}

impl ValidationIssue {
    pub fn new(kind: SdkError, reason: impl Into<String>) -> Self {
        Self {
            kind,
            reason: reason.into(),
        }
    }

    pub fn to_rpc_error(&self) -> JsonRpcError {
        self.kind.with_context(&self.reason)
    }
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind.message(), self.reason)
    }
}

impl From<ValidationIssue> for SignkitError {
    fn from(issue: ValidationIssue) -> Self {
        SignkitError::ValidationFailed(issue.to_string())
    }
}

pub type Validation = std::result::Result<(), ValidationIssue>;

/// `namespace:reference`, both parts non-empty.
pub fn is_valid_chain_id(chain: &str) -> bool {
    match chain.split_once(':') {
        Some((namespace, reference)) => {
            !namespace.is_empty() && !reference.is_empty() && !reference.contains(':')
        }
        None => false,
    }
}

/// `namespace:reference:address`, every part non-empty.
pub fn is_valid_account_id(account: &str) -> bool {
    let parts: Vec<&str> = account.split(':').collect();
    parts.len() == 3 && parts.iter().all(|p| !p.is_empty())
}

fn namespace_of(chain: &str) -> &str {
    chain.split(':').next().unwrap_or_default()
}

fn check_names(values: &[String], kind: SdkError, what: &str, key: &str) -> Validation {
    let mut seen = BTreeSet::new();
    for value in values {
        if value.is_empty() {
            return Err(ValidationIssue::new(kind, format!("empty {} in {}", what, key)));
        }
        if !seen.insert(value) {
            return Err(ValidationIssue::new(
                kind,
                format!("duplicate {} {} in {}", what, value, key),
            ));
        }
    }
    Ok(())
}

/// Required or optional namespaces of a proposal.
///
/// A key is either a bare namespace (`eip155`) carrying its chains, or a
/// chain id (`eip155:1`) standing for itself.
pub fn validate_proposal_namespaces(namespaces: &ProposalNamespaces) -> Validation {
    for (key, ns) in namespaces {
        if key.is_empty() {
            return Err(ValidationIssue::new(
                SdkError::UnsupportedNamespaceKey,
                "empty namespace key",
            ));
        }
        if key.contains(':') {
            if !is_valid_chain_id(key) {
                return Err(ValidationIssue::new(
                    SdkError::UnsupportedNamespaceKey,
                    format!("invalid chain key {}", key),
                ));
            }
        } else if ns.chains.is_empty() {
            return Err(ValidationIssue::new(
                SdkError::UnsupportedChains,
                format!("no chains for {}", key),
            ));
        }
        for chain in &ns.chains {
            if !is_valid_chain_id(chain) || namespace_of(chain) != namespace_of(key) {
                return Err(ValidationIssue::new(
                    SdkError::UnsupportedChains,
                    format!("invalid chain {} in {}", chain, key),
                ));
            }
        }
        check_names(&ns.chains, SdkError::UnsupportedChains, "chain", key)?;
        check_names(&ns.methods, SdkError::UnsupportedMethods, "method", key)?;
        check_names(&ns.events, SdkError::UnsupportedEvents, "event", key)?;
    }
    Ok(())
}

/// Namespaces granted by an approver.
pub fn validate_session_namespaces(namespaces: &Namespaces) -> Validation {
    if namespaces.is_empty() {
        return Err(ValidationIssue::new(
            SdkError::UnsupportedNamespaceKey,
            "no namespaces",
        ));
    }
    for (key, ns) in namespaces {
        if key.is_empty() {
            return Err(ValidationIssue::new(
                SdkError::UnsupportedNamespaceKey,
                "empty namespace key",
            ));
        }
        if ns.accounts.is_empty() {
            return Err(ValidationIssue::new(
                SdkError::UnsupportedAccounts,
                format!("no accounts for {}", key),
            ));
        }
        for account in &ns.accounts {
            if !is_valid_account_id(account) || namespace_of(account) != namespace_of(key) {
                return Err(ValidationIssue::new(
                    SdkError::UnsupportedAccounts,
                    format!("invalid account {} in {}", account, key),
                ));
            }
        }
        for chain in ns.chains.iter().flatten() {
            if !is_valid_chain_id(chain) || namespace_of(chain) != namespace_of(key) {
                return Err(ValidationIssue::new(
                    SdkError::UnsupportedChains,
                    format!("invalid chain {} in {}", chain, key),
                ));
            }
        }
        check_names(&ns.accounts, SdkError::UnsupportedAccounts, "account", key)?;
        check_names(&ns.methods, SdkError::UnsupportedMethods, "method", key)?;
        check_names(&ns.events, SdkError::UnsupportedEvents, "event", key)?;
    }
    Ok(())
}

/// The granted namespace covering a required key. A chain-id key may be
/// granted either under itself or under its bare namespace.
fn granted_for<'a>(namespaces: &'a Namespaces, key: &str) -> Option<&'a SessionNamespace> {
    namespaces
        .get(key)
        .or_else(|| namespaces.get(namespace_of(key)))
}

/// Every required chain, method and event must be granted.
pub fn is_conforming_namespaces(required: &ProposalNamespaces, namespaces: &Namespaces) -> Validation {
    for (key, req) in required {
        let Some(granted) = granted_for(namespaces, key) else {
            return Err(ValidationIssue::new(
                SdkError::UnsupportedNamespaceKey,
                format!("missing {}", key),
            ));
        };
        let chains = granted.chain_ids();
        let required_chains: Vec<&str> = if key.contains(':') {
            vec![key.as_str()]
        } else {
            req.chains.iter().map(String::as_str).collect()
        };
        if let Some(missing) = required_chains.iter().find(|c| !chains.contains(**c)) {
            return Err(ValidationIssue::new(
                SdkError::UnsupportedChains,
                format!("missing chain {} in {}", missing, key),
            ));
        }
        if let Some(missing) = req.methods.iter().find(|m| !granted.methods.contains(m)) {
            return Err(ValidationIssue::new(
                SdkError::UnsupportedMethods,
                format!("missing method {} in {}", missing, key),
            ));
        }
        if let Some(missing) = req.events.iter().find(|e| !granted.events.contains(e)) {
            return Err(ValidationIssue::new(
                SdkError::UnsupportedEvents,
                format!("missing event {} in {}", missing, key),
            ));
        }
    }
    Ok(())
}

fn namespaces_for_chain<'a>(
    session: &'a Session,
    chain_id: &'a str,
) -> impl Iterator<Item = &'a SessionNamespace> + 'a {
    session
        .namespaces
        .values()
        .filter(move |ns| ns.chain_ids().contains(chain_id))
}

/// `method` may be requested on `chain_id` within `session`.
pub fn is_valid_request(session: &Session, chain_id: &str, method: &str) -> Validation {
    if !is_valid_chain_id(chain_id) || !session.chain_ids().contains(chain_id) {
        return Err(ValidationIssue::new(
            SdkError::UnsupportedChains,
            chain_id.to_string(),
        ));
    }
    if method.is_empty() {
        return Err(ValidationIssue::new(SdkError::InvalidMethod, "empty method"));
    }
    if !namespaces_for_chain(session, chain_id).any(|ns| ns.methods.iter().any(|m| m == method)) {
        return Err(ValidationIssue::new(
            SdkError::UnauthorizedMethod,
            format!("{} on {}", method, chain_id),
        ));
    }
    Ok(())
}

/// `event` may be emitted on `chain_id` within `session`.
pub fn is_valid_event(session: &Session, chain_id: &str, event: &str) -> Validation {
    if !is_valid_chain_id(chain_id) || !session.chain_ids().contains(chain_id) {
        return Err(ValidationIssue::new(
            SdkError::UnsupportedChains,
            chain_id.to_string(),
        ));
    }
    if event.is_empty() {
        return Err(ValidationIssue::new(SdkError::InvalidEvent, "empty event"));
    }
    if !namespaces_for_chain(session, chain_id).any(|ns| ns.events.iter().any(|e| e == event)) {
        return Err(ValidationIssue::new(
            SdkError::UnauthorizedEvent,
            format!("{} on {}", event, chain_id),
        ));
    }
    Ok(())
}

/// Request lifetime in seconds must lie within five minutes and seven days.
pub fn is_valid_request_expiry(ttl: u64) -> Validation {
    if (FIVE_MINUTES..=SEVEN_DAYS).contains(&ttl) {
        Ok(())
    } else {
        Err(ValidationIssue::new(
            SdkError::InvalidMethod,
            format!("request expiry {}s outside {}..={}", ttl, FIVE_MINUTES, SEVEN_DAYS),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Participant, ProposalNamespace, SessionState};
    use signkit_lib::pairing::Metadata;
    use signkit_lib::relay::RelayProtocol;

    fn required() -> ProposalNamespaces {
        ProposalNamespaces::from([(
            "eip155".to_string(),
            ProposalNamespace {
                chains: vec!["eip155:1".into()],
                methods: vec!["personal_sign".into()],
                events: vec!["accountsChanged".into()],
            },
        )])
    }

    fn granted(methods: &[&str]) -> Namespaces {
        Namespaces::from([(
            "eip155".to_string(),
            SessionNamespace {
                chains: None,
                accounts: vec!["eip155:1:0xabc".into()],
                methods: methods.iter().map(|m| m.to_string()).collect(),
                events: vec!["accountsChanged".into()],
            },
        )])
    }

    fn session(namespaces: Namespaces) -> Session {
        let participant = Participant {
            public_key: "aa".into(),
            metadata: Metadata::new("x", "https://x"),
        };
        Session {
            topic: "t".into(),
            pairing_topic: "p".into(),
            relay: RelayProtocol::default(),
            expiry: 0,
            namespaces,
            required_namespaces: required(),
            optional_namespaces: Default::default(),
            session_properties: None,
            controller: "aa".into(),
            self_: participant.clone(),
            peer: participant,
            state: SessionState::Unacknowledged,
        }
    }

    #[test]
    fn test_chain_and_account_ids() {
        assert!(is_valid_chain_id("eip155:1"));
        assert!(!is_valid_chain_id("eip155"));
        assert!(!is_valid_chain_id(":1"));
        assert!(!is_valid_chain_id("eip155:1:0x"));
        assert!(is_valid_account_id("eip155:1:0xabc"));
        assert!(!is_valid_account_id("eip155:1"));
        assert!(!is_valid_account_id("eip155::0xabc"));
    }

    #[test]
    fn test_proposal_namespaces() {
        assert!(validate_proposal_namespaces(&required()).is_ok());

        let mut bad = required();
        bad.get_mut("eip155").unwrap().chains = vec!["cosmos:hub".into()];
        assert_eq!(
            validate_proposal_namespaces(&bad).unwrap_err().kind,
            SdkError::UnsupportedChains
        );

        let mut dup = required();
        dup.get_mut("eip155").unwrap().methods = vec!["a".into(), "a".into()];
        assert_eq!(
            validate_proposal_namespaces(&dup).unwrap_err().kind,
            SdkError::UnsupportedMethods
        );

        let chain_key = ProposalNamespaces::from([(
            "eip155:1".to_string(),
            ProposalNamespace {
                chains: vec![],
                methods: vec!["eth_sign".into()],
                events: vec![],
            },
        )]);
        assert!(validate_proposal_namespaces(&chain_key).is_ok());
    }

    #[test]
    fn test_conformance() {
        let superset = granted(&["personal_sign", "eth_sendTransaction"]);
        assert!(validate_session_namespaces(&superset).is_ok());
        assert!(is_conforming_namespaces(&required(), &superset).is_ok());

        let missing = granted(&["eth_sendTransaction"]);
        let issue = is_conforming_namespaces(&required(), &missing).unwrap_err();
        assert_eq!(issue.kind, SdkError::UnsupportedMethods);
        assert!(issue.to_rpc_error().message.contains("personal_sign"));

        let err = is_conforming_namespaces(&required(), &Namespaces::new()).unwrap_err();
        assert_eq!(err.kind, SdkError::UnsupportedNamespaceKey);
        assert!(matches!(SignkitError::from(err), SignkitError::ValidationFailed(_)));
    }

    #[test]
    fn test_request_and_event_authorization() {
        let s = session(granted(&["personal_sign"]));
        assert!(is_valid_request(&s, "eip155:1", "personal_sign").is_ok());
        assert_eq!(
            is_valid_request(&s, "eip155:1", "eth_sign").unwrap_err().kind,
            SdkError::UnauthorizedMethod
        );
        assert_eq!(
            is_valid_request(&s, "eip155:5", "personal_sign").unwrap_err().kind,
            SdkError::UnsupportedChains
        );
        assert!(is_valid_event(&s, "eip155:1", "accountsChanged").is_ok());
        assert_eq!(
            is_valid_event(&s, "eip155:1", "chainChanged").unwrap_err().kind,
            SdkError::UnauthorizedEvent
        );
    }

    #[test]
    fn test_request_expiry_bounds() {
        assert!(is_valid_request_expiry(FIVE_MINUTES).is_ok());
        assert!(is_valid_request_expiry(SEVEN_DAYS).is_ok());
        assert!(is_valid_request_expiry(FIVE_MINUTES - 1).is_err());
        assert!(is_valid_request_expiry(SEVEN_DAYS + 1).is_err());
    }
}
