use crate::types::{EventPayload, Namespaces, PendingRequest, Proposal, Session};

/// Everything the engine reports to its consumer.
#[derive(Clone, Debug, PartialEq)]
pub enum SignEvent {
    /// A peer proposed a session over one of our pairings.
    SessionProposal { proposal: Proposal },
    /// The proposer side finished settlement.
    SessionConnect { session: Session },
    SessionUpdate {
        id: u64,
        topic: String,
        namespaces: Namespaces,
    },
    SessionExtend { id: u64, topic: String, expiry: u64 },
    SessionPing { id: u64, topic: String },
    /// The peer deleted the session.
    SessionDelete { id: u64, topic: String },
    SessionExpire { topic: String },
    /// The next inbound request to answer. Only one is surfaced at a time.
    SessionRequest { request: PendingRequest },
    SessionRequestExpire { id: u64 },
    SessionEvent {
        id: u64,
        topic: String,
        chain_id: String,
        event: EventPayload,
    },
    ProposalExpire { id: u64 },
}
