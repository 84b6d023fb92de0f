//! Handles returned to callers that wait for the peer.

use crate::types::Session;
use signkit_lib::jsonrpc::wait_for_response;
use signkit_lib::{Result, SignkitError};
use std::time::Duration;
use tokio::sync::oneshot;

type Outcome = std::result::Result<Session, SignkitError>;

/// Resolves once the peer settles the proposed session.
#[derive(Debug)]
pub struct Approval {
    proposal_id: u64,
    rx: oneshot::Receiver<Outcome>,
    timeout: Duration,
}

impl Approval {
    pub(crate) fn new(proposal_id: u64, rx: oneshot::Receiver<Outcome>, timeout: Duration) -> Self {
        Self {
            proposal_id,
            rx,
            timeout,
        }
    }

    pub fn proposal_id(&self) -> u64 {
        self.proposal_id
    }

    /// The settled session, `ProposalExpired` if the proposal lapsed first,
    /// or `Rejected` with the peer's reason.
    pub async fn wait(self) -> Result<Session> {
        match tokio::time::timeout(self.timeout, self.rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(SignkitError::Internal(format!(
                "approval for proposal {} dropped",
                self.proposal_id
            ))),
            Err(_) => Err(SignkitError::ProposalExpired),
        }
    }
}

/// Resolves once the peer acknowledges a settlement, update or extension.
#[derive(Debug)]
pub struct Acknowledgement {
    topic: String,
    operation: &'static str,
    rx: oneshot::Receiver<Outcome>,
    timeout: Duration,
}

impl Acknowledgement {
    pub(crate) fn new(
        topic: &str,
        operation: &'static str,
        rx: oneshot::Receiver<Outcome>,
        timeout: Duration,
    ) -> Self {
        Self {
            topic: topic.to_string(),
            operation,
            rx,
            timeout,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// The session as it stands after the peer's acknowledgement.
    pub async fn wait(self) -> Result<Session> {
        wait_for_response(self.rx, self.timeout, self.operation).await
    }
}
