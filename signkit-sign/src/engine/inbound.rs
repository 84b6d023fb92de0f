//! Handlers for peer messages and expirations.
//!
//! Malformed or unauthorized peer requests are answered with a JSON-RPC
//! error and logged; they never fail the engine.

use super::{Engine, PendingSettle};
use crate::constants::{
    rpc_opts, WC_SESSION_DELETE, WC_SESSION_EVENT, WC_SESSION_EXTEND, WC_SESSION_PING,
    WC_SESSION_PROPOSE, WC_SESSION_REQUEST, WC_SESSION_SETTLE, WC_SESSION_UPDATE,
};
use crate::events::SignEvent;
use crate::types::{
    Participant, PendingRequest, Proposal, Session, SessionEventParams, SessionExtendParams,
    SessionProposeParams, SessionProposeResponse, SessionRequestParams, SessionSettleParams,
    SessionState, SessionUpdateParams,
};
use crate::validation::{
    is_conforming_namespaces, is_valid_event, is_valid_request, validate_proposal_namespaces,
    validate_session_namespaces, ValidationIssue,
};
use serde::de::DeserializeOwned;
use serde_json::json;
use signkit_lib::constants::{FIVE_MINUTES, SEVEN_DAYS};
use signkit_lib::expirer::ExpirerTarget;
use signkit_lib::jsonrpc::{JsonRpcRequest, JsonRpcResponse};
use signkit_lib::{now_secs, Result, SdkError, SignkitError};

/// Clock skew tolerated on a peer-supplied extend expiry.
const EXTEND_TOLERANCE: u64 = 60;

fn parse_params<T: DeserializeOwned>(
    request: &JsonRpcRequest,
    kind: SdkError,
) -> std::result::Result<T, ValidationIssue> {
    serde_json::from_value(request.params.clone())
        .map_err(|e| ValidationIssue::new(kind, format!("malformed params: {}", e)))
}

impl Engine {
    pub(super) async fn on_request(&self, topic: &str, request: JsonRpcRequest) {
        let method = request.method.clone();
        let outcome = match method.as_str() {
            WC_SESSION_PROPOSE => self.on_session_propose(topic, request).await,
            WC_SESSION_SETTLE => self.on_session_settle(topic, request).await,
            WC_SESSION_UPDATE => self.on_session_update(topic, request).await,
            WC_SESSION_EXTEND => self.on_session_extend(topic, request).await,
            WC_SESSION_PING => self.on_session_ping(topic, request).await,
            WC_SESSION_DELETE => self.on_session_delete(topic, request).await,
            WC_SESSION_REQUEST => self.on_session_request(topic, request).await,
            WC_SESSION_EVENT => self.on_session_event(topic, request).await,
            _ => self.on_unknown_method(topic, request).await,
        };
        if let Err(e) = outcome {
            tracing::warn!(topic, method, error = %e, "failed to handle inbound request");
        }
    }

    /// Responses are routed by the method of the request they answer.
    pub(super) async fn on_response(&self, topic: &str, response: JsonRpcResponse) {
        let Ok(record) = self.core.history.get(topic, response.id()).await else {
            return;
        };
        let method = record.request.method;
        let outcome = match method.as_str() {
            WC_SESSION_PROPOSE => self.on_propose_response(response).await,
            WC_SESSION_SETTLE => self.on_settle_response(topic, response).await,
            WC_SESSION_UPDATE | WC_SESSION_EXTEND => self.on_change_response(topic, response).await,
            WC_SESSION_REQUEST | WC_SESSION_PING => {
                self.waiters.resolve(&response);
                Ok(())
            }
            _ => Ok(()),
        };
        if let Err(e) = outcome {
            tracing::warn!(topic, method, error = %e, "failed to handle response");
        }
    }

    pub(super) async fn on_expired(&self, target: ExpirerTarget) {
        let outcome = match &target {
            ExpirerTarget::Topic(topic) => self.on_topic_expired(topic).await,
            ExpirerTarget::Id(id) => self.on_id_expired(*id).await,
        };
        if let Err(e) = outcome {
            tracing::warn!(%target, error = %e, "failed to clean up expired target");
        }
    }

    async fn reply(&self, topic: &str, method: &str, response: JsonRpcResponse) -> Result<()> {
        self.core
            .relayer
            .publish(topic, &response.into(), rpc_opts(method, true))
            .await
    }

    async fn reply_ok(&self, topic: &str, method: &str, id: u64) -> Result<()> {
        self.reply(topic, method, JsonRpcResponse::result(id, json!(true)))
            .await
    }

    /// Refuse a session message for a topic we hold no session for. A
    /// method the pairing controller refused has already been answered.
    async fn reply_unknown_session(&self, topic: &str, method: &str, id: u64) -> Result<()> {
        if self.core.pairing.contains(topic).await
            && !self.core.pairing.is_method_allowed(topic, method).await
        {
            tracing::debug!(topic, method, id, "session message refused by pairing");
            return Ok(());
        }
        let issue = ValidationIssue::new(SdkError::NoMatchingKey, format!("session {}", topic));
        self.reply_issue(topic, method, id, issue).await
    }

    async fn reply_issue(
        &self,
        topic: &str,
        method: &str,
        id: u64,
        issue: ValidationIssue,
    ) -> Result<()> {
        tracing::warn!(topic, method, id, %issue, "refusing inbound request");
        self.reply(topic, method, JsonRpcResponse::error(id, issue.to_rpc_error()))
            .await
    }

    async fn on_session_propose(&self, topic: &str, request: JsonRpcRequest) -> Result<()> {
        if !self.core.pairing.contains(topic).await {
            tracing::debug!(topic, "proposal outside a known pairing");
            return Ok(());
        }
        let id = request.id;
        let params: SessionProposeParams = match parse_params(&request, SdkError::InvalidMethod)
            .and_then(|p: SessionProposeParams| {
                validate_proposal_namespaces(&p.required_namespaces)?;
                validate_proposal_namespaces(&p.optional_namespaces)?;
                Ok(p)
            }) {
            Ok(params) => params,
            Err(issue) => return self.reply_issue(topic, WC_SESSION_PROPOSE, id, issue).await,
        };

        let now = now_secs();
        let expiry = params
            .expiry_timestamp
            .unwrap_or(now + FIVE_MINUTES)
            .min(now + FIVE_MINUTES);
        if expiry <= now {
            let issue = ValidationIssue::new(SdkError::Expired, "proposal");
            return self.reply_issue(topic, WC_SESSION_PROPOSE, id, issue).await;
        }
        let proposal = Proposal {
            id,
            expiry,
            relays: params.relays,
            proposer: params.proposer,
            required_namespaces: params.required_namespaces,
            optional_namespaces: params.optional_namespaces,
            pairing_topic: topic.to_string(),
            session_properties: params.session_properties,
        };
        self.proposals.set(&id.to_string(), proposal.clone()).await?;
        self.core.expirer.set(ExpirerTarget::Id(id), expiry).await?;
        tracing::info!(id, topic, "session proposal received");
        self.emit_event(SignEvent::SessionProposal { proposal });
        Ok(())
    }

    async fn on_propose_response(&self, response: JsonRpcResponse) -> Result<()> {
        let id = response.id();
        let Some(proposal) = self.proposals.get_optional(&id.to_string()).await else {
            return Ok(());
        };
        let result = match response.outcome() {
            Ok(result) => result,
            Err(error) => {
                tracing::info!(id, code = error.code, "proposal rejected by peer");
                self.approvals.complete(id, Err(SignkitError::from(error)));
                return self.delete_proposal(id, false).await;
            }
        };
        let answer: SessionProposeResponse = match serde_json::from_value(result) {
            Ok(answer) => answer,
            Err(e) => {
                self.approvals.complete(
                    id,
                    Err(SignkitError::validation(format!("malformed propose response: {}", e))),
                );
                return self.delete_proposal(id, false).await;
            }
        };

        let session_topic = self
            .core
            .crypto
            .generate_shared_key(&proposal.proposer.public_key, &answer.responder_public_key, None)
            .await?;
        // Recorded before subscribing: the settle request may be waiting at
        // the relay already.
        self.lock_settles().insert(
            session_topic.clone(),
            PendingSettle {
                proposal_id: id,
                self_public_key: proposal.proposer.public_key,
                peer_public_key: answer.responder_public_key,
                pairing_topic: proposal.pairing_topic,
            },
        );
        self.core.relayer.subscribe(&session_topic).await?;
        tracing::debug!(id, session_topic, "proposal answered, awaiting settlement");
        Ok(())
    }

    async fn check_settle(
        &self,
        pending: &PendingSettle,
        request: &JsonRpcRequest,
    ) -> std::result::Result<(SessionSettleParams, Proposal), ValidationIssue> {
        let params: SessionSettleParams =
            parse_params(request, SdkError::InvalidSessionSettleRequest)?;
        if params.controller.public_key != pending.peer_public_key {
            return Err(ValidationIssue::new(
                SdkError::InvalidSessionSettleRequest,
                "controller is not the responder",
            ));
        }
        let Some(proposal) = self
            .proposals
            .get_optional(&pending.proposal_id.to_string())
            .await
        else {
            return Err(ValidationIssue::new(
                SdkError::NoMatchingKey,
                format!("proposal {}", pending.proposal_id),
            ));
        };
        validate_session_namespaces(&params.namespaces)?;
        is_conforming_namespaces(&proposal.required_namespaces, &params.namespaces)?;
        if params.expiry <= now_secs() {
            return Err(ValidationIssue::new(SdkError::Expired, "session expiry"));
        }
        Ok((params, proposal))
    }

    async fn on_session_settle(&self, topic: &str, request: JsonRpcRequest) -> Result<()> {
        let id = request.id;
        let pending = self.lock_settles().get(topic).cloned();
        let Some(pending) = pending else {
            return self.reply_unknown_session(topic, WC_SESSION_SETTLE, id).await;
        };

        let (params, proposal) = match self.check_settle(&pending, &request).await {
            Ok(checked) => checked,
            Err(issue) => {
                self.reply_issue(topic, WC_SESSION_SETTLE, id, issue.clone())
                    .await?;
                return self.abandon_settle(topic, &pending, issue.into()).await;
            }
        };

        let session = Session {
            topic: topic.to_string(),
            pairing_topic: pending.pairing_topic.clone(),
            relay: params.relay,
            expiry: params.expiry,
            namespaces: params.namespaces,
            required_namespaces: proposal.required_namespaces,
            optional_namespaces: proposal.optional_namespaces,
            session_properties: params.session_properties,
            controller: params.controller.public_key.clone(),
            self_: Participant {
                public_key: pending.self_public_key.clone(),
                metadata: self.config.metadata.clone(),
            },
            peer: params.controller,
            state: SessionState::Acknowledged {
                provisional: Vec::new(),
            },
        };
        self.sessions.set(topic, session.clone()).await?;
        self.core
            .expirer
            .set(ExpirerTarget::topic(topic), session.expiry)
            .await?;
        self.lock_settles().remove(topic);
        self.reply_ok(topic, WC_SESSION_SETTLE, id).await?;

        self.delete_proposal(pending.proposal_id, false).await?;
        self.activate_pairing(&session.pairing_topic, session.peer.metadata.clone())
            .await;
        self.approvals.complete(pending.proposal_id, Ok(session.clone()));
        tracing::info!(topic, "session connected");
        self.emit_event(SignEvent::SessionConnect { session });
        Ok(())
    }

    /// A settle we cannot accept ends the proposal.
    async fn abandon_settle(
        &self,
        topic: &str,
        pending: &PendingSettle,
        error: SignkitError,
    ) -> Result<()> {
        self.lock_settles().remove(topic);
        self.approvals.complete(pending.proposal_id, Err(error));
        self.core.relayer.unsubscribe(topic).await?;
        self.core.crypto.delete_sym_key(topic).await?;
        self.delete_proposal(pending.proposal_id, false).await
    }

    async fn on_settle_response(&self, topic: &str, response: JsonRpcResponse) -> Result<()> {
        let id = response.id();
        match response.outcome() {
            Ok(_) => {
                let session = self
                    .sessions
                    .update(topic, |s| {
                        if !s.is_acknowledged() {
                            s.state = SessionState::Acknowledged {
                                provisional: Vec::new(),
                            };
                        }
                    })
                    .await?;
                tracing::info!(topic, "session acknowledged");
                self.acks.complete(id, Ok(session));
            }
            Err(error) => {
                tracing::warn!(topic, code = error.code, message = %error.message, "peer refused settlement");
                self.acks.complete(id, Err(SignkitError::from(error)));
                self.delete_session(topic, false).await?;
            }
        }
        Ok(())
    }

    async fn on_change_response(&self, topic: &str, response: JsonRpcResponse) -> Result<()> {
        let id = response.id();
        match response.outcome() {
            Ok(_) => {
                let session = self
                    .sessions
                    .update(topic, |s| {
                        s.confirm(id);
                    })
                    .await?;
                self.acks.complete(id, Ok(session));
            }
            Err(error) => {
                self.roll_back(topic, id).await?;
                self.acks.complete(id, Err(SignkitError::from(error)));
            }
        }
        Ok(())
    }

    async fn on_session_update(&self, topic: &str, request: JsonRpcRequest) -> Result<()> {
        let id = request.id;
        let Some(session) = self.sessions.get_optional(topic).await else {
            return self.reply_unknown_session(topic, WC_SESSION_UPDATE, id).await;
        };
        let checked = if session.peer_is_controller() {
            parse_params(&request, SdkError::InvalidUpdateRequest).and_then(
                |p: SessionUpdateParams| {
                    validate_session_namespaces(&p.namespaces)?;
                    is_conforming_namespaces(&session.required_namespaces, &p.namespaces)?;
                    Ok(p)
                },
            )
        } else {
            Err(ValidationIssue::new(
                SdkError::UnauthorizedUpdateRequest,
                "sender is not the controller",
            ))
        };
        let params = match checked {
            Ok(params) => params,
            Err(issue) => return self.reply_issue(topic, WC_SESSION_UPDATE, id, issue).await,
        };
        if !self.lock_last_applied().accept(topic, "update", id) {
            // A newer update already landed; acknowledge without applying.
            tracing::debug!(topic, id, "discarding stale update");
            return self.reply_ok(topic, WC_SESSION_UPDATE, id).await;
        }

        let namespaces = params.namespaces;
        self.sessions
            .update(topic, |s| s.namespaces = namespaces.clone())
            .await?;
        self.reply_ok(topic, WC_SESSION_UPDATE, id).await?;
        self.emit_event(SignEvent::SessionUpdate {
            id,
            topic: topic.to_string(),
            namespaces,
        });
        Ok(())
    }

    async fn on_session_extend(&self, topic: &str, request: JsonRpcRequest) -> Result<()> {
        let id = request.id;
        let Some(session) = self.sessions.get_optional(topic).await else {
            return self.reply_unknown_session(topic, WC_SESSION_EXTEND, id).await;
        };
        let now = now_secs();
        let checked = if session.peer_is_controller() {
            parse_params(&request, SdkError::InvalidExtendRequest).and_then(
                |p: SessionExtendParams| match p.expiry {
                    None => Ok(now + SEVEN_DAYS),
                    Some(e) if e > now && e <= now + SEVEN_DAYS + EXTEND_TOLERANCE => Ok(e),
                    Some(e) => Err(ValidationIssue::new(
                        SdkError::InvalidExtendRequest,
                        format!("expiry {} out of range", e),
                    )),
                },
            )
        } else {
            Err(ValidationIssue::new(
                SdkError::UnauthorizedExtendRequest,
                "sender is not the controller",
            ))
        };
        let expiry = match checked {
            Ok(expiry) => expiry,
            Err(issue) => return self.reply_issue(topic, WC_SESSION_EXTEND, id, issue).await,
        };
        if !self.lock_last_applied().accept(topic, "extend", id) {
            // A newer extend already landed; acknowledge without applying.
            tracing::debug!(topic, id, "discarding stale extend");
            return self.reply_ok(topic, WC_SESSION_EXTEND, id).await;
        }

        self.sessions.update(topic, |s| s.expiry = expiry).await?;
        self.core
            .expirer
            .set(ExpirerTarget::topic(topic), expiry)
            .await?;
        self.reply_ok(topic, WC_SESSION_EXTEND, id).await?;
        self.emit_event(SignEvent::SessionExtend {
            id,
            topic: topic.to_string(),
            expiry,
        });
        Ok(())
    }

    async fn on_session_ping(&self, topic: &str, request: JsonRpcRequest) -> Result<()> {
        let id = request.id;
        if !self.sessions.contains(topic).await {
            return self.reply_unknown_session(topic, WC_SESSION_PING, id).await;
        }
        self.reply_ok(topic, WC_SESSION_PING, id).await?;
        self.emit_event(SignEvent::SessionPing {
            id,
            topic: topic.to_string(),
        });
        Ok(())
    }

    async fn on_session_delete(&self, topic: &str, request: JsonRpcRequest) -> Result<()> {
        let id = request.id;
        if !self.sessions.contains(topic).await {
            return self.reply_unknown_session(topic, WC_SESSION_DELETE, id).await;
        }
        // Answer while the topic key still exists.
        self.reply_ok(topic, WC_SESSION_DELETE, id).await?;
        self.delete_session(topic, false).await?;
        tracing::info!(topic, "session deleted by peer");
        self.emit_event(SignEvent::SessionDelete {
            id,
            topic: topic.to_string(),
        });
        Ok(())
    }

    async fn on_session_request(&self, topic: &str, request: JsonRpcRequest) -> Result<()> {
        let id = request.id;
        let Some(session) = self.sessions.get_optional(topic).await else {
            return self.reply_unknown_session(topic, WC_SESSION_REQUEST, id).await;
        };
        let now = now_secs();
        let checked = parse_params(&request, SdkError::InvalidMethod).and_then(
            |p: SessionRequestParams| {
                is_valid_request(&session, &p.chain_id, &p.request.method)?;
                if p.request.expiry_timestamp.is_some_and(|e| e <= now) {
                    return Err(ValidationIssue::new(SdkError::Expired, "request"));
                }
                Ok(p)
            },
        );
        let params = match checked {
            Ok(params) => params,
            Err(issue) => return self.reply_issue(topic, WC_SESSION_REQUEST, id, issue).await,
        };

        let expiry = params
            .request
            .expiry_timestamp
            .unwrap_or(now + FIVE_MINUTES);
        let pending = PendingRequest {
            id,
            topic: topic.to_string(),
            request: params.request,
            chain_id: params.chain_id,
            expiry,
        };
        self.pending_requests
            .set(&id.to_string(), pending.clone())
            .await?;
        self.core.expirer.set(ExpirerTarget::Id(id), expiry).await?;
        tracing::debug!(id, topic, method = %pending.request.method, "session request staged");
        let next = self.lock_queue().push(pending, now);
        self.surface(next);
        Ok(())
    }

    async fn on_session_event(&self, topic: &str, request: JsonRpcRequest) -> Result<()> {
        let id = request.id;
        let Some(session) = self.sessions.get_optional(topic).await else {
            return self.reply_unknown_session(topic, WC_SESSION_EVENT, id).await;
        };
        let checked = parse_params(&request, SdkError::InvalidEvent).and_then(
            |p: SessionEventParams| {
                is_valid_event(&session, &p.chain_id, &p.event.name)?;
                Ok(p)
            },
        );
        let params = match checked {
            Ok(params) => params,
            Err(issue) => return self.reply_issue(topic, WC_SESSION_EVENT, id, issue).await,
        };
        let kind = format!("event:{}", params.event.name);
        if !self.lock_last_applied().accept(topic, &kind, id) {
            tracing::debug!(topic, id, kind, "discarding stale event");
            return self.reply_ok(topic, WC_SESSION_EVENT, id).await;
        }

        self.reply_ok(topic, WC_SESSION_EVENT, id).await?;
        self.emit_event(SignEvent::SessionEvent {
            id,
            topic: topic.to_string(),
            chain_id: params.chain_id,
            event: params.event,
        });
        Ok(())
    }

    /// Pairing-scope methods belong to the pairing controller; anything else
    /// on a session topic is refused.
    async fn on_unknown_method(&self, topic: &str, request: JsonRpcRequest) -> Result<()> {
        if !self.sessions.contains(topic).await {
            return Ok(());
        }
        let issue = ValidationIssue::new(SdkError::WcMethodUnsupported, request.method.clone());
        self.reply_issue(topic, &request.method, request.id, issue)
            .await
    }

    async fn on_topic_expired(&self, topic: &str) -> Result<()> {
        if !self.sessions.contains(topic).await {
            return Ok(());
        }
        self.delete_session(topic, true).await?;
        tracing::info!(topic, "session expired");
        self.emit_event(SignEvent::SessionExpire {
            topic: topic.to_string(),
        });
        Ok(())
    }

    async fn on_id_expired(&self, id: u64) -> Result<()> {
        let key = id.to_string();
        if self.proposals.contains(&key).await {
            let abandoned: Vec<String> = {
                let mut settles = self.lock_settles();
                let topics: Vec<String> = settles
                    .iter()
                    .filter(|(_, p)| p.proposal_id == id)
                    .map(|(t, _)| t.clone())
                    .collect();
                for t in &topics {
                    settles.remove(t);
                }
                topics
            };
            for topic in abandoned {
                self.core.relayer.unsubscribe(&topic).await?;
                self.core.crypto.delete_sym_key(&topic).await?;
            }
            self.delete_proposal(id, true).await?;
            self.approvals.complete(id, Err(SignkitError::ProposalExpired));
            tracing::info!(id, "proposal expired");
            self.emit_event(SignEvent::ProposalExpire { id });
        } else if self.pending_requests.contains(&key).await {
            tracing::info!(id, "session request expired");
            self.emit_event(SignEvent::SessionRequestExpire { id });
            self.finish_request(id, true).await?;
        }
        Ok(())
    }
}
