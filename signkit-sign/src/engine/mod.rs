//! Session engine.
//!
//! Owns proposals, sessions and pending requests. Caller operations become
//! `wc_session*` messages on the relay; inbound messages become
//! [`SignEvent`]s.
//!
//! Inbound requests go through one FIFO worker with a short pause between
//! items, so bursts after a reconnect are applied in arrival order.
//! Responses are handled as they arrive. Inbound `wc_sessionRequest`s are
//! additionally surfaced one at a time: the next one is emitted only after
//! the previous one was answered or expired.

mod handles;
mod inbound;
mod queue;

pub use handles::{Acknowledgement, Approval};

use crate::config::SignConfig;
use crate::constants::{
    rpc_opts, WC_SESSION_DELETE, WC_SESSION_EVENT, WC_SESSION_EXTEND, WC_SESSION_PING,
    WC_SESSION_PROPOSE, WC_SESSION_REQUEST, WC_SESSION_SETTLE, WC_SESSION_UPDATE,
};
use crate::events::SignEvent;
use crate::types::{
    ApproveParams, Change, ConnectParams, EventPayload, Namespaces, Participant, PendingRequest,
    Proposal, RequestPayload, Session, SessionEventParams, SessionExtendParams,
    SessionProposeParams, SessionProposeResponse, SessionRequestParams, SessionSettleParams,
    SessionState, SessionUpdateParams,
};
use crate::validation::{
    is_conforming_namespaces, is_valid_event, is_valid_request, is_valid_request_expiry,
    validate_proposal_namespaces, validate_session_namespaces,
};
use queue::{LastApplied, SessionRequestQueue};
use serde_json::{json, Value};
use signkit_lib::constants::{FIVE_MINUTES, SEVEN_DAYS};
use signkit_lib::expirer::{ExpirerEvent, ExpirerTarget};
use signkit_lib::jsonrpc::{
    wait_for_response, JsonRpcError, JsonRpcPayload, JsonRpcRequest, JsonRpcResponse,
    ResponseWaiters,
};
use signkit_lib::pairing::Metadata;
use signkit_lib::relay::{PublishOptions, RelayProtocol, RelayerEvent};
use signkit_lib::storage::PersistedStore;
use signkit_lib::{now_secs, Core, Result, SdkError, SignkitError};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc};

const EVENT_CAPACITY: usize = 1024;
const PING_TIMEOUT: Duration = Duration::from_secs(30);

/// Result of [`Engine::connect`].
#[derive(Debug)]
pub struct Connection {
    /// Set when a fresh pairing was created for this proposal.
    pub uri: Option<String>,
    pub pairing_topic: String,
    pub approval: Approval,
}

/// Result of [`Engine::approve`].
#[derive(Debug)]
pub struct Approved {
    pub topic: String,
    pub acknowledgement: Acknowledgement,
}

/// Proposer-side state between the propose response and the settle request.
#[derive(Clone, Debug)]
struct PendingSettle {
    proposal_id: u64,
    self_public_key: String,
    peer_public_key: String,
    pairing_topic: String,
}

struct Receivers {
    relay: broadcast::Receiver<RelayerEvent>,
    expirer: broadcast::Receiver<ExpirerEvent>,
}

pub struct Engine {
    core: Arc<Core>,
    config: SignConfig,
    proposals: PersistedStore<Proposal>,
    sessions: PersistedStore<Session>,
    pending_requests: PersistedStore<PendingRequest>,
    /// Raw responses to our session requests and pings.
    waiters: ResponseWaiters,
    /// Settlement, update and extend acknowledgements.
    acks: ResponseWaiters<Session>,
    /// Keyed by proposal id.
    approvals: ResponseWaiters<Session>,
    pending_settles: Mutex<HashMap<String, PendingSettle>>,
    last_applied: Mutex<LastApplied>,
    request_queue: Mutex<SessionRequestQueue>,
    events: broadcast::Sender<SignEvent>,
    first_events: Mutex<Option<broadcast::Receiver<SignEvent>>>,
    receivers: Mutex<Option<Receivers>>,
}

impl Engine {
    /// Subscribes to relayer and expirer events right away, so construct the
    /// engine before starting `core`.
    pub fn new(config: SignConfig, core: Arc<Core>) -> Self {
        let (events, first_events) = broadcast::channel(EVENT_CAPACITY);
        let receivers = Receivers {
            relay: core.relayer.subscribe_events(),
            expirer: core.expirer.subscribe(),
        };
        core.pairing.register(&[WC_SESSION_PROPOSE]);
        let storage = core.storage.clone();
        Self {
            proposals: PersistedStore::new(
                storage.clone(),
                core.config.storage_key("proposal"),
                "proposal",
            ),
            sessions: PersistedStore::new(
                storage.clone(),
                core.config.storage_key("session"),
                "session",
            ),
            pending_requests: PersistedStore::new(
                storage,
                core.config.storage_key("request"),
                "request",
            ),
            core,
            config,
            waiters: ResponseWaiters::new(),
            acks: ResponseWaiters::new(),
            approvals: ResponseWaiters::new(),
            pending_settles: Mutex::new(HashMap::new()),
            last_applied: Mutex::new(LastApplied::default()),
            request_queue: Mutex::new(SessionRequestQueue::default()),
            events,
            first_events: Mutex::new(Some(first_events)),
            receivers: Mutex::new(Some(receivers)),
        }
    }

    /// Restore proposals, sessions and pending requests.
    pub async fn restore(&self) -> Result<()> {
        self.proposals.init().await?;
        self.sessions.init().await?;
        self.pending_requests.init().await?;
        tracing::debug!(
            proposals = self.proposals.len().await,
            sessions = self.sessions.len().await,
            requests = self.pending_requests.len().await,
            "engine restored"
        );
        Ok(())
    }

    /// Start processing inbound traffic. Call once `core` has started.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let receivers = self
            .receivers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .ok_or_else(|| SignkitError::Internal("engine already started".into()))?;
        self.spawn_listener(receivers);
        self.track_restored_expiries().await?;

        let mut restored = self.pending_requests.values().await;
        restored.sort_by_key(|r| r.id);
        let now = now_secs();
        for request in restored {
            let next = self.lock_queue().push(request, now);
            self.surface(next);
        }
        Ok(())
    }

    /// Consumer events. The first receiver handed out also holds every event
    /// emitted since the engine was constructed.
    pub fn subscribe_events(&self) -> broadcast::Receiver<SignEvent> {
        let first = self
            .first_events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        first.unwrap_or_else(|| self.events.subscribe())
    }

    /// Propose a session to the peer on `pairing_topic`, or on a fresh
    /// pairing whose URI is returned.
    #[tracing::instrument(skip(self, params))]
    pub async fn connect(&self, params: ConnectParams) -> Result<Connection> {
        validate_proposal_namespaces(&params.required_namespaces)?;
        validate_proposal_namespaces(&params.optional_namespaces)?;

        let (pairing_topic, uri) = match params.pairing_topic {
            Some(topic) => {
                let pairing = self.core.pairing.get_pairing(&topic).await?;
                if pairing.expiry <= now_secs() {
                    return Err(SignkitError::expired("pairing", &topic));
                }
                (topic, None)
            }
            None => {
                let created = self.core.pairing.create().await?;
                (created.topic, Some(created.uri))
            }
        };

        let public_key = self.core.crypto.generate_key_pair().await?;
        let expiry = now_secs() + FIVE_MINUTES;
        let propose = SessionProposeParams {
            relays: vec![RelayProtocol::default()],
            proposer: Participant {
                public_key,
                metadata: self.config.metadata.clone(),
            },
            required_namespaces: params.required_namespaces,
            optional_namespaces: params.optional_namespaces,
            session_properties: params.session_properties,
            expiry_timestamp: Some(expiry),
        };
        let request = JsonRpcRequest::new(WC_SESSION_PROPOSE, serde_json::to_value(&propose)?);
        let id = request.id;
        let proposal = Proposal {
            id,
            expiry,
            relays: propose.relays,
            proposer: propose.proposer,
            required_namespaces: propose.required_namespaces,
            optional_namespaces: propose.optional_namespaces,
            pairing_topic: pairing_topic.clone(),
            session_properties: propose.session_properties,
        };
        self.proposals.set(&id.to_string(), proposal).await?;
        self.core.expirer.set(ExpirerTarget::Id(id), expiry).await?;

        let rx = self.approvals.register(id, &pairing_topic);
        let opts = rpc_opts(WC_SESSION_PROPOSE, false).throwing();
        if let Err(e) = self
            .core
            .relayer
            .publish(&pairing_topic, &request.into(), opts)
            .await
        {
            self.approvals.remove(id);
            self.delete_proposal(id, false).await?;
            return Err(e);
        }
        tracing::info!(id, pairing_topic, "session proposed");
        Ok(Connection {
            uri,
            pairing_topic,
            approval: Approval::new(id, rx, Duration::from_secs(FIVE_MINUTES)),
        })
    }

    /// Accept a received proposal. We become the session controller.
    #[tracing::instrument(skip(self, params), fields(id = params.id))]
    pub async fn approve(&self, params: ApproveParams) -> Result<Approved> {
        let proposal = self.proposals.get(&params.id.to_string()).await?;
        if proposal.expiry <= now_secs() {
            self.delete_proposal(proposal.id, false).await?;
            return Err(SignkitError::expired("proposal", params.id.to_string()));
        }
        validate_session_namespaces(&params.namespaces)?;
        is_conforming_namespaces(&proposal.required_namespaces, &params.namespaces)?;

        let self_public_key = self.core.crypto.generate_key_pair().await?;
        let topic = self
            .core
            .crypto
            .generate_shared_key(&self_public_key, &proposal.proposer.public_key, None)
            .await?;
        self.core.relayer.subscribe(&topic).await?;

        let relay = proposal.relays.first().cloned().unwrap_or_default();
        let answer = JsonRpcResponse::result(
            proposal.id,
            serde_json::to_value(SessionProposeResponse {
                relay: relay.clone(),
                responder_public_key: self_public_key.clone(),
            })?,
        );
        self.core
            .relayer
            .publish(
                &proposal.pairing_topic,
                &answer.into(),
                rpc_opts(WC_SESSION_PROPOSE, true).throwing(),
            )
            .await?;

        let self_ = Participant {
            public_key: self_public_key.clone(),
            metadata: self.config.metadata.clone(),
        };
        let expiry = now_secs() + SEVEN_DAYS;
        let session = Session {
            topic: topic.clone(),
            pairing_topic: proposal.pairing_topic.clone(),
            relay: relay.clone(),
            expiry,
            namespaces: params.namespaces.clone(),
            required_namespaces: proposal.required_namespaces.clone(),
            optional_namespaces: proposal.optional_namespaces.clone(),
            session_properties: params.session_properties.clone(),
            controller: self_public_key,
            self_: self_.clone(),
            peer: proposal.proposer.clone(),
            state: SessionState::Unacknowledged,
        };
        self.sessions.set(&topic, session).await?;
        self.core
            .expirer
            .set(ExpirerTarget::topic(&topic), expiry)
            .await?;

        let settle = SessionSettleParams {
            relay,
            controller: self_,
            namespaces: params.namespaces,
            required_namespaces: proposal.required_namespaces.clone(),
            optional_namespaces: proposal.optional_namespaces.clone(),
            session_properties: params.session_properties,
            expiry,
            pairing_topic: proposal.pairing_topic.clone(),
        };
        let request = JsonRpcRequest::new(WC_SESSION_SETTLE, serde_json::to_value(&settle)?);
        let settle_id = request.id;
        let rx = self.acks.register(settle_id, &topic);
        if let Err(e) = self
            .core
            .relayer
            .publish(&topic, &request.into(), rpc_opts(WC_SESSION_SETTLE, false).throwing())
            .await
        {
            self.acks.remove(settle_id);
            self.delete_session(&topic, false).await?;
            return Err(e);
        }

        self.delete_proposal(proposal.id, false).await?;
        self.activate_pairing(&proposal.pairing_topic, proposal.proposer.metadata)
            .await;
        tracing::info!(topic, "session settled, awaiting acknowledgement");
        Ok(Approved {
            acknowledgement: Acknowledgement::new(
                &topic,
                WC_SESSION_SETTLE,
                rx,
                self.config.settle_ack_timeout,
            ),
            topic,
        })
    }

    /// Refuse a received proposal with `reason`.
    #[tracing::instrument(skip(self, reason))]
    pub async fn reject(&self, id: u64, reason: JsonRpcError) -> Result<()> {
        let proposal = self.proposals.get(&id.to_string()).await?;
        let response = JsonRpcResponse::error(id, reason);
        self.core
            .relayer
            .publish(
                &proposal.pairing_topic,
                &response.into(),
                rpc_opts(WC_SESSION_PROPOSE, true),
            )
            .await?;
        self.delete_proposal(id, false).await?;
        tracing::info!(id, "proposal rejected");
        Ok(())
    }

    /// Replace the session namespaces. Applied locally right away and rolled
    /// back if the peer refuses.
    #[tracing::instrument(skip(self, namespaces))]
    pub async fn update(&self, topic: &str, namespaces: Namespaces) -> Result<Acknowledgement> {
        let session = self.controlled_session(topic).await?;
        validate_session_namespaces(&namespaces)?;
        is_conforming_namespaces(&session.required_namespaces, &namespaces)?;
        let request = JsonRpcRequest::new(
            WC_SESSION_UPDATE,
            serde_json::to_value(SessionUpdateParams {
                namespaces: namespaces.clone(),
            })?,
        );
        self.send_change(topic, request, WC_SESSION_UPDATE, Change::Namespaces(namespaces))
            .await
    }

    /// Push the session expiry seven days out.
    #[tracing::instrument(skip(self))]
    pub async fn extend(&self, topic: &str) -> Result<Acknowledgement> {
        self.controlled_session(topic).await?;
        let expiry = now_secs() + SEVEN_DAYS;
        let request = JsonRpcRequest::new(
            WC_SESSION_EXTEND,
            serde_json::to_value(SessionExtendParams {
                expiry: Some(expiry),
            })?,
        );
        self.send_change(topic, request, WC_SESSION_EXTEND, Change::Expiry(expiry))
            .await
    }

    /// Send `method` to the peer and wait for its answer.
    ///
    /// `expiry` is the request lifetime in seconds, five minutes by default.
    #[tracing::instrument(skip(self, params))]
    pub async fn request(
        &self,
        topic: &str,
        chain_id: &str,
        method: &str,
        params: Value,
        expiry: Option<u64>,
    ) -> Result<Value> {
        let session = self.valid_session(topic).await?;
        is_valid_request(&session, chain_id, method)?;
        let ttl = expiry.unwrap_or(FIVE_MINUTES);
        is_valid_request_expiry(ttl)?;

        let params = SessionRequestParams {
            request: RequestPayload {
                method: method.to_string(),
                params,
                expiry_timestamp: Some(now_secs() + ttl),
            },
            chain_id: chain_id.to_string(),
        };
        let request = JsonRpcRequest::new(WC_SESSION_REQUEST, serde_json::to_value(&params)?);
        let id = request.id;
        let rx = self.waiters.register(id, topic);
        let opts = PublishOptions {
            ttl,
            ..rpc_opts(WC_SESSION_REQUEST, false)
        }
        .throwing()
        .with_chain_id(chain_id);
        if let Err(e) = self.core.relayer.publish(topic, &request.into(), opts).await {
            self.waiters.remove(id);
            return Err(e);
        }
        tracing::debug!(id, topic, method, "session request sent");
        wait_for_response(rx, Duration::from_secs(ttl), WC_SESSION_REQUEST).await
    }

    /// Answer a pending inbound request and surface the next one.
    #[tracing::instrument(skip(self, response), fields(id = response.id()))]
    pub async fn respond(&self, topic: &str, response: JsonRpcResponse) -> Result<()> {
        let id = response.id();
        let pending = self.pending_requests.get(&id.to_string()).await?;
        if pending.topic != topic {
            return Err(SignkitError::MismatchedTopic {
                id,
                expected: pending.topic,
                actual: topic.to_string(),
            });
        }
        self.valid_session(topic).await?;
        self.core
            .relayer
            .publish(
                topic,
                &response.into(),
                rpc_opts(WC_SESSION_REQUEST, true).throwing(),
            )
            .await?;
        self.finish_request(id, false).await
    }

    /// Ping a session, or a pairing if `topic` is one.
    #[tracing::instrument(skip(self))]
    pub async fn ping(&self, topic: &str) -> Result<()> {
        if self.sessions.contains(topic).await {
            self.valid_session(topic).await?;
            let request = JsonRpcRequest::new(WC_SESSION_PING, json!({}));
            let id = request.id;
            let rx = self.waiters.register(id, topic);
            if let Err(e) = self
                .core
                .relayer
                .publish(topic, &request.into(), rpc_opts(WC_SESSION_PING, false).throwing())
                .await
            {
                self.waiters.remove(id);
                return Err(e);
            }
            wait_for_response(rx, PING_TIMEOUT, WC_SESSION_PING).await?;
            Ok(())
        } else if self.core.pairing.contains(topic).await {
            self.core.pairing.ping(topic).await
        } else {
            Err(SignkitError::no_matching_key("session or pairing", topic))
        }
    }

    /// Emit a session event to the peer.
    #[tracing::instrument(skip(self, event), fields(event = %event.name))]
    pub async fn emit(&self, topic: &str, chain_id: &str, event: EventPayload) -> Result<()> {
        let session = self.valid_session(topic).await?;
        is_valid_event(&session, chain_id, &event.name)?;
        let request = JsonRpcRequest::new(
            WC_SESSION_EVENT,
            serde_json::to_value(SessionEventParams {
                event,
                chain_id: chain_id.to_string(),
            })?,
        );
        self.core
            .relayer
            .publish(topic, &request.into(), rpc_opts(WC_SESSION_EVENT, false).throwing())
            .await
    }

    /// Tell the peer and tear down a session, or disconnect a pairing.
    #[tracing::instrument(skip(self, reason))]
    pub async fn disconnect(&self, topic: &str, reason: JsonRpcError) -> Result<()> {
        if self.sessions.contains(topic).await {
            let request = JsonRpcRequest::new(WC_SESSION_DELETE, serde_json::to_value(&reason)?);
            self.core
                .relayer
                .publish(topic, &request.into(), rpc_opts(WC_SESSION_DELETE, false))
                .await?;
            self.delete_session(topic, false).await?;
            tracing::info!(topic, "session disconnected");
            Ok(())
        } else if self.core.pairing.contains(topic).await {
            self.core.pairing.disconnect(topic).await
        } else {
            Err(SignkitError::no_matching_key("session or pairing", topic))
        }
    }

    pub async fn get_sessions(&self) -> Vec<Session> {
        self.sessions.values().await
    }

    pub async fn get_session(&self, topic: &str) -> Result<Session> {
        self.sessions.get(topic).await
    }

    pub async fn get_proposals(&self) -> Vec<Proposal> {
        self.proposals.values().await
    }

    pub async fn get_pending_requests(&self) -> Vec<PendingRequest> {
        self.pending_requests.values().await
    }

    pub async fn find_sessions_by_pairing(&self, pairing_topic: &str) -> Vec<Session> {
        self.sessions
            .filter(|s| s.pairing_topic == pairing_topic)
            .await
    }

    async fn valid_session(&self, topic: &str) -> Result<Session> {
        let session = self.sessions.get(topic).await?;
        if session.expiry <= now_secs() {
            self.delete_session(topic, false).await?;
            return Err(SignkitError::expired("session", topic));
        }
        Ok(session)
    }

    async fn controlled_session(&self, topic: &str) -> Result<Session> {
        let session = self.valid_session(topic).await?;
        if !session.is_acknowledged() {
            return Err(SignkitError::validation(format!(
                "session {} is not acknowledged yet",
                topic
            )));
        }
        if !session.is_controller() {
            return Err(SignkitError::validation(format!(
                "not the controller of session {}",
                topic
            )));
        }
        Ok(session)
    }

    async fn send_change(
        &self,
        topic: &str,
        request: JsonRpcRequest,
        method: &'static str,
        change: Change,
    ) -> Result<Acknowledgement> {
        let id = request.id;
        let touches_expiry = matches!(change, Change::Expiry(_));
        let session = self
            .sessions
            .update(topic, |s| s.apply_provisional(id, change))
            .await?;
        if touches_expiry {
            self.core
                .expirer
                .set(ExpirerTarget::topic(topic), session.expiry)
                .await?;
        }
        let rx = self.acks.register(id, topic);
        if let Err(e) = self
            .core
            .relayer
            .publish(topic, &request.into(), rpc_opts(method, false).throwing())
            .await
        {
            self.acks.remove(id);
            self.roll_back(topic, id).await?;
            return Err(e);
        }
        Ok(Acknowledgement::new(
            topic,
            method,
            rx,
            self.config.settle_ack_timeout,
        ))
    }

    async fn roll_back(&self, topic: &str, id: u64) -> Result<()> {
        let mut rolled_back = false;
        let session = self
            .sessions
            .update(topic, |s| rolled_back = s.roll_back(id))
            .await?;
        if rolled_back {
            tracing::info!(topic, id, "rolled back refused change");
            self.core
                .expirer
                .set(ExpirerTarget::topic(topic), session.expiry)
                .await?;
        }
        Ok(())
    }

    /// Remove a session with its keys, subscription, history and pending
    /// requests. With `expirer_has_deleted` the topic lapsed: no unsubscribe
    /// goes out and the expirer entry is already gone.
    async fn delete_session(&self, topic: &str, expirer_has_deleted: bool) -> Result<()> {
        let Some(session) = self.sessions.get_optional(topic).await else {
            return Ok(());
        };
        if expirer_has_deleted {
            self.core.relayer.forget_topic(topic).await?;
        } else {
            self.core.relayer.unsubscribe(topic).await?;
            self.core.expirer.del(&ExpirerTarget::topic(topic)).await?;
        }
        self.sessions.delete(topic, "session deleted").await?;
        self.core.crypto.delete_sym_key(topic).await?;
        self.core
            .crypto
            .delete_key_pair(&session.self_.public_key)
            .await?;

        let dropped = self
            .pending_requests
            .remove_where(|_, r| r.topic == topic, "session deleted")
            .await?;
        for request in &dropped {
            self.core.expirer.del(&ExpirerTarget::Id(request.id)).await?;
        }
        let next = self.lock_queue().remove_topic(topic, now_secs());
        self.surface(next);
        self.lock_last_applied().forget_topic(topic);

        let gone = SignkitError::no_matching_key("session", topic);
        self.waiters.reject_topic(topic, gone.clone());
        self.acks.reject_topic(topic, gone);
        Ok(())
    }

    /// Remove a proposal. The proposer key pair goes too unless a session
    /// now uses it.
    async fn delete_proposal(&self, id: u64, expirer_has_deleted: bool) -> Result<()> {
        let Some(proposal) = self.proposals.delete(&id.to_string(), "proposal closed").await? else {
            return Ok(());
        };
        if !expirer_has_deleted {
            self.core.expirer.del(&ExpirerTarget::Id(id)).await?;
        }
        let key = &proposal.proposer.public_key;
        if self.core.crypto.has_keys(key).await {
            let in_use = !self
                .sessions
                .filter(|s| &s.self_.public_key == key)
                .await
                .is_empty();
            if !in_use {
                self.core.crypto.delete_key_pair(key).await?;
            }
        }
        Ok(())
    }

    /// Drop a pending request and surface the next one.
    async fn finish_request(&self, id: u64, expirer_has_deleted: bool) -> Result<()> {
        self.pending_requests
            .delete(&id.to_string(), "request finished")
            .await?;
        if !expirer_has_deleted {
            self.core.expirer.del(&ExpirerTarget::Id(id)).await?;
        }
        let next = self.lock_queue().finish(id, now_secs());
        self.surface(next);
        Ok(())
    }

    async fn activate_pairing(&self, pairing_topic: &str, peer: Metadata) {
        if let Err(e) = self.core.pairing.activate(pairing_topic).await {
            tracing::warn!(pairing_topic, error = %e, "failed to activate pairing");
            return;
        }
        if let Err(e) = self.core.pairing.update_metadata(pairing_topic, peer).await {
            tracing::warn!(pairing_topic, error = %e, "failed to store peer metadata");
        }
    }

    /// Make sure every restored proposal and session is tracked by the
    /// expirer, so ones that lapsed while we were down get cleaned up.
    async fn track_restored_expiries(&self) -> Result<()> {
        for proposal in self.proposals.values().await {
            let target = ExpirerTarget::Id(proposal.id);
            if !self.core.expirer.has(&target).await {
                self.core.expirer.set(target, proposal.expiry).await?;
            }
        }
        for session in self.sessions.values().await {
            let target = ExpirerTarget::topic(&session.topic);
            if !self.core.expirer.has(&target).await {
                self.core.expirer.set(target, session.expiry).await?;
            }
        }
        Ok(())
    }

    fn emit_event(&self, event: SignEvent) {
        // No receivers is fine.
        let _ = self.events.send(event);
    }

    fn surface(&self, next: Option<PendingRequest>) {
        if let Some(request) = next {
            tracing::debug!(id = request.id, topic = %request.topic, "surfacing session request");
            self.emit_event(SignEvent::SessionRequest { request });
        }
    }

    fn lock_queue(&self) -> MutexGuard<'_, SessionRequestQueue> {
        self.request_queue.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_last_applied(&self) -> MutexGuard<'_, LastApplied> {
        self.last_applied.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_settles(&self) -> MutexGuard<'_, HashMap<String, PendingSettle>> {
        self.pending_settles.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn spawn_listener(self: &Arc<Self>, receivers: Receivers) {
        let Receivers {
            mut relay,
            mut expirer,
        } = receivers;
        let (queue_tx, mut queue_rx) = mpsc::unbounded_channel::<(String, JsonRpcRequest)>();

        let worker = Arc::downgrade(self);
        let delay = self.config.request_queue_delay;
        tokio::spawn(async move {
            while let Some((topic, request)) = queue_rx.recv().await {
                let Some(this) = worker.upgrade() else { break };
                this.on_request(&topic, request).await;
                drop(this);
                tokio::time::sleep(delay).await;
            }
        });

        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = relay.recv() => match event {
                        Ok(RelayerEvent::Message { topic, payload, .. }) => {
                            let Some(this) = weak.upgrade() else { break };
                            match payload {
                                JsonRpcPayload::Request(request) => {
                                    if queue_tx.send((topic, request)).is_err() {
                                        break;
                                    }
                                }
                                JsonRpcPayload::Response(response) => {
                                    this.on_response(&topic, response).await;
                                }
                            }
                        }
                        Ok(_) => {}
                        Err(RecvError::Lagged(skipped)) => {
                            tracing::warn!(skipped, "engine lagged behind relayer");
                        }
                        Err(RecvError::Closed) => break,
                    },
                    event = expirer.recv() => match event {
                        Ok(ExpirerEvent::Expired { target, .. }) => {
                            let Some(this) = weak.upgrade() else { break };
                            this.on_expired(target).await;
                        }
                        Ok(_) => {}
                        Err(RecvError::Lagged(skipped)) => {
                            tracing::warn!(skipped, "engine lagged behind expirer");
                        }
                        Err(RecvError::Closed) => break,
                    },
                }
            }
        });
    }
}

/// Default reason for [`Engine::reject`].
pub fn user_rejected() -> JsonRpcError {
    SdkError::UserRejected.to_rpc_error()
}

/// Default reason for [`Engine::disconnect`].
pub fn user_disconnected() -> JsonRpcError {
    SdkError::UserDisconnected.to_rpc_error()
}
