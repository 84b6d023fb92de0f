use crate::config::SignConfig;
use crate::engine::{user_disconnected, user_rejected, Acknowledgement, Approved, Connection, Engine};
use crate::events::SignEvent;
use crate::types::{
    ApproveParams, ConnectParams, EventPayload, Namespaces, PendingRequest, Proposal, Session,
};
use serde_json::Value;
use signkit_lib::jsonrpc::{JsonRpcError, JsonRpcResponse};
use signkit_lib::prelude::{Core, KeyValueStorage, Pairing, RelayTransport, Result};
use std::sync::Arc;
use tokio::sync::broadcast;

/// One side of a wallet/app connection.
///
/// Wires a [`Core`] and an [`Engine`] to the injected storage and transport.
pub struct SignClient {
    core: Arc<Core>,
    engine: Arc<Engine>,
}

impl SignClient {
    /// Build, restore and connect a client.
    #[tracing::instrument(skip_all, fields(name = %config.metadata.name))]
    pub async fn init(
        config: SignConfig,
        storage: Arc<dyn KeyValueStorage>,
        transport: Arc<dyn RelayTransport>,
    ) -> Result<Self> {
        let core = Arc::new(Core::new(config.core.clone(), storage, transport));
        let engine = Arc::new(Engine::new(config, core.clone()));
        engine.restore().await?;
        core.start().await?;
        engine.start().await?;
        tracing::info!("sign client ready");
        Ok(Self { core, engine })
    }

    pub fn core(&self) -> &Arc<Core> {
        &self.core
    }

    /// See [`Engine::subscribe_events`].
    pub fn events(&self) -> broadcast::Receiver<SignEvent> {
        self.engine.subscribe_events()
    }

    pub async fn connect(&self, params: ConnectParams) -> Result<Connection> {
        self.engine.connect(params).await
    }

    /// Join a pairing from a URI shared by the peer.
    pub async fn pair(&self, uri: &str) -> Result<Pairing> {
        self.core.pairing.pair(uri).await
    }

    pub async fn approve(&self, params: ApproveParams) -> Result<Approved> {
        self.engine.approve(params).await
    }

    /// Reject with `reason`, or "User rejected." when none is given.
    pub async fn reject(&self, id: u64, reason: Option<JsonRpcError>) -> Result<()> {
        self.engine
            .reject(id, reason.unwrap_or_else(user_rejected))
            .await
    }

    pub async fn update(&self, topic: &str, namespaces: Namespaces) -> Result<Acknowledgement> {
        self.engine.update(topic, namespaces).await
    }

    pub async fn extend(&self, topic: &str) -> Result<Acknowledgement> {
        self.engine.extend(topic).await
    }

    pub async fn request(
        &self,
        topic: &str,
        chain_id: &str,
        method: &str,
        params: Value,
        expiry: Option<u64>,
    ) -> Result<Value> {
        self.engine
            .request(topic, chain_id, method, params, expiry)
            .await
    }

    pub async fn respond(&self, topic: &str, response: JsonRpcResponse) -> Result<()> {
        self.engine.respond(topic, response).await
    }

    pub async fn ping(&self, topic: &str) -> Result<()> {
        self.engine.ping(topic).await
    }

    pub async fn emit(&self, topic: &str, chain_id: &str, event: EventPayload) -> Result<()> {
        self.engine.emit(topic, chain_id, event).await
    }

    /// Disconnect with `reason`, or "User disconnected." when none is given.
    pub async fn disconnect(&self, topic: &str, reason: Option<JsonRpcError>) -> Result<()> {
        self.engine
            .disconnect(topic, reason.unwrap_or_else(user_disconnected))
            .await
    }

    pub async fn get_sessions(&self) -> Vec<Session> {
        self.engine.get_sessions().await
    }

    pub async fn get_session(&self, topic: &str) -> Result<Session> {
        self.engine.get_session(topic).await
    }

    pub async fn get_proposals(&self) -> Vec<Proposal> {
        self.engine.get_proposals().await
    }

    pub async fn get_pending_requests(&self) -> Vec<PendingRequest> {
        self.engine.get_pending_requests().await
    }

    pub async fn find_sessions_by_pairing(&self, pairing_topic: &str) -> Vec<Session> {
        self.engine.find_sessions_by_pairing(pairing_topic).await
    }

    /// Close the relay connection and stop the expirer.
    pub async fn shutdown(&self) -> Result<()> {
        self.core.shutdown().await
    }
}
