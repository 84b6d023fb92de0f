//! Pairing controller.
//!
//! A pairing is the long-lived topic two peers share before (and between)
//! sessions. One side creates it and hands out a URI; the other side pairs
//! from that URI. It starts inactive with a short expiry and is activated
//! once a session settles over it.

mod types;

pub use types::{CreatedPairing, Metadata, Pairing, PairingEvent, WC_PAIRING_DELETE, WC_PAIRING_PING};

use crate::constants::{FIVE_MINUTES, THIRTY_DAYS};
use crate::crypto::keys::generate_random_bytes32;
use crate::crypto::Crypto;
use crate::errors::SdkError;
use crate::expirer::{Expirer, ExpirerEvent, ExpirerTarget};
use crate::jsonrpc::{
    wait_for_response, JsonRpcPayload, JsonRpcRequest, JsonRpcResponse, ResponseWaiters,
};
use crate::relay::{RelayProtocol, Relayer, RelayerEvent};
use crate::storage::{KeyValueStorage, PersistedStore};
use crate::uri::{parse_uri, PairingUri};
use crate::{now_secs, Result, SignkitError};
use serde_json::json;
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use types::pairing_rpc_opts;

const EVENT_CAPACITY: usize = 256;
const PING_TIMEOUT: Duration = Duration::from_secs(30);

pub struct PairingController {
    pairings: PersistedStore<Pairing>,
    registered_methods: Mutex<BTreeSet<String>>,
    crypto: Arc<Crypto>,
    relayer: Arc<Relayer>,
    expirer: Arc<Expirer>,
    waiters: ResponseWaiters,
    events: broadcast::Sender<PairingEvent>,
}

impl PairingController {
    pub fn new(
        storage: Arc<dyn KeyValueStorage>,
        storage_key: String,
        crypto: Arc<Crypto>,
        relayer: Arc<Relayer>,
        expirer: Arc<Expirer>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            pairings: PersistedStore::new(storage, storage_key, "pairing"),
            registered_methods: Mutex::new(BTreeSet::new()),
            crypto,
            relayer,
            expirer,
            waiters: ResponseWaiters::new(),
            events,
        }
    }

    /// Restore pairings and start handling pairing-scope traffic and expiry.
    pub async fn init(self: &Arc<Self>) -> Result<()> {
        self.pairings.init().await?;
        self.spawn_listener();
        Ok(())
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<PairingEvent> {
        self.events.subscribe()
    }

    /// Create an inactive pairing and the URI to share with the peer.
    #[tracing::instrument(skip(self))]
    pub async fn create(&self) -> Result<CreatedPairing> {
        let sym_key = generate_random_bytes32();
        let topic = self.crypto.set_sym_key(&sym_key, None).await?;
        let expiry = now_secs() + FIVE_MINUTES;
        let methods = self.registered_methods();
        let pairing = Pairing {
            topic: topic.clone(),
            expiry,
            relay: RelayProtocol::default(),
            active: false,
            peer_metadata: None,
            methods: (!methods.is_empty()).then(|| methods.clone()),
        };
        self.pairings.set(&topic, pairing.clone()).await?;
        self.relayer.subscribe(&topic).await?;
        self.expirer.set(ExpirerTarget::topic(&topic), expiry).await?;

        let mut uri = PairingUri::new(&topic, sym_key).with_expiry(expiry);
        uri.relay = pairing.relay;
        if !methods.is_empty() {
            uri = uri.with_methods(methods);
        }
        tracing::info!(topic, "pairing created");
        Ok(CreatedPairing {
            topic,
            uri: uri.to_string(),
        })
    }

    /// Join the pairing described by `uri`.
    #[tracing::instrument(skip(self, uri))]
    pub async fn pair(&self, uri: &str) -> Result<Pairing> {
        let params = parse_uri(uri)?;
        let now = now_secs();
        if params.expiry_timestamp.is_some_and(|e| e <= now) {
            return Err(SignkitError::expired("pairing", &params.topic));
        }
        if let Some(existing) = self.pairings.get_optional(&params.topic).await {
            if existing.active {
                return Err(SignkitError::validation(format!(
                    "pairing already exists and is active: {}",
                    params.topic
                )));
            }
        }

        let expiry = params.expiry_timestamp.unwrap_or(now + FIVE_MINUTES);
        let pairing = Pairing {
            topic: params.topic.clone(),
            expiry,
            relay: params.relay,
            active: false,
            peer_metadata: None,
            methods: params.methods,
        };
        self.crypto
            .set_sym_key(&params.sym_key, Some(&params.topic))
            .await?;
        self.pairings.set(&pairing.topic, pairing.clone()).await?;
        self.expirer
            .set(ExpirerTarget::topic(&pairing.topic), expiry)
            .await?;
        self.relayer.subscribe(&pairing.topic).await?;
        tracing::info!(topic = %pairing.topic, "paired");
        Ok(pairing)
    }

    /// Mark a pairing active and extend it to the long-lived expiry.
    pub async fn activate(&self, topic: &str) -> Result<()> {
        let expiry = now_secs() + THIRTY_DAYS;
        self.pairings
            .update(topic, |p| {
                p.active = true;
                p.expiry = expiry;
            })
            .await?;
        self.expirer.set(ExpirerTarget::topic(topic), expiry).await
    }

    /// Methods accepted on inactive pairings, in addition to ping and delete.
    pub fn register(&self, methods: &[&str]) {
        let mut registered = self
            .registered_methods
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        registered.extend(methods.iter().map(|m| m.to_string()));
    }

    pub fn registered_methods(&self) -> Vec<String> {
        let registered = self
            .registered_methods
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        registered.iter().cloned().collect()
    }

    pub async fn update_expiry(&self, topic: &str, expiry: u64) -> Result<()> {
        self.pairings.update(topic, |p| p.expiry = expiry).await?;
        self.expirer.set(ExpirerTarget::topic(topic), expiry).await
    }

    pub async fn update_metadata(&self, topic: &str, metadata: Metadata) -> Result<()> {
        self.pairings
            .update(topic, |p| p.peer_metadata = Some(metadata))
            .await
            .map(|_| ())
    }

    pub async fn get_pairings(&self) -> Vec<Pairing> {
        self.pairings.values().await
    }

    /// Fails with `NoMatchingKey` for an unknown topic.
    pub async fn get_pairing(&self, topic: &str) -> Result<Pairing> {
        self.pairings.get(topic).await
    }

    pub async fn contains(&self, topic: &str) -> bool {
        self.pairings.contains(topic).await
    }

    /// Whether `method` may be sent to us over `topic`.
    pub async fn is_method_allowed(&self, topic: &str, method: &str) -> bool {
        if method == WC_PAIRING_PING || method == WC_PAIRING_DELETE {
            return true;
        }
        match self.pairings.get_optional(topic).await {
            Some(pairing) if pairing.active => true,
            Some(_) => self.registered_methods().iter().any(|m| m == method),
            None => false,
        }
    }

    /// Ping the peer and wait for its answer.
    #[tracing::instrument(skip(self))]
    pub async fn ping(&self, topic: &str) -> Result<()> {
        self.valid_pairing(topic).await?;
        let request = JsonRpcRequest::new(WC_PAIRING_PING, json!({}));
        let rx = self.waiters.register(request.id, topic);
        let opts = pairing_rpc_opts(WC_PAIRING_PING, false).throwing();
        if let Err(e) = self
            .relayer
            .publish(topic, &request.clone().into(), opts)
            .await
        {
            self.waiters.remove(request.id);
            return Err(e);
        }
        wait_for_response(rx, PING_TIMEOUT, WC_PAIRING_PING).await?;
        Ok(())
    }

    /// Tell the peer we are leaving, then tear the pairing down.
    #[tracing::instrument(skip(self))]
    pub async fn disconnect(&self, topic: &str) -> Result<()> {
        self.pairings.get(topic).await?;
        let request = JsonRpcRequest::new(
            WC_PAIRING_DELETE,
            serde_json::to_value(SdkError::UserDisconnected.to_rpc_error())?,
        );
        self.relayer
            .publish(topic, &request.into(), pairing_rpc_opts(WC_PAIRING_DELETE, false))
            .await?;
        self.delete_pairing(topic, false).await
    }

    /// Remove a pairing with its keys, subscription and history.
    ///
    /// With `expirer_has_deleted` the topic lapsed: no unsubscribe goes out
    /// and the expirer entry is already gone.
    pub async fn delete_pairing(&self, topic: &str, expirer_has_deleted: bool) -> Result<()> {
        if expirer_has_deleted {
            self.relayer.forget_topic(topic).await?;
        } else {
            self.relayer.unsubscribe(topic).await?;
            self.expirer.del(&ExpirerTarget::topic(topic)).await?;
        }
        self.pairings.delete(topic, "pairing deleted").await?;
        self.crypto.delete_sym_key(topic).await?;
        self.waiters
            .reject_topic(topic, SignkitError::no_matching_key("pairing", topic));
        Ok(())
    }

    async fn valid_pairing(&self, topic: &str) -> Result<Pairing> {
        let pairing = self.pairings.get(topic).await?;
        if pairing.expiry <= now_secs() {
            self.delete_pairing(topic, false).await?;
            return Err(SignkitError::expired("pairing", topic));
        }
        Ok(pairing)
    }

    fn spawn_listener(self: &Arc<Self>) {
        let mut relay_events = self.relayer.subscribe_events();
        let mut expirer_events = self.expirer.subscribe();
        let weak: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = relay_events.recv() => match event {
                        Ok(RelayerEvent::Message { topic, payload, .. }) => {
                            let Some(this) = weak.upgrade() else { break };
                            this.on_message(&topic, payload).await;
                        }
                        Ok(_) => {}
                        Err(RecvError::Lagged(skipped)) => {
                            tracing::warn!(skipped, "pairing controller lagged behind relayer");
                        }
                        Err(RecvError::Closed) => break,
                    },
                    event = expirer_events.recv() => match event {
                        Ok(ExpirerEvent::Expired { target: ExpirerTarget::Topic(topic), .. }) => {
                            let Some(this) = weak.upgrade() else { break };
                            this.on_expired(&topic).await;
                        }
                        Ok(_) => {}
                        Err(RecvError::Lagged(skipped)) => {
                            tracing::warn!(skipped, "pairing controller lagged behind expirer");
                        }
                        Err(RecvError::Closed) => break,
                    },
                }
            }
        });
    }

    async fn on_message(&self, topic: &str, payload: JsonRpcPayload) {
        if !self.pairings.contains(topic).await {
            return;
        }
        let request = match payload {
            JsonRpcPayload::Response(response) => {
                self.waiters.resolve(&response);
                return;
            }
            JsonRpcPayload::Request(request) => request,
        };

        if !self.is_method_allowed(topic, &request.method).await {
            tracing::warn!(topic, method = %request.method, "method not allowed on pairing");
            self.respond(
                topic,
                &request.method,
                JsonRpcResponse::error(
                    request.id,
                    SdkError::WcMethodUnsupported.with_context(&request.method),
                ),
            )
            .await;
            return;
        }

        match request.method.as_str() {
            WC_PAIRING_PING => {
                self.respond(topic, WC_PAIRING_PING, JsonRpcResponse::result(request.id, json!(true)))
                    .await;
                let _ = self.events.send(PairingEvent::Ping {
                    topic: topic.to_string(),
                    id: request.id,
                });
            }
            WC_PAIRING_DELETE => {
                self.respond(topic, WC_PAIRING_DELETE, JsonRpcResponse::result(request.id, json!(true)))
                    .await;
                if let Err(e) = self.delete_pairing(topic, false).await {
                    tracing::warn!(topic, error = %e, "failed to delete pairing");
                }
                tracing::info!(topic, "pairing deleted by peer");
                let _ = self.events.send(PairingEvent::Delete {
                    topic: topic.to_string(),
                });
            }
            // Session-scope methods on the pairing topic belong to the engine.
            _ => {}
        }
    }

    async fn respond(&self, topic: &str, method: &str, response: JsonRpcResponse) {
        if let Err(e) = self
            .relayer
            .publish(topic, &response.into(), pairing_rpc_opts(method, true))
            .await
        {
            tracing::warn!(topic, method, error = %e, "failed to answer pairing request");
        }
    }

    async fn on_expired(&self, topic: &str) {
        if !self.pairings.contains(topic).await {
            return;
        }
        if let Err(e) = self.delete_pairing(topic, true).await {
            tracing::warn!(topic, error = %e, "failed to delete expired pairing");
        }
        tracing::debug!(topic, "pairing expired");
        let _ = self.events.send(PairingEvent::Expire {
            topic: topic.to_string(),
        });
    }
}
