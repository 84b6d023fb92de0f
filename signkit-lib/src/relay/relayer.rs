use super::{
    PublishParams, RelayProtocol, RelayTransport, SubscribeParams, Subscription, SubscriptionParams,
    SubscriptionStore, TransportEvent, UnsubscribeParams, IRN_PUBLISH, IRN_SUBSCRIBE,
    IRN_SUBSCRIPTION, IRN_UNSUBSCRIBE,
};
use crate::config::CoreConfig;
use crate::constants::SUBSCRIPTION_TTL;
use crate::crypto::{Crypto, DecodeOptions, EncodeOptions};
use crate::history::JsonRpcHistory;
use crate::jsonrpc::{
    wait_for_response, JsonRpcPayload, JsonRpcRequest, JsonRpcResponse, ResponseWaiters,
};
use crate::{now_secs, Result, SignkitError};
use serde_json::{json, Value};
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::{broadcast, mpsc};

const EVENT_CAPACITY: usize = 1024;

/// Waiters for relay RPCs all share this pseudo-topic.
const RELAY_RPC: &str = "relay";

/// Events emitted by the relayer.
#[derive(Clone, Debug, PartialEq)]
pub enum RelayerEvent {
    /// Connected and every stored subscription re-established.
    Connect,
    /// The transport dropped; a reconnect is scheduled.
    Disconnect,
    /// A decrypted, deduplicated peer payload.
    Message {
        topic: String,
        payload: JsonRpcPayload,
        published_at: u64,
    },
    Error(String),
}

/// Per-publish options.
#[derive(Clone, Debug)]
pub struct PublishOptions {
    /// Relay-side time to live in seconds.
    pub ttl: u64,
    /// Relay tag identifying the protocol message.
    pub tag: u32,
    /// Propagate relay failures instead of queueing the message for replay.
    pub throw_on_failed_publish: bool,
    /// Chain id recorded with outbound requests.
    pub chain_id: Option<String>,
}

impl Default for PublishOptions {
    fn default() -> Self {
        Self {
            ttl: 6 * 60 * 60,
            tag: 0,
            throw_on_failed_publish: false,
            chain_id: None,
        }
    }
}

impl PublishOptions {
    pub fn new(ttl: u64, tag: u32) -> Self {
        Self {
            ttl,
            tag,
            ..Self::default()
        }
    }

    pub fn throwing(mut self) -> Self {
        self.throw_on_failed_publish = true;
        self
    }

    pub fn with_chain_id(mut self, chain_id: impl Into<String>) -> Self {
        self.chain_id = Some(chain_id.into());
        self
    }
}

struct QueuedPublish {
    topic: String,
    message: String,
    payload: JsonRpcPayload,
    opts: PublishOptions,
}

/// Owns the transport. Publishes, subscribes and turns relay pushes into
/// [`RelayerEvent::Message`]s.
pub struct Relayer {
    config: CoreConfig,
    transport: Arc<dyn RelayTransport>,
    crypto: Arc<Crypto>,
    history: Arc<JsonRpcHistory>,
    subscriptions: Arc<SubscriptionStore>,
    events: broadcast::Sender<RelayerEvent>,
    rpc_waiters: ResponseWaiters,
    connected: AtomicBool,
    closing: AtomicBool,
    /// Bumped on every connect and when a connection is retired. A reader
    /// whose generation is stale exits quietly.
    generation: AtomicU64,
    reconnecting: AtomicBool,
    publish_queue: Mutex<VecDeque<QueuedPublish>>,
    subscribing: Mutex<HashSet<String>>,
}

impl Relayer {
    pub fn new(
        config: CoreConfig,
        transport: Arc<dyn RelayTransport>,
        crypto: Arc<Crypto>,
        history: Arc<JsonRpcHistory>,
        subscriptions: Arc<SubscriptionStore>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            config,
            transport,
            crypto,
            history,
            subscriptions,
            events,
            rpc_waiters: ResponseWaiters::new(),
            connected: AtomicBool::new(false),
            closing: AtomicBool::new(false),
            generation: AtomicU64::new(0),
            reconnecting: AtomicBool::new(false),
            publish_queue: Mutex::new(VecDeque::new()),
            subscribing: Mutex::new(HashSet::new()),
        }
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<RelayerEvent> {
        self.events.subscribe()
    }

    pub fn subscriptions(&self) -> &Arc<SubscriptionStore> {
        &self.subscriptions
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Restore subscriptions, connect and re-subscribe everything restored.
    #[tracing::instrument(skip(self), fields(relay = %self.config.relay_url))]
    pub async fn init(self: &Arc<Self>) -> Result<()> {
        self.subscriptions.init().await?;
        self.subscriptions.watch_expirations();
        self.open().await?;
        tracing::info!(
            subscriptions = self.subscriptions.len().await,
            "relayer connected"
        );
        Ok(())
    }

    /// Close the transport without scheduling a reconnect.
    pub async fn close(&self) -> Result<()> {
        self.closing.store(true, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
        self.rpc_waiters
            .reject_topic(RELAY_RPC, SignkitError::Transport("relayer closed".into()));
        self.transport.disconnect().await
    }

    /// Encrypt `payload` for `topic` and publish it.
    ///
    /// Requests are recorded in history before they go out, so a fast response
    /// always finds its record. Responses resolve their record once published.
    #[tracing::instrument(skip(self, payload, opts), fields(id = payload.id(), tag = opts.tag))]
    pub async fn publish(
        &self,
        topic: &str,
        payload: &JsonRpcPayload,
        opts: PublishOptions,
    ) -> Result<()> {
        let message = self
            .crypto
            .encode(topic, payload, &EncodeOptions::default())
            .await?;

        if let JsonRpcPayload::Request(request) = payload {
            self.history
                .set(topic, request, opts.chain_id.clone())
                .await?;
        }

        match self.relay_publish(topic, &message, &opts).await {
            Ok(()) => {
                if let JsonRpcPayload::Response(response) = payload {
                    self.history.resolve(response).await?;
                }
                Ok(())
            }
            Err(e) if opts.throw_on_failed_publish => {
                if let JsonRpcPayload::Request(request) = payload {
                    self.history.delete(topic, Some(request.id)).await?;
                }
                Err(SignkitError::PublishFailed(e.to_string()))
            }
            Err(e) => {
                tracing::warn!(topic, error = %e, "publish failed");
                if self.config.publish_retry {
                    let mut queue = self.publish_queue.lock().unwrap_or_else(|e| e.into_inner());
                    queue.push_back(QueuedPublish {
                        topic: topic.to_string(),
                        message,
                        payload: payload.clone(),
                        opts,
                    });
                }
                Ok(())
            }
        }
    }

    /// Subscribe to `topic`, returning the relay subscription id.
    ///
    /// Subscribing to a topic that already has a live subscription returns
    /// the existing id.
    #[tracing::instrument(skip(self))]
    pub async fn subscribe(&self, topic: &str) -> Result<String> {
        if let Some(id) = self.subscriptions.ids_for(topic).into_iter().next() {
            return Ok(id);
        }
        self.mark_subscribing(topic, true);
        let result = self.subscribe_new(topic).await;
        self.mark_subscribing(topic, false);
        let id = result?;
        tracing::debug!(topic, id, "subscribed");
        Ok(id)
    }

    async fn subscribe_new(&self, topic: &str) -> Result<String> {
        let id = self.relay_subscribe(topic).await?;
        self.subscriptions
            .set(Subscription {
                id: id.clone(),
                topic: topic.to_string(),
                relay: RelayProtocol::default(),
                expiry: now_secs() + SUBSCRIPTION_TTL,
            })
            .await?;
        Ok(id)
    }

    /// Topics with a subscribe in flight. The relay may push stored messages
    /// before the subscribe call has recorded the new id.
    fn mark_subscribing(&self, topic: &str, pending: bool) {
        let mut subscribing = self.subscribing.lock().unwrap_or_else(|e| e.into_inner());
        if pending {
            subscribing.insert(topic.to_string());
        } else {
            subscribing.remove(topic);
        }
    }

    fn accepts_topic(&self, topic: &str) -> bool {
        if self.subscriptions.is_subscribed(topic) {
            return true;
        }
        let subscribing = self.subscribing.lock().unwrap_or_else(|e| e.into_inner());
        subscribing.contains(topic)
    }

    /// Unsubscribe from `topic` and forget its history.
    #[tracing::instrument(skip(self))]
    pub async fn unsubscribe(&self, topic: &str) -> Result<()> {
        for id in self.subscriptions.ids_for(topic) {
            let params = serde_json::to_value(UnsubscribeParams {
                topic: topic.to_string(),
                id: id.clone(),
            })?;
            if let Err(e) = self.relay_request(IRN_UNSUBSCRIBE, params).await {
                tracing::warn!(topic, id, error = %e, "relay unsubscribe failed");
            }
            self.subscriptions.delete(&id, "unsubscribe").await?;
        }
        self.history.delete(topic, None).await
    }

    /// Drop local subscription state and history for `topic` without telling
    /// the relay. Used when the topic lapsed on both sides.
    pub async fn forget_topic(&self, topic: &str) -> Result<()> {
        self.subscriptions.delete_topic(topic, "expired").await?;
        self.history.delete(topic, None).await
    }

    async fn relay_publish(&self, topic: &str, message: &str, opts: &PublishOptions) -> Result<()> {
        let params = serde_json::to_value(PublishParams {
            topic: topic.to_string(),
            message: message.to_string(),
            ttl: opts.ttl,
            tag: opts.tag,
        })?;
        self.relay_request(IRN_PUBLISH, params).await.map(|_| ())
    }

    async fn relay_subscribe(&self, topic: &str) -> Result<String> {
        let params = serde_json::to_value(SubscribeParams {
            topic: topic.to_string(),
        })?;
        match self.relay_request(IRN_SUBSCRIBE, params).await? {
            Value::String(id) => Ok(id),
            other => Err(SignkitError::Transport(format!(
                "unexpected subscribe result: {}",
                other
            ))),
        }
    }

    /// One relay RPC round trip.
    async fn relay_request(&self, method: &str, params: Value) -> Result<Value> {
        let request = JsonRpcRequest::new(method, params);
        let rx = self.rpc_waiters.register(request.id, RELAY_RPC);
        let frame = serde_json::to_string(&request)?;
        if let Err(e) = self.transport.send(frame).await {
            self.rpc_waiters.remove(request.id);
            return Err(e);
        }
        wait_for_response(rx, self.config.rpc_timeout, method).await
    }

    /// Connect, start reading, re-subscribe and flush queued publishes.
    /// Returns the generation of the new connection.
    async fn open(self: &Arc<Self>) -> Result<u64> {
        self.closing.store(false, Ordering::SeqCst);
        let rx = self.transport.connect().await?;
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.spawn_reader(rx, generation);
        if let Err(e) = self.resubscribe_all().await {
            // Retire this connection so its reader does not schedule a
            // reconnect of its own.
            self.retire(generation);
            if let Err(close_err) = self.transport.disconnect().await {
                tracing::debug!(error = %close_err, "disconnect after failed resubscribe");
            }
            return Err(e);
        }
        if self.generation.load(Ordering::SeqCst) != generation {
            return Err(SignkitError::Transport(
                "connection closed while resubscribing".into(),
            ));
        }
        self.connected.store(true, Ordering::SeqCst);
        self.flush_publish_queue().await;
        let _ = self.events.send(RelayerEvent::Connect);
        Ok(generation)
    }

    /// Mark connection `generation` as gone. False if it was already retired
    /// or superseded.
    fn retire(&self, generation: u64) -> bool {
        self.generation
            .compare_exchange(generation, generation + 1, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Re-issue every stored subscription. Relay ids are connection-scoped,
    /// so each one is replaced by a fresh id and the old id is deleted.
    async fn resubscribe_all(&self) -> Result<()> {
        for sub in self.subscriptions.values().await {
            let new_id = self.relay_subscribe(&sub.topic).await?;
            if new_id == sub.id {
                continue;
            }
            self.subscriptions
                .set(Subscription {
                    id: new_id.clone(),
                    ..sub.clone()
                })
                .await?;
            self.subscriptions.delete(&sub.id, "RESUBSCRIBED").await?;
            tracing::debug!(topic = %sub.topic, old = %sub.id, new = %new_id, "resubscribed");
        }
        Ok(())
    }

    async fn flush_publish_queue(&self) {
        let queued: Vec<QueuedPublish> = {
            let mut queue = self.publish_queue.lock().unwrap_or_else(|e| e.into_inner());
            queue.drain(..).collect()
        };
        for item in queued {
            match self.relay_publish(&item.topic, &item.message, &item.opts).await {
                Ok(()) => {
                    tracing::debug!(topic = %item.topic, id = item.payload.id(), "replayed publish");
                    if let JsonRpcPayload::Response(response) = &item.payload {
                        if let Err(e) = self.history.resolve(response).await {
                            tracing::warn!(error = %e, "failed to record replayed response");
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(topic = %item.topic, error = %e, "replay failed, requeueing");
                    let mut queue = self.publish_queue.lock().unwrap_or_else(|e| e.into_inner());
                    queue.push_back(item);
                }
            }
        }
    }

    fn spawn_reader(
        self: &Arc<Self>,
        mut rx: mpsc::UnboundedReceiver<TransportEvent>,
        generation: u64,
    ) {
        let weak: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let Some(relayer) = weak.upgrade() else {
                    return;
                };
                match event {
                    TransportEvent::Message(frame) => relayer.on_frame(&frame).await,
                    TransportEvent::Closed => break,
                }
            }
            if let Some(relayer) = weak.upgrade() {
                if relayer.retire(generation) {
                    relayer.on_transport_closed();
                } else {
                    tracing::debug!(generation, "superseded connection closed");
                }
            }
        });
    }

    fn on_transport_closed(self: &Arc<Self>) {
        self.connected.store(false, Ordering::SeqCst);
        self.rpc_waiters
            .reject_topic(RELAY_RPC, SignkitError::Transport("connection closed".into()));
        if self.closing.load(Ordering::SeqCst) {
            return;
        }
        let _ = self.events.send(RelayerEvent::Disconnect);
        // One reconnect loop at a time.
        if self
            .reconnecting
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        tracing::warn!("relay transport closed, reconnecting");

        let weak = Arc::downgrade(self);
        let backoff = self.config.reconnect_backoff;
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(backoff).await;
                let Some(relayer) = weak.upgrade() else {
                    return;
                };
                if relayer.closing.load(Ordering::SeqCst) {
                    relayer.reconnecting.store(false, Ordering::SeqCst);
                    return;
                }
                match relayer.open().await {
                    Ok(generation) => {
                        relayer.reconnecting.store(false, Ordering::SeqCst);
                        tracing::info!("relay reconnected");
                        // Dropped again before the flag cleared.
                        if relayer.generation.load(Ordering::SeqCst) != generation {
                            relayer.on_transport_closed();
                        }
                        return;
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "reconnect failed");
                        let _ = relayer.events.send(RelayerEvent::Error(e.to_string()));
                    }
                }
            }
        });
    }

    async fn on_frame(&self, frame: &str) {
        let payload: JsonRpcPayload = match serde_json::from_str(frame) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!(error = %e, "dropping malformed relay frame");
                return;
            }
        };
        match payload {
            JsonRpcPayload::Response(response) => {
                if !self.rpc_waiters.resolve(&response) {
                    tracing::debug!(id = response.id(), "relay response without waiter");
                }
            }
            JsonRpcPayload::Request(request) if request.method == IRN_SUBSCRIPTION => {
                self.on_subscription(request).await;
            }
            JsonRpcPayload::Request(request) => {
                tracing::debug!(method = %request.method, "ignoring unsupported relay request");
            }
        }
    }

    async fn on_subscription(&self, request: JsonRpcRequest) {
        let params: SubscriptionParams = match serde_json::from_value(request.params.clone()) {
            Ok(params) => params,
            Err(e) => {
                tracing::warn!(error = %e, "malformed subscription push");
                return;
            }
        };
        let topic = params.data.topic.as_str();

        // Left unacknowledged so the relay keeps the message.
        if !self.accepts_topic(topic) {
            tracing::debug!(topic, id = %params.id, "push for unsubscribed topic");
            return;
        }

        match self.accept_push(&params).await {
            Ok(Some(payload)) => {
                let _ = self.events.send(RelayerEvent::Message {
                    topic: topic.to_string(),
                    payload,
                    published_at: params.data.published_at,
                });
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(topic, error = %e, "dropping undecodable message");
                let _ = self.events.send(RelayerEvent::Error(e.to_string()));
            }
        }
        self.acknowledge(request.id).await;
    }

    /// Decode a push and record it. `None` means a duplicate to drop.
    async fn accept_push(&self, params: &SubscriptionParams) -> Result<Option<JsonRpcPayload>> {
        let topic = params.data.topic.as_str();
        let payload = self
            .crypto
            .decode(topic, &params.data.message, &DecodeOptions::default())
            .await?;

        match &payload {
            JsonRpcPayload::Request(request) => {
                if self.history.find(request.id).await.is_some() {
                    tracing::debug!(topic, id = request.id, "duplicate request dropped");
                    return Ok(None);
                }
                self.history.set(topic, request, None).await?;
            }
            JsonRpcPayload::Response(response) => {
                match self.history.find(response.id()).await {
                    Some(record) if !record.is_resolved() => {}
                    _ => {
                        tracing::debug!(topic, id = response.id(), "stale response dropped");
                        return Ok(None);
                    }
                }
                self.history.resolve(response).await?;
            }
        }
        Ok(Some(payload))
    }

    async fn acknowledge(&self, id: u64) {
        let ack = JsonRpcResponse::result(id, json!(true));
        match serde_json::to_string(&ack) {
            Ok(frame) => {
                if let Err(e) = self.transport.send(frame).await {
                    tracing::debug!(error = %e, "failed to acknowledge push");
                }
            }
            Err(e) => tracing::error!(error = %e, "failed to serialize ack"),
        }
    }
}

impl Drop for Relayer {
    fn drop(&mut self) {
        self.closing.store(true, Ordering::SeqCst);
    }
}
