//! In-process relay server for end-to-end tests.

use crate::jsonrpc::{payload_id, JsonRpcPayload, JsonRpcRequest, JsonRpcResponse};
use crate::relay::{
    PublishParams, RelayTransport, SubscribeParams, SubscriptionData, SubscriptionParams,
    TransportEvent, UnsubscribeParams, IRN_PUBLISH, IRN_SUBSCRIBE, IRN_SUBSCRIPTION,
    IRN_UNSUBSCRIBE,
};
use crate::{now_secs, Result, SignkitError};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

#[derive(Clone)]
struct StoredMessage {
    id: u64,
    topic: String,
    message: String,
    tag: u32,
    published_at: u64,
    expires_at: u64,
    publisher: u64,
    acked_by: HashSet<u64>,
}

struct RelaySubscription {
    client: u64,
    topic: String,
}

#[derive(Default)]
struct RelayState {
    next_client: u64,
    next_subscription: u64,
    next_message: u64,
    offline: bool,
    clients: HashMap<u64, mpsc::UnboundedSender<TransportEvent>>,
    subscriptions: HashMap<String, RelaySubscription>,
    mailbox: Vec<StoredMessage>,
    /// push request id -> (client, message id)
    in_flight: HashMap<u64, (u64, u64)>,
    published: usize,
}

/// A relay that lives in the test process.
///
/// Published messages stay in a mailbox until they expire; a message is
/// pushed to every subscriber except its publisher and redelivered on each
/// new subscription until that client acknowledges it.
#[derive(Default)]
pub struct MemoryRelay {
    state: Mutex<RelayState>,
}

impl MemoryRelay {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// A transport for a new client. The client id stays the same across
    /// reconnects of that transport.
    pub fn transport(self: &Arc<Self>) -> Arc<MemoryTransport> {
        let mut state = self.lock();
        state.next_client += 1;
        Arc::new(MemoryTransport {
            relay: self.clone(),
            client: state.next_client,
        })
    }

    /// Drop every connection as if the server restarted.
    pub fn disconnect_all(&self) {
        let mut state = self.lock();
        let clients: Vec<u64> = state.clients.keys().copied().collect();
        for client in clients {
            Self::drop_client(&mut state, client);
        }
    }

    pub fn disconnect_client(&self, client: u64) {
        let mut state = self.lock();
        Self::drop_client(&mut state, client);
    }

    /// While offline every connection attempt fails.
    pub fn set_offline(&self, offline: bool) {
        self.lock().offline = offline;
    }

    pub fn subscription_count(&self) -> usize {
        self.lock().subscriptions.len()
    }

    pub fn subscription_ids(&self, client: u64) -> Vec<String> {
        let state = self.lock();
        state
            .subscriptions
            .iter()
            .filter(|(_, s)| s.client == client)
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn published_count(&self) -> usize {
        self.lock().published
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RelayState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn drop_client(state: &mut RelayState, client: u64) {
        if let Some(tx) = state.clients.remove(&client) {
            let _ = tx.send(TransportEvent::Closed);
        }
        state.subscriptions.retain(|_, s| s.client != client);
        state.in_flight.retain(|_, (c, _)| *c != client);
    }

    fn connect(&self, client: u64) -> Result<mpsc::UnboundedReceiver<TransportEvent>> {
        let mut state = self.lock();
        if state.offline {
            return Err(SignkitError::Transport("relay offline".into()));
        }
        Self::drop_client(&mut state, client);
        let (tx, rx) = mpsc::unbounded_channel();
        state.clients.insert(client, tx);
        Ok(rx)
    }

    fn handle_frame(&self, client: u64, frame: &str) -> Result<()> {
        let mut state = self.lock();
        if !state.clients.contains_key(&client) {
            return Err(SignkitError::Transport("not connected".into()));
        }
        let payload: JsonRpcPayload = serde_json::from_str(frame)?;
        match payload {
            JsonRpcPayload::Response(ack) => {
                if let Some((acker, message_id)) = state.in_flight.remove(&ack.id()) {
                    if let Some(stored) = state.mailbox.iter_mut().find(|m| m.id == message_id) {
                        stored.acked_by.insert(acker);
                    }
                }
                Ok(())
            }
            JsonRpcPayload::Request(request) => {
                let result = Self::handle_request(&mut state, client, &request);
                let response = match result {
                    Ok(value) => JsonRpcResponse::result(request.id, value),
                    Err(e) => JsonRpcResponse::error(request.id, e.to_rpc_error()),
                };
                Self::send(&state, client, &JsonRpcPayload::Response(response));
                if request.method == IRN_SUBSCRIBE {
                    Self::deliver_stored(&mut state, client, &request);
                }
                Ok(())
            }
        }
    }

    fn handle_request(state: &mut RelayState, client: u64, request: &JsonRpcRequest) -> Result<Value> {
        let now = now_secs();
        state.mailbox.retain(|m| m.expires_at > now);
        match request.method.as_str() {
            IRN_PUBLISH => {
                let params: PublishParams = serde_json::from_value(request.params.clone())?;
                state.next_message += 1;
                let stored = StoredMessage {
                    id: state.next_message,
                    topic: params.topic,
                    message: params.message,
                    tag: params.tag,
                    published_at: now,
                    expires_at: now + params.ttl,
                    publisher: client,
                    acked_by: HashSet::new(),
                };
                let targets: Vec<(String, u64)> = state
                    .subscriptions
                    .iter()
                    .filter(|(_, s)| s.topic == stored.topic && s.client != client)
                    .map(|(id, s)| (id.clone(), s.client))
                    .collect();
                for (sub_id, target) in targets {
                    Self::push(state, target, &sub_id, &stored);
                }
                state.mailbox.push(stored);
                state.published += 1;
                Ok(json!(true))
            }
            IRN_SUBSCRIBE => {
                let params: SubscribeParams = serde_json::from_value(request.params.clone())?;
                state.next_subscription += 1;
                let id = format!("sub-{}", state.next_subscription);
                state.subscriptions.insert(
                    id.clone(),
                    RelaySubscription {
                        client,
                        topic: params.topic,
                    },
                );
                Ok(Value::String(id))
            }
            IRN_UNSUBSCRIBE => {
                let params: UnsubscribeParams = serde_json::from_value(request.params.clone())?;
                state.subscriptions.remove(&params.id);
                Ok(json!(true))
            }
            other => Err(SignkitError::validation(format!("unsupported method {}", other))),
        }
    }

    /// Push mailbox messages the client has not acknowledged to a fresh
    /// subscription.
    fn deliver_stored(state: &mut RelayState, client: u64, request: &JsonRpcRequest) {
        let Ok(params) = serde_json::from_value::<SubscribeParams>(request.params.clone()) else {
            return;
        };
        let Some(sub_id) = state
            .subscriptions
            .iter()
            .filter(|(_, s)| s.client == client && s.topic == params.topic)
            .map(|(id, _)| id.clone())
            .max_by_key(|id| id.trim_start_matches("sub-").parse::<u64>().unwrap_or(0))
        else {
            return;
        };
        let pending: Vec<StoredMessage> = state
            .mailbox
            .iter()
            .filter(|m| {
                m.topic == params.topic && m.publisher != client && !m.acked_by.contains(&client)
            })
            .cloned()
            .collect();
        for message in pending {
            Self::push(state, client, &sub_id, &message);
        }
    }

    fn push(state: &mut RelayState, client: u64, sub_id: &str, message: &StoredMessage) {
        let push_id = payload_id();
        let params = SubscriptionParams {
            id: sub_id.to_string(),
            data: SubscriptionData {
                topic: message.topic.clone(),
                message: message.message.clone(),
                published_at: message.published_at,
                tag: message.tag,
            },
        };
        let Ok(params) = serde_json::to_value(params) else {
            return;
        };
        let request = JsonRpcRequest::with_id(push_id, IRN_SUBSCRIPTION, params);
        state.in_flight.insert(push_id, (client, message.id));
        Self::send(state, client, &JsonRpcPayload::Request(request));
    }

    fn send(state: &RelayState, client: u64, payload: &JsonRpcPayload) {
        let Some(tx) = state.clients.get(&client) else {
            return;
        };
        if let Ok(frame) = serde_json::to_string(payload) {
            let _ = tx.send(TransportEvent::Message(frame));
        }
    }
}

/// One client's connection to a [`MemoryRelay`].
pub struct MemoryTransport {
    relay: Arc<MemoryRelay>,
    client: u64,
}

impl MemoryTransport {
    pub fn client_id(&self) -> u64 {
        self.client
    }
}

#[async_trait]
impl RelayTransport for MemoryTransport {
    async fn connect(&self) -> Result<mpsc::UnboundedReceiver<TransportEvent>> {
        self.relay.connect(self.client)
    }

    async fn send(&self, frame: String) -> Result<()> {
        self.relay.handle_frame(self.client, &frame)
    }

    async fn disconnect(&self) -> Result<()> {
        self.relay.disconnect_client(self.client);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(method: &str, params: Value) -> String {
        serde_json::to_string(&JsonRpcRequest::new(method, params)).unwrap()
    }

    async fn next_payload(rx: &mut mpsc::UnboundedReceiver<TransportEvent>) -> JsonRpcPayload {
        match rx.recv().await.unwrap() {
            TransportEvent::Message(frame) => serde_json::from_str(&frame).unwrap(),
            TransportEvent::Closed => panic!("closed"),
        }
    }

    #[tokio::test]
    async fn test_mailbox_redelivers_until_acked() {
        let relay = MemoryRelay::new();
        let publisher = relay.transport();
        let subscriber = relay.transport();
        let _pub_rx = publisher.connect().await.unwrap();
        let mut sub_rx = subscriber.connect().await.unwrap();

        publisher
            .send(request(
                IRN_PUBLISH,
                json!({"topic": "t", "message": "m", "ttl": 300, "tag": 1}),
            ))
            .await
            .unwrap();

        subscriber
            .send(request(IRN_SUBSCRIBE, json!({"topic": "t"})))
            .await
            .unwrap();
        assert!(!next_payload(&mut sub_rx).await.is_request());
        let push = next_payload(&mut sub_rx).await;
        assert!(push.is_request());

        // Not acknowledged: a new subscription gets it again.
        subscriber
            .send(request(IRN_SUBSCRIBE, json!({"topic": "t"})))
            .await
            .unwrap();
        next_payload(&mut sub_rx).await;
        let again = next_payload(&mut sub_rx).await;
        assert!(again.is_request());

        let ack = JsonRpcResponse::result(again.id(), json!(true));
        subscriber.send(serde_json::to_string(&ack).unwrap()).await.unwrap();
        subscriber
            .send(request(IRN_SUBSCRIBE, json!({"topic": "t"})))
            .await
            .unwrap();
        next_payload(&mut sub_rx).await;
        assert!(sub_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_disconnect_all_closes_clients() {
        let relay = MemoryRelay::new();
        let transport = relay.transport();
        let mut rx = transport.connect().await.unwrap();
        transport
            .send(request(IRN_SUBSCRIBE, json!({"topic": "t"})))
            .await
            .unwrap();
        assert_eq!(relay.subscription_count(), 1);

        relay.disconnect_all();
        next_payload(&mut rx).await;
        assert_eq!(rx.recv().await, Some(TransportEvent::Closed));
        assert_eq!(relay.subscription_count(), 0);
        assert!(transport.send(request(IRN_SUBSCRIBE, json!({"topic": "t"}))).await.is_err());
    }
}
