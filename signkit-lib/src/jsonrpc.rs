//! JSON-RPC 2.0 payloads exchanged between peers, plus response correlation.

use crate::{Result, SignkitError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::oneshot;

pub const JSONRPC_VERSION: &str = "2.0";

static LAST_PAYLOAD_ID: AtomicU64 = AtomicU64::new(0);

/// Generate a timestamp-prefixed payload id.
///
/// Ids are `unix_millis * 1000 + random(0..1000)` and strictly increase within
/// the process, so a newer request always carries a numerically larger id.
pub fn payload_id() -> u64 {
    let millis = chrono::Utc::now().timestamp_millis().max(0) as u64;
    let candidate = millis * 1000 + rand::Rng::gen_range(&mut rand::thread_rng(), 0..1000);
    let mut last = LAST_PAYLOAD_ID.load(Ordering::SeqCst);
    loop {
        let next = candidate.max(last + 1);
        match LAST_PAYLOAD_ID.compare_exchange(last, next, Ordering::SeqCst, Ordering::SeqCst) {
            Ok(_) => return next,
            Err(current) => last = current,
        }
    }
}

/// Error object carried by a JSON-RPC error response.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
}

impl JsonRpcError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct JsonRpcRequest {
    pub id: u64,
    pub jsonrpc: String,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

impl JsonRpcRequest {
    /// Build a request with a fresh payload id.
    pub fn new(method: impl Into<String>, params: Value) -> Self {
        Self::with_id(payload_id(), method, params)
    }

    pub fn with_id(id: u64, method: impl Into<String>, params: Value) -> Self {
        Self {
            id,
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.into(),
            params,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct JsonRpcResult {
    pub id: u64,
    pub jsonrpc: String,
    pub result: Value,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct JsonRpcErrorResponse {
    pub id: u64,
    pub jsonrpc: String,
    pub error: JsonRpcError,
}

/// Either half of a JSON-RPC response.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum JsonRpcResponse {
    Error(JsonRpcErrorResponse),
    Result(JsonRpcResult),
}

impl JsonRpcResponse {
    pub fn result(id: u64, result: Value) -> Self {
        Self::Result(JsonRpcResult {
            id,
            jsonrpc: JSONRPC_VERSION.to_string(),
            result,
        })
    }

    pub fn error(id: u64, error: JsonRpcError) -> Self {
        Self::Error(JsonRpcErrorResponse {
            id,
            jsonrpc: JSONRPC_VERSION.to_string(),
            error,
        })
    }

    pub fn id(&self) -> u64 {
        match self {
            Self::Error(e) => e.id,
            Self::Result(r) => r.id,
        }
    }

    /// The outcome as a `Result`, keeping the peer's error object intact.
    pub fn outcome(&self) -> std::result::Result<Value, JsonRpcError> {
        match self {
            Self::Error(e) => Err(e.error.clone()),
            Self::Result(r) => Ok(r.result.clone()),
        }
    }
}

/// Any payload that may travel inside an envelope.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum JsonRpcPayload {
    Request(JsonRpcRequest),
    Response(JsonRpcResponse),
}

impl JsonRpcPayload {
    pub fn id(&self) -> u64 {
        match self {
            Self::Request(r) => r.id,
            Self::Response(r) => r.id(),
        }
    }

    pub fn is_request(&self) -> bool {
        matches!(self, Self::Request(_))
    }
}

impl From<JsonRpcRequest> for JsonRpcPayload {
    fn from(r: JsonRpcRequest) -> Self {
        Self::Request(r)
    }
}

impl From<JsonRpcResponse> for JsonRpcPayload {
    fn from(r: JsonRpcResponse) -> Self {
        Self::Response(r)
    }
}

type WaiterOutcome<T> = std::result::Result<T, SignkitError>;

struct Waiter<T> {
    topic: String,
    tx: oneshot::Sender<WaiterOutcome<T>>,
}

/// Registry of callers awaiting the outcome of a given request id.
///
/// A waiter is registered before the request is published so a fast response
/// can never slip past it. `T` defaults to the raw JSON result; higher layers
/// use their own types when the outcome is produced after local processing.
pub struct ResponseWaiters<T = Value> {
    waiters: Mutex<HashMap<u64, Waiter<T>>>,
}

impl<T> Default for ResponseWaiters<T> {
    fn default() -> Self {
        Self {
            waiters: Mutex::new(HashMap::new()),
        }
    }
}

impl<T> ResponseWaiters<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, id: u64, topic: &str) -> oneshot::Receiver<WaiterOutcome<T>> {
        let (tx, rx) = oneshot::channel();
        let mut waiters = self.waiters.lock().unwrap_or_else(|e| e.into_inner());
        waiters.insert(
            id,
            Waiter {
                topic: topic.to_string(),
                tx,
            },
        );
        rx
    }

    pub fn contains(&self, id: u64) -> bool {
        let waiters = self.waiters.lock().unwrap_or_else(|e| e.into_inner());
        waiters.contains_key(&id)
    }

    /// Complete a waiter. Returns false when nobody was waiting.
    pub fn complete(&self, id: u64, outcome: WaiterOutcome<T>) -> bool {
        let waiter = {
            let mut waiters = self.waiters.lock().unwrap_or_else(|e| e.into_inner());
            waiters.remove(&id)
        };
        match waiter {
            // The receiver may already be gone if the caller stopped waiting.
            Some(w) => {
                let _ = w.tx.send(outcome);
                true
            }
            None => false,
        }
    }

    /// Fail every waiter attached to `topic`.
    pub fn reject_topic(&self, topic: &str, error: SignkitError) -> usize {
        let drained: Vec<Waiter<T>> = {
            let mut waiters = self.waiters.lock().unwrap_or_else(|e| e.into_inner());
            let ids: Vec<u64> = waiters
                .iter()
                .filter(|(_, w)| w.topic == topic)
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter().filter_map(|id| waiters.remove(&id)).collect()
        };
        let count = drained.len();
        for w in drained {
            let _ = w.tx.send(Err(error.clone()));
        }
        count
    }

    pub fn remove(&self, id: u64) {
        let mut waiters = self.waiters.lock().unwrap_or_else(|e| e.into_inner());
        waiters.remove(&id);
    }
}

impl ResponseWaiters<Value> {
    /// Hand a response to its waiter. Returns false when nobody was waiting.
    pub fn resolve(&self, response: &JsonRpcResponse) -> bool {
        let outcome = response.outcome().map_err(SignkitError::from);
        self.complete(response.id(), outcome)
    }
}

/// Await a registered waiter, racing it against `timeout`.
pub async fn wait_for_response<T>(
    rx: oneshot::Receiver<WaiterOutcome<T>>,
    timeout: Duration,
    operation: &str,
) -> Result<T> {
    match tokio::time::timeout(timeout, rx).await {
        Ok(Ok(outcome)) => outcome,
        Ok(Err(_)) => Err(SignkitError::Internal(format!(
            "{} waiter dropped before completion",
            operation
        ))),
        Err(_) => Err(SignkitError::timeout(operation, timeout)),
    }
}
