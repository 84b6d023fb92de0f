//! JSON-RPC history ledger.
//!
//! Every request sent or received is recorded here, keyed by id. The relayer
//! consults the ledger to drop redelivered messages, and callers use it to
//! find out whether a request has been answered.
//!
//! The ledger is not queryable until [`JsonRpcHistory::init`] has restored the
//! persisted records; calls made earlier wait for restoration to finish.

use crate::constants::HISTORY_TTL;
use crate::jsonrpc::{JsonRpcError, JsonRpcRequest, JsonRpcResponse};
use crate::storage::{KeyValueStorage, PersistedStore};
use crate::{now_secs, Result, SignkitError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::watch;

/// Method and params of a recorded request.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RequestSummary {
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

/// Outcome attached to a record once the response is seen.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordResponse {
    Result(Value),
    Error(JsonRpcError),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JsonRpcRecord {
    pub id: u64,
    pub topic: String,
    pub request: RequestSummary,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<RecordResponse>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chain_id: Option<String>,
    pub expiry: u64,
}

impl JsonRpcRecord {
    pub fn is_resolved(&self) -> bool {
        self.response.is_some()
    }
}

pub struct JsonRpcHistory {
    records: PersistedStore<JsonRpcRecord>,
    ready_tx: watch::Sender<bool>,
}

impl JsonRpcHistory {
    pub fn new(storage: Arc<dyn KeyValueStorage>, storage_key: String) -> Self {
        let (ready_tx, _) = watch::channel(false);
        Self {
            records: PersistedStore::new(storage, storage_key, "history"),
            ready_tx,
        }
    }

    /// Restore persisted records, drop lapsed ones, and open the ledger.
    pub async fn init(&self) -> Result<()> {
        self.records.init().await?;
        self.prune(now_secs()).await?;
        self.ready_tx.send_replace(true);
        tracing::debug!(records = self.records.len().await, "history initialized");
        Ok(())
    }

    async fn ready(&self) {
        let mut rx = self.ready_tx.subscribe();
        // The sender lives as long as `self`, so this only returns once ready.
        let _ = rx.wait_for(|ready| *ready).await;
    }

    /// Record a request. Recording the same id again is a no-op.
    pub async fn set(
        &self,
        topic: &str,
        request: &JsonRpcRequest,
        chain_id: Option<String>,
    ) -> Result<()> {
        self.ready().await;
        let key = request.id.to_string();
        if self.records.contains(&key).await {
            tracing::debug!(id = request.id, topic, "history record already present");
            return Ok(());
        }
        let now = now_secs();
        self.prune(now).await?;
        let record = JsonRpcRecord {
            id: request.id,
            topic: topic.to_string(),
            request: RequestSummary {
                method: request.method.clone(),
                params: request.params.clone(),
            },
            response: None,
            chain_id,
            expiry: now + HISTORY_TTL,
        };
        self.records.set(&key, record).await
    }

    /// Attach a response to its record.
    ///
    /// Does nothing when the record is missing or already resolved, so a
    /// redelivered response cannot overwrite the first one.
    pub async fn resolve(&self, response: &JsonRpcResponse) -> Result<()> {
        self.ready().await;
        let key = response.id().to_string();
        match self.records.get_optional(&key).await {
            Some(record) if !record.is_resolved() => {
                let outcome = match response.outcome() {
                    Ok(value) => RecordResponse::Result(value),
                    Err(error) => RecordResponse::Error(error),
                };
                self.records
                    .update(&key, |r| r.response = Some(outcome))
                    .await
                    .map(|_| ())
            }
            _ => Ok(()),
        }
    }

    /// Fetch a record, checking it belongs to `topic`.
    pub async fn get(&self, topic: &str, id: u64) -> Result<JsonRpcRecord> {
        self.ready().await;
        let record = self
            .records
            .get_optional(&id.to_string())
            .await
            .ok_or_else(|| SignkitError::no_matching_key("history", id.to_string()))?;
        if record.topic != topic {
            return Err(SignkitError::MismatchedTopic {
                id,
                expected: record.topic,
                actual: topic.to_string(),
            });
        }
        Ok(record)
    }

    /// The record for `id` regardless of topic.
    pub async fn find(&self, id: u64) -> Option<JsonRpcRecord> {
        self.ready().await;
        self.records.get_optional(&id.to_string()).await
    }

    pub async fn exists(&self, topic: &str, id: u64) -> bool {
        self.find(id).await.is_some_and(|r| r.topic == topic)
    }

    /// Remove every record of `topic`, or only `id` when given.
    pub async fn delete(&self, topic: &str, id: Option<u64>) -> Result<()> {
        self.ready().await;
        let removed = self
            .records
            .remove_where(
                |_, r| r.topic == topic && id.map_or(true, |id| r.id == id),
                "history delete",
            )
            .await?;
        if !removed.is_empty() {
            tracing::debug!(topic, count = removed.len(), "deleted history records");
        }
        Ok(())
    }

    /// Records still waiting for a response.
    pub async fn pending(&self) -> Vec<JsonRpcRecord> {
        self.ready().await;
        self.records.filter(|r| !r.is_resolved()).await
    }

    pub async fn len(&self) -> usize {
        self.ready().await;
        self.records.len().await
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    async fn prune(&self, now: u64) -> Result<()> {
        self.records
            .remove_where(|_, r| r.expiry <= now, "history ttl")
            .await
            .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use serde_json::json;
    use std::time::Duration;

    async fn history(storage: &MemoryStorage) -> JsonRpcHistory {
        let history = JsonRpcHistory::new(Arc::new(storage.clone()), "history".into());
        history.init().await.unwrap();
        history
    }

    #[tokio::test]
    async fn test_set_is_idempotent() {
        let history = history(&MemoryStorage::new()).await;
        let request = JsonRpcRequest::new("wc_sessionPing", json!({}));
        history.set("t", &request, None).await.unwrap();
        history.set("t", &request, None).await.unwrap();
        assert_eq!(history.len().await, 1);
        assert_eq!(history.pending().await.len(), 1);
    }

    #[tokio::test]
    async fn test_resolve_keeps_first_response() {
        let history = history(&MemoryStorage::new()).await;
        let request = JsonRpcRequest::new("wc_sessionRequest", json!({}));
        history.set("t", &request, None).await.unwrap();

        history
            .resolve(&JsonRpcResponse::result(request.id, json!("first")))
            .await
            .unwrap();
        history
            .resolve(&JsonRpcResponse::result(request.id, json!("second")))
            .await
            .unwrap();
        // Unknown ids are ignored.
        history
            .resolve(&JsonRpcResponse::result(1, json!(true)))
            .await
            .unwrap();

        let record = history.get("t", request.id).await.unwrap();
        assert_eq!(record.response, Some(RecordResponse::Result(json!("first"))));
        assert!(history.pending().await.is_empty());
    }

    #[tokio::test]
    async fn test_get_checks_topic() {
        let history = history(&MemoryStorage::new()).await;
        let request = JsonRpcRequest::new("wc_sessionPing", json!({}));
        history.set("a", &request, None).await.unwrap();

        assert!(matches!(
            history.get("b", request.id).await,
            Err(SignkitError::MismatchedTopic { .. })
        ));
        assert!(matches!(
            history.get("a", request.id + 1).await,
            Err(SignkitError::NoMatchingKey { .. })
        ));
        assert!(history.exists("a", request.id).await);
        assert!(!history.exists("b", request.id).await);
    }

    #[tokio::test]
    async fn test_delete_by_topic_and_id() {
        let history = history(&MemoryStorage::new()).await;
        let r1 = JsonRpcRequest::new("m", json!({}));
        let r2 = JsonRpcRequest::new("m", json!({}));
        let r3 = JsonRpcRequest::new("m", json!({}));
        history.set("a", &r1, None).await.unwrap();
        history.set("a", &r2, None).await.unwrap();
        history.set("b", &r3, None).await.unwrap();

        history.delete("a", Some(r1.id)).await.unwrap();
        assert!(!history.exists("a", r1.id).await);
        assert!(history.exists("a", r2.id).await);

        history.delete("a", None).await.unwrap();
        assert_eq!(history.len().await, 1);
    }

    #[tokio::test]
    async fn test_callers_wait_for_restore() {
        let storage = MemoryStorage::new();
        let request = JsonRpcRequest::new("m", json!({}));
        history(&storage).await.set("t", &request, None).await.unwrap();

        let restarted = Arc::new(JsonRpcHistory::new(Arc::new(storage), "history".into()));
        let reader = {
            let restarted = restarted.clone();
            let id = request.id;
            tokio::spawn(async move { restarted.exists("t", id).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!reader.is_finished());

        restarted.init().await.unwrap();
        assert!(reader.await.unwrap());
    }
}
