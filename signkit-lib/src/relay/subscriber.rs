use super::RelayProtocol;
use crate::expirer::{Expirer, ExpirerEvent, ExpirerTarget};
use crate::storage::{KeyValueStorage, PersistedStore};
use crate::Result;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::broadcast::error::RecvError;

/// One relay subscription. Ids are assigned by the relay and are only valid
/// for the connection that issued them.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: String,
    pub topic: String,
    pub relay: RelayProtocol,
    pub expiry: u64,
}

/// Persisted subscription ids with a topic index.
pub struct SubscriptionStore {
    subscriptions: PersistedStore<Subscription>,
    by_topic: Mutex<HashMap<String, BTreeSet<String>>>,
    expirer: Arc<Expirer>,
}

impl SubscriptionStore {
    pub fn new(storage: Arc<dyn KeyValueStorage>, storage_key: String, expirer: Arc<Expirer>) -> Self {
        Self {
            subscriptions: PersistedStore::new(storage, storage_key, "subscription"),
            by_topic: Mutex::new(HashMap::new()),
            expirer,
        }
    }

    pub async fn init(&self) -> Result<()> {
        self.subscriptions.init().await?;
        let restored = self.subscriptions.values().await;
        let mut index = self.by_topic.lock().unwrap_or_else(|e| e.into_inner());
        for sub in restored {
            index.entry(sub.topic).or_default().insert(sub.id);
        }
        Ok(())
    }

    /// Drop subscriptions whose topic expired. No unsubscribe goes out: the
    /// relay side has lapsed as well.
    pub fn watch_expirations(self: &Arc<Self>) {
        let mut events = self.expirer.subscribe();
        let weak: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                let event = match events.recv().await {
                    Ok(event) => event,
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "subscription store lagged behind expirer");
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                };
                let Some(store) = weak.upgrade() else {
                    break;
                };
                if let ExpirerEvent::Expired {
                    target: ExpirerTarget::Topic(topic),
                    ..
                } = event
                {
                    if let Err(e) = store.delete_topic(&topic, "expired").await {
                        tracing::warn!(topic, error = %e, "failed to drop expired subscriptions");
                    }
                }
            }
        });
    }

    /// Store a subscription and make sure its topic is tracked by the expirer.
    pub async fn set(&self, subscription: Subscription) -> Result<()> {
        let target = ExpirerTarget::topic(subscription.topic.clone());
        if !self.expirer.has(&target).await {
            self.expirer.set(target, subscription.expiry).await?;
        }
        self.subscriptions
            .set(&subscription.id, subscription.clone())
            .await?;
        let mut index = self.by_topic.lock().unwrap_or_else(|e| e.into_inner());
        index
            .entry(subscription.topic)
            .or_default()
            .insert(subscription.id);
        Ok(())
    }

    pub async fn get(&self, id: &str) -> Result<Subscription> {
        self.subscriptions.get(id).await
    }

    /// True if `id` is a live subscription for `topic`.
    pub fn exists(&self, id: &str, topic: &str) -> bool {
        let index = self.by_topic.lock().unwrap_or_else(|e| e.into_inner());
        index.get(topic).is_some_and(|ids| ids.contains(id))
    }

    pub fn is_subscribed(&self, topic: &str) -> bool {
        let index = self.by_topic.lock().unwrap_or_else(|e| e.into_inner());
        index.get(topic).is_some_and(|ids| !ids.is_empty())
    }

    pub fn ids_for(&self, topic: &str) -> Vec<String> {
        let index = self.by_topic.lock().unwrap_or_else(|e| e.into_inner());
        index
            .get(topic)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn topics(&self) -> Vec<String> {
        let index = self.by_topic.lock().unwrap_or_else(|e| e.into_inner());
        index.keys().cloned().collect()
    }

    pub async fn values(&self) -> Vec<Subscription> {
        self.subscriptions.values().await
    }

    pub async fn len(&self) -> usize {
        self.subscriptions.len().await
    }

    pub async fn is_empty(&self) -> bool {
        self.subscriptions.is_empty().await
    }

    pub async fn delete(&self, id: &str, reason: &str) -> Result<Option<Subscription>> {
        let removed = self.subscriptions.delete(id, reason).await?;
        if let Some(sub) = &removed {
            self.unindex(&sub.topic, &sub.id);
            tracing::debug!(id, topic = %sub.topic, reason, "subscription deleted");
        }
        Ok(removed)
    }

    /// Delete every subscription on `topic`.
    pub async fn delete_topic(&self, topic: &str, reason: &str) -> Result<Vec<Subscription>> {
        let removed = self
            .subscriptions
            .remove_where(|_, s| s.topic == topic, reason)
            .await?;
        let mut index = self.by_topic.lock().unwrap_or_else(|e| e.into_inner());
        index.remove(topic);
        Ok(removed)
    }

    fn unindex(&self, topic: &str, id: &str) {
        let mut index = self.by_topic.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(ids) = index.get_mut(topic) {
            ids.remove(id);
            if ids.is_empty() {
                index.remove(topic);
            }
        }
    }
}
