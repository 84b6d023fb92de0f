//! The single timer service.
//!
//! Components register targets (a topic or a request id) with an expiry
//! timestamp and listen for [`ExpirerEvent::Expired`] instead of running
//! their own timers. A target fires once and is removed; tracking it again
//! takes a new [`Expirer::set`].

use crate::storage::{KeyValueStorage, PersistedStore};
use crate::{now_secs, Result, SignkitError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

const EVENT_CAPACITY: usize = 256;

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum ExpirerTarget {
    Topic(String),
    Id(u64),
}

impl ExpirerTarget {
    pub fn topic(topic: impl Into<String>) -> Self {
        Self::Topic(topic.into())
    }

    pub fn as_topic(&self) -> Option<&str> {
        match self {
            Self::Topic(t) => Some(t),
            Self::Id(_) => None,
        }
    }

    pub fn as_id(&self) -> Option<u64> {
        match self {
            Self::Id(id) => Some(*id),
            Self::Topic(_) => None,
        }
    }
}

impl fmt::Display for ExpirerTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Topic(topic) => write!(f, "topic:{}", topic),
            Self::Id(id) => write!(f, "id:{}", id),
        }
    }
}

impl FromStr for ExpirerTarget {
    type Err = SignkitError;

    fn from_str(s: &str) -> Result<Self> {
        if let Some(topic) = s.strip_prefix("topic:") {
            return Ok(Self::Topic(topic.to_string()));
        }
        if let Some(id) = s.strip_prefix("id:") {
            let id = id
                .parse()
                .map_err(|_| SignkitError::validation(format!("invalid expirer id: {}", s)))?;
            return Ok(Self::Id(id));
        }
        Err(SignkitError::validation(format!(
            "invalid expirer target: {}",
            s
        )))
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ExpirerEvent {
    Created { target: ExpirerTarget, expiry: u64 },
    Deleted { target: ExpirerTarget },
    Expired { target: ExpirerTarget, expiry: u64 },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct ExpirerEntry {
    target: String,
    expiry: u64,
}

pub struct Expirer {
    entries: PersistedStore<ExpirerEntry>,
    events: broadcast::Sender<ExpirerEvent>,
    heartbeat: Duration,
    ticker: Mutex<Option<JoinHandle<()>>>,
}

impl Expirer {
    pub fn new(storage: Arc<dyn KeyValueStorage>, storage_key: String, heartbeat: Duration) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            entries: PersistedStore::new(storage, storage_key, "expirer"),
            events,
            heartbeat,
            ticker: Mutex::new(None),
        }
    }

    pub async fn init(&self) -> Result<()> {
        self.entries.init().await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ExpirerEvent> {
        self.events.subscribe()
    }

    /// Track `target` until `expiry` (unix seconds), replacing any earlier expiry.
    pub async fn set(&self, target: ExpirerTarget, expiry: u64) -> Result<()> {
        let key = target.to_string();
        self.entries
            .set(
                &key,
                ExpirerEntry {
                    target: key.clone(),
                    expiry,
                },
            )
            .await?;
        tracing::trace!(%target, expiry, "expirer target set");
        let _ = self.events.send(ExpirerEvent::Created { target, expiry });
        Ok(())
    }

    /// Fails with `NoMatchingKey` for an untracked target.
    pub async fn get(&self, target: &ExpirerTarget) -> Result<u64> {
        Ok(self.entries.get(&target.to_string()).await?.expiry)
    }

    pub async fn has(&self, target: &ExpirerTarget) -> bool {
        self.entries.contains(&target.to_string()).await
    }

    /// Stop tracking `target`. Untracked targets are ignored.
    pub async fn del(&self, target: &ExpirerTarget) -> Result<()> {
        if self
            .entries
            .delete(&target.to_string(), "expirer delete")
            .await?
            .is_some()
        {
            let _ = self.events.send(ExpirerEvent::Deleted {
                target: target.clone(),
            });
        }
        Ok(())
    }

    /// Every tracked target with its expiry.
    pub async fn values(&self) -> Vec<(ExpirerTarget, u64)> {
        self.entries
            .values()
            .await
            .into_iter()
            .filter_map(|e| e.target.parse().ok().map(|t| (t, e.expiry)))
            .collect()
    }

    /// Fire and remove every target whose expiry is at or before `now`.
    pub async fn check_expirations(&self, now: u64) -> Result<Vec<ExpirerTarget>> {
        let lapsed = self
            .entries
            .remove_where(|_, e| e.expiry <= now, "expired")
            .await?;
        let mut fired = Vec::with_capacity(lapsed.len());
        for entry in lapsed {
            match entry.target.parse::<ExpirerTarget>() {
                Ok(target) => {
                    tracing::debug!(%target, expiry = entry.expiry, "target expired");
                    let _ = self.events.send(ExpirerEvent::Expired {
                        target: target.clone(),
                        expiry: entry.expiry,
                    });
                    fired.push(target);
                }
                Err(e) => tracing::warn!(target = %entry.target, error = %e, "dropping malformed expirer entry"),
            }
        }
        Ok(fired)
    }

    /// Start the heartbeat. The task stops on its own once the expirer is dropped.
    pub fn start(self: &Arc<Self>) {
        let mut ticker = self.ticker.lock().unwrap_or_else(|e| e.into_inner());
        if ticker.is_some() {
            return;
        }
        let weak: Weak<Self> = Arc::downgrade(self);
        let heartbeat = self.heartbeat;
        *ticker = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(heartbeat);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let Some(expirer) = weak.upgrade() else {
                    break;
                };
                if let Err(e) = expirer.check_expirations(now_secs()).await {
                    tracing::error!(error = %e, "expirer check failed");
                }
            }
        }));
    }

    pub fn stop(&self) {
        let mut ticker = self.ticker.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(handle) = ticker.take() {
            handle.abort();
        }
    }
}

impl Drop for Expirer {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    fn expirer() -> Arc<Expirer> {
        Arc::new(Expirer::new(
            Arc::new(MemoryStorage::new()),
            "expirer".into(),
            Duration::from_millis(10),
        ))
    }

    #[test]
    fn test_target_encoding() {
        let topic = ExpirerTarget::topic("abc");
        assert_eq!(topic.to_string(), "topic:abc");
        assert_eq!("topic:abc".parse::<ExpirerTarget>().unwrap(), topic);
        assert_eq!("id:42".parse::<ExpirerTarget>().unwrap(), ExpirerTarget::Id(42));
        assert!("id:x".parse::<ExpirerTarget>().is_err());
        assert!("other".parse::<ExpirerTarget>().is_err());
    }

    #[tokio::test]
    async fn test_fires_once_and_is_removed() {
        let expirer = expirer();
        let mut events = expirer.subscribe();
        let target = ExpirerTarget::Id(7);
        expirer.set(target.clone(), 100).await.unwrap();
        assert_eq!(expirer.get(&target).await.unwrap(), 100);

        assert!(expirer.check_expirations(99).await.unwrap().is_empty());
        assert_eq!(expirer.check_expirations(100).await.unwrap(), vec![target.clone()]);
        assert!(expirer.check_expirations(200).await.unwrap().is_empty());
        assert!(!expirer.has(&target).await);

        assert!(matches!(events.recv().await.unwrap(), ExpirerEvent::Created { .. }));
        assert_eq!(
            events.recv().await.unwrap(),
            ExpirerEvent::Expired { target, expiry: 100 }
        );
    }

    #[tokio::test]
    async fn test_heartbeat_fires_lapsed_targets() {
        let expirer = expirer();
        let mut events = expirer.subscribe();
        expirer.start();
        expirer
            .set(ExpirerTarget::topic("t"), now_secs().saturating_sub(1))
            .await
            .unwrap();

        let fired = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if let Ok(ExpirerEvent::Expired { target, .. }) = events.recv().await {
                    return target;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(fired, ExpirerTarget::topic("t"));
    }

    #[tokio::test]
    async fn test_del_emits_deleted() {
        let expirer = expirer();
        let target = ExpirerTarget::topic("t");
        expirer.set(target.clone(), u64::MAX).await.unwrap();
        let mut events = expirer.subscribe();
        expirer.del(&target).await.unwrap();
        expirer.del(&target).await.unwrap();
        assert_eq!(events.recv().await.unwrap(), ExpirerEvent::Deleted { target });
        assert!(events.try_recv().is_err());
    }
}
