//! Configuration for the core services.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default relay endpoint.
pub const DEFAULT_RELAY_URL: &str = "wss://relay.walletconnect.com";

/// Relay protocol advertised in pairing URIs and proposals.
pub const RELAY_PROTOCOL: &str = "irn";

/// Configuration shared by the relayer, expirer and stores.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CoreConfig {
    /// Relay server URL handed to the transport.
    pub relay_url: String,

    /// Project identifier forwarded to the relay, if any.
    #[serde(default)]
    pub project_id: Option<String>,

    /// Prefix for every persisted key, so several clients can share one storage.
    #[serde(default = "default_storage_prefix")]
    pub storage_prefix: String,

    /// Interval between expirer checks.
    #[serde(default = "default_heartbeat", with = "duration_millis")]
    pub heartbeat_interval: Duration,

    /// Delay before re-opening a dropped transport.
    #[serde(default = "default_backoff", with = "duration_millis")]
    pub reconnect_backoff: Duration,

    /// Round-trip limit for relay RPCs (publish/subscribe/unsubscribe).
    #[serde(default = "default_rpc_timeout", with = "duration_millis")]
    pub rpc_timeout: Duration,

    /// Queue non-throwing publishes that failed and replay them after reconnect.
    #[serde(default = "default_publish_retry")]
    pub publish_retry: bool,
}

fn default_storage_prefix() -> String {
    "wc@2:core:0.3".to_string()
}

fn default_heartbeat() -> Duration {
    Duration::from_secs(1)
}

fn default_backoff() -> Duration {
    Duration::from_secs(1)
}

fn default_rpc_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_publish_retry() -> bool {
    true
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            relay_url: DEFAULT_RELAY_URL.to_string(),
            project_id: None,
            storage_prefix: default_storage_prefix(),
            heartbeat_interval: default_heartbeat(),
            reconnect_backoff: default_backoff(),
            rpc_timeout: default_rpc_timeout(),
            publish_retry: default_publish_retry(),
        }
    }
}

impl CoreConfig {
    /// Create a configuration for the given relay.
    pub fn new(relay_url: impl Into<String>) -> Self {
        Self {
            relay_url: relay_url.into(),
            ..Self::default()
        }
    }

    /// Set the project id.
    pub fn with_project_id(mut self, project_id: impl Into<String>) -> Self {
        self.project_id = Some(project_id.into());
        self
    }

    /// Set the storage key prefix.
    pub fn with_storage_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.storage_prefix = prefix.into();
        self
    }

    /// Set the expirer heartbeat.
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Set the reconnect backoff.
    pub fn with_reconnect_backoff(mut self, backoff: Duration) -> Self {
        self.reconnect_backoff = backoff;
        self
    }

    /// Set the relay RPC timeout.
    pub fn with_rpc_timeout(mut self, timeout: Duration) -> Self {
        self.rpc_timeout = timeout;
        self
    }

    /// Enable or disable replay of failed non-throwing publishes.
    pub fn with_publish_retry(mut self, retry: bool) -> Self {
        self.publish_retry = retry;
        self
    }

    /// Fully qualified storage key for a store name.
    pub fn storage_key(&self, name: &str) -> String {
        format!("{}//{}", self.storage_prefix, name)
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}
