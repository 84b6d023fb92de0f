//! Client configuration.

use signkit_lib::config::CoreConfig;
use signkit_lib::pairing::Metadata;
use std::time::Duration;

/// Configuration for a [`crate::SignClient`].
#[derive(Clone, Debug)]
pub struct SignConfig {
    /// Our metadata, sent in proposals and settlements.
    pub metadata: Metadata,
    pub core: CoreConfig,
    /// Pause between two inbound requests taken off the request queue.
    pub request_queue_delay: Duration,
    /// How long `approve` waits for the peer to acknowledge settlement.
    pub settle_ack_timeout: Duration,
}

impl SignConfig {
    pub fn new(metadata: Metadata) -> Self {
        Self {
            metadata,
            core: CoreConfig::default(),
            request_queue_delay: Duration::from_millis(50),
            settle_ack_timeout: Duration::from_secs(5 * 60),
        }
    }

    pub fn with_core(mut self, core: CoreConfig) -> Self {
        self.core = core;
        self
    }

    pub fn with_request_queue_delay(mut self, delay: Duration) -> Self {
        self.request_queue_delay = delay;
        self
    }

    pub fn with_settle_ack_timeout(mut self, timeout: Duration) -> Self {
        self.settle_ack_timeout = timeout;
        self
    }
}
