//! The shared services bundle.

use crate::config::CoreConfig;
use crate::crypto::Crypto;
use crate::expirer::Expirer;
use crate::history::JsonRpcHistory;
use crate::pairing::PairingController;
use crate::relay::{RelayTransport, Relayer, SubscriptionStore};
use crate::storage::KeyValueStorage;
use crate::Result;
use std::sync::Arc;

/// Crypto, history, expirer, relayer and pairing wired to one storage and
/// one transport.
///
/// Construct it, let higher layers subscribe to the event channels they
/// need, then call [`Core::start`]. Messages stored at the relay may arrive
/// as soon as the relayer connects, so listeners must exist first.
pub struct Core {
    pub config: CoreConfig,
    pub storage: Arc<dyn KeyValueStorage>,
    pub crypto: Arc<Crypto>,
    pub history: Arc<JsonRpcHistory>,
    pub expirer: Arc<Expirer>,
    pub relayer: Arc<Relayer>,
    pub pairing: Arc<PairingController>,
}

impl Core {
    pub fn new(
        config: CoreConfig,
        storage: Arc<dyn KeyValueStorage>,
        transport: Arc<dyn RelayTransport>,
    ) -> Self {
        let crypto = Arc::new(Crypto::new(storage.clone(), config.storage_key("keychain")));
        let history = Arc::new(JsonRpcHistory::new(
            storage.clone(),
            config.storage_key("history"),
        ));
        let expirer = Arc::new(Expirer::new(
            storage.clone(),
            config.storage_key("expirer"),
            config.heartbeat_interval,
        ));
        let subscriptions = Arc::new(SubscriptionStore::new(
            storage.clone(),
            config.storage_key("subscription"),
            expirer.clone(),
        ));
        let relayer = Arc::new(Relayer::new(
            config.clone(),
            transport,
            crypto.clone(),
            history.clone(),
            subscriptions,
        ));
        let pairing = Arc::new(PairingController::new(
            storage.clone(),
            config.storage_key("pairing"),
            crypto.clone(),
            relayer.clone(),
            expirer.clone(),
        ));
        Self {
            config,
            storage,
            crypto,
            history,
            expirer,
            relayer,
            pairing,
        }
    }

    /// Restore every store, connect to the relay and start the expirer.
    #[tracing::instrument(skip(self), fields(prefix = %self.config.storage_prefix))]
    pub async fn start(&self) -> Result<()> {
        self.crypto.init().await?;
        self.history.init().await?;
        self.expirer.init().await?;
        self.pairing.init().await?;
        self.relayer.init().await?;
        self.expirer.start();
        tracing::info!("core started");
        Ok(())
    }

    /// Close the relay connection and stop the expirer.
    pub async fn shutdown(&self) -> Result<()> {
        self.expirer.stop();
        self.relayer.close().await
    }
}
