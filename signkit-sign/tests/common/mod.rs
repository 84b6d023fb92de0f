//! Shared fixtures for the end-to-end tests: two clients on one in-process relay.

#![allow(dead_code)]

use signkit_lib::pairing::Metadata;
use signkit_lib::storage::MemoryStorage;
use signkit_lib::test_utils::{MemoryRelay, MemoryTransport};
use signkit_lib::CoreConfig;
use signkit_sign::{
    ApproveParams, ConnectParams, Namespaces, ProposalNamespace, ProposalNamespaces, Session,
    SessionNamespace, SignClient, SignConfig, SignEvent,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

pub const CHAIN: &str = "eip155:1";
pub const ACCOUNT: &str = "eip155:1:0xab16a96d359ec26a11e2c2b3d8f8b8942d5bfcdb";

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn config(name: &str) -> SignConfig {
    SignConfig::new(Metadata::new(name, format!("https://{}.example", name)))
        .with_core(
            CoreConfig::default()
                .with_reconnect_backoff(Duration::from_millis(20))
                .with_rpc_timeout(Duration::from_secs(2))
                .with_heartbeat_interval(Duration::from_millis(100)),
        )
        .with_request_queue_delay(Duration::from_millis(5))
        .with_settle_ack_timeout(Duration::from_secs(5))
}

/// A client plus the handles a test needs to poke at it.
pub struct Peer {
    pub client: SignClient,
    pub events: broadcast::Receiver<SignEvent>,
    pub storage: MemoryStorage,
    pub transport: Arc<MemoryTransport>,
}

pub async fn peer(relay: &Arc<MemoryRelay>, name: &str) -> Peer {
    peer_with_storage(relay, name, MemoryStorage::new()).await
}

/// Start a client on `storage`. Clones of a [`MemoryStorage`] share state,
/// so this also models a restart.
pub async fn peer_with_storage(
    relay: &Arc<MemoryRelay>,
    name: &str,
    storage: MemoryStorage,
) -> Peer {
    let transport = relay.transport();
    let client = SignClient::init(config(name), Arc::new(storage.clone()), transport.clone())
        .await
        .expect("client init");
    let events = client.events();
    Peer {
        client,
        events,
        storage,
        transport,
    }
}

/// Wait for the first event matching `pred`, skipping the rest.
pub async fn wait_for<T>(
    rx: &mut broadcast::Receiver<SignEvent>,
    mut pred: impl FnMut(&SignEvent) -> Option<T>,
) -> T {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    if let Some(found) = pred(&event) {
                        return found;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

pub fn required() -> ProposalNamespaces {
    BTreeMap::from([(
        "eip155".to_string(),
        ProposalNamespace {
            chains: vec![CHAIN.to_string()],
            methods: vec!["personal_sign".to_string()],
            events: vec!["accountsChanged".to_string()],
        },
    )])
}

pub fn approved_namespaces() -> Namespaces {
    BTreeMap::from([(
        "eip155".to_string(),
        SessionNamespace {
            chains: Some(vec![CHAIN.to_string()]),
            accounts: vec![ACCOUNT.to_string()],
            methods: vec!["personal_sign".to_string(), "eth_sendTransaction".to_string()],
            events: vec!["accountsChanged".to_string(), "chainChanged".to_string()],
        },
    )])
}

/// Both ends of a settled session.
pub struct Settled {
    pub app: Peer,
    pub wallet: Peer,
    pub topic: String,
    pub app_session: Session,
    pub wallet_session: Session,
}

/// Pair an app and a wallet and settle one session between them.
pub async fn settle(relay: &Arc<MemoryRelay>) -> Settled {
    init_tracing();
    let app = peer(relay, "app").await;
    let mut wallet = peer(relay, "wallet").await;

    let connection = app
        .client
        .connect(ConnectParams {
            required_namespaces: required(),
            ..Default::default()
        })
        .await
        .expect("connect");
    let uri = connection.uri.clone().expect("fresh pairing uri");
    wallet.client.pair(&uri).await.expect("pair");

    let proposal = wait_for(&mut wallet.events, |e| match e {
        SignEvent::SessionProposal { proposal } => Some(proposal.clone()),
        _ => None,
    })
    .await;
    assert_eq!(proposal.id, connection.approval.proposal_id());

    let approved = wallet
        .client
        .approve(ApproveParams {
            id: proposal.id,
            namespaces: approved_namespaces(),
            session_properties: None,
        })
        .await
        .expect("approve");
    let topic = approved.topic.clone();

    let app_session = connection.approval.wait().await.expect("approval");
    let wallet_session = approved.acknowledgement.wait().await.expect("settle ack");

    Settled {
        app,
        wallet,
        topic,
        app_session,
        wallet_session,
    }
}
