//! Relay connection loss and recovery.

mod common;

use common::{settle, wait_for, Settled, CHAIN};
use serde_json::json;
use signkit_lib::jsonrpc::JsonRpcResponse;
use signkit_lib::relay::RelayerEvent;
use signkit_lib::test_utils::MemoryRelay;
use signkit_sign::SignEvent;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

async fn wait_for_connect(rx: &mut broadcast::Receiver<RelayerEvent>) {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match rx.recv().await {
                Ok(RelayerEvent::Connect) => return,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("relayer gone"),
            }
        }
    })
    .await
    .expect("timed out waiting for reconnect");
}

#[tokio::test]
async fn test_reconnect_resubscribes_with_new_ids() {
    let relay = MemoryRelay::new();
    let Settled { app, .. } = settle(&relay).await;

    // Session topic, its pairing, and one spare pairing.
    app.client.core().pairing.create().await.unwrap();
    let store = app.client.core().relayer.subscriptions().clone();
    let before = store.values().await;
    assert_eq!(before.len(), 3);
    let old_ids: BTreeSet<String> = before.iter().map(|s| s.id.clone()).collect();
    let topics: BTreeSet<String> = before.iter().map(|s| s.topic.clone()).collect();
    assert_eq!(topics.len(), 3);

    let mut relayer_events = app.client.core().relayer.subscribe_events();
    relay.disconnect_all();
    wait_for_connect(&mut relayer_events).await;

    let after = store.values().await;
    assert_eq!(after.len(), 3);
    let new_ids: BTreeSet<String> = after.iter().map(|s| s.id.clone()).collect();
    let new_topics: BTreeSet<String> = after.iter().map(|s| s.topic.clone()).collect();
    assert_eq!(new_topics, topics);
    assert!(old_ids.is_disjoint(&new_ids));
    for id in &old_ids {
        assert!(store.get(id).await.is_err(), "stale id {id} kept");
    }

    let mut live: Vec<String> = relay.subscription_ids(app.transport.client_id());
    live.sort();
    assert_eq!(live, new_ids.into_iter().collect::<Vec<_>>());
}

#[tokio::test]
async fn test_request_after_reconnect() {
    let relay = MemoryRelay::new();
    let Settled {
        app,
        mut wallet,
        topic,
        ..
    } = settle(&relay).await;

    let mut app_relayer = app.client.core().relayer.subscribe_events();
    let mut wallet_relayer = wallet.client.core().relayer.subscribe_events();
    relay.disconnect_all();
    wait_for_connect(&mut app_relayer).await;
    wait_for_connect(&mut wallet_relayer).await;

    let app = Arc::new(app.client);
    let sent = {
        let app = app.clone();
        let topic = topic.clone();
        tokio::spawn(async move {
            app.request(&topic, CHAIN, "personal_sign", json!(["0x02"]), None)
                .await
        })
    };
    let pending = wait_for(&mut wallet.events, |e| match e {
        SignEvent::SessionRequest { request } => Some(request.clone()),
        _ => None,
    })
    .await;
    wallet
        .client
        .respond(&topic, JsonRpcResponse::result(pending.id, json!("ok")))
        .await
        .unwrap();
    assert_eq!(sent.await.unwrap().unwrap(), json!("ok"));
}

#[tokio::test]
async fn test_publish_while_offline_is_rejected_for_throwing_calls() {
    let relay = MemoryRelay::new();
    let Settled { app, topic, .. } = settle(&relay).await;

    let mut relayer_events = app.client.core().relayer.subscribe_events();
    relay.set_offline(true);
    relay.disconnect_all();

    // Pings require a successful publish.
    assert!(app.client.ping(&topic).await.is_err());

    relay.set_offline(false);
    wait_for_connect(&mut relayer_events).await;
    app.client.ping(&topic).await.unwrap();
}
