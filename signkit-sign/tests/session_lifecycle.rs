//! Proposal, settlement, controller changes and teardown between two clients.

mod common;

use common::{
    approved_namespaces, init_tracing, peer, required, settle, wait_for, Settled, CHAIN,
};
use serde_json::json;
use signkit_lib::history::RecordResponse;
use signkit_lib::jsonrpc::{payload_id, JsonRpcRequest};
use signkit_lib::relay::PublishOptions;
use signkit_lib::test_utils::MemoryRelay;
use signkit_lib::{SdkError, SignkitError};
use signkit_sign::{ConnectParams, EventPayload, SignEvent};
use std::time::Duration;

#[tokio::test]
async fn test_settled_session_matches_on_both_sides() {
    let relay = MemoryRelay::new();
    let Settled {
        app,
        wallet,
        topic,
        app_session,
        wallet_session,
    } = settle(&relay).await;

    assert_eq!(app_session.topic, topic);
    assert_eq!(wallet_session.topic, topic);
    assert_eq!(app_session.namespaces, approved_namespaces());
    assert_eq!(app_session.namespaces, wallet_session.namespaces);
    assert_eq!(app_session.controller, wallet_session.controller);
    assert_eq!(app_session.controller, wallet_session.self_.public_key);
    assert_eq!(app_session.peer.public_key, wallet_session.self_.public_key);
    assert!(app_session.is_acknowledged());
    assert!(wallet_session.is_acknowledged());
    assert!(wallet_session.is_controller());
    assert!(!app_session.is_controller());

    // Both sides hold the same session and nothing left to settle.
    assert_eq!(app.client.get_session(&topic).await.unwrap().expiry, app_session.expiry);
    assert!(app.client.get_proposals().await.is_empty());
    assert!(wallet.client.get_proposals().await.is_empty());
    assert_eq!(
        wallet
            .client
            .find_sessions_by_pairing(&wallet_session.pairing_topic)
            .await
            .len(),
        1
    );
}

#[tokio::test]
async fn test_app_sees_session_connect() {
    let relay = MemoryRelay::new();
    let Settled { mut app, topic, .. } = settle(&relay).await;

    let connected = wait_for(&mut app.events, |e| match e {
        SignEvent::SessionConnect { session } => Some(session.topic.clone()),
        _ => None,
    })
    .await;
    assert_eq!(connected, topic);
}

#[tokio::test]
async fn test_disconnect_removes_session_on_both_sides() {
    let relay = MemoryRelay::new();
    let Settled {
        app,
        mut wallet,
        topic,
        ..
    } = settle(&relay).await;

    app.client.disconnect(&topic, None).await.unwrap();

    let err = app.client.ping(&topic).await.unwrap_err();
    assert!(matches!(err, SignkitError::NoMatchingKey { .. }), "{err:?}");
    assert!(app.client.get_sessions().await.is_empty());

    let deleted = wait_for(&mut wallet.events, |e| match e {
        SignEvent::SessionDelete { topic, .. } => Some(topic.clone()),
        _ => None,
    })
    .await;
    assert_eq!(deleted, topic);
    assert!(wallet.client.get_sessions().await.is_empty());
    assert!(!wallet.client.core().crypto.has_keys(&topic).await);
}

#[tokio::test]
async fn test_rejected_proposal_fails_approval() {
    common::init_tracing();
    let relay = MemoryRelay::new();
    let app = common::peer(&relay, "app").await;
    let mut wallet = common::peer(&relay, "wallet").await;

    let connection = app
        .client
        .connect(ConnectParams {
            required_namespaces: required(),
            ..Default::default()
        })
        .await
        .unwrap();
    wallet
        .client
        .pair(connection.uri.as_deref().unwrap())
        .await
        .unwrap();
    let id = wait_for(&mut wallet.events, |e| match e {
        SignEvent::SessionProposal { proposal } => Some(proposal.id),
        _ => None,
    })
    .await;

    wallet.client.reject(id, None).await.unwrap();

    match connection.approval.wait().await {
        Err(SignkitError::Rejected { code, message }) => {
            assert_eq!(code, SdkError::UserRejected.code());
            assert_eq!(message, "User rejected.");
        }
        other => panic!("expected rejection, got {other:?}"),
    }
    assert!(app.client.get_proposals().await.is_empty());
    assert!(wallet.client.get_proposals().await.is_empty());
}

#[tokio::test]
async fn test_approve_with_missing_required_namespace_fails_locally() {
    common::init_tracing();
    let relay = MemoryRelay::new();
    let app = common::peer(&relay, "app").await;
    let mut wallet = common::peer(&relay, "wallet").await;

    let connection = app
        .client
        .connect(ConnectParams {
            required_namespaces: required(),
            ..Default::default()
        })
        .await
        .unwrap();
    wallet
        .client
        .pair(connection.uri.as_deref().unwrap())
        .await
        .unwrap();
    let id = wait_for(&mut wallet.events, |e| match e {
        SignEvent::SessionProposal { proposal } => Some(proposal.id),
        _ => None,
    })
    .await;

    let mut namespaces = approved_namespaces();
    namespaces.get_mut("eip155").unwrap().methods = vec!["eth_sendTransaction".to_string()];
    let err = wallet
        .client
        .approve(signkit_sign::ApproveParams {
            id,
            namespaces,
            session_properties: None,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, SignkitError::ValidationFailed(_)), "{err:?}");
    // The proposal stays open for another attempt.
    assert_eq!(wallet.client.get_proposals().await.len(), 1);
}

#[tokio::test]
async fn test_controller_update_reaches_peer() {
    let relay = MemoryRelay::new();
    let Settled {
        mut app,
        wallet,
        topic,
        ..
    } = settle(&relay).await;

    let mut namespaces = approved_namespaces();
    namespaces
        .get_mut("eip155")
        .unwrap()
        .methods
        .push("eth_signTypedData".to_string());

    let ack = wallet.client.update(&topic, namespaces.clone()).await.unwrap();
    // Applied locally before the peer answers.
    assert_eq!(wallet.client.get_session(&topic).await.unwrap().namespaces, namespaces);

    let session = ack.wait().await.unwrap();
    assert_eq!(session.namespaces, namespaces);
    assert!(session.provisional().is_empty());

    let seen = wait_for(&mut app.events, |e| match e {
        SignEvent::SessionUpdate { namespaces, .. } => Some(namespaces.clone()),
        _ => None,
    })
    .await;
    assert_eq!(seen, namespaces);
    assert_eq!(app.client.get_session(&topic).await.unwrap().namespaces, namespaces);
}

#[tokio::test]
async fn test_non_controller_cannot_update() {
    let relay = MemoryRelay::new();
    let Settled { app, topic, .. } = settle(&relay).await;

    let err = app
        .client
        .update(&topic, approved_namespaces())
        .await
        .unwrap_err();
    assert!(matches!(err, SignkitError::ValidationFailed(_)), "{err:?}");
    let err = app.client.extend(&topic).await.unwrap_err();
    assert!(matches!(err, SignkitError::ValidationFailed(_)), "{err:?}");
}

#[tokio::test]
async fn test_extend_moves_expiry_on_both_sides() {
    let relay = MemoryRelay::new();
    let Settled {
        mut app,
        wallet,
        topic,
        app_session,
        ..
    } = settle(&relay).await;

    tokio::time::sleep(std::time::Duration::from_millis(1100)).await;
    let session = wallet.client.extend(&topic).await.unwrap().wait().await.unwrap();
    assert!(session.expiry > app_session.expiry);

    let expiry = wait_for(&mut app.events, |e| match e {
        SignEvent::SessionExtend { expiry, .. } => Some(*expiry),
        _ => None,
    })
    .await;
    assert_eq!(expiry, session.expiry);
    assert_eq!(app.client.get_session(&topic).await.unwrap().expiry, session.expiry);
}

#[tokio::test]
async fn test_emit_reaches_peer() {
    let relay = MemoryRelay::new();
    let Settled {
        mut app,
        wallet,
        topic,
        ..
    } = settle(&relay).await;

    let event = EventPayload {
        name: "accountsChanged".to_string(),
        data: json!(["0xab16a96d359ec26a11e2c2b3d8f8b8942d5bfcdb"]),
    };
    wallet.client.emit(&topic, CHAIN, event.clone()).await.unwrap();

    let (chain_id, seen) = wait_for(&mut app.events, |e| match e {
        SignEvent::SessionEvent { chain_id, event, .. } => Some((chain_id.clone(), event.clone())),
        _ => None,
    })
    .await;
    assert_eq!(chain_id, CHAIN);
    assert_eq!(seen, event);
}

#[tokio::test]
async fn test_emit_unapproved_event_fails_locally() {
    let relay = MemoryRelay::new();
    let Settled { wallet, topic, .. } = settle(&relay).await;

    let err = wallet
        .client
        .emit(
            &topic,
            CHAIN,
            EventPayload {
                name: "somethingElse".to_string(),
                data: json!(null),
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, SignkitError::ValidationFailed(_)), "{err:?}");
}

#[tokio::test]
async fn test_session_and_pairing_ping() {
    let relay = MemoryRelay::new();
    let Settled {
        app,
        mut wallet,
        topic,
        app_session,
        ..
    } = settle(&relay).await;

    app.client.ping(&topic).await.unwrap();
    let pinged = wait_for(&mut wallet.events, |e| match e {
        SignEvent::SessionPing { topic, .. } => Some(topic.clone()),
        _ => None,
    })
    .await;
    assert_eq!(pinged, topic);

    app.client.ping(&app_session.pairing_topic).await.unwrap();

    let err = app.client.ping("not-a-topic").await.unwrap_err();
    assert!(matches!(err, SignkitError::NoMatchingKey { .. }), "{err:?}");
}

#[tokio::test]
async fn test_connect_on_existing_pairing_has_no_uri() {
    let relay = MemoryRelay::new();
    let Settled {
        app,
        mut wallet,
        app_session,
        ..
    } = settle(&relay).await;

    let connection = app
        .client
        .connect(ConnectParams {
            required_namespaces: required(),
            pairing_topic: Some(app_session.pairing_topic.clone()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert!(connection.uri.is_none());
    assert_eq!(connection.pairing_topic, app_session.pairing_topic);

    let proposal = wait_for(&mut wallet.events, |e| match e {
        SignEvent::SessionProposal { proposal } => Some(proposal.clone()),
        _ => None,
    })
    .await;
    assert_eq!(proposal.id, connection.approval.proposal_id());
    assert_eq!(proposal.pairing_topic, app_session.pairing_topic);
}

#[tokio::test]
async fn test_stale_update_is_acknowledged_but_not_applied() {
    let relay = MemoryRelay::new();
    let Settled {
        mut app,
        wallet,
        topic,
        ..
    } = settle(&relay).await;

    let older = payload_id();
    let newer = payload_id();
    let with_method = |method: &str| {
        let mut namespaces = approved_namespaces();
        namespaces
            .get_mut("eip155")
            .unwrap()
            .methods
            .push(method.to_string());
        namespaces
    };
    let latest = with_method("eth_signTypedData");
    let superseded = with_method("eth_sign");

    // Deliver the two updates in reverse id order.
    let relayer = &wallet.client.core().relayer;
    let update =
        JsonRpcRequest::with_id(newer, "wc_sessionUpdate", json!({ "namespaces": latest }));
    relayer
        .publish(&topic, &update.into(), PublishOptions::default())
        .await
        .unwrap();
    let applied = wait_for(&mut app.events, |e| match e {
        SignEvent::SessionUpdate { id, .. } => Some(*id),
        _ => None,
    })
    .await;
    assert_eq!(applied, newer);

    let update =
        JsonRpcRequest::with_id(older, "wc_sessionUpdate", json!({ "namespaces": superseded }));
    relayer
        .publish(&topic, &update.into(), PublishOptions::default())
        .await
        .unwrap();
    let answer = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Ok(record) = wallet.client.core().history.get(&topic, older).await {
                if let Some(response) = record.response {
                    return response;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("stale update answered");
    assert_eq!(answer, RecordResponse::Result(json!(true)));

    assert_eq!(app.client.get_session(&topic).await.unwrap().namespaces, latest);
    while let Ok(event) = app.events.try_recv() {
        assert!(
            !matches!(event, SignEvent::SessionUpdate { id, .. } if id == older),
            "stale update surfaced"
        );
    }
}

#[tokio::test]
async fn test_session_method_on_inactive_pairing_gets_one_answer() {
    init_tracing();
    let relay = MemoryRelay::new();
    let app = peer(&relay, "app").await;
    let wallet = peer(&relay, "wallet").await;

    let connection = app
        .client
        .connect(ConnectParams {
            required_namespaces: required(),
            ..Default::default()
        })
        .await
        .unwrap();
    let pairing_topic = connection.pairing_topic.clone();
    wallet.client.pair(&connection.uri.unwrap()).await.unwrap();

    let ping = JsonRpcRequest::new("wc_sessionPing", json!({}));
    let id = ping.id;
    let before = relay.published_count();
    app.client
        .core()
        .relayer
        .publish(&pairing_topic, &ping.into(), PublishOptions::default())
        .await
        .unwrap();

    let answer = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Ok(record) = app.client.core().history.get(&pairing_topic, id).await {
                if let Some(response) = record.response {
                    return response;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("ping answered");
    match answer {
        RecordResponse::Error(error) => {
            assert_eq!(error.code, SdkError::WcMethodUnsupported.code())
        }
        other => panic!("expected an error, got {other:?}"),
    }

    // Give a second answer time to show up.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(relay.published_count(), before + 2);
}
