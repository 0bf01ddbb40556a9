//! Abuse limits, timeouts and the reconnect grace window.

use std::time::Duration;
use subdrop_engine::{EngineError, EngineEvent, OutgoingFile};
use subdrop_integration_tests::*;
use subdrop_relay::GuardConfig;

#[tokio::test]
async fn rate_limited_client_sees_relay_error() {
    let relay = start_relay_with(GuardConfig {
        max_events: 3,
        window: Duration::from_secs(60),
        block: Duration::from_secs(60),
    })
    .await;
    let mut alpha = join(relay, "Alpha").await;

    // client-init used one event; burn the rest with renames.
    for _ in 0..4 {
        alpha.handle.change_name("Spam").unwrap();
    }

    let event = expect_event(&mut alpha.events, |e| {
        matches!(e, EngineEvent::RelayError { .. })
    })
    .await;
    match event {
        EngineEvent::RelayError { message } => assert!(message.contains("Rate limit")),
        _ => unreachable!(),
    }
}

#[tokio::test]
async fn unanswered_file_request_times_out() {
    let relay = start_relay().await;
    let mut config = test_config(relay, "Alpha");
    config.handshake_timeout = Duration::from_millis(300);
    let alpha = join_with(config).await;
    let mut alpha = alpha;

    let mut beta = join(relay, "Beta").await;
    let beta_conn = await_peer(&mut alpha, "Beta").await;

    let file = OutgoingFile {
        file_name: "ignored.txt".into(),
        relative_path: "ignored.txt".into(),
        data: payload(1_000),
    };
    // Beta never answers the request.
    let result = alpha.handle.send_file(beta_conn, file, None).await;
    assert!(matches!(result, Err(EngineError::HandshakeTimeout)));

    // Beta still saw the request; its late answer must not wake anything.
    let from = match expect_event(&mut beta.events, |e| {
        matches!(e, EngineEvent::IncomingFile { .. })
    })
    .await
    {
        EngineEvent::IncomingFile { from, .. } => from,
        _ => unreachable!(),
    };
    beta.handle.respond_file(from, true).unwrap();
    expect_silence(&mut beta.events, Duration::from_millis(300), |e| {
        matches!(e, EngineEvent::FileReceived { .. })
    })
    .await;
}

#[tokio::test]
async fn departed_peer_expires_after_grace_window() {
    let relay = start_relay().await;
    let mut alpha = join(relay, "Alpha").await;
    let beta = join(relay, "Beta").await;
    await_peer(&mut alpha, "Beta").await;
    let beta_client = beta.client_id.clone();

    beta.handle.shutdown();
    drop(beta);

    let left = expect_event(&mut alpha.events, |e| {
        matches!(e, EngineEvent::PeerLeft { .. })
    })
    .await;
    match left {
        EngineEvent::PeerLeft { client_id } => assert_eq!(client_id, beta_client),
        _ => unreachable!(),
    }

    let expired = expect_event(&mut alpha.events, |e| {
        matches!(e, EngineEvent::PeerExpired { .. })
    })
    .await;
    match expired {
        EngineEvent::PeerExpired { client_id } => assert_eq!(client_id, beta_client),
        _ => unreachable!(),
    }
    assert!(alpha.handle.peers().await.unwrap().is_empty());
}

#[tokio::test]
async fn reconnect_inside_grace_revives_the_peer() {
    let relay = start_relay().await;
    let mut alpha = join(relay, "Alpha").await;
    let mut beta = join(relay, "Beta").await;
    let beta_conn = await_peer(&mut alpha, "Beta").await;
    let alpha_conn = await_peer(&mut beta, "Alpha").await;

    // Build up history so revival is observable.
    alpha.handle.send_chat(beta_conn, "before drop").await.unwrap();
    expect_event(&mut beta.events, |e| {
        matches!(e, EngineEvent::ChatReceived { .. })
    })
    .await;
    let _ = alpha_conn;

    let beta_client = beta.client_id.clone();
    beta.handle.shutdown();
    drop(beta);
    expect_event(&mut alpha.events, |e| {
        matches!(e, EngineEvent::PeerLeft { .. })
    })
    .await;

    // Same stable client id, fresh connection, inside the window.
    let mut config = test_config(relay, "Beta");
    config.client_id = beta_client.clone();
    let _beta2 = join_with(config).await;

    let rejoined = expect_event(&mut alpha.events, |e| {
        matches!(e, EngineEvent::PeerJoined { .. })
    })
    .await;
    match rejoined {
        EngineEvent::PeerJoined { peer, reconnected } => {
            assert!(reconnected);
            assert_eq!(peer.client_id, beta_client);
        }
        _ => unreachable!(),
    }

    // The stale grace timer must not evict the revived peer afterwards.
    expect_silence(&mut alpha.events, Duration::from_millis(600), |e| {
        matches!(e, EngineEvent::PeerExpired { .. })
    })
    .await;

    // History with that peer survived the reconnect.
    let history = alpha.handle.chat_history(&beta_client).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].text, "before drop");
}

#[tokio::test]
async fn unread_counts_track_selection() {
    let relay = start_relay().await;
    let mut alpha = join(relay, "Alpha").await;
    let mut beta = join(relay, "Beta").await;
    await_peer(&mut alpha, "Beta").await;
    let alpha_conn = await_peer(&mut beta, "Alpha").await;

    beta.handle.send_chat(alpha_conn, "one").await.unwrap();
    beta.handle.send_chat(alpha_conn, "two").await.unwrap();
    expect_event(&mut alpha.events, |e| {
        matches!(e, EngineEvent::ChatReceived { message, .. } if message.text == "two")
    })
    .await;

    let peers = alpha.handle.peers().await.unwrap();
    assert_eq!(peers.len(), 1);
    assert_eq!(peers[0].unread, 2);

    alpha.handle.select_peer(Some(beta.client_id.clone())).unwrap();
    let peers = alpha.handle.peers().await.unwrap();
    assert_eq!(peers[0].unread, 0);

    // While selected, incoming messages don't count as unread.
    beta.handle.send_chat(alpha_conn, "three").await.unwrap();
    expect_event(&mut alpha.events, |e| {
        matches!(e, EngineEvent::ChatReceived { message, .. } if message.text == "three")
    })
    .await;
    let peers = alpha.handle.peers().await.unwrap();
    assert_eq!(peers[0].unread, 0);
}
