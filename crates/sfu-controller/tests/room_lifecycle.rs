//! Integration tests for room lifecycle and disconnect cleanup.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use serde_json::json;
use sfu_controller::engine::mock::{MockMediaEngine, MockOperation};
use sfu_test_utils::*;
use std::time::Duration;

#[tokio::test]
async fn test_room_removed_after_all_peers_disconnect() {
    let sfu = TestSfu::new();
    let mut creator = sfu.connect();
    let room_id = creator.create_room().await;

    let mut peers = Vec::new();
    for _ in 0..3 {
        let mut peer = sfu.connect();
        peer.join(&room_id).await;
        let transport = peer.create_send_transport().await;
        peer.produce(&transport, "audio", opus_rtp_parameters()).await;
        peers.push(peer);
    }
    assert_eq!(sfu.engine.router_count(), 1);
    assert_eq!(sfu.engine.producer_count(), 3);

    for peer in &mut peers {
        peer.disconnect().await;
    }

    sfu.wait_for_room_removed(&room_id).await;
    assert_eq!(sfu.engine.router_count(), 0);
    assert_eq!(sfu.engine.transport_count(), 0);
    assert_eq!(sfu.engine.producer_count(), 0);

    let mut late = sfu.connect();
    let code = late
        .request_err("joinRoom", json!({ "roomId": room_id }))
        .await;
    assert_eq!(code, "RoomNotFound");
}

#[tokio::test]
async fn test_room_survives_partial_disconnect() {
    let sfu = TestSfu::new();
    let mut alice = sfu.connect();
    let mut bob = sfu.connect();
    let room_id = alice.create_room().await;
    alice.join(&room_id).await;
    bob.join(&room_id).await;

    alice.disconnect().await;

    let room = sfu.registry.get_room(&room_id).await.unwrap();
    let state = room.get_state().await.unwrap();
    assert_eq!(state.peers.len(), 1);
    assert!(state.peer(bob.connection_id()).is_some());
}

#[tokio::test]
async fn test_departed_producer_cannot_be_consumed() {
    let sfu = TestSfu::new();
    let mut alice = sfu.connect();
    let mut bob = sfu.connect();
    let room_id = alice.create_room().await;
    alice.join(&room_id).await;
    bob.join(&room_id).await;

    let send = alice.create_send_transport().await;
    alice.connect_transport(&send).await;
    let producer_id = alice.produce(&send, "video", vp8_rtp_parameters()).await;

    let recv = bob.create_receiving_transport().await;
    bob.connect_transport(&recv).await;
    bob.consume(&recv, &producer_id, default_rtp_capabilities())
        .await;
    assert_eq!(sfu.engine.consumer_count(), 1);

    alice.disconnect().await;

    let code = bob
        .request_err(
            "consumeMedia",
            json!({
                "transportId": recv,
                "producerId": producer_id,
                "rtpCapabilities": default_rtp_capabilities(),
            }),
        )
        .await;
    assert_eq!(code, "ProducerNotFound");

    // Bob's consumer of the departed producer is gone too
    assert_eq!(sfu.engine.consumer_count(), 0);
    let state = sfu
        .registry
        .get_room(&room_id)
        .await
        .unwrap()
        .get_state()
        .await
        .unwrap();
    assert!(state
        .peer(bob.connection_id())
        .unwrap()
        .consumers
        .is_empty());
}

#[tokio::test]
async fn test_disconnect_is_idempotent() {
    let sfu = TestSfu::new();
    let mut alice = sfu.connect();
    let mut bob = sfu.connect();
    let room_id = alice.create_room().await;
    alice.join(&room_id).await;
    bob.join(&room_id).await;

    alice.disconnect().await;
    alice.disconnect().await;

    assert_eq!(sfu.metrics.peer_count(), 1);
    assert_eq!(
        sfu.registry
            .get_room(&room_id)
            .await
            .unwrap()
            .get_state()
            .await
            .unwrap()
            .peers
            .len(),
        1
    );
}

#[tokio::test]
async fn test_unjoined_disconnect_leaves_rooms_alone() {
    let sfu = TestSfu::new();
    let mut alice = sfu.connect();
    let mut lurker = sfu.connect();
    let room_id = alice.create_room().await;
    alice.join(&room_id).await;

    lurker.disconnect().await;

    assert!(sfu.registry.get_room(&room_id).await.is_ok());
    assert_eq!(sfu.metrics.connection_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_unjoined_rooms_released_after_ttl() {
    let ttl = Duration::from_millis(100);
    let sfu = TestSfu::with_empty_room_ttl(ttl);
    let mut creator = sfu.connect();

    let mut room_ids = Vec::new();
    for _ in 0..50 {
        room_ids.push(creator.create_room().await);
    }
    creator.disconnect().await;
    assert_eq!(sfu.registry.get_status().await.unwrap().room_count, 50);
    assert_eq!(sfu.engine.router_count(), 50);

    tokio::time::sleep(ttl * 2).await;

    assert_eq!(sfu.registry.get_status().await.unwrap().room_count, 0);
    assert_eq!(sfu.engine.router_count(), 0);
    for room_id in &room_ids {
        assert!(sfu.registry.get_room(room_id).await.is_err());
    }
}

#[tokio::test(start_paused = true)]
async fn test_joined_room_ignores_empty_ttl() {
    let ttl = Duration::from_millis(100);
    let sfu = TestSfu::with_empty_room_ttl(ttl);
    let mut alice = sfu.connect();
    let room_id = alice.create_room().await;
    alice.join(&room_id).await;

    tokio::time::sleep(ttl * 5).await;

    assert!(sfu.registry.get_room(&room_id).await.is_ok());
    assert_eq!(sfu.engine.router_count(), 1);
}

#[tokio::test]
async fn test_hung_engine_times_out() {
    let sfu = TestSfu::with_engine(
        MockMediaEngine::builder()
            .hang_on(MockOperation::CreateTransport)
            .build(),
        Duration::from_millis(100),
    );
    let mut alice = sfu.connect();
    let room_id = alice.create_room().await;
    alice.join(&room_id).await;

    let code = alice.request_err("createSendTransport", json!({})).await;
    assert_eq!(code, "EngineTimeout");

    // The room keeps serving requests after the timeout
    let state = sfu
        .registry
        .get_room(&room_id)
        .await
        .unwrap()
        .get_state()
        .await
        .unwrap();
    assert!(state
        .peer(alice.connection_id())
        .unwrap()
        .send_transports
        .is_empty());
}

#[tokio::test]
async fn test_hung_router_creation_times_out() {
    let sfu = TestSfu::with_engine(
        MockMediaEngine::builder()
            .hang_on(MockOperation::CreateRouter)
            .build(),
        Duration::from_millis(100),
    );
    let mut client = sfu.connect();

    let code = client.request_err("createRoom", json!({})).await;
    assert_eq!(code, "EngineTimeout");
    assert_eq!(sfu.registry.get_status().await.unwrap().room_count, 0);
}

#[tokio::test]
async fn test_shutdown_drains_rooms() {
    let sfu = TestSfu::new();
    let mut alice = sfu.connect();
    let room_id = alice.create_room().await;
    alice.join(&room_id).await;
    alice.create_send_transport().await;

    sfu.registry.shutdown(Duration::from_secs(5)).await.unwrap();

    // Rooms release their resources in the background
    for _ in 0..100 {
        if sfu.engine.router_count() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(sfu.engine.router_count(), 0);
    assert_eq!(sfu.engine.transport_count(), 0);

    let mut late = sfu.connect();
    let code = late.request_err("createRoom", json!({})).await;
    assert_eq!(code, "Draining");
}
