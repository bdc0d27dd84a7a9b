//! Teardown integration tests.
//!
//! Teardown from any reachable state must leave no open pipe, no running
//! local track, no registered push-event handler and no peer stream, and
//! must be idempotent.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]

use common::types::{MediaKind, RoomId};
use sfu_client::errors::ClientError;
use sfu_client::{Config, SessionState};
use sfu_test_utils::{MockMediaSource, MockNegotiatorFactory, MockSignaling, TestClient};
use std::sync::Arc;

fn spawn_join(
    client: &TestClient,
) -> tokio::task::JoinHandle<Result<sfu_client::JoinSummary, ClientError>> {
    let orchestrator = Arc::clone(&client.orchestrator);
    tokio::spawn(async move { orchestrator.join(RoomId::new("abc123")).await })
}

#[tokio::test]
async fn test_close_active_session_releases_everything() {
    let client = TestClient::new(
        MockSignaling::builder()
            .with_existing_producer("p1", MediaKind::Video, "peerA")
            .build(),
    );
    client
        .orchestrator
        .join(RoomId::new("abc123"))
        .await
        .unwrap();
    assert_eq!(client.log().open_pipes(), 2);
    assert_eq!(client.media.live_track_count(), 2);
    assert_eq!(client.signaling.handler_count(), 2);

    client.orchestrator.close_session().await;

    client.assert_released();
    assert_eq!(client.orchestrator.state(), SessionState::Idle);
    assert_eq!(client.signaling.request_count("leaveRoom"), 1);
    assert!(!client.signaling.is_disconnected());
    assert!(client.orchestrator.room_id().is_none());
}

#[tokio::test]
async fn test_close_is_idempotent() {
    let client = TestClient::new(MockSignaling::default());
    client
        .orchestrator
        .join(RoomId::new("abc123"))
        .await
        .unwrap();

    client.orchestrator.close_session().await;
    client.orchestrator.close_session().await;

    client.assert_released();
    assert_eq!(client.orchestrator.state(), SessionState::Idle);
    assert_eq!(client.signaling.request_count("leaveRoom"), 1);
}

#[tokio::test]
async fn test_close_without_join_is_noop() {
    let client = TestClient::new(MockSignaling::default());

    client.orchestrator.close_session().await;

    assert_eq!(client.orchestrator.state(), SessionState::Idle);
    assert!(client.signaling.request_log().is_empty());
    client.assert_released();
}

#[tokio::test]
async fn test_push_events_ignored_after_close() {
    let client = TestClient::new(MockSignaling::default());
    client
        .orchestrator
        .join(RoomId::new("abc123"))
        .await
        .unwrap();
    client.orchestrator.close_session().await;

    client
        .signaling
        .emit_new_producer("p2", MediaKind::Audio, "peerA");
    tokio::task::yield_now().await;

    assert!(!client.signaling.has_handler("newProducer"));
    assert_eq!(client.signaling.request_count("consume"), 0);
    assert!(client.orchestrator.peer_streams().is_empty());
}

#[tokio::test]
async fn test_disconnect_on_leave() {
    let config = Config {
        disconnect_on_leave: true,
        ..Config::default()
    };
    let client = TestClient::with_parts(
        config,
        MockSignaling::default(),
        MockNegotiatorFactory::default(),
        MockMediaSource::new(),
    );
    client
        .orchestrator
        .join(RoomId::new("abc123"))
        .await
        .unwrap();

    client.orchestrator.close_session().await;

    assert_eq!(client.signaling.request_count("leaveRoom"), 1);
    assert!(client.signaling.is_disconnected());
}

#[tokio::test]
async fn test_close_during_join_request_discards_reply() {
    let client = TestClient::new(
        MockSignaling::builder()
            .with_existing_producer("p1", MediaKind::Video, "peerA")
            .pause_request("joinRoom")
            .build(),
    );

    let join = spawn_join(&client);
    client.signaling.wait_for_requests("joinRoom", 1).await;
    assert_eq!(client.orchestrator.state(), SessionState::Joining);

    client.orchestrator.close_session().await;
    client.signaling.release("joinRoom");

    let err = join.await.unwrap().unwrap_err();
    assert_eq!(err, ClientError::SessionClosed);
    assert_eq!(client.log().loads(), 0);
    assert_eq!(client.log().pipes_created(), 0);
    assert_eq!(client.orchestrator.state(), SessionState::Idle);
    client.assert_released();
}

#[tokio::test]
async fn test_close_during_publication() {
    let client = TestClient::new(MockSignaling::builder().pause_request("produce").build());

    let join = spawn_join(&client);
    client.signaling.wait_for_requests("produce", 1).await;
    assert_eq!(client.orchestrator.state(), SessionState::Publishing);

    client.orchestrator.close_session().await;
    client.signaling.release("produce");

    let err = join.await.unwrap().unwrap_err();
    assert_eq!(err, ClientError::SessionClosed);

    // Only the first track got as far as a produce request.
    assert_eq!(client.signaling.request_count("produce"), 1);
    assert_eq!(client.signaling.request_count("createRecvTransport"), 0);
    client.assert_released();
}

#[tokio::test]
async fn test_close_during_snapshot_consume() {
    let client = TestClient::new(
        MockSignaling::builder()
            .with_existing_producer("p1", MediaKind::Video, "peerA")
            .pause_request("consume")
            .build(),
    );

    let join = spawn_join(&client);
    client.signaling.wait_for_requests("consume", 1).await;
    assert_eq!(client.orchestrator.state(), SessionState::Subscribing);

    client.orchestrator.close_session().await;
    client.signaling.release("consume");

    let err = join.await.unwrap().unwrap_err();
    assert_eq!(err, ClientError::SessionClosed);
    assert_eq!(client.log().consumers_created(), 0);
    client.assert_released();
}

#[tokio::test]
async fn test_close_with_push_consume_in_flight() {
    let client = TestClient::new(MockSignaling::builder().pause_request("consume").build());
    client
        .orchestrator
        .join(RoomId::new("abc123"))
        .await
        .unwrap();

    client
        .signaling
        .emit_new_producer("p2", MediaKind::Audio, "peerA");
    client.signaling.wait_for_requests("consume", 1).await;

    client.orchestrator.close_session().await;
    client.signaling.release("consume");
    tokio::task::yield_now().await;

    client.assert_released();
    assert_eq!(client.orchestrator.state(), SessionState::Idle);
}

#[tokio::test]
async fn test_failed_join_then_close_is_noop() {
    let client = TestClient::with_parts(
        Config::default(),
        MockSignaling::default(),
        MockNegotiatorFactory::builder().fail_load("bad caps").build(),
        MockMediaSource::new(),
    );

    assert!(client
        .orchestrator
        .join(RoomId::new("abc123"))
        .await
        .is_err());
    let leaves = client.signaling.request_count("leaveRoom");

    client.orchestrator.close_session().await;

    assert_eq!(client.signaling.request_count("leaveRoom"), leaves);
    assert_eq!(client.orchestrator.state(), SessionState::Idle);
}
