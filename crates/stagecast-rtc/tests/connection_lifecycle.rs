//! Connection manager against real `webrtc` peer connections. The media
//! server always fails, so every negotiation lands in degraded mode.

use std::sync::Arc;

use serde_json::json;
use stagecast_common::{Error, StagecastConfig};
use stagecast_rtc::{ConnectionManager, GuestState, NegotiationOutcome};
use stagecast_studio::{ConnectionId, GuestSlot, Layout, ParticipantId, Session, StudioStatus};
use wiremock::matchers::method;
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn failing_media_server() -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503).set_body_json(json!({ "msg": "down" })))
        .mount(&server)
        .await;
    server
}

fn manager(server: &MockServer) -> ConnectionManager {
    let mut config = StagecastConfig::default();
    config.ice_servers.clear();
    config.video.width = 64;
    config.video.height = 36;
    config.signaling.primary_url = String::new();
    config.signaling.secondary_url = format!("{}/rtc/v1/publish/", server.uri());
    ConnectionManager::from_session(Arc::new(Session::new(config))).unwrap()
}

#[tokio::test]
async fn test_publish_start_stop_lifecycle() {
    let server = failing_media_server().await;
    let manager = manager(&server);
    let status = manager.session().status();
    assert_eq!(status.current().status, StudioStatus::Ready);

    let outcome = manager.start_publish().await.unwrap();
    assert_eq!(outcome, NegotiationOutcome::Degraded);
    assert!(manager.is_publishing());
    let report = status.current();
    assert_eq!(report.status, StudioStatus::Streaming);
    assert!(report.reason.contains("degraded"));

    assert!(matches!(
        manager.start_publish().await,
        Err(Error::AlreadyStreaming)
    ));

    assert!(manager.stop_publish().await);
    assert!(!manager.is_publishing());
    let stopped = status.current();
    assert_eq!(stopped.status, StudioStatus::Ready);

    // A second stop changes nothing.
    assert!(!manager.stop_publish().await);
    assert_eq!(status.current(), stopped);
}

#[tokio::test]
async fn test_stop_without_publish_is_noop() {
    let server = failing_media_server().await;
    let manager = manager(&server);
    let before = manager.session().status().current();

    assert!(!manager.stop_publish().await);
    assert!(!manager.stop_publish().await);
    assert_eq!(manager.session().status().current(), before);
}

#[tokio::test]
async fn test_guest_connection_lifecycle() {
    let server = failing_media_server().await;
    let manager = manager(&server);
    let slot = GuestSlot::new(1).unwrap();

    let connection = manager.add_guest(slot, "alice").await.unwrap();
    assert_eq!(connection, ConnectionId(0));
    let state = manager.guest_state(slot);
    assert!(state.is_some());
    assert_ne!(state, Some(GuestState::Closed));
    let attached = manager
        .session()
        .with_registry(|r| r.get(ParticipantId::Guest(slot)).and_then(|p| p.connection));
    assert_eq!(attached, Some(connection));

    assert!(manager.remove_guest(slot).await);
    assert_eq!(manager.guest_state(slot), None);
    assert_eq!(manager.session().with_registry(|r| r.guest_count()), 0);

    assert!(!manager.close_guest_connection(slot).await);
    assert!(!manager.remove_guest(slot).await);

    // The slot is reusable once released.
    manager.add_guest(slot, "bob").await.unwrap();
    manager.shutdown().await;
    assert_eq!(manager.session().with_registry(|r| r.guest_count()), 0);
}

#[tokio::test]
async fn test_capacity_rejection_opens_no_connection() {
    let server = failing_media_server().await;
    let manager = manager(&server);
    manager.session().select_layout(Layout::PictureInPicture);

    manager.add_guest(GuestSlot::new(1).unwrap(), "alice").await.unwrap();
    let err = manager
        .add_guest(GuestSlot::new(2).unwrap(), "bob")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Capacity(_)));
    assert_eq!(manager.guest_state(GuestSlot::new(2).unwrap()), None);

    manager.shutdown().await;
}
