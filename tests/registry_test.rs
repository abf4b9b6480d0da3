//! Session registry lifecycle scenarios
//!
//! Run with: cargo test --test registry_test

use crabrelay::testing::{LoopbackConnector, ScriptedBackend};
use crabrelay::{
    ConnectionState, RelayConfig, RelayError, SessionDescription, SessionId, SessionRegistry,
};
use futures::future::join_all;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

struct Harness {
    backend: ScriptedBackend,
    connector: LoopbackConnector,
    registry: SessionRegistry<LoopbackConnector>,
}

fn harness(candidates: u32) -> Harness {
    let backend = ScriptedBackend::new(candidates);
    let connector = LoopbackConnector::new();
    let mut config = RelayConfig::with_candidates(backend.candidates());
    config.camera.resolution = [16, 12];
    config.camera.fps = 100;
    config.failover.rotation_period_ms = 0;
    config.failover.open_retry_backoff_ms = 10;
    let registry = SessionRegistry::new(config, Arc::new(backend.clone()), connector.clone());
    Harness {
        backend,
        connector,
        registry,
    }
}

fn offer() -> SessionDescription {
    SessionDescription::offer("v=0\r\no=- 0 0 IN IP4 127.0.0.1\r\n")
}

async fn eventually<F, Fut>(mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..200 {
        if condition().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

async fn active_ids(registry: &SessionRegistry<LoopbackConnector>) -> Vec<SessionId> {
    registry.sessions().await.into_iter().map(|s| s.id).collect()
}

#[tokio::test]
async fn test_two_sessions_share_one_stream_torn_down_once() {
    let h = harness(2);
    let (registry, connector) = (&h.registry, &h.connector);

    h.registry.request_session(offer()).await.unwrap();
    h.registry.request_session(offer()).await.unwrap();

    let stats = h.registry.stats().await;
    assert_eq!(stats.active_sessions, 2);
    assert_eq!(stats.streams_started, 1);
    assert_eq!(stats.subscriptions_issued, 2);
    assert_eq!(h.backend.total_opens(), 1);

    let ids = active_ids(&h.registry).await;
    assert!(h.connector.disconnect(ids[0]));
    assert!(eventually(|| async move { registry.session_count().await == 1 }).await);
    assert!(h.registry.is_streaming().await);
    assert_eq!(h.registry.stats().await.streams_stopped, 0);
    assert_eq!(h.backend.total_closes(), 0);

    assert!(h.connector.disconnect(ids[1]));
    assert!(eventually(|| async move { !registry.is_streaming().await }).await);
    let stats = h.registry.stats().await;
    assert_eq!(stats.streams_stopped, 1);
    assert_eq!(stats.active_sessions, 0);
    assert_eq!(h.backend.total_closes(), 1);
    assert_eq!(h.backend.open_handles(), 0);
    assert!(eventually(|| async move { connector.peers_closed() == 2 }).await);

    h.registry.shutdown().await;
}

#[tokio::test]
async fn test_viewers_receive_ordered_frames() {
    let h = harness(1);
    let (registry, connector) = (&h.registry, &h.connector);
    h.registry.request_session(offer()).await.unwrap();
    let id = active_ids(&h.registry).await[0];

    assert!(eventually(|| async move { connector.frames_received(id) >= 5 }).await);
    assert_eq!(h.connector.out_of_order_frames(), 0);
    assert!(
        eventually(|| async move {
            registry.session_state(id).await == Some(ConnectionState::Connected)
        })
        .await
    );

    h.registry.shutdown().await;
}

#[tokio::test]
async fn test_failed_connection_is_removed() {
    let h = harness(1);
    h.registry.request_session(offer()).await.unwrap();
    let id = active_ids(&h.registry).await[0];

    let (registry, connector) = (&h.registry, &h.connector);
    h.connector.fail(id);
    assert!(eventually(|| async move { registry.session_count().await == 0 }).await);
    assert!(!h.registry.is_streaming().await);
    assert!(eventually(|| async move { connector.is_closed(id) }).await);

    h.registry.shutdown().await;
}

#[tokio::test]
async fn test_disconnected_is_not_terminal() {
    let h = harness(1);
    h.registry.request_session(offer()).await.unwrap();
    let id = active_ids(&h.registry).await[0];

    h.registry
        .on_connection_state_change(id, ConnectionState::Disconnected)
        .await;
    assert_eq!(
        h.registry.session_state(id).await,
        Some(ConnectionState::Disconnected)
    );
    assert!(h.registry.is_streaming().await);

    h.registry.shutdown().await;
}

#[tokio::test]
async fn test_no_camera_fails_setup_then_recovers() {
    let h = harness(2);
    h.backend.fail_open(0);
    h.backend.fail_open(1);

    let result = h.registry.request_session(offer()).await;
    assert!(matches!(
        result,
        Err(RelayError::NoCandidateAvailable { tried: 2 })
    ));
    assert!(!h.registry.is_streaming().await);
    assert_eq!(h.registry.session_count().await, 0);

    h.backend.allow_open(1);
    h.registry.request_session(offer()).await.unwrap();
    assert!(h.registry.is_streaming().await);
    assert_eq!(h.registry.active_candidate().await, Some(1));

    h.registry.shutdown().await;
    assert_eq!(h.backend.open_handles(), 0);
}

#[tokio::test]
async fn test_rejected_offer_does_not_disturb_existing_session() {
    let h = harness(1);
    h.registry.request_session(offer()).await.unwrap();

    let result = h
        .registry
        .request_session(SessionDescription::offer("reject me"))
        .await;
    assert!(matches!(result, Err(RelayError::NegotiationError(_))));

    let stats = h.registry.stats().await;
    assert_eq!(stats.active_sessions, 1);
    assert_eq!(stats.streams_started, 1);
    assert_eq!(stats.streams_stopped, 0);
    assert_eq!(stats.sessions_rejected, 1);
    assert_eq!(h.registry.hub_stats().await.map(|(subs, _)| subs), Some(1));

    h.registry.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_drains_sessions_then_releases_camera() {
    let h = harness(2);
    for _ in 0..3 {
        h.registry.request_session(offer()).await.unwrap();
    }

    h.registry.shutdown().await;
    assert_eq!(h.connector.peers_closed(), 3);
    assert_eq!(h.registry.session_count().await, 0);
    assert!(!h.registry.is_streaming().await);
    assert_eq!(h.backend.open_handles(), 0);
    assert_eq!(h.registry.stats().await.streams_stopped, 1);

    let result = h.registry.request_session(offer()).await;
    assert!(matches!(result, Err(RelayError::ShuttingDown)));
}

#[tokio::test]
async fn test_shutdown_during_negotiation() {
    let h = harness(1);
    h.connector.set_accept_delay(Duration::from_millis(50));

    let pending = {
        let registry = h.registry.clone();
        tokio::spawn(async move { registry.request_session(offer()).await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    h.registry.shutdown().await;

    let result = pending.await.unwrap();
    assert!(matches!(result, Err(RelayError::ShuttingDown)));
    assert_eq!(h.backend.open_handles(), 0);
    assert_eq!(h.connector.peers_closed(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_connects_and_disconnects() {
    let h = harness(2);

    for round in 0..5 {
        let answers = join_all((0..6).map(|_| h.registry.request_session(offer()))).await;
        assert!(answers.iter().all(Result::is_ok), "round {}", round);
        assert!(h.registry.is_streaming().await);

        let ids = active_ids(&h.registry).await;
        assert_eq!(ids.len(), 6);

        // half close directly, half through transport events, while new viewers arrive
        let (direct, evented) = ids.split_at(3);
        let closes = join_all(
            direct
                .iter()
                .map(|id| h.registry.on_connection_state_change(*id, ConnectionState::Closed)),
        );
        let arrivals = join_all((0..2).map(|_| h.registry.request_session(offer())));
        for id in evented {
            h.connector.disconnect(*id);
        }
        let (_, arrived) = futures::join!(closes, arrivals);
        assert!(arrived.iter().all(Result::is_ok));

        let registry = &h.registry;
        assert!(eventually(|| async move { registry.session_count().await == 2 }).await);
        assert!(h.registry.is_streaming().await);

        let remaining = active_ids(&h.registry).await;
        join_all(
            remaining
                .iter()
                .map(|id| h.registry.on_connection_state_change(*id, ConnectionState::Failed)),
        )
        .await;

        assert!(!h.registry.is_streaming().await);
        assert_eq!(h.backend.open_handles(), 0);
    }

    let stats = h.registry.stats().await;
    assert_eq!(stats.streams_started, 5);
    assert_eq!(stats.streams_stopped, 5);
    assert_eq!(stats.sessions_created, 40);
    assert_eq!(h.backend.max_open_handles(), 1);

    h.registry.shutdown().await;
}
