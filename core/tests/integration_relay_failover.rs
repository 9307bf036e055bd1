//! Relay failover: deduplication across relays and circuit breaking
//!
//! Run with: cargo test --test integration_relay_failover

use datastream_core::config::CoordinatorConfig;
use datastream_core::event::{encode_observation, DatastreamObservation, Event, EventKind, Filter};
use datastream_core::relay::{MemoryRelay, MultiRelayCoordinator, RelayState, RelayTransport};
use datastream_core::{DatastreamError, EventSigner, LocalKeys, StreamIdentity};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio_test::{assert_err, assert_ok};

fn fast_config() -> CoordinatorConfig {
    CoordinatorConfig {
        max_error_count: 3,
        reconnect_delay_ms: 200,
        operation_timeout_ms: 500,
        quorum_grace_ms: 50,
        ..Default::default()
    }
}

fn pool(relays: &[MemoryRelay]) -> MultiRelayCoordinator {
    let transports = relays
        .iter()
        .map(|r| Arc::new(r.clone()) as Arc<dyn RelayTransport>)
        .collect();
    MultiRelayCoordinator::new(fast_config(), transports).unwrap()
}

fn sealed_observation(provider: &LocalKeys, reader: &LocalKeys, seq: u64) -> Event {
    let stream = StreamIdentity::new(provider.public_key(), "grid-frequency").unwrap();
    let observation = DatastreamObservation {
        stream_name: stream.name().to_string(),
        timestamp: 1_700_000_000 + seq,
        value: json!(50.01),
        seq_num: seq,
    };
    encode_observation(&stream, &observation, &reader.public_key(), provider).unwrap()
}

#[tokio::test]
async fn test_same_event_from_two_relays_delivered_once() {
    let relays = vec![MemoryRelay::new("memory://east"), MemoryRelay::new("memory://west")];
    let coordinator = pool(&relays);
    let provider = LocalKeys::generate();
    let reader = LocalKeys::generate();

    let filter = Filter::new()
        .kind(EventKind::Observation)
        .tag("p", reader.public_key().as_hex());
    let mut stream = coordinator.subscribe(filter).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    // The provider reached both relays on its own; we see both copies
    let event = sealed_observation(&provider, &reader, 1);
    relays[0].inject(event.clone());
    relays[1].inject(event.clone());

    let got = tokio::time::timeout(Duration::from_secs(1), stream.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(got.id, event.id);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(stream.try_recv().is_none());

    let stats = coordinator.stats();
    assert_eq!(stats.events_received, 2);
    assert_eq!(stats.events_deduplicated, 1);
}

#[tokio::test]
async fn test_query_merges_copies_and_survives_a_dead_relay() {
    let relays = vec![
        MemoryRelay::new("memory://a"),
        MemoryRelay::new("memory://b"),
        MemoryRelay::new("memory://c"),
    ];
    let provider = LocalKeys::generate();
    let reader = LocalKeys::generate();
    // Sealing is randomized, so every relay gets the very same event
    let first = sealed_observation(&provider, &reader, 1);
    for relay in &relays {
        relay.inject(first.clone());
    }
    relays[1].inject(sealed_observation(&provider, &reader, 2));
    relays[2].set_online(false);

    let coordinator = pool(&relays);
    let events = coordinator
        .query(&Filter::new().kind(EventKind::Observation))
        .await
        .unwrap();
    assert_eq!(events.len(), 2);
    // Newest first
    assert!(events[0].created_at > events[1].created_at);
    assert_eq!(
        coordinator.relay_status("memory://c").unwrap().state,
        RelayState::Degraded
    );
}

#[tokio::test]
async fn test_failing_relay_opens_circuit_and_recovers() {
    let relays = vec![MemoryRelay::new("memory://steady"), MemoryRelay::new("memory://flaky")];
    let coordinator = pool(&relays);
    let provider = LocalKeys::generate();
    let reader = LocalKeys::generate();

    relays[1].fail_next(3);
    for seq in 1..=3 {
        let outcome = assert_ok!(coordinator.publish(&sealed_observation(&provider, &reader, seq)).await);
        assert_eq!(outcome.accepted, vec!["memory://steady".to_string()]);
    }
    let status = coordinator.relay_status("memory://flaky").unwrap();
    assert_eq!(status.state, RelayState::CircuitOpen);
    assert!(status.retry_in_ms.is_some());
    assert_eq!(coordinator.healthy_relays(), vec!["memory://steady".to_string()]);

    // Excluded from fan-out while the circuit is open
    let outcome = assert_ok!(coordinator.publish(&sealed_observation(&provider, &reader, 4)).await);
    assert_eq!(outcome.accepted.len(), 1);
    assert!(outcome.failed.is_empty());
    assert_eq!(relays[1].event_count(), 0);

    // Eligible again once the cooldown has passed
    tokio::time::sleep(Duration::from_millis(250)).await;
    assert!(coordinator.should_reconnect("memory://flaky"));
    let outcome = assert_ok!(coordinator.publish(&sealed_observation(&provider, &reader, 5)).await);
    assert_eq!(outcome.accepted.len(), 2);
    assert_eq!(
        coordinator.relay_status("memory://flaky").unwrap().state,
        RelayState::Healthy
    );
    assert!(coordinator.stats().relay_failures >= 3);
}

#[tokio::test]
async fn test_maintenance_reconnects_without_traffic() {
    let relays = vec![MemoryRelay::new("memory://only")];
    let coordinator = pool(&relays);
    let provider = LocalKeys::generate();
    let reader = LocalKeys::generate();

    relays[0].set_online(false);
    for seq in 1..=3 {
        assert_err!(coordinator.publish(&sealed_observation(&provider, &reader, seq)).await);
    }
    assert!(matches!(
        coordinator.publish(&sealed_observation(&provider, &reader, 4)).await,
        Err(DatastreamError::NoHealthyRelays { available: 0, .. })
    ));

    relays[0].set_online(true);
    tokio::time::sleep(Duration::from_millis(250)).await;
    assert_eq!(coordinator.maintain().await, 1);
    assert_eq!(coordinator.stats().relay_reconnects, 1);
    assert!(coordinator.healthy_relays().contains(&"memory://only".to_string()));
    assert!(!coordinator.needs_more_relays());
}

#[tokio::test]
async fn test_shutdown_stops_everything() {
    let relays = vec![MemoryRelay::new("memory://a")];
    let coordinator = pool(&relays);
    coordinator.start();
    let mut stream = coordinator.subscribe(Filter::new()).await.unwrap();

    coordinator.shutdown().await;
    assert!(coordinator.is_shutting_down());
    assert!(matches!(
        coordinator.query(&Filter::new()).await,
        Err(DatastreamError::ShuttingDown)
    ));
    let ended = tokio::time::timeout(Duration::from_secs(1), stream.recv()).await;
    assert_eq!(ended.unwrap(), None);
}
