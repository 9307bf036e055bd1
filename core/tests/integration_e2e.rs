//! End-to-end metered delivery between a provider and a subscriber
//!
//! Both clients run their own coordinator over the same in-process relays:
//! 1. Provider announces a paid stream
//! 2. Subscriber subscribes; provider picks the subscription up
//! 3. Observation 1 is delivered free
//! 4. Subscriber pays for 2, which is then delivered
//! 5. Observation 3 is withheld without a payment
//!
//! Run with: cargo test --test integration_e2e

use datastream_core::access::SubscriberAccessController;
use datastream_core::client::{DatastreamProvider, DatastreamSubscriber, ReceivedObservation};
use datastream_core::config::{ClientConfig, CoordinatorConfig};
use datastream_core::event::{DatastreamMetadata, EventKind};
use datastream_core::relay::{MemoryRelay, MultiRelayCoordinator, RelayTransport};
use datastream_core::{EventSigner, LocalKeys, StreamIdentity};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

fn coordinator(relays: &[MemoryRelay]) -> MultiRelayCoordinator {
    let transports = relays
        .iter()
        .map(|r| Arc::new(r.clone()) as Arc<dyn RelayTransport>)
        .collect();
    MultiRelayCoordinator::new(CoordinatorConfig::default(), transports).unwrap()
}

async fn next(rx: &mut mpsc::Receiver<ReceivedObservation>) -> ReceivedObservation {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("observation not delivered in time")
        .expect("observation channel closed")
}

#[tokio::test]
async fn test_e2e_metered_stream() {
    let relays = vec![MemoryRelay::new("memory://one"), MemoryRelay::new("memory://two")];

    // Step 1: provider announces btc-usd at 10 sats per observation
    let provider = Arc::new(DatastreamProvider::new(
        Arc::new(LocalKeys::generate()),
        coordinator(&relays),
        Arc::new(SubscriberAccessController::new()),
    ));
    let stream = provider.stream("btc-usd").unwrap();
    let mut meta = DatastreamMetadata::new(stream.clone(), 1_700_000_000);
    meta.price_per_obs = 10;
    meta.cadence_seconds = Some(3600);
    meta.tags.insert("finance".to_string());
    let outcome = provider.announce(&meta).await.unwrap();
    assert_eq!(outcome.accepted.len(), 2);

    // Step 2: subscriber finds it, subscribes, and starts listening
    let subscriber_keys = Arc::new(LocalKeys::generate());
    let me = subscriber_keys.public_key();
    let config = ClientConfig {
        auto_pay: false,
        ..Default::default()
    };
    let subscriber = Arc::new(
        DatastreamSubscriber::from_config(subscriber_keys, coordinator(&relays), &config).unwrap(),
    );
    let mut observations = subscriber.observations().unwrap();

    let found = subscriber.discover(&["finance".to_string()], false).await.unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].identity, stream);

    let subscribed = subscriber.subscribe(&stream).await.unwrap();
    assert_eq!(subscribed.price_per_obs, 10);
    subscriber.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(provider.sync().await.unwrap(), 1);
    assert!(provider.access().subscriber(&stream, &me).is_some());

    // Step 3: the first observation is free
    let first = provider
        .publish_observation(&stream, json!({ "price": 64000 }))
        .await
        .unwrap();
    assert_eq!(first.seq, 1);
    assert_eq!(first.delivered, vec![me.clone()]);
    let received = next(&mut observations).await;
    assert_eq!(received.observation.seq_num, 1);
    assert_eq!(received.observation.value, json!({ "price": 64000 }));

    // Step 4: pay for 2, provider sees the payment, 2 is delivered
    subscriber.pay(&stream, 2).await.unwrap();
    provider.sync().await.unwrap();
    assert!(provider.access().is_eligible(&stream, &me, 2));

    let second = provider
        .publish_observation(&stream, json!({ "price": 64100 }))
        .await
        .unwrap();
    assert_eq!(second.delivered, vec![me.clone()]);
    assert_eq!(next(&mut observations).await.observation.seq_num, 2);

    // Step 5: nothing paid for 3, so nothing is sent
    let third = provider
        .publish_observation(&stream, json!({ "price": 64200 }))
        .await
        .unwrap();
    assert_eq!(third.seq, 3);
    assert!(third.delivered.is_empty());
    assert_eq!(third.withheld, vec![me.clone()]);

    for relay in &relays {
        let sealed: Vec<_> = relay
            .events()
            .into_iter()
            .filter(|e| e.kind == EventKind::Observation.as_u16())
            .collect();
        assert_eq!(sealed.len(), 2);
        assert!(sealed.iter().all(|e| e.tag_value("seq") != Some("3")));
    }

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(observations.try_recv().is_err());

    // Two relays, one delivery each
    let stats = subscriber.stats();
    assert_eq!(stats.observations_received, 2);
    assert!(stats.coordinator.events_deduplicated >= 2);

    subscriber.stop().await;
    provider.stop().await;
}

#[tokio::test]
async fn test_e2e_free_stream_delivers_everything() {
    let relays = vec![MemoryRelay::new("memory://one")];
    let provider = DatastreamProvider::new(
        Arc::new(LocalKeys::generate()),
        coordinator(&relays),
        Arc::new(SubscriberAccessController::new()),
    );
    let stream: StreamIdentity = provider.stream("weather").unwrap();
    provider
        .announce(&DatastreamMetadata::new(stream.clone(), 1_700_000_000))
        .await
        .unwrap();

    let config = ClientConfig {
        auto_pay: true,
        ..Default::default()
    };
    let subscriber = DatastreamSubscriber::from_config(
        Arc::new(LocalKeys::generate()),
        coordinator(&relays),
        &config,
    )
    .unwrap();
    subscriber.subscribe(&stream).await.unwrap();
    provider.sync().await.unwrap();

    for i in 1..=3 {
        let report = provider.publish_observation(&stream, json!(i)).await.unwrap();
        assert_eq!(report.delivered.len(), 1);
        assert!(report.withheld.is_empty());
    }
    // Free streams never trigger payments
    assert_eq!(subscriber.stats().payments_sent, 0);
}
