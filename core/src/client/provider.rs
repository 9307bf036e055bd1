// Datastream provider — announces streams and meters observations out
//
// Observations are sealed separately for every subscriber allowed to see
// them; a withheld subscriber gets nothing, not even a ciphertext.

use super::router::{route_events, TopicStreams};
use crate::access::{SledSubscriptionStore, SubscriberAccessController};
use crate::config::ClientConfig;
use crate::crypto::Keyring;
use crate::event::{
    decode_event, encode_announcement, encode_observation, DatastreamMetadata,
    DatastreamObservation, DecodedEvent, Event, EventKind, Filter,
};
use crate::identity::{PublicKey, StreamIdentity};
use crate::relay::{MultiRelayCoordinator, PublishOutcome};
use crate::{DatastreamError, Result};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const TOPIC_BUFFER: usize = 256;

/// What publishing one observation did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishReport {
    pub seq: u64,
    /// Subscribers the observation was sealed and published to
    pub delivered: Vec<PublicKey>,
    /// Subscribers not paid up for this sequence number
    pub withheld: Vec<PublicKey>,
    /// Eligible subscribers whose copy could not be published
    pub failed: Vec<(PublicKey, String)>,
}

/// Effect of one inbound event on provider state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ingested {
    Subscription { subscriber: PublicKey, created: bool },
    Payment { payer: PublicKey, paid_through: u64 },
    /// Not addressed to one of our streams, or not a kind we act on
    Ignored,
}

pub struct DatastreamProvider {
    keys: Arc<dyn Keyring>,
    coordinator: MultiRelayCoordinator,
    access: Arc<SubscriberAccessController>,
    streams: RwLock<HashMap<StreamIdentity, DatastreamMetadata>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl DatastreamProvider {
    pub fn new(
        keys: Arc<dyn Keyring>,
        coordinator: MultiRelayCoordinator,
        access: Arc<SubscriberAccessController>,
    ) -> Self {
        Self {
            keys,
            coordinator,
            access,
            streams: RwLock::new(HashMap::new()),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Provider whose subscriber records live in
    /// `config.subscription_db_path`, restored on open. Without a path the
    /// records are kept in memory only.
    pub fn from_config(
        keys: Arc<dyn Keyring>,
        coordinator: MultiRelayCoordinator,
        config: &ClientConfig,
    ) -> Result<Self> {
        let access = match &config.subscription_db_path {
            Some(path) => {
                let store = SledSubscriptionStore::open(path)?;
                let access = SubscriberAccessController::with_store(Arc::new(store));
                let restored = access.load()?;
                debug!("Opened subscriber store at {} ({} records)", path.display(), restored);
                access
            }
            None => SubscriberAccessController::new(),
        };
        Ok(Self::new(keys, coordinator, Arc::new(access)))
    }

    pub fn public_key(&self) -> PublicKey {
        self.keys.public_key()
    }

    pub fn access(&self) -> &Arc<SubscriberAccessController> {
        &self.access
    }

    pub fn coordinator(&self) -> &MultiRelayCoordinator {
        &self.coordinator
    }

    /// Identity of one of our streams by name
    pub fn stream(&self, name: &str) -> Result<StreamIdentity> {
        StreamIdentity::new(self.public_key(), name)
    }

    pub fn metadata(&self, stream: &StreamIdentity) -> Option<DatastreamMetadata> {
        self.streams.read().get(stream).cloned()
    }

    pub fn streams(&self) -> Vec<DatastreamMetadata> {
        self.streams.read().values().cloned().collect()
    }

    /// Publish (or update) a stream announcement and start metering it.
    pub async fn announce(&self, meta: &DatastreamMetadata) -> Result<PublishOutcome> {
        let event = encode_announcement(meta, self.keys.as_ref())?;
        self.access
            .register_stream(&meta.identity, meta.price_per_obs);
        self.streams
            .write()
            .insert(meta.identity.clone(), meta.clone());

        let outcome = self.coordinator.publish(&event).await?;
        info!(
            "Announced {} ({} sats/obs) on {} relays",
            meta.identity,
            meta.price_per_obs,
            outcome.accepted.len()
        );
        Ok(outcome)
    }

    /// Apply a subscription or payment event addressed to us.
    pub fn ingest(&self, event: &Event) -> Result<Ingested> {
        match event.event_kind() {
            Some(EventKind::Subscription) | Some(EventKind::Payment) => {}
            _ => return Ok(Ingested::Ignored),
        }

        match decode_event(event, self.keys.as_ref())? {
            DecodedEvent::Subscription(notice) => {
                if notice.stream.owner() != &self.public_key() {
                    return Ok(Ingested::Ignored);
                }
                let created = self.access.on_subscription(&notice);
                Ok(Ingested::Subscription {
                    subscriber: notice.subscriber,
                    created,
                })
            }
            DecodedEvent::Payment(notice) => {
                let paid_through = self.access.on_payment(&notice)?;
                Ok(Ingested::Payment {
                    payer: notice.payer,
                    paid_through,
                })
            }
            _ => Ok(Ingested::Ignored),
        }
    }

    fn subscriptions_filter(&self) -> Filter {
        Filter::new()
            .kind(EventKind::Subscription)
            .kind(EventKind::Payment)
            .tag("p", self.public_key().as_hex())
    }

    /// Catch up on subscriptions and payments the relays hold for us:
    /// every subscription first, then payments, each oldest first.
    /// Returns how many events changed state.
    pub async fn sync(&self) -> Result<usize> {
        let mut events = self.coordinator.query(&self.subscriptions_filter()).await?;
        events.reverse();
        // Stable, so created_at order survives within each kind
        events.sort_by_key(|e| e.event_kind() != Some(EventKind::Subscription));

        let mut applied = 0;
        for event in &events {
            match self.ingest(event) {
                Ok(Ingested::Ignored) => {}
                Ok(_) => applied += 1,
                Err(e) => debug!("Skipping event {} during sync: {}", event.id, e),
            }
        }
        info!("Synced {} of {} subscription/payment events", applied, events.len());
        Ok(applied)
    }

    /// Follow subscriptions and payments live until [`stop`](Self::stop).
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        self.coordinator.start();
        let stream = self.coordinator.subscribe(self.subscriptions_filter()).await?;
        let (topics, router) = route_events(stream, TOPIC_BUFFER);
        let TopicStreams {
            observations,
            payments,
            subscriptions,
        } = topics;
        drop(observations);

        let mut tasks = self.tasks.lock();
        tasks.push(router);
        tasks.push(tokio::spawn(ingest_loop(self.clone(), subscriptions)));
        tasks.push(tokio::spawn(ingest_loop(self.clone(), payments)));
        info!("Provider {} listening for subscribers", self.public_key().short());
        Ok(())
    }

    /// Seal and publish the next observation of `stream` to every subscriber
    /// entitled to it.
    pub async fn publish_observation(
        &self,
        stream: &StreamIdentity,
        value: serde_json::Value,
    ) -> Result<PublishReport> {
        if !self.streams.read().contains_key(stream) {
            return Err(DatastreamError::InvalidIdentity(format!(
                "{} has not been announced",
                stream
            )));
        }

        let seq = self.access.next_sequence(stream);
        let observation = DatastreamObservation {
            stream_name: stream.name().to_string(),
            timestamp: crate::now_unix(),
            value,
            seq_num: seq,
        };

        let split = self.access.eligible_recipients(stream, seq);
        let mut report = PublishReport {
            seq,
            withheld: split.withheld,
            ..Default::default()
        };

        for recipient in split.eligible {
            let event = encode_observation(stream, &observation, &recipient, self.keys.as_ref())?;
            match self.coordinator.publish(&event).await {
                Ok(_) => report.delivered.push(recipient),
                Err(e) => {
                    warn!(
                        "Could not deliver {} seq {} to {}: {}",
                        stream,
                        seq,
                        recipient.short(),
                        e
                    );
                    report.failed.push((recipient, e.to_string()));
                }
            }
        }

        debug!(
            "{} seq {}: {} delivered, {} withheld, {} failed",
            stream,
            seq,
            report.delivered.len(),
            report.withheld.len(),
            report.failed.len()
        );
        Ok(report)
    }

    pub async fn stop(&self) {
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            task.abort();
        }
        self.coordinator.shutdown().await;
        info!("Provider {} stopped", self.public_key().short());
    }
}

async fn ingest_loop(provider: Arc<DatastreamProvider>, mut events: mpsc::Receiver<Event>) {
    while let Some(event) = events.recv().await {
        match provider.ingest(&event) {
            Ok(Ingested::Payment {
                payer,
                paid_through,
            }) => debug!("{} paid through {}", payer.short(), paid_through),
            Ok(_) => {}
            // Bad or unrecognized events never stop the loop
            Err(e) => debug!("Dropped event {}: {}", event.id, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CoordinatorConfig;
    use crate::crypto::EventSigner;
    use crate::event::{
        decode_observation, encode_payment, encode_subscription, PaymentNotice, SubscriptionNotice,
    };
    use crate::identity::LocalKeys;
    use crate::relay::{MemoryRelay, RelayTransport};
    use serde_json::json;

    struct Fixture {
        relay: MemoryRelay,
        provider: Arc<DatastreamProvider>,
        stream: StreamIdentity,
        subscriber: LocalKeys,
    }

    async fn fixture(price: u64) -> Fixture {
        let relay = MemoryRelay::new("memory://a");
        let coordinator = MultiRelayCoordinator::new(
            CoordinatorConfig::default(),
            vec![Arc::new(relay.clone()) as Arc<dyn RelayTransport>],
        )
        .unwrap();
        let keys = Arc::new(LocalKeys::generate());
        let provider = Arc::new(DatastreamProvider::new(
            keys,
            coordinator,
            Arc::new(SubscriberAccessController::new()),
        ));

        let stream = provider.stream("btc-usd").unwrap();
        let mut meta = DatastreamMetadata::new(stream.clone(), crate::now_unix());
        meta.price_per_obs = price;
        meta.cadence_seconds = Some(60);
        provider.announce(&meta).await.unwrap();

        Fixture {
            relay,
            provider,
            stream,
            subscriber: LocalKeys::generate(),
        }
    }

    fn subscribe_event(f: &Fixture, active: bool, at: u64) -> Event {
        let notice = SubscriptionNotice {
            subscriber: f.subscriber.public_key(),
            stream: f.stream.clone(),
            active,
            created_at: at,
        };
        encode_subscription(&notice, &f.subscriber).unwrap()
    }

    fn pay_event(f: &Fixture, seq: u64, amount: u64) -> Event {
        let notice = PaymentNotice {
            payer: f.subscriber.public_key(),
            stream: f.stream.clone(),
            seq_num: seq,
            amount_sats: amount,
            proof: None,
            created_at: crate::now_unix(),
        };
        encode_payment(&notice, &f.subscriber).unwrap()
    }

    #[tokio::test]
    async fn test_subscribers_survive_restart_from_config() {
        let dir = tempfile::tempdir().unwrap();
        let config = ClientConfig {
            subscription_db_path: Some(dir.path().join("subscribers")),
            ..ClientConfig::default()
        };
        let keys: Arc<dyn Keyring> = Arc::new(LocalKeys::generate());
        let subscriber = LocalKeys::generate();
        let coordinator = || {
            MultiRelayCoordinator::new(
                CoordinatorConfig::default(),
                vec![Arc::new(MemoryRelay::new("memory://a")) as Arc<dyn RelayTransport>],
            )
            .unwrap()
        };

        let stream = {
            let provider =
                DatastreamProvider::from_config(keys.clone(), coordinator(), &config).unwrap();
            let stream = provider.stream("btc-usd").unwrap();
            let notice = SubscriptionNotice {
                subscriber: subscriber.public_key(),
                stream: stream.clone(),
                active: true,
                created_at: 100,
            };
            provider.ingest(&encode_subscription(&notice, &subscriber).unwrap()).unwrap();
            assert_eq!(provider.access().next_sequence(&stream), 1);
            stream
        };

        let reopened = DatastreamProvider::from_config(keys, coordinator(), &config).unwrap();
        assert_eq!(reopened.access().subscribers(&stream).len(), 1);
        assert_eq!(reopened.access().latest_sequence(&stream), 1);
    }

    #[tokio::test]
    async fn test_announce_publishes_metadata() {
        let f = fixture(10).await;
        assert_eq!(f.relay.event_count(), 1);
        assert_eq!(f.provider.access().price_of(&f.stream), Some(10));
        assert_eq!(f.provider.streams().len(), 1);
    }

    #[tokio::test]
    async fn test_metered_delivery() {
        let f = fixture(10).await;
        let created = f.provider.ingest(&subscribe_event(&f, true, 100)).unwrap();
        assert!(matches!(created, Ingested::Subscription { created: true, .. }));

        let first = f.provider.publish_observation(&f.stream, json!(1)).await.unwrap();
        assert_eq!(first.seq, 1);
        assert_eq!(first.delivered, vec![f.subscriber.public_key()]);

        let second = f.provider.publish_observation(&f.stream, json!(2)).await.unwrap();
        assert_eq!(second.withheld, vec![f.subscriber.public_key()]);
        assert!(second.delivered.is_empty());

        f.provider.ingest(&pay_event(&f, 3, 10)).unwrap();
        let third = f.provider.publish_observation(&f.stream, json!(3)).await.unwrap();
        assert_eq!(third.delivered.len(), 1);

        // Only the sealed copies for seq 1 and 3 reached the relay
        let observations: Vec<Event> = f
            .relay
            .events()
            .into_iter()
            .filter(|e| e.kind == EventKind::Observation.as_u16())
            .collect();
        let mut seqs: Vec<u64> = observations
            .iter()
            .map(|e| decode_observation(e, &f.subscriber).unwrap().1.seq_num)
            .collect();
        seqs.sort_unstable();
        assert_eq!(seqs, vec![1, 3]);
    }

    #[tokio::test]
    async fn test_unrecognized_payment_is_an_error() {
        let f = fixture(10).await;
        assert!(matches!(
            f.provider.ingest(&pay_event(&f, 1, 10)),
            Err(DatastreamError::PaymentNotRecognized(_))
        ));
        assert_eq!(f.provider.access().audit_log().len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_stream_rejected() {
        let f = fixture(0).await;
        let other = f.provider.stream("eth-usd").unwrap();
        assert!(matches!(
            f.provider.publish_observation(&other, json!(1)).await,
            Err(DatastreamError::InvalidIdentity(_))
        ));
    }

    fn pay_event_at(f: &Fixture, seq: u64, at: u64) -> Event {
        let notice = PaymentNotice {
            payer: f.subscriber.public_key(),
            stream: f.stream.clone(),
            seq_num: seq,
            amount_sats: 10,
            proof: None,
            created_at: at,
        };
        encode_payment(&notice, &f.subscriber).unwrap()
    }

    #[tokio::test]
    async fn test_sync_applies_payment_older_than_resubscription() {
        let f = fixture(10).await;
        f.provider.publish_observation(&f.stream, json!(1)).await.unwrap();

        // The replaceable subscription event was re-published after paying
        let now = crate::now_unix();
        f.relay.inject(pay_event_at(&f, 2, now - 100));
        f.relay.inject(subscribe_event(&f, true, now));

        assert_eq!(f.provider.sync().await.unwrap(), 2);
        let record = f
            .provider
            .access()
            .subscriber(&f.stream, &f.subscriber.public_key())
            .unwrap();
        assert_eq!(record.last_paid_seq, 2);
        assert!(f.provider.access().is_eligible(&f.stream, &f.subscriber.public_key(), 2));
        assert!(f.provider.access().audit_log().is_empty());
    }

    #[tokio::test]
    async fn test_live_payment_ahead_of_subscription_is_kept() {
        let f = fixture(10).await;
        f.provider.publish_observation(&f.stream, json!(1)).await.unwrap();

        assert!(f.provider.ingest(&pay_event(&f, 2, 10)).is_err());
        assert_eq!(f.provider.access().pending_payments(), 1);

        f.provider.ingest(&subscribe_event(&f, true, 100)).unwrap();
        let record = f
            .provider
            .access()
            .subscriber(&f.stream, &f.subscriber.public_key())
            .unwrap();
        assert_eq!(record.last_paid_seq, 2);
        assert_eq!(f.provider.access().pending_payments(), 0);
    }

    #[tokio::test]
    async fn test_sync_and_live_ingest() {
        let f = fixture(10).await;
        f.relay.inject(subscribe_event(&f, true, 100));

        assert_eq!(f.provider.sync().await.unwrap(), 1);
        assert_eq!(f.provider.access().subscribers(&f.stream).len(), 1);

        f.provider.start().await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(30)).await;
        f.provider.publish_observation(&f.stream, json!(1)).await.unwrap();
        f.relay.inject(pay_event(&f, 2, 10));

        let mut paid = false;
        for _ in 0..50 {
            let record = f
                .provider
                .access()
                .subscriber(&f.stream, &f.subscriber.public_key())
                .unwrap();
            if record.last_paid_seq == 2 {
                paid = true;
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(paid);
        f.provider.stop().await;
    }
}
