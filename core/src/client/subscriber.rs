// Datastream subscriber — discovery, subscriptions and metered receipt
//
// Everything arriving from the relays has already been deduplicated by the
// coordinator. Observations for streams we are not (or no longer) subscribed
// to are dropped here, after decryption proves they were meant for us.

use crate::config::ClientConfig;
use crate::crypto::Keyring;
use crate::event::{
    decode_announcement, decode_observation, encode_payment, encode_subscription,
    DatastreamMetadata, DatastreamObservation, Event, EventKind, Filter, PaymentNotice,
    SubscriptionNotice,
};
use crate::identity::{PublicKey, StreamIdentity};
use crate::monitor::{
    classify, AlertKind, HealthAlert, MonitorStats, ObservationProbe, StreamHealth,
    StreamHealthMonitor,
};
use crate::relay::{CoordinatorStats, MultiRelayCoordinator, PublishOutcome, RelayStatus};
use crate::{DatastreamError, Result};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Observations buffered for the application before delivery blocks
const OBSERVATION_BUFFER: usize = 1024;

/// An observation as handed to the application
#[derive(Debug, Clone, PartialEq)]
pub struct ReceivedObservation {
    pub stream: StreamIdentity,
    pub observation: DatastreamObservation,
    pub event_id: String,
    pub received_at: u64,
}

/// Subscriber-side record of one stream.
#[derive(Debug, Clone, PartialEq)]
pub struct Subscription {
    pub metadata: DatastreamMetadata,
    pub subscribed_at: u64,
    /// Set on unsubscribe; the record is kept
    pub unsubscribed_at: Option<u64>,
    /// When the monitor last reported the stream stale or dead, until it revives
    pub stale_since: Option<u64>,
    /// Highest sequence number received
    pub last_seq: u64,
    /// Highest sequence number we have sent a payment for
    pub paid_through: u64,
    pub received: u64,
}

impl Subscription {
    fn new(metadata: DatastreamMetadata, subscribed_at: u64) -> Self {
        Self {
            metadata,
            subscribed_at,
            unsubscribed_at: None,
            stale_since: None,
            last_seq: 0,
            paid_through: 0,
            received: 0,
        }
    }

    pub fn is_active(&self) -> bool {
        self.unsubscribed_at.is_none()
    }

    pub fn stream(&self) -> &StreamIdentity {
        &self.metadata.identity
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriberStats {
    pub subscriptions: usize,
    pub active_subscriptions: usize,
    pub stale_subscriptions: usize,
    pub observations_received: u64,
    /// Undecryptable, malformed, or for streams we are not subscribed to
    pub observations_dropped: u64,
    pub payments_sent: u64,
    pub payment_failures: u64,
    pub coordinator: CoordinatorStats,
    pub monitor: MonitorStats,
}

#[derive(Default)]
struct Counters {
    observations_received: AtomicU64,
    observations_dropped: AtomicU64,
    payments_sent: AtomicU64,
    payment_failures: AtomicU64,
}

pub struct DatastreamSubscriber {
    keys: Arc<dyn Keyring>,
    coordinator: MultiRelayCoordinator,
    monitor: StreamHealthMonitor,
    auto_pay: bool,
    subscriptions: RwLock<HashMap<StreamIdentity, Subscription>>,
    observations_tx: mpsc::Sender<ReceivedObservation>,
    observations_rx: Mutex<Option<mpsc::Receiver<ReceivedObservation>>>,
    counters: Counters,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl DatastreamSubscriber {
    pub fn new(
        keys: Arc<dyn Keyring>,
        coordinator: MultiRelayCoordinator,
        monitor: StreamHealthMonitor,
        auto_pay: bool,
    ) -> Self {
        let (observations_tx, observations_rx) = mpsc::channel(OBSERVATION_BUFFER);
        Self {
            keys,
            coordinator,
            monitor,
            auto_pay,
            subscriptions: RwLock::new(HashMap::new()),
            observations_tx,
            observations_rx: Mutex::new(Some(observations_rx)),
            counters: Counters::default(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Subscriber whose health monitor probes through `coordinator`.
    pub fn from_config(
        keys: Arc<dyn Keyring>,
        coordinator: MultiRelayCoordinator,
        config: &ClientConfig,
    ) -> Result<Self> {
        let probe: Arc<dyn ObservationProbe> = Arc::new(coordinator.clone());
        let monitor = StreamHealthMonitor::new(config.monitor.clone(), Some(probe))?;
        Ok(Self::new(keys, coordinator, monitor, config.auto_pay))
    }

    pub fn public_key(&self) -> PublicKey {
        self.keys.public_key()
    }

    pub fn coordinator(&self) -> &MultiRelayCoordinator {
        &self.coordinator
    }

    pub fn monitor(&self) -> &StreamHealthMonitor {
        &self.monitor
    }

    /// The application's observation channel. Can be taken once.
    pub fn observations(&self) -> Option<mpsc::Receiver<ReceivedObservation>> {
        self.observations_rx.lock().take()
    }

    pub fn subscribe_alerts(&self) -> broadcast::Receiver<HealthAlert> {
        self.monitor.subscribe_alerts()
    }

    pub fn subscription(&self, stream: &StreamIdentity) -> Option<Subscription> {
        self.subscriptions.read().get(stream).cloned()
    }

    pub fn subscriptions(&self) -> Vec<Subscription> {
        self.subscriptions.read().values().cloned().collect()
    }

    pub fn stream_health(&self, stream: &StreamIdentity) -> Option<StreamHealth> {
        self.monitor.stream_status(stream).map(|s| s.health)
    }

    pub fn relay_status(&self) -> Vec<RelayStatus> {
        self.coordinator.all_relay_status()
    }

    // ========================================================================
    // DISCOVERY
    // ========================================================================

    /// Newest announcement of `stream` any relay holds
    pub async fn fetch_announcement(&self, stream: &StreamIdentity) -> Result<DatastreamMetadata> {
        let filter = Filter::new()
            .kind(EventKind::Announcement)
            .author(stream.owner().as_hex())
            .tag("d", stream.name());
        let events = self.coordinator.query(&filter).await?;

        events
            .iter()
            .filter_map(|e| decode_announcement(e, self.keys.as_ref()).ok())
            .filter(|meta| &meta.identity == stream)
            .max_by_key(|meta| meta.created_at)
            .ok_or_else(|| {
                DatastreamError::InvalidIdentity(format!(
                    "{} is not announced on any reachable relay",
                    stream
                ))
            })
    }

    /// Announced streams carrying any of `tags` (all streams when empty),
    /// newest announcement per stream, newest first. With `active_only`,
    /// only streams whose latest observation is within cadence survive.
    pub async fn discover(&self, tags: &[String], active_only: bool) -> Result<Vec<DatastreamMetadata>> {
        let mut filter = Filter::new().kind(EventKind::Announcement);
        for tag in tags {
            filter = filter.tag("t", tag);
        }
        let events = self.coordinator.query(&filter).await?;

        let mut newest: HashMap<Uuid, DatastreamMetadata> = HashMap::new();
        for event in &events {
            let meta = match decode_announcement(event, self.keys.as_ref()) {
                Ok(meta) => meta,
                Err(e) => {
                    debug!("Skipping announcement {}: {}", event.id, e);
                    continue;
                }
            };
            let uuid = meta.identity.uuid();
            match newest.get(&uuid) {
                Some(held) if held.created_at >= meta.created_at => {}
                _ => {
                    newest.insert(uuid, meta);
                }
            }
        }

        let mut found: Vec<DatastreamMetadata> = newest.into_values().collect();
        if active_only {
            let now = crate::now_unix();
            let mut live = Vec::with_capacity(found.len());
            for meta in found {
                let last = match self.coordinator.latest_observation_at(&meta.identity).await {
                    Ok(last) => last,
                    Err(e) => {
                        debug!("No liveness for {}: {}", meta.identity, e);
                        None
                    }
                };
                if classify(meta.cadence_seconds, last, now) == StreamHealth::Active {
                    live.push(meta);
                }
            }
            found = live;
        }

        found.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| a.identity.cmp(&b.identity))
        });
        info!("Discovered {} streams", found.len());
        Ok(found)
    }

    // ========================================================================
    // SUBSCRIPTIONS
    // ========================================================================

    /// Announce interest in `stream` and start watching its health.
    pub async fn subscribe(&self, stream: &StreamIdentity) -> Result<DatastreamMetadata> {
        let meta = self.fetch_announcement(stream).await?;

        let now = crate::now_unix();
        let created_at = match self.subscription(stream) {
            Some(existing) => now.max(existing.subscribed_at),
            None => now,
        };
        let notice = SubscriptionNotice {
            subscriber: self.public_key(),
            stream: stream.clone(),
            active: true,
            created_at,
        };
        let event = encode_subscription(&notice, self.keys.as_ref())?;
        self.coordinator.publish(&event).await?;

        {
            let mut subscriptions = self.subscriptions.write();
            let entry = subscriptions
                .entry(stream.clone())
                .or_insert_with(|| Subscription::new(meta.clone(), created_at));
            entry.metadata = meta.clone();
            if entry.unsubscribed_at.take().is_some() {
                entry.subscribed_at = created_at;
            }
        }

        self.monitor.add_stream(&meta).await;
        info!(
            "Subscribed to {} ({} sats/obs)",
            stream, meta.price_per_obs
        );
        Ok(meta)
    }

    /// Withdraw from `stream`. The local record is kept, marked unsubscribed.
    pub async fn unsubscribe(&self, stream: &StreamIdentity) -> Result<()> {
        let Some(existing) = self.subscription(stream) else {
            return Err(DatastreamError::InvalidIdentity(format!(
                "not subscribed to {}",
                stream
            )));
        };

        let now = crate::now_unix().max(existing.subscribed_at);
        let notice = SubscriptionNotice {
            subscriber: self.public_key(),
            stream: stream.clone(),
            active: false,
            created_at: now,
        };
        let event = encode_subscription(&notice, self.keys.as_ref())?;
        self.coordinator.publish(&event).await?;

        if let Some(sub) = self.subscriptions.write().get_mut(stream) {
            sub.unsubscribed_at = Some(now);
        }
        self.monitor.remove_stream(stream);
        info!("Unsubscribed from {}", stream);
        Ok(())
    }

    /// Pay for observation `seq` of a subscribed stream at its announced price.
    pub async fn pay(&self, stream: &StreamIdentity, seq: u64) -> Result<PublishOutcome> {
        let Some(sub) = self.subscription(stream) else {
            return Err(DatastreamError::InvalidIdentity(format!(
                "not subscribed to {}",
                stream
            )));
        };

        let notice = PaymentNotice {
            payer: self.public_key(),
            stream: stream.clone(),
            seq_num: seq,
            amount_sats: sub.metadata.price_per_obs,
            proof: None,
            created_at: crate::now_unix(),
        };
        let event = encode_payment(&notice, self.keys.as_ref())?;
        match self.coordinator.publish(&event).await {
            Ok(outcome) => {
                self.counters.payments_sent.fetch_add(1, Ordering::Relaxed);
                if let Some(sub) = self.subscriptions.write().get_mut(stream) {
                    sub.paid_through = sub.paid_through.max(seq);
                }
                debug!("Paid {} sats for {} seq {}", notice.amount_sats, stream, seq);
                Ok(outcome)
            }
            Err(e) => {
                self.counters.payment_failures.fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
        }
    }

    // ========================================================================
    // RECEIPT
    // ========================================================================

    /// Decrypt one inbound observation event and deliver it.
    ///
    /// Returns `Ok(None)` when the stream is not one we subscribe to.
    pub async fn ingest(&self, event: &Event) -> Result<Option<ReceivedObservation>> {
        let (stream, observation) = match decode_observation(event, self.keys.as_ref()) {
            Ok(decoded) => decoded,
            Err(e) => {
                self.counters
                    .observations_dropped
                    .fetch_add(1, Ordering::Relaxed);
                return Err(e);
            }
        };

        let price = {
            let mut subscriptions = self.subscriptions.write();
            match subscriptions.get_mut(&stream) {
                Some(sub) if sub.is_active() => {
                    sub.last_seq = sub.last_seq.max(observation.seq_num);
                    sub.received += 1;
                    let due = self.auto_pay
                        && sub.metadata.price_per_obs > 0
                        && sub.paid_through <= observation.seq_num;
                    due.then_some(sub.metadata.price_per_obs)
                }
                _ => {
                    self.counters
                        .observations_dropped
                        .fetch_add(1, Ordering::Relaxed);
                    debug!("Ignoring observation for {}: not subscribed", stream);
                    return Ok(None);
                }
            }
        };
        self.counters
            .observations_received
            .fetch_add(1, Ordering::Relaxed);
        self.monitor.record_observation(&stream, observation.timestamp);

        if let Some(price) = price {
            let next = observation.seq_num + 1;
            if let Err(e) = self.pay(&stream, next).await {
                warn!("Auto-pay of {} sats for {} seq {} failed: {}", price, stream, next, e);
            }
        }

        let received = ReceivedObservation {
            stream,
            observation,
            event_id: event.id.clone(),
            received_at: crate::now_unix(),
        };
        if self.observations_tx.try_send(received.clone()).is_err() {
            warn!("Observation channel full or closed, dropping {}", received.event_id);
        }
        Ok(Some(received))
    }

    /// Track stale/dead periods from a health alert
    pub fn apply_alert(&self, alert: &HealthAlert) {
        let mut subscriptions = self.subscriptions.write();
        let Some(sub) = subscriptions.get_mut(&alert.stream) else {
            return;
        };
        match alert.kind {
            AlertKind::BecameStale | AlertKind::BecameDead => {
                sub.stale_since.get_or_insert(alert.at);
            }
            AlertKind::BecameActive => sub.stale_since = None,
        }
    }

    // ========================================================================
    // LIFECYCLE
    // ========================================================================

    /// Connect, follow our observations live, and start health checks.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let connected = self.coordinator.connect().await?;
        self.coordinator.start();

        let filter = Filter::new()
            .kind(EventKind::Observation)
            .tag("p", self.public_key().as_hex());
        let mut stream = self.coordinator.subscribe(filter).await?;
        let subscriber = self.clone();
        let receiver = tokio::spawn(async move {
            while let Some(event) = stream.recv().await {
                if let Err(e) = subscriber.ingest(&event).await {
                    debug!("Dropped observation {}: {}", event.id, e);
                }
            }
        });

        let mut alerts = self.monitor.subscribe_alerts();
        let subscriber = self.clone();
        let alert_listener = tokio::spawn(async move {
            loop {
                match alerts.recv().await {
                    Ok(alert) => subscriber.apply_alert(&alert),
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!("Alert listener lagged, missed {} alerts", missed);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        self.tasks.lock().extend([receiver, alert_listener]);
        if !self.monitor.is_running() {
            self.monitor.start()?;
        }
        info!("Subscriber {} started on {} relays", self.public_key().short(), connected);
        Ok(())
    }

    pub fn stats(&self) -> SubscriberStats {
        let subscriptions = self.subscriptions.read();
        SubscriberStats {
            subscriptions: subscriptions.len(),
            active_subscriptions: subscriptions.values().filter(|s| s.is_active()).count(),
            stale_subscriptions: subscriptions
                .values()
                .filter(|s| s.is_active() && s.stale_since.is_some())
                .count(),
            observations_received: self.counters.observations_received.load(Ordering::Relaxed),
            observations_dropped: self.counters.observations_dropped.load(Ordering::Relaxed),
            payments_sent: self.counters.payments_sent.load(Ordering::Relaxed),
            payment_failures: self.counters.payment_failures.load(Ordering::Relaxed),
            coordinator: self.coordinator.stats(),
            monitor: self.monitor.stats(),
        }
    }

    pub async fn stop(&self) {
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            task.abort();
        }
        self.monitor.stop().await;
        self.coordinator.shutdown().await;
        info!("Subscriber {} stopped", self.public_key().short());
    }
}
