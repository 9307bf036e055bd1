// Multi-relay coordinator — reliable publish/query over unreliable relays
//
// Every relay gets a health record (see health.rs). Publishes fan out to
// every usable relay; queries go to all of them concurrently and merge by
// event id; subscriptions run one feeder task per relay, all draining into a
// single deduplicated channel. Per-relay failures are absorbed into health
// state and only surface as NoHealthyRelays when nothing is usable.

use super::dedup::DedupCache;
use super::health::{RelayRecord, RelayState, RelayStatus};
use super::transport::RelayTransport;
use crate::config::CoordinatorConfig;
use crate::event::{sort_events, Event, Filter};
use crate::{DatastreamError, Result};
use futures::stream::{FuturesUnordered, StreamExt};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Buffer of the consumer-facing channel of a subscription
const STREAM_BUFFER: usize = 1024;

/// Floor for the pause between resubscribe attempts
const MIN_RESUBSCRIBE_DELAY: Duration = Duration::from_millis(10);

/// Result of a fan-out publish
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishOutcome {
    pub event_id: String,
    /// Relays that stored the event
    pub accepted: Vec<String>,
    /// (url, reason) for relays that answered but refused
    pub rejected: Vec<(String, String)>,
    /// (url, error) for relays that could not be reached
    pub failed: Vec<(String, String)>,
}

/// Counters plus a snapshot of relay health
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CoordinatorStats {
    pub events_received: u64,
    pub events_deduplicated: u64,
    pub relay_reconnects: u64,
    pub relay_failures: u64,
    pub publishes: u64,
    pub queries: u64,
    pub healthy_relays: usize,
    pub unhealthy_relays: usize,
    pub active_subscriptions: usize,
}

#[derive(Default)]
struct Counters {
    events_received: AtomicU64,
    events_deduplicated: AtomicU64,
    relay_reconnects: AtomicU64,
    relay_failures: AtomicU64,
    publishes: AtomicU64,
    queries: AtomicU64,
}

struct RelayEntry {
    url: String,
    transport: Arc<dyn RelayTransport>,
    record: Mutex<RelayRecord>,
    /// Flipped when the relay is removed from the pool
    retired: watch::Sender<bool>,
}

struct ActiveSubscription {
    filter: Filter,
    sink: mpsc::Sender<Event>,
    cancel: watch::Receiver<bool>,
}

struct Inner {
    config: CoordinatorConfig,
    /// Configuration order, which breaks best-relay ties
    relays: RwLock<Vec<Arc<RelayEntry>>>,
    dedup: Mutex<DedupCache>,
    counters: Counters,
    subscriptions: Mutex<HashMap<u64, ActiveSubscription>>,
    next_subscription_id: AtomicU64,
    shutdown_tx: watch::Sender<bool>,
    accepting: AtomicBool,
    in_flight: AtomicUsize,
    idle: Notify,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Marks a publish/query as in flight so shutdown can wait for it
struct InFlight<'a> {
    inner: &'a Inner,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if self.inner.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.inner.idle.notify_waiters();
        }
    }
}

impl Inner {
    fn begin(&self) -> Result<InFlight<'_>> {
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(DatastreamError::ShuttingDown);
        }
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        Ok(InFlight { inner: self })
    }

    fn snapshot(&self) -> Vec<Arc<RelayEntry>> {
        self.relays.read().clone()
    }

    /// Relays usable right now. Selection and the half-open transition
    /// happen under each relay's lock, so an open circuit is never handed
    /// out twice for one retry slot.
    fn select_targets(&self) -> Vec<Arc<RelayEntry>> {
        let now = Instant::now();
        self.snapshot()
            .into_iter()
            .filter(|relay| relay.record.lock().try_select(now))
            .collect()
    }

    fn record_success(&self, relay: &RelayEntry) {
        relay.record.lock().record_success(Instant::now());
    }

    fn record_failure(&self, relay: &RelayEntry, error: &str) {
        self.counters.relay_failures.fetch_add(1, Ordering::Relaxed);
        debug!("Relay {} error: {}", relay.url, error);
        relay.record.lock().record_failure(
            Instant::now(),
            self.config.max_error_count,
            self.config.reconnect_delay(),
        );
    }

    /// First sighting of a well-formed event id? Counts either way.
    fn accept_inbound(&self, event: &Event) -> bool {
        self.counters.events_received.fetch_add(1, Ordering::Relaxed);
        if !event.has_valid_id() {
            debug!("Dropping event with mismatched id {}", event.id);
            return false;
        }
        if !self.dedup.lock().insert(&event.id) {
            self.counters
                .events_deduplicated
                .fetch_add(1, Ordering::Relaxed);
            return false;
        }
        true
    }

    fn resubscribe_delay(&self) -> Duration {
        (self.config.reconnect_delay() / self.config.max_error_count.max(1))
            .max(MIN_RESUBSCRIBE_DELAY)
    }

    fn spawn(&self, task: JoinHandle<()>) {
        let mut tasks = self.tasks.lock();
        tasks.retain(|handle| !handle.is_finished());
        tasks.push(task);
    }

    fn spawn_feeder(self: &Arc<Self>, relay: Arc<RelayEntry>, subscription: &ActiveSubscription) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("No runtime to feed subscription from {}", relay.url);
            return;
        };
        let task = runtime.spawn(feed_from_relay(
            Arc::downgrade(self),
            relay,
            subscription.filter.clone(),
            subscription.sink.clone(),
            subscription.cancel.clone(),
            self.shutdown_tx.subscribe(),
        ));
        self.spawn(task);
    }
}

/// Sleep unless cancelled first. Returns false when the feeder should stop.
async fn pause(
    delay: Duration,
    cancel: &mut watch::Receiver<bool>,
    shutdown: &mut watch::Receiver<bool>,
    retired: &mut watch::Receiver<bool>,
) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(delay) => true,
        _ = cancel.changed() => false,
        _ = shutdown.changed() => false,
        _ = retired.changed() => false,
    }
}

/// One long-lived task per (relay, subscription): keeps a relay
/// subscription open, re-establishing it after failures, and forwards
/// first sightings into the shared sink.
async fn feed_from_relay(
    inner: Weak<Inner>,
    relay: Arc<RelayEntry>,
    filter: Filter,
    sink: mpsc::Sender<Event>,
    mut cancel: watch::Receiver<bool>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut retired = relay.retired.subscribe();

    loop {
        if *cancel.borrow() || *shutdown.borrow() || *retired.borrow() || sink.is_closed() {
            break;
        }
        let Some(coordinator) = inner.upgrade() else {
            break;
        };

        let now = Instant::now();
        let (selected, wait) = {
            let mut record = relay.record.lock();
            let selected = record.try_select(now);
            let wait = record
                .status(now)
                .retry_in_ms
                .map(Duration::from_millis)
                .unwrap_or_else(|| coordinator.resubscribe_delay());
            (selected, wait)
        };
        if !selected {
            drop(coordinator);
            if !pause(wait, &mut cancel, &mut shutdown, &mut retired).await {
                break;
            }
            continue;
        }

        let timeout = coordinator.config.operation_timeout();
        let subscribed = tokio::time::timeout(timeout, relay.transport.subscribe(&filter)).await;
        let mut rx = match subscribed {
            Ok(Ok(rx)) => {
                coordinator.record_success(&relay);
                debug!("Subscribed on {}", relay.url);
                rx
            }
            Ok(Err(e)) => {
                coordinator.record_failure(&relay, &e.to_string());
                let delay = coordinator.resubscribe_delay();
                drop(coordinator);
                if !pause(delay, &mut cancel, &mut shutdown, &mut retired).await {
                    break;
                }
                continue;
            }
            Err(_) => {
                coordinator.record_failure(&relay, "subscribe timed out");
                let delay = coordinator.resubscribe_delay();
                drop(coordinator);
                if !pause(delay, &mut cancel, &mut shutdown, &mut retired).await {
                    break;
                }
                continue;
            }
        };
        drop(coordinator);

        loop {
            tokio::select! {
                received = rx.recv() => match received {
                    Some(event) => {
                        let Some(coordinator) = inner.upgrade() else { return };
                        if !coordinator.accept_inbound(&event) {
                            continue;
                        }
                        drop(coordinator);
                        if sink.send(event).await.is_err() {
                            return;
                        }
                    }
                    None => {
                        if let Some(coordinator) = inner.upgrade() {
                            coordinator.record_failure(&relay, "subscription closed by relay");
                        }
                        break;
                    }
                },
                _ = cancel.changed() => return,
                _ = shutdown.changed() => return,
                _ = retired.changed() => return,
            }
        }

        let delay = match inner.upgrade() {
            Some(coordinator) => coordinator.resubscribe_delay(),
            None => break,
        };
        if !pause(delay, &mut cancel, &mut shutdown, &mut retired).await {
            break;
        }
    }
    debug!("Feeder for {} stopped", relay.url);
}

/// Deduplicated events from every relay, in arrival order.
///
/// Dropping (or [`close`](Self::close)-ing) the stream stops every relay
/// feeder behind it.
pub struct EventStream {
    id: u64,
    rx: mpsc::Receiver<Event>,
    cancel: watch::Sender<bool>,
    inner: Weak<Inner>,
}

impl EventStream {
    pub async fn recv(&mut self) -> Option<Event> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Event> {
        self.rx.try_recv().ok()
    }

    /// Stop feeding this stream. Events already buffered can still be read.
    pub fn close(&mut self) {
        let _ = self.cancel.send(true);
        if let Some(inner) = self.inner.upgrade() {
            inner.subscriptions.lock().remove(&self.id);
        }
    }
}

impl futures::Stream for EventStream {
    type Item = Event;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Event>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for EventStream {
    fn drop(&mut self) {
        self.close();
    }
}

/// The relay pool of one client.
#[derive(Clone)]
pub struct MultiRelayCoordinator {
    inner: Arc<Inner>,
}

impl MultiRelayCoordinator {
    pub fn new(config: CoordinatorConfig, relays: Vec<Arc<dyn RelayTransport>>) -> Result<Self> {
        config.validate()?;
        let (shutdown_tx, _) = watch::channel(false);
        let coordinator = Self {
            inner: Arc::new(Inner {
                dedup: Mutex::new(DedupCache::new(&config.dedup)),
                config,
                relays: RwLock::new(Vec::new()),
                counters: Counters::default(),
                subscriptions: Mutex::new(HashMap::new()),
                next_subscription_id: AtomicU64::new(1),
                shutdown_tx,
                accepting: AtomicBool::new(true),
                in_flight: AtomicUsize::new(0),
                idle: Notify::new(),
                tasks: Mutex::new(Vec::new()),
            }),
        };
        for relay in relays {
            coordinator.add_relay(relay);
        }
        Ok(coordinator)
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.inner.config
    }

    /// Add a relay to the pool. Returns false if its URL is already present.
    ///
    /// Open subscriptions start receiving from the new relay too.
    pub fn add_relay(&self, transport: Arc<dyn RelayTransport>) -> bool {
        let url = transport.url();
        // Held across the push so a concurrent subscribe sees either the new
        // relay in its snapshot or its own entry here, never neither.
        let subscriptions = self.inner.subscriptions.lock();
        let entry = {
            let mut relays = self.inner.relays.write();
            if relays.iter().any(|r| r.url == url) {
                return false;
            }
            let (retired, _) = watch::channel(false);
            let entry = Arc::new(RelayEntry {
                record: Mutex::new(RelayRecord::new(url.clone())),
                url: url.clone(),
                transport,
                retired,
            });
            relays.push(entry.clone());
            entry
        };

        for subscription in subscriptions.values() {
            self.inner.spawn_feeder(entry.clone(), subscription);
        }
        info!("Added relay {}", url);
        true
    }

    /// Remove a relay; its feeders stop and its connection is released.
    pub fn remove_relay(&self, url: &str) -> bool {
        let removed = {
            let mut relays = self.inner.relays.write();
            let index = relays.iter().position(|r| r.url == url);
            index.map(|i| relays.remove(i))
        };
        let Some(entry) = removed else {
            return false;
        };
        let _ = entry.retired.send(true);
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let transport = entry.transport.clone();
            runtime.spawn(async move { transport.disconnect().await });
        }
        info!("Removed relay {}", url);
        true
    }

    /// Connect to every relay concurrently. Returns how many succeeded.
    pub async fn connect(&self) -> Result<usize> {
        let _guard = self.inner.begin()?;
        let relays = self.inner.snapshot();
        let timeout = self.inner.config.operation_timeout();

        let results = futures::future::join_all(relays.iter().map(|relay| async move {
            let result = tokio::time::timeout(timeout, relay.transport.connect()).await;
            (relay, result)
        }))
        .await;

        let mut connected = 0;
        for (relay, result) in results {
            match result {
                Ok(Ok(())) => {
                    self.inner.record_success(relay);
                    connected += 1;
                }
                Ok(Err(e)) => self.inner.record_failure(relay, &e.to_string()),
                Err(_) => self.inner.record_failure(relay, "connect timed out"),
            }
        }

        let required = self.inner.config.min_active_relays;
        info!("Connected to {}/{} relays", connected, relays.len());
        if connected < required {
            return Err(DatastreamError::NoHealthyRelays {
                available: connected,
                required,
            });
        }
        Ok(connected)
    }

    /// Publish to every usable relay. Succeeds if at least one stores it.
    pub async fn publish(&self, event: &Event) -> Result<PublishOutcome> {
        let _guard = self.inner.begin()?;
        let targets = self.inner.select_targets();
        let required = self.inner.config.min_active_relays;
        if targets.len() < required {
            warn!(
                "Not publishing {}: {} usable relays, {} required",
                event.id,
                targets.len(),
                required
            );
            return Err(DatastreamError::NoHealthyRelays {
                available: targets.len(),
                required,
            });
        }
        self.inner.counters.publishes.fetch_add(1, Ordering::Relaxed);

        let timeout = self.inner.config.operation_timeout();
        let results = futures::future::join_all(targets.iter().map(|relay| async move {
            let result = tokio::time::timeout(timeout, relay.transport.publish(event)).await;
            (relay, result)
        }))
        .await;

        let mut outcome = PublishOutcome {
            event_id: event.id.clone(),
            ..Default::default()
        };
        for (relay, result) in results {
            match result {
                Ok(Ok(ack)) => {
                    self.inner.record_success(relay);
                    if ack.accepted {
                        outcome.accepted.push(relay.url.clone());
                    } else {
                        debug!("Relay {} rejected {}: {}", relay.url, event.id, ack.message);
                        outcome.rejected.push((relay.url.clone(), ack.message));
                    }
                }
                Ok(Err(e)) => {
                    self.inner.record_failure(relay, &e.to_string());
                    outcome.failed.push((relay.url.clone(), e.to_string()));
                }
                Err(_) => {
                    self.inner.record_failure(relay, "publish timed out");
                    outcome
                        .failed
                        .push((relay.url.clone(), "timed out".to_string()));
                }
            }
        }

        if !outcome.accepted.is_empty() {
            debug!(
                "Published {} to {}/{} relays",
                event.id,
                outcome.accepted.len(),
                targets.len()
            );
            return Ok(outcome);
        }
        if outcome.rejected.is_empty() {
            return Err(DatastreamError::NoHealthyRelays {
                available: 0,
                required,
            });
        }
        let reasons: Vec<String> = outcome
            .rejected
            .iter()
            .map(|(url, reason)| format!("{}: {}", url, reason))
            .collect();
        Err(DatastreamError::PublishRejected(reasons.join("; ")))
    }

    /// Query every usable relay and merge by event id (first copy wins).
    ///
    /// With a quorum configured, the query finishes `quorum_grace` after that
    /// many relays have answered; slower relays are dropped, not penalized.
    /// Results are newest first, truncated to the filter's limit.
    pub async fn query(&self, filter: &Filter) -> Result<Vec<Event>> {
        let _guard = self.inner.begin()?;
        let targets = self.inner.select_targets();
        if targets.is_empty() {
            return Err(DatastreamError::NoHealthyRelays {
                available: 0,
                required: 1,
            });
        }
        self.inner.counters.queries.fetch_add(1, Ordering::Relaxed);

        let config = &self.inner.config;
        let quorum = config
            .query_quorum
            .unwrap_or(targets.len())
            .clamp(1, targets.len());

        let mut outstanding: HashMap<String, Arc<RelayEntry>> = targets
            .iter()
            .map(|relay| (relay.url.clone(), relay.clone()))
            .collect();
        let mut pending: FuturesUnordered<_> = targets
            .into_iter()
            .map(|relay| {
                let filter = filter.clone();
                async move {
                    let result = relay.transport.query(&filter).await;
                    (relay, result)
                }
            })
            .collect();

        let hard_deadline = tokio::time::Instant::now() + config.operation_timeout();
        let mut deadline = hard_deadline;
        let mut answered = 0usize;
        let mut seen = HashSet::new();
        let mut merged = Vec::new();

        loop {
            tokio::select! {
                next = pending.next() => {
                    let Some((relay, result)) = next else { break };
                    outstanding.remove(&relay.url);
                    match result {
                        Ok(events) => {
                            self.inner.record_success(&relay);
                            answered += 1;
                            for event in events {
                                self.inner.counters.events_received.fetch_add(1, Ordering::Relaxed);
                                if !event.has_valid_id() {
                                    continue;
                                }
                                if seen.insert(event.id.clone()) {
                                    merged.push(event);
                                } else {
                                    self.inner.counters.events_deduplicated.fetch_add(1, Ordering::Relaxed);
                                }
                            }
                            if answered == quorum {
                                let grace = tokio::time::Instant::now() + config.quorum_grace();
                                deadline = deadline.min(grace);
                            }
                        }
                        Err(e) => self.inner.record_failure(&relay, &e.to_string()),
                    }
                }
                _ = tokio::time::sleep_until(deadline) => {
                    if deadline == hard_deadline {
                        for relay in outstanding.values() {
                            self.inner.record_failure(relay, "query timed out");
                        }
                    } else if !outstanding.is_empty() {
                        debug!("Quorum reached, not waiting for {} relays", outstanding.len());
                    }
                    break;
                }
            }
        }

        if answered == 0 {
            return Err(DatastreamError::NoHealthyRelays {
                available: 0,
                required: 1,
            });
        }

        sort_events(&mut merged);
        if let Some(limit) = filter.limit {
            merged.truncate(limit);
        }
        Ok(merged)
    }

    /// One-shot query against the best relay only, falling back to a full
    /// fan-out if that relay fails.
    pub async fn query_best(&self, filter: &Filter) -> Result<Vec<Event>> {
        let best = {
            let _guard = self.inner.begin()?;
            let Some(url) = self.best_relay() else {
                return Err(DatastreamError::NoHealthyRelays {
                    available: 0,
                    required: 1,
                });
            };
            let relay = self.inner.snapshot().into_iter().find(|r| r.url == url);
            match relay {
                Some(relay) => {
                    let timeout = self.inner.config.operation_timeout();
                    match tokio::time::timeout(timeout, relay.transport.query(filter)).await {
                        Ok(Ok(events)) => {
                            self.inner.record_success(&relay);
                            Some(events)
                        }
                        Ok(Err(e)) => {
                            self.inner.record_failure(&relay, &e.to_string());
                            None
                        }
                        Err(_) => {
                            self.inner.record_failure(&relay, "query timed out");
                            None
                        }
                    }
                }
                None => None,
            }
        };

        match best {
            Some(events) => {
                let mut events: Vec<Event> = events
                    .into_iter()
                    .filter(|e| e.has_valid_id())
                    .collect();
                sort_events(&mut events);
                if let Some(limit) = filter.limit {
                    events.truncate(limit);
                }
                Ok(events)
            }
            None => self.query(filter).await,
        }
    }

    /// Open a deduplicated live subscription across every relay.
    pub async fn subscribe(&self, filter: Filter) -> Result<EventStream> {
        let _guard = self.inner.begin()?;
        let now = Instant::now();
        let relays = self.inner.snapshot();
        if !relays.iter().any(|r| r.record.lock().is_eligible(now)) {
            return Err(DatastreamError::NoHealthyRelays {
                available: 0,
                required: 1,
            });
        }

        let (sink, rx) = mpsc::channel(STREAM_BUFFER);
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let id = self
            .inner
            .next_subscription_id
            .fetch_add(1, Ordering::Relaxed);
        let subscription = ActiveSubscription {
            filter,
            sink,
            cancel: cancel_rx,
        };

        {
            let mut subscriptions = self.inner.subscriptions.lock();
            for relay in self.inner.snapshot() {
                self.inner.spawn_feeder(relay, &subscription);
            }
            subscriptions.insert(id, subscription);
        }
        debug!("Opened subscription {}", id);

        Ok(EventStream {
            id,
            rx,
            cancel: cancel_tx,
            inner: Arc::downgrade(&self.inner),
        })
    }

    /// Among usable relays: most recent success, then fewest errors, then
    /// configuration order.
    pub fn best_relay(&self) -> Option<String> {
        let now = Instant::now();
        self.inner
            .snapshot()
            .iter()
            .enumerate()
            .filter_map(|(index, relay)| {
                let record = relay.record.lock();
                record
                    .is_eligible(now)
                    .then(|| (record.selection_key(), std::cmp::Reverse(index), relay.url.clone()))
            })
            .max_by(|a, b| (&a.0, &a.1).cmp(&(&b.0, &b.1)))
            .map(|(_, _, url)| url)
    }

    /// URLs of relays not in CircuitOpen
    pub fn healthy_relays(&self) -> Vec<String> {
        self.relays_where(|state| state != RelayState::CircuitOpen)
    }

    pub fn unhealthy_relays(&self) -> Vec<String> {
        self.relays_where(|state| state == RelayState::CircuitOpen)
    }

    fn relays_where(&self, keep: impl Fn(RelayState) -> bool) -> Vec<String> {
        self.inner
            .snapshot()
            .iter()
            .filter(|relay| keep(relay.record.lock().state))
            .map(|relay| relay.url.clone())
            .collect()
    }

    pub fn needs_more_relays(&self) -> bool {
        self.healthy_relays().len() < self.inner.config.min_active_relays
    }

    /// Open circuit whose cooldown has elapsed
    pub fn should_reconnect(&self, url: &str) -> bool {
        let now = Instant::now();
        self.inner
            .snapshot()
            .iter()
            .find(|relay| relay.url == url)
            .map(|relay| relay.record.lock().retry_due(now))
            .unwrap_or(false)
    }

    pub fn relay_status(&self, url: &str) -> Option<RelayStatus> {
        let now = Instant::now();
        self.inner
            .snapshot()
            .iter()
            .find(|relay| relay.url == url)
            .map(|relay| relay.record.lock().status(now))
    }

    pub fn all_relay_status(&self) -> Vec<RelayStatus> {
        let now = Instant::now();
        self.inner
            .snapshot()
            .iter()
            .map(|relay| relay.record.lock().status(now))
            .collect()
    }

    pub fn stats(&self) -> CoordinatorStats {
        let counters = &self.inner.counters;
        let healthy = self.healthy_relays().len();
        let total = self.inner.relays.read().len();
        let active_subscriptions = self.inner.subscriptions.lock().len();
        CoordinatorStats {
            events_received: counters.events_received.load(Ordering::Relaxed),
            events_deduplicated: counters.events_deduplicated.load(Ordering::Relaxed),
            relay_reconnects: counters.relay_reconnects.load(Ordering::Relaxed),
            relay_failures: counters.relay_failures.load(Ordering::Relaxed),
            publishes: counters.publishes.load(Ordering::Relaxed),
            queries: counters.queries.load(Ordering::Relaxed),
            healthy_relays: healthy,
            unhealthy_relays: total.saturating_sub(healthy),
            active_subscriptions,
        }
    }

    /// One maintenance pass: expire dedup entries and probe open circuits
    /// whose cooldown has passed. Returns how many relays came back.
    pub async fn maintain(&self) -> usize {
        self.inner.dedup.lock().evict_expired(Instant::now());

        let now = Instant::now();
        let due: Vec<Arc<RelayEntry>> = self
            .inner
            .snapshot()
            .into_iter()
            .filter(|relay| relay.record.lock().try_select(now))
            .filter(|relay| relay.record.lock().consecutive_errors > 0)
            .collect();

        let timeout = self.inner.config.operation_timeout();
        let mut recovered = 0;
        for relay in due {
            match tokio::time::timeout(timeout, relay.transport.connect()).await {
                Ok(Ok(())) => {
                    self.inner.record_success(&relay);
                    self.inner
                        .counters
                        .relay_reconnects
                        .fetch_add(1, Ordering::Relaxed);
                    info!("Reconnected to {}", relay.url);
                    recovered += 1;
                }
                Ok(Err(e)) => self.inner.record_failure(&relay, &e.to_string()),
                Err(_) => self.inner.record_failure(&relay, "reconnect timed out"),
            }
        }
        recovered
    }

    /// Run [`maintain`](Self::maintain) every `maintenance_interval` until shutdown.
    pub fn start(&self) {
        let coordinator = self.clone();
        let mut shutdown = self.inner.shutdown_tx.subscribe();
        let interval = self.inner.config.maintenance_interval();

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let recovered = coordinator.maintain().await;
                        if recovered > 0 {
                            debug!("Maintenance recovered {} relays", recovered);
                        }
                        if coordinator.needs_more_relays() {
                            warn!(
                                "Only {} healthy relays, {} required",
                                coordinator.healthy_relays().len(),
                                coordinator.inner.config.min_active_relays
                            );
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
            debug!("Relay maintenance loop stopped");
        });
        self.inner.spawn(task);
        info!("Relay maintenance started (every {:?})", interval);
    }

    pub fn is_shutting_down(&self) -> bool {
        !self.inner.accepting.load(Ordering::SeqCst)
    }

    /// Stop accepting work, let in-flight operations finish (bounded by
    /// `shutdown_timeout`), then stop every task and release connections.
    pub async fn shutdown(&self) {
        if !self.inner.accepting.swap(false, Ordering::SeqCst) {
            return;
        }
        let _ = self.inner.shutdown_tx.send(true);
        let limit = self.inner.config.shutdown_timeout();

        let drained = tokio::time::timeout(limit, async {
            loop {
                let notified = self.inner.idle.notified();
                if self.inner.in_flight.load(Ordering::SeqCst) == 0 {
                    break;
                }
                notified.await;
            }
        })
        .await;
        if drained.is_err() {
            warn!(
                "Shutdown timed out with {} operations in flight",
                self.inner.in_flight.load(Ordering::SeqCst)
            );
        }

        let tasks: Vec<JoinHandle<()>> = self.inner.tasks.lock().drain(..).collect();
        for task in &tasks {
            task.abort();
        }
        self.inner.subscriptions.lock().clear();

        let relays = self.inner.snapshot();
        let disconnects = futures::future::join_all(
            relays
                .iter()
                .map(|relay| tokio::time::timeout(limit, relay.transport.disconnect())),
        );
        let _ = tokio::time::timeout(limit, disconnects).await;
        info!("Relay coordinator stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::memory::MemoryRelay;
    use crate::relay::transport::{MockRelayTransport, PublishAck, TransportError};

    fn config() -> CoordinatorConfig {
        CoordinatorConfig {
            max_error_count: 2,
            reconnect_delay_ms: 100,
            operation_timeout_ms: 500,
            quorum_grace_ms: 50,
            ..Default::default()
        }
    }

    fn event(n: u64) -> Event {
        let pubkey = "ab".repeat(32);
        let tags = vec![vec!["stream".to_string(), "s".to_string()]];
        let content = format!("{}", n);
        Event {
            id: Event::compute_id(&pubkey, n, 4100, &tags, &content).unwrap(),
            pubkey,
            created_at: n,
            kind: 4100,
            tags,
            content,
            sig: String::new(),
        }
    }

    fn pool(relays: &[&MemoryRelay]) -> MultiRelayCoordinator {
        let transports: Vec<Arc<dyn RelayTransport>> = relays
            .iter()
            .map(|r| Arc::new((*r).clone()) as Arc<dyn RelayTransport>)
            .collect();
        MultiRelayCoordinator::new(config(), transports).unwrap()
    }

    #[tokio::test]
    async fn test_publish_fans_out() {
        let a = MemoryRelay::new("memory://a");
        let b = MemoryRelay::new("memory://b");
        let coordinator = pool(&[&a, &b]);

        let outcome = coordinator.publish(&event(1)).await.unwrap();
        assert_eq!(outcome.accepted.len(), 2);
        assert_eq!(a.event_count(), 1);
        assert_eq!(b.event_count(), 1);
    }

    #[tokio::test]
    async fn test_publish_succeeds_with_one_relay_down() {
        let a = MemoryRelay::new("memory://a");
        let b = MemoryRelay::new("memory://b");
        b.set_online(false);
        let coordinator = pool(&[&a, &b]);

        let outcome = coordinator.publish(&event(1)).await.unwrap();
        assert_eq!(outcome.accepted, vec!["memory://a".to_string()]);
        assert_eq!(outcome.failed.len(), 1);
        assert_eq!(
            coordinator.relay_status("memory://b").unwrap().state,
            RelayState::Degraded
        );
    }

    #[tokio::test]
    async fn test_circuit_excludes_relay_until_delay() {
        let a = MemoryRelay::new("memory://a");
        let b = MemoryRelay::new("memory://b");
        b.set_online(false);
        let coordinator = pool(&[&a, &b]);

        coordinator.publish(&event(1)).await.unwrap();
        coordinator.publish(&event(2)).await.unwrap();
        assert_eq!(coordinator.unhealthy_relays(), vec!["memory://b".to_string()]);

        b.set_online(true);
        let outcome = coordinator.publish(&event(3)).await.unwrap();
        assert_eq!(outcome.accepted, vec!["memory://a".to_string()]);
        assert!(outcome.failed.is_empty());
        assert_eq!(b.event_count(), 0);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(coordinator.should_reconnect("memory://b"));
        let outcome = coordinator.publish(&event(4)).await.unwrap();
        assert_eq!(outcome.accepted.len(), 2);
        assert_eq!(
            coordinator.relay_status("memory://b").unwrap().state,
            RelayState::Healthy
        );
    }

    #[tokio::test]
    async fn test_no_healthy_relays() {
        let a = MemoryRelay::new("memory://a");
        a.set_online(false);
        let coordinator = pool(&[&a]);

        assert!(matches!(
            coordinator.publish(&event(1)).await,
            Err(DatastreamError::NoHealthyRelays { .. })
        ));
        assert!(matches!(
            coordinator.publish(&event(2)).await,
            Err(DatastreamError::NoHealthyRelays { .. })
        ));
        // Circuit now open: nothing to fan out to
        assert!(matches!(
            coordinator.publish(&event(3)).await,
            Err(DatastreamError::NoHealthyRelays {
                available: 0,
                required: 1
            })
        ));
        assert!(coordinator.needs_more_relays());
    }

    #[tokio::test]
    async fn test_rejection_counts_as_reachable() {
        let mut mock = MockRelayTransport::new();
        mock.expect_url().return_const("mock://strict".to_string());
        mock.expect_publish()
            .returning(|_| Ok(PublishAck::rejected("blocked: not allowed")));

        let coordinator =
            MultiRelayCoordinator::new(config(), vec![Arc::new(mock) as Arc<dyn RelayTransport>])
                .unwrap();

        let result = coordinator.publish(&event(1)).await;
        assert!(matches!(result, Err(DatastreamError::PublishRejected(_))));
        assert_eq!(
            coordinator.relay_status("mock://strict").unwrap().state,
            RelayState::Healthy
        );
    }

    #[tokio::test]
    async fn test_transport_errors_open_circuit() {
        let mut mock = MockRelayTransport::new();
        mock.expect_url().return_const("mock://flaky".to_string());
        mock.expect_query()
            .times(2)
            .returning(|_| Err(TransportError::Timeout("slow".to_string())));

        let coordinator =
            MultiRelayCoordinator::new(config(), vec![Arc::new(mock) as Arc<dyn RelayTransport>])
                .unwrap();

        for _ in 0..2 {
            assert!(coordinator.query(&Filter::new()).await.is_err());
        }
        // Third call never reaches the transport
        assert!(matches!(
            coordinator.query(&Filter::new()).await,
            Err(DatastreamError::NoHealthyRelays { .. })
        ));
        assert_eq!(coordinator.stats().relay_failures, 2);
    }

    #[tokio::test]
    async fn test_query_merges_by_id() {
        let a = MemoryRelay::new("memory://a");
        let b = MemoryRelay::new("memory://b");
        a.inject(event(1));
        a.inject(event(2));
        b.inject(event(2));
        b.inject(event(3));
        let coordinator = pool(&[&a, &b]);

        let events = coordinator.query(&Filter::new()).await.unwrap();
        let times: Vec<u64> = events.iter().map(|e| e.created_at).collect();
        assert_eq!(times, vec![3, 2, 1]);
        assert_eq!(coordinator.stats().events_deduplicated, 1);

        let limited = coordinator.query(&Filter::new().limit(1)).await.unwrap();
        assert_eq!(limited.len(), 1);
    }

    #[tokio::test]
    async fn test_query_quorum_short_circuits() {
        let fast = MemoryRelay::new("memory://fast");
        let slow = MemoryRelay::new("memory://slow");
        fast.inject(event(1));
        slow.inject(event(2));
        slow.set_latency(Duration::from_millis(400));

        let transports: Vec<Arc<dyn RelayTransport>> =
            vec![Arc::new(fast.clone()), Arc::new(slow.clone())];
        let coordinator = MultiRelayCoordinator::new(
            CoordinatorConfig {
                query_quorum: Some(1),
                ..config()
            },
            transports,
        )
        .unwrap();

        let started = Instant::now();
        let events = coordinator.query(&Filter::new()).await.unwrap();
        assert!(started.elapsed() < Duration::from_millis(300));
        assert_eq!(events.len(), 1);
        // The slow relay was cut off, not penalized
        assert_eq!(
            coordinator.relay_status("memory://slow").unwrap().state,
            RelayState::Healthy
        );
    }

    #[tokio::test]
    async fn test_subscription_deduplicates_across_relays() {
        let a = MemoryRelay::new("memory://a");
        let b = MemoryRelay::new("memory://b");
        let coordinator = pool(&[&a, &b]);

        let mut stream = coordinator.subscribe(Filter::new()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        coordinator.publish(&event(1)).await.unwrap();
        coordinator.publish(&event(2)).await.unwrap();

        let first = tokio::time::timeout(Duration::from_secs(1), stream.recv())
            .await
            .unwrap()
            .unwrap();
        let second = tokio::time::timeout(Duration::from_secs(1), stream.recv())
            .await
            .unwrap()
            .unwrap();
        assert_ne!(first.id, second.id);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(stream.try_recv().is_none());
        assert_eq!(coordinator.stats().events_deduplicated, 2);
    }

    #[tokio::test]
    async fn test_subscription_survives_relay_restart() {
        let a = MemoryRelay::new("memory://a");
        let coordinator = pool(&[&a]);
        let mut stream = coordinator.subscribe(Filter::new()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        a.set_online(false);
        tokio::time::sleep(Duration::from_millis(20)).await;
        a.set_online(true);
        // Wait out the resubscribe pause (and a possible circuit cooldown)
        tokio::time::sleep(Duration::from_millis(250)).await;

        a.inject(event(7));
        let got = tokio::time::timeout(Duration::from_secs(1), stream.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.created_at, 7);
    }

    #[tokio::test]
    async fn test_best_relay_prefers_recent_success() {
        let a = MemoryRelay::new("memory://a");
        let b = MemoryRelay::new("memory://b");
        let coordinator = pool(&[&a, &b]);

        // No history: configuration order
        assert_eq!(coordinator.best_relay().as_deref(), Some("memory://a"));

        a.set_online(false);
        coordinator.publish(&event(1)).await.unwrap();
        assert_eq!(coordinator.best_relay().as_deref(), Some("memory://b"));

        b.inject(event(5));
        let events = coordinator.query_best(&Filter::new()).await.unwrap();
        assert_eq!(events.len(), 2);
    }

    #[tokio::test]
    async fn test_maintain_reconnects_open_circuits() {
        let a = MemoryRelay::new("memory://a");
        a.set_online(false);
        let coordinator = pool(&[&a]);
        assert!(coordinator.connect().await.is_err());
        assert!(coordinator.connect().await.is_err());
        assert_eq!(coordinator.unhealthy_relays().len(), 1);

        a.set_online(true);
        assert_eq!(coordinator.maintain().await, 0);
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(coordinator.maintain().await, 1);
        assert_eq!(coordinator.stats().relay_reconnects, 1);
        assert!(coordinator.unhealthy_relays().is_empty());
    }

    #[tokio::test]
    async fn test_add_and_remove_relay() {
        let a = MemoryRelay::new("memory://a");
        let coordinator = pool(&[&a]);
        let mut stream = coordinator.subscribe(Filter::new()).await.unwrap();

        let b = MemoryRelay::new("memory://b");
        assert!(coordinator.add_relay(Arc::new(b.clone())));
        assert!(!coordinator.add_relay(Arc::new(b.clone())));
        tokio::time::sleep(Duration::from_millis(30)).await;

        b.inject(event(9));
        let got = tokio::time::timeout(Duration::from_secs(1), stream.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.created_at, 9);

        assert!(coordinator.remove_relay("memory://b"));
        assert!(!coordinator.remove_relay("memory://b"));
        assert_eq!(coordinator.all_relay_status().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_relays_added_while_subscribing_feed_every_stream() {
        let a = MemoryRelay::new("memory://a");
        let coordinator = pool(&[&a]);
        let extra: Vec<MemoryRelay> = (0..8)
            .map(|i| MemoryRelay::new(format!("memory://extra-{}", i)))
            .collect();

        let adder = {
            let coordinator = coordinator.clone();
            let extra = extra.clone();
            tokio::spawn(async move {
                for relay in extra {
                    coordinator.add_relay(Arc::new(relay));
                    tokio::task::yield_now().await;
                }
            })
        };
        let mut streams = Vec::new();
        for _ in 0..8 {
            streams.push(coordinator.subscribe(Filter::new()).await.unwrap());
            tokio::task::yield_now().await;
        }
        adder.await.unwrap();

        let mut attached = false;
        for _ in 0..100 {
            if extra.iter().all(|r| r.listener_count() == streams.len()) {
                attached = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(attached);
        assert_eq!(a.listener_count(), streams.len());
    }

    #[tokio::test]
    async fn test_shutdown_refuses_new_work() {
        let a = MemoryRelay::new("memory://a");
        let coordinator = pool(&[&a]);
        coordinator.start();
        let mut stream = coordinator.subscribe(Filter::new()).await.unwrap();

        let started = Instant::now();
        coordinator.shutdown().await;
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(coordinator.is_shutting_down());

        assert!(matches!(
            coordinator.publish(&event(1)).await,
            Err(DatastreamError::ShuttingDown)
        ));
        let end = tokio::time::timeout(Duration::from_secs(1), stream.recv()).await;
        assert!(matches!(end, Ok(None)));
    }
}
