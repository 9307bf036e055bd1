// Stream health monitor — periodic liveness checks with edge-triggered alerts
//
// Each check uses the newest locally seen observation first and asks the
// relays only when that is missing or older than one check interval.
// Alerts go out on a broadcast channel, so a slow listener can lag but can
// never stall the check loop.

use super::health::{classify, StreamHealth};
use super::probe::ObservationProbe;
use crate::config::MonitorConfig;
use crate::event::DatastreamMetadata;
use crate::identity::StreamIdentity;
use crate::{DatastreamError, Result};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AlertKind {
    BecameStale,
    BecameDead,
    /// Revival from Stale or Dead
    BecameActive,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthAlert {
    pub stream: StreamIdentity,
    pub kind: AlertKind,
    pub from: StreamHealth,
    pub to: StreamHealth,
    pub last_observation_at: Option<u64>,
    pub at: u64,
}

/// Which transitions are worth telling anyone about.
///
/// Leaving Unknown for Active is just the first sighting of a healthy stream;
/// everything else that changes liveness is reported.
fn alert_kind(from: StreamHealth, to: StreamHealth) -> Option<AlertKind> {
    use StreamHealth::*;
    match (from, to) {
        (Unknown, Unknown) | (Active, Active) | (Stale, Stale) | (Dead, Dead) => None,
        (Unknown, Active) => None,
        (Stale | Dead, Active) => Some(AlertKind::BecameActive),
        (_, Stale) => Some(AlertKind::BecameStale),
        (_, Dead) => Some(AlertKind::BecameDead),
        (_, Unknown) => None,
    }
}

/// Current view of one monitored stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamStatus {
    pub stream: StreamIdentity,
    pub cadence_seconds: Option<u64>,
    pub health: StreamHealth,
    /// Newest observation timestamp known, local or remote
    pub last_observation_at: Option<u64>,
    /// Newest observation timestamp seen by this client itself
    pub local_observation_at: Option<u64>,
    pub last_check_at: Option<u64>,
    /// Checks in a row that found the stream Stale or Dead
    pub consecutive_stale_checks: u32,
}

impl StreamStatus {
    fn new(stream: StreamIdentity, cadence_seconds: Option<u64>) -> Self {
        Self {
            stream,
            cadence_seconds,
            health: StreamHealth::Unknown,
            last_observation_at: None,
            local_observation_at: None,
            last_check_at: None,
            consecutive_stale_checks: 0,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitorStats {
    pub checks_performed: u64,
    pub streams_monitored: usize,
    pub state_changes: u64,
    pub alerts_sent: u64,
    pub unknown_streams: usize,
    pub active_streams: usize,
    pub stale_streams: usize,
    pub dead_streams: usize,
}

struct MonitorInner {
    config: MonitorConfig,
    probe: Option<Arc<dyn ObservationProbe>>,
    streams: RwLock<HashMap<StreamIdentity, Arc<Mutex<StreamStatus>>>>,
    alerts: broadcast::Sender<HealthAlert>,
    checks_performed: AtomicU64,
    state_changes: AtomicU64,
    alerts_sent: AtomicU64,
    running: Mutex<Option<(watch::Sender<bool>, JoinHandle<()>)>>,
}

/// Watches a set of streams and reports liveness changes.
#[derive(Clone)]
pub struct StreamHealthMonitor {
    inner: Arc<MonitorInner>,
}

impl StreamHealthMonitor {
    /// `probe` answers for streams with no fresh local timestamp; without
    /// one, only locally recorded observations count.
    pub fn new(config: MonitorConfig, probe: Option<Arc<dyn ObservationProbe>>) -> Result<Self> {
        config.validate()?;
        let (alerts, _) = broadcast::channel(config.alert_capacity);
        Ok(Self {
            inner: Arc::new(MonitorInner {
                config,
                probe,
                streams: RwLock::new(HashMap::new()),
                alerts,
                checks_performed: AtomicU64::new(0),
                state_changes: AtomicU64::new(0),
                alerts_sent: AtomicU64::new(0),
                running: Mutex::new(None),
            }),
        })
    }

    /// Start watching a stream. Returns false if it was already watched.
    pub fn watch(&self, stream: StreamIdentity, cadence_seconds: Option<u64>) -> bool {
        let mut streams = self.inner.streams.write();
        if streams.contains_key(&stream) {
            return false;
        }
        debug!("Monitoring {} (cadence {:?})", stream, cadence_seconds);
        streams.insert(
            stream.clone(),
            Arc::new(Mutex::new(StreamStatus::new(stream, cadence_seconds))),
        );
        true
    }

    /// Watch an announced stream and run its first check right away.
    pub async fn add_stream(&self, meta: &DatastreamMetadata) -> Option<StreamHealth> {
        if !self.watch(meta.identity.clone(), meta.cadence_seconds) {
            return self.stream_status(&meta.identity).map(|s| s.health);
        }
        self.check_stream(&meta.identity, crate::now_unix()).await
    }

    pub fn remove_stream(&self, stream: &StreamIdentity) -> bool {
        self.inner.streams.write().remove(stream).is_some()
    }

    /// Note an observation this client received itself.
    ///
    /// A fresh arrival promotes the stream to Active right away instead of
    /// waiting for the next check; it never demotes.
    pub fn record_observation(&self, stream: &StreamIdentity, observed_at: u64) {
        self.note_observation(stream, observed_at, crate::now_unix());
    }

    fn note_observation(&self, stream: &StreamIdentity, observed_at: u64, now: u64) {
        let Some(status) = self.inner.streams.read().get(stream).cloned() else {
            return;
        };
        let alert = {
            let mut status = status.lock();
            if status.local_observation_at.map_or(true, |t| observed_at > t) {
                status.local_observation_at = Some(observed_at);
            }
            if status.last_observation_at.map_or(true, |t| observed_at > t) {
                status.last_observation_at = Some(observed_at);
            }

            let from = status.health;
            let to = classify(status.cadence_seconds, Some(observed_at), now.max(observed_at));
            if to != StreamHealth::Active || from == StreamHealth::Active {
                return;
            }
            status.health = to;
            status.consecutive_stale_checks = 0;
            self.inner.state_changes.fetch_add(1, Ordering::Relaxed);
            alert_kind(from, to).map(|kind| HealthAlert {
                stream: stream.clone(),
                kind,
                from,
                to,
                last_observation_at: status.last_observation_at,
                at: now,
            })
        };
        if let Some(alert) = alert {
            self.emit(alert);
        }
    }

    fn emit(&self, alert: HealthAlert) {
        info!("Stream {} {:?} -> {:?}", alert.stream, alert.from, alert.to);
        self.inner.alerts_sent.fetch_add(1, Ordering::Relaxed);
        // No receivers is fine
        let _ = self.inner.alerts.send(alert);
    }

    pub fn subscribe_alerts(&self) -> broadcast::Receiver<HealthAlert> {
        self.inner.alerts.subscribe()
    }

    /// Check one stream as of `now`. Returns its health, or None if it is
    /// not monitored.
    pub async fn check_stream(&self, stream: &StreamIdentity, now: u64) -> Option<StreamHealth> {
        self.check_one(stream, now).await.map(|(health, _)| health)
    }

    async fn check_one(
        &self,
        stream: &StreamIdentity,
        now: u64,
    ) -> Option<(StreamHealth, Option<HealthAlert>)> {
        let status = self.inner.streams.read().get(stream).cloned()?;
        let local = status.lock().local_observation_at;

        let interval = self.inner.config.check_interval_secs;
        let local_is_fresh = local.map_or(false, |t| now.saturating_sub(t) <= interval);
        let mut remote = None;
        if !local_is_fresh {
            if let Some(probe) = &self.inner.probe {
                match probe.latest_observation_at(stream).await {
                    Ok(found) => remote = found,
                    Err(e) => debug!("Remote check of {} failed: {}", stream, e),
                }
            }
        }

        let (to, alert) = {
            let mut status = status.lock();
            let newest = [status.last_observation_at, local, remote]
                .into_iter()
                .flatten()
                .max();
            status.last_observation_at = newest;
            status.last_check_at = Some(now);

            let from = status.health;
            let to = classify(status.cadence_seconds, newest, now);
            status.health = to;
            if matches!(to, StreamHealth::Stale | StreamHealth::Dead) {
                status.consecutive_stale_checks += 1;
            } else {
                status.consecutive_stale_checks = 0;
            }

            if from != to {
                self.inner.state_changes.fetch_add(1, Ordering::Relaxed);
            }
            let alert = alert_kind(from, to).map(|kind| HealthAlert {
                stream: stream.clone(),
                kind,
                from,
                to,
                last_observation_at: newest,
                at: now,
            });
            (to, alert)
        };
        self.inner.checks_performed.fetch_add(1, Ordering::Relaxed);

        if let Some(alert) = &alert {
            self.emit(alert.clone());
        }
        Some((to, alert))
    }

    /// Check every monitored stream as of `now`; returns the alerts raised.
    pub async fn check_at(&self, now: u64) -> Vec<HealthAlert> {
        let streams: Vec<StreamIdentity> = self.inner.streams.read().keys().cloned().collect();
        let mut raised = Vec::new();
        for stream in streams {
            if let Some((_, Some(alert))) = self.check_one(&stream, now).await {
                raised.push(alert);
            }
        }
        raised
    }

    pub async fn check_all(&self) -> Vec<HealthAlert> {
        self.check_at(crate::now_unix()).await
    }

    pub fn stream_status(&self, stream: &StreamIdentity) -> Option<StreamStatus> {
        let status = self.inner.streams.read().get(stream).cloned()?;
        let snapshot = status.lock().clone();
        Some(snapshot)
    }

    pub fn all_streams(&self) -> Vec<StreamStatus> {
        let streams: Vec<_> = self.inner.streams.read().values().cloned().collect();
        streams.iter().map(|s| s.lock().clone()).collect()
    }

    pub fn streams_by_health(&self, health: StreamHealth) -> Vec<StreamStatus> {
        self.all_streams()
            .into_iter()
            .filter(|s| s.health == health)
            .collect()
    }

    pub fn stats(&self) -> MonitorStats {
        let all = self.all_streams();
        let count = |health| all.iter().filter(|s| s.health == health).count();
        MonitorStats {
            checks_performed: self.inner.checks_performed.load(Ordering::Relaxed),
            streams_monitored: all.len(),
            state_changes: self.inner.state_changes.load(Ordering::Relaxed),
            alerts_sent: self.inner.alerts_sent.load(Ordering::Relaxed),
            unknown_streams: count(StreamHealth::Unknown),
            active_streams: count(StreamHealth::Active),
            stale_streams: count(StreamHealth::Stale),
            dead_streams: count(StreamHealth::Dead),
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.lock().is_some()
    }

    /// Run [`check_all`](Self::check_all) every `check_interval`.
    pub fn start(&self) -> Result<()> {
        let mut running = self.inner.running.lock();
        if running.is_some() {
            return Err(DatastreamError::Config(
                "health monitor already running".to_string(),
            ));
        }

        let (stop_tx, mut stop_rx) = watch::channel(false);
        let monitor = self.clone();
        let interval = self.inner.config.check_interval();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let alerts = monitor.check_all().await;
                        if !alerts.is_empty() {
                            debug!("Health check raised {} alerts", alerts.len());
                        }
                    }
                    _ = stop_rx.changed() => break,
                }
            }
            debug!("Health monitor loop stopped");
        });

        *running = Some((stop_tx, task));
        info!("Stream health monitor started (every {:?})", interval);
        Ok(())
    }

    pub async fn stop(&self) {
        let running = self.inner.running.lock().take();
        let Some((stop_tx, task)) = running else {
            return;
        };
        let _ = stop_tx.send(true);
        if tokio::time::timeout(self.inner.config.check_interval(), task)
            .await
            .is_err()
        {
            warn!("Health monitor loop did not stop in time");
        }
    }
}
