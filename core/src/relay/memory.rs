// In-process relay — shared event store with NIP-01 semantics
//
// Clones share one store, so a provider and a subscriber holding clones of
// the same MemoryRelay see each other's events. Used for tests and for
// embedding, with fault injection to exercise the coordinator.

use super::transport::{PublishAck, RelayTransport, TransportError};
use crate::event::{sort_events, Event, Filter};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

/// Buffer per live subscription
const SUBSCRIPTION_BUFFER: usize = 1024;

#[derive(Default)]
struct RelayStore {
    events: HashMap<String, Event>,
    /// (kind, author, d) → id of the version currently held
    replaceable: HashMap<(u16, String, String), String>,
    listeners: Vec<(Filter, mpsc::Sender<Event>)>,
}

impl RelayStore {
    /// Store an event; returns the ack a real relay would send
    fn insert(&mut self, event: Event) -> PublishAck {
        if self.events.contains_key(&event.id) {
            return PublishAck {
                accepted: true,
                message: "duplicate: already have this event".to_string(),
            };
        }

        if let Some(key) = event.replaceable_key() {
            if let Some(held_id) = self.replaceable.get(&key) {
                let held_at = self
                    .events
                    .get(held_id)
                    .map(|e| e.created_at)
                    .unwrap_or_default();
                if event.created_at < held_at {
                    return PublishAck::rejected("duplicate: have a newer version");
                }
                let held_id = held_id.clone();
                self.events.remove(&held_id);
            }
            self.replaceable.insert(key, event.id.clone());
        }

        self.listeners.retain(|(filter, tx)| {
            if !filter.matches(&event) {
                return !tx.is_closed();
            }
            match tx.try_send(event.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    debug!("Memory relay listener full, dropping event {}", event.id);
                    true
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });

        self.events.insert(event.id.clone(), event);
        PublishAck::accepted()
    }

    fn matching(&self, filter: &Filter) -> Vec<Event> {
        let mut events: Vec<Event> = self
            .events
            .values()
            .filter(|e| filter.matches(e))
            .cloned()
            .collect();
        sort_events(&mut events);
        if let Some(limit) = filter.limit {
            events.truncate(limit);
        }
        events
    }
}

/// An in-process relay.
#[derive(Clone)]
pub struct MemoryRelay {
    url: String,
    store: Arc<Mutex<RelayStore>>,
    online: Arc<AtomicBool>,
    fail_next: Arc<AtomicU32>,
    latency_ms: Arc<AtomicU64>,
}

impl MemoryRelay {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            store: Arc::new(Mutex::new(RelayStore::default())),
            online: Arc::new(AtomicBool::new(true)),
            fail_next: Arc::new(AtomicU32::new(0)),
            latency_ms: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Take the relay down or bring it back. Going down drops every live
    /// subscription, as a real disconnect would.
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
        if !online {
            self.store.lock().listeners.clear();
        }
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Fail the next `n` operations with a send error
    pub fn fail_next(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Delay every operation by `latency`
    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    /// Store an event directly, bypassing faults
    pub fn inject(&self, event: Event) {
        self.store.lock().insert(event);
    }

    pub fn event_count(&self) -> usize {
        self.store.lock().events.len()
    }

    pub fn events(&self) -> Vec<Event> {
        self.store.lock().matching(&Filter::new())
    }

    /// Live subscriptions currently attached
    pub fn listener_count(&self) -> usize {
        self.store
            .lock()
            .listeners
            .iter()
            .filter(|(_, tx)| !tx.is_closed())
            .count()
    }

    async fn gate(&self) -> Result<(), TransportError> {
        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        if !self.is_online() {
            return Err(TransportError::ConnectFailed(format!("{} is offline", self.url)));
        }
        let injected = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if injected.is_ok() {
            return Err(TransportError::SendFailed(format!(
                "{}: injected failure",
                self.url
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl RelayTransport for MemoryRelay {
    fn url(&self) -> String {
        self.url.clone()
    }

    async fn connect(&self) -> Result<(), TransportError> {
        self.gate().await
    }

    async fn publish(&self, event: &Event) -> Result<PublishAck, TransportError> {
        self.gate().await?;
        if !event.has_valid_id() {
            return Ok(PublishAck::rejected("invalid: event id does not match"));
        }
        Ok(self.store.lock().insert(event.clone()))
    }

    async fn query(&self, filter: &Filter) -> Result<Vec<Event>, TransportError> {
        self.gate().await?;
        Ok(self.store.lock().matching(filter))
    }

    async fn subscribe(&self, filter: &Filter) -> Result<mpsc::Receiver<Event>, TransportError> {
        self.gate().await?;
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);

        let mut store = self.store.lock();
        let mut stored = store.matching(filter);
        // Stored events go out oldest first, like a relay replaying history
        stored.reverse();
        for event in stored {
            if tx.try_send(event).is_err() {
                break;
            }
        }
        store.listeners.push((filter.clone(), tx));
        Ok(rx)
    }

    async fn disconnect(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventKind;

    fn event(kind: u16, created_at: u64, d: Option<&str>) -> Event {
        let mut tags = vec![vec!["stream".to_string(), "s".to_string()]];
        if let Some(d) = d {
            tags.push(vec!["d".to_string(), d.to_string()]);
        }
        let pubkey = "ab".repeat(32);
        let content = format!("v{}", created_at);
        let id = Event::compute_id(&pubkey, created_at, kind, &tags, &content).unwrap();
        Event {
            id,
            pubkey,
            created_at,
            kind,
            tags,
            content,
            sig: String::new(),
        }
    }

    #[tokio::test]
    async fn test_publish_and_query() {
        let relay = MemoryRelay::new("memory://a");
        let e = event(4100, 10, None);

        assert!(relay.publish(&e).await.unwrap().accepted);
        let dup = relay.publish(&e).await.unwrap();
        assert!(dup.accepted);
        assert!(dup.message.starts_with("duplicate"));

        let found = relay
            .query(&Filter::new().kind(EventKind::Observation))
            .await
            .unwrap();
        assert_eq!(found, vec![e]);
    }

    #[tokio::test]
    async fn test_replaceable_keeps_newest() {
        let relay = MemoryRelay::new("memory://a");
        let v1 = event(30100, 10, Some("s"));
        let v2 = event(30100, 20, Some("s"));
        let v0 = event(30100, 5, Some("s"));

        relay.publish(&v1).await.unwrap();
        relay.publish(&v2).await.unwrap();
        assert!(!relay.publish(&v0).await.unwrap().accepted);

        assert_eq!(relay.events(), vec![v2]);
    }

    #[tokio::test]
    async fn test_invalid_id_rejected() {
        let relay = MemoryRelay::new("memory://a");
        let mut e = event(4100, 10, None);
        e.content = "tampered".to_string();
        assert!(!relay.publish(&e).await.unwrap().accepted);
        assert_eq!(relay.event_count(), 0);
    }

    #[tokio::test]
    async fn test_subscribe_replays_then_streams() {
        let relay = MemoryRelay::new("memory://a");
        let old = event(4100, 1, None);
        relay.publish(&old).await.unwrap();

        let mut rx = relay.subscribe(&Filter::new()).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), old);

        let new = event(4100, 2, None);
        relay.publish(&new).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), new);
    }

    #[tokio::test]
    async fn test_fault_injection() {
        let relay = MemoryRelay::new("memory://a");
        relay.fail_next(2);
        assert!(relay.connect().await.is_err());
        assert!(relay.connect().await.is_err());
        assert!(relay.connect().await.is_ok());

        let mut rx = relay.subscribe(&Filter::new()).await.unwrap();
        relay.set_online(false);
        assert!(rx.recv().await.is_none());
        assert!(matches!(
            relay.publish(&event(4100, 1, None)).await,
            Err(TransportError::ConnectFailed(_))
        ));

        relay.set_online(true);
        assert!(relay.publish(&event(4100, 1, None)).await.is_ok());
    }
}
