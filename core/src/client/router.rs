// Event router — one deduplicated relay stream in, one ordered channel per topic out
//
// Order within a topic is arrival order. A topic nobody listens to is
// dropped without holding up the others.

use crate::event::{Event, EventKind};
use crate::relay::EventStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

/// Per-topic receivers produced by [`route_events`]
pub struct TopicStreams {
    pub observations: mpsc::Receiver<Event>,
    pub payments: mpsc::Receiver<Event>,
    pub subscriptions: mpsc::Receiver<Event>,
}

struct TopicSinks {
    observations: Option<mpsc::Sender<Event>>,
    payments: Option<mpsc::Sender<Event>>,
    subscriptions: Option<mpsc::Sender<Event>>,
}

impl TopicSinks {
    fn slot(&mut self, kind: EventKind) -> Option<&mut Option<mpsc::Sender<Event>>> {
        match kind {
            EventKind::Observation => Some(&mut self.observations),
            EventKind::Payment => Some(&mut self.payments),
            EventKind::Subscription => Some(&mut self.subscriptions),
            EventKind::Announcement => None,
        }
    }
}

/// Split `stream` by event kind. The task ends when the source ends or
/// every topic receiver has been dropped.
pub fn route_events(mut stream: EventStream, buffer: usize) -> (TopicStreams, JoinHandle<()>) {
    let (obs_tx, observations) = mpsc::channel(buffer);
    let (pay_tx, payments) = mpsc::channel(buffer);
    let (sub_tx, subscriptions) = mpsc::channel(buffer);

    // Clones only watch for receivers going away
    let watched = [obs_tx.clone(), pay_tx.clone(), sub_tx.clone()];
    let mut sinks = TopicSinks {
        observations: Some(obs_tx),
        payments: Some(pay_tx),
        subscriptions: Some(sub_tx),
    };

    let task = tokio::spawn(async move {
        let all_dropped = async move {
            for sink in &watched {
                sink.closed().await;
            }
        };
        tokio::pin!(all_dropped);

        loop {
            tokio::select! {
                next = stream.recv() => {
                    let Some(event) = next else { break };
                    let Some(kind) = event.event_kind() else {
                        debug!("Router dropping event {} of unknown kind {}", event.id, event.kind);
                        continue;
                    };
                    let Some(slot) = sinks.slot(kind) else {
                        continue;
                    };
                    if let Some(sink) = slot.as_mut() {
                        if sink.send(event).await.is_err() {
                            debug!("{:?} receiver dropped", kind);
                            *slot = None;
                        }
                    }
                }
                _ = &mut all_dropped => {
                    debug!("Every topic receiver dropped");
                    break;
                }
            }
        }
        stream.close();
    });

    (
        TopicStreams {
            observations,
            payments,
            subscriptions,
        },
        task,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CoordinatorConfig;
    use crate::event::Filter;
    use crate::relay::{MemoryRelay, MultiRelayCoordinator, RelayTransport};
    use std::sync::Arc;
    use std::time::Duration;

    fn event(kind: u16, n: u64) -> Event {
        let pubkey = "ab".repeat(32);
        let tags = vec![vec!["stream".to_string(), "s".to_string()]];
        let content = n.to_string();
        Event {
            id: Event::compute_id(&pubkey, n, kind, &tags, &content).unwrap(),
            pubkey,
            created_at: n,
            kind,
            tags,
            content,
            sig: String::new(),
        }
    }

    #[tokio::test]
    async fn test_routes_by_kind_in_order() {
        let relay = MemoryRelay::new("memory://a");
        for (kind, n) in [(4100, 1), (4101, 2), (30101, 3), (4100, 4), (30100, 5)] {
            relay.inject(event(kind, n));
        }
        let coordinator = MultiRelayCoordinator::new(
            CoordinatorConfig::default(),
            vec![Arc::new(relay) as Arc<dyn RelayTransport>],
        )
        .unwrap();

        let stream = coordinator.subscribe(Filter::new()).await.unwrap();
        let (mut topics, _task) = route_events(stream, 16);

        let wait = Duration::from_secs(1);
        let first = tokio::time::timeout(wait, topics.observations.recv()).await.unwrap().unwrap();
        let second = tokio::time::timeout(wait, topics.observations.recv()).await.unwrap().unwrap();
        assert_eq!((first.created_at, second.created_at), (1, 4));

        let payment = tokio::time::timeout(wait, topics.payments.recv()).await.unwrap().unwrap();
        assert_eq!(payment.kind, 4101);
        let subscription = tokio::time::timeout(wait, topics.subscriptions.recv()).await.unwrap().unwrap();
        assert_eq!(subscription.kind, 30101);
    }

    #[tokio::test]
    async fn test_dropped_topic_does_not_block_others() {
        let relay = MemoryRelay::new("memory://a");
        let coordinator = MultiRelayCoordinator::new(
            CoordinatorConfig::default(),
            vec![Arc::new(relay.clone()) as Arc<dyn RelayTransport>],
        )
        .unwrap();

        let stream = coordinator.subscribe(Filter::new()).await.unwrap();
        let (topics, task) = route_events(stream, 1);
        let TopicStreams {
            observations,
            mut payments,
            subscriptions,
        } = topics;
        drop(observations);
        drop(subscriptions);

        tokio::time::sleep(Duration::from_millis(20)).await;
        for n in 1..=5 {
            relay.inject(event(4100, n));
        }
        relay.inject(event(4101, 10));

        let payment = tokio::time::timeout(Duration::from_secs(1), payments.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(payment.created_at, 10);

        drop(payments);
        relay.inject(event(4101, 11));
        tokio::time::timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_router_stops_when_receivers_drop_without_traffic() {
        let relay = MemoryRelay::new("memory://a");
        let coordinator = MultiRelayCoordinator::new(
            CoordinatorConfig::default(),
            vec![Arc::new(relay.clone()) as Arc<dyn RelayTransport>],
        )
        .unwrap();

        let stream = coordinator.subscribe(Filter::new()).await.unwrap();
        let (topics, task) = route_events(stream, 4);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(coordinator.stats().active_subscriptions, 1);

        drop(topics);
        tokio::time::timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
        assert_eq!(coordinator.stats().active_subscriptions, 0);
    }
}
