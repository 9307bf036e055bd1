//! Provider and subscriber clients built on the relay coordinator.

pub mod provider;
pub mod router;
pub mod subscriber;

pub use provider::{DatastreamProvider, Ingested, PublishReport};
pub use router::{route_events, TopicStreams};
pub use subscriber::{DatastreamSubscriber, ReceivedObservation, SubscriberStats, Subscription};
