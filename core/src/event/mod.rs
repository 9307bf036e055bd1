// Event module — wire shape, protocol entities and the codec between them

pub mod codec;
pub mod models;
pub mod types;

pub use codec::{
    decode_announcement, decode_event, decode_observation, decode_payment, decode_subscription,
    encode_announcement, encode_observation, encode_payment, encode_subscription, verify_event,
    DecodedEvent,
};
pub use models::{
    DatastreamMetadata, DatastreamObservation, Extensions, PaymentNotice, SubscriptionNotice,
};
pub use types::{sort_events, Event, EventKind, Filter};
