// Datastream Core — metered publish/subscribe over an open relay network
#![allow(clippy::empty_line_after_doc_comments)]
//
// Streams are announced in public, observations are sealed to each paying
// subscriber, and every byte travels through relays we do not control.
// Nothing in here may assume a relay is up, honest, or unique.

pub mod access;
pub mod client;
pub mod config;
pub mod crypto;
pub mod event;
pub mod identity;
pub mod monitor;
pub mod relay;

use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

pub use access::{SubscriberAccessController, SubscriberRecord, SubscriptionStore};
pub use client::{DatastreamProvider, DatastreamSubscriber};
pub use config::{ClientConfig, CoordinatorConfig, DedupConfig, MonitorConfig};
pub use crypto::{ContentCipher, EventSigner, Keyring};
pub use event::{
    DatastreamMetadata, DatastreamObservation, Event, EventKind, Filter, PaymentNotice,
    SubscriptionNotice,
};
pub use identity::{identity_of, uuid_of, LocalKeys, PublicKey, StreamIdentity};
pub use monitor::{HealthAlert, StreamHealth, StreamHealthMonitor};
pub use relay::{MultiRelayCoordinator, RelayState, RelayTransport};

// ============================================================================
// ERROR TYPES
// ============================================================================

/// Caller-visible failures of the protocol engine.
///
/// Per-relay failures never show up here directly: they are folded into relay
/// health and only surface as `NoHealthyRelays` once nothing is usable.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DatastreamError {
    #[error("Invalid identity: {0}")]
    InvalidIdentity(String),
    #[error("Malformed event: {0}")]
    MalformedEvent(String),
    #[error("Decryption failed: {0}")]
    DecryptionFailed(String),
    #[error("Relay unreachable: {0}")]
    RelayUnreachable(String),
    #[error("No healthy relays ({available} usable, {required} required)")]
    NoHealthyRelays { available: usize, required: usize },
    #[error("Every reachable relay rejected the event: {0}")]
    PublishRejected(String),
    #[error("Payment not recognized: {0}")]
    PaymentNotRecognized(String),
    #[error("Cryptography error: {0}")]
    Crypto(String),
    #[error("Storage error: {0}")]
    Storage(String),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Operation timed out: {0}")]
    Timeout(String),
    #[error("Client is shutting down")]
    ShuttingDown,
}

impl From<serde_json::Error> for DatastreamError {
    fn from(err: serde_json::Error) -> Self {
        DatastreamError::Serialization(err.to_string())
    }
}

impl From<crypto::CryptoError> for DatastreamError {
    fn from(err: crypto::CryptoError) -> Self {
        match err {
            crypto::CryptoError::Decryption(msg) => DatastreamError::DecryptionFailed(msg),
            other => DatastreamError::Crypto(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, DatastreamError>;

/// Current wall-clock time as unix seconds.
pub fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
