// Relay transport — one connection to one relay

use crate::event::{Event, Filter};
use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

/// Per-relay failures. These feed the relay's health record and are never
/// shown to callers directly.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    ConnectFailed(String),
    #[error("Send failed: {0}")]
    SendFailed(String),
    #[error("Timed out: {0}")]
    Timeout(String),
    #[error("Connection closed")]
    Closed,
    #[error("Protocol error: {0}")]
    Protocol(String),
}

/// A relay's answer to a publish (NIP-01 `OK`)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishAck {
    pub accepted: bool,
    /// Empty on success; machine-readable prefix + reason on rejection
    pub message: String,
}

impl PublishAck {
    pub fn accepted() -> Self {
        Self {
            accepted: true,
            message: String::new(),
        }
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self {
            accepted: false,
            message: message.into(),
        }
    }
}

/// Wire capability for a single relay.
///
/// A rejection (`PublishAck { accepted: false }`) is an answer, not a
/// failure: the relay is reachable.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RelayTransport: Send + Sync {
    /// The relay's URL, used as its identity in the pool
    fn url(&self) -> String;

    async fn connect(&self) -> Result<(), TransportError>;

    async fn publish(&self, event: &Event) -> Result<PublishAck, TransportError>;

    /// Stored events matching `filter`, up to end-of-stored-events
    async fn query(&self, filter: &Filter) -> Result<Vec<Event>, TransportError>;

    /// Stored then live events matching `filter`. The relay side closes the
    /// channel when the connection drops; dropping the receiver unsubscribes.
    async fn subscribe(&self, filter: &Filter) -> Result<mpsc::Receiver<Event>, TransportError>;

    async fn disconnect(&self);
}
