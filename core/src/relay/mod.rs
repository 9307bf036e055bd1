//! Relay layer — transports to individual relays and the coordinator that
//! turns a pool of unreliable relays into one dependable channel.

pub mod bootstrap;
pub mod coordinator;
pub mod dedup;
pub mod health;
pub mod memory;
pub mod transport;
pub mod websocket;

pub use bootstrap::{
    bootstrap_relay_urls, fetch_relay_information, verify_relay_identity, BootstrapError,
    FileRelayUrlCache, RelayIdentityStatus, RelayInformation, RelayUrlCache,
};
pub use coordinator::{CoordinatorStats, EventStream, MultiRelayCoordinator, PublishOutcome};
pub use dedup::DedupCache;
pub use health::{RelayRecord, RelayState, RelayStatus};
pub use memory::MemoryRelay;
pub use transport::{PublishAck, RelayTransport, TransportError};
pub use websocket::{RelayMessage, WebSocketRelay};

use crate::config::CoordinatorConfig;
use crate::Result;
use std::sync::Arc;

impl MultiRelayCoordinator {
    /// Coordinator over WebSocket relays at `urls`
    pub fn with_websocket_relays(config: CoordinatorConfig, urls: &[String]) -> Result<Self> {
        let timeout = config.operation_timeout();
        let transports: Vec<Arc<dyn RelayTransport>> = urls
            .iter()
            .map(|url| Arc::new(WebSocketRelay::with_timeout(url.clone(), timeout)) as Arc<dyn RelayTransport>)
            .collect();
        MultiRelayCoordinator::new(config, transports)
    }
}
