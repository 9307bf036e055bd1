// Remote liveness probe — newest observation timestamp for a stream
//
// Observation timestamps and stream tags are plaintext, so anyone can probe
// liveness without being able to read the values.

use crate::event::{EventKind, Filter};
use crate::identity::StreamIdentity;
use crate::relay::MultiRelayCoordinator;
use crate::Result;
use async_trait::async_trait;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ObservationProbe: Send + Sync {
    /// `created_at` of the newest observation any relay holds for `stream`
    async fn latest_observation_at(&self, stream: &StreamIdentity) -> Result<Option<u64>>;
}

pub fn latest_observation_filter(stream: &StreamIdentity) -> Filter {
    Filter::new()
        .kind(EventKind::Observation)
        .author(stream.owner().as_hex())
        .tag("stream", stream.name())
        .limit(1)
}

#[async_trait]
impl ObservationProbe for MultiRelayCoordinator {
    async fn latest_observation_at(&self, stream: &StreamIdentity) -> Result<Option<u64>> {
        let events = self.query(&latest_observation_filter(stream)).await?;
        // Relays are not trusted to have applied the filter
        Ok(events
            .iter()
            .filter(|e| e.pubkey == stream.owner().as_hex() && e.stream_name() == Some(stream.name()))
            .map(|e| e.created_at)
            .max())
    }
}
