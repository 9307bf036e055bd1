// Monitor module — stream liveness from observation timestamps

pub mod health;
pub mod probe;
pub mod tracker;

pub use health::{classify, StreamHealth};
pub use probe::{latest_observation_filter, ObservationProbe};
pub use tracker::{AlertKind, HealthAlert, MonitorStats, StreamHealthMonitor, StreamStatus};
