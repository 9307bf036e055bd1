// Configuration — coordinator, monitor and client settings
//
// Stored as JSON. Every field has a default, so a partial file (or `{}`)
// is a valid config. Durations are integer fields with accessor methods.

use crate::{DatastreamError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Deduplication window for inbound events
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    /// How long a seen event id is remembered. Must exceed the worst
    /// cross-relay propagation delay or late copies get through.
    pub retention_secs: u64,
    /// Hard cap on remembered ids; oldest are evicted first
    pub max_entries: usize,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            retention_secs: 600,
            max_entries: 50_000,
        }
    }
}

impl DedupConfig {
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }
}

/// Multi-relay coordination settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Publishing fails below this many usable relays
    pub min_active_relays: usize,
    /// Consecutive errors before a relay's circuit opens
    pub max_error_count: u32,
    /// Cooldown before an open circuit is retried
    pub reconnect_delay_ms: u64,
    /// Per-relay deadline for connect, publish and query
    pub operation_timeout_ms: u64,
    /// Relays that must answer before a query may finish early.
    /// `None` waits for all of them.
    pub query_quorum: Option<usize>,
    /// Extra time given to stragglers once the quorum has answered
    pub quorum_grace_ms: u64,
    /// Period of the background reconnect loop
    pub maintenance_interval_ms: u64,
    /// Upper bound on a graceful shutdown
    pub shutdown_timeout_ms: u64,
    pub dedup: DedupConfig,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            min_active_relays: 1,
            max_error_count: 5,
            reconnect_delay_ms: 30_000,
            operation_timeout_ms: 10_000,
            query_quorum: None,
            quorum_grace_ms: 500,
            maintenance_interval_ms: 10_000,
            shutdown_timeout_ms: 5_000,
            dedup: DedupConfig::default(),
        }
    }
}

impl CoordinatorConfig {
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }

    pub fn quorum_grace(&self) -> Duration {
        Duration::from_millis(self.quorum_grace_ms)
    }

    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_millis(self.maintenance_interval_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.min_active_relays == 0 {
            return Err(DatastreamError::Config(
                "min_active_relays must be at least 1".to_string(),
            ));
        }
        if self.max_error_count == 0 {
            return Err(DatastreamError::Config(
                "max_error_count must be at least 1".to_string(),
            ));
        }
        if self.operation_timeout_ms == 0 || self.maintenance_interval_ms == 0 {
            return Err(DatastreamError::Config(
                "timeouts and intervals must be positive".to_string(),
            ));
        }
        if self.query_quorum == Some(0) {
            return Err(DatastreamError::Config(
                "query_quorum must be at least 1".to_string(),
            ));
        }
        if self.dedup.retention_secs == 0 || self.dedup.max_entries == 0 {
            return Err(DatastreamError::Config(
                "dedup retention and capacity must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Stream health monitor settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Period of the health check loop; also how old a local timestamp may
    /// get before the relays are asked instead
    pub check_interval_secs: u64,
    /// Alerts buffered per receiver before slow receivers start lagging
    pub alert_capacity: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: 60,
            alert_capacity: 256,
        }
    }
}

impl MonitorConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }

    pub fn validate(&self) -> Result<()> {
        if self.check_interval_secs == 0 || self.alert_capacity == 0 {
            return Err(DatastreamError::Config(
                "check_interval_secs and alert_capacity must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Everything a provider or subscriber client needs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Relay URLs, in preference order
    pub relays: Vec<String>,
    /// JSON file of last-known-good relay URLs
    pub relay_cache_path: Option<PathBuf>,
    /// sled directory for subscriber records
    pub subscription_db_path: Option<PathBuf>,
    pub coordinator: CoordinatorConfig,
    pub monitor: MonitorConfig,
    /// Pay for the next observation as soon as one arrives
    pub auto_pay: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            relays: Vec::new(),
            relay_cache_path: None,
            subscription_db_path: None,
            coordinator: CoordinatorConfig::default(),
            monitor: MonitorConfig::default(),
            auto_pay: true,
        }
    }
}

impl ClientConfig {
    /// Load and validate a JSON config file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            DatastreamError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        let config: ClientConfig = serde_json::from_str(&contents).map_err(|e| {
            DatastreamError::Config(format!("failed to parse {}: {}", path.display(), e))
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| DatastreamError::Config(e.to_string()))?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents).map_err(|e| {
            DatastreamError::Config(format!("failed to write {}: {}", path.display(), e))
        })
    }

    pub fn validate(&self) -> Result<()> {
        for url in &self.relays {
            if !(url.starts_with("ws://") || url.starts_with("wss://")) {
                return Err(DatastreamError::Config(format!(
                    "relay URL must be ws:// or wss://: {}",
                    url
                )));
            }
        }
        self.coordinator.validate()?;
        self.monitor.validate()
    }
}
