// Configuration management for the datastream CLI
//
// Cross-platform config stored in:
// - macOS: ~/Library/Application Support/datastream/config.json
// - Linux: ~/.config/datastream/config.json
// - Windows: %APPDATA%\datastream\config.json

use anyhow::{Context, Result};
use datastream_core::ClientConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Library settings, relays included
    pub client: ClientConfig,

    /// Where keys, the relay cache and subscriber records live
    pub data_path: Option<PathBuf>,
}

impl Config {
    /// Get the config directory path (cross-platform)
    pub fn config_dir() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to determine config directory")?
            .join("datastream");
        std::fs::create_dir_all(&config_dir).context("Failed to create config directory")?;
        Ok(config_dir)
    }

    /// Get the default data directory path (cross-platform)
    pub fn default_data_dir() -> Result<PathBuf> {
        let data_dir = dirs::data_local_dir()
            .context("Failed to determine data directory")?
            .join("datastream");
        Ok(data_dir)
    }

    pub fn config_file() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.json"))
    }

    /// Load config from the default location, creating it if missing
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_file()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            let config = Config::default();
            config.save_to(path)?;
            return Ok(config);
        }
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let config: Config = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        config
            .client
            .validate()
            .with_context(|| format!("Invalid configuration in {}", path.display()))?;
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_file()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create config directory")?;
        }
        let contents = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, contents).context("Failed to write config file")?;
        Ok(())
    }

    /// Data directory, created on first use
    pub fn data_dir(&self) -> Result<PathBuf> {
        let dir = match &self.data_path {
            Some(path) => path.clone(),
            None => Self::default_data_dir()?,
        };
        std::fs::create_dir_all(&dir).context("Failed to create data directory")?;
        Ok(dir)
    }

    pub fn keys_path(&self) -> Result<PathBuf> {
        Ok(self.data_dir()?.join("keys"))
    }

    pub fn relay_cache_path(&self) -> Result<PathBuf> {
        match &self.client.relay_cache_path {
            Some(path) => Ok(path.clone()),
            None => Ok(self.data_dir()?.join("relays.json")),
        }
    }

    /// Returns false if the relay was already listed
    pub fn add_relay(&mut self, url: &str) -> Result<bool> {
        if !(url.starts_with("ws://") || url.starts_with("wss://")) {
            anyhow::bail!("Relay URL must start with ws:// or wss://: {}", url);
        }
        if self.client.relays.iter().any(|r| r == url) {
            return Ok(false);
        }
        self.client.relays.push(url.to_string());
        Ok(true)
    }

    pub fn remove_relay(&mut self, url: &str) -> bool {
        let before = self.client.relays.len();
        self.client.relays.retain(|r| r != url);
        self.client.relays.len() != before
    }

    /// Set a config value. Invalid values leave the config unchanged.
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        let mut updated = self.clone();
        updated.apply(key, value)?;
        updated.client.validate().context("Rejected config value")?;
        *self = updated;
        Ok(())
    }

    fn apply(&mut self, key: &str, value: &str) -> Result<()> {
        let coordinator = &mut self.client.coordinator;
        match key {
            "min_active_relays" => {
                coordinator.min_active_relays = value.parse().context("Invalid number")?;
            }
            "max_error_count" => {
                coordinator.max_error_count = value.parse().context("Invalid number")?;
            }
            "reconnect_delay_ms" => {
                coordinator.reconnect_delay_ms = value.parse().context("Invalid number")?;
            }
            "operation_timeout_ms" => {
                coordinator.operation_timeout_ms = value.parse().context("Invalid number")?;
            }
            "query_quorum" => {
                coordinator.query_quorum = if value.is_empty() {
                    None
                } else {
                    Some(value.parse().context("Invalid number")?)
                };
            }
            "check_interval_secs" => {
                self.client.monitor.check_interval_secs =
                    value.parse().context("Invalid number")?;
            }
            "auto_pay" => {
                self.client.auto_pay = value.parse().context("Invalid boolean value")?;
            }
            "data_path" => {
                self.data_path = if value.is_empty() {
                    None
                } else {
                    Some(PathBuf::from(value))
                };
            }
            _ => anyhow::bail!("Unknown config key: {}", key),
        }
        Ok(())
    }

    /// Get a config value
    pub fn get(&self, key: &str) -> Option<String> {
        self.list()
            .into_iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
    }

    /// List all config values
    pub fn list(&self) -> Vec<(String, String)> {
        let coordinator = &self.client.coordinator;
        vec![
            ("relays".to_string(), self.client.relays.join(",")),
            ("min_active_relays".to_string(), coordinator.min_active_relays.to_string()),
            ("max_error_count".to_string(), coordinator.max_error_count.to_string()),
            ("reconnect_delay_ms".to_string(), coordinator.reconnect_delay_ms.to_string()),
            ("operation_timeout_ms".to_string(), coordinator.operation_timeout_ms.to_string()),
            (
                "query_quorum".to_string(),
                coordinator
                    .query_quorum
                    .map_or_else(|| "(all)".to_string(), |q| q.to_string()),
            ),
            (
                "check_interval_secs".to_string(),
                self.client.monitor.check_interval_secs.to_string(),
            ),
            ("auto_pay".to_string(), self.client.auto_pay.to_string()),
            (
                "data_path".to_string(),
                self.data_path
                    .as_ref()
                    .map_or_else(|| "(auto)".to_string(), |p| p.display().to_string()),
            ),
        ]
    }
}
