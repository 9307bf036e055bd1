//! Relay bootstrap — where the relay list comes from, and who runs each relay
//!
//! The configured list wins. When it is empty (no directory reachable) the
//! last-known-good list from the local cache is used instead. NIP-11
//! information documents let a client check a relay's operator key.

use crate::identity::PublicKey;
use crate::DatastreamError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

const INFO_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("Relay cache error: {0}")]
    Cache(String),
    #[error("Failed to fetch relay information: {0}")]
    Fetch(String),
    #[error("Invalid relay information document: {0}")]
    InvalidDocument(String),
}

impl From<BootstrapError> for DatastreamError {
    fn from(err: BootstrapError) -> Self {
        match err {
            BootstrapError::Cache(msg) => DatastreamError::Storage(msg),
            BootstrapError::Fetch(msg) => DatastreamError::RelayUnreachable(msg),
            BootstrapError::InvalidDocument(msg) => DatastreamError::MalformedEvent(msg),
        }
    }
}

// ============================================================================
// RELAY URL CACHE
// ============================================================================

/// Local store of last-known-good relay URLs
pub trait RelayUrlCache: Send + Sync {
    fn load_cached_relay_urls(&self) -> Result<Vec<String>, BootstrapError>;
    fn store_relay_urls(&self, urls: &[String]) -> Result<(), BootstrapError>;
}

#[derive(Debug, Serialize, Deserialize)]
struct CachedRelays {
    relays: Vec<String>,
    updated_at: u64,
}

/// JSON file cache
#[derive(Debug, Clone)]
pub struct FileRelayUrlCache {
    path: PathBuf,
}

impl FileRelayUrlCache {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl RelayUrlCache for FileRelayUrlCache {
    fn load_cached_relay_urls(&self) -> Result<Vec<String>, BootstrapError> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let contents = std::fs::read_to_string(&self.path)
            .map_err(|e| BootstrapError::Cache(format!("{}: {}", self.path.display(), e)))?;
        let cached: CachedRelays = serde_json::from_str(&contents)
            .map_err(|e| BootstrapError::Cache(format!("{}: {}", self.path.display(), e)))?;
        Ok(cached.relays)
    }

    fn store_relay_urls(&self, urls: &[String]) -> Result<(), BootstrapError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| BootstrapError::Cache(e.to_string()))?;
        }
        let cached = CachedRelays {
            relays: urls.to_vec(),
            updated_at: crate::now_unix(),
        };
        let contents = serde_json::to_string_pretty(&cached)
            .map_err(|e| BootstrapError::Cache(e.to_string()))?;
        std::fs::write(&self.path, contents).map_err(|e| BootstrapError::Cache(e.to_string()))
    }
}

/// Pick the relay list to start with.
///
/// Non-empty `configured` is used as-is and refreshes the cache. Otherwise
/// the cache is consulted; a broken cache is logged and treated as empty.
pub fn bootstrap_relay_urls(configured: &[String], cache: Option<&dyn RelayUrlCache>) -> Vec<String> {
    let mut urls: Vec<String> = Vec::new();
    for url in configured {
        if !urls.contains(url) {
            urls.push(url.clone());
        }
    }

    if !urls.is_empty() {
        if let Some(cache) = cache {
            if let Err(e) = cache.store_relay_urls(&urls) {
                warn!("Could not refresh relay cache: {}", e);
            }
        }
        return urls;
    }

    let Some(cache) = cache else {
        return urls;
    };
    match cache.load_cached_relay_urls() {
        Ok(cached) => {
            info!("No relays configured, using {} cached relays", cached.len());
            cached
        }
        Err(e) => {
            warn!("No relays configured and cache unreadable: {}", e);
            Vec::new()
        }
    }
}

// ============================================================================
// RELAY IDENTITY (NIP-11)
// ============================================================================

/// A relay's information document
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayInformation {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    /// Contact key of the admin
    #[serde(default)]
    pub pubkey: Option<String>,
    /// The relay's own key
    #[serde(default, rename = "self")]
    pub self_key: Option<String>,
    #[serde(default)]
    pub supported_nips: Vec<u32>,
    #[serde(default)]
    pub software: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayIdentityStatus {
    Verified,
    Unverified(String),
}

impl RelayIdentityStatus {
    pub fn is_verified(&self) -> bool {
        matches!(self, RelayIdentityStatus::Verified)
    }
}

/// Is the relay's `self` key the operator's signing key?
pub fn verify_relay_identity(info: &RelayInformation, operator: &PublicKey) -> RelayIdentityStatus {
    let Some(claimed) = info.self_key.as_deref() else {
        return RelayIdentityStatus::Unverified("document has no self key".to_string());
    };
    match PublicKey::from_hex(claimed) {
        Ok(key) if &key == operator => RelayIdentityStatus::Verified,
        Ok(key) => RelayIdentityStatus::Unverified(format!(
            "relay key is {}, expected {}",
            key.short(),
            operator.short()
        )),
        Err(_) => RelayIdentityStatus::Unverified(format!("malformed pubkey {}", claimed)),
    }
}

/// ws://host → http://host, wss://host → https://host
pub fn information_url(relay_url: &str) -> String {
    if let Some(rest) = relay_url.strip_prefix("wss://") {
        format!("https://{}", rest)
    } else if let Some(rest) = relay_url.strip_prefix("ws://") {
        format!("http://{}", rest)
    } else {
        relay_url.to_string()
    }
}

pub fn parse_relay_information(body: &str) -> Result<RelayInformation, BootstrapError> {
    let value: serde_json::Value =
        serde_json::from_str(body).map_err(|e| BootstrapError::InvalidDocument(e.to_string()))?;
    // Every field is optional, so only the shape tells a document from noise
    if !value.is_object() {
        return Err(BootstrapError::InvalidDocument(
            "expected a JSON object".to_string(),
        ));
    }
    serde_json::from_value(value).map_err(|e| BootstrapError::InvalidDocument(e.to_string()))
}

/// Fetch a relay's NIP-11 document. The HTTP call runs on a blocking worker.
pub async fn fetch_relay_information(relay_url: &str) -> Result<RelayInformation, BootstrapError> {
    let url = information_url(relay_url);
    debug!("Fetching relay information from {}", url);

    let body = tokio::task::spawn_blocking(move || {
        ureq::get(&url)
            .set("Accept", "application/nostr+json")
            .timeout(INFO_TIMEOUT)
            .call()
            .map_err(|e| BootstrapError::Fetch(format!("{}: {}", url, e)))?
            .into_string()
            .map_err(|e| BootstrapError::Fetch(format!("{}: {}", url, e)))
    })
    .await
    .map_err(|e| BootstrapError::Fetch(e.to_string()))??;

    parse_relay_information(&body)
}
