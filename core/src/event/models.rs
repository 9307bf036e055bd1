// Protocol entities carried inside events

use crate::identity::{PublicKey, StreamIdentity};
use crate::{DatastreamError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Current extensions schema version
pub const EXTENSIONS_VERSION: u32 = 1;

fn default_extensions_version() -> u32 {
    EXTENSIONS_VERSION
}

/// Open-ended stream metadata.
///
/// Only `version` and the well-known keys are interpreted; everything else
/// is kept as-is in `other` and written back out unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Extensions {
    #[serde(default = "default_extensions_version")]
    pub version: u32,
    /// Where the provider sources its data
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub license: Option<String>,
    /// Unit of the observed value ("USD", "celsius", ...)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    #[serde(flatten)]
    pub other: BTreeMap<String, serde_json::Value>,
}

impl Default for Extensions {
    fn default() -> Self {
        Self {
            version: EXTENSIONS_VERSION,
            source_url: None,
            license: None,
            unit: None,
            other: BTreeMap::new(),
        }
    }
}

impl Extensions {
    pub fn validate(&self) -> Result<()> {
        if self.version == 0 {
            return Err(DatastreamError::MalformedEvent(
                "extensions version must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Public description of a stream, as announced by its provider.
#[derive(Debug, Clone, PartialEq)]
pub struct DatastreamMetadata {
    pub identity: StreamIdentity,
    pub display_name: String,
    pub description: String,
    /// Whether observations are sealed per subscriber
    pub encrypted: bool,
    /// Sats per observation, 0 = free
    pub price_per_obs: u64,
    /// Expected seconds between observations; `None` = irregular
    pub cadence_seconds: Option<u64>,
    pub created_at: u64,
    pub tags: BTreeSet<String>,
    pub extensions: Extensions,
}

impl DatastreamMetadata {
    pub fn new(identity: StreamIdentity, created_at: u64) -> Self {
        Self {
            display_name: identity.name().to_string(),
            identity,
            description: String::new(),
            encrypted: true,
            price_per_obs: 0,
            cadence_seconds: None,
            created_at,
            tags: BTreeSet::new(),
            extensions: Extensions::default(),
        }
    }

    pub fn is_free(&self) -> bool {
        self.price_per_obs == 0
    }
}

/// One metered data point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatastreamObservation {
    pub stream_name: String,
    /// Unix seconds at which the value was observed
    pub timestamp: u64,
    pub value: serde_json::Value,
    /// Starts at 1, increases by one per observation
    pub seq_num: u64,
}

/// A subscriber's declared interest in a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionNotice {
    pub subscriber: PublicKey,
    pub stream: StreamIdentity,
    /// `false` once the subscriber has unsubscribed
    pub active: bool,
    pub created_at: u64,
}

/// A subscriber's claim to have paid for one observation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentNotice {
    pub payer: PublicKey,
    pub stream: StreamIdentity,
    pub seq_num: u64,
    pub amount_sats: u64,
    /// Opaque payment proof (invoice preimage, tx id)
    pub proof: Option<String>,
    pub created_at: u64,
}
