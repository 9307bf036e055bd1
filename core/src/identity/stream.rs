// Stream identity — the (owner key, name) pair and its derived UUID
//
// The pair is the identity. Neither field is unique on its own: many owners
// can publish "btc-usd", and one owner can publish many streams. The UUID is
// a pure function of the pair and is recomputed on demand, never stored as
// the source of truth.

use crate::{DatastreamError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Length of a public key in bytes (64 hex chars on the wire)
pub const PUBLIC_KEY_LEN: usize = 32;

/// Longest accepted stream name, in bytes
pub const MAX_STREAM_NAME_LEN: usize = 256;

/// Namespace for stream UUIDv5 derivation.
/// Changing this re-keys every stream in the network.
pub const STREAM_NAMESPACE: Uuid = Uuid::NAMESPACE_URL;

/// A validated public key, stored as lowercase hex.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PublicKey(String);

impl PublicKey {
    /// Parse a hex-encoded public key
    pub fn from_hex(hex_key: &str) -> Result<Self> {
        if hex_key.len() != PUBLIC_KEY_LEN * 2 {
            return Err(DatastreamError::InvalidIdentity(format!(
                "public key must be {} hex chars, got {}",
                PUBLIC_KEY_LEN * 2,
                hex_key.len()
            )));
        }
        hex::decode(hex_key)
            .map_err(|e| DatastreamError::InvalidIdentity(format!("public key is not hex: {}", e)))?;
        Ok(Self(hex_key.to_ascii_lowercase()))
    }

    /// Build from raw key bytes
    pub fn from_bytes(bytes: &[u8; PUBLIC_KEY_LEN]) -> Self {
        Self(hex::encode(bytes))
    }

    /// Hex representation
    pub fn as_hex(&self) -> &str {
        &self.0
    }

    /// Raw key bytes
    pub fn to_bytes(&self) -> [u8; PUBLIC_KEY_LEN] {
        let mut out = [0u8; PUBLIC_KEY_LEN];
        // Validated at construction, so decoding cannot fail.
        if let Ok(bytes) = hex::decode(&self.0) {
            out.copy_from_slice(&bytes);
        }
        out
    }

    /// First eight hex chars, for logs
    pub fn short(&self) -> &str {
        &self.0[..8]
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for PublicKey {
    type Error = DatastreamError;

    fn try_from(value: String) -> Result<Self> {
        Self::from_hex(&value)
    }
}

impl From<PublicKey> for String {
    fn from(key: PublicKey) -> Self {
        key.0
    }
}

/// Canonical identity of a datastream.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StreamIdentity {
    owner: PublicKey,
    name: String,
}

impl StreamIdentity {
    /// Create an identity, validating the name
    pub fn new(owner: PublicKey, name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        validate_name(&name)?;
        Ok(Self { owner, name })
    }

    /// The provider key that owns this stream
    pub fn owner(&self) -> &PublicKey {
        &self.owner
    }

    /// Stream name, unique only within its owner
    pub fn name(&self) -> &str {
        &self.name
    }

    /// `owner:name`, the input to UUID derivation
    pub fn canonical(&self) -> String {
        format!("{}:{}", self.owner, self.name)
    }

    /// Deterministic UUIDv5 of this identity
    pub fn uuid(&self) -> Uuid {
        uuid_of(self)
    }
}

impl fmt::Display for StreamIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.owner.short())
    }
}

fn validate_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(DatastreamError::InvalidIdentity(
            "stream name is empty".to_string(),
        ));
    }
    if name.len() > MAX_STREAM_NAME_LEN {
        return Err(DatastreamError::InvalidIdentity(format!(
            "stream name is {} bytes (max {})",
            name.len(),
            MAX_STREAM_NAME_LEN
        )));
    }
    if name.chars().any(char::is_control) {
        return Err(DatastreamError::InvalidIdentity(
            "stream name contains control characters".to_string(),
        ));
    }
    Ok(())
}

/// Build a stream identity from a hex owner key and a name.
pub fn identity_of(owner_key: &str, name: &str) -> Result<StreamIdentity> {
    StreamIdentity::new(PublicKey::from_hex(owner_key)?, name)
}

/// UUIDv5 over the UTF-8 bytes of `owner:name`.
pub fn uuid_of(identity: &StreamIdentity) -> Uuid {
    Uuid::new_v5(&STREAM_NAMESPACE, identity.canonical().as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    const OWNER_A: &str = "a1a2a3a4a5a6a7a8a9aaabacadaeafb0b1b2b3b4b5b6b7b8b9babbbcbdbebfc0";
    const OWNER_B: &str = "0000000000000000000000000000000000000000000000000000000000000001";

    #[test]
    fn test_uuid_is_stable() {
        let id = identity_of(OWNER_A, "btc-usd").unwrap();
        assert_eq!(uuid_of(&id), uuid_of(&id));
        assert_eq!(
            uuid_of(&id),
            uuid_of(&identity_of(OWNER_A, "btc-usd").unwrap())
        );
        assert_eq!(id.uuid().get_version_num(), 5);
    }

    #[test]
    fn test_uuid_differs_by_owner_and_name() {
        let a = identity_of(OWNER_A, "btc-usd").unwrap();
        let b = identity_of(OWNER_B, "btc-usd").unwrap();
        let c = identity_of(OWNER_A, "eth-usd").unwrap();

        assert_ne!(a.uuid(), b.uuid());
        assert_ne!(a.uuid(), c.uuid());
    }

    #[test]
    fn test_uuid_matches_manual_derivation() {
        let id = identity_of(OWNER_A, "weather/nyc").unwrap();
        let expected = Uuid::new_v5(
            &Uuid::NAMESPACE_URL,
            format!("{}:weather/nyc", OWNER_A).as_bytes(),
        );
        assert_eq!(id.uuid(), expected);
    }

    #[test]
    fn test_uppercase_key_is_normalized() {
        let upper = identity_of(&OWNER_A.to_uppercase(), "s").unwrap();
        let lower = identity_of(OWNER_A, "s").unwrap();
        assert_eq!(upper, lower);
        assert_eq!(upper.uuid(), lower.uuid());
    }

    #[test]
    fn test_empty_name_rejected() {
        let result = identity_of(OWNER_A, "");
        assert!(matches!(result, Err(DatastreamError::InvalidIdentity(_))));

        let result = identity_of(OWNER_A, "   ");
        assert!(matches!(result, Err(DatastreamError::InvalidIdentity(_))));
    }

    #[test]
    fn test_malformed_key_rejected() {
        assert!(identity_of("abc", "s").is_err());
        assert!(identity_of(&"zz".repeat(32), "s").is_err());
    }

    #[test]
    fn test_oversized_name_rejected() {
        let name = "x".repeat(MAX_STREAM_NAME_LEN + 1);
        assert!(identity_of(OWNER_A, &name).is_err());
    }

    #[test]
    fn test_public_key_serde() {
        let key = PublicKey::from_hex(OWNER_A).unwrap();
        let json = serde_json::to_string(&key).unwrap();
        assert_eq!(json, format!("\"{}\"", OWNER_A));

        let bad: std::result::Result<PublicKey, _> = serde_json::from_str("\"nope\"");
        assert!(bad.is_err());
    }

    #[test]
    fn test_public_key_bytes() {
        let bytes = [7u8; PUBLIC_KEY_LEN];
        let key = PublicKey::from_bytes(&bytes);
        assert_eq!(key.to_bytes(), bytes);
        assert_eq!(key.short(), "07070707");
    }
}
