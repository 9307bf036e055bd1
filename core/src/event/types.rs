// Event types — the relay-level event shape and subscription filters

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Tag names shared by every protocol kind
pub const TAG_STREAM: &str = "stream";
pub const TAG_UUID: &str = "uuid";
pub const TAG_D: &str = "d";
pub const TAG_P: &str = "p";
pub const TAG_T: &str = "t";
pub const TAG_SEQ: &str = "seq";
pub const TAG_PRICE: &str = "price";
pub const TAG_CADENCE: &str = "cadence";
pub const TAG_STATUS: &str = "status";
pub const TAG_AMOUNT: &str = "amount";

/// The four protocol event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    /// Public stream metadata, replaceable per stream identity
    Announcement,
    /// Public declaration of interest, replaceable per (subscriber, stream)
    Subscription,
    /// One sealed data point, addressed to one subscriber
    Observation,
    /// Sealed payment notice, addressed to the provider
    Payment,
}

impl EventKind {
    pub const ALL: [EventKind; 4] = [
        EventKind::Announcement,
        EventKind::Subscription,
        EventKind::Observation,
        EventKind::Payment,
    ];

    /// Wire kind number
    pub fn as_u16(self) -> u16 {
        match self {
            EventKind::Announcement => 30100,
            EventKind::Subscription => 30101,
            EventKind::Observation => 4100,
            EventKind::Payment => 4101,
        }
    }

    pub fn from_u16(kind: u16) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_u16() == kind)
    }

    /// Whether relays keep only the latest version per `d` tag
    pub fn is_replaceable(self) -> bool {
        matches!(self, EventKind::Announcement | EventKind::Subscription)
    }

    /// Whether the content is sealed to a single `p` recipient
    pub fn is_encrypted(self) -> bool {
        matches!(self, EventKind::Observation | EventKind::Payment)
    }
}

/// Whether a raw kind number is addressable (30000..40000): relays retain
/// only the newest event per (kind, author, `d` tag).
pub fn is_addressable_kind(kind: u16) -> bool {
    (30000..40000).contains(&kind)
}

/// A signed relay event.
///
/// Fields are kept as received; nothing here is trusted until the codec has
/// checked id, signature and schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// Lowercase hex SHA-256 of the canonical serialization
    pub id: String,
    /// Author public key (hex)
    pub pubkey: String,
    /// Unix seconds, always plaintext
    pub created_at: u64,
    pub kind: u16,
    pub tags: Vec<Vec<String>>,
    /// Plaintext JSON or sealed ciphertext, depending on kind
    pub content: String,
    /// Hex signature over the id bytes
    pub sig: String,
}

impl Event {
    /// Canonical serialization: `[0, pubkey, created_at, kind, tags, content]`
    pub fn canonical_json(
        pubkey: &str,
        created_at: u64,
        kind: u16,
        tags: &[Vec<String>],
        content: &str,
    ) -> Result<String, serde_json::Error> {
        serde_json::to_string(&(0, pubkey, created_at, kind, tags, content))
    }

    /// Event id for the given fields
    pub fn compute_id(
        pubkey: &str,
        created_at: u64,
        kind: u16,
        tags: &[Vec<String>],
        content: &str,
    ) -> Result<String, serde_json::Error> {
        let serialized = Self::canonical_json(pubkey, created_at, kind, tags, content)?;
        Ok(hex::encode(Sha256::digest(serialized.as_bytes())))
    }

    /// Whether `id` matches the event's own fields
    pub fn has_valid_id(&self) -> bool {
        Self::compute_id(
            &self.pubkey,
            self.created_at,
            self.kind,
            &self.tags,
            &self.content,
        )
        .map(|id| id == self.id)
        .unwrap_or(false)
    }

    pub fn event_kind(&self) -> Option<EventKind> {
        EventKind::from_u16(self.kind)
    }

    /// First value of the first tag named `name`
    pub fn tag_value(&self, name: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|tag| tag.first().map(String::as_str) == Some(name))
            .and_then(|tag| tag.get(1))
            .map(String::as_str)
    }

    /// First values of every tag named `name`
    pub fn tag_values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.tags
            .iter()
            .filter(move |tag| tag.first().map(String::as_str) == Some(name))
            .filter_map(|tag| tag.get(1).map(String::as_str))
    }

    /// Stream name tag, present on every protocol event
    pub fn stream_name(&self) -> Option<&str> {
        self.tag_value(TAG_STREAM)
    }

    /// Key under which a relay retains only the newest version
    pub fn replaceable_key(&self) -> Option<(u16, String, String)> {
        if !is_addressable_kind(self.kind) {
            return None;
        }
        let d = self.tag_value(TAG_D).unwrap_or_default().to_string();
        Some((self.kind, self.pubkey.clone(), d))
    }
}

/// NIP-01 style subscription filter.
///
/// Tag constraints are keyed `#<name>` on the wire (`"#stream": ["btc-usd"]`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filter {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ids: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authors: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kinds: Option<Vec<u16>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub since: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub until: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
    #[serde(flatten)]
    pub tags: BTreeMap<String, Vec<String>>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn kind(mut self, kind: EventKind) -> Self {
        self.kinds.get_or_insert_with(Vec::new).push(kind.as_u16());
        self
    }

    pub fn author(mut self, author: &str) -> Self {
        self.authors
            .get_or_insert_with(Vec::new)
            .push(author.to_string());
        self
    }

    pub fn id(mut self, id: &str) -> Self {
        self.ids.get_or_insert_with(Vec::new).push(id.to_string());
        self
    }

    /// Require a tag value, e.g. `tag("stream", "btc-usd")`
    pub fn tag(mut self, name: &str, value: &str) -> Self {
        self.tags
            .entry(format!("#{}", name))
            .or_default()
            .push(value.to_string());
        self
    }

    pub fn since(mut self, since: u64) -> Self {
        self.since = Some(since);
        self
    }

    pub fn until(mut self, until: u64) -> Self {
        self.until = Some(until);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Check if an event matches every constraint of this filter
    pub fn matches(&self, event: &Event) -> bool {
        if let Some(ref ids) = self.ids {
            if !ids.iter().any(|id| event.id.starts_with(id.as_str())) {
                return false;
            }
        }

        if let Some(ref authors) = self.authors {
            if !authors
                .iter()
                .any(|author| event.pubkey.starts_with(author.as_str()))
            {
                return false;
            }
        }

        if let Some(ref kinds) = self.kinds {
            if !kinds.contains(&event.kind) {
                return false;
            }
        }

        if let Some(since) = self.since {
            if event.created_at < since {
                return false;
            }
        }

        if let Some(until) = self.until {
            if event.created_at > until {
                return false;
            }
        }

        self.tags.iter().all(|(key, wanted)| {
            let name = key.trim_start_matches('#');
            event
                .tag_values(name)
                .any(|value| wanted.iter().any(|w| w == value))
        })
    }
}

/// Newest first, ties broken by id
pub fn sort_events(events: &mut [Event]) {
    events.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));
}
