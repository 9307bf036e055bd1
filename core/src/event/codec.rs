// Event codec — typed protocol entities to and from signed relay events
//
// Stream, uuid and sequence tags are always written in the clear, even when
// the content is sealed, so any observer can check liveness without keys.
// Decoding never trusts the kind number alone: id, signature, tags and the
// content schema all have to agree before a typed value comes out.

use super::models::{
    DatastreamMetadata, DatastreamObservation, Extensions, PaymentNotice, SubscriptionNotice,
};
use super::types::*;
use crate::crypto::{EventSigner, Keyring};
use crate::identity::{PublicKey, StreamIdentity};
use crate::{DatastreamError, Result};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::BTreeSet;

/// Maximum content size accepted from a relay: 256 KB
pub const MAX_CONTENT_SIZE: usize = 256 * 1024;

/// Maximum number of tags on an inbound event
pub const MAX_TAGS: usize = 256;

const STATUS_ACTIVE: &str = "active";
const STATUS_INACTIVE: &str = "inactive";

#[derive(Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct AnnouncementContent {
    name: String,
    display_name: String,
    #[serde(default)]
    description: String,
    encrypted: bool,
    price_per_obs: u64,
    #[serde(default)]
    cadence_seconds: Option<u64>,
    #[serde(default)]
    tags: BTreeSet<String>,
    #[serde(default)]
    extensions: Extensions,
}

#[derive(Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct SubscriptionContent {
    stream_name: String,
    provider: String,
    active: bool,
}

#[derive(Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct PaymentContent {
    stream_name: String,
    seq_num: u64,
    amount_sats: u64,
    #[serde(default)]
    proof: Option<String>,
}

/// Any protocol event after decoding.
#[derive(Debug, Clone, PartialEq)]
pub enum DecodedEvent {
    Announcement(DatastreamMetadata),
    Subscription(SubscriptionNotice),
    Observation {
        stream: StreamIdentity,
        observation: DatastreamObservation,
    },
    Payment(PaymentNotice),
}

// ============================================================================
// ENCODING
// ============================================================================

fn tag(name: &str, value: impl Into<String>) -> Vec<String> {
    vec![name.to_string(), value.into()]
}

fn stream_tags(stream: &StreamIdentity) -> Vec<Vec<String>> {
    vec![
        tag(TAG_STREAM, stream.name()),
        tag(TAG_UUID, stream.uuid().to_string()),
    ]
}

fn require_author<K: EventSigner + ?Sized>(keys: &K, expected: &PublicKey, role: &str) -> Result<()> {
    if &keys.public_key() != expected {
        return Err(DatastreamError::InvalidIdentity(format!(
            "{} key {} does not match signing key {}",
            role,
            expected.short(),
            keys.public_key().short()
        )));
    }
    Ok(())
}

fn sign_event<K: EventSigner + ?Sized>(
    keys: &K,
    created_at: u64,
    kind: EventKind,
    tags: Vec<Vec<String>>,
    content: String,
) -> Result<Event> {
    let pubkey = keys.public_key().as_hex().to_string();
    let id = Event::compute_id(&pubkey, created_at, kind.as_u16(), &tags, &content)?;
    let id_bytes = hex::decode(&id).map_err(|e| DatastreamError::Crypto(e.to_string()))?;
    let sig = keys.sign(&id_bytes)?;

    Ok(Event {
        id,
        pubkey,
        created_at,
        kind: kind.as_u16(),
        tags,
        content,
        sig,
    })
}

/// Build a signed announcement. The signer must own the stream.
pub fn encode_announcement<K: EventSigner + ?Sized>(
    meta: &DatastreamMetadata,
    keys: &K,
) -> Result<Event> {
    require_author(keys, meta.identity.owner(), "stream owner")?;
    meta.extensions.validate()?;

    let name = meta.identity.name();
    let mut tags = vec![tag(TAG_D, name)];
    tags.extend(stream_tags(&meta.identity));
    tags.push(tag(TAG_PRICE, meta.price_per_obs.to_string()));
    if let Some(cadence) = meta.cadence_seconds {
        tags.push(tag(TAG_CADENCE, cadence.to_string()));
    }
    tags.extend(meta.tags.iter().map(|t| tag(TAG_T, t.as_str())));

    let content = serde_json::to_string(&AnnouncementContent {
        name: name.to_string(),
        display_name: meta.display_name.clone(),
        description: meta.description.clone(),
        encrypted: meta.encrypted,
        price_per_obs: meta.price_per_obs,
        cadence_seconds: meta.cadence_seconds,
        tags: meta.tags.clone(),
        extensions: meta.extensions.clone(),
    })?;

    sign_event(keys, meta.created_at, EventKind::Announcement, tags, content)
}

/// Build a signed subscription (or unsubscription, when `active` is false).
pub fn encode_subscription<K: EventSigner + ?Sized>(
    notice: &SubscriptionNotice,
    keys: &K,
) -> Result<Event> {
    require_author(keys, &notice.subscriber, "subscriber")?;

    let uuid = notice.stream.uuid().to_string();
    let mut tags = vec![tag(TAG_D, uuid)];
    tags.extend(stream_tags(&notice.stream));
    tags.push(tag(TAG_P, notice.stream.owner().as_hex()));
    tags.push(tag(
        TAG_STATUS,
        if notice.active {
            STATUS_ACTIVE
        } else {
            STATUS_INACTIVE
        },
    ));

    let content = serde_json::to_string(&SubscriptionContent {
        stream_name: notice.stream.name().to_string(),
        provider: notice.stream.owner().as_hex().to_string(),
        active: notice.active,
    })?;

    sign_event(
        keys,
        notice.created_at,
        EventKind::Subscription,
        tags,
        content,
    )
}

/// Seal one observation to one subscriber.
pub fn encode_observation<K: Keyring + ?Sized>(
    stream: &StreamIdentity,
    observation: &DatastreamObservation,
    recipient: &PublicKey,
    keys: &K,
) -> Result<Event> {
    require_author(keys, stream.owner(), "stream owner")?;
    if observation.stream_name != stream.name() {
        return Err(DatastreamError::MalformedEvent(format!(
            "observation is for '{}', not '{}'",
            observation.stream_name,
            stream.name()
        )));
    }
    if observation.seq_num == 0 {
        return Err(DatastreamError::MalformedEvent(
            "sequence numbers start at 1".to_string(),
        ));
    }

    let mut tags = stream_tags(stream);
    tags.push(tag(TAG_P, recipient.as_hex()));
    tags.push(tag(TAG_SEQ, observation.seq_num.to_string()));

    let plaintext = serde_json::to_string(observation)?;
    let content = keys.encrypt(&plaintext, recipient)?;

    sign_event(
        keys,
        observation.timestamp,
        EventKind::Observation,
        tags,
        content,
    )
}

/// Seal a payment notice to the stream's provider.
pub fn encode_payment<K: Keyring + ?Sized>(notice: &PaymentNotice, keys: &K) -> Result<Event> {
    require_author(keys, &notice.payer, "payer")?;
    let provider = notice.stream.owner();

    let mut tags = stream_tags(&notice.stream);
    tags.push(tag(TAG_P, provider.as_hex()));
    tags.push(tag(TAG_SEQ, notice.seq_num.to_string()));
    tags.push(tag(TAG_AMOUNT, notice.amount_sats.to_string()));

    let plaintext = serde_json::to_string(&PaymentContent {
        stream_name: notice.stream.name().to_string(),
        seq_num: notice.seq_num,
        amount_sats: notice.amount_sats,
        proof: notice.proof.clone(),
    })?;
    let content = keys.encrypt(&plaintext, provider)?;

    sign_event(keys, notice.created_at, EventKind::Payment, tags, content)
}

// ============================================================================
// DECODING
// ============================================================================

fn malformed(msg: impl Into<String>) -> DatastreamError {
    DatastreamError::MalformedEvent(msg.into())
}

/// Check kind, size, id and signature; returns the verified author.
pub fn verify_event<K: EventSigner + ?Sized>(
    event: &Event,
    expected: EventKind,
    keys: &K,
) -> Result<PublicKey> {
    match event.event_kind() {
        Some(kind) if kind == expected => {}
        Some(kind) => {
            return Err(malformed(format!(
                "expected {:?} event, got {:?}",
                expected, kind
            )))
        }
        None => return Err(malformed(format!("unrecognized kind {}", event.kind))),
    }

    if event.content.len() > MAX_CONTENT_SIZE {
        return Err(malformed(format!(
            "content too large: {} bytes (max {})",
            event.content.len(),
            MAX_CONTENT_SIZE
        )));
    }
    if event.tags.len() > MAX_TAGS {
        return Err(malformed(format!("too many tags: {}", event.tags.len())));
    }

    if !event.has_valid_id() {
        return Err(malformed("event id does not match contents"));
    }

    let author = PublicKey::from_hex(&event.pubkey)
        .map_err(|e| malformed(format!("bad author key: {}", e)))?;
    let id_bytes = hex::decode(&event.id).map_err(|e| malformed(format!("bad id: {}", e)))?;
    if !keys.verify(&author, &id_bytes, &event.sig) {
        return Err(malformed("signature does not verify"));
    }

    Ok(author)
}

fn required_tag<'a>(event: &'a Event, name: &str) -> Result<&'a str> {
    event
        .tag_value(name)
        .ok_or_else(|| malformed(format!("missing '{}' tag", name)))
}

fn numeric_tag(event: &Event, name: &str) -> Result<u64> {
    required_tag(event, name)?
        .parse()
        .map_err(|_| malformed(format!("'{}' tag is not a number", name)))
}

fn key_tag(event: &Event, name: &str) -> Result<PublicKey> {
    PublicKey::from_hex(required_tag(event, name)?)
        .map_err(|e| malformed(format!("'{}' tag: {}", name, e)))
}

/// Rebuild the stream identity from the plaintext tags and check the uuid tag.
fn tagged_stream(event: &Event, owner: PublicKey) -> Result<StreamIdentity> {
    let name = required_tag(event, TAG_STREAM)?;
    let stream = StreamIdentity::new(owner, name)
        .map_err(|e| malformed(format!("stream tag: {}", e)))?;
    let uuid = required_tag(event, TAG_UUID)?;
    if uuid != stream.uuid().to_string() {
        return Err(malformed(format!(
            "uuid tag {} does not match stream {}",
            uuid, stream
        )));
    }
    Ok(stream)
}

fn parse_content<T: DeserializeOwned>(content: &str, kind: EventKind) -> Result<T> {
    serde_json::from_str(content).map_err(|e| malformed(format!("{:?} content: {}", kind, e)))
}

/// Check the event is sealed to us, then open it.
fn open_sealed<K: Keyring + ?Sized>(event: &Event, sender: &PublicKey, keys: &K) -> Result<String> {
    let recipient = key_tag(event, TAG_P)?;
    if recipient != keys.public_key() {
        return Err(DatastreamError::DecryptionFailed(format!(
            "event {} is addressed to {}",
            &event.id[..8.min(event.id.len())],
            recipient.short()
        )));
    }
    keys.decrypt(&event.content, sender)
        .map_err(|e| DatastreamError::DecryptionFailed(e.to_string()))
}

pub fn decode_announcement<K: EventSigner + ?Sized>(
    event: &Event,
    keys: &K,
) -> Result<DatastreamMetadata> {
    let author = verify_event(event, EventKind::Announcement, keys)?;
    let identity = tagged_stream(event, author)?;
    if required_tag(event, TAG_D)? != identity.name() {
        return Err(malformed("'d' tag does not match stream name"));
    }
    let price = numeric_tag(event, TAG_PRICE)?;
    let cadence = match event.tag_value(TAG_CADENCE) {
        Some(_) => Some(numeric_tag(event, TAG_CADENCE)?),
        None => None,
    };

    let content: AnnouncementContent = parse_content(&event.content, EventKind::Announcement)?;
    if content.name != identity.name() {
        return Err(malformed("content name does not match stream tag"));
    }
    if content.price_per_obs != price {
        return Err(malformed("content price does not match price tag"));
    }
    if content.cadence_seconds != cadence {
        return Err(malformed("content cadence does not match cadence tag"));
    }
    if content.cadence_seconds == Some(0) {
        return Err(malformed("cadence must be positive"));
    }
    content.extensions.validate()?;

    Ok(DatastreamMetadata {
        identity,
        display_name: content.display_name,
        description: content.description,
        encrypted: content.encrypted,
        price_per_obs: content.price_per_obs,
        cadence_seconds: content.cadence_seconds,
        created_at: event.created_at,
        tags: content.tags,
        extensions: content.extensions,
    })
}

pub fn decode_subscription<K: EventSigner + ?Sized>(
    event: &Event,
    keys: &K,
) -> Result<SubscriptionNotice> {
    let subscriber = verify_event(event, EventKind::Subscription, keys)?;
    let provider = key_tag(event, TAG_P)?;
    let stream = tagged_stream(event, provider.clone())?;
    if required_tag(event, TAG_D)? != stream.uuid().to_string() {
        return Err(malformed("'d' tag does not match stream uuid"));
    }
    let active = match required_tag(event, TAG_STATUS)? {
        STATUS_ACTIVE => true,
        STATUS_INACTIVE => false,
        other => return Err(malformed(format!("unknown status '{}'", other))),
    };

    let content: SubscriptionContent = parse_content(&event.content, EventKind::Subscription)?;
    if content.stream_name != stream.name()
        || !content.provider.eq_ignore_ascii_case(provider.as_hex())
        || content.active != active
    {
        return Err(malformed("subscription content disagrees with its tags"));
    }

    Ok(SubscriptionNotice {
        subscriber,
        stream,
        active,
        created_at: event.created_at,
    })
}

/// Open an observation addressed to `keys`.
pub fn decode_observation<K: Keyring + ?Sized>(
    event: &Event,
    keys: &K,
) -> Result<(StreamIdentity, DatastreamObservation)> {
    let provider = verify_event(event, EventKind::Observation, keys)?;
    let stream = tagged_stream(event, provider.clone())?;
    let seq = numeric_tag(event, TAG_SEQ)?;
    if seq == 0 {
        return Err(malformed("sequence numbers start at 1"));
    }

    let plaintext = open_sealed(event, &provider, keys)?;
    let observation: DatastreamObservation = parse_content(&plaintext, EventKind::Observation)?;
    if observation.stream_name != stream.name() {
        return Err(malformed("sealed stream name disagrees with stream tag"));
    }
    if observation.seq_num != seq {
        return Err(malformed(format!(
            "sealed seq {} disagrees with seq tag {}",
            observation.seq_num, seq
        )));
    }

    Ok((stream, observation))
}

/// Open a payment notice addressed to `keys` (the provider).
pub fn decode_payment<K: Keyring + ?Sized>(event: &Event, keys: &K) -> Result<PaymentNotice> {
    let payer = verify_event(event, EventKind::Payment, keys)?;
    let provider = key_tag(event, TAG_P)?;
    let stream = tagged_stream(event, provider)?;
    let seq = numeric_tag(event, TAG_SEQ)?;
    let amount = numeric_tag(event, TAG_AMOUNT)?;

    let plaintext = open_sealed(event, &payer, keys)?;
    let content: PaymentContent = parse_content(&plaintext, EventKind::Payment)?;
    if content.stream_name != stream.name() || content.seq_num != seq || content.amount_sats != amount
    {
        return Err(malformed("sealed payment disagrees with its tags"));
    }

    Ok(PaymentNotice {
        payer,
        stream,
        seq_num: content.seq_num,
        amount_sats: content.amount_sats,
        proof: content.proof,
        created_at: event.created_at,
    })
}

/// Decode any protocol event, dispatching on its kind.
pub fn decode_event<K: Keyring + ?Sized>(event: &Event, keys: &K) -> Result<DecodedEvent> {
    match event.event_kind() {
        Some(EventKind::Announcement) => decode_announcement(event, keys).map(DecodedEvent::Announcement),
        Some(EventKind::Subscription) => decode_subscription(event, keys).map(DecodedEvent::Subscription),
        Some(EventKind::Observation) => {
            decode_observation(event, keys).map(|(stream, observation)| DecodedEvent::Observation {
                stream,
                observation,
            })
        }
        Some(EventKind::Payment) => decode_payment(event, keys).map(DecodedEvent::Payment),
        None => Err(malformed(format!("unrecognized kind {}", event.kind))),
    }
}
