// Subscriber access controller — who may receive which observation
//
// One record per (stream, subscriber). Only two inputs move a record:
// a subscription sighting and a payment sighting. Eligibility for
// observation N is: free stream, or N == 1, or last_paid_seq >= N.
//
// Locking: the stream map and each stream's subscriber map are RwLocks that
// are only write-locked to insert new entries. Each record sits behind its
// own Mutex, so a payment for one subscriber never waits on another.

use super::store::SubscriptionStore;
use crate::event::{PaymentNotice, SubscriptionNotice};
use crate::identity::{PublicKey, StreamIdentity};
use crate::{DatastreamError, Result};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Most audit entries kept in memory
pub const MAX_AUDIT_ENTRIES: usize = 1_000;

/// Most payments held back waiting for their subscription to show up
pub const MAX_PENDING_PAYMENTS: usize = 1_000;

/// Provider-side view of one subscriber of one stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriberRecord {
    pub subscriber: PublicKey,
    pub stream: StreamIdentity,
    /// Highest sequence number paid for (0 = nothing yet)
    pub last_paid_seq: u64,
    pub subscribed_at: u64,
    /// Set when the subscriber withdraws; the record itself is kept
    pub unsubscribed_at: Option<u64>,
    /// `created_at` of the newest subscription event applied
    pub updated_at: u64,
}

impl SubscriberRecord {
    pub fn new(subscriber: PublicKey, stream: StreamIdentity, subscribed_at: u64) -> Self {
        Self {
            subscriber,
            stream,
            last_paid_seq: 0,
            subscribed_at,
            unsubscribed_at: None,
            updated_at: subscribed_at,
        }
    }

    pub fn is_active(&self) -> bool {
        self.unsubscribed_at.is_none()
    }
}

/// Why a payment landed in the audit log
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditReason {
    /// Stream is not one of ours
    UnknownStream,
    /// Payer never subscribed
    NoSubscription,
    /// Sequence number 0, or beyond the next observation
    SequenceOutOfRange,
    /// Applied, but the amount was below the stream price
    Underpaid,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentAudit {
    pub payer: PublicKey,
    pub stream: StreamIdentity,
    pub seq_num: u64,
    pub amount_sats: u64,
    pub reason: AuditReason,
    pub recorded_at: u64,
}

/// Result of an eligibility sweep at publish time
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecipientSplit {
    pub eligible: Vec<PublicKey>,
    pub withheld: Vec<PublicKey>,
}

struct StreamAccess {
    /// `None` until the stream is registered; only seq 1 is free until then
    price_per_obs: RwLock<Option<u64>>,
    /// Last sequence number handed out
    latest_seq: AtomicU64,
    subscribers: RwLock<HashMap<PublicKey, Arc<Mutex<SubscriberRecord>>>>,
}

impl StreamAccess {
    fn new(price: Option<u64>) -> Self {
        Self {
            price_per_obs: RwLock::new(price),
            latest_seq: AtomicU64::new(0),
            subscribers: RwLock::new(HashMap::new()),
        }
    }

    fn record(&self, subscriber: &PublicKey) -> Option<Arc<Mutex<SubscriberRecord>>> {
        self.subscribers.read().get(subscriber).cloned()
    }

    fn is_free(&self) -> bool {
        *self.price_per_obs.read() == Some(0)
    }
}

fn eligible(free: bool, seq: u64, last_paid_seq: u64) -> bool {
    free || seq == 1 || last_paid_seq >= seq
}

/// Per-stream, per-subscriber payment state for a provider.
pub struct SubscriberAccessController {
    streams: RwLock<HashMap<StreamIdentity, Arc<StreamAccess>>>,
    store: Option<Arc<dyn SubscriptionStore>>,
    audit: Mutex<VecDeque<PaymentAudit>>,
    /// Payments seen before the payer's subscription, oldest first
    pending: Mutex<VecDeque<PaymentNotice>>,
}

impl SubscriberAccessController {
    /// Controller without persistence
    pub fn new() -> Self {
        Self {
            streams: RwLock::new(HashMap::new()),
            store: None,
            audit: Mutex::new(VecDeque::new()),
            pending: Mutex::new(VecDeque::new()),
        }
    }

    /// Controller backed by `store`; call [`load`](Self::load) to restore state
    pub fn with_store(store: Arc<dyn SubscriptionStore>) -> Self {
        Self {
            store: Some(store),
            ..Self::new()
        }
    }

    fn stream(&self, identity: &StreamIdentity) -> Option<Arc<StreamAccess>> {
        self.streams.read().get(identity).cloned()
    }

    fn stream_or_insert(&self, identity: &StreamIdentity) -> Arc<StreamAccess> {
        if let Some(access) = self.stream(identity) {
            return access;
        }
        self.streams
            .write()
            .entry(identity.clone())
            .or_insert_with(|| Arc::new(StreamAccess::new(None)))
            .clone()
    }

    fn persist(&self, record: &SubscriberRecord) {
        if let Some(store) = &self.store {
            if let Err(e) = store.save_subscriptions(std::slice::from_ref(record)) {
                warn!("Failed to persist subscriber record for {}: {}", record.stream, e);
            }
        }
    }

    fn push_audit(&self, notice: &PaymentNotice, reason: AuditReason) {
        let mut audit = self.audit.lock();
        audit.push_back(PaymentAudit {
            payer: notice.payer.clone(),
            stream: notice.stream.clone(),
            seq_num: notice.seq_num,
            amount_sats: notice.amount_sats,
            reason,
            recorded_at: crate::now_unix(),
        });
        while audit.len() > MAX_AUDIT_ENTRIES {
            audit.pop_front();
        }
    }

    fn hold_payment(&self, notice: &PaymentNotice) {
        let mut pending = self.pending.lock();
        pending.push_back(notice.clone());
        while pending.len() > MAX_PENDING_PAYMENTS {
            pending.pop_front();
        }
    }

    /// Apply held payments from `subscriber` now that its record exists.
    fn release_payments(&self, stream: &StreamIdentity, subscriber: &PublicKey) {
        let released: Vec<PaymentNotice> = {
            let mut pending = self.pending.lock();
            let (matching, rest) = pending
                .drain(..)
                .partition(|p| &p.stream == stream && &p.payer == subscriber);
            *pending = rest;
            matching.into_iter().collect()
        };
        for notice in released {
            match self.on_payment(&notice) {
                Ok(paid) => debug!(
                    "Applied held payment from {} on {}: paid through {}",
                    subscriber.short(),
                    stream,
                    paid
                ),
                Err(e) => debug!("Held payment from {} still rejected: {}", subscriber.short(), e),
            }
        }
    }

    /// Payments waiting on a subscription that has not been seen yet
    pub fn pending_payments(&self) -> usize {
        self.pending.lock().len()
    }

    /// Restore records and sequence counters from the store.
    pub fn load(&self) -> Result<usize> {
        let Some(store) = &self.store else {
            return Ok(0);
        };

        let records = store.load_subscriptions()?;
        let count = records.len();
        for record in records {
            let access = self.stream_or_insert(&record.stream);
            access
                .subscribers
                .write()
                .insert(record.subscriber.clone(), Arc::new(Mutex::new(record)));
        }
        for (stream, seq) in store.load_sequences()? {
            self.stream_or_insert(&stream)
                .latest_seq
                .fetch_max(seq, Ordering::SeqCst);
        }

        info!("Restored {} subscriber records", count);
        Ok(count)
    }

    /// Declare (or re-price) one of our streams.
    pub fn register_stream(&self, identity: &StreamIdentity, price_per_obs: u64) {
        let access = self.stream_or_insert(identity);
        let mut price = access.price_per_obs.write();
        if *price != Some(price_per_obs) {
            debug!("Stream {} priced at {} sats", identity, price_per_obs);
        }
        *price = Some(price_per_obs);
    }

    pub fn price_of(&self, identity: &StreamIdentity) -> Option<u64> {
        self.stream(identity)
            .and_then(|access| *access.price_per_obs.read())
    }

    /// Hand out the next sequence number for a stream (first is 1).
    pub fn next_sequence(&self, identity: &StreamIdentity) -> u64 {
        let access = self.stream_or_insert(identity);
        let seq = access.latest_seq.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(store) = &self.store {
            if let Err(e) = store.save_sequence(identity, seq) {
                warn!("Failed to persist sequence for {}: {}", identity, e);
            }
        }
        seq
    }

    pub fn latest_sequence(&self, identity: &StreamIdentity) -> u64 {
        self.stream(identity)
            .map(|access| access.latest_seq.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    /// Apply a subscription sighting. Returns true if a new record was created.
    ///
    /// Older sightings than the one already applied are ignored, matching
    /// relay replaceable-event semantics.
    pub fn on_subscription(&self, notice: &SubscriptionNotice) -> bool {
        let access = self.stream_or_insert(&notice.stream);

        if let Some(record) = access.record(&notice.subscriber) {
            let snapshot = {
                let mut record = record.lock();
                if notice.created_at < record.updated_at {
                    debug!(
                        "Ignoring stale subscription event from {} for {}",
                        notice.subscriber.short(),
                        notice.stream
                    );
                    return false;
                }
                record.updated_at = notice.created_at;
                if notice.active {
                    if record.unsubscribed_at.take().is_some() {
                        info!(
                            "Subscriber {} re-subscribed to {}",
                            notice.subscriber.short(),
                            notice.stream
                        );
                    }
                } else if record.unsubscribed_at.is_none() {
                    record.unsubscribed_at = Some(notice.created_at);
                    info!(
                        "Subscriber {} unsubscribed from {}",
                        notice.subscriber.short(),
                        notice.stream
                    );
                }
                record.clone()
            };
            self.persist(&snapshot);
            return false;
        }

        let mut record = SubscriberRecord::new(
            notice.subscriber.clone(),
            notice.stream.clone(),
            notice.created_at,
        );
        if !notice.active {
            record.unsubscribed_at = Some(notice.created_at);
        }

        let inserted = {
            let mut subscribers = access.subscribers.write();
            if subscribers.contains_key(&notice.subscriber) {
                false
            } else {
                subscribers.insert(
                    notice.subscriber.clone(),
                    Arc::new(Mutex::new(record.clone())),
                );
                true
            }
        };

        if inserted {
            info!(
                "New subscriber {} for {}",
                notice.subscriber.short(),
                notice.stream
            );
            self.persist(&record);
            self.release_payments(&notice.stream, &notice.subscriber);
            true
        } else {
            // Lost a race with a concurrent first sighting; apply as an update
            self.on_subscription(notice)
        }
    }

    /// Apply a payment sighting. Returns the subscriber's new `last_paid_seq`.
    ///
    /// Payments raise eligibility monotonically: an older or duplicate payment
    /// never lowers it. Unrecognized payments go to the audit log and fail
    /// with `PaymentNotRecognized`. A payment from someone not subscribed yet
    /// is also held and applied once their subscription arrives.
    pub fn on_payment(&self, notice: &PaymentNotice) -> Result<u64> {
        let Some(access) = self.stream(&notice.stream) else {
            self.push_audit(notice, AuditReason::UnknownStream);
            return Err(DatastreamError::PaymentNotRecognized(format!(
                "unknown stream {}",
                notice.stream
            )));
        };

        let next = access.latest_seq.load(Ordering::SeqCst) + 1;
        if notice.seq_num == 0 || notice.seq_num > next {
            self.push_audit(notice, AuditReason::SequenceOutOfRange);
            return Err(DatastreamError::PaymentNotRecognized(format!(
                "seq {} on {} (next is {})",
                notice.seq_num, notice.stream, next
            )));
        }

        let Some(record) = access.record(&notice.payer) else {
            self.push_audit(notice, AuditReason::NoSubscription);
            self.hold_payment(notice);
            return Err(DatastreamError::PaymentNotRecognized(format!(
                "{} is not subscribed to {}",
                notice.payer.short(),
                notice.stream
            )));
        };

        if let Some(price) = *access.price_per_obs.read() {
            if notice.amount_sats < price {
                warn!(
                    "Underpayment from {} on {} seq {}: {} < {} sats",
                    notice.payer.short(),
                    notice.stream,
                    notice.seq_num,
                    notice.amount_sats,
                    price
                );
                self.push_audit(notice, AuditReason::Underpaid);
            }
        }

        let snapshot = {
            let mut record = record.lock();
            if notice.seq_num <= record.last_paid_seq {
                debug!(
                    "Payment for seq {} from {} already covered (paid through {})",
                    notice.seq_num,
                    notice.payer.short(),
                    record.last_paid_seq
                );
                return Ok(record.last_paid_seq);
            }
            record.last_paid_seq = notice.seq_num;
            record.clone()
        };

        debug!(
            "Subscriber {} paid through seq {} on {}",
            notice.payer.short(),
            snapshot.last_paid_seq,
            notice.stream
        );
        self.persist(&snapshot);
        Ok(snapshot.last_paid_seq)
    }

    /// Whether `subscriber` may receive observation `seq` of `stream`.
    pub fn is_eligible(&self, stream: &StreamIdentity, subscriber: &PublicKey, seq: u64) -> bool {
        let Some(access) = self.stream(stream) else {
            return false;
        };
        let Some(record) = access.record(subscriber) else {
            return false;
        };
        let free = access.is_free();
        let record = record.lock();
        record.is_active() && eligible(free, seq, record.last_paid_seq)
    }

    /// Split the active subscribers of a stream by eligibility for `seq`.
    pub fn eligible_recipients(&self, stream: &StreamIdentity, seq: u64) -> RecipientSplit {
        let mut split = RecipientSplit::default();
        let Some(access) = self.stream(stream) else {
            return split;
        };
        let free = access.is_free();

        let records: Vec<_> = access.subscribers.read().values().cloned().collect();
        for record in records {
            let record = record.lock();
            if !record.is_active() {
                continue;
            }
            if eligible(free, seq, record.last_paid_seq) {
                split.eligible.push(record.subscriber.clone());
            } else {
                split.withheld.push(record.subscriber.clone());
            }
        }
        split
    }

    pub fn subscriber(&self, stream: &StreamIdentity, subscriber: &PublicKey) -> Option<SubscriberRecord> {
        self.stream(stream)
            .and_then(|access| access.record(subscriber))
            .map(|record| record.lock().clone())
    }

    /// Every record for a stream, including unsubscribed ones
    pub fn subscribers(&self, stream: &StreamIdentity) -> Vec<SubscriberRecord> {
        let Some(access) = self.stream(stream) else {
            return Vec::new();
        };
        let records: Vec<_> = access.subscribers.read().values().cloned().collect();
        records.iter().map(|r| r.lock().clone()).collect()
    }

    pub fn audit_log(&self) -> Vec<PaymentAudit> {
        self.audit.lock().iter().cloned().collect()
    }
}

impl Default for SubscriberAccessController {
    fn default() -> Self {
        Self::new()
    }
}
