// Subscription store — restart safety for subscriber records
//
// Persistence is optional. Without it a provider forgets who subscribed and
// who paid on restart; subscribers re-announce and the state rebuilds, at the
// cost of withholding observations they had already paid for in the meantime.

use super::SubscriberRecord;
use crate::identity::StreamIdentity;
use parking_lot::RwLock;
use std::collections::HashMap;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error, Clone)]
pub enum StoreError {
    #[error("Storage error: {0}")]
    StorageError(String),
    #[error("Serialization error: {0}")]
    SerializationError(String),
}

impl From<StoreError> for crate::DatastreamError {
    fn from(err: StoreError) -> Self {
        crate::DatastreamError::Storage(err.to_string())
    }
}

/// Where subscriber records and sequence counters survive restarts.
pub trait SubscriptionStore: Send + Sync {
    fn load_subscriptions(&self) -> Result<Vec<SubscriberRecord>, StoreError>;

    /// Upsert by (stream, subscriber)
    fn save_subscriptions(&self, records: &[SubscriberRecord]) -> Result<(), StoreError>;

    /// Last published sequence number per stream
    fn load_sequences(&self) -> Result<Vec<(StreamIdentity, u64)>, StoreError> {
        Ok(Vec::new())
    }

    fn save_sequence(&self, _stream: &StreamIdentity, _seq: u64) -> Result<(), StoreError> {
        Ok(())
    }
}

fn record_key(stream: &StreamIdentity, subscriber: &str) -> String {
    format!("{}:{}", stream.uuid(), subscriber)
}

/// In-memory store for tests and ephemeral providers
#[derive(Default)]
pub struct MemorySubscriptionStore {
    records: RwLock<HashMap<String, SubscriberRecord>>,
    sequences: RwLock<HashMap<StreamIdentity, u64>>,
}

impl MemorySubscriptionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

impl SubscriptionStore for MemorySubscriptionStore {
    fn load_subscriptions(&self) -> Result<Vec<SubscriberRecord>, StoreError> {
        Ok(self.records.read().values().cloned().collect())
    }

    fn save_subscriptions(&self, records: &[SubscriberRecord]) -> Result<(), StoreError> {
        let mut stored = self.records.write();
        for record in records {
            stored.insert(
                record_key(&record.stream, record.subscriber.as_hex()),
                record.clone(),
            );
        }
        Ok(())
    }

    fn load_sequences(&self) -> Result<Vec<(StreamIdentity, u64)>, StoreError> {
        Ok(self
            .sequences
            .read()
            .iter()
            .map(|(stream, seq)| (stream.clone(), *seq))
            .collect())
    }

    fn save_sequence(&self, stream: &StreamIdentity, seq: u64) -> Result<(), StoreError> {
        self.sequences.write().insert(stream.clone(), seq);
        Ok(())
    }
}

/// Persistent sled-backed subscription store
pub struct SledSubscriptionStore {
    #[allow(dead_code)] // Keeps sled::Db alive (RAII)
    db: sled::Db,
    records_tree: sled::Tree,
    sequences_tree: sled::Tree,
}

impl SledSubscriptionStore {
    /// Open (or create) a store at `path`
    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self, StoreError> {
        let db = sled::open(path).map_err(|e| StoreError::StorageError(e.to_string()))?;
        Self::new(db)
    }

    pub fn new(db: sled::Db) -> Result<Self, StoreError> {
        let records_tree = db
            .open_tree("subscriber_records")
            .map_err(|e| StoreError::StorageError(e.to_string()))?;
        let sequences_tree = db
            .open_tree("stream_sequences")
            .map_err(|e| StoreError::StorageError(e.to_string()))?;

        Ok(Self {
            db,
            records_tree,
            sequences_tree,
        })
    }
}

impl SubscriptionStore for SledSubscriptionStore {
    fn load_subscriptions(&self) -> Result<Vec<SubscriberRecord>, StoreError> {
        let mut records = Vec::new();
        for entry in self.records_tree.iter() {
            let (key, value) = entry.map_err(|e| StoreError::StorageError(e.to_string()))?;
            match bincode::deserialize::<SubscriberRecord>(&value) {
                Ok(record) => records.push(record),
                Err(e) => debug!(
                    "Skipping unreadable subscriber record {}: {}",
                    String::from_utf8_lossy(&key),
                    e
                ),
            }
        }
        Ok(records)
    }

    fn save_subscriptions(&self, records: &[SubscriberRecord]) -> Result<(), StoreError> {
        for record in records {
            let key = record_key(&record.stream, record.subscriber.as_hex());
            let value = bincode::serialize(record)
                .map_err(|e| StoreError::SerializationError(e.to_string()))?;
            self.records_tree
                .insert(key.as_bytes(), value)
                .map_err(|e| StoreError::StorageError(e.to_string()))?;
        }
        self.records_tree
            .flush()
            .map_err(|e| StoreError::StorageError(e.to_string()))?;
        Ok(())
    }

    fn load_sequences(&self) -> Result<Vec<(StreamIdentity, u64)>, StoreError> {
        let mut sequences = Vec::new();
        for entry in self.sequences_tree.iter() {
            let (_, value) = entry.map_err(|e| StoreError::StorageError(e.to_string()))?;
            let pair = bincode::deserialize::<(StreamIdentity, u64)>(&value)
                .map_err(|e| StoreError::SerializationError(e.to_string()))?;
            sequences.push(pair);
        }
        Ok(sequences)
    }

    fn save_sequence(&self, stream: &StreamIdentity, seq: u64) -> Result<(), StoreError> {
        let value = bincode::serialize(&(stream, seq))
            .map_err(|e| StoreError::SerializationError(e.to_string()))?;
        self.sequences_tree
            .insert(stream.uuid().as_bytes(), value)
            .map_err(|e| StoreError::StorageError(e.to_string()))?;
        self.sequences_tree
            .flush()
            .map_err(|e| StoreError::StorageError(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{LocalKeys, PublicKey};
    use crate::crypto::EventSigner;
    use tempfile::tempdir;

    fn record(provider: &PublicKey, subscriber: &PublicKey, paid: u64) -> SubscriberRecord {
        let stream = StreamIdentity::new(provider.clone(), "btc-usd").unwrap();
        let mut record = SubscriberRecord::new(subscriber.clone(), stream, 100);
        record.last_paid_seq = paid;
        record
    }

    #[test]
    fn test_memory_store_upserts() {
        let provider = LocalKeys::generate().public_key();
        let subscriber = LocalKeys::generate().public_key();
        let store = MemorySubscriptionStore::new();

        store
            .save_subscriptions(&[record(&provider, &subscriber, 1)])
            .unwrap();
        store
            .save_subscriptions(&[record(&provider, &subscriber, 4)])
            .unwrap();

        let loaded = store.load_subscriptions().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].last_paid_seq, 4);
    }

    #[test]
    fn test_sled_store_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("subs");
        let provider = LocalKeys::generate().public_key();
        let a = LocalKeys::generate().public_key();
        let b = LocalKeys::generate().public_key();
        let stream = StreamIdentity::new(provider.clone(), "btc-usd").unwrap();

        {
            let store = SledSubscriptionStore::open(&path).unwrap();
            store
                .save_subscriptions(&[record(&provider, &a, 2), record(&provider, &b, 0)])
                .unwrap();
            store.save_sequence(&stream, 7).unwrap();
        }

        let store = SledSubscriptionStore::open(&path).unwrap();
        let mut loaded = store.load_subscriptions().unwrap();
        loaded.sort_by_key(|r| r.last_paid_seq);
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[1].subscriber, a);
        assert_eq!(loaded[1].last_paid_seq, 2);
        assert_eq!(store.load_sequences().unwrap(), vec![(stream, 7)]);
    }
}
