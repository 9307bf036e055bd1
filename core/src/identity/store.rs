// Key storage using sled

use super::LocalKeys;
use crate::{DatastreamError, Result};

const LOCAL_KEYS: &[u8] = b"local_keys";

/// Where a client keeps its keypair between runs
pub enum KeyStore {
    Memory,
    Persistent(sled::Db),
}

impl KeyStore {
    /// Create in-memory storage
    pub fn memory() -> Self {
        Self::Memory
    }

    /// Open (or create) a sled database at `path`
    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let db = sled::open(path).map_err(|e| DatastreamError::Storage(e.to_string()))?;
        Ok(Self::Persistent(db))
    }

    /// Save keys to storage
    pub fn save_keys(&self, keys: &LocalKeys) -> Result<()> {
        match self {
            Self::Memory => Ok(()),
            Self::Persistent(db) => {
                db.insert(LOCAL_KEYS, keys.to_bytes().as_slice())
                    .map_err(|e| DatastreamError::Storage(e.to_string()))?;
                db.flush()
                    .map_err(|e| DatastreamError::Storage(e.to_string()))?;
                Ok(())
            }
        }
    }

    /// Load keys from storage
    pub fn load_keys(&self) -> Result<Option<LocalKeys>> {
        match self {
            Self::Memory => Ok(None),
            Self::Persistent(db) => {
                match db
                    .get(LOCAL_KEYS)
                    .map_err(|e| DatastreamError::Storage(e.to_string()))?
                {
                    Some(bytes) => Ok(Some(LocalKeys::from_bytes(&bytes)?)),
                    None => Ok(None),
                }
            }
        }
    }

    /// Load stored keys, generating and saving a new pair on first run
    pub fn load_or_generate(&self) -> Result<LocalKeys> {
        if let Some(keys) = self.load_keys()? {
            return Ok(keys);
        }
        let keys = LocalKeys::generate();
        self.save_keys(&keys)?;
        tracing::info!("Generated new local keys");
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::EventSigner;
    use tempfile::tempdir;

    #[test]
    fn test_memory_store() {
        let store = KeyStore::memory();
        store.save_keys(&LocalKeys::generate()).unwrap();
        assert!(store.load_keys().unwrap().is_none());
    }

    #[test]
    fn test_persistence_across_instances() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("keys");

        let public_key = {
            let store = KeyStore::open(&path).unwrap();
            store.load_or_generate().unwrap().public_key()
        };

        let store = KeyStore::open(&path).unwrap();
        let loaded = store.load_keys().unwrap().unwrap();
        assert_eq!(loaded.public_key(), public_key);
        assert_eq!(store.load_or_generate().unwrap().public_key(), public_key);
    }
}
