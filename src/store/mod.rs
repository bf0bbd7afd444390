//! StateStore trait — pluggable per-key state persistence.
//!
//! Abstracts the key-value backend holding each entity's model state so the
//! engine never assumes in-process mutability or unbounded retention:
//! - `InMemoryStore`: RwLock-backed map for testing and minimal deployments
//! - `SledStore`: embedded sled database for restart-surviving state
//!
//! The contract is last-write-wins per key. Updates for *different* keys
//! are independent; updates for the *same* key must be serialized by the
//! caller (the recursion is inherently sequential per key).

use crate::types::KeyState;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, RwLock};
use thiserror::Error;

/// Store errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage error: {0}")]
    Storage(String),
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<sled::Error> for StoreError {
    fn from(err: sled::Error) -> Self {
        StoreError::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

/// Trait for pluggable state backends
///
/// Implementations must be thread-safe (Send + Sync) for shared access;
/// same-key write ordering remains the caller's responsibility.
pub trait StateStore: Send + Sync {
    /// Current state for a key, or `None` if the key has never been seen
    fn fetch(&self, key: &str) -> Result<Option<KeyState>, StoreError>;

    /// Persist a key's state (last-write-wins)
    fn save(&self, key: &str, state: &KeyState) -> Result<(), StoreError>;

    /// Number of keys currently stored
    fn count(&self) -> usize;

    /// Flush pending writes (no-op for non-durable backends)
    fn flush(&self) -> Result<(), StoreError> {
        Ok(())
    }

    /// Backend name for logging
    fn backend_name(&self) -> &'static str;
}

impl<S: StateStore + ?Sized> StateStore for Box<S> {
    fn fetch(&self, key: &str) -> Result<Option<KeyState>, StoreError> {
        (**self).fetch(key)
    }

    fn save(&self, key: &str, state: &KeyState) -> Result<(), StoreError> {
        (**self).save(key, state)
    }

    fn count(&self) -> usize {
        (**self).count()
    }

    fn flush(&self) -> Result<(), StoreError> {
        (**self).flush()
    }

    fn backend_name(&self) -> &'static str {
        (**self).backend_name()
    }
}

// ============================================================================
// In-Memory Store
// ============================================================================

/// In-memory store for testing and minimal deployments
///
/// Thread-safe via `RwLock`. Not durable — state lost on restart.
#[derive(Default)]
pub struct InMemoryStore {
    entries: RwLock<HashMap<String, KeyState>>,
}

impl InMemoryStore {
    /// Create a new empty in-memory store
    pub fn new() -> Self {
        Self::default()
    }
}

impl StateStore for InMemoryStore {
    fn fetch(&self, key: &str) -> Result<Option<KeyState>, StoreError> {
        let entries = self
            .entries
            .read()
            .map_err(|e| StoreError::Storage(e.to_string()))?;
        Ok(entries.get(key).cloned())
    }

    fn save(&self, key: &str, state: &KeyState) -> Result<(), StoreError> {
        let mut entries = self
            .entries
            .write()
            .map_err(|e| StoreError::Storage(e.to_string()))?;
        entries.insert(key.to_string(), state.clone());
        Ok(())
    }

    fn count(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    fn backend_name(&self) -> &'static str {
        "InMemory"
    }
}

// ============================================================================
// Sled Store
// ============================================================================

/// Sled-backed store for state that survives restarts
///
/// Key: the entity key as UTF-8 bytes. Value: JSON-serialized `KeyState`.
///
/// Note: does not call flush() on each write. Sled provides durability via
/// background flushing; on crash, at most the last few writes may be lost,
/// which re-runs those keys' warm-up from the persisted prior state.
#[derive(Clone)]
pub struct SledStore {
    db: Arc<sled::Db>,
}

impl SledStore {
    /// Open or create the store at the specified path
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let db = sled::open(path)?;
        Ok(Self { db: Arc::new(db) })
    }

    /// Remove all stored keys
    pub fn clear(&self) -> Result<(), StoreError> {
        self.db.clear()?;
        self.db.flush()?;
        Ok(())
    }
}

impl StateStore for SledStore {
    fn fetch(&self, key: &str) -> Result<Option<KeyState>, StoreError> {
        match self.db.get(key.as_bytes())? {
            Some(value) => Ok(Some(serde_json::from_slice(&value)?)),
            None => Ok(None),
        }
    }

    fn save(&self, key: &str, state: &KeyState) -> Result<(), StoreError> {
        let value = serde_json::to_vec(state)?;
        self.db.insert(key.as_bytes(), value)?;
        Ok(())
    }

    fn count(&self) -> usize {
        self.db.len()
    }

    fn flush(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "Sled"
    }
}
