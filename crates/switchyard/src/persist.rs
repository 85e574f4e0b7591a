//! Persistent state adapter contract.
//!
//! The engine saves each persistence-enabled block's state as opaque JSON
//! bytes under the block's name. Expiration is evaluated by the engine
//! from the record's save timestamp and the block's configured expiration
//! period; backends only store what they are given.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::Mutex;

use crate::error::{CircuitError, SimResult};
use crate::value::Value;

/// One stored record: opaque payload plus its save timestamp.
#[derive(Debug, Clone)]
pub struct StoredState {
    pub payload: Vec<u8>,
    /// `None` when the backend cannot provide a timestamp; such records
    /// never expire (a warning is logged at load).
    pub saved_at: Option<SystemTime>,
}

/// Key-value storage for persistent block state.
///
/// Real backends (files, databases) are host collaborators; the engine
/// only needs this mapping API.
pub trait StateStore: Send + Sync {
    fn get(&self, key: &str) -> SimResult<Option<StoredState>>;
    fn put(&self, key: &str, payload: &[u8], saved_at: SystemTime) -> SimResult<()>;
    fn delete(&self, key: &str) -> SimResult<()>;
    /// All stored keys; used to prune records of removed blocks at start.
    fn keys(&self) -> SimResult<Vec<String>>;
}

/// In-memory store for tests and demos.
///
/// Cloning yields a handle to the same storage, so a test can keep a
/// handle while the circuit owns another.
#[derive(Clone, Default)]
pub struct MemoryStore {
    entries: Arc<Mutex<HashMap<String, StoredState>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Insert a record with an explicit timestamp (tests use this to
    /// fabricate aged records).
    pub fn put_at(&self, key: &str, payload: &[u8], saved_at: Option<SystemTime>) {
        self.entries.lock().insert(
            key.to_string(),
            StoredState {
                payload: payload.to_vec(),
                saved_at,
            },
        );
    }

    /// Store a JSON value the way the engine would.
    pub fn put_json(&self, key: &str, value: &Value, saved_at: Option<SystemTime>) {
        let payload = serde_json::to_vec(value).expect("JSON value is serializable");
        self.put_at(key, &payload, saved_at);
    }

    /// Decode a stored record as JSON.
    pub fn get_json(&self, key: &str) -> Option<Value> {
        self.entries
            .lock()
            .get(key)
            .and_then(|record| serde_json::from_slice(&record.payload).ok())
    }
}

impl StateStore for MemoryStore {
    fn get(&self, key: &str) -> SimResult<Option<StoredState>> {
        Ok(self.entries.lock().get(key).cloned())
    }

    fn put(&self, key: &str, payload: &[u8], saved_at: SystemTime) -> SimResult<()> {
        self.entries.lock().insert(
            key.to_string(),
            StoredState {
                payload: payload.to_vec(),
                saved_at: Some(saved_at),
            },
        );
        Ok(())
    }

    fn delete(&self, key: &str) -> SimResult<()> {
        self.entries.lock().remove(key);
        Ok(())
    }

    fn keys(&self) -> SimResult<Vec<String>> {
        Ok(self.entries.lock().keys().cloned().collect())
    }
}

/// A store whose operations always fail; used to exercise the engine's
/// error suppression paths in tests.
#[derive(Clone, Default)]
pub struct BrokenStore;

impl StateStore for BrokenStore {
    fn get(&self, key: &str) -> SimResult<Option<StoredState>> {
        Err(CircuitError::Block {
            block: key.to_string(),
            message: "storage failure".into(),
        })
    }

    fn put(&self, key: &str, _payload: &[u8], _saved_at: SystemTime) -> SimResult<()> {
        Err(CircuitError::Block {
            block: key.to_string(),
            message: "storage failure".into(),
        })
    }

    fn delete(&self, _key: &str) -> SimResult<()> {
        Ok(())
    }

    fn keys(&self) -> SimResult<Vec<String>> {
        Ok(Vec::new())
    }
}
