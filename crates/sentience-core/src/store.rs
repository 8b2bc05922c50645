//! Persistence: key/record storage for snapshots, counters and insights.
//!
//! Keys are stable strings namespaced per session by [`StoreKeys`]. Records are JSON.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use uuid::Uuid;

use crate::error::{SentienceError, SentienceResult};

const TREE_NAME: &str = "sentience";
/// Entries held in `SledStore`'s read cache; further keys are read through from sled.
const CACHE_CAPACITY: usize = 256;
const OPEN_RETRIES: u32 = 40;
const OPEN_RETRY_DELAY: Duration = Duration::from_millis(50);

/// Byte-level store. `load` fails with `NotFound` for absent keys and with
/// `PersistenceUnavailable` when the backing storage cannot be reached.
pub trait PersistenceStore: Send + Sync {
    fn save(&self, key: &str, value: &[u8]) -> SentienceResult<()>;

    fn load(&self, key: &str) -> SentienceResult<Vec<u8>>;

    /// Keys starting with `prefix`, in key order.
    fn scan_prefix(&self, prefix: &str) -> SentienceResult<Vec<String>>;

    /// Deletes `key`. Absent keys are not an error.
    fn remove(&self, key: &str) -> SentienceResult<()>;

    fn flush(&self) -> SentienceResult<()> {
        Ok(())
    }
}

pub fn save_json<T: Serialize + ?Sized>(store: &dyn PersistenceStore, key: &str, value: &T) -> SentienceResult<()> {
    let bytes = serde_json::to_vec(value)?;
    store.save(key, &bytes)
}

pub fn load_json<T: DeserializeOwned>(store: &dyn PersistenceStore, key: &str) -> SentienceResult<T> {
    let bytes = store.load(key)?;
    Ok(serde_json::from_slice(&bytes)?)
}

/// Like [`load_json`] but maps `NotFound` to `None`.
pub fn load_json_opt<T: DeserializeOwned>(store: &dyn PersistenceStore, key: &str) -> SentienceResult<Option<T>> {
    match load_json(store, key) {
        Ok(v) => Ok(Some(v)),
        Err(SentienceError::NotFound(_)) => Ok(None),
        Err(e) => Err(e),
    }
}

// ---------------------------------------------------------------------------
// Key namespaces
// ---------------------------------------------------------------------------

/// Key layout for one logical session: `{session}/{block}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreKeys {
    session: String,
}

impl StoreKeys {
    pub fn new(session: &str) -> Self {
        let session = session.trim().replace('/', "_");
        let session = if session.is_empty() { "default".to_string() } else { session };
        Self { session }
    }

    pub fn session(&self) -> &str {
        &self.session
    }

    pub fn affect(&self) -> String {
        format!("{}/affect/snapshot", self.session)
    }

    pub fn timeline(&self) -> String {
        format!("{}/affect/timeline", self.session)
    }

    pub fn agent_state(&self) -> String {
        format!("{}/agent/state", self.session)
    }

    pub fn breaker(&self) -> String {
        format!("{}/gateway/breaker", self.session)
    }

    pub fn relationship(&self) -> String {
        format!("{}/relationship", self.session)
    }

    pub fn proactive(&self) -> String {
        format!("{}/proactive", self.session)
    }

    pub fn commitments(&self) -> String {
        format!("{}/commitments", self.session)
    }

    pub fn insights_prefix(&self) -> String {
        format!("{}/insights/", self.session)
    }

    /// Zero-padded creation time first, so key order is creation order.
    pub fn insight(&self, created_at: DateTime<Utc>, id: Uuid) -> String {
        format!("{}{:020}-{}", self.insights_prefix(), created_at.timestamp_millis().max(0), id)
    }
}

// ---------------------------------------------------------------------------
// Sled-backed store
// ---------------------------------------------------------------------------

/// Sled tree with a DashMap hot cache in front of it.
pub struct SledStore {
    db: sled::Db,
    tree: sled::Tree,
    cache: Arc<DashMap<String, Vec<u8>>>,
}

impl SledStore {
    /// Opens or creates the database at `path`.
    ///
    /// A previous handle on the same path may still hold the file lock while its background
    /// flusher winds down; opening retries for a bounded time before giving up.
    pub fn open_path<P: AsRef<Path>>(path: P) -> SentienceResult<Self> {
        let path = path.as_ref();
        let mut attempt = 0;
        let db = loop {
            match sled::open(path) {
                Ok(db) => break db,
                Err(sled::Error::Io(e)) if is_lock_contention(&e) && attempt < OPEN_RETRIES => {
                    attempt += 1;
                    tracing::debug!(target: "sentience::store", path = %path.display(), attempt, "store locked; retrying");
                    std::thread::sleep(OPEN_RETRY_DELAY);
                }
                Err(e) => return Err(e.into()),
            }
        };
        let tree = db.open_tree(TREE_NAME)?;
        Ok(Self {
            db,
            tree,
            cache: Arc::new(DashMap::new()),
        })
    }

    fn cache_put(&self, key: &str, value: &[u8]) {
        if self.cache.len() < CACHE_CAPACITY || self.cache.contains_key(key) {
            self.cache.insert(key.to_string(), value.to_vec());
        }
    }
}

fn is_lock_contention(err: &std::io::Error) -> bool {
    err.kind() == std::io::ErrorKind::WouldBlock || err.to_string().contains("could not acquire lock")
}

impl PersistenceStore for SledStore {
    fn save(&self, key: &str, value: &[u8]) -> SentienceResult<()> {
        self.tree.insert(key.as_bytes(), value)?;
        self.cache_put(key, value);
        tracing::trace!(target: "sentience::store", key, bytes = value.len(), "record saved");
        Ok(())
    }

    fn load(&self, key: &str) -> SentienceResult<Vec<u8>> {
        if let Some(v) = self.cache.get(key) {
            return Ok(v.clone());
        }
        match self.tree.get(key.as_bytes())? {
            Some(iv) => {
                let bytes = iv.to_vec();
                self.cache_put(key, &bytes);
                Ok(bytes)
            }
            None => Err(SentienceError::NotFound(key.to_string())),
        }
    }

    fn scan_prefix(&self, prefix: &str) -> SentienceResult<Vec<String>> {
        let mut keys = Vec::new();
        for item in self.tree.scan_prefix(prefix.as_bytes()).keys() {
            let k = item?;
            if let Ok(key) = String::from_utf8(k.to_vec()) {
                keys.push(key);
            }
        }
        Ok(keys)
    }

    fn remove(&self, key: &str) -> SentienceResult<()> {
        self.tree.remove(key.as_bytes())?;
        self.cache.remove(key);
        Ok(())
    }

    fn flush(&self) -> SentienceResult<()> {
        self.db.flush()?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// In-memory store
// ---------------------------------------------------------------------------

/// Volatile store for tests and ephemeral sessions. Can simulate an outage.
#[derive(Default)]
pub struct MemoryStore {
    records: DashMap<String, Vec<u8>>,
    unavailable: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// While unavailable, every operation fails with `PersistenceUnavailable`.
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn check(&self) -> SentienceResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(SentienceError::PersistenceUnavailable("memory store offline".to_string()))
        } else {
            Ok(())
        }
    }
}

impl PersistenceStore for MemoryStore {
    fn save(&self, key: &str, value: &[u8]) -> SentienceResult<()> {
        self.check()?;
        self.records.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn load(&self, key: &str) -> SentienceResult<Vec<u8>> {
        self.check()?;
        self.records
            .get(key)
            .map(|v| v.clone())
            .ok_or_else(|| SentienceError::NotFound(key.to_string()))
    }

    fn scan_prefix(&self, prefix: &str) -> SentienceResult<Vec<String>> {
        self.check()?;
        let mut keys: Vec<String> = self
            .records
            .iter()
            .filter(|e| e.key().starts_with(prefix))
            .map(|e| e.key().clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    fn remove(&self, key: &str) -> SentienceResult<()> {
        self.check()?;
        self.records.remove(key);
        Ok(())
    }
}
