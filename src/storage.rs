//! Value storage with time-based eviction.
//!
//! Stored values are opaque byte strings keyed by 160-bit digest. The store
//! evicts lazily: reads and writes cull anything older than the configured
//! TTL, so an abandoned value disappears the next time the store is touched.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;

use crate::constants::DEFAULT_STORAGE_TTL;
use crate::node::NodeId;

/// Backing store for DHT values.
///
/// A custom implementation can be injected into the server at construction;
/// the default is [`MemoryStorage`]. Reads take `&mut self` because stores
/// evict lazily on access.
pub trait Storage: Send {
    /// Stores `value` under `key`, replacing any prior entry and refreshing
    /// its age.
    fn set(&mut self, key: NodeId, value: Bytes);

    /// Returns the stored value, if present and not expired.
    fn get(&mut self, key: &NodeId) -> Option<Bytes>;

    /// Entries whose last write is older than `age`, oldest first.
    fn items_older_than(&mut self, age: Duration) -> Vec<(NodeId, Bytes)>;

    /// All live entries, oldest first.
    fn items(&mut self) -> Vec<(NodeId, Bytes)>;
}

pub type SharedStorage = Arc<Mutex<Box<dyn Storage>>>;

struct Entry {
    key: NodeId,
    stored_at: Instant,
    value: Bytes,
}

/// In-memory TTL store.
///
/// Entries are kept in write order; overwriting a key re-inserts it at the
/// tail, so iteration always yields oldest writes first.
pub struct MemoryStorage {
    ttl: Duration,
    entries: Vec<Entry>,
}

impl MemoryStorage {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Vec::new(),
        }
    }

    fn cull(&mut self) {
        let now = Instant::now();
        let ttl = self.ttl;
        self.entries
            .retain(|e| now.duration_since(e.stored_at) < ttl);
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new(DEFAULT_STORAGE_TTL)
    }
}

impl Storage for MemoryStorage {
    fn set(&mut self, key: NodeId, value: Bytes) {
        self.entries.retain(|e| e.key != key);
        self.entries.push(Entry {
            key,
            stored_at: Instant::now(),
            value,
        });
        self.cull();
    }

    fn get(&mut self, key: &NodeId) -> Option<Bytes> {
        self.cull();
        self.entries
            .iter()
            .find(|e| &e.key == key)
            .map(|e| e.value.clone())
    }

    fn items_older_than(&mut self, age: Duration) -> Vec<(NodeId, Bytes)> {
        let now = Instant::now();
        self.entries
            .iter()
            .filter(|e| now.duration_since(e.stored_at) > age)
            .map(|e| (e.key, e.value.clone()))
            .collect()
    }

    fn items(&mut self) -> Vec<(NodeId, Bytes)> {
        self.cull();
        self.entries
            .iter()
            .map(|e| (e.key, e.value.clone()))
            .collect()
    }
}
