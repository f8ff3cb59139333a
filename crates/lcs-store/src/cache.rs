use std::collections::HashMap;
use std::sync::Mutex;

use lcs_types::Hash;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::cell::{Cell, WeakCell};

/// Configuration for a store's [`DecodeCache`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Entry count above which dead entries are swept (default: 65 536).
    pub capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { capacity: 65_536 }
    }
}

/// Hash-consing table from hash to the live decoded cell.
///
/// Entries are weak: the cache never keeps a cell alive on its own, so it
/// costs nothing under memory pressure and a miss simply means decoding
/// again from the store.
pub struct DecodeCache {
    entries: Mutex<HashMap<Hash, WeakCell>>,
    capacity: usize,
}

impl DecodeCache {
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            capacity: config.capacity.max(1),
        }
    }

    /// The live cell for `hash`, if any.
    pub fn get(&self, hash: &Hash) -> Option<Cell> {
        let entries = self.entries.lock().expect("cache lock poisoned");
        entries.get(hash).and_then(WeakCell::upgrade)
    }

    /// Canonicalize `cell`: returns the already-live cell with the same hash
    /// if there is one, otherwise records `cell` and returns it.
    pub fn intern(&self, cell: Cell) -> Cell {
        let hash = cell.hash();
        let mut entries = self.entries.lock().expect("cache lock poisoned");
        if let Some(existing) = entries.get(&hash).and_then(WeakCell::upgrade) {
            return existing;
        }
        entries.insert(hash, cell.downgrade());
        if entries.len() > self.capacity {
            let before = entries.len();
            entries.retain(|_, weak| weak.is_live());
            if entries.len() > self.capacity {
                // Everything left is live; start over rather than grow unbounded.
                entries.clear();
                entries.insert(hash, cell.downgrade());
            }
            debug!(before, after = entries.len(), "swept decode cache");
        }
        cell
    }

    /// Number of entries, live or not yet swept.
    pub fn len(&self) -> usize {
        self.entries.lock().expect("cache lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.entries.lock().expect("cache lock poisoned").clear();
    }
}

impl Default for DecodeCache {
    fn default() -> Self {
        Self::new(&CacheConfig::default())
    }
}

impl std::fmt::Debug for DecodeCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecodeCache")
            .field("entries", &self.len())
            .field("capacity", &self.capacity)
            .finish()
    }
}
