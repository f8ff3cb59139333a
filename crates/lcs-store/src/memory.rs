use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::RwLock;

use lcs_types::Hash;
use tracing::debug;

use crate::cache::{CacheConfig, DecodeCache};
use crate::error::StoreResult;
use crate::traits::{CellStore, StoreId};

/// In-memory, HashMap-based cell store.
///
/// Intended for tests and short-lived sessions. Encodings are held behind a
/// `RwLock` for safe concurrent access; nothing survives the process.
pub struct MemoryStore {
    id: StoreId,
    encodings: RwLock<HashMap<Hash, Vec<u8>>>,
    root: RwLock<Option<Hash>>,
    cache: DecodeCache,
}

impl MemoryStore {
    /// Create a new empty in-memory store.
    pub fn new() -> Self {
        Self::with_cache_config(&CacheConfig::default())
    }

    pub fn with_cache_config(config: &CacheConfig) -> Self {
        Self {
            id: StoreId::next(),
            encodings: RwLock::new(HashMap::new()),
            root: RwLock::new(None),
            cache: DecodeCache::new(config),
        }
    }

    /// Number of encodings currently stored.
    pub fn len(&self) -> usize {
        self.encodings.read().expect("lock poisoned").len()
    }

    /// Returns `true` if the store is empty.
    pub fn is_empty(&self) -> bool {
        self.encodings.read().expect("lock poisoned").is_empty()
    }

    /// Total bytes across all stored encodings.
    pub fn total_bytes(&self) -> u64 {
        self.encodings
            .read()
            .expect("lock poisoned")
            .values()
            .map(|e| e.len() as u64)
            .sum()
    }

    /// Return a sorted list of all stored hashes.
    pub fn all_hashes(&self) -> Vec<Hash> {
        let map = self.encodings.read().expect("lock poisoned");
        let mut hashes: Vec<Hash> = map.keys().copied().collect();
        hashes.sort();
        hashes
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CellStore for MemoryStore {
    fn id(&self) -> StoreId {
        self.id
    }

    fn read_encoding(&self, hash: &Hash) -> StoreResult<Option<Vec<u8>>> {
        let map = self.encodings.read().expect("lock poisoned");
        Ok(map.get(hash).cloned())
    }

    fn write_encoding(&self, hash: &Hash, encoding: &[u8]) -> StoreResult<bool> {
        let mut map = self.encodings.write().expect("lock poisoned");
        match map.entry(*hash) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(slot) => {
                slot.insert(encoding.to_vec());
                debug!(hash = %hash.short_hex(), len = encoding.len(), "stored cell");
                Ok(true)
            }
        }
    }

    fn contains(&self, hash: &Hash) -> StoreResult<bool> {
        let map = self.encodings.read().expect("lock poisoned");
        Ok(map.contains_key(hash))
    }

    fn root_hash(&self) -> StoreResult<Option<Hash>> {
        Ok(*self.root.read().expect("lock poisoned"))
    }

    fn set_root_hash(&self, hash: &Hash) -> StoreResult<()> {
        *self.root.write().expect("lock poisoned") = Some(*hash);
        Ok(())
    }

    fn cache(&self) -> &DecodeCache {
        &self.cache
    }
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let count = self.len();
        f.debug_struct("MemoryStore")
            .field("id", &self.id)
            .field("cell_count", &count)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cell::Cell;
    use crate::error::StoreError;
    use std::sync::Arc;
    use std::thread;

    // -----------------------------------------------------------------------
    // Raw encodings
    // -----------------------------------------------------------------------

    #[test]
    fn write_reports_first_write_only() {
        let store = MemoryStore::new();
        let cell = Cell::string("hello world");
        assert!(store.write_encoding(&cell.hash(), cell.encoding()).unwrap());
        assert!(!store.write_encoding(&cell.hash(), cell.encoding()).unwrap());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn read_missing_returns_none() {
        let store = MemoryStore::new();
        assert!(store.read_encoding(&Hash::of(b"nope")).unwrap().is_none());
        assert!(store.read_cell(&Hash::of(b"nope")).unwrap().is_none());
        assert!(!store.contains(&Hash::of(b"nope")).unwrap());
    }

    #[test]
    fn total_bytes_and_hashes() {
        let store = MemoryStore::new();
        let a = Cell::blob(vec![0u8; 10]);
        let b = Cell::blob(vec![1u8; 20]);
        store.write_cell(&a).unwrap();
        store.write_cell(&b).unwrap();
        assert_eq!(store.total_bytes(), (a.encoding_length() + b.encoding_length()) as u64);
        let hashes = store.all_hashes();
        assert_eq!(hashes.len(), 2);
        assert!(hashes.windows(2).all(|w| w[0] <= w[1]));
    }

    // -----------------------------------------------------------------------
    // Decoding and caching
    // -----------------------------------------------------------------------

    #[test]
    fn repeated_reads_share_one_instance() {
        let store = MemoryStore::new();
        let cell = Cell::string("x".repeat(300));
        let hash = cell.hash();
        store.write_encoding(&hash, cell.encoding()).unwrap();
        drop(cell);

        let first = store.read_cell(&hash).unwrap().unwrap();
        let second = store.read_cell(&hash).unwrap().unwrap();
        assert!(Cell::ptr_eq(&first, &second));
    }

    #[test]
    fn read_detects_wrong_bytes() {
        let store = MemoryStore::new();
        let claimed = Hash::of(b"something else");
        store
            .write_encoding(&claimed, Cell::integer(1).encoding())
            .unwrap();
        assert!(matches!(
            store.read_cell(&claimed),
            Err(StoreError::HashMismatch { .. })
        ));
    }

    #[test]
    fn read_reports_undecodable_bytes() {
        let store = MemoryStore::new();
        let bytes = [0x7Fu8];
        store.write_encoding(&Hash::of(&bytes), &bytes).unwrap();
        assert!(matches!(
            store.read_cell(&Hash::of(&bytes)),
            Err(StoreError::BadFormat { .. })
        ));
    }

    // -----------------------------------------------------------------------
    // Root
    // -----------------------------------------------------------------------

    #[test]
    fn root_starts_empty() {
        let store = MemoryStore::new();
        assert!(store.root_hash().unwrap().is_none());
        assert!(store.root().unwrap().is_none());
    }

    #[test]
    fn set_root_persists_and_reads_back() {
        let store = MemoryStore::new();
        store.set_root(&Cell::integer(1)).unwrap();
        assert_eq!(store.root().unwrap().unwrap().as_integer(), Some(1));
    }

    #[test]
    fn root_hash_without_cell_is_missing_data() {
        let store = MemoryStore::new();
        store.set_root_hash(&Hash::of(b"ghost")).unwrap();
        assert!(matches!(store.root(), Err(StoreError::MissingData(_))));
    }

    // -----------------------------------------------------------------------
    // Batch and concurrency
    // -----------------------------------------------------------------------

    #[test]
    fn batch_write_and_read() {
        let store = MemoryStore::new();
        let cells: Vec<Cell> = (0..5).map(Cell::integer).collect();
        let fresh = store.write_batch(&cells).unwrap();
        assert!(fresh.iter().all(|f| *f));

        let mut hashes: Vec<Hash> = cells.iter().map(Cell::hash).collect();
        hashes.push(Hash::of(b"absent"));
        let read = store.read_batch(&hashes).unwrap();
        assert_eq!(read.len(), 6);
        assert!(read[..5].iter().all(Option::is_some));
        assert!(read[5].is_none());
    }

    #[test]
    fn concurrent_writers_of_one_hash_see_one_novelty() {
        let store = Arc::new(MemoryStore::new());
        let cell = Cell::string("y".repeat(200));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = Arc::clone(&store);
                let cell = cell.clone();
                thread::spawn(move || store.write_cell(&cell).unwrap())
            })
            .collect();
        let fresh = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|f| *f)
            .count();
        assert_eq!(fresh, 1);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn stores_have_distinct_ids() {
        assert_ne!(MemoryStore::new().id(), MemoryStore::new().id());
    }
}
