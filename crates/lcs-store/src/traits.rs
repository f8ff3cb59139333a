use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use lcs_types::Hash;

use crate::cache::DecodeCache;
use crate::cell::Cell;
use crate::error::{StoreError, StoreResult};
use crate::persist;
use crate::reference::Ref;

/// Process-unique identity of a store instance, used to scope ref status.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StoreId(u64);

impl StoreId {
    /// Allocate a fresh id. Ids are never reused within a process.
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for StoreId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StoreId({})", self.0)
    }
}

/// Content-addressed cell store.
///
/// All implementations must satisfy these invariants:
/// - Entries are immutable once written. Writing the same hash twice is a
///   no-op, and two concurrent writers of one hash observe a single first write.
/// - Reads and writes of distinct hashes are safely concurrent.
/// - The store never interprets encodings; decoding happens in the provided
///   methods, which check every read against the requested hash.
/// - All I/O errors are propagated, never silently ignored.
pub trait CellStore: Send + Sync {
    /// Identity used to scope [`Ref`] status to this store.
    fn id(&self) -> StoreId;

    /// Raw encoding stored under `hash`, or `Ok(None)` if absent.
    fn read_encoding(&self, hash: &Hash) -> StoreResult<Option<Vec<u8>>>;

    /// Store `encoding` under `hash`.
    ///
    /// Returns `true` only for the call that first wrote this hash into the
    /// store; this is the novelty signal.
    fn write_encoding(&self, hash: &Hash, encoding: &[u8]) -> StoreResult<bool>;

    /// Check whether an encoding exists for `hash`.
    fn contains(&self, hash: &Hash) -> StoreResult<bool>;

    /// Hash of the root cell, if a root has been set.
    fn root_hash(&self) -> StoreResult<Option<Hash>>;

    /// Record `hash` as the root. Callers go through [`CellStore::set_root`],
    /// which makes sure the whole root graph is present first.
    fn set_root_hash(&self, hash: &Hash) -> StoreResult<()>;

    /// Decoded-cell cache for this store.
    fn cache(&self) -> &DecodeCache;

    /// Make all completed writes durable. No-op for volatile stores.
    fn flush(&self) -> StoreResult<()> {
        Ok(())
    }

    /// Read and decode the cell stored under `hash`.
    ///
    /// Repeated reads of a hash return the same in-memory cell while it is
    /// alive elsewhere.
    fn read_cell(&self, hash: &Hash) -> StoreResult<Option<Cell>> {
        if let Some(cell) = self.cache().get(hash) {
            return Ok(Some(cell));
        }
        let Some(bytes) = self.read_encoding(hash)? else {
            return Ok(None);
        };
        let computed = Hash::of(&bytes);
        if computed != *hash {
            return Err(StoreError::HashMismatch {
                expected: *hash,
                computed,
            });
        }
        let cell = Cell::decode(&bytes)?;
        Ok(Some(self.cache().intern(cell)))
    }

    /// Write one cell's own encoding. Returns `true` if it was new.
    fn write_cell(&self, cell: &Cell) -> StoreResult<bool> {
        let fresh = self.write_encoding(&cell.hash(), cell.encoding())?;
        self.cache().intern(cell.clone());
        Ok(fresh)
    }

    /// Read multiple cells in a batch.
    ///
    /// Default implementation calls `read_cell()` for each hash. Backends may
    /// override for better performance (e.g., fewer I/O round-trips).
    fn read_batch(&self, hashes: &[Hash]) -> StoreResult<Vec<Option<Cell>>> {
        hashes.iter().map(|h| self.read_cell(h)).collect()
    }

    /// Write multiple cells in a batch, returning which were new.
    ///
    /// Default implementation calls `write_cell()` for each cell. Backends may
    /// override for better performance (e.g., single fsync).
    fn write_batch(&self, cells: &[Cell]) -> StoreResult<Vec<bool>> {
        cells.iter().map(|c| self.write_cell(c)).collect()
    }

    /// The root cell, or `Ok(None)` if no root was ever set.
    fn root(&self) -> StoreResult<Option<Cell>> {
        match self.root_hash()? {
            Some(hash) => self
                .read_cell(&hash)?
                .map(Some)
                .ok_or(StoreError::MissingData(hash)),
            None => Ok(None),
        }
    }

    /// Fully persist `cell` into this store, then make it the root.
    fn set_root(&self, cell: &Cell) -> StoreResult<Ref> {
        let root = persist::persist(self, &Ref::new(cell.clone()), None)?;
        self.set_root_hash(&root.hash())?;
        Ok(root)
    }
}
