use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use lcs_types::Hash;

use crate::cell::Cell;
use crate::context;
use crate::error::{StoreError, StoreResult};
use crate::traits::{CellStore, StoreId};

/// How far a ref's cell is known to have been written into a given store.
///
/// Ordered: a later variant implies everything an earlier one does.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum RefStatus {
    /// Nothing is known about this cell in the store.
    Unknown = 0,
    /// The cell's own encoding is in the store; children are unchecked.
    Stored = 1,
    /// The cell and its whole non-embedded subgraph are in the store.
    Persisted = 2,
    /// Persisted, and already reported through an announce.
    Announced = 3,
}

impl RefStatus {
    fn from_bits(bits: u8) -> Self {
        match bits {
            1 => Self::Stored,
            2 => Self::Persisted,
            3 => Self::Announced,
            _ => Self::Unknown,
        }
    }
}

const STATUS_BITS: u32 = 8;
const STATUS_MASK: u64 = (1 << STATUS_BITS) - 1;

fn pack(store: StoreId, status: RefStatus) -> u64 {
    (store.as_u64() << STATUS_BITS) | status as u64
}

struct RefInner {
    hash: OnceLock<Hash>,
    cell: OnceLock<Cell>,
    // Store id in the high bits, status in the low byte.
    state: AtomicU64,
}

/// Handle to exactly one cell, held directly or by hash only.
///
/// Clones share resolution and status. Status is tracked per store: a ref
/// persisted into one store reports [`RefStatus::Unknown`] for any other.
#[derive(Clone)]
pub struct Ref(Arc<RefInner>);

impl Ref {
    /// A resolved ref holding `cell`.
    pub fn new(cell: Cell) -> Self {
        Self(Arc::new(RefInner {
            hash: OnceLock::new(),
            cell: OnceLock::from(cell),
            state: AtomicU64::new(0),
        }))
    }

    /// An unresolved ref naming a cell only by hash.
    pub fn for_hash(hash: Hash) -> Self {
        Self(Arc::new(RefInner {
            hash: OnceLock::from(hash),
            cell: OnceLock::new(),
            state: AtomicU64::new(0),
        }))
    }

    pub fn hash(&self) -> Hash {
        if let Some(hash) = self.0.hash.get() {
            return *hash;
        }
        // Every constructor fills one of the two slots.
        let cell = self.0.cell.get();
        *self.0.hash.get_or_init(|| cell.map_or_else(Hash::null, Cell::hash))
    }

    pub fn is_resolved(&self) -> bool {
        self.0.cell.get().is_some()
    }

    /// The cell, if it is already in memory.
    pub fn cell(&self) -> Option<&Cell> {
        self.0.cell.get()
    }

    /// Whether the target is known to be embedded. Unresolved refs only ever
    /// name non-embedded cells.
    pub fn is_embedded(&self) -> bool {
        self.cell().is_some_and(Cell::is_embedded)
    }

    /// Attach the cell this ref names. Fails if `cell` hashes differently;
    /// attaching to an already resolved ref is a no-op.
    pub fn resolve(&self, cell: Cell) -> StoreResult<&Cell> {
        if let Some(existing) = self.0.cell.get() {
            return Ok(existing);
        }
        let computed = cell.hash();
        let expected = self.hash();
        if computed != expected {
            return Err(StoreError::HashMismatch { expected, computed });
        }
        Ok(self.0.cell.get_or_init(|| cell))
    }

    /// The target cell, resolving it from `store` if needed.
    pub fn value_in<S: CellStore + ?Sized>(&self, store: &S) -> StoreResult<Cell> {
        if let Some(cell) = self.0.cell.get() {
            return Ok(cell.clone());
        }
        let hash = self.hash();
        match store.read_cell(&hash)? {
            Some(cell) => self.resolve(cell).cloned(),
            None => Err(StoreError::MissingData(hash)),
        }
    }

    /// The target cell, resolving it from the current store if needed.
    ///
    /// Never blocks on the network: a cell missing locally is `MissingData`.
    pub fn value(&self) -> StoreResult<Cell> {
        if let Some(cell) = self.0.cell.get() {
            return Ok(cell.clone());
        }
        match context::current_store() {
            Some(store) => self.value_in(store.as_ref()),
            None => Err(StoreError::MissingData(self.hash())),
        }
    }

    /// Status with respect to `store`.
    pub fn status_in(&self, store: StoreId) -> RefStatus {
        let state = self.0.state.load(Ordering::Acquire);
        if state >> STATUS_BITS == store.as_u64() {
            RefStatus::from_bits((state & STATUS_MASK) as u8)
        } else {
            RefStatus::Unknown
        }
    }

    /// Status with respect to the current store.
    pub fn status(&self) -> RefStatus {
        context::current_store().map_or(RefStatus::Unknown, |s| self.status_in(s.id()))
    }

    /// Raise the status for `store` to at least `status`. Never lowers it.
    /// Returns the status held before the call.
    pub fn advance(&self, store: StoreId, status: RefStatus) -> RefStatus {
        let mut current = self.0.state.load(Ordering::Acquire);
        loop {
            let previous = if current >> STATUS_BITS == store.as_u64() {
                RefStatus::from_bits((current & STATUS_MASK) as u8)
            } else {
                RefStatus::Unknown
            };
            if previous >= status {
                return previous;
            }
            match self.0.state.compare_exchange_weak(
                current,
                pack(store, status),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return previous,
                Err(actual) => current = actual,
            }
        }
    }

    /// Write this cell's own encoding into the current store.
    pub fn persist_shallow(&self) -> StoreResult<Ref> {
        let store = context::require_current_store()?;
        crate::persist::persist_shallow(store.as_ref(), self, None)
    }

    /// Write this cell and its whole subgraph into the current store.
    pub fn persist(&self) -> StoreResult<Ref> {
        let store = context::require_current_store()?;
        crate::persist::persist(store.as_ref(), self, None)
    }
}

impl From<Cell> for Ref {
    fn from(cell: Cell) -> Self {
        Ref::new(cell)
    }
}

impl PartialEq for Ref {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0) || self.hash() == other.hash()
    }
}

impl Eq for Ref {}

impl std::hash::Hash for Ref {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        std::hash::Hash::hash(&Ref::hash(self), state);
    }
}

impl fmt::Debug for Ref {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.cell() {
            Some(cell) if cell.is_embedded() => write!(f, "{cell:?}"),
            _ => write!(f, "Ref({})", self.hash().short_hex()),
        }
    }
}
