//! Content-addressed cell storage for the Ledger Cell Store.
//!
//! Every piece of ledger data is a [`Cell`]: an immutable value with a
//! canonical byte encoding whose BLAKE3 digest is its identity. Small cells
//! are embedded directly into their parents; larger ones are referenced by
//! hash through a [`Ref`] and stored on their own.
//!
//! # Storage Backends
//!
//! All backends implement the [`CellStore`] trait:
//!
//! - [`MemoryStore`] -- `HashMap`-based store for tests and short sessions
//! - `DiskStore` in the `lcs-disk` crate -- durable single-file store
//!
//! # Design Rules
//!
//! 1. Cells are immutable; a "modified" value is a new cell with a new hash.
//! 2. Writes are idempotent and report whether they were the store's first
//!    write of a hash (novelty).
//! 3. Ref status is scoped to one store and never regresses.
//! 4. Reads are checked against the requested hash before decoding.
//! 5. A missing cell is always an immediate [`StoreError::MissingData`];
//!    fetching it from peers is a separate, explicit operation.

pub mod cache;
pub mod cell;
pub mod context;
pub mod encoding;
pub mod error;
pub mod memory;
pub mod persist;
pub mod reference;
pub mod traits;

// Re-export primary types at crate root for ergonomic imports.
pub use cache::{CacheConfig, DecodeCache};
pub use cell::{Blob, Cell, Value, MAX_AMOUNT, MAX_KEYWORD_LENGTH, MAX_VECTOR_COUNT};
pub use context::{current_store, with_store, StoreScope};
pub use encoding::MAX_EMBEDDED_LENGTH;
pub use error::{StoreError, StoreResult};
pub use memory::MemoryStore;
pub use persist::{announce, copy_cell, missing_children, persist, persist_shallow, Novelty};
pub use reference::{Ref, RefStatus};
pub use traits::{CellStore, StoreId};

pub use lcs_types::Hash;
