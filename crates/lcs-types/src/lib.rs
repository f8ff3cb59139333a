//! Foundation types for the Ledger Cell Store (LCS).
//!
//! Every other LCS crate depends on `lcs-types`. The crate is small: the
//! only thing all layers agree on is how a cell is named.
//!
//! # Key Types
//!
//! - [`Hash`] -- 32-byte BLAKE3 digest of a cell's canonical encoding
//! - [`TypeError`] -- parse failures for textual hash forms

pub mod error;
pub mod hash;

pub use error::TypeError;
pub use hash::{Hash, HASH_LENGTH};
