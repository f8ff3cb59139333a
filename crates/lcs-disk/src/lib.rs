//! Durable, file-backed cell store for the Ledger Cell Store.
//!
//! A [`DiskStore`] keeps every cell encoding in one append-only data file
//! with a fixed-location header holding the root pointer. Reopening the same
//! path recovers all completed writes and the last root set.
//!
//! # Crash Safety
//!
//! - Records are framed with a length and CRC32; a torn record at the tail
//!   is cut off on open and a corrupted one is skipped.
//! - The root pointer alternates between two checksummed header slots, so an
//!   interrupted update leaves the previous root readable.
//! - Records are synced before any root that may reference them.

pub mod config;
pub mod header;
pub mod record;
pub mod store;

pub use config::{DiskConfig, SyncMode};
pub use store::DiskStore;
