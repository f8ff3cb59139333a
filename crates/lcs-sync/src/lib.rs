//! Network-bound acquisition of cells for the Ledger Cell Store.
//!
//! Local reads never wait on the network: a missing cell is a
//! `MissingData` error. Fetching it is an explicit, timeout-bounded
//! [`Acquirer::acquire`] call layered on a [`DataSource`], which may be a
//! [`PeerConnection`] to a remote node or a [`LocalPeer`] in the same
//! process.

pub mod acquire;
pub mod config;
pub mod connection;
pub mod error;
pub mod transport;

pub use acquire::Acquirer;
pub use config::{NodeConfig, StoreConfig, SyncConfig};
pub use connection::{spawn_link, PeerConnection};
pub use error::{SyncError, SyncResult};
pub use transport::{DataSource, LocalPeer};
