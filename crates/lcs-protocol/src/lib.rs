//! Wire protocol for the Ledger Cell Store.
//!
//! Messages carry cell payloads between nodes. This crate covers the frame
//! format, lazy decoding of received messages, id routing, and the
//! missing-data exchange (DATA_REQUEST / DATA) that lets a node fetch cells
//! it meets by hash but does not hold.
//!
//! Transport and scheduling live in `lcs-sync`.

pub mod codec;
pub mod config;
pub mod data;
pub mod error;
pub mod message;

pub use codec::{decode_cells, encode_cells, MessageCodec};
pub use config::ProtocolConfig;
pub use data::{apply_data_response, requested_hashes, serve_data_request, DataOutcome};
pub use error::{ProtocolError, ProtocolResult};
pub use message::{peek_body_len, peek_id, peek_type, Message, MessageType, ReturnHandler};
