use lcs_store::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("invalid message type: {0}")]
    InvalidMessageType(u8),

    #[error("message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: usize, max: usize },

    #[error("framing error: {0}")]
    FramingError(String),

    /// The payload decoded but does not have the shape its type requires,
    /// or did not decode at all.
    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    /// A DATA_REQUEST listed more hashes than this node serves at once.
    #[error("data request for {count} hashes exceeds limit of {max}")]
    DenialGuard { count: usize, max: usize },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type ProtocolResult<T> = Result<T, ProtocolError>;
