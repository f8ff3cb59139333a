use lcs_protocol::ProtocolError;
use lcs_store::StoreError;
use lcs_types::Hash;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    /// Acquisition did not finish in time. Cells fetched so far stay stored.
    #[error("timed out after {timeout_ms} ms acquiring {hash}")]
    Timeout { hash: Hash, timeout_ms: u64 },

    #[error("connection closed")]
    ConnectionClosed,

    /// A request with this id is already waiting for its reply.
    #[error("request {0} is already pending")]
    DuplicateRequest(i64),

    #[error("reply {actual:?} does not answer request {expected}")]
    UnexpectedReply { expected: i64, actual: Option<i64> },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type SyncResult<T> = Result<T, SyncError>;
