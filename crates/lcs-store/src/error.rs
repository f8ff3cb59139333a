use lcs_types::Hash;

/// Errors from cell construction, decoding and store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// A value cannot be represented as a cell (out-of-range amount,
    /// oversized vector, empty keyword, ...).
    #[error("format error: {0}")]
    Format(String),

    /// Encoded bytes do not form a valid canonical encoding.
    #[error("bad format at offset {offset}: {reason}")]
    BadFormat { offset: usize, reason: String },

    /// A cell needed to complete the operation is not available locally.
    #[error("missing data: {0}")]
    MissingData(Hash),

    /// Bytes read back from a store do not hash to the key they were stored under.
    #[error("hash mismatch: expected {expected}, computed {computed}")]
    HashMismatch { expected: Hash, computed: Hash },

    /// The backing medium holds data that cannot be interpreted.
    #[error("corrupt store: {0}")]
    Corrupt(String),

    /// I/O error from the underlying storage backend.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// An operation on the current store ran with no store in scope.
    #[error("no current store")]
    NoCurrentStore,

    /// The store has been closed.
    #[error("store is closed")]
    Closed,
}

impl StoreError {
    /// Whether this error reports malformed input rather than a local failure.
    pub fn is_format_error(&self) -> bool {
        matches!(self, Self::Format(_) | Self::BadFormat { .. })
    }
}

/// Result alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;
