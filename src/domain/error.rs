//! Error types for the indexing and selection core.

use thiserror::Error;

use super::cell::OutPoint;

/// Errors raised by the cursor, cell store, sync engine and coin selector.
#[derive(Error, Debug)]
pub enum IndexerError {
    /// Block parent hash does not match the indexed head.
    #[error(
        "Reorg detected at block {number}: expected parent {}, got {}",
        short_hex(.expected),
        short_hex(.actual)
    )]
    ReorgDetected {
        number: u64,
        expected: [u8; 32],
        actual: [u8; 32],
    },

    /// Undo history no longer reaches the requested height.
    #[error("Cannot roll back to block {target}: undo history starts at {oldest:?}")]
    RollbackTooDeep { target: u64, oldest: Option<u64> },

    /// Index does not agree with the chain (missed block or corruption).
    #[error("Inconsistent index state: {0}")]
    InconsistentState(String),

    /// Not enough unreserved capacity for the requested amount.
    #[error(
        "Insufficient funds: need {required} shannons, {available} available ({reserved} reserved)"
    )]
    InsufficientFunds {
        required: u64,
        available: u64,
        reserved: u64,
    },

    /// A node fetch did not finish in time.
    #[error("Timed out after {timeout_ms}ms fetching {what}")]
    FetchTimeout { what: String, timeout_ms: u64 },

    /// A node fetch returned an error.
    #[error("Failed to fetch {what}: {reason}")]
    FetchFailed { what: String, reason: String },

    /// A reservation expired and its cells were claimed by another selection.
    #[error("Reservation {token} lost cell {out_point}")]
    ReservationConflict { token: u64, out_point: OutPoint },

    /// The store was synced with a different index scope.
    #[error("Store indexes {stored}, not {requested}; run `reset` to reindex")]
    ScopeMismatch { stored: String, requested: String },

    /// Malformed data received from the node.
    #[error("Invalid data: {0}")]
    InvalidData(String),

    /// LMDB error.
    #[error("Storage error: {0}")]
    Storage(#[from] heed::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl IndexerError {
    /// Whether the error stops the sync engine and requires intervention.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            IndexerError::RollbackTooDeep { .. }
                | IndexerError::InconsistentState(_)
                | IndexerError::ScopeMismatch { .. }
                | IndexerError::InvalidData(_)
                | IndexerError::Storage(_)
                | IndexerError::Io(_)
                | IndexerError::FetchTimeout { .. }
                | IndexerError::FetchFailed { .. }
        )
    }

    /// Whether a fetch may succeed if attempted again.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            IndexerError::FetchTimeout { .. } | IndexerError::FetchFailed { .. }
        )
    }
}

/// Result type for indexer operations.
pub type IndexerResult<T> = Result<T, IndexerError>;

/// First 8 bytes of a hash as hex, for log and error messages.
pub fn short_hex(hash: &[u8; 32]) -> String {
    hex::encode(&hash[..8])
}
