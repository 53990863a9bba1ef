use serde::{Serialize, Serializer};
use thiserror::Error;

/// Raised by the event builder and key deriver. Never retried: the producer
/// has to fix its input.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("event submitted without a {0}")]
    MissingField(&'static str),
    #[error("malformed logical timestamp: {0}")]
    MalformedTimestamp(String),
}

/// Store-level failures, affecting a whole write or read call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("transient store error, please retry: {0}")]
    Transient(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("store rejected the rows: {0}")]
    Rejected(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient(_))
    }
}

/// Terminal outcome of a single row that did not get acknowledged.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RowError {
    #[error("row rejected by the store: {0}")]
    Permanent(String),
    #[error("deadline exceeded before the row was acknowledged")]
    DeadlineExceeded,
}

impl RowError {
    pub fn reason(&self) -> &'static str {
        match self {
            RowError::Permanent(_) => "permanent",
            RowError::DeadlineExceeded => "deadline_exceeded",
        }
    }
}

impl Serialize for RowError {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

/// Categorically invalid ingest calls, rejected before touching the store.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IngestError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}
