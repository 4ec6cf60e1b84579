//! Admission tracker error types

use thiserror::Error;

/// Errors that can occur while tracking active queries
#[derive(Error, Debug)]
pub enum TrackerError {
    /// Creating, sizing or mapping the active query file failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// An entry could not be serialized
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The tracker needs room for at least one query
    #[error("Invalid capacity: {0}")]
    InvalidCapacity(usize),

    /// The tracker stopped admitting queries
    #[error("Active query tracker is closed")]
    Closed,

    /// A permit was granted but no slot was free
    #[error("No free slot for admitted query")]
    NoFreeSlot,

    /// Lock acquisition failed
    #[error("Lock error: {0}")]
    Lock(String),
}

/// Result type alias for tracker operations
pub type TrackerResult<T> = Result<T, TrackerError>;
