//! Query error types
//!
//! Defines all error conditions that can occur during query parsing,
//! admission and evaluation. Exactly one of these is returned for a
//! failed query.

use thiserror::Error;

use crate::storage::{StorageError, Warnings};
use crate::tracker::TrackerError;

/// Errors that can occur during query operations
#[derive(Error, Debug)]
pub enum QueryError {
    /// Query text could not be parsed
    #[error("Parse error: {0}")]
    Parse(String),

    /// Query parameters rejected before execution
    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    /// Deadline elapsed; the field names where it was noticed
    #[error("query timed out in {0}")]
    Timeout(String),

    /// Explicit cancellation or engine shutdown
    #[error("query was canceled in {0}")]
    Canceled(String),

    /// Sample budget exceeded
    #[error("query processing would load too many samples into memory in {0}")]
    TooManySamples(String),

    /// Storage layer error, kept intact so callers can inspect it
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// The admission tracker failed to record the query
    #[error("Admission failed: {0}")]
    Admission(#[from] TrackerError),

    /// Semantic error found while evaluating
    #[error("Execution error: {0}")]
    Execution(String),

    /// Recovered runtime fault with no more specific classification
    #[error("unexpected error")]
    Internal,
}

impl QueryError {
    /// The wrapped storage error, if this is one
    pub fn storage_error(&self) -> Option<&StorageError> {
        match self {
            QueryError::Storage(e) => Some(e),
            _ => None,
        }
    }

    pub fn is_cancellation(&self) -> bool {
        matches!(self, QueryError::Canceled(_) | QueryError::Timeout(_))
    }
}

/// An error raised together with warnings collected before it
///
/// Evaluation code may unwind with this as the panic payload; the
/// engine then reports `error` and attaches `warnings` to the query log.
#[derive(Debug)]
pub struct ErrorWithWarnings {
    pub error: QueryError,
    pub warnings: Warnings,
}

impl From<QueryError> for ErrorWithWarnings {
    fn from(error: QueryError) -> Self {
        Self {
            error,
            warnings: Warnings::new(),
        }
    }
}

/// Errors building an engine from configuration
#[derive(Error, Debug)]
pub enum EngineSetupError {
    #[error("Failed to open active query tracker: {0}")]
    Tracker(#[from] TrackerError),

    #[error("Failed to open query log: {0}")]
    QueryLog(#[from] std::io::Error),

    #[error("Invalid engine option: {0}")]
    InvalidOption(String),
}

/// Result type for query operations
pub type QueryResult<T> = Result<T, QueryError>;
