//! Storage layer error types
//!
//! Defines all errors that can surface from the sample source the query
//! engine reads from.

use thiserror::Error;

/// Errors that can occur in the storage layer
#[derive(Error, Debug)]
pub enum StorageError {
    /// I/O operation failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A label matcher could not be built
    #[error("Invalid matcher: {0}")]
    InvalidMatcher(String),

    /// Sample appended with a timestamp older than the series head
    #[error("Out of order sample for {series}: {timestamp} <= {last}")]
    OutOfOrder {
        series: String,
        timestamp: i64,
        last: i64,
    },

    /// Load script could not be parsed
    #[error("Load script error on line {line}: {message}")]
    Load { line: usize, message: String },

    /// Lock acquisition failed
    #[error("Lock error: {0}")]
    Lock(String),

    /// Error raised by an external storage implementation
    #[error(transparent)]
    Other(#[from] Box<dyn std::error::Error + Send + Sync>),
}

impl StorageError {
    /// Returns the wrapped external error if it is of type `E`.
    pub fn downcast_ref<E: std::error::Error + 'static>(&self) -> Option<&E> {
        match self {
            StorageError::Other(err) => err.downcast_ref::<E>(),
            _ => None,
        }
    }
}

/// Result type alias for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, thiserror::Error)]
    #[error("disk on fire")]
    struct DiskOnFire;

    #[test]
    fn test_error_display() {
        let err = StorageError::Lock("poisoned".to_string());
        assert_eq!(err.to_string(), "Lock error: poisoned");

        let err = StorageError::OutOfOrder {
            series: "{__name__=\"foo\"}".to_string(),
            timestamp: 10,
            last: 20,
        };
        assert_eq!(
            err.to_string(),
            "Out of order sample for {__name__=\"foo\"}: 10 <= 20"
        );
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let storage_err: StorageError = io_err.into();
        assert!(matches!(storage_err, StorageError::Io(_)));
    }

    #[test]
    fn test_other_error_downcast() {
        let err = StorageError::Other(Box::new(DiskOnFire));
        assert_eq!(err.to_string(), "disk on fire");
        assert!(err.downcast_ref::<DiskOnFire>().is_some());
        assert!(err.downcast_ref::<std::io::Error>().is_none());
    }
}
