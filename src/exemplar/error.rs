//! Exemplar store error types

use thiserror::Error;

/// Errors that can occur when appending exemplars
///
/// `Duplicate` and `OutOfOrder` are expected during normal ingestion;
/// callers count them and move on.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExemplarError {
    /// Same exemplar as the newest one stored for the series
    #[error("duplicate exemplar")]
    Duplicate,

    /// Timestamp not newer than the newest exemplar of the series
    #[error("out of order exemplar")]
    OutOfOrder,

    /// Exemplar labels exceed the allowed length
    #[error("label set length {0} exceeds maximum of {max} UTF-8 characters", max = super::MAX_LABEL_SET_LENGTH)]
    LabelLength(usize),

    /// The store was sized to zero
    #[error("exemplar storage is disabled or size is 0")]
    Disabled,
}

/// Result type alias for exemplar operations
pub type ExemplarResult<T> = Result<T, ExemplarError>;
