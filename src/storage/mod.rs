//! Storage collaborator
//!
//! This module provides everything the query engine needs from a sample
//! source:
//!
//! - **types**: Labels, matchers, samples and select hints
//! - **queryable**: The `Queryable` / `Querier` traits and `SeriesSet`
//! - **memory**: Thread-safe in-memory implementation
//! - **load**: Load-script parser for fixtures
//! - **error**: Error types
//!
//! # Architecture
//!
//! ```text
//! Engine → Queryable::querier(mint, maxt) → Querier
//! Evaluator → Querier::select(hints, matchers) → SeriesSet → Series
//! ```
//!
//! # Example
//!
//! ```rust
//! use promql_engine::storage::{load_script, MemoryStorage};
//!
//! let storage = MemoryStorage::new();
//! load_script(&storage, "load 10s\n  up{job=\"api\"} 1+0x10\n").unwrap();
//! assert_eq!(storage.series_count(), 1);
//! ```

pub mod error;
pub mod load;
pub mod memory;
pub mod queryable;
pub mod types;

// Re-export commonly used types
pub use error::{StorageError, StorageResult};
pub use load::load_script;
pub use memory::MemoryStorage;
pub use queryable::{Querier, Queryable, SeriesSet};
pub use types::{
    Label, Labels, MatchType, Matcher, Point, SelectHints, Series, Warnings, METRIC_NAME,
};
