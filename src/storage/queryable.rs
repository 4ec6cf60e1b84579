//! Storage collaborator interface
//!
//! The query engine only ever talks to storage through these traits: it
//! opens a `Querier` for the `[mint, maxt]` window the whole statement
//! needs, then issues one `select` per selector with per-node hints.

use crate::storage::error::StorageResult;
use crate::storage::types::{Matcher, SelectHints, Series, Warnings};

/// Something that can hand out queriers over a time window
pub trait Queryable: Send + Sync {
    /// Open a querier restricted to samples in `[mint, maxt]`.
    fn querier(&self, mint: i64, maxt: i64) -> StorageResult<Box<dyn Querier + '_>>;
}

/// Selects series from one time window
pub trait Querier {
    /// Select all series matching every matcher.
    fn select(
        &self,
        sort: bool,
        hints: &SelectHints,
        matchers: &[Matcher],
    ) -> StorageResult<SeriesSet>;
}

/// Single-pass sequence of series plus advisory warnings
///
/// Errors may surface mid-iteration; the engine aborts on the first one.
pub struct SeriesSet {
    iter: Box<dyn Iterator<Item = StorageResult<Series>> + Send>,
    warnings: Warnings,
}

impl SeriesSet {
    pub fn new(
        iter: impl Iterator<Item = StorageResult<Series>> + Send + 'static,
        warnings: Warnings,
    ) -> Self {
        Self {
            iter: Box::new(iter),
            warnings,
        }
    }

    pub fn from_series(series: Vec<Series>) -> Self {
        Self::new(series.into_iter().map(Ok), Warnings::new())
    }

    pub fn empty() -> Self {
        Self::from_series(Vec::new())
    }

    pub fn with_warnings(mut self, warnings: Warnings) -> Self {
        self.warnings.extend(warnings);
        self
    }

    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }
}

impl Iterator for SeriesSet {
    type Item = StorageResult<Series>;

    fn next(&mut self) -> Option<Self::Item> {
        self.iter.next()
    }
}
