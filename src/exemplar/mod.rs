//! Exemplar storage
//!
//! Exemplars are individual traced observations attached to a series,
//! e.g. the trace id of one slow request behind a latency histogram.
//! They are kept in a fixed-size circular buffer shared by all series:
//!
//! - **circular**: `CircularExemplarStorage`, the buffer and its series index
//! - **error**: Error types
//!
//! # Example
//!
//! ```rust
//! use promql_engine::exemplar::{CircularExemplarStorage, Exemplar};
//! use promql_engine::storage::{Labels, Matcher};
//!
//! let store = CircularExemplarStorage::new(100);
//! let series = Labels::from_pairs([("__name__", "request_duration_seconds")]);
//! let exemplar = Exemplar::new(Labels::from_pairs([("trace_id", "abc")]), 0.42, 1_000);
//! store.add(&series, &exemplar).unwrap();
//!
//! let results = store.select(0, 2_000, &[vec![Matcher::equal("__name__", "request_duration_seconds")]]);
//! assert_eq!(results[0].exemplars.len(), 1);
//! ```

mod circular;
pub mod error;

pub use circular::{CircularExemplarStorage, ExemplarStats};
pub use error::{ExemplarError, ExemplarResult};

use serde::ser::{Serialize, SerializeStruct, Serializer};

use crate::storage::Labels;

/// Maximum number of UTF-8 characters across exemplar label names and values
pub const MAX_LABEL_SET_LENGTH: usize = 128;

/// One exemplar
#[derive(Debug, Clone, PartialEq)]
pub struct Exemplar {
    pub labels: Labels,
    pub value: f64,
    /// Milliseconds
    pub ts: i64,
    /// Whether `ts` came with the exemplar rather than from the scrape
    pub has_ts: bool,
}

impl Exemplar {
    pub fn new(labels: Labels, value: f64, ts: i64) -> Self {
        Self {
            labels,
            value,
            ts,
            has_ts: true,
        }
    }

    /// Same labels, value and timestamp
    pub fn same_as(&self, other: &Exemplar) -> bool {
        self.labels == other.labels && self.ts == other.ts && self.value == other.value
    }
}

/// Value rendered with exponent notation only for very small or large magnitudes
fn format_exemplar_value(v: f64) -> String {
    if v.is_nan() {
        return "NaN".to_string();
    }
    if v.is_infinite() {
        return if v > 0.0 { "+Inf" } else { "-Inf" }.to_string();
    }
    let abs = v.abs();
    if abs != 0.0 && !(1e-6..1e21).contains(&abs) {
        let formatted = format!("{:e}", v);
        return match formatted.split_once('e') {
            Some((mantissa, exp)) => {
                let exp: i32 = exp.parse().unwrap_or(0);
                let sign = if exp < 0 { '-' } else { '+' };
                format!("{}e{}{:02}", mantissa, sign, exp.abs())
            }
            None => formatted,
        };
    }
    v.to_string()
}

impl Serialize for Exemplar {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("Exemplar", 3)?;
        state.serialize_field("labels", &self.labels)?;
        state.serialize_field("value", &format_exemplar_value(self.value))?;
        state.serialize_field("timestamp", &(self.ts as f64 / 1000.0))?;
        state.end()
    }
}

/// Exemplars of one series returned by a select
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct ExemplarQueryResult {
    #[serde(rename = "seriesLabels")]
    pub series_labels: Labels,
    pub exemplars: Vec<Exemplar>,
}

/// Receives exemplars as they are ingested
pub trait ExemplarAppender: Send + Sync {
    fn add_exemplar(&self, series: &Labels, exemplar: &Exemplar) -> ExemplarResult<()>;
}
