//! Core data types shared between storage and the query engine
//!
//! - `Labels`: sorted label set identifying a series
//! - `Matcher`: label matcher used to select series
//! - `Point` / `Series`: raw samples
//! - `SelectHints`: advisory time-range metadata passed with each select

use regex::Regex;
use serde::ser::{SerializeMap, Serializer};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::storage::error::{StorageError, StorageResult};

/// Reserved label holding the metric name
pub const METRIC_NAME: &str = "__name__";

/// A single name/value pair
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Label {
    pub name: String,
    pub value: String,
}

impl Label {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Sorted set of labels identifying one series
///
/// Labels with empty values are dropped, and names are unique.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Labels(Vec<Label>);

impl Labels {
    /// Build a label set, sorting by name. Later duplicates win.
    pub fn new(labels: Vec<Label>) -> Self {
        let mut labels: Vec<Label> = labels.into_iter().filter(|l| !l.value.is_empty()).collect();
        labels.reverse();
        labels.sort_by(|a, b| a.name.cmp(&b.name));
        labels.dedup_by(|a, b| a.name == b.name);
        Self(labels)
    }

    pub fn empty() -> Self {
        Self(Vec::new())
    }

    /// Build from `(name, value)` pairs
    pub fn from_pairs<K, V, I>(pairs: I) -> Self
    where
        K: Into<String>,
        V: Into<String>,
        I: IntoIterator<Item = (K, V)>,
    {
        Self::new(pairs.into_iter().map(|(k, v)| Label::new(k, v)).collect())
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|l| l.name == name)
            .map(|l| l.value.as_str())
    }

    pub fn metric_name(&self) -> Option<&str> {
        self.get(METRIC_NAME)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Label> {
        self.0.iter()
    }

    /// Copy with `name` set to `value`; an empty value removes the label.
    pub fn with(&self, name: &str, value: &str) -> Labels {
        let mut labels: Vec<Label> = self.0.iter().filter(|l| l.name != name).cloned().collect();
        labels.push(Label::new(name, value));
        Labels::new(labels)
    }

    /// Copy without the given label names
    pub fn without(&self, names: &[String]) -> Labels {
        Labels(
            self.0
                .iter()
                .filter(|l| !names.iter().any(|n| n == &l.name))
                .cloned()
                .collect(),
        )
    }

    /// Copy keeping only the given label names
    pub fn keep(&self, names: &[String]) -> Labels {
        Labels(
            self.0
                .iter()
                .filter(|l| names.iter().any(|n| n == &l.name))
                .cloned()
                .collect(),
        )
    }

    pub fn drop_metric_name(&self) -> Labels {
        Labels(
            self.0
                .iter()
                .filter(|l| l.name != METRIC_NAME)
                .cloned()
                .collect(),
        )
    }
}

impl fmt::Display for Labels {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, label) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}={:?}", label.name, label.value)?;
        }
        write!(f, "}}")
    }
}

impl Serialize for Labels {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for label in &self.0 {
            map.serialize_entry(&label.name, &label.value)?;
        }
        map.end()
    }
}

/// Kind of label comparison
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MatchType {
    Equal,
    NotEqual,
    RegexMatch,
    RegexNoMatch,
}

impl fmt::Display for MatchType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MatchType::Equal => write!(f, "="),
            MatchType::NotEqual => write!(f, "!="),
            MatchType::RegexMatch => write!(f, "=~"),
            MatchType::RegexNoMatch => write!(f, "!~"),
        }
    }
}

/// A label matcher such as `job=~"api.*"`
///
/// Regular expressions are anchored at both ends.
#[derive(Debug, Clone)]
pub struct Matcher {
    pub kind: MatchType,
    pub name: String,
    pub value: String,
    re: Option<Regex>,
}

impl Matcher {
    pub fn new(
        kind: MatchType,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> StorageResult<Self> {
        let value = value.into();
        let re = match kind {
            MatchType::RegexMatch | MatchType::RegexNoMatch => Some(
                Regex::new(&format!("^(?:{})$", value))
                    .map_err(|e| StorageError::InvalidMatcher(e.to_string()))?,
            ),
            _ => None,
        };
        Ok(Self {
            kind,
            name: name.into(),
            value,
            re,
        })
    }

    /// Equality matcher, which cannot fail to build
    pub fn equal(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            kind: MatchType::Equal,
            name: name.into(),
            value: value.into(),
            re: None,
        }
    }

    /// Check a label value; a missing label matches as the empty string.
    pub fn matches(&self, value: &str) -> bool {
        match (&self.kind, &self.re) {
            (MatchType::Equal, _) => self.value == value,
            (MatchType::NotEqual, _) => self.value != value,
            (MatchType::RegexMatch, Some(re)) => re.is_match(value),
            (MatchType::RegexNoMatch, Some(re)) => !re.is_match(value),
            _ => false,
        }
    }

    /// Check the matcher against a whole label set
    pub fn matches_labels(&self, labels: &Labels) -> bool {
        self.matches(labels.get(&self.name).unwrap_or(""))
    }
}

impl PartialEq for Matcher {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind && self.name == other.name && self.value == other.value
    }
}

impl fmt::Display for Matcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{:?}", self.name, self.kind, self.value)
    }
}

/// A single sample
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    /// Unix timestamp in milliseconds
    pub t: i64,
    pub v: f64,
}

impl Point {
    pub fn new(t: i64, v: f64) -> Self {
        Self { t, v }
    }
}

/// A series with its samples in timestamp order
#[derive(Debug, Clone, PartialEq)]
pub struct Series {
    pub labels: Labels,
    pub points: Vec<Point>,
}

/// Advisory metadata sent with every select call
///
/// All times are milliseconds. `func` names the nearest enclosing function
/// or aggregation; `by` and `grouping` describe a directly enclosing
/// aggregation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SelectHints {
    pub start: i64,
    pub end: i64,
    pub step: i64,
    pub range: i64,
    pub func: Option<String>,
    pub by: bool,
    pub grouping: Vec<String>,
}

/// Non-fatal advisories returned by storage
pub type Warnings = Vec<String>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_labels_sorted_and_deduped() {
        let labels = Labels::from_pairs([("job", "api"), ("__name__", "up"), ("job", "db")]);
        let names: Vec<&str> = labels.iter().map(|l| l.name.as_str()).collect();
        assert_eq!(names, vec!["__name__", "job"]);
        assert_eq!(labels.get("job"), Some("db"));
        assert_eq!(labels.metric_name(), Some("up"));
    }

    #[test]
    fn test_labels_empty_values_dropped() {
        let labels = Labels::from_pairs([("a", ""), ("b", "1")]);
        assert_eq!(labels.len(), 1);
        assert_eq!(labels.with("b", "").len(), 0);
    }

    #[test]
    fn test_labels_display() {
        let labels = Labels::from_pairs([("__name__", "up"), ("job", "api")]);
        assert_eq!(labels.to_string(), "{__name__=\"up\", job=\"api\"}");
    }

    #[test]
    fn test_labels_keep_without() {
        let labels = Labels::from_pairs([("__name__", "up"), ("job", "api"), ("env", "prod")]);
        assert_eq!(
            labels.keep(&["job".to_string()]),
            Labels::from_pairs([("job", "api")])
        );
        assert_eq!(
            labels.without(&["job".to_string()]).drop_metric_name(),
            Labels::from_pairs([("env", "prod")])
        );
    }

    #[test]
    fn test_regex_matcher_anchored() {
        let m = Matcher::new(MatchType::RegexMatch, "job", "api").unwrap();
        assert!(m.matches("api"));
        assert!(!m.matches("api-2"));

        let m = Matcher::new(MatchType::RegexNoMatch, "job", "a.*").unwrap();
        assert!(!m.matches("api"));
        assert!(m.matches("db"));
    }

    #[test]
    fn test_matcher_missing_label_is_empty() {
        let labels = Labels::from_pairs([("job", "api")]);
        assert!(Matcher::equal("env", "").matches_labels(&labels));
        assert!(!Matcher::equal("env", "prod").matches_labels(&labels));
    }

    #[test]
    fn test_invalid_regex() {
        let err = Matcher::new(MatchType::RegexMatch, "job", "(").unwrap_err();
        assert!(matches!(err, StorageError::InvalidMatcher(_)));
    }
}
