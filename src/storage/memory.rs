//! In-memory sample storage
//!
//! A thread-safe map from label set to samples, used by tests, benches and
//! the CLI. Series are kept in label order so selects return sorted output.

use std::collections::BTreeMap;
use std::sync::RwLock;

use crate::storage::error::{StorageError, StorageResult};
use crate::storage::queryable::{Querier, Queryable, SeriesSet};
use crate::storage::types::{Labels, Matcher, Point, SelectHints, Series};

/// In-memory `Queryable`
#[derive(Debug, Default)]
pub struct MemoryStorage {
    series: RwLock<BTreeMap<Labels, Vec<Point>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one sample. Timestamps must increase per series.
    pub fn append(&self, labels: Labels, t: i64, v: f64) -> StorageResult<()> {
        let mut series = self
            .series
            .write()
            .map_err(|e| StorageError::Lock(e.to_string()))?;
        let points = series.entry(labels.clone()).or_default();
        if let Some(last) = points.last() {
            if t <= last.t {
                return Err(StorageError::OutOfOrder {
                    series: labels.to_string(),
                    timestamp: t,
                    last: last.t,
                });
            }
        }
        points.push(Point::new(t, v));
        Ok(())
    }

    /// Drop every series
    pub fn clear(&self) -> StorageResult<()> {
        self.series
            .write()
            .map_err(|e| StorageError::Lock(e.to_string()))?
            .clear();
        Ok(())
    }

    pub fn series_count(&self) -> usize {
        self.series.read().map(|s| s.len()).unwrap_or(0)
    }

    pub fn sample_count(&self) -> usize {
        self.series
            .read()
            .map(|s| s.values().map(Vec::len).sum())
            .unwrap_or(0)
    }
}

impl Queryable for MemoryStorage {
    fn querier(&self, mint: i64, maxt: i64) -> StorageResult<Box<dyn Querier + '_>> {
        Ok(Box::new(MemoryQuerier {
            storage: self,
            mint,
            maxt,
        }))
    }
}

struct MemoryQuerier<'a> {
    storage: &'a MemoryStorage,
    mint: i64,
    maxt: i64,
}

impl Querier for MemoryQuerier<'_> {
    fn select(
        &self,
        _sort: bool,
        hints: &SelectHints,
        matchers: &[Matcher],
    ) -> StorageResult<SeriesSet> {
        // Hints narrow the querier window to what this selector reads.
        let (mint, maxt) = if *hints == SelectHints::default() {
            (self.mint, self.maxt)
        } else {
            (self.mint.max(hints.start), self.maxt.min(hints.end))
        };

        let series = self
            .storage
            .series
            .read()
            .map_err(|e| StorageError::Lock(e.to_string()))?;

        let selected: Vec<Series> = series
            .iter()
            .filter(|(labels, _)| matchers.iter().all(|m| m.matches_labels(labels)))
            .filter_map(|(labels, points)| {
                let points: Vec<Point> = points
                    .iter()
                    .filter(|p| p.t >= mint && p.t <= maxt)
                    .copied()
                    .collect();
                if points.is_empty() {
                    None
                } else {
                    Some(Series {
                        labels: labels.clone(),
                        points,
                    })
                }
            })
            .collect();

        Ok(SeriesSet::from_series(selected))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::types::{MatchType, METRIC_NAME};

    fn storage_with_data() -> MemoryStorage {
        let storage = MemoryStorage::new();
        for i in 0..10 {
            storage
                .append(Labels::from_pairs([(METRIC_NAME, "up"), ("job", "api")]), i * 1000, i as f64)
                .unwrap();
            storage
                .append(Labels::from_pairs([(METRIC_NAME, "up"), ("job", "db")]), i * 1000, 1.0)
                .unwrap();
        }
        storage
    }

    #[test]
    fn test_select_by_matchers() {
        let storage = storage_with_data();
        let querier = storage.querier(0, 100_000).unwrap();
        let matchers = vec![
            Matcher::equal(METRIC_NAME, "up"),
            Matcher::new(MatchType::RegexMatch, "job", "a.*").unwrap(),
        ];
        let series: Vec<Series> = querier
            .select(true, &SelectHints::default(), &matchers)
            .unwrap()
            .collect::<StorageResult<_>>()
            .unwrap();
        assert_eq!(series.len(), 1);
        assert_eq!(series[0].labels.get("job"), Some("api"));
        assert_eq!(series[0].points.len(), 10);
    }

    #[test]
    fn test_querier_window_is_closed() {
        let storage = storage_with_data();
        let querier = storage.querier(2000, 4000).unwrap();
        let series: Vec<Series> = querier
            .select(true, &SelectHints::default(), &[Matcher::equal("job", "api")])
            .unwrap()
            .collect::<StorageResult<_>>()
            .unwrap();
        let ts: Vec<i64> = series[0].points.iter().map(|p| p.t).collect();
        assert_eq!(ts, vec![2000, 3000, 4000]);
    }

    #[test]
    fn test_hints_narrow_window() {
        let storage = storage_with_data();
        let querier = storage.querier(0, 100_000).unwrap();
        let hints = SelectHints {
            start: 5000,
            end: 6000,
            ..SelectHints::default()
        };
        let series: Vec<Series> = querier
            .select(true, &hints, &[Matcher::equal("job", "api")])
            .unwrap()
            .collect::<StorageResult<_>>()
            .unwrap();
        let ts: Vec<i64> = series[0].points.iter().map(|p| p.t).collect();
        assert_eq!(ts, vec![5000, 6000]);
    }

    #[test]
    fn test_out_of_order_append() {
        let storage = MemoryStorage::new();
        let labels = Labels::from_pairs([(METRIC_NAME, "up")]);
        storage.append(labels.clone(), 1000, 1.0).unwrap();
        let err = storage.append(labels, 1000, 2.0).unwrap_err();
        assert!(matches!(err, StorageError::OutOfOrder { .. }));
        assert_eq!(storage.sample_count(), 1);
    }

    #[test]
    fn test_clear() {
        let storage = storage_with_data();
        assert_eq!(storage.series_count(), 2);
        storage.clear().unwrap();
        assert_eq!(storage.series_count(), 0);
    }
}
