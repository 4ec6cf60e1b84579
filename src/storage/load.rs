//! Load scripts
//!
//! Populates a `MemoryStorage` from the compact text format used by engine
//! tests and the CLI:
//!
//! ```text
//! load 10s
//!   http_requests{job="api"} 0+10x100
//!   errors{job="api"}        1 2 _ 4 1x3
//!
//! clear
//! ```
//!
//! Each `load` block places the i-th value of every series at
//! `i * interval` milliseconds. `_` leaves a gap.

use crate::query::parser::{parse_duration, parse_series_desc};
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::memory::MemoryStorage;

/// Apply a load script to `storage`
pub fn load_script(storage: &MemoryStorage, script: &str) -> StorageResult<()> {
    let mut interval: Option<i64> = None;

    for (idx, raw) in script.lines().enumerate() {
        let line_no = idx + 1;
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        if let Some(rest) = line.strip_prefix("load ") {
            let step = parse_duration(rest.trim()).map_err(|e| StorageError::Load {
                line: line_no,
                message: e.to_string(),
            })?;
            let step = step.as_millis() as i64;
            if step <= 0 {
                return Err(StorageError::Load {
                    line: line_no,
                    message: "load interval must be positive".to_string(),
                });
            }
            interval = Some(step);
            continue;
        }

        if line == "clear" {
            storage.clear()?;
            interval = None;
            continue;
        }

        let step = match (interval, raw.starts_with(char::is_whitespace)) {
            (Some(step), true) => step,
            _ => {
                return Err(StorageError::Load {
                    line: line_no,
                    message: format!("unexpected line {:?}", line),
                })
            }
        };

        let desc = parse_series_desc(line).map_err(|e| StorageError::Load {
            line: line_no,
            message: e.to_string(),
        })?;
        for (i, value) in desc.values.iter().enumerate() {
            if let Some(v) = value {
                storage.append(desc.labels.clone(), i as i64 * step, *v)?;
            }
        }
    }

    tracing::debug!(
        series = storage.series_count(),
        samples = storage.sample_count(),
        "Loaded test data"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::queryable::Queryable;
    use crate::storage::types::{Matcher, SelectHints, Series, METRIC_NAME};

    fn select_all(storage: &MemoryStorage, name: &str) -> Vec<Series> {
        let querier = storage.querier(i64::MIN, i64::MAX).unwrap();
        querier
            .select(true, &SelectHints::default(), &[Matcher::equal(METRIC_NAME, name)])
            .unwrap()
            .collect::<StorageResult<_>>()
            .unwrap()
    }

    #[test]
    fn test_load_expanding_series() {
        let storage = MemoryStorage::new();
        load_script(
            &storage,
            "load 10s\n  metric{job=\"1\"} 0+10x3\n  metric{job=\"2\"} 5-1x2\n",
        )
        .unwrap();

        let series = select_all(&storage, "metric");
        assert_eq!(series.len(), 2);
        let first: Vec<(i64, f64)> = series[0].points.iter().map(|p| (p.t, p.v)).collect();
        assert_eq!(first, vec![(0, 0.0), (10_000, 10.0), (20_000, 20.0), (30_000, 30.0)]);
        let second: Vec<f64> = series[1].points.iter().map(|p| p.v).collect();
        assert_eq!(second, vec![5.0, 4.0, 3.0]);
    }

    #[test]
    fn test_load_gaps_and_repeats() {
        let storage = MemoryStorage::new();
        load_script(&storage, "load 1m\n  gauge 1 _ 3 7x2\n").unwrap();

        let series = select_all(&storage, "gauge");
        let points: Vec<(i64, f64)> = series[0].points.iter().map(|p| (p.t, p.v)).collect();
        assert_eq!(
            points,
            vec![(0, 1.0), (120_000, 3.0), (180_000, 7.0), (240_000, 7.0), (300_000, 7.0)]
        );
    }

    #[test]
    fn test_load_clear() {
        let storage = MemoryStorage::new();
        load_script(&storage, "load 1s\n  a 1 2\nclear\nload 1s\n  b 1\n").unwrap();
        assert_eq!(storage.series_count(), 1);
        assert!(select_all(&storage, "a").is_empty());
    }

    #[test]
    fn test_series_outside_load_block() {
        let storage = MemoryStorage::new();
        let err = load_script(&storage, "metric 1 2 3").unwrap_err();
        assert!(matches!(err, StorageError::Load { line: 1, .. }));
    }
}
