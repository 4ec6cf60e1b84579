//! Query log sinks
//!
//! The engine writes one record per executed query to the installed
//! `QueryLogger`. A record is an ordered list of key/value fields:
//! `params`, then `error` and `warnings` when the query failed, then
//! `stats`, then any origin metadata carried by the context.

use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::ser::{Serialize, SerializeMap, Serializer};
use serde_json::Value;

/// Sink for completed-query records
pub trait QueryLogger: Send + Sync {
    /// Write one record
    fn log(&self, fields: &[(&str, Value)]) -> io::Result<()>;

    /// Release the sink; called once when it is swapped out
    fn close(&self) -> io::Result<()>;
}

/// Serializes fields as a JSON object without reordering keys
struct Record<'a>(&'a [(&'a str, Value)]);

impl Serialize for Record<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (key, value) in self.0 {
            map.serialize_entry(key, value)?;
        }
        map.end()
    }
}

/// Render fields as a single-line JSON object
pub fn format_record(fields: &[(&str, Value)]) -> String {
    serde_json::to_string(&Record(fields)).unwrap_or_else(|_| "{}".to_string())
}

/// Appends one JSON object per line to a file
pub struct JsonFileQueryLogger {
    path: PathBuf,
    writer: Mutex<Option<BufWriter<File>>>,
}

impl JsonFileQueryLogger {
    /// Open `path` for appending, creating it if needed
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        tracing::info!(path = %path.display(), "Query log opened");
        Ok(Self {
            path,
            writer: Mutex::new(Some(BufWriter::new(file))),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn poisoned<E: std::fmt::Display>(e: E) -> io::Error {
    io::Error::new(io::ErrorKind::Other, format!("query log lock poisoned: {}", e))
}

impl QueryLogger for JsonFileQueryLogger {
    fn log(&self, fields: &[(&str, Value)]) -> io::Result<()> {
        let mut guard = self.writer.lock().map_err(poisoned)?;
        let writer = guard
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "query log is closed"))?;
        serde_json::to_writer(&mut *writer, &Record(fields))?;
        writer.write_all(b"\n")?;
        writer.flush()
    }

    fn close(&self) -> io::Result<()> {
        let mut guard = self.writer.lock().map_err(poisoned)?;
        match guard.take() {
            Some(mut writer) => writer.flush(),
            None => Ok(()),
        }
    }
}

/// Forwards records to `tracing` at info level
#[derive(Debug, Default)]
pub struct TracingQueryLogger;

impl QueryLogger for TracingQueryLogger {
    fn log(&self, fields: &[(&str, Value)]) -> io::Result<()> {
        tracing::info!(target: "query_log", record = %format_record(fields), "Query completed");
        Ok(())
    }

    fn close(&self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn fields() -> Vec<(&'static str, Value)> {
        vec![
            ("params", json!({"query": "up", "step": 0})),
            ("error", json!("query timed out in query queue")),
            ("foo", json!("bar")),
        ]
    }

    #[test]
    fn test_format_preserves_order() {
        assert_eq!(
            format_record(&fields()),
            r#"{"params":{"query":"up","step":0},"error":"query timed out in query queue","foo":"bar"}"#
        );
    }

    #[test]
    fn test_json_file_logger_appends_lines() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("logs").join("queries.log");

        let logger = JsonFileQueryLogger::open(&path).unwrap();
        logger.log(&fields()).unwrap();
        logger.log(&[("params", json!({"query": "rate(foo[1m])"}))]).unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["foo"], "bar");
        let second: Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second["params"]["query"], "rate(foo[1m])");
    }

    #[test]
    fn test_json_file_logger_reopen_appends() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("queries.log");

        let logger = JsonFileQueryLogger::open(&path).unwrap();
        logger.log(&fields()).unwrap();
        logger.close().unwrap();

        let logger = JsonFileQueryLogger::open(&path).unwrap();
        logger.log(&fields()).unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().count(), 2);
    }

    #[test]
    fn test_log_after_close_fails() {
        let dir = tempdir().unwrap();
        let logger = JsonFileQueryLogger::open(dir.path().join("queries.log")).unwrap();
        logger.close().unwrap();
        assert!(logger.log(&fields()).is_err());
        // Closing twice is harmless
        assert!(logger.close().is_ok());
    }

    #[test]
    fn test_tracing_logger() {
        let logger = TracingQueryLogger;
        assert!(logger.log(&fields()).is_ok());
        assert!(logger.close().is_ok());
    }
}
