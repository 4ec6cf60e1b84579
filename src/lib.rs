//! # promql-engine
//!
//! PromQL query execution over pluggable storage: time-range resolution,
//! step-invariant rewriting, bounded admission and budgeted evaluation.
//!
//! ## Features
//!
//! - **Bounded admission**: Memory-mapped active query log survives crashes
//! - **Step-invariant rewriting**: `@`-pinned subtrees are evaluated once
//! - **Sample budget**: Queries are aborted before loading too much data
//! - **Cancellation**: Timeouts, explicit cancel and engine shutdown
//! - **Query log**: Swappable JSON-lines or tracing sink
//! - **Exemplars**: Circular exemplar store shared across series
//!
//! ## Modules
//!
//! - [`storage`]: Label model, `Queryable` traits and in-memory storage
//! - [`query`]: Parser, rewriter, evaluator and engine
//! - [`tracker`]: Active query tracker
//! - [`exemplar`]: Exemplar store
//! - [`config`]: TOML configuration
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use promql_engine::config::Config;
//! use promql_engine::query::{Context, Engine};
//! use promql_engine::storage::{load_script, MemoryStorage};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::load_default();
//!     let engine = Engine::from_config(&config.engine)?;
//!
//!     let storage = MemoryStorage::new();
//!     load_script(&storage, "load 1m\n  http_requests_total{job=\"api\"} 0+60x30\n")?;
//!     let storage = Arc::new(storage);
//!
//!     let query = engine.new_range_query(
//!         storage,
//!         "rate(http_requests_total[5m])",
//!         10 * 60_000,
//!         20 * 60_000,
//!         60_000,
//!     )?;
//!     let output = query.exec(&Context::background()).await?;
//!     println!("{}", serde_json::to_string(&output.value)?);
//!
//!     engine.shutdown();
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod exemplar;
pub mod query;
pub mod storage;
pub mod tracker;

// Re-export top-level types for convenience
pub use config::{Config, ConfigError};
pub use exemplar::{CircularExemplarStorage, Exemplar, ExemplarError};
pub use query::{
    Context, Engine, EngineOpts, ErrorWithWarnings, Query, QueryError, QueryLogger, QueryOutput,
    QueryResult, QueryStats, Value,
};
pub use storage::{Labels, MemoryStorage, Queryable, StorageError, StorageResult};
pub use tracker::{ActiveQueryTracker, TrackerError};
