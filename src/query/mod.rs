//! PromQL query engine
//!
//! Parses, plans and evaluates PromQL expressions against a `Queryable`:
//!
//! - **ast** / **parser**: Expression tree and nom-based parser
//! - **resolver**: Time range and select hints each selector needs
//! - **rewrite**: Step-invariant rewriting for `@`-pinned subtrees
//! - **evaluator**: Step-by-step evaluation under a sample budget
//! - **engine**: Query construction, admission, timeouts and logging
//! - **logger**: Query log sinks
//!
//! # Query Lifecycle
//!
//! ```text
//! text → parse → rewrite → EvalStmt
//!      → admission (active query tracker)
//!      → querier(mint, maxt) → evaluate → Value
//!      → query log
//! ```
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use promql_engine::query::{Context, Engine, EngineOpts, Value};
//! use promql_engine::storage::{load_script, MemoryStorage};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let storage = MemoryStorage::new();
//! load_script(&storage, "load 10s\n  up{job=\"api\"} 1+1x10\n")?;
//!
//! let engine = Engine::new(EngineOpts::default());
//! let query = engine.new_instant_query(Arc::new(storage), "sum(up)", 50_000)?;
//! let output = query.exec(&Context::background()).await?;
//! assert!(matches!(output.value, Value::Vector(_)));
//! # Ok(())
//! # }
//! ```

pub mod ast;
pub mod context;
pub mod engine;
pub mod error;
pub mod evaluator;
pub mod functions;
pub mod logger;
pub mod operators;
pub mod parser;
pub mod resolver;
pub mod rewrite;
pub mod statement;
pub mod value;

pub use ast::{Expr, ValueType};
pub use context::{Context, ContextError};
pub use engine::{Engine, EngineOpts, Query, QueryOutput, QueryStats};
pub use error::{EngineSetupError, ErrorWithWarnings, QueryError, QueryResult};
pub use evaluator::SampleStats;
pub use logger::{JsonFileQueryLogger, QueryLogger, TracingQueryLogger};
pub use parser::parse_expr;
pub use resolver::find_min_max_time;
pub use rewrite::rewrite_step_invariant;
pub use statement::EvalStmt;
pub use value::{Sample, Scalar, Value};
