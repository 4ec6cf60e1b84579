//! Query engine and query lifecycle
//!
//! The engine turns query text into executable `Query` values and runs
//! them:
//!
//! ```text
//! new_*_query: parse → validate → rewrite step-invariant parts → EvalStmt
//! exec:        deadline → admission slot → evaluate (panic-safe) → release → log
//! ```
//!
//! Every `exec` reaches exactly one terminal state and writes exactly one
//! record to the installed query logger, if any.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use futures_util::FutureExt;
use serde_json::{json, Value as JsonValue};
use tokio_util::sync::CancellationToken;

use crate::config::{expand_path, EngineConfig};
use crate::query::ast::{duration_ms, Expr, ValueType};
use crate::query::context::Context;
use crate::query::error::{EngineSetupError, ErrorWithWarnings, QueryError, QueryResult};
use crate::query::evaluator::{EvalLimits, Evaluator, SampleStats};
use crate::query::logger::{JsonFileQueryLogger, QueryLogger};
use crate::query::parser::parse_expr;
use crate::query::resolver::find_min_max_time;
use crate::query::rewrite::rewrite_step_invariant;
use crate::query::statement::EvalStmt;
use crate::query::value::Value;
use crate::storage::{Queryable, Warnings};
use crate::tracker::ActiveQueryTracker;

const ENV_QUEUE: &str = "query queue";
const ENV_EXECUTION: &str = "query execution";

/// Record keys the engine writes itself; origin entries may not reuse them
const RESERVED_LOG_KEYS: [&str; 4] = ["params", "error", "warnings", "stats"];

/// Most steps a range query may produce per series
const MAX_POINTS_PER_SERIES: i64 = 11_000;

/// Engine settings
#[derive(Debug, Clone)]
pub struct EngineOpts {
    /// Sample budget of one query
    pub max_samples: usize,
    /// Deadline applied to every `exec`
    pub timeout: Duration,
    /// How far back an instant selector looks for a sample
    pub lookback_delta: Duration,
    /// Subquery step when the query omits one
    pub default_evaluation_interval: Duration,
    /// Admission control; unbounded when `None`
    pub active_query_tracker: Option<Arc<ActiveQueryTracker>>,
}

impl Default for EngineOpts {
    fn default() -> Self {
        Self {
            max_samples: 50_000_000,
            timeout: Duration::from_secs(120),
            lookback_delta: Duration::from_secs(300),
            default_evaluation_interval: Duration::from_secs(60),
            active_query_tracker: None,
        }
    }
}

impl From<&EngineConfig> for EngineOpts {
    /// Everything except the tracker, which needs the filesystem
    fn from(config: &EngineConfig) -> Self {
        Self {
            max_samples: config.max_samples,
            timeout: Duration::from_millis(config.timeout_ms),
            lookback_delta: Duration::from_millis(config.lookback_delta_ms),
            default_evaluation_interval: Duration::from_millis(
                config.default_evaluation_interval_ms,
            ),
            active_query_tracker: None,
        }
    }
}

impl EngineOpts {
    /// Reject settings the evaluator cannot work with
    pub fn validate(&self) -> Result<(), EngineSetupError> {
        if self.default_evaluation_interval.as_millis() == 0 {
            return Err(EngineSetupError::InvalidOption(
                "default evaluation interval must be at least 1ms".to_string(),
            ));
        }
        if self.timeout.is_zero() {
            return Err(EngineSetupError::InvalidOption(
                "query timeout must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Timing and sample accounting for one execution
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct QueryStats {
    /// Time spent waiting for an admission slot
    pub queue_time: Duration,
    /// Time spent evaluating
    pub eval_time: Duration,
    /// Wall time of the whole `exec`
    pub total_time: Duration,
    pub samples: SampleStats,
}

impl QueryStats {
    pub fn to_json(&self) -> JsonValue {
        json!({
            "timings": {
                "evalTotalTime": self.eval_time.as_secs_f64(),
                "execQueueTime": self.queue_time.as_secs_f64(),
                "execTotalTime": self.total_time.as_secs_f64(),
            },
            "samples": {
                "totalQueryableSamples": self.samples.total_samples,
                "peakSamples": self.samples.peak_samples,
            },
        })
    }
}

/// Successful result of `Query::exec`
#[derive(Debug, Clone)]
pub struct QueryOutput {
    pub value: Value,
    /// Advisory messages from storage
    pub warnings: Warnings,
    pub stats: QueryStats,
}

struct EngineInner {
    opts: EngineOpts,
    /// Cancelled on shutdown; every exec context derives from it
    base: CancellationToken,
    query_logger: RwLock<Option<Box<dyn QueryLogger>>>,
}

/// Creates and runs queries
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    pub fn new(opts: EngineOpts) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                opts,
                base: CancellationToken::new(),
                query_logger: RwLock::new(None),
            }),
        }
    }

    /// Build an engine, its admission tracker and its query log from configuration
    pub fn from_config(config: &EngineConfig) -> Result<Self, EngineSetupError> {
        let mut opts = EngineOpts::from(config);
        opts.validate()?;
        if let Some(dir) = &config.active_query_dir {
            let tracker = ActiveQueryTracker::new(expand_path(dir), config.max_concurrent_queries)?;
            opts.active_query_tracker = Some(Arc::new(tracker));
        }

        let engine = Self::new(opts);
        if let Some(file) = &config.query_log_file {
            let path: PathBuf = expand_path(file);
            engine.set_query_logger(Some(Box::new(JsonFileQueryLogger::open(path)?)));
        }
        Ok(engine)
    }

    pub fn opts(&self) -> &EngineOpts {
        &self.inner.opts
    }

    /// Install a new query logger, closing the previous one
    ///
    /// The swap waits for in-flight records to finish, so the previous
    /// logger is never written to after it is closed.
    pub fn set_query_logger(&self, logger: Option<Box<dyn QueryLogger>>) {
        let previous = {
            let mut guard = self
                .inner
                .query_logger
                .write()
                .unwrap_or_else(|e| e.into_inner());
            std::mem::replace(&mut *guard, logger)
        };

        if let Some(previous) = previous {
            if let Err(e) = previous.close() {
                tracing::warn!(error = %e, "Failed to close query logger");
            }
        }
    }

    /// Cancel every running and future execution
    pub fn shutdown(&self) {
        tracing::info!("Query engine shutting down");
        self.inner.base.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.base.is_cancelled()
    }

    /// Prepare an instant query evaluated at `ts` (ms)
    pub fn new_instant_query(
        &self,
        queryable: Arc<dyn Queryable>,
        text: &str,
        ts: i64,
    ) -> QueryResult<Query> {
        let expr = parse_expr(text)?;
        if expr.value_type() == ValueType::String {
            return Err(QueryError::InvalidQuery(format!(
                "invalid expression type {:?} for instant query",
                documented_type(ValueType::String)
            )));
        }
        Ok(self.new_query(queryable, text, expr, ts, ts, 0))
    }

    /// Prepare a range query over `[start, end]` (ms) stepped by `interval` (ms)
    pub fn new_range_query(
        &self,
        queryable: Arc<dyn Queryable>,
        text: &str,
        start: i64,
        end: i64,
        interval: i64,
    ) -> QueryResult<Query> {
        if end < start {
            return Err(QueryError::InvalidQuery(
                "end timestamp must not be before start time".to_string(),
            ));
        }
        if interval <= 0 {
            return Err(QueryError::InvalidQuery(
                "zero or negative query resolution step widths are not accepted. Try a positive integer".to_string(),
            ));
        }
        if (end - start) / interval > MAX_POINTS_PER_SERIES {
            return Err(QueryError::InvalidQuery(
                "exceeded maximum resolution of 11,000 points per timeseries. Try decreasing the query resolution (?step=XX)".to_string(),
            ));
        }

        let expr = parse_expr(text)?;
        let value_type = expr.value_type();
        if value_type != ValueType::Vector && value_type != ValueType::Scalar {
            return Err(QueryError::InvalidQuery(format!(
                "invalid expression type {:?} for range query, must be Scalar or instant Vector",
                documented_type(value_type)
            )));
        }
        Ok(self.new_query(queryable, text, expr, start, end, interval))
    }

    fn new_query(
        &self,
        queryable: Arc<dyn Queryable>,
        text: &str,
        expr: Expr,
        start: i64,
        end: i64,
        interval: i64,
    ) -> Query {
        let lookback = duration_ms(self.inner.opts.lookback_delta);
        let expr = rewrite_step_invariant(Arc::new(expr));
        Query {
            engine: Arc::clone(&self.inner),
            queryable,
            text: text.to_string(),
            stmt: EvalStmt::range(expr, start, end, interval, lookback),
            cancel: Mutex::new(None),
            #[cfg(test)]
            test_body: None,
        }
    }

    #[cfg(test)]
    fn new_test_query<F, Fut>(&self, body: F) -> Query
    where
        F: Fn(Context) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = QueryResult<()>> + Send + 'static,
    {
        let mut query = self.new_query(
            Arc::new(crate::storage::MemoryStorage::new()),
            "test statement",
            parse_expr("0").unwrap(),
            0,
            0,
            0,
        );
        query.test_body = Some(Arc::new(move |ctx| body(ctx).boxed()));
        query
    }
}

fn documented_type(t: ValueType) -> &'static str {
    match t {
        ValueType::Scalar => "scalar",
        ValueType::Vector => "instant vector",
        ValueType::Matrix => "range vector",
        ValueType::String => "string",
    }
}

#[cfg(test)]
type TestBody =
    Arc<dyn Fn(Context) -> futures_util::future::BoxFuture<'static, QueryResult<()>> + Send + Sync>;

type Outcome = Result<(Value, Warnings), ErrorWithWarnings>;

/// A prepared query
pub struct Query {
    engine: Arc<EngineInner>,
    queryable: Arc<dyn Queryable>,
    text: String,
    stmt: EvalStmt,
    /// Token of the running execution, if any
    cancel: Mutex<Option<CancellationToken>>,
    #[cfg(test)]
    test_body: Option<TestBody>,
}

impl Query {
    /// The statement this query evaluates
    pub fn statement(&self) -> &EvalStmt {
        &self.stmt
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    /// Cancel the running execution. No effect when the query is not running.
    pub fn cancel(&self) {
        let guard = self.cancel.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(token) = guard.as_ref() {
            token.cancel();
        }
    }

    /// Run the query to completion
    pub async fn exec(&self, ctx: &Context) -> QueryResult<QueryOutput> {
        let exec_start = Instant::now();

        let token = CancellationToken::new();
        *self.cancel.lock().unwrap_or_else(|e| e.into_inner()) = Some(token.clone());

        let ctx = ctx
            .with_token(self.engine.base.clone())
            .with_token(token.clone())
            .with_timeout(self.engine.opts.timeout);

        let mut stats = QueryStats::default();
        let outcome = self.exec_inner(&ctx, &mut stats).await;
        stats.total_time = exec_start.elapsed();

        token.cancel();
        *self.cancel.lock().unwrap_or_else(|e| e.into_inner()) = None;

        self.log(&ctx, &outcome, &stats);

        match outcome {
            Ok((value, warnings)) => Ok(QueryOutput {
                value,
                warnings,
                stats,
            }),
            Err(e) => Err(e.error),
        }
    }

    async fn exec_inner(&self, ctx: &Context, stats: &mut QueryStats) -> Outcome {
        let queue_start = Instant::now();
        // Released when this function returns, on every path
        let _slot = match &self.engine.opts.active_query_tracker {
            Some(tracker) => {
                let slot = tokio::select! {
                    biased;
                    err = ctx.done() => return Err(err.into_query_error(ENV_QUEUE).into()),
                    slot = tracker.insert(&self.text) => slot.map_err(QueryError::from)?,
                };
                Some(slot)
            }
            None => None,
        };
        stats.queue_time = queue_start.elapsed();

        ctx.check(ENV_EXECUTION)?;

        let eval_start = Instant::now();
        let outcome = AssertUnwindSafe(self.run_statement(ctx))
            .catch_unwind()
            .await;
        stats.eval_time = eval_start.elapsed();

        match outcome {
            Ok((result, samples)) => {
                stats.samples = samples;
                result
            }
            Err(payload) => Err(recover_panic(payload)),
        }
    }

    async fn run_statement(&self, ctx: &Context) -> (Outcome, SampleStats) {
        #[cfg(test)]
        if let Some(body) = &self.test_body {
            let result = body(ctx.clone())
                .await
                .map(|()| (Value::Vector(Vec::new()), Warnings::new()))
                .map_err(ErrorWithWarnings::from);
            return (result, SampleStats::default());
        }
        self.evaluate(ctx)
    }

    fn evaluate(&self, ctx: &Context) -> (Outcome, SampleStats) {
        let (mint, maxt) = find_min_max_time(&self.stmt);
        let querier = match self.queryable.querier(mint, maxt) {
            Ok(querier) => querier,
            Err(e) => return (Err(QueryError::from(e).into()), SampleStats::default()),
        };

        let limits = EvalLimits {
            max_samples: self.engine.opts.max_samples,
            default_eval_interval: duration_ms(self.engine.opts.default_evaluation_interval),
        };
        let mut evaluator = Evaluator::new(querier.as_ref(), &self.stmt, ctx, limits);
        let result = evaluator.run();
        let warnings = evaluator.take_warnings();
        let samples = evaluator.stats();

        let outcome = match result {
            Ok(value) => Ok((value, warnings)),
            Err(error) => Err(ErrorWithWarnings { error, warnings }),
        };
        (outcome, samples)
    }

    /// Write the query record to the installed logger
    fn log(&self, ctx: &Context, outcome: &Outcome, stats: &QueryStats) {
        let guard = self
            .engine
            .query_logger
            .read()
            .unwrap_or_else(|e| e.into_inner());
        let Some(logger) = guard.as_ref() else {
            return;
        };

        let mut params = serde_json::Map::new();
        params.insert("query".to_string(), JsonValue::from(self.text.as_str()));
        #[cfg(test)]
        let is_test = self.test_body.is_some();
        #[cfg(not(test))]
        let is_test = false;
        if !is_test {
            params.insert("start".to_string(), JsonValue::from(format_date(self.stmt.start)));
            params.insert("end".to_string(), JsonValue::from(format_date(self.stmt.end)));
            params.insert(
                "step".to_string(),
                JsonValue::from(self.stmt.interval as f64 / 1000.0),
            );
        }

        let mut fields: Vec<(&str, JsonValue)> = vec![("params", JsonValue::Object(params))];
        if let Err(e) = outcome {
            fields.push(("error", JsonValue::from(e.error.to_string())));
            if !e.warnings.is_empty() {
                fields.push(("warnings", json!(e.warnings)));
            }
        }
        fields.push(("stats", stats.to_json()));
        if let Some(origin) = ctx.origin() {
            for (key, value) in origin {
                if RESERVED_LOG_KEYS.contains(&key.as_str()) {
                    tracing::debug!(key = %key, "Skipping origin field with reserved name");
                    continue;
                }
                fields.push((key.as_str(), value.clone()));
            }
        }

        if let Err(e) = logger.log(&fields) {
            tracing::error!(error = %e, query = %self.text, "Can't log query");
        }
    }
}

/// RFC 3339 with milliseconds, in UTC
fn format_date(ms: i64) -> String {
    chrono::DateTime::<chrono::Utc>::from_timestamp_millis(ms)
        .map(|t| t.to_rfc3339_opts(chrono::SecondsFormat::Millis, true))
        .unwrap_or_else(|| ms.to_string())
}

/// Turn a panic payload into the error the query reports
///
/// Errors raised as payloads keep their identity (and warnings); any
/// other fault becomes `QueryError::Internal`.
fn recover_panic(payload: Box<dyn Any + Send>) -> ErrorWithWarnings {
    let payload = match payload.downcast::<ErrorWithWarnings>() {
        Ok(err) => return *err,
        Err(payload) => payload,
    };
    let payload = match payload.downcast::<QueryError>() {
        Ok(err) => return (*err).into(),
        Err(payload) => payload,
    };

    let message = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    tracing::error!(panic = %message, "Runtime panic in query evaluation");
    QueryError::Internal.into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{
        load_script, Labels, Matcher, MemoryStorage, Point, Querier, SelectHints, Series,
        SeriesSet, StorageError, StorageResult,
    };
    use std::sync::atomic::{AtomicBool, Ordering};
    use tempfile::tempdir;
    use tokio::sync::{mpsc, Semaphore};
    use tokio::time::timeout;

    fn test_engine() -> Engine {
        Engine::new(EngineOpts {
            max_samples: 10,
            timeout: Duration::from_secs(10),
            ..Default::default()
        })
    }

    /// Body that reports it started, then waits for one permit on `block`
    fn blocking_body(
        processing: mpsc::UnboundedSender<()>,
        block: Arc<Semaphore>,
    ) -> impl Fn(Context) -> futures_util::future::BoxFuture<'static, QueryResult<()>> + Send + Sync
    {
        move |ctx: Context| {
            let processing = processing.clone();
            let block = Arc::clone(&block);
            async move {
                let _ = processing.send(());
                if let Ok(permit) = block.acquire().await {
                    permit.forget();
                }
                ctx.check("test statement execution")
            }
            .boxed()
        }
    }

    #[tokio::test]
    async fn test_query_concurrency() {
        const MAX_CONCURRENCY: usize = 10;
        let dir = tempdir().unwrap();
        let tracker = Arc::new(ActiveQueryTracker::new(dir.path(), MAX_CONCURRENCY).unwrap());
        let engine = Engine::new(EngineOpts {
            max_samples: 10,
            timeout: Duration::from_secs(100),
            active_query_tracker: Some(tracker),
            ..Default::default()
        });

        let (tx, mut processing) = mpsc::unbounded_channel();
        let block = Arc::new(Semaphore::new(0));
        let body = blocking_body(tx, Arc::clone(&block));
        let body = Arc::new(body);

        let spawn = |engine: &Engine| {
            let body = Arc::clone(&body);
            let query = engine.new_test_query(move |ctx| body(ctx));
            tokio::spawn(async move { query.exec(&Context::background()).await })
        };

        let mut handles = Vec::new();
        for _ in 0..MAX_CONCURRENCY {
            handles.push(spawn(&engine));
            timeout(Duration::from_secs(1), processing.recv())
                .await
                .expect("query within concurrency threshold not being executed");
        }

        handles.push(spawn(&engine));
        assert!(
            timeout(Duration::from_millis(50), processing.recv()).await.is_err(),
            "query above concurrency threshold being executed"
        );

        // Terminate one running query
        block.add_permits(1);
        timeout(Duration::from_secs(1), processing.recv())
            .await
            .expect("waiting query not admitted after a slot freed");

        block.add_permits(MAX_CONCURRENCY);
        for handle in handles {
            assert!(handle.await.unwrap().is_ok());
        }
    }

    #[tokio::test]
    async fn test_query_timeout() {
        let engine = Engine::new(EngineOpts {
            max_samples: 10,
            timeout: Duration::from_millis(5),
            ..Default::default()
        });
        let query = engine.new_test_query(|ctx| async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            ctx.check("test statement execution")
        });

        let err = query.exec(&Context::background()).await.unwrap_err();
        assert!(matches!(err, QueryError::Timeout(_)), "got {:?}", err);
    }

    #[tokio::test]
    async fn test_query_cancel() {
        let engine = test_engine();
        let (tx, mut processing) = mpsc::unbounded_channel();
        let block = Arc::new(Semaphore::new(0));
        let query = Arc::new(engine.new_test_query(blocking_body(tx, Arc::clone(&block))));

        let handle = {
            let query = Arc::clone(&query);
            tokio::spawn(async move { query.exec(&Context::background()).await })
        };
        processing.recv().await.unwrap();
        query.cancel();
        block.add_permits(1);

        let err = handle.await.unwrap().unwrap_err();
        assert!(matches!(err, QueryError::Canceled(ref env) if env == "test statement execution"));

        // Cancelling a query that is not running has no effect
        let query = engine.new_test_query(|ctx| async move { ctx.check("test statement execution") });
        query.cancel();
        assert!(query.exec(&Context::background()).await.is_ok());
    }

    #[tokio::test]
    async fn test_cancel_while_queued_skips_evaluation() {
        let dir = tempdir().unwrap();
        let tracker = Arc::new(ActiveQueryTracker::new(dir.path(), 1).unwrap());
        let engine = Engine::new(EngineOpts {
            active_query_tracker: Some(tracker),
            ..Default::default()
        });

        let (tx, mut processing) = mpsc::unbounded_channel();
        let block = Arc::new(Semaphore::new(0));
        let running = engine.new_test_query(blocking_body(tx, Arc::clone(&block)));
        let running = tokio::spawn(async move { running.exec(&Context::background()).await });
        processing.recv().await.unwrap();

        let reached = Arc::new(AtomicBool::new(false));
        let queued = {
            let reached = Arc::clone(&reached);
            engine.new_test_query(move |_| {
                reached.store(true, Ordering::SeqCst);
                async { Ok::<(), QueryError>(()) }
            })
        };
        let (ctx, cancel) = Context::background().with_cancel();
        let queued = tokio::spawn(async move { queued.exec(&ctx).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();

        let err = queued.await.unwrap().unwrap_err();
        assert!(matches!(err, QueryError::Canceled(ref env) if env == "query queue"));
        assert!(!reached.load(Ordering::SeqCst));

        block.add_permits(1);
        assert!(running.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_engine_shutdown() {
        let engine = test_engine();
        let (tx, mut processing) = mpsc::unbounded_channel();
        let block = Arc::new(Semaphore::new(0));
        let first = engine.new_test_query(blocking_body(tx, Arc::clone(&block)));
        let first = tokio::spawn(async move { first.exec(&Context::background()).await });

        processing.recv().await.unwrap();
        engine.shutdown();
        block.add_permits(1);

        let err = first.await.unwrap().unwrap_err();
        assert!(matches!(err, QueryError::Canceled(ref env) if env == "test statement execution"));

        // Queries started after shutdown never reach evaluation
        let reached = Arc::new(AtomicBool::new(false));
        let second = {
            let reached = Arc::clone(&reached);
            engine.new_test_query(move |_| {
                reached.store(true, Ordering::SeqCst);
                async { Ok::<(), QueryError>(()) }
            })
        };
        let err = second.exec(&Context::background()).await.unwrap_err();
        assert!(matches!(err, QueryError::Canceled(_)));
        assert!(!reached.load(Ordering::SeqCst));
        assert!(engine.is_shutdown());
    }

    #[derive(Debug, thiserror::Error)]
    #[error("storage error")]
    struct TestStorageError;

    struct ErrQueryable;

    struct ErrQuerier;

    impl Querier for ErrQuerier {
        fn select(
            &self,
            _sort: bool,
            _hints: &SelectHints,
            _matchers: &[Matcher],
        ) -> StorageResult<SeriesSet> {
            Ok(SeriesSet::new(
                std::iter::once(Err(StorageError::Other(Box::new(TestStorageError)))),
                Warnings::new(),
            ))
        }
    }

    impl Queryable for ErrQueryable {
        fn querier(&self, _mint: i64, _maxt: i64) -> StorageResult<Box<dyn Querier + '_>> {
            Ok(Box::new(ErrQuerier))
        }
    }

    #[tokio::test]
    async fn test_storage_error_preserved() {
        let engine = test_engine();
        for text in ["foo", "foo[1m]"] {
            let query = engine
                .new_instant_query(Arc::new(ErrQueryable), text, 1000)
                .unwrap();
            let err = query.exec(&Context::background()).await.unwrap_err();
            let storage = err.storage_error().expect("storage error");
            assert!(storage.downcast_ref::<TestStorageError>().is_some());
        }
    }

    struct WarningQueryable;

    struct WarningQuerier;

    impl Querier for WarningQuerier {
        fn select(
            &self,
            _sort: bool,
            _hints: &SelectHints,
            _matchers: &[Matcher],
        ) -> StorageResult<SeriesSet> {
            let series = Series {
                labels: Labels::from_pairs([("__name__", "foo")]),
                points: vec![Point::new(0, 1.0), Point::new(10_000, 2.0)],
            };
            Ok(SeriesSet::from_series(vec![series])
                .with_warnings(vec!["partial data".to_string()]))
        }
    }

    impl Queryable for WarningQueryable {
        fn querier(&self, _mint: i64, _maxt: i64) -> StorageResult<Box<dyn Querier + '_>> {
            Ok(Box::new(WarningQuerier))
        }
    }

    #[tokio::test]
    async fn test_warnings_only_returned_on_success() {
        let engine = test_engine();
        let output = engine
            .new_instant_query(Arc::new(WarningQueryable), "foo", 10_000)
            .unwrap()
            .exec(&Context::background())
            .await
            .unwrap();
        assert_eq!(output.warnings, vec!["partial data".to_string()]);
        assert_eq!(output.value.as_vector().unwrap().len(), 1);

        let engine = Engine::new(EngineOpts {
            max_samples: 0,
            ..Default::default()
        });
        let err = engine
            .new_instant_query(Arc::new(WarningQueryable), "foo", 10_000)
            .unwrap()
            .exec(&Context::background())
            .await
            .unwrap_err();
        assert!(matches!(err, QueryError::TooManySamples(ref env) if env == "query execution"));
    }

    #[derive(Default)]
    struct HintRecorder {
        hints: Mutex<Vec<SelectHints>>,
    }

    struct HintRecordingQuerier<'a>(&'a HintRecorder);

    impl Querier for HintRecordingQuerier<'_> {
        fn select(
            &self,
            _sort: bool,
            hints: &SelectHints,
            _matchers: &[Matcher],
        ) -> StorageResult<SeriesSet> {
            self.0.hints.lock().unwrap().push(hints.clone());
            Ok(SeriesSet::empty())
        }
    }

    impl Queryable for HintRecorder {
        fn querier(&self, _mint: i64, _maxt: i64) -> StorageResult<Box<dyn Querier + '_>> {
            Ok(Box::new(HintRecordingQuerier(self)))
        }
    }

    #[tokio::test]
    async fn test_select_hints_set_correctly() {
        let engine = Engine::new(EngineOpts {
            max_samples: 10,
            timeout: Duration::from_secs(10),
            lookback_delta: Duration::from_secs(5),
            ..Default::default()
        });

        // (query, start, end, [(start, end, range, func)])
        let cases: Vec<(&str, i64, i64, Vec<(i64, i64, i64, Option<&str>)>)> = vec![
            ("foo", 10_000, 10_000, vec![(5_000, 10_000, 0, None)]),
            ("foo @ 15", 10_000, 10_000, vec![(10_000, 15_000, 0, None)]),
            ("foo @ 1", 10_000, 10_000, vec![(-4_000, 1_000, 0, None)]),
            ("foo[2m]", 200_000, 200_000, vec![(80_000, 200_000, 120_000, None)]),
            ("foo[2m] @ 180", 200_000, 200_000, vec![(60_000, 180_000, 120_000, None)]),
            ("foo[2m] @ 60", 200_000, 200_000, vec![(-60_000, 60_000, 120_000, None)]),
            ("foo[2m] offset 2m", 300_000, 300_000, vec![(60_000, 180_000, 120_000, None)]),
            (
                "foo[2m] @ 200 offset 2m",
                300_000,
                300_000,
                vec![(-40_000, 80_000, 120_000, None)],
            ),
            ("foo[2m:1s]", 300_000, 300_000, vec![(175_000, 300_000, 0, None)]),
            (
                "count_over_time(foo[2m:1s])",
                300_000,
                300_000,
                vec![(175_000, 300_000, 0, Some("count_over_time"))],
            ),
            (
                "count_over_time(foo[2m:1s] @ 300)",
                200_000,
                200_000,
                vec![(175_000, 300_000, 0, Some("count_over_time"))],
            ),
            (
                "count_over_time(foo[2m:1s] @ 200)",
                200_000,
                200_000,
                vec![(75_000, 200_000, 0, Some("count_over_time"))],
            ),
            (
                "foo @ 50 + bar @ 250 + baz @ 900",
                100_000,
                500_000,
                vec![
                    (45_000, 50_000, 0, None),
                    (245_000, 250_000, 0, None),
                    (895_000, 900_000, 0, None),
                ],
            ),
            (
                "rate(foo[2m] @ 180)",
                200_000,
                500_000,
                vec![(60_000, 180_000, 120_000, Some("rate"))],
            ),
        ];

        for (text, start, end, expected) in cases {
            let recorder = Arc::new(HintRecorder::default());
            let query = if start == end {
                engine.new_instant_query(recorder.clone(), text, start)
            } else {
                engine.new_range_query(recorder.clone(), text, start, end, 1000)
            }
            .unwrap();
            query.exec(&Context::background()).await.unwrap();

            let hints = recorder.hints.lock().unwrap();
            let got: Vec<(i64, i64, i64, Option<&str>)> = hints
                .iter()
                .map(|h| (h.start, h.end, h.range, h.func.as_deref()))
                .collect();
            assert_eq!(got, expected, "query {}", text);
        }
    }

    fn load(script: &str) -> Arc<MemoryStorage> {
        let storage = MemoryStorage::new();
        load_script(&storage, script).unwrap();
        Arc::new(storage)
    }

    #[tokio::test]
    async fn test_max_query_samples() {
        let storage = load("load 10s\n  metric 1 2\n");
        let run = |max_samples: usize| {
            let engine = Engine::new(EngineOpts {
                max_samples,
                ..Default::default()
            });
            let storage = Arc::clone(&storage);
            async move {
                engine
                    .new_range_query(storage, "metric", 0, 4_000, 1_000)
                    .unwrap()
                    .exec(&Context::background())
                    .await
            }
        };

        // Five steps, one sample each
        let output = run(5).await.unwrap();
        assert_eq!(output.value.as_matrix().unwrap()[0].points.len(), 5);
        assert_eq!(output.stats.samples.peak_samples, 5);

        let err = run(4).await.unwrap_err();
        assert!(matches!(err, QueryError::TooManySamples(ref env) if env == "query execution"));
    }

    #[tokio::test]
    async fn test_instant_and_range_results() {
        let storage = load("load 10s\n  http_requests{job=\"api\"} 0+10x10\n  http_requests{job=\"db\"} 0+20x10\n");
        let engine = Engine::new(EngineOpts::default());

        let output = engine
            .new_instant_query(storage.clone(), "sum(http_requests)", 50_000)
            .unwrap()
            .exec(&Context::background())
            .await
            .unwrap();
        let vector = output.value.as_vector().unwrap();
        assert_eq!(vector.len(), 1);
        assert_eq!(vector[0].v, 150.0);
        assert_eq!(vector[0].t, 50_000);

        let output = engine
            .new_range_query(storage.clone(), "http_requests{job=\"db\"}", 0, 20_000, 10_000)
            .unwrap()
            .exec(&Context::background())
            .await
            .unwrap();
        let matrix = output.value.as_matrix().unwrap();
        assert_eq!(matrix.len(), 1);
        let values: Vec<f64> = matrix[0].points.iter().map(|p| p.v).collect();
        assert_eq!(values, vec![0.0, 20.0, 40.0]);

        let output = engine
            .new_instant_query(storage, "1 + 2", 10_000)
            .unwrap()
            .exec(&Context::background())
            .await
            .unwrap();
        assert_eq!(output.value.as_scalar().unwrap().v, 3.0);
    }

    #[tokio::test]
    async fn test_at_modifier_constant_across_steps() {
        let storage = load("load 10s\n  metric{job=\"1\"} 0+1x1000\n");
        let engine = Engine::new(EngineOpts::default());
        let output = engine
            .new_range_query(storage, "metric @ 100", 0, 60_000, 10_000)
            .unwrap()
            .exec(&Context::background())
            .await
            .unwrap();
        let matrix = output.value.as_matrix().unwrap();
        assert_eq!(matrix.len(), 1);
        assert_eq!(matrix[0].points.len(), 7);
        assert!(matrix[0].points.iter().all(|p| p.v == 10.0));
        let ts: Vec<i64> = matrix[0].points.iter().map(|p| p.t).collect();
        assert_eq!(ts, vec![0, 10_000, 20_000, 30_000, 40_000, 50_000, 60_000]);
    }

    #[tokio::test]
    async fn test_subquery_selector() {
        let storage = load("load 10s\n  metric 1 2\n");
        let engine = Engine::new(EngineOpts::default());
        let output = engine
            .new_instant_query(storage, "metric[20s:10s]", 10_000)
            .unwrap()
            .exec(&Context::background())
            .await
            .unwrap();
        let matrix = output.value.as_matrix().unwrap();
        assert_eq!(matrix.len(), 1);
        let points: Vec<(i64, f64)> = matrix[0].points.iter().map(|p| (p.t, p.v)).collect();
        assert_eq!(points, vec![(0, 1.0), (10_000, 2.0)]);
    }

    #[test]
    fn test_query_validation() {
        let engine = test_engine();
        let storage: Arc<dyn Queryable> = Arc::new(MemoryStorage::new());

        let err = engine
            .new_range_query(storage.clone(), "foo", 10, 0, 1)
            .err()
            .unwrap();
        assert!(err.to_string().contains("end timestamp must not be before start time"));

        let err = engine
            .new_range_query(storage.clone(), "foo", 0, 10, 0)
            .err()
            .unwrap();
        assert!(err.to_string().contains("zero or negative"));

        let err = engine
            .new_range_query(storage.clone(), "foo", 0, 11_001, 1)
            .err()
            .unwrap();
        assert!(err.to_string().contains("11,000 points"));
        assert!(engine.new_range_query(storage.clone(), "foo", 0, 11_000, 1).is_ok());

        let err = engine
            .new_range_query(storage.clone(), "foo[1m]", 0, 10, 1)
            .err()
            .unwrap();
        assert!(err.to_string().contains("\"range vector\""));

        let err = engine
            .new_instant_query(storage.clone(), "\"hello\"", 0)
            .err()
            .unwrap();
        assert!(matches!(err, QueryError::InvalidQuery(_)));

        let err = engine.new_instant_query(storage, "sum(", 0).err().unwrap();
        assert!(matches!(err, QueryError::Parse(_)));
    }

    #[test]
    fn test_statement_is_rewritten() {
        let engine = test_engine();
        let query = engine
            .new_range_query(Arc::new(MemoryStorage::new()), "foo * bar @ 10", 0, 60_000, 1_000)
            .unwrap();
        assert!(matches!(query.statement().expr.as_ref(), Expr::Binary(_)));
        assert!(query.statement().expr.to_string().contains("bar @ 10.000"));
        let mut wrapped = 0;
        crate::query::ast::inspect(&query.statement().expr, &mut |node, _| {
            if matches!(node, Expr::StepInvariant(_)) {
                wrapped += 1;
            }
        });
        assert_eq!(wrapped, 1);
        assert_eq!(query.statement().interval, 1_000);
        assert_eq!(query.text(), "foo * bar @ 10");
    }

    #[tokio::test]
    async fn test_recover_runtime_panic() {
        let engine = test_engine();
        let query = engine.new_test_query(|_| async {
            let values: Vec<i32> = Vec::new();
            let index = values.len() + 123;
            let _ = values[index];
            Ok(())
        });
        let err = query.exec(&Context::background()).await.unwrap_err();
        assert!(matches!(err, QueryError::Internal));
        assert_eq!(err.to_string(), "unexpected error");
    }

    #[tokio::test]
    async fn test_recover_preserves_error() {
        let engine = test_engine();
        let query = engine.new_test_query(|_| async {
            if true {
                std::panic::panic_any(QueryError::Execution("custom error".to_string()));
            }
            Ok(())
        });
        let err = query.exec(&Context::background()).await.unwrap_err();
        assert!(matches!(err, QueryError::Execution(ref m) if m == "custom error"));
    }

    #[derive(Clone, Default)]
    struct FakeQueryLogger {
        records: Arc<Mutex<Vec<Vec<(String, JsonValue)>>>>,
        closed: Arc<AtomicBool>,
    }

    impl FakeQueryLogger {
        fn records(&self) -> Vec<Vec<(String, JsonValue)>> {
            self.records.lock().unwrap().clone()
        }

        fn is_closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }
    }

    impl QueryLogger for FakeQueryLogger {
        fn log(&self, fields: &[(&str, JsonValue)]) -> std::io::Result<()> {
            let record = fields
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect();
            self.records.lock().unwrap().push(record);
            Ok(())
        }

        fn close(&self) -> std::io::Result<()> {
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_query_logger_basic() {
        let engine = test_engine();
        let exec = || {
            let query = engine.new_test_query(|ctx| async move { ctx.check("test statement execution") });
            async move { query.exec(&Context::background()).await.unwrap() }
        };

        // Works without a logger
        exec().await;

        let f1 = FakeQueryLogger::default();
        engine.set_query_logger(Some(Box::new(f1.clone())));
        exec().await;
        let records = f1.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0][0], ("params".to_string(), json!({"query": "test statement"})));
        assert_eq!(records[0][1].0, "stats");

        exec().await;
        assert_eq!(f1.records().len(), 2);

        // Unsetting closes the logger
        assert!(!f1.is_closed());
        engine.set_query_logger(None);
        assert!(f1.is_closed());
        exec().await;
        assert_eq!(f1.records().len(), 2);

        // Swapping closes the previous logger only
        let f2 = FakeQueryLogger::default();
        let f3 = FakeQueryLogger::default();
        engine.set_query_logger(Some(Box::new(f2.clone())));
        assert!(!f2.is_closed());
        exec().await;
        engine.set_query_logger(Some(Box::new(f3.clone())));
        assert!(f2.is_closed());
        assert!(!f3.is_closed());
        exec().await;
        assert_eq!(f2.records().len(), 1);
        assert_eq!(f3.records().len(), 1);
    }

    fn origin_context() -> Context {
        let mut origin = serde_json::Map::new();
        origin.insert("foo".to_string(), json!("bar"));
        Context::background().with_origin(origin)
    }

    #[tokio::test]
    async fn test_query_logger_fields() {
        let engine = test_engine();
        let logger = FakeQueryLogger::default();
        engine.set_query_logger(Some(Box::new(logger.clone())));

        let query = engine.new_test_query(|ctx| async move { ctx.check("test statement execution") });
        query.exec(&origin_context()).await.unwrap();

        let records = logger.records();
        let last = records[0].last().unwrap();
        assert_eq!(last, &("foo".to_string(), json!("bar")));
    }

    #[tokio::test]
    async fn test_query_logger_skips_reserved_origin_keys() {
        let engine = test_engine();
        let logger = FakeQueryLogger::default();
        engine.set_query_logger(Some(Box::new(logger.clone())));

        let mut origin = serde_json::Map::new();
        origin.insert("stats".to_string(), json!("spoofed"));
        origin.insert("params".to_string(), json!("spoofed"));
        origin.insert("user".to_string(), json!("alice"));
        let ctx = Context::background().with_origin(origin);

        let query = engine.new_test_query(|_| async { Ok::<(), QueryError>(()) });
        query.exec(&ctx).await.unwrap();

        let record = &logger.records()[0];
        let keys: Vec<&str> = record.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["params", "stats", "user"]);
        assert_eq!(record[0].1, json!({"query": "test statement"}));
    }

    #[tokio::test]
    async fn test_query_logger_error() {
        let engine = test_engine();
        let logger = FakeQueryLogger::default();
        engine.set_query_logger(Some(Box::new(logger.clone())));

        let query = engine.new_test_query(|_| async {
            Err::<(), _>(QueryError::Execution("failure".to_string()))
        });
        assert!(query.exec(&origin_context()).await.is_err());

        let record = &logger.records()[0];
        let keys: Vec<&str> = record.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["params", "error", "stats", "foo"]);
        assert_eq!(record[0].1, json!({"query": "test statement"}));
        assert_eq!(record[1].1, json!("Execution error: failure"));
    }

    #[tokio::test]
    async fn test_query_logger_keeps_panic_warnings() {
        let engine = test_engine();
        let logger = FakeQueryLogger::default();
        engine.set_query_logger(Some(Box::new(logger.clone())));

        let query = engine.new_test_query(|_| async {
            if true {
                std::panic::panic_any(ErrorWithWarnings {
                    error: QueryError::Execution("custom error".to_string()),
                    warnings: vec!["custom warning".to_string()],
                });
            }
            Ok(())
        });
        let err = query.exec(&Context::background()).await.unwrap_err();
        assert!(matches!(err, QueryError::Execution(ref m) if m == "custom error"));

        let record = &logger.records()[0];
        assert_eq!(record[2], ("warnings".to_string(), json!(["custom warning"])));
    }

    #[tokio::test]
    async fn test_query_log_params_for_range_query() {
        let storage = load("load 10s\n  metric 1+1x10\n");
        let engine = Engine::new(EngineOpts::default());
        let logger = FakeQueryLogger::default();
        engine.set_query_logger(Some(Box::new(logger.clone())));

        engine
            .new_range_query(storage, "metric", 0, 60_000, 15_000)
            .unwrap()
            .exec(&Context::background())
            .await
            .unwrap();

        let record = &logger.records()[0];
        assert_eq!(
            record[0].1,
            json!({
                "query": "metric",
                "start": "1970-01-01T00:00:00.000Z",
                "end": "1970-01-01T00:01:00.000Z",
                "step": 15.0,
            })
        );
        // 0s..60s read from storage
        assert_eq!(record[1].1["samples"]["totalQueryableSamples"], json!(7));
    }

    #[tokio::test]
    async fn test_from_config() {
        let dir = tempdir().unwrap();
        let config = EngineConfig {
            max_concurrent_queries: 3,
            max_samples: 1000,
            active_query_dir: Some(dir.path().join("active").to_string_lossy().to_string()),
            query_log_file: Some(dir.path().join("queries.log").to_string_lossy().to_string()),
            ..Default::default()
        };
        let engine = Engine::from_config(&config).unwrap();
        assert_eq!(engine.opts().max_samples, 1000);
        let tracker = engine.opts().active_query_tracker.clone().unwrap();
        assert_eq!(tracker.capacity(), 3);

        let storage = load("load 10s\n  up{job=\"api\"} 1\n");
        engine
            .new_instant_query(storage, "up", 0)
            .unwrap()
            .exec(&Context::background())
            .await
            .unwrap();
        assert_eq!(tracker.available(), 3);

        engine.set_query_logger(None);
        let log = std::fs::read_to_string(dir.path().join("queries.log")).unwrap();
        let record: JsonValue = serde_json::from_str(log.lines().next().unwrap()).unwrap();
        assert_eq!(record["params"]["query"], "up");
    }

    #[test]
    fn test_opts_from_config() {
        let config = EngineConfig {
            timeout_ms: 1500,
            lookback_delta_ms: 60_000,
            default_evaluation_interval_ms: 30_000,
            ..Default::default()
        };
        let opts = EngineOpts::from(&config);
        assert_eq!(opts.timeout, Duration::from_millis(1500));
        assert_eq!(opts.lookback_delta, Duration::from_secs(60));
        assert_eq!(opts.default_evaluation_interval, Duration::from_secs(30));
        assert!(opts.active_query_tracker.is_none());
    }

    #[test]
    fn test_from_config_rejects_zero_evaluation_interval() {
        let config = EngineConfig {
            default_evaluation_interval_ms: 0,
            active_query_dir: None,
            ..Default::default()
        };
        let err = Engine::from_config(&config).err().unwrap();
        assert!(matches!(err, EngineSetupError::InvalidOption(_)));

        let config = EngineConfig {
            timeout_ms: 0,
            active_query_dir: None,
            ..Default::default()
        };
        assert!(Engine::from_config(&config).is_err());
        assert!(EngineOpts::default().validate().is_ok());
    }

    #[test]
    fn test_format_date() {
        assert_eq!(format_date(0), "1970-01-01T00:00:00.000Z");
        assert_eq!(format_date(1_500), "1970-01-01T00:00:01.500Z");
    }
}
