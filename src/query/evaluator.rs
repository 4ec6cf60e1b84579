//! Expression evaluation
//!
//! The evaluator walks a (rewritten) expression tree and computes every
//! node for all steps of the statement at once. Every node produces a
//! `Matrix` with at most one point per step; the engine turns the final
//! matrix into the statement's result type.
//!
//! # Budget
//!
//! Each point a node loads or produces is counted against `max_samples`.
//! The count only grows; crossing the limit aborts evaluation with
//! `QueryError::TooManySamples`.
//!
//! # Cancellation
//!
//! The context is checked on entry to every node and once per step of
//! step-wise operators, so a cancelled or timed-out query stops within
//! one step's worth of work.

use std::collections::HashMap;

use crate::query::ast::{
    duration_ms, AggregateExpr, BinaryExpr, Call, Expr, MatrixSelector, SubqueryExpr, UnaryOp,
    ValueType, VectorSelector,
};
use crate::query::context::Context;
use crate::query::error::{QueryError, QueryResult};
use crate::query::functions::{FunctionImpl, RangeFn, RangeWindow};
use crate::query::operators::{
    aggregate, scalar_binop, vector_binop, vector_scalar_binop, vector_set_op, AggregateParam,
};
use crate::query::resolver;
use crate::query::statement::EvalStmt;
use crate::query::value::{
    contains_same_labelset, matrix_contains_same_labelset, Matrix, Sample, Scalar, Value, Vector,
};
use crate::storage::{Labels, Point, Querier, Series, Warnings};

const ENV_EVALUATION: &str = "expression evaluation";
const ENV_EXECUTION: &str = "query execution";

fn duplicate_labelset() -> QueryError {
    QueryError::Execution("vector cannot contain metrics with the same labelset".to_string())
}

/// Step timestamps in `[start, end]`
fn step_times(start: i64, end: i64, interval: i64) -> impl Iterator<Item = i64> {
    let interval = if interval > 0 { interval } else { i64::MAX };
    std::iter::successors(Some(start), move |t| t.checked_add(interval))
        .take_while(move |t| *t <= end)
}

/// Latest point at or before `max`, if it is not older than `min`
fn latest_point(points: &[Point], min: i64, max: i64) -> Option<Point> {
    let idx = points.partition_point(|p| p.t <= max);
    let p = points.get(idx.checked_sub(1)?)?;
    (p.t >= min).then_some(*p)
}

/// Points in the closed window `[min, max]`
fn window(points: &[Point], min: i64, max: i64) -> &[Point] {
    let lo = points.partition_point(|p| p.t < min);
    let hi = points.partition_point(|p| p.t <= max);
    if lo >= hi {
        &[]
    } else {
        &points[lo..hi]
    }
}

/// Collects per-step samples into series, keeping first-seen order
#[derive(Default)]
struct SeriesBuilder {
    index: HashMap<Labels, usize>,
    series: Vec<Series>,
}

impl SeriesBuilder {
    fn push(&mut self, sample: Sample, ts: i64) {
        let point = Point::new(ts, sample.v);
        match self.index.get(&sample.metric) {
            Some(&i) => self.series[i].points.push(point),
            None => {
                self.index.insert(sample.metric.clone(), self.series.len());
                self.series.push(Series {
                    labels: sample.metric,
                    points: vec![point],
                });
            }
        }
    }

    fn finish(self) -> Matrix {
        self.series
    }
}

/// Sample accounting for one evaluation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SampleStats {
    /// Points read from storage
    pub total_samples: usize,
    /// Highest number of points held at once
    pub peak_samples: usize,
}

/// Limits that apply to one evaluation
#[derive(Debug, Clone, Copy)]
pub(crate) struct EvalLimits {
    pub max_samples: usize,
    /// Subquery step when the query omits one, in milliseconds
    pub default_eval_interval: i64,
}

pub(crate) struct Evaluator<'e> {
    querier: &'e dyn Querier,
    stmt: &'e EvalStmt,
    ctx: &'e Context,
    start: i64,
    end: i64,
    interval: i64,
    limits: EvalLimits,
    current_samples: usize,
    stats: SampleStats,
    /// Ancestors of the node being evaluated, outermost first
    path: Vec<&'e Expr>,
    warnings: Warnings,
}

impl<'e> Evaluator<'e> {
    pub(crate) fn new(
        querier: &'e dyn Querier,
        stmt: &'e EvalStmt,
        ctx: &'e Context,
        limits: EvalLimits,
    ) -> Self {
        Self {
            querier,
            stmt,
            ctx,
            start: stmt.start,
            end: stmt.end,
            interval: stmt.interval,
            limits,
            current_samples: 0,
            stats: SampleStats::default(),
            path: Vec::new(),
            warnings: Warnings::new(),
        }
    }

    pub(crate) fn stats(&self) -> SampleStats {
        self.stats
    }

    pub(crate) fn take_warnings(&mut self) -> Warnings {
        std::mem::take(&mut self.warnings)
    }

    /// Evaluate the statement and convert to its result type
    pub(crate) fn run(&mut self) -> QueryResult<Value> {
        let stmt = self.stmt;
        let expr: &'e Expr = &stmt.expr;
        let mut matrix = self.eval(expr)?;

        if !stmt.is_instant() {
            matrix.sort_by(|a, b| a.labels.cmp(&b.labels));
            return Ok(Value::Matrix(matrix));
        }

        Ok(match expr.value_type() {
            ValueType::Scalar => Value::Scalar(Scalar {
                t: stmt.start,
                v: matrix
                    .first()
                    .and_then(|s| s.points.first())
                    .map(|p| p.v)
                    .unwrap_or(f64::NAN),
            }),
            ValueType::Vector => Value::Vector(
                matrix
                    .into_iter()
                    .filter_map(|s| {
                        let v = s.points.first()?.v;
                        Some(Sample::new(s.labels, stmt.start, v))
                    })
                    .collect(),
            ),
            ValueType::Matrix => Value::Matrix(matrix),
            ValueType::String => {
                return Err(QueryError::Execution(
                    "string values cannot be evaluated".to_string(),
                ))
            }
        })
    }

    fn add_samples(&mut self, n: usize) -> QueryResult<()> {
        self.current_samples += n;
        self.stats.peak_samples = self.stats.peak_samples.max(self.current_samples);
        if self.current_samples > self.limits.max_samples {
            return Err(QueryError::TooManySamples(ENV_EXECUTION.to_string()));
        }
        Ok(())
    }

    fn steps(&self) -> impl Iterator<Item = i64> {
        step_times(self.start, self.end, self.interval)
    }

    fn eval(&mut self, expr: &'e Expr) -> QueryResult<Matrix> {
        self.ctx.check(ENV_EVALUATION)?;
        match expr {
            Expr::VectorSelector(vs) => self.eval_vector_selector(vs),
            Expr::MatrixSelector(ms) => self.eval_matrix_selector(ms),
            _ => {
                self.path.push(expr);
                let result = self.eval_node(expr);
                self.path.pop();
                result
            }
        }
    }

    fn eval_node(&mut self, expr: &'e Expr) -> QueryResult<Matrix> {
        match expr {
            Expr::NumberLiteral(n) => {
                let points: Vec<Point> = self.steps().map(|t| Point::new(t, n.val)).collect();
                self.add_samples(points.len())?;
                Ok(vec![Series {
                    labels: Labels::empty(),
                    points,
                }])
            }
            Expr::StringLiteral(_) => Err(QueryError::Execution(
                "string literals can only be used as function arguments".to_string(),
            )),
            Expr::Paren(p) => self.eval(&p.expr),
            Expr::Unary(u) => {
                let mut matrix = self.eval(&u.expr)?;
                if u.op == UnaryOp::Sub {
                    for series in &mut matrix {
                        series.labels = series.labels.drop_metric_name();
                        for p in &mut series.points {
                            p.v = -p.v;
                        }
                    }
                    if matrix_contains_same_labelset(&matrix) {
                        return Err(duplicate_labelset());
                    }
                }
                Ok(matrix)
            }
            Expr::Subquery(sq) => self.eval_subquery(sq),
            Expr::StepInvariant(s) => self.eval_step_invariant(&s.expr),
            Expr::Aggregate(a) => self.eval_aggregate(a),
            Expr::Binary(b) => self.eval_binary(b),
            Expr::Call(c) => self.eval_call(c),
            Expr::VectorSelector(vs) => self.eval_vector_selector(vs),
            Expr::MatrixSelector(ms) => self.eval_matrix_selector(ms),
        }
    }

    // -------------------------------------------------------------------------
    // Selectors
    // -------------------------------------------------------------------------

    /// Fetch the raw series for a selector
    fn select(&mut self, selector: &VectorSelector, range: i64) -> QueryResult<Vec<Series>> {
        let hints = resolver::selector_hints(self.stmt, selector, &self.path, range);
        let set = self.querier.select(false, &hints, &selector.matchers)?;
        self.warnings.extend(set.warnings().iter().cloned());

        let mut out = Vec::new();
        for series in set {
            let series = series?;
            self.stats.total_samples += series.points.len();
            out.push(series);
        }
        Ok(out)
    }

    fn eval_vector_selector(&mut self, vs: &'e VectorSelector) -> QueryResult<Matrix> {
        let series = self.select(vs, 0)?;
        let offset = duration_ms(vs.offset);
        let lookback = self.stmt.lookback_delta;
        let steps: Vec<i64> = self.steps().collect();

        let mut out = Vec::with_capacity(series.len());
        for s in series {
            let points: Vec<Point> = steps
                .iter()
                .filter_map(|&ts| {
                    let ref_time = vs.timestamp.unwrap_or(ts).saturating_sub(offset);
                    latest_point(&s.points, ref_time.saturating_sub(lookback), ref_time)
                        .map(|p| Point::new(ts, p.v))
                })
                .collect();
            self.add_samples(points.len())?;
            if !points.is_empty() {
                out.push(Series {
                    labels: s.labels,
                    points,
                });
            }
        }
        Ok(out)
    }

    fn eval_matrix_selector(&mut self, ms: &'e MatrixSelector) -> QueryResult<Matrix> {
        if self.start != self.end {
            return Err(QueryError::Execution(
                "cannot do range evaluation of matrix selector".to_string(),
            ));
        }
        let range = duration_ms(ms.range);
        let series = self.select(&ms.selector, range)?;
        let maxt = ms
            .selector
            .timestamp
            .unwrap_or(self.start)
            .saturating_sub(duration_ms(ms.selector.offset));

        let mut out = Vec::with_capacity(series.len());
        for s in series {
            let points = window(&s.points, maxt.saturating_sub(range), maxt).to_vec();
            self.add_samples(points.len())?;
            if !points.is_empty() {
                out.push(Series {
                    labels: s.labels,
                    points,
                });
            }
        }
        Ok(out)
    }

    // -------------------------------------------------------------------------
    // Subqueries and step invariants
    // -------------------------------------------------------------------------

    /// Evaluate the inner expression over the subquery's own steps
    fn eval_subquery(&mut self, sq: &'e SubqueryExpr) -> QueryResult<Matrix> {
        let offset = duration_ms(sq.offset);
        let range = duration_ms(sq.range);
        let interval = sq
            .step
            .map(duration_ms)
            .filter(|step| *step > 0)
            .unwrap_or(self.limits.default_eval_interval);
        if interval <= 0 {
            return Err(QueryError::Execution(
                "subquery step must be positive".to_string(),
            ));
        }

        let eff_start = sq.timestamp.unwrap_or(self.start).saturating_sub(offset);
        let eff_end = sq.timestamp.unwrap_or(self.end).saturating_sub(offset);

        // First step-aligned timestamp inside the range.
        let lower = eff_start.saturating_sub(range);
        let rem = lower.rem_euclid(interval);
        let inner_start = if rem == 0 {
            lower
        } else {
            lower.saturating_add(interval - rem)
        };

        let saved = (self.start, self.end, self.interval);
        (self.start, self.end, self.interval) = (inner_start, eff_end, interval);
        let result = self.eval(&sq.expr);
        (self.start, self.end, self.interval) = saved;
        result
    }

    /// Evaluate once at the first step and repeat the result
    fn eval_step_invariant(&mut self, inner: &'e Expr) -> QueryResult<Matrix> {
        if matches!(
            inner.unwrap_parens(),
            Expr::NumberLiteral(_) | Expr::StringLiteral(_)
        ) {
            return self.eval(inner);
        }

        let saved = (self.start, self.end, self.interval);
        self.end = self.start;
        let result = self.eval(inner);
        (self.start, self.end, self.interval) = saved;
        let mut matrix = result?;

        if inner.value_type() == ValueType::Matrix || self.start == self.end {
            return Ok(matrix);
        }

        let steps: Vec<i64> = self.steps().collect();
        for series in &mut matrix {
            let Some(first) = series.points.first().copied() else {
                continue;
            };
            self.add_samples(steps.len().saturating_sub(1))?;
            series.points = steps.iter().map(|&t| Point::new(t, first.v)).collect();
        }
        Ok(matrix)
    }

    // -------------------------------------------------------------------------
    // Step-wise evaluation
    // -------------------------------------------------------------------------

    /// Evaluate `exprs`, then call `f` once per step with their instant
    /// vectors and collect the outputs into series
    fn range_eval<F>(&mut self, exprs: &[&'e Expr], mut f: F) -> QueryResult<Matrix>
    where
        F: FnMut(&[Vector], i64) -> QueryResult<Vector>,
    {
        let mut matrices = Vec::with_capacity(exprs.len());
        for expr in exprs {
            matrices.push(self.eval(expr)?);
        }
        let mut cursors: Vec<Vec<usize>> = matrices.iter().map(|m| vec![0; m.len()]).collect();

        let mut builder = SeriesBuilder::default();
        let steps: Vec<i64> = self.steps().collect();
        for ts in steps {
            self.ctx.check(ENV_EVALUATION)?;

            let vectors: Vec<Vector> = matrices
                .iter()
                .zip(cursors.iter_mut())
                .map(|(matrix, cursor)| {
                    let mut vector = Vec::new();
                    for (series, pos) in matrix.iter().zip(cursor.iter_mut()) {
                        while series.points.get(*pos).is_some_and(|p| p.t < ts) {
                            *pos += 1;
                        }
                        if let Some(p) = series.points.get(*pos).filter(|p| p.t == ts) {
                            vector.push(Sample::new(series.labels.clone(), ts, p.v));
                            *pos += 1;
                        }
                    }
                    vector
                })
                .collect();

            let result = f(&vectors, ts)?;
            if contains_same_labelset(&result) {
                return Err(duplicate_labelset());
            }
            self.add_samples(result.len())?;
            for sample in result {
                builder.push(sample, ts);
            }
        }
        Ok(builder.finish())
    }

    fn eval_aggregate(&mut self, a: &'e AggregateExpr) -> QueryResult<Matrix> {
        let label_param = match a.param.as_deref().map(Expr::unwrap_markers) {
            Some(Expr::StringLiteral(s)) => Some(s.val.as_str()),
            _ => None,
        };
        let mut exprs: Vec<&'e Expr> = vec![a.expr.as_ref()];
        if let Some(param) = a.param.as_deref() {
            if param.value_type() != ValueType::String {
                exprs.push(param);
            }
        }

        self.range_eval(&exprs, |vals, ts| {
            let param = match (label_param, vals.get(1)) {
                (Some(label), _) => AggregateParam::Label(label),
                (None, Some(v)) => AggregateParam::Scalar(v.first().map(|s| s.v).unwrap_or(f64::NAN)),
                (None, None) => AggregateParam::None,
            };
            aggregate(a.op, &a.grouping, a.without, param, &vals[0], ts)
        })
    }

    fn eval_binary(&mut self, b: &'e BinaryExpr) -> QueryResult<Matrix> {
        let lt = b.lhs.value_type();
        let rt = b.rhs.value_type();
        let matching = b.matching.clone().unwrap_or_default();
        let scalar_of = |v: &Vector| v.first().map(|s| s.v).unwrap_or(f64::NAN);
        let operands: [&'e Expr; 2] = [&b.lhs, &b.rhs];

        self.range_eval(&operands, |vals, ts| {
            let (lhs, rhs) = (&vals[0], &vals[1]);
            match (lt, rt) {
                (ValueType::Scalar, ValueType::Scalar) => Ok(vec![Sample::new(
                    Labels::empty(),
                    ts,
                    scalar_binop(b.op, scalar_of(lhs), scalar_of(rhs)),
                )]),
                (ValueType::Vector, ValueType::Scalar) => Ok(vector_scalar_binop(
                    b.op,
                    lhs,
                    scalar_of(rhs),
                    false,
                    b.return_bool,
                )),
                (ValueType::Scalar, ValueType::Vector) => Ok(vector_scalar_binop(
                    b.op,
                    rhs,
                    scalar_of(lhs),
                    true,
                    b.return_bool,
                )),
                _ if b.op.is_set_operator() => vector_set_op(b.op, lhs, rhs, &matching),
                _ => vector_binop(b.op, lhs, rhs, &matching, b.return_bool),
            }
        })
    }

    // -------------------------------------------------------------------------
    // Function calls
    // -------------------------------------------------------------------------

    fn eval_call(&mut self, call: &'e Call) -> QueryResult<Matrix> {
        if call.func.name == "timestamp" {
            if let Some(Expr::VectorSelector(vs)) = call.args.first().map(|a| a.unwrap_markers()) {
                return self.eval_timestamp(vs);
            }
        }

        match call.func.imp {
            FunctionImpl::Range(f) => self.eval_range_function(call, f),
            FunctionImpl::Instant(f) => {
                // String arguments are read from the expression by the function.
                let exprs: Vec<&'e Expr> = call
                    .args
                    .iter()
                    .map(|a| a.as_ref())
                    .filter(|a| a.value_type() != ValueType::String)
                    .collect();
                self.range_eval(&exprs, |vals, ts| f(vals, &call.args, ts))
            }
        }
    }

    /// `timestamp(selector)` reports the time of the selected sample
    /// rather than the evaluation step
    fn eval_timestamp(&mut self, vs: &'e VectorSelector) -> QueryResult<Matrix> {
        let series = self.select(vs, 0)?;
        let offset = duration_ms(vs.offset);
        let lookback = self.stmt.lookback_delta;
        let steps: Vec<i64> = self.steps().collect();

        let mut out = Vec::with_capacity(series.len());
        for s in series {
            let points: Vec<Point> = steps
                .iter()
                .filter_map(|&ts| {
                    let ref_time = vs.timestamp.unwrap_or(ts).saturating_sub(offset);
                    latest_point(&s.points, ref_time.saturating_sub(lookback), ref_time)
                        .map(|p| Point::new(ts, p.t as f64 / 1000.0))
                })
                .collect();
            self.add_samples(points.len())?;
            if !points.is_empty() {
                out.push(Series {
                    labels: s.labels.drop_metric_name(),
                    points,
                });
            }
        }
        if matrix_contains_same_labelset(&out) {
            return Err(duplicate_labelset());
        }
        Ok(out)
    }

    /// Slide the range window of a matrix argument over every step
    fn eval_range_function(&mut self, call: &'e Call, f: RangeFn) -> QueryResult<Matrix> {
        let arg: &'e Expr = match call.args.first() {
            Some(arg) => arg.unwrap_markers(),
            None => {
                return Err(QueryError::Execution(format!(
                    "missing argument to {}()",
                    call.func.name
                )))
            }
        };

        let (series, range, offset, anchor) = match arg {
            Expr::MatrixSelector(ms) => {
                let range = duration_ms(ms.range);
                let series = self.select(&ms.selector, range)?;
                let loaded: usize = series.iter().map(|s| s.points.len()).sum();
                self.add_samples(loaded)?;
                (series, range, duration_ms(ms.selector.offset), ms.selector.timestamp)
            }
            Expr::Subquery(sq) => (
                self.eval(arg)?,
                duration_ms(sq.range),
                duration_ms(sq.offset),
                sq.timestamp,
            ),
            other => {
                return Err(QueryError::Execution(format!(
                    "expected range vector as argument of {}(), got {}",
                    call.func.name,
                    other.value_type()
                )))
            }
        };

        let drop_name = call.func.drops_metric_name();
        let steps: Vec<i64> = self.steps().collect();
        let mut out = Vec::with_capacity(series.len());

        for s in series {
            self.ctx.check(ENV_EVALUATION)?;
            let points: Vec<Point> = steps
                .iter()
                .filter_map(|&ts| {
                    let maxt = anchor.unwrap_or(ts).saturating_sub(offset);
                    let mint = maxt.saturating_sub(range);
                    let in_window = window(&s.points, mint, maxt);
                    if in_window.is_empty() {
                        return None;
                    }
                    f(in_window, RangeWindow { start: mint, end: maxt }).map(|v| Point::new(ts, v))
                })
                .collect();
            self.add_samples(points.len())?;
            if !points.is_empty() {
                let labels = if drop_name {
                    s.labels.drop_metric_name()
                } else {
                    s.labels
                };
                out.push(Series { labels, points });
            }
        }

        if matrix_contains_same_labelset(&out) {
            return Err(duplicate_labelset());
        }
        Ok(out)
    }
}
