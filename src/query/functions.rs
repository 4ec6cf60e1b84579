//! PromQL function table and implementations
//!
//! Every function is described by a static [`Function`] entry: its name,
//! argument types, arity and result type, plus the implementation the
//! evaluator dispatches to.
//!
//! Two shapes of implementation exist:
//!
//! - **Instant**: called once per evaluation step with each argument
//!   evaluated to an instant vector (scalars arrive as one-sample vectors).
//! - **Range**: called once per series and step with the samples that fall
//!   inside the range window of the matrix argument.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Datelike, NaiveDate, Timelike, Utc};
use regex::Regex;

use crate::query::ast::ValueType::{Matrix as M, Scalar as S, String as Str, Vector as V};
use crate::query::ast::{Expr, ValueType};
use crate::query::error::{QueryError, QueryResult};
use crate::query::value::{Sample, Vector};
use crate::storage::{Label, Labels, MatchType, Point, METRIC_NAME};

/// Functions whose result depends on the evaluation time even when
/// every argument is pinned with `@`
const AT_MODIFIER_UNSAFE_FUNCTIONS: &[&str] = &[
    "days_in_month",
    "day_of_month",
    "day_of_week",
    "hour",
    "minute",
    "month",
    "year",
    "time",
    "timestamp",
];

/// Per-step implementation over instant-vector arguments
pub(crate) type InstantFn = fn(&[Vector], &[Arc<Expr>], i64) -> QueryResult<Vector>;

/// Per-window implementation over the samples of one series
pub(crate) type RangeFn = fn(&[Point], RangeWindow) -> Option<f64>;

/// Closed window `[start, end]` in milliseconds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RangeWindow {
    pub start: i64,
    pub end: i64,
}

impl RangeWindow {
    fn seconds(&self) -> f64 {
        (self.end - self.start) as f64 / 1000.0
    }
}

#[derive(Clone, Copy)]
pub(crate) enum FunctionImpl {
    Instant(InstantFn),
    Range(RangeFn),
}

/// Function metadata
pub struct Function {
    pub name: &'static str,
    pub arg_types: &'static [ValueType],
    /// 0 for fixed arity, `n` for up to `n` optional trailing arguments,
    /// -1 for unlimited
    pub variadic: i32,
    pub return_type: ValueType,
    pub(crate) imp: FunctionImpl,
}

impl Function {
    /// Result depends on the evaluation time regardless of `@`
    pub fn is_at_modifier_unsafe(&self) -> bool {
        AT_MODIFIER_UNSAFE_FUNCTIONS.contains(&self.name)
    }

    /// Output series lose `__name__`
    pub(crate) fn drops_metric_name(&self) -> bool {
        self.name != "last_over_time"
    }
}

impl PartialEq for Function {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl fmt::Debug for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Function")
            .field("name", &self.name)
            .field("arg_types", &self.arg_types)
            .field("variadic", &self.variadic)
            .field("return_type", &self.return_type)
            .finish()
    }
}

macro_rules! instant {
    ($name:expr, [$($arg:expr),*], $variadic:expr, $ret:expr, $f:expr) => {
        Function {
            name: $name,
            arg_types: &[$($arg),*],
            variadic: $variadic,
            return_type: $ret,
            imp: FunctionImpl::Instant($f),
        }
    };
}

macro_rules! range {
    ($name:expr, $f:expr) => {
        Function {
            name: $name,
            arg_types: &[M],
            variadic: 0,
            return_type: V,
            imp: FunctionImpl::Range($f),
        }
    };
}

static FUNCTIONS: &[Function] = &[
    instant!("abs", [V], 0, V, func_abs),
    instant!("ceil", [V], 0, V, func_ceil),
    instant!("floor", [V], 0, V, func_floor),
    instant!("exp", [V], 0, V, func_exp),
    instant!("ln", [V], 0, V, func_ln),
    instant!("log2", [V], 0, V, func_log2),
    instant!("log10", [V], 0, V, func_log10),
    instant!("sqrt", [V], 0, V, func_sqrt),
    instant!("round", [V, S], 1, V, func_round),
    instant!("clamp_min", [V, S], 0, V, func_clamp_min),
    instant!("clamp_max", [V, S], 0, V, func_clamp_max),
    instant!("scalar", [V], 0, S, func_scalar),
    instant!("vector", [S], 0, V, func_vector),
    instant!("time", [], 0, S, func_time),
    instant!("timestamp", [V], 0, V, func_timestamp),
    instant!("minute", [V], 1, V, func_minute),
    instant!("hour", [V], 1, V, func_hour),
    instant!("day_of_month", [V], 1, V, func_day_of_month),
    instant!("day_of_week", [V], 1, V, func_day_of_week),
    instant!("days_in_month", [V], 1, V, func_days_in_month),
    instant!("month", [V], 1, V, func_month),
    instant!("year", [V], 1, V, func_year),
    instant!("label_replace", [V, Str, Str, Str, Str], 0, V, func_label_replace),
    instant!("absent", [V], 0, V, func_absent),
    instant!("sort", [V], 0, V, func_sort),
    instant!("sort_desc", [V], 0, V, func_sort_desc),
    range!("rate", func_rate),
    range!("increase", func_increase),
    range!("delta", func_delta),
    range!("irate", func_irate),
    range!("sum_over_time", func_sum_over_time),
    range!("avg_over_time", func_avg_over_time),
    range!("count_over_time", func_count_over_time),
    range!("min_over_time", func_min_over_time),
    range!("max_over_time", func_max_over_time),
    range!("last_over_time", func_last_over_time),
];

/// Look up a function by its exact name
pub fn get_function(name: &str) -> Option<&'static Function> {
    FUNCTIONS.iter().find(|f| f.name == name)
}

/// Names of every known function
pub fn function_names() -> impl Iterator<Item = &'static str> {
    FUNCTIONS.iter().map(|f| f.name)
}

// =============================================================================
// Instant functions
// =============================================================================

/// Apply `f` to every sample, dropping the metric name
fn simple_func(vals: &[Vector], f: impl Fn(f64) -> f64) -> Vector {
    vals[0]
        .iter()
        .map(|s| Sample::new(s.metric.drop_metric_name(), s.t, f(s.v)))
        .collect()
}

/// Scalar arguments arrive as a single unlabeled sample
fn scalar_arg(vals: &[Vector], idx: usize) -> f64 {
    vals.get(idx)
        .and_then(|v| v.first())
        .map(|s| s.v)
        .unwrap_or(f64::NAN)
}

fn string_arg<'a>(args: &'a [Arc<Expr>], idx: usize, func: &str) -> QueryResult<&'a str> {
    match args.get(idx).map(|a| a.unwrap_markers()) {
        Some(Expr::StringLiteral(s)) => Ok(&s.val),
        _ => Err(QueryError::Execution(format!(
            "expected string literal as argument {} of {}()",
            idx + 1,
            func
        ))),
    }
}

fn func_abs(vals: &[Vector], _: &[Arc<Expr>], _: i64) -> QueryResult<Vector> {
    Ok(simple_func(vals, f64::abs))
}

fn func_ceil(vals: &[Vector], _: &[Arc<Expr>], _: i64) -> QueryResult<Vector> {
    Ok(simple_func(vals, f64::ceil))
}

fn func_floor(vals: &[Vector], _: &[Arc<Expr>], _: i64) -> QueryResult<Vector> {
    Ok(simple_func(vals, f64::floor))
}

fn func_exp(vals: &[Vector], _: &[Arc<Expr>], _: i64) -> QueryResult<Vector> {
    Ok(simple_func(vals, f64::exp))
}

fn func_ln(vals: &[Vector], _: &[Arc<Expr>], _: i64) -> QueryResult<Vector> {
    Ok(simple_func(vals, f64::ln))
}

fn func_log2(vals: &[Vector], _: &[Arc<Expr>], _: i64) -> QueryResult<Vector> {
    Ok(simple_func(vals, f64::log2))
}

fn func_log10(vals: &[Vector], _: &[Arc<Expr>], _: i64) -> QueryResult<Vector> {
    Ok(simple_func(vals, f64::log10))
}

fn func_sqrt(vals: &[Vector], _: &[Arc<Expr>], _: i64) -> QueryResult<Vector> {
    Ok(simple_func(vals, f64::sqrt))
}

fn func_round(vals: &[Vector], _: &[Arc<Expr>], _: i64) -> QueryResult<Vector> {
    let to_nearest = if vals.len() > 1 { scalar_arg(vals, 1) } else { 1.0 };
    // Multiplying by the inverse keeps results like round(x, 0.1) exact.
    let inverse = 1.0 / to_nearest;
    Ok(simple_func(vals, |v| (v * inverse + 0.5).floor() / inverse))
}

fn func_clamp_min(vals: &[Vector], _: &[Arc<Expr>], _: i64) -> QueryResult<Vector> {
    let min = scalar_arg(vals, 1);
    Ok(simple_func(vals, |v| min.max(v)))
}

fn func_clamp_max(vals: &[Vector], _: &[Arc<Expr>], _: i64) -> QueryResult<Vector> {
    let max = scalar_arg(vals, 1);
    Ok(simple_func(vals, |v| max.min(v)))
}

fn func_scalar(vals: &[Vector], _: &[Arc<Expr>], ts: i64) -> QueryResult<Vector> {
    let v = match vals[0].as_slice() {
        [only] => only.v,
        _ => f64::NAN,
    };
    Ok(vec![Sample::new(Labels::empty(), ts, v)])
}

fn func_vector(vals: &[Vector], _: &[Arc<Expr>], ts: i64) -> QueryResult<Vector> {
    Ok(vec![Sample::new(Labels::empty(), ts, scalar_arg(vals, 0))])
}

fn func_time(_: &[Vector], _: &[Arc<Expr>], ts: i64) -> QueryResult<Vector> {
    Ok(vec![Sample::new(Labels::empty(), ts, ts as f64 / 1000.0)])
}

/// Fallback for non-selector arguments, where a sample's time is the step
fn func_timestamp(vals: &[Vector], _: &[Arc<Expr>], _: i64) -> QueryResult<Vector> {
    Ok(vals[0]
        .iter()
        .map(|s| Sample::new(s.metric.drop_metric_name(), s.t, s.t as f64 / 1000.0))
        .collect())
}

fn date_wrapper(vals: &[Vector], ts: i64, f: fn(DateTime<Utc>) -> f64) -> Vector {
    let apply = |seconds: f64| {
        DateTime::from_timestamp(seconds as i64, 0)
            .map(f)
            .unwrap_or(f64::NAN)
    };
    match vals.first() {
        None => vec![Sample::new(Labels::empty(), ts, apply(ts as f64 / 1000.0))],
        Some(vector) => vector
            .iter()
            .map(|s| Sample::new(s.metric.drop_metric_name(), s.t, apply(s.v)))
            .collect(),
    }
}

fn func_minute(vals: &[Vector], _: &[Arc<Expr>], ts: i64) -> QueryResult<Vector> {
    Ok(date_wrapper(vals, ts, |t| t.minute() as f64))
}

fn func_hour(vals: &[Vector], _: &[Arc<Expr>], ts: i64) -> QueryResult<Vector> {
    Ok(date_wrapper(vals, ts, |t| t.hour() as f64))
}

fn func_day_of_month(vals: &[Vector], _: &[Arc<Expr>], ts: i64) -> QueryResult<Vector> {
    Ok(date_wrapper(vals, ts, |t| t.day() as f64))
}

fn func_day_of_week(vals: &[Vector], _: &[Arc<Expr>], ts: i64) -> QueryResult<Vector> {
    Ok(date_wrapper(vals, ts, |t| t.weekday().num_days_from_sunday() as f64))
}

fn func_days_in_month(vals: &[Vector], _: &[Arc<Expr>], ts: i64) -> QueryResult<Vector> {
    Ok(date_wrapper(vals, ts, |t| {
        let (year, month) = if t.month() == 12 {
            (t.year() + 1, 1)
        } else {
            (t.year(), t.month() + 1)
        };
        NaiveDate::from_ymd_opt(year, month, 1)
            .and_then(|first| first.pred_opt())
            .map(|last| last.day() as f64)
            .unwrap_or(f64::NAN)
    }))
}

fn func_month(vals: &[Vector], _: &[Arc<Expr>], ts: i64) -> QueryResult<Vector> {
    Ok(date_wrapper(vals, ts, |t| t.month() as f64))
}

fn func_year(vals: &[Vector], _: &[Arc<Expr>], ts: i64) -> QueryResult<Vector> {
    Ok(date_wrapper(vals, ts, |t| t.year() as f64))
}

fn is_valid_label_name(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn func_label_replace(vals: &[Vector], args: &[Arc<Expr>], _: i64) -> QueryResult<Vector> {
    let dst = string_arg(args, 1, "label_replace")?;
    let replacement = string_arg(args, 2, "label_replace")?;
    let src = string_arg(args, 3, "label_replace")?;
    let pattern = string_arg(args, 4, "label_replace")?;

    let re = Regex::new(&format!("^(?:{})$", pattern)).map_err(|_| {
        QueryError::Execution(format!(
            "invalid regular expression in label_replace(): {}",
            pattern
        ))
    })?;
    if !is_valid_label_name(dst) {
        return Err(QueryError::Execution(format!(
            "invalid destination label name in label_replace(): {}",
            dst
        )));
    }

    Ok(vals[0]
        .iter()
        .map(|s| {
            let value = s.metric.get(src).unwrap_or("");
            let metric = match re.captures(value) {
                Some(caps) => {
                    let mut expanded = String::new();
                    caps.expand(replacement, &mut expanded);
                    s.metric.with(dst, &expanded)
                }
                None => s.metric.clone(),
            };
            Sample::new(metric, s.t, s.v)
        })
        .collect())
}

/// Labels for `absent()`: the equality matchers of a plain selector,
/// minus any label constrained more than once
fn absent_labels(expr: &Expr) -> Labels {
    let selector = match expr.unwrap_markers() {
        Expr::VectorSelector(vs) => vs,
        _ => return Labels::empty(),
    };

    let mut labels: Vec<Label> = Vec::new();
    let mut repeated = HashSet::new();
    for m in &selector.matchers {
        if m.name == METRIC_NAME {
            continue;
        }
        if m.kind == MatchType::Equal && !labels.iter().any(|l| l.name == m.name) {
            labels.push(Label::new(m.name.clone(), m.value.clone()));
        } else {
            repeated.insert(m.name.clone());
        }
    }
    labels.retain(|l| !repeated.contains(&l.name));
    Labels::new(labels)
}

fn func_absent(vals: &[Vector], args: &[Arc<Expr>], ts: i64) -> QueryResult<Vector> {
    if !vals[0].is_empty() {
        return Ok(Vec::new());
    }
    let labels = args.first().map(|a| absent_labels(a)).unwrap_or_default();
    Ok(vec![Sample::new(labels, ts, 1.0)])
}

/// NaN sorts first in both directions
fn nan_first(a: f64, b: f64) -> Option<std::cmp::Ordering> {
    match (a.is_nan(), b.is_nan()) {
        (true, true) => Some(std::cmp::Ordering::Equal),
        (true, false) => Some(std::cmp::Ordering::Less),
        (false, true) => Some(std::cmp::Ordering::Greater),
        (false, false) => None,
    }
}

fn func_sort(vals: &[Vector], _: &[Arc<Expr>], _: i64) -> QueryResult<Vector> {
    let mut out = vals[0].clone();
    out.sort_by(|a, b| nan_first(a.v, b.v).unwrap_or_else(|| a.v.total_cmp(&b.v)));
    Ok(out)
}

fn func_sort_desc(vals: &[Vector], _: &[Arc<Expr>], _: i64) -> QueryResult<Vector> {
    let mut out = vals[0].clone();
    out.sort_by(|a, b| nan_first(a.v, b.v).unwrap_or_else(|| b.v.total_cmp(&a.v)));
    Ok(out)
}

// =============================================================================
// Range functions
// =============================================================================

/// Kahan summation increment with Neumaier improvement
///
/// Returns (new_sum, new_compensation).
#[inline(never)]
fn kahan_inc(inc: f64, sum: f64, c: f64) -> (f64, f64) {
    let t = sum + inc;

    let new_c = if t.is_infinite() {
        0.0
    } else if sum.abs() >= inc.abs() {
        c + ((sum - t) + inc)
    } else {
        c + ((inc - t) + sum)
    };

    (t, new_c)
}

/// Rate, increase and delta with extrapolation to the window edges
fn extrapolated_rate(
    points: &[Point],
    window: RangeWindow,
    is_counter: bool,
    is_rate: bool,
) -> Option<f64> {
    if points.len() < 2 {
        return None;
    }
    let first = points[0];
    let last = points[points.len() - 1];

    let mut result = last.v - first.v;
    if is_counter {
        let mut prev = 0.0;
        for p in points {
            if p.v < prev {
                result += prev;
            }
            prev = p.v;
        }
    }

    let mut duration_to_start = (first.t - window.start) as f64 / 1000.0;
    let duration_to_end = (window.end - last.t) as f64 / 1000.0;
    let sampled_interval = (last.t - first.t) as f64 / 1000.0;
    let average_between_samples = sampled_interval / (points.len() - 1) as f64;

    if is_counter && result > 0.0 && first.v >= 0.0 {
        // Counters cannot go below zero, so never extrapolate past the
        // point where this one would have started.
        let duration_to_zero = sampled_interval * (first.v / result);
        if duration_to_zero < duration_to_start {
            duration_to_start = duration_to_zero;
        }
    }

    let threshold = average_between_samples * 1.1;
    let mut extrapolate_to = sampled_interval;
    extrapolate_to += if duration_to_start < threshold {
        duration_to_start
    } else {
        average_between_samples / 2.0
    };
    extrapolate_to += if duration_to_end < threshold {
        duration_to_end
    } else {
        average_between_samples / 2.0
    };

    result *= extrapolate_to / sampled_interval;
    if is_rate {
        result /= window.seconds();
    }
    Some(result)
}

fn func_rate(points: &[Point], window: RangeWindow) -> Option<f64> {
    extrapolated_rate(points, window, true, true)
}

fn func_increase(points: &[Point], window: RangeWindow) -> Option<f64> {
    extrapolated_rate(points, window, true, false)
}

fn func_delta(points: &[Point], window: RangeWindow) -> Option<f64> {
    extrapolated_rate(points, window, false, false)
}

fn func_irate(points: &[Point], _: RangeWindow) -> Option<f64> {
    let [.., prev, last] = points else {
        return None;
    };
    let mut result = last.v - prev.v;
    if last.v < prev.v {
        // Counter reset.
        result = last.v;
    }
    let interval = last.t - prev.t;
    if interval == 0 {
        return None;
    }
    Some(result / (interval as f64 / 1000.0))
}

fn func_sum_over_time(points: &[Point], _: RangeWindow) -> Option<f64> {
    let (mut sum, mut c) = (0.0, 0.0);
    for p in points {
        (sum, c) = kahan_inc(p.v, sum, c);
    }
    Some(if sum.is_infinite() { sum } else { sum + c })
}

/// Kahan mean that switches to an incremental mean if the sum overflows
fn func_avg_over_time(points: &[Point], _: RangeWindow) -> Option<f64> {
    let first = points.first()?;
    if points.len() == 1 {
        return Some(first.v);
    }

    let mut sum = first.v;
    let mut c = 0.0;
    let mut mean = 0.0;
    let mut incremental = false;

    for (i, p) in points.iter().enumerate().skip(1) {
        let count = (i + 1) as f64;
        if !incremental {
            let (new_sum, new_c) = kahan_inc(p.v, sum, c);
            if !new_sum.is_infinite() {
                sum = new_sum;
                c = new_c;
                continue;
            }
            incremental = true;
            mean = sum / (count - 1.0);
            c /= count - 1.0;
        }
        let q = (count - 1.0) / count;
        (mean, c) = kahan_inc(p.v / count, q * mean, q * c);
    }

    if incremental {
        Some(mean + c)
    } else {
        let count = points.len() as f64;
        Some(sum / count + c / count)
    }
}

fn func_count_over_time(points: &[Point], _: RangeWindow) -> Option<f64> {
    if points.is_empty() {
        None
    } else {
        Some(points.len() as f64)
    }
}

/// NaN is replaced by any real value; all-NaN stays NaN
fn func_min_over_time(points: &[Point], _: RangeWindow) -> Option<f64> {
    let mut min = points.first()?.v;
    for p in &points[1..] {
        if p.v < min || min.is_nan() {
            min = p.v;
        }
    }
    Some(min)
}

fn func_max_over_time(points: &[Point], _: RangeWindow) -> Option<f64> {
    let mut max = points.first()?.v;
    for p in &points[1..] {
        if p.v > max || max.is_nan() {
            max = p.v;
        }
    }
    Some(max)
}

fn func_last_over_time(points: &[Point], _: RangeWindow) -> Option<f64> {
    points.last().map(|p| p.v)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::parser::parse_expr;

    fn points(values: &[(i64, f64)]) -> Vec<Point> {
        values.iter().map(|&(t, v)| Point::new(t, v)).collect()
    }

    fn vector(values: &[(&str, f64)]) -> Vector {
        values
            .iter()
            .map(|&(job, v)| {
                Sample::new(Labels::from_pairs([(METRIC_NAME, "m"), ("job", job)]), 0, v)
            })
            .collect()
    }

    fn call_args(expr: &str) -> Vec<Arc<Expr>> {
        match parse_expr(expr).unwrap() {
            Expr::Call(c) => c.args,
            other => panic!("not a call: {:?}", other),
        }
    }

    #[test]
    fn test_lookup() {
        let rate = get_function("rate").unwrap();
        assert_eq!(rate.arg_types, &[ValueType::Matrix]);
        assert_eq!(rate.return_type, ValueType::Vector);
        assert!(get_function("Rate").is_none());
        assert!(get_function("time").unwrap().is_at_modifier_unsafe());
        assert!(!get_function("abs").unwrap().is_at_modifier_unsafe());
        assert!(!get_function("last_over_time").unwrap().drops_metric_name());
        assert_eq!(function_names().count(), FUNCTIONS.len());
    }

    #[test]
    fn test_rate_extrapolation() {
        // Two samples ten seconds apart in a 20s window ending on the last one.
        let window = RangeWindow { start: -10_000, end: 10_000 };
        let pts = points(&[(0, 1.0), (10_000, 2.0)]);
        let rate = func_rate(&pts, window).unwrap();
        assert!((rate - 0.1).abs() < 1e-12, "rate={}", rate);
        assert!(func_rate(&pts[..1], window).is_none());
    }

    #[test]
    fn test_rate_counter_reset() {
        let window = RangeWindow { start: 0, end: 30_000 };
        let pts = points(&[(0, 10.0), (10_000, 20.0), (20_000, 5.0), (30_000, 15.0)]);
        // 10 -> 20, reset, 5 -> 15: 25 total over 30s.
        let increase = func_increase(&pts, window).unwrap();
        assert!((increase - 25.0).abs() < 1e-9, "increase={}", increase);

        // delta ignores resets
        let delta = func_delta(&pts, window).unwrap();
        assert!((delta - 5.0).abs() < 1e-9);
    }

    #[test]
    fn test_irate() {
        let window = RangeWindow { start: 0, end: 30_000 };
        let pts = points(&[(0, 1.0), (10_000, 5.0), (15_000, 15.0)]);
        assert_eq!(func_irate(&pts, window), Some(2.0));
        let reset = points(&[(0, 10.0), (10_000, 4.0)]);
        assert_eq!(func_irate(&reset, window), Some(0.4));
    }

    #[test]
    fn test_over_time_functions() {
        let window = RangeWindow { start: 0, end: 0 };
        let pts = points(&[(0, 3.0), (1, f64::NAN), (2, 1.0), (3, 4.0)]);
        assert_eq!(func_count_over_time(&pts, window), Some(4.0));
        assert_eq!(func_min_over_time(&pts, window), Some(1.0));
        assert_eq!(func_max_over_time(&pts, window), Some(4.0));
        assert_eq!(func_last_over_time(&pts, window), Some(4.0));

        let nan_first = points(&[(0, f64::NAN), (1, 2.0)]);
        assert_eq!(func_max_over_time(&nan_first, window), Some(2.0));
        let all_nan = points(&[(0, f64::NAN), (1, f64::NAN)]);
        assert!(func_min_over_time(&all_nan, window).unwrap().is_nan());

        let pts = points(&[(0, 1.0), (1, 2.0), (2, 3.0), (3, 4.0)]);
        assert_eq!(func_sum_over_time(&pts, window), Some(10.0));
        assert_eq!(func_avg_over_time(&pts, window), Some(2.5));
        assert_eq!(func_count_over_time(&[], window), None);
    }

    #[test]
    fn test_kahan_cancellation() {
        let pts = points(&[(0, 1.0), (1, 1e100), (2, 1.0), (3, -1e100)]);
        let sum = func_sum_over_time(&pts, RangeWindow { start: 0, end: 0 }).unwrap();
        assert_eq!(sum, 2.0);
    }

    #[test]
    fn test_avg_overflow_switches_to_incremental() {
        let pts = points(&[(0, f64::MAX), (1, f64::MAX), (2, f64::MAX)]);
        let avg = func_avg_over_time(&pts, RangeWindow { start: 0, end: 0 }).unwrap();
        assert!(avg.is_finite());
    }

    #[test]
    fn test_simple_functions_drop_name() {
        let out = func_abs(&[vector(&[("a", -2.0)])], &[], 0).unwrap();
        assert_eq!(out[0].v, 2.0);
        assert_eq!(out[0].metric.metric_name(), None);

        let out = func_round(
            &[vector(&[("a", 2.56)]), vec![Sample::new(Labels::empty(), 0, 0.1)]],
            &[],
            0,
        )
        .unwrap();
        assert!((out[0].v - 2.6).abs() < 1e-12);

        let out = func_clamp_max(
            &[vector(&[("a", 5.0), ("b", 1.0)]), vec![Sample::new(Labels::empty(), 0, 3.0)]],
            &[],
            0,
        )
        .unwrap();
        let values: Vec<f64> = out.iter().map(|s| s.v).collect();
        assert_eq!(values, vec![3.0, 1.0]);
    }

    #[test]
    fn test_scalar_and_time() {
        let out = func_scalar(&[vector(&[("a", 4.0)])], &[], 5000).unwrap();
        assert_eq!(out[0].v, 4.0);
        let out = func_scalar(&[vector(&[("a", 4.0), ("b", 1.0)])], &[], 5000).unwrap();
        assert!(out[0].v.is_nan());
        let out = func_time(&[], &[], 5000).unwrap();
        assert_eq!(out[0].v, 5.0);
    }

    #[test]
    fn test_date_functions() {
        // 2024-02-29T13:45:00Z, a Thursday
        let ts = 1_709_214_300.0;
        let input = vec![Sample::new(Labels::from_pairs([("job", "a")]), 0, ts)];
        let call = |f: InstantFn| f(&[input.clone()], &[], 0).unwrap()[0].v;
        assert_eq!(call(func_year), 2024.0);
        assert_eq!(call(func_month), 2.0);
        assert_eq!(call(func_day_of_month), 29.0);
        assert_eq!(call(func_day_of_week), 4.0);
        assert_eq!(call(func_days_in_month), 29.0);
        assert_eq!(call(func_hour), 13.0);
        assert_eq!(call(func_minute), 45.0);

        // Without arguments the evaluation time is used.
        let out = func_year(&[], &[], 0).unwrap();
        assert_eq!(out[0].v, 1970.0);
    }

    #[test]
    fn test_label_replace() {
        let args = call_args(r#"label_replace(m, "dst", "$1-x", "job", "(.*)b")"#);
        let out = func_label_replace(&[vector(&[("ab", 1.0), ("zz", 2.0)])], &args, 0).unwrap();
        assert_eq!(out[0].metric.get("dst"), Some("a-x"));
        assert_eq!(out[0].metric.metric_name(), Some("m"));
        assert_eq!(out[1].metric.get("dst"), None);

        let args = call_args(r#"label_replace(m, "1bad", "", "job", ".*")"#);
        let err = func_label_replace(&[vector(&[("a", 1.0)])], &args, 0).unwrap_err();
        assert!(err.to_string().contains("invalid destination label name"));

        let args = call_args(r#"label_replace(m, "dst", "", "job", "(")"#);
        let err = func_label_replace(&[vector(&[("a", 1.0)])], &args, 0).unwrap_err();
        assert!(err.to_string().contains("invalid regular expression"));
    }

    #[test]
    fn test_absent() {
        let args = call_args(r#"absent(nonexistent{job="a", env="x", env="y", ins=~"z"})"#);
        let out = func_absent(&[Vec::new()], &args, 1000).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].metric, Labels::from_pairs([("job", "a")]));
        assert_eq!(out[0].v, 1.0);

        let out = func_absent(&[vector(&[("a", 1.0)])], &args, 1000).unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn test_sort() {
        let input = vector(&[("a", 3.0), ("b", f64::NAN), ("c", 1.0)]);
        let asc: Vec<String> = func_sort(&[input.clone()], &[], 0)
            .unwrap()
            .iter()
            .map(|s| s.metric.get("job").unwrap_or("").to_string())
            .collect();
        assert_eq!(asc, vec!["b", "c", "a"]);
        let desc: Vec<String> = func_sort_desc(&[input], &[], 0)
            .unwrap()
            .iter()
            .map(|s| s.metric.get("job").unwrap_or("").to_string())
            .collect();
        assert_eq!(desc, vec!["b", "a", "c"]);
    }
}
