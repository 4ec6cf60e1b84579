//! Time-range resolution
//!
//! Works out which absolute time window each selector of a statement
//! needs, and from that the window the whole statement reads from
//! storage.
//!
//! For one selector the window is derived from, in order:
//!
//! 1. the statement's `[start, end]`, or the timestamp of the innermost
//!    anchored (`@`) enclosing subquery
//! 2. the selector's own `@` timestamp, which replaces (1) entirely;
//!    otherwise the summed ranges and offsets of enclosing subqueries
//!    shift the window back
//! 3. the lookback delta (instant selectors) or the range (matrix
//!    selectors) widening the lower bound
//! 4. the selector's own offset shifting both bounds
//!
//! The same rules produce the `SelectHints` the evaluator sends with each
//! select, so both sides agree on what storage must return.

use crate::query::ast::{duration_ms, inspect, Expr, VectorSelector};
use crate::query::statement::EvalStmt;
use crate::storage::SelectHints;

/// Summed offset and range of enclosing subqueries, plus the timestamp of
/// the innermost anchored one. An anchor discards what came before it.
fn subquery_times(path: &[&Expr]) -> (i64, i64, Option<i64>) {
    let mut offset: i64 = 0;
    let mut range: i64 = 0;
    let mut ts = None;
    for node in path {
        if let Expr::Subquery(sq) = node {
            offset = offset.saturating_add(duration_ms(sq.offset));
            range = range.saturating_add(duration_ms(sq.range));
            if let Some(t) = sq.timestamp {
                offset = duration_ms(sq.offset);
                range = duration_ms(sq.range);
                ts = Some(t);
            }
        }
    }
    (offset, range, ts)
}

/// `[start, end]` one selector reads, in milliseconds
///
/// `range` is the matrix range in milliseconds, 0 for instant selectors.
pub(crate) fn selector_time_range(
    stmt: &EvalStmt,
    selector: &VectorSelector,
    path: &[&Expr],
    range: i64,
) -> (i64, i64) {
    let (mut start, mut end) = (stmt.start, stmt.end);
    let (subq_offset, subq_range, subq_ts) = subquery_times(path);
    if let Some(ts) = subq_ts {
        start = ts;
        end = ts;
    }

    match selector.timestamp {
        Some(ts) => {
            start = ts;
            end = ts;
        }
        None => {
            start = start.saturating_sub(subq_offset.saturating_add(subq_range));
            end = end.saturating_sub(subq_offset);
        }
    }

    if range == 0 {
        start = start.saturating_sub(stmt.lookback_delta);
    } else {
        start = start.saturating_sub(range);
    }

    let offset = duration_ms(selector.offset);
    (start.saturating_sub(offset), end.saturating_sub(offset))
}

/// Name of the nearest enclosing function or aggregation. A binary
/// operator in between hides it.
fn func_from_path(path: &[&Expr]) -> Option<String> {
    for node in path.iter().rev() {
        match node {
            Expr::Aggregate(a) => return Some(a.op.name().to_string()),
            Expr::Call(c) => return Some(c.func.name.to_string()),
            Expr::Binary(_) => return None,
            _ => {}
        }
    }
    None
}

/// Grouping of a directly enclosing aggregation
fn groups_from_path(path: &[&Expr]) -> (bool, Vec<String>) {
    match path.last() {
        Some(Expr::Aggregate(a)) => (!a.without, a.grouping.clone()),
        _ => (false, Vec::new()),
    }
}

/// Hints for one select call
pub(crate) fn selector_hints(
    stmt: &EvalStmt,
    selector: &VectorSelector,
    path: &[&Expr],
    range: i64,
) -> SelectHints {
    let (start, end) = selector_time_range(stmt, selector, path, range);
    let (by, grouping) = groups_from_path(path);
    SelectHints {
        start,
        end,
        step: stmt.interval,
        range,
        func: func_from_path(path),
        by,
        grouping,
    }
}

/// Call `f` for every selector with its ancestor path and matrix range
fn visit_selectors<'a, F>(expr: &'a Expr, f: &mut F)
where
    F: FnMut(&'a VectorSelector, &[&'a Expr], i64),
{
    inspect(expr, &mut |node, path| match node {
        Expr::VectorSelector(vs) => f(vs, path, 0),
        Expr::MatrixSelector(ms) => f(&ms.selector, path, duration_ms(ms.range)),
        _ => {}
    });
}

/// Window of samples the whole statement needs, as `(mint, maxt)`
///
/// Selectors that are not pinned by an `@` (their own or an enclosing
/// subquery's) extend the upper bound to the statement end. Without any
/// selector the window is the statement's own range widened by the
/// lookback delta.
pub fn find_min_max_time(stmt: &EvalStmt) -> (i64, i64) {
    let mut mint = i64::MAX;
    let mut maxt = i64::MIN;

    visit_selectors(&stmt.expr, &mut |selector, path, range| {
        let (start, end) = selector_time_range(stmt, selector, path, range);
        let anchored = selector.timestamp.is_some() || subquery_times(path).2.is_some();
        let end = if anchored { end } else { stmt.end.max(end) };
        mint = mint.min(start);
        maxt = maxt.max(end);
    });

    if maxt == i64::MIN {
        return (stmt.start.saturating_sub(stmt.lookback_delta), stmt.end);
    }
    (mint, maxt)
}

/// Hints for every selector, in the order they appear in the expression
pub fn collect_select_hints(stmt: &EvalStmt) -> Vec<SelectHints> {
    let mut hints = Vec::new();
    visit_selectors(&stmt.expr, &mut |selector, path, range| {
        hints.push(selector_hints(stmt, selector, path, range));
    });
    hints
}
