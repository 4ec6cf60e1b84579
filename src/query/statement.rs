//! Evaluation statements
//!
//! An `EvalStmt` is what a query evaluates: the (rewritten) expression and
//! the timing of the request. Instant queries have `start == end` and an
//! interval of zero.

use std::sync::Arc;

use crate::query::ast::Expr;

/// Expression plus evaluation timing, all in milliseconds
#[derive(Debug, Clone, PartialEq)]
pub struct EvalStmt {
    pub expr: Arc<Expr>,
    pub start: i64,
    pub end: i64,
    pub interval: i64,
    pub lookback_delta: i64,
}

impl EvalStmt {
    pub fn instant(expr: Arc<Expr>, ts: i64, lookback_delta: i64) -> Self {
        Self {
            expr,
            start: ts,
            end: ts,
            interval: 0,
            lookback_delta,
        }
    }

    pub fn range(expr: Arc<Expr>, start: i64, end: i64, interval: i64, lookback_delta: i64) -> Self {
        Self {
            expr,
            start,
            end,
            interval,
            lookback_delta,
        }
    }

    pub fn is_instant(&self) -> bool {
        self.start == self.end && self.interval == 0
    }

    /// Number of evaluation steps
    pub fn steps(&self) -> i64 {
        if self.interval == 0 {
            1
        } else {
            (self.end - self.start) / self.interval + 1
        }
    }
}
