//! Step-invariant rewriting
//!
//! Subtrees whose value is the same at every step of a range query are
//! wrapped in `Expr::StepInvariant` so the evaluator computes them once
//! and broadcasts the result.
//!
//! # Rules
//!
//! - A selector is invariant when it carries an `@` timestamp.
//! - Literals are neutral: they never make a subtree invariant on their
//!   own, but they do not stop an anchored sibling from being so.
//! - Aggregations, binary operators, unary operators, parentheses and
//!   calls are invariant when no child varies and at least one child is
//!   invariant. Calls to functions that read the evaluation time
//!   (`time()`, `hour()`, ...) are never invariant.
//! - A subquery is invariant only through its own `@`; an invariant inner
//!   expression is wrapped either way.
//!
//! When a composite node is not invariant, each invariant child is
//! wrapped individually. Wrapping never nests, so rewriting is
//! idempotent, and untouched subtrees are shared with the input.

use std::sync::Arc;

use crate::query::ast::{
    AggregateExpr, BinaryExpr, Call, Expr, ParenExpr, StepInvariantExpr, SubqueryExpr, UnaryExpr,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Invariance {
    /// Depends on the evaluation step
    Variant,
    /// Constant, but not anchored (literals)
    Neutral,
    /// Pinned by `@`
    Invariant,
}

impl Invariance {
    fn combine(states: impl IntoIterator<Item = Invariance>) -> Invariance {
        let mut result = Invariance::Neutral;
        for state in states {
            match state {
                Invariance::Variant => return Invariance::Variant,
                Invariance::Invariant => result = Invariance::Invariant,
                Invariance::Neutral => {}
            }
        }
        result
    }
}

/// Wrap step-invariant subtrees of `expr`
pub fn rewrite_step_invariant(expr: Arc<Expr>) -> Arc<Expr> {
    let (expr, state) = preprocess(&expr);
    if state == Invariance::Invariant {
        wrap(expr)
    } else {
        expr
    }
}

fn wrap(expr: Arc<Expr>) -> Arc<Expr> {
    if matches!(*expr, Expr::StepInvariant(_)) {
        return expr;
    }
    Arc::new(Expr::StepInvariant(StepInvariantExpr { expr }))
}

fn wrap_if(expr: Arc<Expr>, state: Invariance) -> Arc<Expr> {
    if state == Invariance::Invariant {
        wrap(expr)
    } else {
        expr
    }
}

fn selector_state(timestamp: Option<i64>) -> Invariance {
    if timestamp.is_some() {
        Invariance::Invariant
    } else {
        Invariance::Variant
    }
}

/// Returns the rewritten node and its invariance. The node is reused
/// when nothing below it changed.
fn preprocess(expr: &Arc<Expr>) -> (Arc<Expr>, Invariance) {
    match &**expr {
        Expr::StepInvariant(_) => (expr.clone(), Invariance::Invariant),
        Expr::NumberLiteral(_) | Expr::StringLiteral(_) => (expr.clone(), Invariance::Neutral),
        Expr::VectorSelector(vs) => (expr.clone(), selector_state(vs.timestamp)),
        Expr::MatrixSelector(ms) => (expr.clone(), selector_state(ms.selector.timestamp)),

        Expr::Paren(p) => {
            let (inner, state) = preprocess(&p.expr);
            let node = if Arc::ptr_eq(&inner, &p.expr) {
                expr.clone()
            } else {
                Arc::new(Expr::Paren(ParenExpr {
                    expr: inner,
                    pos: p.pos,
                }))
            };
            (node, state)
        }

        Expr::Unary(u) => {
            let (inner, state) = preprocess(&u.expr);
            let node = if Arc::ptr_eq(&inner, &u.expr) {
                expr.clone()
            } else {
                Arc::new(Expr::Unary(UnaryExpr {
                    op: u.op,
                    expr: inner,
                    start: u.start,
                }))
            };
            (node, state)
        }

        Expr::Aggregate(a) => {
            let (inner, inner_state) = preprocess(&a.expr);
            let (param, param_state) = match &a.param {
                Some(p) => {
                    let (p, s) = preprocess(p);
                    (Some(p), s)
                }
                None => (None, Invariance::Neutral),
            };
            let state = Invariance::combine([inner_state, param_state]);
            let (inner, param) = if state == Invariance::Invariant {
                (inner, param)
            } else {
                (
                    wrap_if(inner, inner_state),
                    param.map(|p| wrap_if(p, param_state)),
                )
            };

            let unchanged = Arc::ptr_eq(&inner, &a.expr)
                && match (&param, &a.param) {
                    (Some(new), Some(old)) => Arc::ptr_eq(new, old),
                    (None, None) => true,
                    _ => false,
                };
            let node = if unchanged {
                expr.clone()
            } else {
                Arc::new(Expr::Aggregate(AggregateExpr {
                    op: a.op,
                    expr: inner,
                    param,
                    grouping: a.grouping.clone(),
                    without: a.without,
                    pos: a.pos,
                }))
            };
            (node, state)
        }

        Expr::Binary(b) => {
            let (lhs, lhs_state) = preprocess(&b.lhs);
            let (rhs, rhs_state) = preprocess(&b.rhs);
            let state = Invariance::combine([lhs_state, rhs_state]);
            let (lhs, rhs) = if state == Invariance::Invariant {
                (lhs, rhs)
            } else {
                (wrap_if(lhs, lhs_state), wrap_if(rhs, rhs_state))
            };

            let node = if Arc::ptr_eq(&lhs, &b.lhs) && Arc::ptr_eq(&rhs, &b.rhs) {
                expr.clone()
            } else {
                Arc::new(Expr::Binary(BinaryExpr {
                    op: b.op,
                    lhs,
                    rhs,
                    matching: b.matching.clone(),
                    return_bool: b.return_bool,
                }))
            };
            (node, state)
        }

        Expr::Call(c) => {
            let results: Vec<(Arc<Expr>, Invariance)> = c.args.iter().map(preprocess).collect();
            let mut state = Invariance::combine(results.iter().map(|(_, s)| *s));
            if c.func.is_at_modifier_unsafe() {
                state = Invariance::Variant;
            }

            let args: Vec<Arc<Expr>> = results
                .into_iter()
                .map(|(arg, arg_state)| {
                    if state == Invariance::Invariant {
                        arg
                    } else {
                        wrap_if(arg, arg_state)
                    }
                })
                .collect();

            let unchanged = args.iter().zip(&c.args).all(|(new, old)| Arc::ptr_eq(new, old));
            let node = if unchanged {
                expr.clone()
            } else {
                Arc::new(Expr::Call(Call {
                    func: c.func,
                    args,
                    pos: c.pos,
                }))
            };
            (node, state)
        }

        Expr::Subquery(sq) => {
            let (inner, inner_state) = preprocess(&sq.expr);
            let inner = wrap_if(inner, inner_state);
            let node = if Arc::ptr_eq(&inner, &sq.expr) {
                expr.clone()
            } else {
                Arc::new(Expr::Subquery(SubqueryExpr {
                    expr: inner,
                    range: sq.range,
                    step: sq.step,
                    offset: sq.offset,
                    timestamp: sq.timestamp,
                    end_pos: sq.end_pos,
                }))
            };
            (node, selector_state(sq.timestamp))
        }
    }
}
