//! Query Abstract Syntax Tree
//!
//! Defines the expression tree for PromQL. Nodes form a closed enum so
//! every pass (resolver, rewriter, evaluator) matches exhaustively.
//! Children are reference counted, which lets rewrites share untouched
//! subtrees with the tree they started from.
//!
//! # Example Expressions
//!
//! ```text
//! rate(http_requests_total{job="api"}[5m])
//! sum by (job) (foo @ 1609746000 offset 1h)
//! max_over_time(deriv(rate(errors[1m])[5m:1m])[10m:])
//! ```

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::query::functions::Function;
use crate::storage::{MatchType, Matcher, METRIC_NAME};

/// Byte offsets of a node in the query text
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PositionRange {
    pub start: usize,
    pub end: usize,
}

impl PositionRange {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }
}

/// Static type of an expression
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    Scalar,
    Vector,
    Matrix,
    String,
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValueType::Scalar => write!(f, "scalar"),
            ValueType::Vector => write!(f, "instant vector"),
            ValueType::Matrix => write!(f, "range vector"),
            ValueType::String => write!(f, "string"),
        }
    }
}

/// A PromQL expression
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    NumberLiteral(NumberLiteral),
    StringLiteral(StringLiteral),
    VectorSelector(VectorSelector),
    MatrixSelector(MatrixSelector),
    Subquery(SubqueryExpr),
    Binary(BinaryExpr),
    Unary(UnaryExpr),
    Aggregate(AggregateExpr),
    Call(Call),
    Paren(ParenExpr),
    /// Marks a subtree whose value does not change between steps
    StepInvariant(StepInvariantExpr),
}

#[derive(Debug, Clone, PartialEq)]
pub struct NumberLiteral {
    pub val: f64,
    pub pos: PositionRange,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StringLiteral {
    pub val: String,
    pub pos: PositionRange,
}

/// Instant vector selector: `name{matchers} @ T offset O`
#[derive(Debug, Clone, PartialEq)]
pub struct VectorSelector {
    pub name: Option<String>,
    /// All matchers, including the one for the metric name
    pub matchers: Vec<Matcher>,
    pub offset: Duration,
    /// Fixed evaluation time in milliseconds (`@` modifier)
    pub timestamp: Option<i64>,
    pub pos: PositionRange,
}

/// Range vector selector: `selector[range]`
#[derive(Debug, Clone, PartialEq)]
pub struct MatrixSelector {
    pub selector: VectorSelector,
    pub range: Duration,
    pub end_pos: usize,
}

/// `expr[range:step] @ T offset O`
#[derive(Debug, Clone, PartialEq)]
pub struct SubqueryExpr {
    pub expr: Arc<Expr>,
    pub range: Duration,
    /// `None` when the step was omitted (`[5m:]`)
    pub step: Option<Duration>,
    pub offset: Duration,
    pub timestamp: Option<i64>,
    pub end_pos: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BinaryExpr {
    pub op: BinaryOp,
    pub lhs: Arc<Expr>,
    pub rhs: Arc<Expr>,
    /// Present when both sides are instant vectors
    pub matching: Option<VectorMatching>,
    /// `bool` modifier on comparisons
    pub return_bool: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UnaryExpr {
    pub op: UnaryOp,
    pub expr: Arc<Expr>,
    pub start: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AggregateExpr {
    pub op: AggregateOp,
    pub expr: Arc<Expr>,
    pub param: Option<Arc<Expr>>,
    pub grouping: Vec<String>,
    pub without: bool,
    pub pos: PositionRange,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    pub func: &'static Function,
    pub args: Vec<Arc<Expr>>,
    pub pos: PositionRange,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParenExpr {
    pub expr: Arc<Expr>,
    pub pos: PositionRange,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StepInvariantExpr {
    pub expr: Arc<Expr>,
}

/// How series on both sides of a vector binary operation are paired
#[derive(Debug, Clone, PartialEq)]
pub struct VectorMatching {
    pub card: MatchCardinality,
    /// `on(...)` when true, `ignoring(...)` otherwise
    pub on: bool,
    pub labels: Vec<String>,
    /// Extra labels copied from the "one" side for group modifiers
    pub include: Vec<String>,
}

impl Default for VectorMatching {
    fn default() -> Self {
        Self {
            card: MatchCardinality::OneToOne,
            on: false,
            labels: Vec::new(),
            include: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchCardinality {
    OneToOne,
    ManyToOne,
    OneToMany,
    ManyToMany,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Add,
    Sub,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
    Eql,
    Neq,
    Gtr,
    Lss,
    Gte,
    Lte,
    And,
    Or,
    Unless,
}

impl BinaryOp {
    pub fn is_comparison(&self) -> bool {
        matches!(
            self,
            BinaryOp::Eql | BinaryOp::Neq | BinaryOp::Gtr | BinaryOp::Lss | BinaryOp::Gte | BinaryOp::Lte
        )
    }

    pub fn is_set_operator(&self) -> bool {
        matches!(self, BinaryOp::And | BinaryOp::Or | BinaryOp::Unless)
    }

    /// Binding strength, higher binds tighter
    pub fn precedence(&self) -> u8 {
        match self {
            BinaryOp::Or => 1,
            BinaryOp::And | BinaryOp::Unless => 2,
            BinaryOp::Eql
            | BinaryOp::Neq
            | BinaryOp::Gtr
            | BinaryOp::Lss
            | BinaryOp::Gte
            | BinaryOp::Lte => 3,
            BinaryOp::Add | BinaryOp::Sub => 4,
            BinaryOp::Mul | BinaryOp::Div | BinaryOp::Mod => 5,
            BinaryOp::Pow => 6,
        }
    }

    pub fn is_right_associative(&self) -> bool {
        matches!(self, BinaryOp::Pow)
    }
}

impl fmt::Display for BinaryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Mod => "%",
            BinaryOp::Pow => "^",
            BinaryOp::Eql => "==",
            BinaryOp::Neq => "!=",
            BinaryOp::Gtr => ">",
            BinaryOp::Lss => "<",
            BinaryOp::Gte => ">=",
            BinaryOp::Lte => "<=",
            BinaryOp::And => "and",
            BinaryOp::Or => "or",
            BinaryOp::Unless => "unless",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateOp {
    Sum,
    Avg,
    Count,
    Min,
    Max,
    Group,
    Stddev,
    Stdvar,
    Topk,
    Bottomk,
    CountValues,
    Quantile,
}

impl AggregateOp {
    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name.to_ascii_lowercase().as_str() {
            "sum" => AggregateOp::Sum,
            "avg" => AggregateOp::Avg,
            "count" => AggregateOp::Count,
            "min" => AggregateOp::Min,
            "max" => AggregateOp::Max,
            "group" => AggregateOp::Group,
            "stddev" => AggregateOp::Stddev,
            "stdvar" => AggregateOp::Stdvar,
            "topk" => AggregateOp::Topk,
            "bottomk" => AggregateOp::Bottomk,
            "count_values" => AggregateOp::CountValues,
            "quantile" => AggregateOp::Quantile,
            _ => return None,
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            AggregateOp::Sum => "sum",
            AggregateOp::Avg => "avg",
            AggregateOp::Count => "count",
            AggregateOp::Min => "min",
            AggregateOp::Max => "max",
            AggregateOp::Group => "group",
            AggregateOp::Stddev => "stddev",
            AggregateOp::Stdvar => "stdvar",
            AggregateOp::Topk => "topk",
            AggregateOp::Bottomk => "bottomk",
            AggregateOp::CountValues => "count_values",
            AggregateOp::Quantile => "quantile",
        }
    }

    /// Type of the leading parameter, if the operator takes one
    pub fn param_type(&self) -> Option<ValueType> {
        match self {
            AggregateOp::Topk | AggregateOp::Bottomk | AggregateOp::Quantile => {
                Some(ValueType::Scalar)
            }
            AggregateOp::CountValues => Some(ValueType::String),
            _ => None,
        }
    }
}

impl fmt::Display for AggregateOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl Expr {
    /// Static result type
    pub fn value_type(&self) -> ValueType {
        match self {
            Expr::NumberLiteral(_) => ValueType::Scalar,
            Expr::StringLiteral(_) => ValueType::String,
            Expr::VectorSelector(_) => ValueType::Vector,
            Expr::MatrixSelector(_) | Expr::Subquery(_) => ValueType::Matrix,
            Expr::Binary(b) => {
                if b.lhs.value_type() == ValueType::Scalar && b.rhs.value_type() == ValueType::Scalar
                {
                    ValueType::Scalar
                } else {
                    ValueType::Vector
                }
            }
            Expr::Unary(u) => u.expr.value_type(),
            Expr::Aggregate(_) => ValueType::Vector,
            Expr::Call(c) => c.func.return_type,
            Expr::Paren(p) => p.expr.value_type(),
            Expr::StepInvariant(s) => s.expr.value_type(),
        }
    }

    /// Source span covered by the node
    pub fn pos(&self) -> PositionRange {
        match self {
            Expr::NumberLiteral(n) => n.pos,
            Expr::StringLiteral(s) => s.pos,
            Expr::VectorSelector(v) => v.pos,
            Expr::MatrixSelector(m) => PositionRange::new(m.selector.pos.start, m.end_pos),
            Expr::Subquery(s) => PositionRange::new(s.expr.pos().start, s.end_pos),
            Expr::Binary(b) => PositionRange::new(b.lhs.pos().start, b.rhs.pos().end),
            Expr::Unary(u) => PositionRange::new(u.start, u.expr.pos().end),
            Expr::Aggregate(a) => a.pos,
            Expr::Call(c) => c.pos,
            Expr::Paren(p) => p.pos,
            Expr::StepInvariant(s) => s.expr.pos(),
        }
    }

    /// Direct child expressions in evaluation order
    pub fn children(&self) -> Vec<&Arc<Expr>> {
        match self {
            Expr::NumberLiteral(_)
            | Expr::StringLiteral(_)
            | Expr::VectorSelector(_)
            | Expr::MatrixSelector(_) => Vec::new(),
            Expr::Subquery(s) => vec![&s.expr],
            Expr::Binary(b) => vec![&b.lhs, &b.rhs],
            Expr::Unary(u) => vec![&u.expr],
            Expr::Aggregate(a) => {
                let mut children = vec![&a.expr];
                if let Some(param) = &a.param {
                    children.push(param);
                }
                children
            }
            Expr::Call(c) => c.args.iter().collect(),
            Expr::Paren(p) => vec![&p.expr],
            Expr::StepInvariant(s) => vec![&s.expr],
        }
    }

    /// Strip any parentheses around the expression
    pub fn unwrap_parens(&self) -> &Expr {
        match self {
            Expr::Paren(p) => p.expr.unwrap_parens(),
            other => other,
        }
    }

    /// Strip parentheses and step-invariant markers
    pub fn unwrap_markers(&self) -> &Expr {
        match self {
            Expr::Paren(p) => p.expr.unwrap_markers(),
            Expr::StepInvariant(s) => s.expr.unwrap_markers(),
            other => other,
        }
    }
}

/// Visit every node depth first. The callback receives the node and the
/// chain of its ancestors, outermost first.
pub fn inspect<'a, F>(expr: &'a Expr, f: &mut F)
where
    F: FnMut(&'a Expr, &[&'a Expr]),
{
    let mut path = Vec::new();
    inspect_with_path(expr, &mut path, f);
}

fn inspect_with_path<'a, F>(expr: &'a Expr, path: &mut Vec<&'a Expr>, f: &mut F)
where
    F: FnMut(&'a Expr, &[&'a Expr]),
{
    f(expr, path);
    path.push(expr);
    for child in expr.children() {
        inspect_with_path(child, path, f);
    }
    path.pop();
}

/// Duration in whole milliseconds, saturating at `i64::MAX`
pub fn duration_ms(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

/// Render a duration the way PromQL writes it (`1h30m`, `90d`, `500ms`)
pub fn format_duration(d: Duration) -> String {
    let mut ms = d.as_millis() as u64;
    if ms == 0 {
        return "0s".to_string();
    }

    let mut out = String::new();
    let units: [(&str, u64, bool); 7] = [
        ("y", 1000 * 60 * 60 * 24 * 365, true),
        ("w", 1000 * 60 * 60 * 24 * 7, true),
        ("d", 1000 * 60 * 60 * 24, false),
        ("h", 1000 * 60 * 60, false),
        ("m", 1000 * 60, false),
        ("s", 1000, false),
        ("ms", 1, false),
    ];
    for (unit, mult, exact) in units {
        // Years and weeks only when nothing is left over; 90d reads better than 12w6d.
        if exact && ms % mult != 0 {
            continue;
        }
        let v = ms / mult;
        if v > 0 {
            out.push_str(&format!("{}{}", v, unit));
            ms -= v * mult;
        }
    }
    out
}

fn format_float(v: f64) -> String {
    if v.is_nan() {
        "NaN".to_string()
    } else if v.is_infinite() {
        if v > 0.0 { "+Inf" } else { "-Inf" }.to_string()
    } else {
        format!("{}", v)
    }
}

fn write_modifiers(
    f: &mut fmt::Formatter<'_>,
    timestamp: Option<i64>,
    offset: Duration,
) -> fmt::Result {
    if let Some(ts) = timestamp {
        write!(f, " @ {:.3}", ts as f64 / 1000.0)?;
    }
    if !offset.is_zero() {
        write!(f, " offset {}", format_duration(offset))?;
    }
    Ok(())
}

impl VectorSelector {
    fn write_base(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let matchers: Vec<String> = self
            .matchers
            .iter()
            .filter(|m| {
                !(self.name.is_some() && m.name == METRIC_NAME && m.kind == MatchType::Equal)
            })
            .map(|m| m.to_string())
            .collect();
        if let Some(name) = &self.name {
            write!(f, "{}", name)?;
        }
        if !matchers.is_empty() || self.name.is_none() {
            write!(f, "{{{}}}", matchers.join(", "))?;
        }
        Ok(())
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::NumberLiteral(n) => write!(f, "{}", format_float(n.val)),
            Expr::StringLiteral(s) => write!(f, "{:?}", s.val),
            Expr::VectorSelector(v) => {
                v.write_base(f)?;
                write_modifiers(f, v.timestamp, v.offset)
            }
            Expr::MatrixSelector(m) => {
                m.selector.write_base(f)?;
                write!(f, "[{}]", format_duration(m.range))?;
                write_modifiers(f, m.selector.timestamp, m.selector.offset)
            }
            Expr::Subquery(s) => {
                let step = s.step.map(format_duration).unwrap_or_default();
                write!(f, "{}[{}:{}]", s.expr, format_duration(s.range), step)?;
                write_modifiers(f, s.timestamp, s.offset)
            }
            Expr::Binary(b) => {
                write!(f, "{} {}", b.lhs, b.op)?;
                if b.return_bool {
                    write!(f, " bool")?;
                }
                if let Some(m) = &b.matching {
                    if m.on || !m.labels.is_empty() {
                        let kw = if m.on { "on" } else { "ignoring" };
                        write!(f, " {}({})", kw, m.labels.join(", "))?;
                    }
                    match m.card {
                        MatchCardinality::ManyToOne => {
                            write!(f, " group_left({})", m.include.join(", "))?
                        }
                        MatchCardinality::OneToMany => {
                            write!(f, " group_right({})", m.include.join(", "))?
                        }
                        _ => {}
                    }
                }
                write!(f, " {}", b.rhs)
            }
            Expr::Unary(u) => {
                let op = match u.op {
                    UnaryOp::Add => "+",
                    UnaryOp::Sub => "-",
                };
                write!(f, "{}{}", op, u.expr)
            }
            Expr::Aggregate(a) => {
                write!(f, "{}", a.op)?;
                if a.without {
                    write!(f, " without ({}) ", a.grouping.join(", "))?;
                } else if !a.grouping.is_empty() {
                    write!(f, " by ({}) ", a.grouping.join(", "))?;
                }
                write!(f, "(")?;
                if let Some(param) = &a.param {
                    write!(f, "{}, ", param)?;
                }
                write!(f, "{})", a.expr)
            }
            Expr::Call(c) => {
                let args: Vec<String> = c.args.iter().map(|a| a.to_string()).collect();
                write!(f, "{}({})", c.func.name, args.join(", "))
            }
            Expr::Paren(p) => write!(f, "({})", p.expr),
            Expr::StepInvariant(s) => write!(f, "{}", s.expr),
        }
    }
}
