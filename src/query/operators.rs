//! Per-step operators
//!
//! Aggregations and binary operations work on one evaluation step at a
//! time: they take the instant vectors of their operands and produce the
//! output vector for that step. The evaluator stitches the per-step
//! results back into series.
//!
//! # Vector Matching
//!
//! Samples on both sides of a vector operation are paired by their
//! *signature*: the label set reduced to the `on(...)` labels, or with the
//! `ignoring(...)` labels and the metric name removed.

use std::collections::{HashMap, HashSet};

use crate::query::ast::{AggregateOp, BinaryOp, MatchCardinality, VectorMatching};
use crate::query::error::{QueryError, QueryResult};
use crate::query::value::{format_value, Sample, Vector};
use crate::storage::Labels;

// =============================================================================
// Aggregation
// =============================================================================

/// Leading parameter of an aggregation, already evaluated for the step
#[derive(Debug, Clone, Copy)]
pub(crate) enum AggregateParam<'a> {
    None,
    Scalar(f64),
    Label(&'a str),
}

struct Group {
    labels: Labels,
    value: f64,
    mean: f64,
    count: usize,
    samples: Vec<Sample>,
}

fn is_valid_label_name(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Aggregate one step's vector into groups
pub(crate) fn aggregate(
    op: AggregateOp,
    grouping: &[String],
    without: bool,
    param: AggregateParam<'_>,
    vector: &[Sample],
    ts: i64,
) -> QueryResult<Vector> {
    let mut grouping = grouping.to_vec();
    let value_label = match (op, param) {
        (AggregateOp::CountValues, AggregateParam::Label(label)) => {
            if !is_valid_label_name(label) {
                return Err(QueryError::Execution(format!("invalid label name {:?}", label)));
            }
            if !without {
                grouping.push(label.to_string());
            }
            Some(label)
        }
        _ => None,
    };

    let k = match (op, param) {
        (AggregateOp::Topk | AggregateOp::Bottomk, AggregateParam::Scalar(k)) => {
            if k.is_nan() || k < 1.0 {
                return Ok(Vec::new());
            }
            k as usize
        }
        _ => 0,
    };

    let mut index: HashMap<Labels, usize> = HashMap::new();
    let mut groups: Vec<Group> = Vec::new();

    for sample in vector {
        let metric = match value_label {
            Some(label) => sample.metric.with(label, &format_value(sample.v)),
            None => sample.metric.clone(),
        };
        let key = if without {
            metric.without(&grouping).drop_metric_name()
        } else {
            metric.keep(&grouping)
        };

        let slot = match index.get(&key) {
            Some(&slot) => slot,
            None => {
                index.insert(key.clone(), groups.len());
                let value = match op {
                    AggregateOp::Stddev | AggregateOp::Stdvar => 0.0,
                    _ => sample.v,
                };
                groups.push(Group {
                    labels: key,
                    value,
                    mean: sample.v,
                    count: 1,
                    samples: vec![sample.clone()],
                });
                continue;
            }
        };

        let group = &mut groups[slot];
        group.count += 1;
        match op {
            AggregateOp::Sum => group.value += sample.v,
            AggregateOp::Avg => {
                let n = group.count as f64;
                if group.mean.is_infinite() {
                    if sample.v.is_infinite() && (group.mean > 0.0) == (sample.v > 0.0) {
                        continue;
                    }
                    if !sample.v.is_infinite() && !sample.v.is_nan() {
                        continue;
                    }
                }
                // Divide both terms to stay clear of overflow.
                group.mean += sample.v / n - group.mean / n;
            }
            AggregateOp::Max => {
                if group.value < sample.v || group.value.is_nan() {
                    group.value = sample.v;
                }
            }
            AggregateOp::Min => {
                if group.value > sample.v || group.value.is_nan() {
                    group.value = sample.v;
                }
            }
            AggregateOp::Stddev | AggregateOp::Stdvar => {
                let delta = sample.v - group.mean;
                group.mean += delta / group.count as f64;
                group.value += delta * (sample.v - group.mean);
            }
            AggregateOp::Topk | AggregateOp::Bottomk | AggregateOp::Quantile => {
                group.samples.push(sample.clone());
            }
            AggregateOp::Count | AggregateOp::Group | AggregateOp::CountValues => {}
        }
    }

    let mut out = Vec::with_capacity(groups.len());
    for group in groups {
        let v = match op {
            AggregateOp::Sum | AggregateOp::Min | AggregateOp::Max => group.value,
            AggregateOp::Avg => group.mean,
            AggregateOp::Count | AggregateOp::CountValues => group.count as f64,
            AggregateOp::Group => 1.0,
            AggregateOp::Stdvar => group.value / group.count as f64,
            AggregateOp::Stddev => (group.value / group.count as f64).sqrt(),
            AggregateOp::Quantile => {
                let q = match param {
                    AggregateParam::Scalar(q) => q,
                    _ => f64::NAN,
                };
                let mut values: Vec<f64> = group.samples.iter().map(|s| s.v).collect();
                quantile(q, &mut values)
            }
            AggregateOp::Topk | AggregateOp::Bottomk => {
                let mut samples = group.samples;
                let descending = op == AggregateOp::Topk;
                samples.sort_by(|a, b| {
                    // NaN sorts last in both directions.
                    match (a.v.is_nan(), b.v.is_nan()) {
                        (true, true) => std::cmp::Ordering::Equal,
                        (true, false) => std::cmp::Ordering::Greater,
                        (false, true) => std::cmp::Ordering::Less,
                        (false, false) if descending => b.v.total_cmp(&a.v),
                        (false, false) => a.v.total_cmp(&b.v),
                    }
                });
                samples.truncate(k);
                out.extend(samples.into_iter().map(|s| Sample::new(s.metric, ts, s.v)));
                continue;
            }
        };
        out.push(Sample::new(group.labels, ts, v));
    }
    Ok(out)
}

/// Interpolated `q`-quantile; sorts `values` in place
pub(crate) fn quantile(q: f64, values: &mut [f64]) -> f64 {
    if values.is_empty() || q.is_nan() {
        return f64::NAN;
    }
    if q < 0.0 {
        return f64::NEG_INFINITY;
    }
    if q > 1.0 {
        return f64::INFINITY;
    }
    values.sort_by(|a, b| a.total_cmp(b));

    let n = values.len() as f64;
    let rank = q * (n - 1.0);
    let lower = rank.floor().max(0.0);
    let upper = (lower + 1.0).min(n - 1.0);
    let weight = rank - rank.floor();
    values[lower as usize] * (1.0 - weight) + values[upper as usize] * weight
}

// =============================================================================
// Binary operators
// =============================================================================

/// Arithmetic operators drop `__name__` from their results
fn drops_metric_name(op: BinaryOp) -> bool {
    matches!(
        op,
        BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div | BinaryOp::Mod | BinaryOp::Pow
    )
}

/// Apply `op` to two values. The flag says whether the element is kept,
/// which is only ever false for comparisons.
pub(crate) fn elem_binop(op: BinaryOp, lhs: f64, rhs: f64) -> (f64, bool) {
    match op {
        BinaryOp::Add => (lhs + rhs, true),
        BinaryOp::Sub => (lhs - rhs, true),
        BinaryOp::Mul => (lhs * rhs, true),
        BinaryOp::Div => (lhs / rhs, true),
        BinaryOp::Mod => (lhs % rhs, true),
        BinaryOp::Pow => (lhs.powf(rhs), true),
        BinaryOp::Eql => (lhs, lhs == rhs),
        BinaryOp::Neq => (lhs, lhs != rhs),
        BinaryOp::Gtr => (lhs, lhs > rhs),
        BinaryOp::Lss => (lhs, lhs < rhs),
        BinaryOp::Gte => (lhs, lhs >= rhs),
        BinaryOp::Lte => (lhs, lhs <= rhs),
        BinaryOp::And | BinaryOp::Or | BinaryOp::Unless => (f64::NAN, false),
    }
}

/// Scalar-scalar operation; comparisons yield 1 or 0
pub(crate) fn scalar_binop(op: BinaryOp, lhs: f64, rhs: f64) -> f64 {
    let (value, keep) = elem_binop(op, lhs, rhs);
    if op.is_comparison() {
        if keep {
            1.0
        } else {
            0.0
        }
    } else {
        value
    }
}

/// Vector-scalar operation. `swap` is set when the scalar was the
/// left-hand operand.
pub(crate) fn vector_scalar_binop(
    op: BinaryOp,
    vector: &[Sample],
    scalar: f64,
    swap: bool,
    return_bool: bool,
) -> Vector {
    let mut out = Vec::with_capacity(vector.len());
    for sample in vector {
        let (lv, rv) = if swap {
            (scalar, sample.v)
        } else {
            (sample.v, scalar)
        };
        let (mut value, mut keep) = elem_binop(op, lv, rv);
        // Comparisons keep the vector's value even when it is on the right.
        if op.is_comparison() && swap {
            value = rv;
        }
        if return_bool {
            value = if keep { 1.0 } else { 0.0 };
            keep = true;
        }
        if keep {
            let metric = if drops_metric_name(op) || return_bool {
                sample.metric.drop_metric_name()
            } else {
                sample.metric.clone()
            };
            out.push(Sample::new(metric, sample.t, value));
        }
    }
    out
}

/// Matching key of a label set
fn signature(labels: &Labels, matching: &VectorMatching) -> Labels {
    if matching.on {
        labels.keep(&matching.labels)
    } else {
        labels.without(&matching.labels).drop_metric_name()
    }
}

/// Labels of a vector-vector result, built from the "many" side
fn result_metric(lhs: &Labels, rhs: &Labels, op: BinaryOp, matching: &VectorMatching) -> Labels {
    let mut metric = if drops_metric_name(op) {
        lhs.drop_metric_name()
    } else {
        lhs.clone()
    };
    if matching.card == MatchCardinality::OneToOne {
        metric = if matching.on {
            metric.keep(&matching.labels)
        } else {
            metric.without(&matching.labels)
        };
    }
    for name in &matching.include {
        // Included labels come from the "one" side; a missing one is removed.
        metric = metric.with(name, rhs.get(name).unwrap_or(""));
    }
    metric
}

/// Vector-vector arithmetic or comparison
pub(crate) fn vector_binop(
    op: BinaryOp,
    lhs: &[Sample],
    rhs: &[Sample],
    matching: &VectorMatching,
    return_bool: bool,
) -> QueryResult<Vector> {
    if matching.card == MatchCardinality::ManyToMany {
        return Err(QueryError::Execution(
            "many-to-many only allowed for set operators".to_string(),
        ));
    }
    if lhs.is_empty() || rhs.is_empty() {
        return Ok(Vec::new());
    }

    // The "one" side always ends up on the right.
    let one_to_many = matching.card == MatchCardinality::OneToMany;
    let (lhs, rhs) = if one_to_many { (rhs, lhs) } else { (lhs, rhs) };

    let mut right_sigs: HashMap<Labels, &Sample> = HashMap::with_capacity(rhs.len());
    for rs in rhs {
        let sig = signature(&rs.metric, matching);
        if let Some(dupl) = right_sigs.get(&sig) {
            let one_side = if one_to_many { "left" } else { "right" };
            return Err(QueryError::Execution(format!(
                "found duplicate series for the match group {} on the {} hand-side of the operation: [{}, {}];\
                 many-to-many matching not allowed: matching labels must be unique on one side",
                sig, one_side, rs.metric, dupl.metric
            )));
        }
        right_sigs.insert(sig, rs);
    }

    // One-to-one: signatures already matched. Many-to-one: result label
    // sets already produced per signature.
    let mut matched: HashMap<Labels, HashSet<Labels>> = HashMap::new();
    let mut out = Vec::new();

    for ls in lhs {
        let sig = signature(&ls.metric, matching);
        let Some(rs) = right_sigs.get(&sig) else {
            continue;
        };

        let (vl, vr) = if one_to_many {
            (rs.v, ls.v)
        } else {
            (ls.v, rs.v)
        };
        let (mut value, keep) = elem_binop(op, vl, vr);
        if return_bool {
            value = if keep { 1.0 } else { 0.0 };
        } else if !keep {
            continue;
        }

        let mut metric = result_metric(&ls.metric, &rs.metric, op, matching);
        if return_bool {
            metric = metric.drop_metric_name();
        }

        let exists = matched.contains_key(&sig);
        let inserted = matched.entry(sig).or_default();
        if matching.card == MatchCardinality::OneToOne {
            if exists {
                return Err(QueryError::Execution(
                    "multiple matches for labels: many-to-one matching must be explicit (group_left/group_right)"
                        .to_string(),
                ));
            }
        } else if !inserted.insert(metric.clone()) {
            return Err(QueryError::Execution(
                "multiple matches for labels: grouping labels must ensure unique matches".to_string(),
            ));
        }

        out.push(Sample::new(metric, ls.t, value));
    }
    Ok(out)
}

/// `and`, `or` and `unless`
pub(crate) fn vector_set_op(
    op: BinaryOp,
    lhs: &[Sample],
    rhs: &[Sample],
    matching: &VectorMatching,
) -> QueryResult<Vector> {
    match op {
        BinaryOp::And => {
            if lhs.is_empty() || rhs.is_empty() {
                return Ok(Vec::new());
            }
            let right: HashSet<Labels> = rhs.iter().map(|s| signature(&s.metric, matching)).collect();
            Ok(lhs
                .iter()
                .filter(|s| right.contains(&signature(&s.metric, matching)))
                .cloned()
                .collect())
        }
        BinaryOp::Or => {
            if lhs.is_empty() {
                return Ok(rhs.to_vec());
            }
            if rhs.is_empty() {
                return Ok(lhs.to_vec());
            }
            let left: HashSet<Labels> = lhs.iter().map(|s| signature(&s.metric, matching)).collect();
            let mut out = lhs.to_vec();
            out.extend(
                rhs.iter()
                    .filter(|s| !left.contains(&signature(&s.metric, matching)))
                    .cloned(),
            );
            Ok(out)
        }
        BinaryOp::Unless => {
            if lhs.is_empty() || rhs.is_empty() {
                return Ok(lhs.to_vec());
            }
            let right: HashSet<Labels> = rhs.iter().map(|s| signature(&s.metric, matching)).collect();
            Ok(lhs
                .iter()
                .filter(|s| !right.contains(&signature(&s.metric, matching)))
                .cloned()
                .collect())
        }
        other => Err(QueryError::Execution(format!(
            "operator {:?} is not a set operator",
            other.to_string()
        ))),
    }
}
