//! Query result values
//!
//! A query produces exactly one of three value kinds. Internally the
//! evaluator works on matrices (one point per evaluation step) and the
//! engine converts the final matrix to the statement's result kind.
//!
//! Values serialize to the JSON shape of the Prometheus HTTP API:
//!
//! ```text
//! {"resultType":"vector","result":[{"metric":{"job":"api"},"value":[10.5,"1"]}]}
//! ```

use std::collections::HashSet;
use std::fmt;

use serde::ser::{SerializeMap, SerializeSeq, SerializeStruct};
use serde::{Serialize, Serializer};

use crate::query::ast::ValueType;
use crate::storage::{Labels, Point, Series};

/// One sample of an instant vector
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub metric: Labels,
    pub t: i64,
    pub v: f64,
}

impl Sample {
    pub fn new(metric: Labels, t: i64, v: f64) -> Self {
        Self { metric, t, v }
    }
}

pub type Vector = Vec<Sample>;

pub type Matrix = Vec<Series>;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Scalar {
    pub t: i64,
    pub v: f64,
}

/// Result of a query
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Scalar(Scalar),
    Vector(Vector),
    Matrix(Matrix),
}

impl Value {
    pub fn value_type(&self) -> ValueType {
        match self {
            Value::Scalar(_) => ValueType::Scalar,
            Value::Vector(_) => ValueType::Vector,
            Value::Matrix(_) => ValueType::Matrix,
        }
    }

    pub fn as_scalar(&self) -> Option<&Scalar> {
        match self {
            Value::Scalar(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_vector(&self) -> Option<&Vector> {
        match self {
            Value::Vector(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_matrix(&self) -> Option<&Matrix> {
        match self {
            Value::Matrix(m) => Some(m),
            _ => None,
        }
    }
}

/// True if two samples share a label set
pub(crate) fn contains_same_labelset(vector: &[Sample]) -> bool {
    let mut seen = HashSet::with_capacity(vector.len());
    vector.iter().any(|s| !seen.insert(&s.metric))
}

pub(crate) fn matrix_contains_same_labelset(matrix: &[Series]) -> bool {
    let mut seen = HashSet::with_capacity(matrix.len());
    matrix.iter().any(|s| !seen.insert(&s.labels))
}

/// Render a float the way PromQL prints sample values
pub fn format_value(v: f64) -> String {
    if v.is_nan() {
        "NaN".to_string()
    } else if v == f64::INFINITY {
        "+Inf".to_string()
    } else if v == f64::NEG_INFINITY {
        "-Inf".to_string()
    } else {
        v.to_string()
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Scalar(s) => write!(f, "scalar: {} @[{}]", format_value(s.v), s.t),
            Value::Vector(vector) => {
                let lines: Vec<String> = vector
                    .iter()
                    .map(|s| format!("{} => {} @[{}]", s.metric, format_value(s.v), s.t))
                    .collect();
                write!(f, "{}", lines.join("\n"))
            }
            Value::Matrix(matrix) => {
                let blocks: Vec<String> = matrix
                    .iter()
                    .map(|s| {
                        let points: Vec<String> = s
                            .points
                            .iter()
                            .map(|p| format!("{} @[{}]", format_value(p.v), p.t))
                            .collect();
                        format!("{} =>\n{}", s.labels, points.join("\n"))
                    })
                    .collect();
                write!(f, "{}", blocks.join("\n"))
            }
        }
    }
}

/// `[seconds, "value"]`
struct PointJson<'a>(&'a Point);

impl Serialize for PointJson<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(2))?;
        seq.serialize_element(&(self.0.t as f64 / 1000.0))?;
        seq.serialize_element(&format_value(self.0.v))?;
        seq.end()
    }
}

struct SampleJson<'a>(&'a Sample);

impl Serialize for SampleJson<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(2))?;
        map.serialize_entry("metric", &self.0.metric)?;
        map.serialize_entry("value", &PointJson(&Point::new(self.0.t, self.0.v)))?;
        map.end()
    }
}

struct SeriesJson<'a>(&'a Series);

impl Serialize for SeriesJson<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let values: Vec<PointJson<'_>> = self.0.points.iter().map(PointJson).collect();
        let mut map = serializer.serialize_map(Some(2))?;
        map.serialize_entry("metric", &self.0.labels)?;
        map.serialize_entry("values", &values)?;
        map.end()
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut st = serializer.serialize_struct("Value", 2)?;
        match self {
            Value::Scalar(s) => {
                st.serialize_field("resultType", "scalar")?;
                st.serialize_field("result", &PointJson(&Point::new(s.t, s.v)))?;
            }
            Value::Vector(vector) => {
                let result: Vec<SampleJson<'_>> = vector.iter().map(SampleJson).collect();
                st.serialize_field("resultType", "vector")?;
                st.serialize_field("result", &result)?;
            }
            Value::Matrix(matrix) => {
                let result: Vec<SeriesJson<'_>> = matrix.iter().map(SeriesJson).collect();
                st.serialize_field("resultType", "matrix")?;
                st.serialize_field("result", &result)?;
            }
        }
        st.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::METRIC_NAME;

    #[test]
    fn test_vector_json() {
        let value = Value::Vector(vec![Sample::new(
            Labels::from_pairs([(METRIC_NAME, "up"), ("job", "api")]),
            10_500,
            1.0,
        )]);
        let json = serde_json::to_value(&value).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "resultType": "vector",
                "result": [{"metric": {"__name__": "up", "job": "api"}, "value": [10.5, "1"]}]
            })
        );
    }

    #[test]
    fn test_matrix_and_scalar_json() {
        let value = Value::Matrix(vec![Series {
            labels: Labels::from_pairs([("job", "api")]),
            points: vec![Point::new(0, f64::INFINITY), Point::new(1000, 2.5)],
        }]);
        let json = serde_json::to_value(&value).unwrap();
        assert_eq!(json["resultType"], "matrix");
        assert_eq!(json["result"][0]["values"][0][1], "+Inf");
        assert_eq!(json["result"][0]["values"][1], serde_json::json!([1.0, "2.5"]));

        let json = serde_json::to_value(Value::Scalar(Scalar { t: 2000, v: f64::NAN })).unwrap();
        assert_eq!(json["result"], serde_json::json!([2.0, "NaN"]));
    }

    #[test]
    fn test_same_labelset_detection() {
        let a = Labels::from_pairs([("job", "a")]);
        let b = Labels::from_pairs([("job", "b")]);
        assert!(!contains_same_labelset(&[
            Sample::new(a.clone(), 0, 1.0),
            Sample::new(b, 0, 1.0)
        ]));
        assert!(contains_same_labelset(&[
            Sample::new(a.clone(), 0, 1.0),
            Sample::new(a, 0, 2.0)
        ]));
    }

    #[test]
    fn test_display() {
        let value = Value::Vector(vec![Sample::new(Labels::from_pairs([("a", "b")]), 0, 3.0)]);
        assert_eq!(value.to_string(), "{a=\"b\"} => 3 @[0]");
    }
}
