//! Metadata filter predicates.
//!
//! Filters use a JSON "where" syntax:
//!
//! ```text
//! {"lang": "en"}                             equality
//! {"year": {"$gte": 2020}}                   $eq $ne $gt $gte $lt $lte
//! {"tag": {"$in": ["a", "b"]}}               $in $nin
//! {"draft": {"$exists": false}}              $exists
//! {"$and": [..]}  {"$or": [..]}  {"$not": {..}}
//! ```
//!
//! An object with several keys is an implicit `$and`.
//!
//! Evaluation: equality holds only between values of the same scalar type,
//! ordering compares number with number or string with string (anything else
//! is false), and a missing key fails every predicate except `$ne`, `$nin`
//! and `$exists: false`.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{QuiverError, Result};
use crate::vector::record::{Metadata, MetadataValue};

/// A comparison applied to one metadata key.
#[derive(Debug, Clone, PartialEq)]
pub enum Comparison {
    Eq(MetadataValue),
    Ne(MetadataValue),
    Gt(MetadataValue),
    Gte(MetadataValue),
    Lt(MetadataValue),
    Lte(MetadataValue),
    In(Vec<MetadataValue>),
    Nin(Vec<MetadataValue>),
    Exists(bool),
}

/// A boolean predicate over record metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Value", into = "Value")]
pub enum MetadataFilter {
    And(Vec<MetadataFilter>),
    Or(Vec<MetadataFilter>),
    Not(Box<MetadataFilter>),
    Field { key: String, op: Comparison },
}

impl MetadataFilter {
    /// Shorthand for an equality predicate.
    pub fn eq(key: impl Into<String>, value: impl Into<MetadataValue>) -> Self {
        MetadataFilter::Field {
            key: key.into(),
            op: Comparison::Eq(value.into()),
        }
    }

    /// Shorthand for an arbitrary comparison on `key`.
    pub fn field(key: impl Into<String>, op: Comparison) -> Self {
        MetadataFilter::Field {
            key: key.into(),
            op,
        }
    }

    /// Evaluate the predicate against a record's metadata.
    pub fn matches(&self, metadata: &Metadata) -> bool {
        match self {
            MetadataFilter::And(filters) => filters.iter().all(|f| f.matches(metadata)),
            MetadataFilter::Or(filters) => filters.iter().any(|f| f.matches(metadata)),
            MetadataFilter::Not(inner) => !inner.matches(metadata),
            MetadataFilter::Field { key, op } => op.evaluate(metadata.get(key)),
        }
    }

    /// Parse a filter from its JSON form.
    pub fn from_json(value: &Value) -> Result<Self> {
        let object = value
            .as_object()
            .ok_or_else(|| QuiverError::invalid_argument("filter must be a JSON object"))?;

        let mut clauses = Vec::with_capacity(object.len());
        for (key, value) in object {
            clauses.push(parse_clause(key, value)?);
        }

        if clauses.len() == 1 {
            Ok(clauses.remove(0))
        } else {
            Ok(MetadataFilter::And(clauses))
        }
    }

    /// Render the filter back into its JSON form.
    pub fn to_json(&self) -> Value {
        let mut object = Map::new();
        match self {
            MetadataFilter::And(filters) => {
                object.insert(
                    "$and".into(),
                    Value::Array(filters.iter().map(|f| f.to_json()).collect()),
                );
            }
            MetadataFilter::Or(filters) => {
                object.insert(
                    "$or".into(),
                    Value::Array(filters.iter().map(|f| f.to_json()).collect()),
                );
            }
            MetadataFilter::Not(inner) => {
                object.insert("$not".into(), inner.to_json());
            }
            MetadataFilter::Field { key, op } => {
                let (name, operand) = match op {
                    Comparison::Eq(v) => ("$eq", scalar_to_json(v)),
                    Comparison::Ne(v) => ("$ne", scalar_to_json(v)),
                    Comparison::Gt(v) => ("$gt", scalar_to_json(v)),
                    Comparison::Gte(v) => ("$gte", scalar_to_json(v)),
                    Comparison::Lt(v) => ("$lt", scalar_to_json(v)),
                    Comparison::Lte(v) => ("$lte", scalar_to_json(v)),
                    Comparison::In(vs) => ("$in", Value::Array(vs.iter().map(scalar_to_json).collect())),
                    Comparison::Nin(vs) => ("$nin", Value::Array(vs.iter().map(scalar_to_json).collect())),
                    Comparison::Exists(b) => ("$exists", Value::Bool(*b)),
                };
                let mut inner = Map::new();
                inner.insert(name.into(), operand);
                object.insert(key.clone(), Value::Object(inner));
            }
        }
        Value::Object(object)
    }
}

impl Comparison {
    fn evaluate(&self, actual: Option<&MetadataValue>) -> bool {
        let Some(actual) = actual else {
            return matches!(
                self,
                Comparison::Ne(_) | Comparison::Nin(_) | Comparison::Exists(false)
            );
        };

        match self {
            Comparison::Eq(expected) => scalar_eq(actual, expected),
            Comparison::Ne(expected) => !scalar_eq(actual, expected),
            Comparison::Gt(bound) => scalar_cmp(actual, bound) == Some(Ordering::Greater),
            Comparison::Gte(bound) => matches!(
                scalar_cmp(actual, bound),
                Some(Ordering::Greater | Ordering::Equal)
            ),
            Comparison::Lt(bound) => scalar_cmp(actual, bound) == Some(Ordering::Less),
            Comparison::Lte(bound) => matches!(
                scalar_cmp(actual, bound),
                Some(Ordering::Less | Ordering::Equal)
            ),
            Comparison::In(values) => values.iter().any(|v| scalar_eq(actual, v)),
            Comparison::Nin(values) => !values.iter().any(|v| scalar_eq(actual, v)),
            Comparison::Exists(expected) => *expected,
        }
    }
}

impl TryFrom<Value> for MetadataFilter {
    type Error = QuiverError;

    fn try_from(value: Value) -> Result<Self> {
        MetadataFilter::from_json(&value)
    }
}

impl From<MetadataFilter> for Value {
    fn from(filter: MetadataFilter) -> Self {
        filter.to_json()
    }
}

fn scalar_eq(a: &MetadataValue, b: &MetadataValue) -> bool {
    match (a, b) {
        (MetadataValue::String(x), MetadataValue::String(y)) => x == y,
        (MetadataValue::Number(x), MetadataValue::Number(y)) => x == y,
        (MetadataValue::Bool(x), MetadataValue::Bool(y)) => x == y,
        _ => false,
    }
}

fn scalar_cmp(a: &MetadataValue, b: &MetadataValue) -> Option<Ordering> {
    match (a, b) {
        (MetadataValue::String(x), MetadataValue::String(y)) => Some(x.cmp(y)),
        (MetadataValue::Number(x), MetadataValue::Number(y)) => x.partial_cmp(y),
        _ => None,
    }
}

fn parse_clause(key: &str, value: &Value) -> Result<MetadataFilter> {
    match key {
        "$and" | "$or" => {
            let items = value.as_array().ok_or_else(|| {
                QuiverError::invalid_argument(format!("{key} expects an array of filters"))
            })?;
            if items.is_empty() {
                return Err(QuiverError::invalid_argument(format!(
                    "{key} expects at least one filter"
                )));
            }
            let filters = items
                .iter()
                .map(MetadataFilter::from_json)
                .collect::<Result<Vec<_>>>()?;
            Ok(if key == "$and" {
                MetadataFilter::And(filters)
            } else {
                MetadataFilter::Or(filters)
            })
        }
        "$not" => Ok(MetadataFilter::Not(Box::new(MetadataFilter::from_json(
            value,
        )?))),
        _ if key.starts_with('$') => Err(QuiverError::invalid_argument(format!(
            "unknown logical operator {key}"
        ))),
        _ => match value {
            Value::Object(ops) => {
                let mut clauses = Vec::with_capacity(ops.len());
                for (op, operand) in ops {
                    clauses.push(MetadataFilter::field(key, parse_comparison(op, operand)?));
                }
                match clauses.len() {
                    0 => Err(QuiverError::invalid_argument(format!(
                        "empty operator object for {key}"
                    ))),
                    1 => Ok(clauses.remove(0)),
                    _ => Ok(MetadataFilter::And(clauses)),
                }
            }
            scalar => Ok(MetadataFilter::eq(key, parse_scalar(scalar)?)),
        },
    }
}

fn parse_comparison(op: &str, operand: &Value) -> Result<Comparison> {
    Ok(match op {
        "$eq" => Comparison::Eq(parse_scalar(operand)?),
        "$ne" => Comparison::Ne(parse_scalar(operand)?),
        "$gt" => Comparison::Gt(parse_scalar(operand)?),
        "$gte" => Comparison::Gte(parse_scalar(operand)?),
        "$lt" => Comparison::Lt(parse_scalar(operand)?),
        "$lte" => Comparison::Lte(parse_scalar(operand)?),
        "$in" => Comparison::In(parse_list(op, operand)?),
        "$nin" => Comparison::Nin(parse_list(op, operand)?),
        "$exists" => Comparison::Exists(operand.as_bool().ok_or_else(|| {
            QuiverError::invalid_argument("$exists expects a boolean")
        })?),
        _ => {
            return Err(QuiverError::invalid_argument(format!(
                "unknown comparison operator {op}"
            )));
        }
    })
}

fn parse_list(op: &str, operand: &Value) -> Result<Vec<MetadataValue>> {
    operand
        .as_array()
        .ok_or_else(|| QuiverError::invalid_argument(format!("{op} expects an array")))?
        .iter()
        .map(parse_scalar)
        .collect()
}

fn parse_scalar(value: &Value) -> Result<MetadataValue> {
    match value {
        Value::String(s) => Ok(MetadataValue::String(s.clone())),
        Value::Bool(b) => Ok(MetadataValue::Bool(*b)),
        Value::Number(n) => n
            .as_f64()
            .map(MetadataValue::Number)
            .ok_or_else(|| QuiverError::invalid_argument(format!("unsupported number {n}"))),
        other => Err(QuiverError::invalid_argument(format!(
            "filter operand must be a string, number or bool, got {other}"
        ))),
    }
}

fn scalar_to_json(value: &MetadataValue) -> Value {
    match value {
        MetadataValue::String(s) => Value::String(s.clone()),
        MetadataValue::Bool(b) => Value::Bool(*b),
        MetadataValue::Number(n) => serde_json::Number::from_f64(*n)
            .map(Value::Number)
            .unwrap_or(Value::Null),
    }
}
