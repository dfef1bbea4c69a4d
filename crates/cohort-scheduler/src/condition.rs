//! Condition predicates for `Condition` triggers.
//!
//! Supports simple comparisons over the event payload joined with `&&`:
//! - `amount > 50000`
//! - `vendor.risk_score >= 7 && vendor.status == 'pending'`
//! - `approved != true`
//!
//! Paths are dotted keys into the payload object. A missing path never matches.

use serde_json::Value;

use crate::error::{SchedulerError, SchedulerResult};

/// Comparison operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
}

/// One `path op literal` comparison.
#[derive(Debug, Clone, PartialEq)]
pub struct Clause {
    pub path: Vec<String>,
    pub op: CompareOp,
    pub value: Value,
}

/// A parsed predicate: all clauses must hold.
#[derive(Debug, Clone, PartialEq)]
pub struct Predicate {
    clauses: Vec<Clause>,
}

// Two-character operators first so ">=" isn't read as ">".
const OPERATORS: [(&str, CompareOp); 6] = [
    ("==", CompareOp::Eq),
    ("!=", CompareOp::Ne),
    (">=", CompareOp::Ge),
    ("<=", CompareOp::Le),
    (">", CompareOp::Gt),
    ("<", CompareOp::Lt),
];

impl Predicate {
    /// Parse a predicate expression.
    pub fn parse(expression: &str) -> SchedulerResult<Self> {
        let clauses = expression
            .split("&&")
            .map(parse_clause)
            .collect::<SchedulerResult<Vec<_>>>()?;
        Ok(Self { clauses })
    }

    pub fn clauses(&self) -> &[Clause] {
        &self.clauses
    }

    /// Evaluate against an event payload.
    pub fn evaluate(&self, payload: &Value) -> bool {
        self.clauses.iter().all(|clause| clause.evaluate(payload))
    }
}

impl Clause {
    fn evaluate(&self, payload: &Value) -> bool {
        let Some(actual) = resolve(payload, &self.path) else {
            return false;
        };
        match self.op {
            CompareOp::Eq => loosely_equal(actual, &self.value),
            CompareOp::Ne => !loosely_equal(actual, &self.value),
            op => match compare(actual, &self.value) {
                Some(ordering) => match op {
                    CompareOp::Gt => ordering.is_gt(),
                    CompareOp::Ge => ordering.is_ge(),
                    CompareOp::Lt => ordering.is_lt(),
                    CompareOp::Le => ordering.is_le(),
                    CompareOp::Eq | CompareOp::Ne => false,
                },
                None => false,
            },
        }
    }
}

fn parse_clause(raw: &str) -> SchedulerResult<Clause> {
    let raw = raw.trim();
    let (pos, token, op) = OPERATORS
        .iter()
        .filter_map(|(token, op)| raw.find(token).map(|pos| (pos, *token, *op)))
        .min_by_key(|(pos, token, _)| (*pos, std::cmp::Reverse(token.len())))
        .ok_or_else(|| {
            SchedulerError::InvalidRule(format!("unsupported condition expression: '{raw}'"))
        })?;

    let left = raw[..pos].trim();
    let right = raw[pos + token.len()..].trim();
    if left.is_empty() || right.is_empty() {
        return Err(SchedulerError::InvalidRule(format!(
            "incomplete condition expression: '{raw}'"
        )));
    }
    let path: Vec<String> = left.split('.').map(|s| s.trim().to_string()).collect();
    if path.iter().any(String::is_empty) {
        return Err(SchedulerError::InvalidRule(format!("invalid field path: '{left}'")));
    }

    Ok(Clause {
        path,
        op,
        value: parse_literal(right),
    })
}

fn parse_literal(raw: &str) -> Value {
    let quoted = ['\'', '"']
        .iter()
        .find(|q| raw.len() >= 2 && raw.starts_with(**q) && raw.ends_with(**q));
    if quoted.is_some() {
        return Value::String(raw[1..raw.len() - 1].to_string());
    }
    match raw {
        "true" => Value::Bool(true),
        "false" => Value::Bool(false),
        "null" => Value::Null,
        _ => raw
            .parse::<f64>()
            .ok()
            .and_then(serde_json::Number::from_f64)
            .map(Value::Number)
            .unwrap_or_else(|| Value::String(raw.to_string())),
    }
}

fn resolve<'a>(payload: &'a Value, path: &[String]) -> Option<&'a Value> {
    path.iter().try_fold(payload, |value, key| value.get(key.as_str()))
}

fn loosely_equal(actual: &Value, expected: &Value) -> bool {
    match (actual.as_f64(), expected.as_f64()) {
        (Some(a), Some(b)) => (a - b).abs() < f64::EPSILON,
        _ => actual == expected,
    }
}

fn compare(actual: &Value, expected: &Value) -> Option<std::cmp::Ordering> {
    match (actual, expected) {
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        _ => actual.as_f64()?.partial_cmp(&expected.as_f64()?),
    }
}
