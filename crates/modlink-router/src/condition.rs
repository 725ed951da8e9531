//! Condition evaluation.

use crate::config::ConditionConfig;
use crate::error::RouterError;
use modlink_bus::{Event, EventRegistry, FieldError, Value};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// Comparison operator of a route condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operator {
    Equal,
    NotEqual,
    Greater,
    GreaterOrEqual,
    Less,
    LessOrEqual,
    Contains,
    StartsWith,
    EndsWith,
}

impl Operator {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operator::Equal => "==",
            Operator::NotEqual => "!=",
            Operator::Greater => ">",
            Operator::GreaterOrEqual => ">=",
            Operator::Less => "<",
            Operator::LessOrEqual => "<=",
            Operator::Contains => "contains",
            Operator::StartsWith => "startswith",
            Operator::EndsWith => "endswith",
        }
    }

    /// Apply the operator to an actual field value and the configured value.
    pub fn apply(&self, actual: &Value, expected: &Value) -> bool {
        match self {
            Operator::Equal => values_equal(actual, expected),
            Operator::NotEqual => !values_equal(actual, expected),
            Operator::Greater => ordering(actual, expected) == Ordering::Greater,
            Operator::GreaterOrEqual => ordering(actual, expected) != Ordering::Less,
            Operator::Less => ordering(actual, expected) == Ordering::Less,
            Operator::LessOrEqual => ordering(actual, expected) != Ordering::Greater,
            Operator::Contains => match actual {
                Value::Array(items) => items.iter().any(|item| values_equal(item, expected)),
                Value::Object(map) => map.contains_key(text(expected).as_str()),
                _ => text(actual).contains(text(expected).as_str()),
            },
            Operator::StartsWith => text(actual).starts_with(text(expected).as_str()),
            Operator::EndsWith => text(actual).ends_with(text(expected).as_str()),
        }
    }
}

impl FromStr for Operator {
    type Err = RouterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "==" | "=" | "eq" | "equals" => Ok(Operator::Equal),
            "!=" | "<>" | "ne" | "notequals" => Ok(Operator::NotEqual),
            ">" | "gt" => Ok(Operator::Greater),
            ">=" | "gte" => Ok(Operator::GreaterOrEqual),
            "<" | "lt" => Ok(Operator::Less),
            "<=" | "lte" => Ok(Operator::LessOrEqual),
            "contains" => Ok(Operator::Contains),
            "startswith" | "starts_with" => Ok(Operator::StartsWith),
            "endswith" | "ends_with" => Ok(Operator::EndsWith),
            _ => Err(RouterError::UnknownOperator(s.to_string())),
        }
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A condition with its operator parsed.
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    pub property: String,
    pub operator: Operator,
    pub expected: Value,
}

impl Condition {
    pub fn compile(config: &ConditionConfig) -> Result<Self, RouterError> {
        Ok(Self {
            property: config.property.clone(),
            operator: config.operator.parse()?,
            expected: config.value.clone(),
        })
    }

    /// Read the property from `event` and apply the operator.
    ///
    /// A property that cannot be read is an error, which the router counts
    /// as a failed condition.
    pub fn evaluate(&self, registry: &EventRegistry, event: &dyn Event) -> Result<bool, FieldError> {
        let actual = registry.read_path(event, &self.property)?;
        Ok(self.operator.apply(&actual, &self.expected))
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.property, self.operator, self.expected)
    }
}

/// Text form used for string comparison fallback and substring operators.
pub(crate) fn text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Ordering when both operands are comparable as the same type.
fn typed_ordering(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Number(_), _) | (_, Value::Number(_)) => {
            as_number(a)?.partial_cmp(&as_number(b)?)
        }
        _ => None,
    }
}

fn ordering(a: &Value, b: &Value) -> Ordering {
    typed_ordering(a, b).unwrap_or_else(|| text(a).cmp(&text(b)))
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match typed_ordering(a, b) {
        Some(ord) => ord == Ordering::Equal,
        None => a == b || text(a) == text(b),
    }
}
