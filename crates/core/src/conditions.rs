use std::cmp::Ordering;
use std::collections::BTreeMap;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Immutable key/value payload captured at submission time. Every predicate in
/// the engine evaluates against this snapshot, never against live entity state.
pub type ContextMap = BTreeMap<String, ContextValue>;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ContextValue {
    Bool(bool),
    Number(Decimal),
    Text(String),
}

impl ContextValue {
    pub fn as_number(&self) -> Option<Decimal> {
        match self {
            Self::Number(value) => Some(*value),
            Self::Bool(_) | Self::Text(_) => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(value) => Some(value),
            Self::Bool(_) | Self::Number(_) => None,
        }
    }
}

impl From<bool> for ContextValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<Decimal> for ContextValue {
    fn from(value: Decimal) -> Self {
        Self::Number(value)
    }
}

impl From<i64> for ContextValue {
    fn from(value: i64) -> Self {
        Self::Number(Decimal::from(value))
    }
}

impl From<&str> for ContextValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for ContextValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

/// Tagged expression tree used for `trigger_conditions`, `skip_conditions` and
/// `auto_approve_below`. Evaluation is total and deterministic: ordering
/// comparisons are only satisfiable by number/number pairs, and a missing
/// field fails every comparison.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Condition {
    Eq { field: String, value: ContextValue },
    Ne { field: String, value: ContextValue },
    Gt { field: String, value: ContextValue },
    Gte { field: String, value: ContextValue },
    Lt { field: String, value: ContextValue },
    Lte { field: String, value: ContextValue },
    In { field: String, values: Vec<ContextValue> },
    Exists { field: String },
    All { conditions: Vec<Condition> },
    Any { conditions: Vec<Condition> },
    Not { condition: Box<Condition> },
}

impl Condition {
    pub fn evaluate(&self, context: &ContextMap) -> bool {
        match self {
            Self::Eq { field, value } => context.get(field).is_some_and(|found| found == value),
            Self::Ne { field, value } => context.get(field).is_some_and(|found| found != value),
            Self::Gt { field, value } => compare_numbers(context, field, value, Ordering::is_gt),
            Self::Gte { field, value } => compare_numbers(context, field, value, Ordering::is_ge),
            Self::Lt { field, value } => compare_numbers(context, field, value, Ordering::is_lt),
            Self::Lte { field, value } => compare_numbers(context, field, value, Ordering::is_le),
            Self::In { field, values } => {
                context.get(field).is_some_and(|found| values.contains(found))
            }
            Self::Exists { field } => context.contains_key(field),
            Self::All { conditions } => {
                conditions.iter().all(|condition| condition.evaluate(context))
            }
            Self::Any { conditions } => {
                conditions.iter().any(|condition| condition.evaluate(context))
            }
            Self::Not { condition } => !condition.evaluate(context),
        }
    }
}

fn compare_numbers(
    context: &ContextMap,
    field: &str,
    value: &ContextValue,
    satisfied: fn(Ordering) -> bool,
) -> bool {
    let (Some(left), Some(right)) =
        (context.get(field).and_then(ContextValue::as_number), value.as_number())
    else {
        return false;
    };
    satisfied(left.cmp(&right))
}
