// SPDX-FileCopyrightText: 2026 Nurture Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Trigger condition predicates such as `streak == 5`.
//!
//! A condition compares one field of the trigger payload (a dot-separated
//! path into the JSON object) against a literal. Literals are parsed as JSON
//! (`5`, `true`, `"pro"`, `null`); a bare word is taken as a string.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde_json::Value;

use crate::error::NurtureError;

/// Comparison operator of a [`TriggerCondition`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
}

impl CompareOp {
    /// Scanned together; at equal positions the longer token wins.
    const TOKENS: [(&'static str, CompareOp); 6] = [
        ("==", CompareOp::Eq),
        ("!=", CompareOp::Ne),
        (">=", CompareOp::Ge),
        ("<=", CompareOp::Le),
        (">", CompareOp::Gt),
        ("<", CompareOp::Lt),
    ];

    fn symbol(self) -> &'static str {
        match self {
            Self::Eq => "==",
            Self::Ne => "!=",
            Self::Gt => ">",
            Self::Ge => ">=",
            Self::Lt => "<",
            Self::Le => "<=",
        }
    }
}

/// A parsed `field op literal` predicate.
#[derive(Debug, Clone, PartialEq)]
pub struct TriggerCondition {
    field: String,
    op: CompareOp,
    value: Value,
}

impl TriggerCondition {
    pub fn field(&self) -> &str {
        &self.field
    }

    pub fn op(&self) -> CompareOp {
        self.op
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    /// Evaluate against a trigger payload.
    ///
    /// A missing field is `false`. Ordering operators on mismatched types
    /// return an error message.
    pub fn evaluate(&self, payload: &Value) -> Result<bool, String> {
        let Some(actual) = lookup(payload, &self.field) else {
            return Ok(false);
        };

        match self.op {
            CompareOp::Eq => Ok(values_equal(actual, &self.value)),
            CompareOp::Ne => Ok(!values_equal(actual, &self.value)),
            CompareOp::Gt => Ok(self.ordering(actual)? == Ordering::Greater),
            CompareOp::Ge => Ok(self.ordering(actual)? != Ordering::Less),
            CompareOp::Lt => Ok(self.ordering(actual)? == Ordering::Less),
            CompareOp::Le => Ok(self.ordering(actual)? != Ordering::Greater),
        }
    }

    fn ordering(&self, actual: &Value) -> Result<Ordering, String> {
        compare(actual, &self.value).ok_or_else(|| {
            format!(
                "cannot compare `{}` ({}) {} {}",
                self.field,
                type_name(actual),
                self.op.symbol(),
                type_name(&self.value)
            )
        })
    }
}

impl FromStr for TriggerCondition {
    type Err = NurtureError;

    fn from_str(expression: &str) -> Result<Self, Self::Err> {
        let invalid = |message: &str| NurtureError::InvalidCondition {
            expression: expression.to_string(),
            message: message.to_string(),
        };

        let (position, token, op) = CompareOp::TOKENS
            .iter()
            .filter_map(|(token, op)| expression.find(token).map(|pos| (pos, *token, *op)))
            .min_by_key(|(pos, token, _)| (*pos, std::cmp::Reverse(token.len())))
            .ok_or_else(|| invalid("expected one of == != > >= < <="))?;

        let field = expression[..position].trim();
        let literal = expression[position + token.len()..].trim();

        if field.is_empty() {
            return Err(invalid("missing field name"));
        }
        if !field
            .split('.')
            .all(|part| !part.is_empty() && part.chars().all(|c| c.is_alphanumeric() || c == '_'))
        {
            return Err(invalid("field must be a dot-separated path of identifiers"));
        }
        if literal.is_empty() {
            return Err(invalid("missing value"));
        }

        let value = match serde_json::from_str::<Value>(literal) {
            Ok(value) if !value.is_array() && !value.is_object() => value,
            Ok(_) => return Err(invalid("value must be a scalar literal")),
            Err(_) if literal.chars().all(|c| c.is_alphanumeric() || c == '_' || c == '-') => {
                Value::String(literal.to_string())
            }
            Err(_) => return Err(invalid("value is not a valid literal")),
        };

        Ok(Self {
            field: field.to_string(),
            op,
            value,
        })
    }
}

impl fmt::Display for TriggerCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.field, self.op.symbol(), self.value)
    }
}

fn lookup<'a>(payload: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(payload, |value, key| value.get(key))
}

fn values_equal(left: &Value, right: &Value) -> bool {
    match (left.as_f64(), right.as_f64()) {
        (Some(l), Some(r)) => l == r,
        _ => left == right,
    }
}

fn compare(left: &Value, right: &Value) -> Option<Ordering> {
    match (left, right) {
        (Value::Number(l), Value::Number(r)) => l.as_f64()?.partial_cmp(&r.as_f64()?),
        (Value::String(l), Value::String(r)) => Some(l.cmp(r)),
        _ => None,
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn cond(s: &str) -> TriggerCondition {
        s.parse().unwrap()
    }

    #[test]
    fn parses_streak_equality() {
        let c = cond("streak == 5");
        assert_eq!(c.field(), "streak");
        assert_eq!(c.op(), CompareOp::Eq);
        assert_eq!(c.value(), &json!(5));
        assert_eq!(c.to_string(), "streak == 5");
    }

    #[test]
    fn two_char_operators_win_over_prefixes() {
        assert_eq!(cond("streak >= 3").op(), CompareOp::Ge);
        assert_eq!(cond("streak<=3").op(), CompareOp::Le);
        assert_eq!(cond("plan != free").op(), CompareOp::Ne);
    }

    #[test]
    fn bare_words_and_quoted_strings_are_strings() {
        assert_eq!(cond("plan == pro").value(), &json!("pro"));
        assert_eq!(cond(r#"plan == "pro plus""#).value(), &json!("pro plus"));
        assert_eq!(cond("verified == true").value(), &json!(true));
    }

    #[test]
    fn malformed_expressions_are_rejected() {
        for bad in ["streak", "== 5", "streak ==", "streak == [1]", "a..b == 1", "x == 'y z'"] {
            let err = bad.parse::<TriggerCondition>().unwrap_err();
            assert!(
                matches!(err, NurtureError::InvalidCondition { .. }),
                "{bad} should be invalid"
            );
        }
    }

    #[test]
    fn evaluates_numbers_across_int_and_float() {
        let c = cond("streak == 5");
        assert!(c.evaluate(&json!({"streak": 5})).unwrap());
        assert!(c.evaluate(&json!({"streak": 5.0})).unwrap());
        assert!(!c.evaluate(&json!({"streak": 4})).unwrap());
        assert!(cond("streak > 4").evaluate(&json!({"streak": 5})).unwrap());
        assert!(!cond("streak < 4").evaluate(&json!({"streak": 5})).unwrap());
    }

    #[test]
    fn nested_paths_and_missing_fields() {
        let c = cond("goal.kind == fitness");
        assert!(c.evaluate(&json!({"goal": {"kind": "fitness"}})).unwrap());
        assert!(!c.evaluate(&json!({"goal": {}})).unwrap());
        assert!(!c.evaluate(&Value::Null).unwrap());
    }

    #[test]
    fn ordering_type_mismatch_is_an_error() {
        let c = cond("streak > 3");
        let err = c.evaluate(&json!({"streak": "many"})).unwrap_err();
        assert!(err.contains("cannot compare"));
    }
}
