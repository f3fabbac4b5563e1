//! Runtime values and operator semantics

use std::collections::BTreeMap;

use crate::error::RuntimeError;
use crate::parser::ast::{BinaryOp, Literal};

/// A value manipulated by a function body
///
/// Values are owned: assigning or passing a value copies it, so a local
/// never aliases the instance it was read from.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(untagged)]
pub enum Value {
    /// Null / absent
    Null,
    Boolean(bool),
    Integer(i64),
    /// Integers above `i64::MAX`; smaller ones are always `Integer`
    Unsigned(u64),
    /// Always finite
    Float(f64),
    String(String),
    Array(Vec<Value>),
    /// Ordered map (BTreeMap for deterministic iteration)
    Object(BTreeMap<String, Value>),
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Boolean(b) => write!(f, "{}", b),
            Value::Integer(i) => write!(f, "{}", i),
            Value::Unsigned(u) => write!(f, "{}", u),
            Value::Float(v) => write!(f, "{}", v),
            Value::String(s) => write!(f, "{}", s),
            Value::Array(items) => {
                for (i, v) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{}", v)?;
                }
                Ok(())
            }
            Value::Object(_) => write!(f, "{}", self.to_json()),
        }
    }
}

impl From<&Literal> for Value {
    fn from(literal: &Literal) -> Self {
        match literal {
            Literal::Null => Value::Null,
            Literal::Boolean(b) => Value::Boolean(*b),
            Literal::Integer(i) => Value::Integer(*i),
            Literal::Float(v) => Value::Float(*v),
            Literal::String(s) => Value::String(s.clone()),
        }
    }
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Boolean(_) => "boolean",
            Value::Integer(_) | Value::Unsigned(_) => "integer",
            Value::Float(_) => "float",
            Value::String(_) => "string",
            Value::Array(_) => "array",
            Value::Object(_) => "object",
        }
    }

    /// The narrowest integer variant holding `n`, if either can
    pub fn integer(n: i128) -> Option<Value> {
        match i64::try_from(n) {
            Ok(i) => Some(Value::Integer(i)),
            Err(_) => u64::try_from(n).ok().map(Value::Unsigned),
        }
    }

    /// Exact value of either integer variant
    pub fn as_i128(&self) -> Option<i128> {
        match self {
            Value::Integer(i) => Some(i128::from(*i)),
            Value::Unsigned(u) => Some(i128::from(*u)),
            _ => None,
        }
    }

    /// Convert from serde_json::Value (deterministic — uses BTreeMap)
    ///
    /// JSON integers anywhere in `i64::MIN..=u64::MAX` are kept exact.
    pub fn from_json(json: &serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Boolean(*b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Integer(i)
                } else if let Some(u) = n.as_u64() {
                    Value::Unsigned(u)
                } else {
                    Value::Float(n.as_f64().unwrap_or(0.0))
                }
            }
            serde_json::Value::String(s) => Value::String(s.clone()),
            serde_json::Value::Array(items) => {
                Value::Array(items.iter().map(Value::from_json).collect())
            }
            serde_json::Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), Value::from_json(v)))
                    .collect(),
            ),
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Boolean(b) => serde_json::Value::Bool(*b),
            Value::Integer(i) => serde_json::json!(*i),
            Value::Unsigned(u) => serde_json::json!(*u),
            Value::Float(v) => serde_json::Number::from_f64(*v)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::Array(items) => {
                serde_json::Value::Array(items.iter().map(|v| v.to_json()).collect())
            }
            Value::Object(map) => serde_json::Value::Object(
                map.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
            ),
        }
    }

    /// Structural equality; integers and floats compare by numeric value
    pub fn loose_eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Integer(_) | Value::Unsigned(_), Value::Float(_))
            | (Value::Float(_), Value::Integer(_) | Value::Unsigned(_)) => {
                self.as_f64() == other.as_f64()
            }
            (Value::Array(a), Value::Array(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.loose_eq(y))
            }
            (Value::Object(a), Value::Object(b)) => {
                a.len() == b.len()
                    && a.iter()
                        .zip(b)
                        .all(|((ka, va), (kb, vb))| ka == kb && va.loose_eq(vb))
            }
            _ => self == other,
        }
    }

    pub fn as_bool(&self, context: &str) -> Result<bool, RuntimeError> {
        match self {
            Value::Boolean(b) => Ok(*b),
            other => Err(RuntimeError::TypeError(format!(
                "{} must be boolean, found {}",
                context,
                other.type_name()
            ))),
        }
    }

    fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Integer(i) => Some(*i as f64),
            Value::Unsigned(u) => Some(*u as f64),
            Value::Float(v) => Some(*v),
            _ => None,
        }
    }
}

// ── Operators ──────────────────────────────────────────────

/// Apply a non-short-circuit binary operator
pub fn binary(op: BinaryOp, left: &Value, right: &Value) -> Result<Value, RuntimeError> {
    match op {
        BinaryOp::Equal => return Ok(Value::Boolean(left.loose_eq(right))),
        BinaryOp::NotEqual => return Ok(Value::Boolean(!left.loose_eq(right))),
        BinaryOp::And | BinaryOp::Or => {
            let l = left.as_bool("logical operand")?;
            let r = right.as_bool("logical operand")?;
            let result = if op == BinaryOp::And { l && r } else { l || r };
            return Ok(Value::Boolean(result));
        }
        BinaryOp::Less | BinaryOp::LessEqual | BinaryOp::Greater | BinaryOp::GreaterEqual => {
            return compare(op, left, right);
        }
        _ => {}
    }

    if let (BinaryOp::Add, Value::String(a), Value::String(b)) = (op, left, right) {
        return Ok(Value::String(format!("{}{}", a, b)));
    }

    if matches!(op, BinaryOp::Divide | BinaryOp::Modulo)
        && is_zero(right)
        && left.as_f64().is_some()
    {
        return Err(RuntimeError::DivisionByZero);
    }

    if let (Some(a), Some(b)) = (left.as_i128(), right.as_i128()) {
        return integer_op(op, a, b);
    }

    match (left.as_f64(), right.as_f64()) {
        (Some(a), Some(b)) => {
            let result = match op {
                BinaryOp::Add => a + b,
                BinaryOp::Subtract => a - b,
                BinaryOp::Multiply => a * b,
                BinaryOp::Divide => a / b,
                BinaryOp::Modulo => a % b,
                _ => a.powf(b),
            };
            finite(result)
        }
        _ => Err(incompatible(op, left, right)),
    }
}

/// Checked integer arithmetic; results must fit `i64` or `u64`
fn integer_op(op: BinaryOp, a: i128, b: i128) -> Result<Value, RuntimeError> {
    let overflow = || RuntimeError::TypeError(format!("integer overflow in {} {} {}", a, op.symbol(), b));

    let result = match op {
        BinaryOp::Add => a.checked_add(b),
        BinaryOp::Subtract => a.checked_sub(b),
        BinaryOp::Multiply => a.checked_mul(b),
        BinaryOp::Modulo => a.checked_rem(b),
        BinaryOp::Divide => match a.checked_rem(b) {
            Some(0) => a.checked_div(b),
            Some(_) => return finite(a as f64 / b as f64),
            None => None,
        },
        _ => {
            if b < 0 {
                return finite((a as f64).powf(b as f64));
            }
            u32::try_from(b).ok().and_then(|exp| a.checked_pow(exp))
        }
    };

    result.and_then(Value::integer).ok_or_else(overflow)
}

fn compare(op: BinaryOp, left: &Value, right: &Value) -> Result<Value, RuntimeError> {
    let ordering = match (left, right) {
        (Value::String(a), Value::String(b)) => a.cmp(b),
        _ => match (left.as_i128(), right.as_i128()) {
            (Some(a), Some(b)) => a.cmp(&b),
            _ => float_order(op, left, right)?,
        },
    };

    let result = match op {
        BinaryOp::Less => ordering.is_lt(),
        BinaryOp::LessEqual => ordering.is_le(),
        BinaryOp::Greater => ordering.is_gt(),
        _ => ordering.is_ge(),
    };
    Ok(Value::Boolean(result))
}

fn float_order(op: BinaryOp, left: &Value, right: &Value) -> Result<std::cmp::Ordering, RuntimeError> {
    match (left.as_f64(), right.as_f64()) {
        (Some(a), Some(b)) => a.partial_cmp(&b).ok_or_else(|| incompatible(op, left, right)),
        _ => Err(incompatible(op, left, right)),
    }
}

pub fn negate(value: &Value) -> Result<Value, RuntimeError> {
    match value {
        Value::Integer(_) | Value::Unsigned(_) => value
            .as_i128()
            .and_then(|i| Value::integer(-i))
            .ok_or_else(|| RuntimeError::TypeError(format!("integer overflow in -({})", value))),
        Value::Float(v) => Ok(Value::Float(-v)),
        other => Err(RuntimeError::TypeError(format!(
            "cannot negate {}",
            other.type_name()
        ))),
    }
}

fn is_zero(value: &Value) -> bool {
    value.as_f64() == Some(0.0)
}

fn finite(v: f64) -> Result<Value, RuntimeError> {
    if v.is_finite() {
        Ok(Value::Float(v))
    } else {
        Err(RuntimeError::TypeError(
            "arithmetic result is not a finite number".into(),
        ))
    }
}

fn incompatible(op: BinaryOp, left: &Value, right: &Value) -> RuntimeError {
    RuntimeError::TypeError(format!(
        "cannot apply {} to {} and {}",
        op.symbol(),
        left.type_name(),
        right.type_name()
    ))
}
