//! Built-in members of arrays and strings, and the `error` constructor

use std::collections::BTreeMap;

use super::value::Value;
use crate::error::RuntimeError;

pub const ARRAY_METHODS: &[&str] = &[
    "push", "pop", "shift", "unshift", "slice", "splice", "includes", "indexOf", "join",
];

pub const STRING_METHODS: &[&str] = &[
    "startsWith",
    "endsWith",
    "includes",
    "indexOf",
    "slice",
    "toLowerCase",
    "toUpperCase",
    "trim",
];

/// Methods that change their receiver in place
pub fn is_mutating(name: &str) -> bool {
    matches!(name, "push" | "pop" | "shift" | "unshift" | "splice")
}

/// Any method name the interpreter understands on some receiver
pub fn is_known_method(name: &str) -> bool {
    ARRAY_METHODS.contains(&name) || STRING_METHODS.contains(&name)
}

/// `error(message)` builds an error value that `throw` understands
pub fn error_value(args: &[Value]) -> Result<Value, RuntimeError> {
    let message = match args {
        [] => String::new(),
        [message] => message.to_string(),
        _ => return Err(arity("error", "at most 1", args.len())),
    };
    let mut object = BTreeMap::new();
    object.insert("message".to_string(), Value::String(message));
    Ok(Value::Object(object))
}

/// Message carried by a thrown value
pub fn thrown_message(value: &Value) -> String {
    match value {
        Value::Object(map) => match map.get("message") {
            Some(Value::String(message)) => message.clone(),
            _ => value.to_string(),
        },
        other => other.to_string(),
    }
}

/// Read a non-method property: `length`, or an object key
pub fn property(receiver: &Value, name: &str) -> Result<Value, RuntimeError> {
    match (receiver, name) {
        (Value::Array(items), "length") => Ok(Value::Integer(items.len() as i64)),
        (Value::String(s), "length") => Ok(Value::Integer(s.chars().count() as i64)),
        (Value::Object(map), _) => Ok(map.get(name).cloned().unwrap_or(Value::Null)),
        (other, _) => Err(RuntimeError::TypeError(format!(
            "{} has no property `{}`",
            other.type_name(),
            name
        ))),
    }
}

/// Call `name` on `receiver`, mutating it for in-place methods
pub fn call_method(
    receiver: &mut Value,
    name: &str,
    args: Vec<Value>,
) -> Result<Value, RuntimeError> {
    match receiver {
        Value::Array(items) => array_method(items, name, args),
        Value::String(s) => string_method(s, name, &args),
        other => Err(no_method(other, name)),
    }
}

// ── Arrays ─────────────────────────────────────────────────

fn array_method(items: &mut Vec<Value>, name: &str, args: Vec<Value>) -> Result<Value, RuntimeError> {
    let len = items.len();
    match name {
        "push" => {
            items.extend(args);
            Ok(Value::Integer(items.len() as i64))
        }
        "pop" => Ok(items.pop().unwrap_or(Value::Null)),
        "shift" => {
            if items.is_empty() {
                Ok(Value::Null)
            } else {
                Ok(items.remove(0))
            }
        }
        "unshift" => {
            items.splice(0..0, args);
            Ok(Value::Integer(items.len() as i64))
        }
        "slice" => {
            let (start, end) = slice_bounds(&args, len, name)?;
            Ok(Value::Array(items[start..end].to_vec()))
        }
        "splice" => {
            let mut args = args.into_iter();
            let start = match args.next() {
                Some(v) => relative_index(&v, len, name)?,
                None => return Err(arity(name, "at least 1", 0)),
            };
            let delete = match args.next() {
                Some(v) => integer(&v, name)?.clamp(0, (len - start) as i64) as usize,
                None => len - start,
            };
            let removed: Vec<Value> = items.splice(start..start + delete, args).collect();
            Ok(Value::Array(removed))
        }
        "includes" => {
            let needle = single(&args, name)?;
            Ok(Value::Boolean(items.iter().any(|v| v.loose_eq(needle))))
        }
        "indexOf" => {
            let needle = single(&args, name)?;
            let index = items.iter().position(|v| v.loose_eq(needle));
            Ok(Value::Integer(index.map_or(-1, |i| i as i64)))
        }
        "join" => {
            let separator = match args.first() {
                Some(Value::String(s)) => s.clone(),
                Some(other) => return Err(expected(name, "string", other)),
                None => ",".to_string(),
            };
            let parts: Vec<String> = items
                .iter()
                .map(|v| match v {
                    Value::Null => String::new(),
                    other => other.to_string(),
                })
                .collect();
            Ok(Value::String(parts.join(&separator)))
        }
        _ => Err(no_method(&Value::Array(Vec::new()), name)),
    }
}

// ── Strings ────────────────────────────────────────────────

fn string_method(s: &str, name: &str, args: &[Value]) -> Result<Value, RuntimeError> {
    let text_arg = || match single(args, name)? {
        Value::String(t) => Ok(t.as_str()),
        other => Err(expected(name, "string", other)),
    };

    match name {
        "startsWith" => Ok(Value::Boolean(s.starts_with(text_arg()?))),
        "endsWith" => Ok(Value::Boolean(s.ends_with(text_arg()?))),
        "includes" => Ok(Value::Boolean(s.contains(text_arg()?))),
        "indexOf" => {
            let needle = text_arg()?;
            let index = s
                .find(needle)
                .map_or(-1, |byte| s[..byte].chars().count() as i64);
            Ok(Value::Integer(index))
        }
        "slice" => {
            let chars: Vec<char> = s.chars().collect();
            let (start, end) = slice_bounds(args, chars.len(), name)?;
            Ok(Value::String(chars[start..end].iter().collect()))
        }
        "toLowerCase" => Ok(Value::String(s.to_lowercase())),
        "toUpperCase" => Ok(Value::String(s.to_uppercase())),
        "trim" => Ok(Value::String(s.trim().to_string())),
        _ => Err(no_method(&Value::String(String::new()), name)),
    }
}

// ── Argument helpers ───────────────────────────────────────

fn single<'a>(args: &'a [Value], name: &str) -> Result<&'a Value, RuntimeError> {
    match args {
        [value] => Ok(value),
        _ => Err(arity(name, "1", args.len())),
    }
}

fn integer(value: &Value, name: &str) -> Result<i64, RuntimeError> {
    match value {
        Value::Integer(i) => Ok(*i),
        // past every possible length, so clamping gives the same answer
        Value::Unsigned(_) => Ok(i64::MAX),
        Value::Float(v) if v.fract() == 0.0 => Ok(*v as i64),
        other => Err(expected(name, "integer", other)),
    }
}

/// Negative indices count from the end; the result is clamped to `0..=len`
fn relative_index(value: &Value, len: usize, name: &str) -> Result<usize, RuntimeError> {
    let i = integer(value, name)?;
    let len = len as i64;
    let index = if i < 0 { (len + i).max(0) } else { i.min(len) };
    Ok(index as usize)
}

fn slice_bounds(args: &[Value], len: usize, name: &str) -> Result<(usize, usize), RuntimeError> {
    if args.len() > 2 {
        return Err(arity(name, "at most 2", args.len()));
    }
    let start = match args.first() {
        Some(v) => relative_index(v, len, name)?,
        None => 0,
    };
    let end = match args.get(1) {
        Some(v) => relative_index(v, len, name)?,
        None => len,
    };
    Ok((start, end.max(start)))
}

fn arity(name: &str, wanted: &str, found: usize) -> RuntimeError {
    RuntimeError::TypeError(format!(
        "`{}` takes {} argument(s), found {}",
        name, wanted, found
    ))
}

fn expected(name: &str, wanted: &str, found: &Value) -> RuntimeError {
    RuntimeError::TypeError(format!(
        "`{}` expects a {}, found {}",
        name,
        wanted,
        found.type_name()
    ))
}

fn no_method(receiver: &Value, name: &str) -> RuntimeError {
    RuntimeError::TypeError(format!(
        "{} has no method `{}`",
        receiver.type_name(),
        name
    ))
}
