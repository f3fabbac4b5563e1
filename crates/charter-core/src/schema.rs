//! Schema validator — checks a data instance against a contract's fields
//!
//! Every mismatch is collected; a caller fixing an instance sees all of its
//! problems in one round trip. Paths use dotted members and bracketed
//! indices: `profile.age`, `tags[2]`, `limits.daily`.
//!
//! Uniqueness and index hints cannot be checked on a single instance.
//! They come back as [`DeferredConstraint`]s for the caller to enforce.

use base64::Engine;
use serde::Serialize;
use serde_json::Value as Json;

use crate::error::{FieldIssue, IssueKind, ValidationError};
use crate::parser::ast::*;
use crate::signature::PublicKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConstraintKind {
    Unique,
    Index,
}

/// A constraint spanning many instances, left to the caller
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeferredConstraint {
    pub kind: ConstraintKind,
    pub fields: Vec<String>,
}

/// Result of a successful validation
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationReport {
    pub contract: String,
    pub deferred: Vec<DeferredConstraint>,
}

/// Validate `data` against the fields of `contract`
///
/// # Errors
/// `ValidationError` listing every missing, extra or mistyped field.
pub fn validate_set(
    program: &Program,
    contract: &str,
    data: &Json,
) -> Result<ValidationReport, ValidationError> {
    let Some(declared) = program.contract(contract) else {
        return Err(ValidationError {
            contract: contract.to_string(),
            issues: vec![FieldIssue {
                path: String::new(),
                kind: IssueKind::InvalidValue,
                expected: "a declared contract".into(),
                actual: format!("`{}`", contract),
            }],
        });
    };

    let mut issues = Vec::new();
    match data {
        Json::Object(map) => {
            let fields = declared
                .fields
                .iter()
                .map(|f| (f.name.as_str(), &f.ty, f.required));
            check_fields(program, fields, map, "", &mut issues);
        }
        other => issues.push(mismatch("", "object", other)),
    }

    tracing::debug!(contract, issues = issues.len(), "validated instance");

    if issues.is_empty() {
        Ok(ValidationReport {
            contract: contract.to_string(),
            deferred: deferred_constraints(declared),
        })
    } else {
        Err(ValidationError {
            contract: contract.to_string(),
            issues,
        })
    }
}

/// Check one value against a declared type, collecting issues under `path`
pub fn check_value(program: &Program, ty: &Type, value: &Json, path: &str) -> Vec<FieldIssue> {
    let mut issues = Vec::new();
    check(program, ty, value, path, &mut issues);
    issues
}

/// Short description of a JSON value's shape for error messages
pub fn describe(value: &Json) -> &'static str {
    match value {
        Json::Null => "null",
        Json::Bool(_) => "boolean",
        Json::Number(n) if n.is_i64() || n.is_u64() => "integer",
        Json::Number(_) => "number",
        Json::String(_) => "string",
        Json::Array(_) => "array",
        Json::Object(_) => "object",
    }
}

// ── Rules ──────────────────────────────────────────────────

fn check_fields<'a>(
    program: &Program,
    fields: impl Iterator<Item = (&'a str, &'a Type, bool)>,
    map: &serde_json::Map<String, Json>,
    path: &str,
    issues: &mut Vec<FieldIssue>,
) {
    let mut declared = Vec::new();

    for (name, ty, required) in fields {
        declared.push(name);
        let field_path = join_path(path, name);
        match map.get(name) {
            None | Some(Json::Null) if required => issues.push(FieldIssue {
                path: field_path,
                kind: IssueKind::MissingField,
                expected: ty.to_string(),
                actual: describe(map.get(name).unwrap_or(&Json::Null)).to_string(),
            }),
            None | Some(Json::Null) => {}
            Some(value) => check(program, ty, value, &field_path, issues),
        }
    }

    for (key, value) in map {
        if !declared.contains(&key.as_str()) {
            issues.push(FieldIssue {
                path: join_path(path, key),
                kind: IssueKind::ExtraField,
                expected: "no such field".into(),
                actual: describe(value).to_string(),
            });
        }
    }
}

fn check(program: &Program, ty: &Type, value: &Json, path: &str, issues: &mut Vec<FieldIssue>) {
    match ty {
        Type::String => {
            if !value.is_string() {
                issues.push(mismatch(path, "string", value));
            }
        }
        Type::Boolean => {
            if !value.is_boolean() {
                issues.push(mismatch(path, "boolean", value));
            }
        }
        Type::Number | Type::F64 => {
            if !value.is_number() {
                issues.push(mismatch(path, &ty.to_string(), value));
            }
        }
        Type::F32 => match value.as_f64() {
            Some(v) if v.abs() <= f32::MAX as f64 => {}
            Some(v) => issues.push(invalid(path, "f32", format!("{} is out of range", v))),
            None => issues.push(mismatch(path, "f32", value)),
        },
        Type::I32 | Type::I64 | Type::U32 | Type::U64 => match integral(value) {
            Some(n) if integer_in_range(ty, n) => {}
            Some(n) => issues.push(invalid(path, &ty.to_string(), format!("{} is out of range", n))),
            None => issues.push(mismatch(path, &ty.to_string(), value)),
        },
        Type::Bytes => match value.as_str() {
            Some(s) => {
                if let Err(e) = base64::engine::general_purpose::STANDARD.decode(s) {
                    issues.push(invalid(path, "bytes (base64)", e.to_string()));
                }
            }
            None => issues.push(mismatch(path, "bytes", value)),
        },
        Type::PublicKey => match value.as_str() {
            Some(s) => {
                if let Err(e) = s.parse::<PublicKey>() {
                    issues.push(invalid(path, "PublicKey", e.to_string()));
                }
            }
            None => issues.push(mismatch(path, "PublicKey", value)),
        },
        Type::Array { element } => match value.as_array() {
            Some(items) => {
                for (i, item) in items.iter().enumerate() {
                    check(program, element, item, &format!("{}[{}]", path, i), issues);
                }
            }
            None => issues.push(mismatch(path, &ty.to_string(), value)),
        },
        Type::Map { key, value: value_ty } => match value.as_object() {
            Some(map) => {
                for (k, v) in map {
                    let entry_path = join_path(path, k);
                    if let Some(problem) = check_map_key(key, k) {
                        issues.push(invalid(&entry_path, &format!("{} key", key), problem));
                    }
                    check(program, value_ty, v, &entry_path, issues);
                }
            }
            None => issues.push(mismatch(path, &ty.to_string(), value)),
        },
        Type::Object { fields } => match value.as_object() {
            Some(map) => {
                let fields = fields.iter().map(|f| (f.name.as_str(), &f.ty, f.required));
                check_fields(program, fields, map, path, issues);
            }
            None => issues.push(mismatch(path, "object", value)),
        },
        Type::Reference { contract } if program.contract(contract).is_none() => {
            issues.push(invalid(path, "reference", format!("unknown contract `{}`", contract)));
        }
        Type::Reference { contract } => match value.as_object() {
            Some(map) => {
                let id = Type::String;
                let fields = std::iter::once(("id", &id, true));
                check_fields(program, fields, map, path, issues);
            }
            None => issues.push(mismatch(path, &format!("reference to {}", contract), value)),
        },
    }
}

/// Map keys are always strings; numeric key types must parse
fn check_map_key(key_ty: &Type, key: &str) -> Option<String> {
    match key_ty {
        Type::String => None,
        Type::Number | Type::F64 | Type::F32 => match key.parse::<f64>() {
            Ok(v) if v.is_finite() => None,
            _ => Some(format!("`{}` is not a number", key)),
        },
        Type::I32 | Type::I64 | Type::U32 | Type::U64 => match key.parse::<i128>() {
            Ok(n) if integer_in_range(key_ty, n) => None,
            Ok(n) => Some(format!("{} is out of range", n)),
            Err(_) => Some(format!("`{}` is not an integer", key)),
        },
        other => Some(format!("{} cannot be a map key", other)),
    }
}

/// Integral value of a JSON number, if it has one
fn integral(value: &Json) -> Option<i128> {
    let Json::Number(number) = value else {
        return None;
    };
    if let Some(i) = number.as_i64() {
        return Some(i as i128);
    }
    if let Some(u) = number.as_u64() {
        return Some(u as i128);
    }
    let f = number.as_f64()?;
    if f.fract() == 0.0 && f.abs() < 1e38 {
        Some(f as i128)
    } else {
        None
    }
}

pub(crate) fn integer_in_range(ty: &Type, n: i128) -> bool {
    let (min, max) = match ty {
        Type::I32 => (i32::MIN as i128, i32::MAX as i128),
        Type::I64 => (i64::MIN as i128, i64::MAX as i128),
        Type::U32 => (0, u32::MAX as i128),
        Type::U64 => (0, u64::MAX as i128),
        _ => return false,
    };
    (min..=max).contains(&n)
}

fn deferred_constraints(contract: &Contract) -> Vec<DeferredConstraint> {
    let mut deferred = Vec::new();

    for decorator in &contract.decorators {
        let fields = decorator.arguments.iter().map(|a| a.to_string()).collect();
        match decorator.kind() {
            DecoratorKind::Unique => deferred.push(DeferredConstraint {
                kind: ConstraintKind::Unique,
                fields,
            }),
            DecoratorKind::Index(paths) => deferred.push(DeferredConstraint {
                kind: ConstraintKind::Index,
                fields: paths,
            }),
            _ => {}
        }
    }

    for field in &contract.fields {
        for decorator in &field.decorators {
            let kind = match decorator.kind() {
                DecoratorKind::Unique => ConstraintKind::Unique,
                DecoratorKind::Index(_) => ConstraintKind::Index,
                _ => continue,
            };
            deferred.push(DeferredConstraint {
                kind,
                fields: vec![field.name.clone()],
            });
        }
    }

    deferred
}

// ── Helpers ────────────────────────────────────────────────

fn join_path(path: &str, name: &str) -> String {
    if path.is_empty() {
        name.to_string()
    } else {
        format!("{}.{}", path, name)
    }
}

fn mismatch(path: &str, expected: &str, value: &Json) -> FieldIssue {
    FieldIssue {
        path: path.to_string(),
        kind: IssueKind::TypeMismatch,
        expected: expected.to_string(),
        actual: describe(value).to_string(),
    }
}

fn invalid(path: &str, expected: &str, actual: String) -> FieldIssue {
    FieldIssue {
        path: path.to_string(),
        kind: IssueKind::InvalidValue,
        expected: expected.to_string(),
        actual,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse;
    use serde_json::json;

    const PERSON: &str = r#"
        @index(name, age)
        collection Person {
            @unique
            id: string;
            name: string;
            age: i32;
            nickname?: string;
            scores: number[];
            limits?: map<u32, f32>;
            avatar?: bytes;
            key?: PublicKey;
            profile?: { bio: string; links?: string[]; };
            manager?: Person;
        }
    "#;

    fn person() -> Program {
        parse(PERSON).unwrap()
    }

    fn base() -> Json {
        json!({ "id": "p1", "name": "Ada", "age": 36, "scores": [1, 2.5] })
    }

    fn issues(data: Json) -> Vec<FieldIssue> {
        validate_set(&person(), "Person", &data).unwrap_err().issues
    }

    // ── Acceptance ─────────────────────────────────────

    #[test]
    fn test_valid_instance() {
        let report = validate_set(&person(), "Person", &base()).unwrap();
        assert_eq!(report.contract, "Person");
    }

    #[test]
    fn test_all_optional_fields_present() {
        let mut data = base();
        data["nickname"] = json!("ada");
        data["limits"] = json!({ "10": 1.5, "20": 2 });
        data["avatar"] = json!("aGVsbG8=");
        data["key"] = json!("0x".to_string() + &"0f".repeat(32));
        data["profile"] = json!({ "bio": "math", "links": ["a"] });
        data["manager"] = json!({ "id": "p0" });
        assert!(validate_set(&person(), "Person", &data).is_ok());
    }

    #[test]
    fn test_null_optional_is_absent() {
        let mut data = base();
        data["nickname"] = Json::Null;
        assert!(validate_set(&person(), "Person", &data).is_ok());
    }

    // ── Type mismatches ────────────────────────────────

    #[test]
    fn test_string_for_integer_is_rejected() {
        let mut data = base();
        data["age"] = json!("30");
        let found = issues(data);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].path, "age");
        assert_eq!(found[0].kind, IssueKind::TypeMismatch);
        assert_eq!(found[0].expected, "i32");
        assert_eq!(found[0].actual, "string");
    }

    #[test]
    fn test_integer_range_and_fraction() {
        let mut data = base();
        data["age"] = json!(3_000_000_000u64);
        let found = issues(data);
        assert_eq!(found[0].kind, IssueKind::InvalidValue);

        let mut data = base();
        data["age"] = json!(36.5);
        assert_eq!(issues(data)[0].kind, IssueKind::TypeMismatch);

        let mut data = base();
        data["age"] = json!(36.0);
        assert!(validate_set(&person(), "Person", &data).is_ok());
    }

    #[test]
    fn test_nested_paths() {
        let mut data = base();
        data["scores"] = json!([1, "two", 3]);
        data["profile"] = json!({ "links": [1] });
        data["limits"] = json!({ "x": 1, "5": "big" });
        let found = issues(data);

        let paths: Vec<&str> = found.iter().map(|i| i.path.as_str()).collect();
        assert!(paths.contains(&"scores[1]"));
        assert!(paths.contains(&"profile.bio"));
        assert!(paths.contains(&"profile.links[0]"));
        assert!(paths.contains(&"limits.x"));
        assert!(paths.contains(&"limits.5"));
    }

    #[test]
    fn test_bytes_and_public_key_formats() {
        let mut data = base();
        data["avatar"] = json!("not base64!");
        data["key"] = json!("abc");
        let found = issues(data);
        assert_eq!(found.len(), 2);
        assert!(found.iter().all(|i| i.kind == IssueKind::InvalidValue));
    }

    #[test]
    fn test_reference_shape() {
        let mut data = base();
        data["manager"] = json!({ "id": 7, "name": "x" });
        let found = issues(data);
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].path, "manager.id");
        assert_eq!(found[1].kind, IssueKind::ExtraField);
    }

    // ── Exhaustiveness ─────────────────────────────────

    #[test]
    fn test_collects_every_issue() {
        let data = json!({ "name": 5, "age": "old", "scores": null, "color": "red" });
        let found = issues(data);
        assert_eq!(found.len(), 5);
        assert_eq!(found[0].path, "id");
        assert_eq!(found[0].kind, IssueKind::MissingField);
        assert_eq!(found[1].path, "name");
        assert_eq!(found[2].path, "age");
        assert_eq!(found[3].path, "scores");
        assert_eq!(found[3].kind, IssueKind::MissingField);
        assert_eq!(found[4].path, "color");
        assert_eq!(found[4].kind, IssueKind::ExtraField);
    }

    #[test]
    fn test_non_object_instance() {
        let found = issues(json!([1, 2]));
        assert_eq!(found[0].expected, "object");
        assert_eq!(found[0].actual, "array");
    }

    #[test]
    fn test_unknown_contract() {
        let err = validate_set(&person(), "Nobody", &base()).unwrap_err();
        assert_eq!(err.contract, "Nobody");
        assert_eq!(err.issues[0].expected, "a declared contract");
    }

    // ── Deferred constraints ───────────────────────────

    #[test]
    fn test_unique_and_index_are_deferred() {
        let report = validate_set(&person(), "Person", &base()).unwrap();
        assert_eq!(
            report.deferred,
            vec![
                DeferredConstraint {
                    kind: ConstraintKind::Index,
                    fields: vec!["name".into(), "age".into()],
                },
                DeferredConstraint {
                    kind: ConstraintKind::Unique,
                    fields: vec!["id".into()],
                },
            ]
        );
    }

    #[test]
    fn test_determinism_100_iterations() {
        let data = json!({ "name": 5, "extra": true });
        let first = validate_set(&person(), "Person", &data).unwrap_err();
        for i in 0..100 {
            let result = validate_set(&person(), "Person", &data).unwrap_err();
            assert_eq!(first, result, "Determinism failure at iteration {}", i);
        }
    }
}
