//! Contract verifier — static checks over a parsed program
//!
//! The parser accepts any well-formed source; the verifier finds
//! declarations that can never work at run time. It accumulates all
//! diagnostics rather than stopping at the first one.
//!
//! # Phases
//!
//! 1. **Types**: referenced contracts exist, map keys are usable as keys
//! 2. **Decorators**: access paths name declared fields that can hold an
//!    identity, tags are known, combinations make sense

use std::collections::BTreeSet;

use serde::Serialize;

use crate::parser::ast::*;
use crate::parser::tokenizer::Span;

// ── Verification Result Types ─────────────────────────────

/// Every diagnostic found in one program
#[derive(Debug, Clone, Default, Serialize)]
pub struct VerificationResult {
    pub diagnostics: Vec<Diagnostic>,
}

impl VerificationResult {
    pub fn new() -> Self {
        Self::default()
    }

    /// True if no errors were found (warnings are OK)
    pub fn is_valid(&self) -> bool {
        !self.diagnostics.iter().any(|d| d.severity == Severity::Error)
    }

    pub fn errors(&self) -> Vec<&Diagnostic> {
        self.diagnostics
            .iter()
            .filter(|d| d.severity == Severity::Error)
            .collect()
    }

    pub fn warnings(&self) -> Vec<&Diagnostic> {
        self.diagnostics
            .iter()
            .filter(|d| d.severity == Severity::Warning)
            .collect()
    }

    fn add_error(&mut self, kind: DiagnosticKind, message: String, span: Span) {
        self.diagnostics.push(Diagnostic {
            severity: Severity::Error,
            kind,
            message,
            span,
        });
    }

    fn add_warning(&mut self, kind: DiagnosticKind, message: String, span: Span) {
        self.diagnostics.push(Diagnostic {
            severity: Severity::Warning,
            kind,
            message,
            span,
        });
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Diagnostic {
    pub severity: Severity,
    pub kind: DiagnosticKind,
    pub message: String,
    pub span: Span,
}

impl std::fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let prefix = match self.severity {
            Severity::Error => "error",
            Severity::Warning => "warning",
        };
        write!(f, "{} [{}] at {}: {}", prefix, self.kind, self.span, self.message)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DiagnosticKind {
    TypeError,
    DecoratorError,
    CoherenceError,
}

impl std::fmt::Display for DiagnosticKind {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            DiagnosticKind::TypeError => write!(f, "type"),
            DiagnosticKind::DecoratorError => write!(f, "decorator"),
            DiagnosticKind::CoherenceError => write!(f, "coherence"),
        }
    }
}

// ── Public API ────────────────────────────────────────────

/// Run every phase over `program` and collect the diagnostics
pub fn verify(program: &Program) -> VerificationResult {
    let mut result = VerificationResult::new();

    verify_types(program, &mut result);
    verify_decorators(program, &mut result);

    tracing::debug!(
        contracts = program.contracts.len(),
        errors = result.errors().len(),
        warnings = result.warnings().len(),
        "verified program"
    );

    result
}

// ── Phase 1: Types ────────────────────────────────────────

fn verify_types(program: &Program, result: &mut VerificationResult) {
    for contract in &program.contracts {
        for field in &contract.fields {
            let owner = format!("field `{}.{}`", contract.name, field.name);
            verify_type(program, &field.ty, &owner, field.span, result);
        }
        for function in &contract.functions {
            let owner = format!("{}.{}", contract.name, function.name);
            verify_signature(program, function, &owner, result);
        }
    }
    for function in &program.functions {
        verify_signature(program, function, &function.name, result);
    }
}

fn verify_signature(program: &Program, function: &FunctionDef, owner: &str, result: &mut VerificationResult) {
    for parameter in &function.parameters {
        let position = format!("parameter `{}` of `{}`", parameter.name, owner);
        verify_type(program, &parameter.ty, &position, parameter.span, result);
    }
    if let Some(ty) = &function.return_type {
        let position = format!("return type of `{}`", owner);
        verify_type(program, ty, &position, function.span, result);
    }
}

fn verify_type(program: &Program, ty: &Type, position: &str, span: Span, result: &mut VerificationResult) {
    match ty {
        Type::Reference { contract } => {
            if program.contract(contract).is_none() {
                result.add_error(
                    DiagnosticKind::TypeError,
                    format!("{} refers to undeclared contract `{}`", position, contract),
                    span,
                );
            }
        }
        Type::Array { element } => verify_type(program, element, position, span, result),
        Type::Map { key, value } => {
            if !matches!(**key, Type::String | Type::Number) && !key.is_integer() {
                result.add_error(
                    DiagnosticKind::TypeError,
                    format!(
                        "{} uses `{}` as a map key; keys must be string, number or an integer type",
                        position, key
                    ),
                    span,
                );
            }
            verify_type(program, value, position, span, result);
        }
        Type::Object { fields } => {
            for field in fields {
                verify_type(program, &field.ty, position, span, result);
            }
        }
        _ => {}
    }
}

// ── Phase 2: Decorators ───────────────────────────────────

fn verify_decorators(program: &Program, result: &mut VerificationResult) {
    for contract in &program.contracts {
        let item = format!("contract `{}`", contract.name);
        verify_item(contract, &contract.decorators, &item, result);

        for field in &contract.fields {
            let item = format!("field `{}.{}`", contract.name, field.name);
            verify_item(contract, &field.decorators, &item, result);

            let has = |name: &str| field.decorators.iter().any(|d| d.name == name);
            if has("read") && has("delegate") {
                result.add_warning(
                    DiagnosticKind::CoherenceError,
                    format!("{} is both @read and @delegate; the delegate can never be reassigned", item),
                    field.span,
                );
            }
        }

        for function in &contract.functions {
            let item = format!("function `{}.{}`", contract.name, function.name);
            verify_item(contract, &function.decorators, &item, result);
        }
    }

    for function in &program.functions {
        let item = format!("function `{}`", function.name);
        verify_tags(&function.decorators, &item, result);
    }
}

/// Tag checks plus path checks against the owning contract
fn verify_item(contract: &Contract, decorators: &[Decorator], item: &str, result: &mut VerificationResult) {
    verify_tags(decorators, item, result);

    for decorator in decorators {
        match decorator.kind() {
            DecoratorKind::Call(paths) => {
                for path in paths {
                    match resolve(contract, &path) {
                        Resolution::Missing => result.add_error(
                            DiagnosticKind::DecoratorError,
                            format!(
                                "@call({}) on {} names a field `{}` does not declare",
                                path, item, contract.name
                            ),
                            decorator.span,
                        ),
                        Resolution::Known(ty) if !holds_identity(ty) => result.add_warning(
                            DiagnosticKind::DecoratorError,
                            format!(
                                "@call({}) on {} names a field of type {}, which cannot hold an identity",
                                path, item, ty
                            ),
                            decorator.span,
                        ),
                        _ => {}
                    }
                }
            }
            DecoratorKind::Index(paths) => {
                for path in paths {
                    if matches!(resolve(contract, &path), Resolution::Missing) {
                        result.add_error(
                            DiagnosticKind::DecoratorError,
                            format!(
                                "@index({}) on {} names a field `{}` does not declare",
                                path, item, contract.name
                            ),
                            decorator.span,
                        );
                    }
                }
            }
            _ => {}
        }
    }
}

fn verify_tags(decorators: &[Decorator], item: &str, result: &mut VerificationResult) {
    let mut seen = BTreeSet::new();
    for decorator in decorators {
        if let DecoratorKind::Unknown(name) = decorator.kind() {
            result.add_warning(
                DiagnosticKind::DecoratorError,
                format!(
                    "unknown decorator @{} on {}; writes it guards will be denied",
                    name, item
                ),
                decorator.span,
            );
        }
        if !seen.insert(decorator.name.as_str()) {
            result.add_warning(
                DiagnosticKind::CoherenceError,
                format!("duplicate decorator @{} on {}", decorator.name, item),
                decorator.span,
            );
        }
    }
}

// ── Path resolution ───────────────────────────────────────

enum Resolution<'a> {
    Missing,
    Known(&'a Type),
    /// Passes through a reference or a map; the shape is only known at run time
    Opaque,
}

/// Walk a dotted path through the contract's fields and inline objects
fn resolve<'a>(contract: &'a Contract, path: &str) -> Resolution<'a> {
    let mut segments = path.split('.');
    let Some(field) = segments.next().and_then(|head| contract.field(head)) else {
        return Resolution::Missing;
    };

    let mut current = &field.ty;
    for segment in segments {
        current = match current {
            Type::Object { fields } => match fields.iter().find(|f| f.name == segment) {
                Some(f) => &f.ty,
                None => return Resolution::Missing,
            },
            Type::Reference { .. } | Type::Map { .. } => return Resolution::Opaque,
            _ => return Resolution::Missing,
        };
    }
    Resolution::Known(current)
}

fn holds_identity(ty: &Type) -> bool {
    match ty {
        Type::PublicKey | Type::String | Type::Reference { .. } => true,
        Type::Array { element } => matches!(**element, Type::PublicKey | Type::Reference { .. }),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse;

    fn verify_source(source: &str) -> VerificationResult {
        verify(&parse(source).unwrap())
    }

    fn messages(result: &VerificationResult) -> Vec<String> {
        result.diagnostics.iter().map(|d| d.message.clone()).collect()
    }

    // ── Valid programs ─────────────────────────────────

    #[test]
    fn test_valid_program_has_no_diagnostics() {
        let result = verify_source(
            r#"
            @call(owner)
            collection Account {
                @read
                id: string;
                @delegate
                owner: PublicKey;
                @call(admins, profile.manager)
                balance: number;
                admins: PublicKey[];
                profile: { manager: PublicKey; };
                @index(id, balance)
                tags: map<string, number>;

                @call(owner)
                function close(reason: string): boolean {
                    return true;
                }
            }
            "#,
        );
        assert!(result.is_valid());
        assert!(result.diagnostics.is_empty(), "{:?}", messages(&result));
    }

    #[test]
    fn test_paths_through_references_are_accepted() {
        let result = verify_source(
            r#"
            contract User { key: PublicKey; }
            contract Post {
                author: User;
                @call(author.key)
                body: string;
            }
            "#,
        );
        assert!(result.diagnostics.is_empty(), "{:?}", messages(&result));
    }

    // ── Types ──────────────────────────────────────────

    #[test]
    fn test_undeclared_reference_is_an_error() {
        let result = verify_source(
            r#"
            contract Post {
                author: User;
                function move(to: Board): Shelf {}
            }
            "#,
        );
        assert_eq!(result.errors().len(), 3);
        assert!(result.errors()[0].message.contains("undeclared contract `User`"));
        assert!(result.errors()[1].message.contains("parameter `to`"));
        assert!(result.errors()[2].message.contains("return type"));
        assert!(result.errors().iter().all(|d| d.kind == DiagnosticKind::TypeError));
    }

    #[test]
    fn test_bad_map_key_is_an_error() {
        let result = verify_source("contract A { m: map<boolean, string>; n: map<i32, string>; }");
        assert_eq!(result.errors().len(), 1);
        assert!(result.errors()[0].message.contains("`boolean` as a map key"));
    }

    // ── Decorators ─────────────────────────────────────

    #[test]
    fn test_call_and_index_paths_must_exist() {
        let result = verify_source(
            r#"
            @index(missing)
            contract A {
                @call(ghost)
                value: number;
            }
            "#,
        );
        assert_eq!(result.errors().len(), 2);
        assert!(result.errors()[0].message.contains("@index(missing)"));
        assert!(result.errors()[1].message.contains("@call(ghost)"));
        assert_eq!(result.errors()[1].span.line, 4);
    }

    #[test]
    fn test_call_path_must_hold_an_identity() {
        let result = verify_source("contract A { count: number; @call(count) value: number; }");
        assert!(result.is_valid());
        assert_eq!(result.warnings().len(), 1);
        assert!(result.warnings()[0].message.contains("cannot hold an identity"));
    }

    #[test]
    fn test_unknown_and_duplicate_tags_warn() {
        let result = verify_source("contract A { @audited @public @public value: number; }");
        let warnings = result.warnings();
        assert_eq!(warnings.len(), 2);
        assert!(warnings[0].message.contains("unknown decorator @audited"));
        assert!(warnings[1].message.contains("duplicate decorator @public"));
        assert_eq!(warnings[1].kind, DiagnosticKind::CoherenceError);
    }

    #[test]
    fn test_read_with_delegate_warns() {
        let result = verify_source("contract A { @read @delegate owner: PublicKey; }");
        assert_eq!(result.warnings().len(), 1);
        assert!(result.warnings()[0].message.contains("can never be reassigned"));
    }

    #[test]
    fn test_diagnostic_display() {
        let result = verify_source("contract A {\n  b: Missing;\n}");
        let text = result.diagnostics[0].to_string();
        assert!(text.starts_with("error [type] at 2:3:"), "{}", text);
    }

    // ── Determinism ────────────────────────────────────

    #[test]
    fn test_determinism_100_iterations() {
        let source = "@index(x) contract A { @call(y) @odd z: B; }";
        let first = verify_source(source).diagnostics;
        for i in 0..100 {
            assert_eq!(verify_source(source).diagnostics, first, "Determinism failure at iteration {}", i);
        }
    }
}
