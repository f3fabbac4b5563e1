//! Canonical printer — turns an AST back into deterministic Charter text
//!
//! The canonical form is used for formatting, hashing and comparison.
//!
//! # Pipeline
//!
//! `source → parse → AST → format_program → SHA-256`
//!
//! # Guarantees
//!
//! - **Idempotent**: `normalize(normalize(x)) == normalize(x)`
//! - **Deterministic**: same input always produces same output
//! - **Semantic preserving**: `parse(normalize(x))` equals `parse(x)` up to spans
//!
//! Layout: four-space indentation, one member per line, decorators on
//! their own line, a blank line between top-level items and before each
//! function. Parentheses are emitted only where precedence or
//! associativity requires them.

use sha2::{Digest, Sha256};

use crate::parser::ast::*;
use crate::Result;

const INDENT: &str = "    ";

// ── Public API ─────────────────────────────────────────────

/// Normalize Charter source to canonical form
///
/// # Errors
/// Returns `ParseError` for invalid input.
pub fn normalize(source: &str) -> Result<String> {
    let program = crate::parser::parse(source)?;
    Ok(format_program(&program))
}

/// SHA-256 of the canonical text, lowercase hex
///
/// Two sources that differ only in layout or comments hash the same.
pub fn semantic_hash(program: &Program) -> String {
    let canonical = format_program(program);
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    hex::encode(hasher.finalize())
}

// ── Declarations ───────────────────────────────────────────

pub fn format_program(program: &Program) -> String {
    let mut items: Vec<String> = Vec::new();
    for function in &program.functions {
        let mut out = String::new();
        write_function(&mut out, function, 0, false);
        items.push(out);
    }
    for contract in &program.contracts {
        items.push(format_contract(contract));
    }
    items.join("\n")
}

pub fn format_contract(contract: &Contract) -> String {
    let mut out = String::new();
    write_decorators(&mut out, &contract.decorators, 0);

    let keyword = match contract.keyword {
        ContractKeyword::Contract => "contract",
        ContractKeyword::Collection => "collection",
    };

    if contract.fields.is_empty() && contract.functions.is_empty() {
        out.push_str(&format!("{} {} {{}}\n", keyword, contract.name));
        return out;
    }

    out.push_str(&format!("{} {} {{\n", keyword, contract.name));

    for field in &contract.fields {
        write_decorators(&mut out, &field.decorators, 1);
        let optional = if field.required { "" } else { "?" };
        out.push_str(&format!(
            "{}{}{}: {};\n",
            INDENT, field.name, optional, field.ty
        ));
    }

    for (i, function) in contract.functions.iter().enumerate() {
        if i > 0 || !contract.fields.is_empty() {
            out.push('\n');
        }
        write_function(&mut out, function, 1, true);
    }

    out.push_str("}\n");
    out
}

/// A single function at top level
pub fn format_function(function: &FunctionDef) -> String {
    let mut out = String::new();
    write_function(&mut out, function, 0, false);
    out
}

fn write_decorators(out: &mut String, decorators: &[Decorator], depth: usize) {
    for decorator in decorators {
        write_indent(out, depth);
        out.push('@');
        out.push_str(&decorator.name);
        if !decorator.arguments.is_empty() {
            let args: Vec<String> = decorator.arguments.iter().map(|a| a.to_string()).collect();
            out.push_str(&format!("({})", args.join(", ")));
        }
        out.push('\n');
    }
}

fn write_function(out: &mut String, function: &FunctionDef, depth: usize, in_contract: bool) {
    write_decorators(out, &function.decorators, depth);
    write_indent(out, depth);

    if in_contract && function.name == "constructor" {
        out.push_str("constructor");
    } else {
        out.push_str("function ");
        out.push_str(&function.name);
    }

    let params: Vec<String> = function
        .parameters
        .iter()
        .map(|p| {
            let optional = if p.required { "" } else { "?" };
            format!("{}{}: {}", p.name, optional, p.ty)
        })
        .collect();
    out.push_str(&format!("({})", params.join(", ")));

    if let Some(ref ty) = function.return_type {
        out.push_str(&format!(": {}", ty));
    }

    out.push(' ');
    write_block(out, &function.body, depth);
    out.push('\n');
}

// ── Statements ─────────────────────────────────────────────

/// `{ ... }` with the closing brace at `depth`; no trailing newline
fn write_block(out: &mut String, body: &[Statement], depth: usize) {
    if body.is_empty() {
        out.push_str("{}");
        return;
    }
    out.push_str("{\n");
    for statement in body {
        write_statement(out, statement, depth + 1);
    }
    write_indent(out, depth);
    out.push('}');
}

fn write_statement(out: &mut String, statement: &Statement, depth: usize) {
    write_indent(out, depth);
    match &statement.kind {
        StatementKind::If { .. } => write_if(out, &statement.kind, depth),
        StatementKind::While { condition, body } => {
            out.push_str(&format!("while ({}) ", format_expression(condition)));
            write_block(out, body, depth);
        }
        StatementKind::For {
            init,
            condition,
            update,
            body,
        } => {
            out.push_str("for (");
            if let Some(init) = init {
                out.push_str(&format_simple_statement(&init.kind));
            }
            out.push(';');
            if let Some(condition) = condition {
                out.push(' ');
                out.push_str(&format_expression(condition));
            }
            out.push(';');
            if let Some(update) = update {
                out.push(' ');
                out.push_str(&format_expression(update));
            }
            out.push_str(") ");
            write_block(out, body, depth);
        }
        StatementKind::ForOf {
            binding,
            iterable,
            body,
        } => {
            out.push_str(&format!(
                "for (let {} of {}) ",
                binding,
                format_expression(iterable)
            ));
            write_block(out, body, depth);
        }
        other => {
            out.push_str(&format_simple_statement(other));
            out.push(';');
        }
    }
    out.push('\n');
}

/// Statements without a block, printed without the trailing `;`
fn format_simple_statement(kind: &StatementKind) -> String {
    match kind {
        StatementKind::Let { name, value } => format!("let {} = {}", name, format_expression(value)),
        StatementKind::Expression { expression } => format_expression(expression),
        StatementKind::Break => "break".to_string(),
        StatementKind::Continue => "continue".to_string(),
        StatementKind::Return { value: None } => "return".to_string(),
        StatementKind::Return { value: Some(value) } => {
            format!("return {}", format_expression(value))
        }
        StatementKind::Throw { value } => format!("throw {}", format_expression(value)),
        // Block statements never appear in a `for` header
        _ => String::new(),
    }
}

fn write_if(out: &mut String, kind: &StatementKind, depth: usize) {
    let StatementKind::If {
        condition,
        then_branch,
        else_branch,
    } = kind
    else {
        return;
    };

    out.push_str(&format!("if ({}) ", format_expression(condition)));
    write_block(out, then_branch, depth);

    match else_branch.as_slice() {
        [] => {}
        [single] if matches!(single.kind, StatementKind::If { .. }) => {
            out.push_str(" else ");
            write_if(out, &single.kind, depth);
        }
        branch => {
            out.push_str(" else ");
            write_block(out, branch, depth);
        }
    }
}

// ── Expressions ────────────────────────────────────────────

pub fn format_expression(expr: &Expression) -> String {
    match expr {
        Expression::Literal { value } => value.to_string(),
        Expression::Ident { name } => name.clone(),
        Expression::This => "this".to_string(),
        Expression::Array { elements } => {
            let items: Vec<String> = elements.iter().map(format_expression).collect();
            format!("[{}]", items.join(", "))
        }
        Expression::Object { entries } => {
            if entries.is_empty() {
                return "{}".to_string();
            }
            let items: Vec<String> = entries
                .iter()
                .map(|e| format!("{}: {}", format_key(&e.key), format_expression(&e.value)))
                .collect();
            format!("{{ {} }}", items.join(", "))
        }
        Expression::Member { object, property } => {
            format!("{}.{}", operand(object, 10), property)
        }
        Expression::Index { object, index } => {
            format!("{}[{}]", operand(object, 10), format_expression(index))
        }
        Expression::Call { callee, arguments } => {
            let args: Vec<String> = arguments.iter().map(format_expression).collect();
            format!("{}({})", operand(callee, 10), args.join(", "))
        }
        Expression::Unary { op, operand: inner } => {
            format!("{}{}", op.symbol(), operand(inner, 9))
        }
        Expression::Binary { op, left, right } => {
            let prec = op.precedence();
            let (left_min, right_min) = match op.associativity() {
                Associativity::Left => (prec, prec + 1),
                Associativity::Right => (prec + 1, prec),
                Associativity::None => (prec + 1, prec + 1),
            };
            format!(
                "{} {} {}",
                operand(left, left_min),
                op.symbol(),
                operand(right, right_min)
            )
        }
        Expression::Assign { op, target, value } => format!(
            "{} {} {}",
            format_expression(target),
            op.symbol(),
            format_expression(value)
        ),
    }
}

/// Print `expr`, parenthesised when it binds looser than `min_prec`
fn operand(expr: &Expression, min_prec: u8) -> String {
    let text = format_expression(expr);
    if expr.precedence() < min_prec {
        format!("({})", text)
    } else {
        text
    }
}

fn format_key(key: &str) -> String {
    let mut chars = key.chars();
    let is_identifier = chars
        .next()
        .map_or(false, |c| c.is_ascii_alphabetic() || c == '_' || c == '$')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$');
    let reserved = matches!(
        key,
        "contract" | "collection" | "function" | "let" | "if" | "else" | "while" | "for"
            | "break" | "continue" | "return" | "throw" | "true" | "false" | "null" | "this"
    );
    if is_identifier && !reserved {
        key.to_string()
    } else {
        quote(key)
    }
}

// ── Helpers ────────────────────────────────────────────────

fn write_indent(out: &mut String, depth: usize) {
    for _ in 0..depth {
        out.push_str(INDENT);
    }
}
