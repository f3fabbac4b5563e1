//! JavaScript generator — projects the AST onto code for an external runtime
//!
//! # Calling convention
//!
//! Every emitted function takes the caller context as its first
//! parameter. Contract functions additionally expect the instance as the
//! JavaScript receiver:
//!
//! ```text
//! Wallet.functions.deposit.call(instance, { publicKey }, 5)
//! ```
//!
//! # Guarantees
//!
//! - **Deterministic**: identical AST in, byte-identical text out
//! - **Pure**: no I/O, no state between calls
//! - **Faithful or refused**: constructs JavaScript cannot express with the
//!   same meaning are `GenerationError::Unsupported`
//!
//! Every output starts with a prelude of `__`-prefixed helpers, and the
//! operators lower onto them so the generated code fails where the
//! interpreter fails:
//!
//! - `__clone` copies a place read into a local, an argument, a return
//!   value or an iteration
//! - `__eq` is structural equality; `__compare` orders numbers, or strings
//!   by code point, and refuses anything else
//! - `__add`, `__sub`, `__mul`, `__div`, `__mod`, `__pow` and `__neg` accept
//!   numbers only (`+` also joins two strings), refuse a zero divisor and
//!   non-finite results, and refuse integer results outside ±(2^53 - 1)
//! - `__bool` guards conditions and the operands of `&&`, `||` and `!`
//! - `__get` and `__index` read fields, keys, `length` and elements; unset
//!   keys read as `null` and out-of-range elements throw
//! - `__set` and `__update` write through the same checks
//! - `__method` runs the built-in array and string methods with the
//!   interpreter's argument checks, counting string positions in code points
//!
//! Errors are thrown as `error(message)` objects carrying the interpreter's
//! error text. Step and depth limits are left to the host runtime.
//!
//! A lone [`Node::FunctionDef`] has no contract around it: its `this` is
//! whatever receiver the host supplies, and field reads are not checked
//! against declarations.

use std::collections::BTreeSet;

use crate::error::GenerationError;
use crate::interpreter::builtins;
use crate::parser::ast::*;

const INDENT: &str = "    ";

/// Largest integer JavaScript numbers hold exactly
const MAX_SAFE_INTEGER: i64 = (1 << 53) - 1;

const PRELUDE: &str = r#""use strict";

function error(message) {
    return { message: message === undefined ? "" : String(message) };
}

function __fail(message) {
    throw error(message);
}

function __typeError(message) {
    __fail("Type error: " + message);
}

function __type(value) {
    if (value === null || value === undefined) {
        return "null";
    }
    if (Array.isArray(value)) {
        return "array";
    }
    if (typeof value === "number") {
        return Number.isInteger(value) ? "integer" : "float";
    }
    return typeof value;
}

function __clone(value) {
    if (Array.isArray(value)) {
        return value.map(__clone);
    }
    if (value !== null && typeof value === "object") {
        const copy = {};
        for (const key of Object.keys(value)) {
            copy[key] = __clone(value[key]);
        }
        return copy;
    }
    return value;
}

function __eq(a, b) {
    if (a === b || (a == null && b == null)) {
        return true;
    }
    if (Array.isArray(a) && Array.isArray(b)) {
        return a.length === b.length && a.every((item, i) => __eq(item, b[i]));
    }
    if (a !== null && b !== null && typeof a === "object" && typeof b === "object") {
        const keys = Object.keys(a);
        return keys.length === Object.keys(b).length && keys.every((k) => __eq(a[k], b[k]));
    }
    return false;
}

function __compare(a, b, symbol) {
    if (typeof a === "number" && typeof b === "number") {
        return a < b ? -1 : a > b ? 1 : 0;
    }
    if (typeof a === "string" && typeof b === "string") {
        const left = Array.from(a);
        const right = Array.from(b);
        for (let i = 0; i < left.length && i < right.length; i += 1) {
            const order = left[i].codePointAt(0) - right[i].codePointAt(0);
            if (order !== 0) {
                return order;
            }
        }
        return left.length - right.length;
    }
    __typeError("cannot apply " + symbol + " to " + __type(a) + " and " + __type(b));
}

function __bool(value, context) {
    if (typeof value !== "boolean") {
        __typeError(context + " must be boolean, found " + __type(value));
    }
    return value;
}

function __arith(symbol, a, b, result) {
    if (typeof a !== "number" || typeof b !== "number") {
        __typeError("cannot apply " + symbol + " to " + __type(a) + " and " + __type(b));
    }
    if (!Number.isFinite(result)) {
        __typeError("arithmetic result is not a finite number");
    }
    if (Number.isInteger(a) && Number.isInteger(b) && Number.isInteger(result) && !Number.isSafeInteger(result)) {
        __typeError("integer overflow in " + a + " " + symbol + " " + b);
    }
    return result;
}

function __add(a, b) {
    if (typeof a === "string" && typeof b === "string") {
        return a + b;
    }
    return __arith("+", a, b, a + b);
}

function __sub(a, b) {
    return __arith("-", a, b, a - b);
}

function __mul(a, b) {
    return __arith("*", a, b, a * b);
}

function __div(a, b) {
    if (typeof a === "number" && b === 0) {
        __fail("Division by zero");
    }
    return __arith("/", a, b, a / b);
}

function __mod(a, b) {
    if (typeof a === "number" && b === 0) {
        __fail("Division by zero");
    }
    return __arith("%", a, b, a % b);
}

function __pow(a, b) {
    return __arith("**", a, b, a ** b);
}

function __neg(value) {
    if (typeof value !== "number") {
        __typeError("cannot negate " + __type(value));
    }
    return -value;
}

function __get(object, key) {
    if (key === "length" && (Array.isArray(object) || typeof object === "string")) {
        return Array.from(object).length;
    }
    if (__type(object) !== "object") {
        __typeError(__type(object) + " has no property `" + key + "`");
    }
    return Object.prototype.hasOwnProperty.call(object, key) ? object[key] : null;
}

function __at(items, index) {
    if (index < 0 || index >= items.length) {
        __fail("Index " + index + " out of bounds for length " + items.length);
    }
    return items[index];
}

function __index(object, index) {
    if (Number.isInteger(index) && Array.isArray(object)) {
        return __at(object, index);
    }
    if (Number.isInteger(index) && typeof object === "string") {
        return __at(Array.from(object), index);
    }
    if ((typeof index === "string" || Number.isInteger(index)) && __type(object) === "object") {
        return __get(object, String(index));
    }
    __typeError("cannot index " + __type(object) + " with " + __type(index));
}

function __slot(object, key) {
    if (Number.isInteger(key) && Array.isArray(object)) {
        __at(object, key);
        return key;
    }
    if ((typeof key === "string" || Number.isInteger(key)) && __type(object) === "object") {
        return String(key);
    }
    if (typeof key === "string") {
        __typeError("cannot set property `" + key + "` on " + __type(object));
    }
    __typeError("cannot index into " + __type(object));
}

function __set(object, key, value) {
    object[__slot(object, key)] = value;
    return value;
}

function __update(object, key, apply, value) {
    const slot = __slot(object, key);
    const current = object[slot] === undefined ? null : object[slot];
    object[slot] = apply(current, value);
    return object[slot];
}

function __iter(value) {
    if (Array.isArray(value) || typeof value === "string") {
        return Array.from(value, (item) => __clone(item));
    }
    __typeError("cannot iterate over " + __type(value));
}

function __arity(name, args, min, max) {
    if (args.length < min || args.length > max) {
        const wanted = min === max ? String(min) : "at most " + max;
        __typeError("`" + name + "` takes " + wanted + " argument(s), found " + args.length);
    }
}

function __integer(name, value) {
    if (!Number.isInteger(value)) {
        __typeError("`" + name + "` expects a integer, found " + __type(value));
    }
    return value;
}

function __arrayMethod(items, name, args) {
    switch (name) {
        case "push":
            return items.push(...args);
        case "pop":
            return items.length === 0 ? null : items.pop();
        case "shift":
            return items.length === 0 ? null : items.shift();
        case "unshift":
            return items.unshift(...args);
        case "slice":
            __arity(name, args, 0, 2);
            return items.slice(...args.map((arg) => __integer(name, arg)));
        case "splice": {
            if (args.length === 0) {
                __typeError("`splice` takes at least 1 argument(s), found 0");
            }
            const start = __integer(name, args[0]);
            const count = args.length > 1 ? __integer(name, args[1]) : items.length;
            return items.splice(start, count, ...args.slice(2));
        }
        case "includes":
            __arity(name, args, 1, 1);
            return items.some((item) => __eq(item, args[0]));
        case "indexOf":
            __arity(name, args, 1, 1);
            return items.findIndex((item) => __eq(item, args[0]));
        case "join": {
            if (args.length > 0 && typeof args[0] !== "string") {
                __typeError("`join` expects a string, found " + __type(args[0]));
            }
            const separator = args.length > 0 ? args[0] : ",";
            return items.map((item) => (item === null ? "" : String(item))).join(separator);
        }
    }
    __typeError("array has no method `" + name + "`");
}

function __stringMethod(text, name, args) {
    switch (name) {
        case "toLowerCase":
        case "toUpperCase":
        case "trim":
            return text[name]();
        case "slice":
            __arity(name, args, 0, 2);
            return Array.from(text).slice(...args.map((arg) => __integer(name, arg))).join("");
        case "startsWith":
        case "endsWith":
        case "includes":
        case "indexOf": {
            __arity(name, args, 1, 1);
            if (typeof args[0] !== "string") {
                __typeError("`" + name + "` expects a string, found " + __type(args[0]));
            }
            if (name !== "indexOf") {
                return text[name](args[0]);
            }
            const index = text.indexOf(args[0]);
            return index < 0 ? -1 : Array.from(text.slice(0, index)).length;
        }
    }
    __typeError("string has no method `" + name + "`");
}

function __method(receiver, name, args) {
    if (Array.isArray(receiver)) {
        return __arrayMethod(receiver, name, args);
    }
    if (typeof receiver === "string") {
        return __stringMethod(receiver, name, args);
    }
    __typeError(__type(receiver) + " has no method `" + name + "`");
}
"#;

/// Identifiers that would change meaning or fail to parse in JavaScript
const JS_RESERVED: &[&str] = &[
    "arguments", "await", "case", "catch", "class", "const", "debugger", "default", "delete",
    "do", "enum", "eval", "export", "extends", "finally", "implements", "import", "in",
    "instanceof", "interface", "new", "package", "private", "protected", "static", "super",
    "switch", "try", "typeof", "undefined", "var", "void", "with", "yield",
];

/// Emit JavaScript for a program, a single contract or a single function
///
/// # Errors
/// `GenerationError::Unsupported` naming the first construct that has no
/// faithful JavaScript form.
pub fn generate(node: &Node) -> Result<String, GenerationError> {
    let output = match node {
        Node::Program(program) => {
            let mut generator = Generator::new(Some(program), None);
            for function in &program.functions {
                generator.out.push('\n');
                generator.free_function(function)?;
            }
            for contract in &program.contracts {
                generator.out.push('\n');
                generator.contract = Some(contract);
                generator.contract_object(contract)?;
            }
            generator.out
        }
        Node::Contract(contract) => {
            let mut generator = Generator::new(None, Some(contract));
            generator.out.push('\n');
            generator.contract_object(contract)?;
            generator.out
        }
        Node::FunctionDef(function) => {
            let mut generator = Generator::new(None, None);
            generator.detached = true;
            generator.out.push('\n');
            generator.free_function(function)?;
            generator.out
        }
    };

    tracing::debug!(bytes = output.len(), "generated javascript");
    Ok(output)
}

// ── Declarations ───────────────────────────────────────────

struct Generator<'p> {
    program: Option<&'p Program>,
    contract: Option<&'p Contract>,
    out: String,
    depth: usize,
    /// Names bound in each open block of the current function
    scopes: Vec<BTreeSet<String>>,
    /// Loops enclosing the current statement
    loops: usize,
    /// Emitting a lone function whose contract is unknown
    detached: bool,
}

impl<'p> Generator<'p> {
    fn new(program: Option<&'p Program>, contract: Option<&'p Contract>) -> Self {
        Generator {
            program,
            contract,
            out: PRELUDE.to_string(),
            depth: 0,
            scopes: Vec::new(),
            loops: 0,
            detached: false,
        }
    }

    fn line(&mut self, text: &str) {
        for _ in 0..self.depth {
            self.out.push_str(INDENT);
        }
        self.out.push_str(text);
        self.out.push('\n');
    }

    fn free_function(&mut self, function: &FunctionDef) -> Result<(), GenerationError> {
        let contract = self.contract.take();
        let header = format!("function {}({}) {{", name(&function.name)?, self.parameters(function)?);
        self.line(&header);
        self.function_body(function)?;
        self.line("}");
        self.contract = contract;
        Ok(())
    }

    fn contract_object(&mut self, contract: &Contract) -> Result<(), GenerationError> {
        self.line(&format!("const {} = {{", name(&contract.name)?));
        self.depth += 1;
        self.line(&format!("name: {},", js_string(&contract.name)));

        self.line("fields: [");
        self.depth += 1;
        for field in &contract.fields {
            let decorators: Vec<String> = field
                .decorators
                .iter()
                .map(|d| js_string(&d.name))
                .collect();
            self.line(&format!(
                "{{ name: {}, type: {}, required: {}, decorators: [{}] }},",
                js_string(&field.name),
                js_string(&field.ty.to_string()),
                field.required,
                decorators.join(", ")
            ));
        }
        self.depth -= 1;
        self.line("],");

        self.line("functions: {");
        self.depth += 1;
        for function in &contract.functions {
            let header = format!(
                "{}: function ({}) {{",
                js_key(&function.name),
                self.parameters(function)?
            );
            self.line(&header);
            self.function_body(function)?;
            self.line("},");
        }
        self.depth -= 1;
        self.line("},");

        self.depth -= 1;
        self.line("};");
        Ok(())
    }

    fn parameters(&self, function: &FunctionDef) -> Result<String, GenerationError> {
        if let Some(ty) = &function.return_type {
            exact_in_javascript(ty, &format!("return type of `{}`", function.name))?;
        }
        let mut names = vec!["ctx".to_string()];
        for parameter in &function.parameters {
            if parameter.name == "ctx" {
                return Err(unsupported("parameter named `ctx`"));
            }
            exact_in_javascript(&parameter.ty, &format!("parameter `{}`", parameter.name))?;
            names.push(name(&parameter.name)?.to_string());
        }
        Ok(names.join(", "))
    }

    fn function_body(&mut self, function: &FunctionDef) -> Result<(), GenerationError> {
        let mut bound: BTreeSet<String> = function.parameters.iter().map(|p| p.name.clone()).collect();
        bound.insert("ctx".to_string());
        self.scopes = vec![bound];
        self.loops = 0;
        self.body(&function.body)?;
        self.scopes.clear();
        Ok(())
    }

    /// JavaScript refuses a `let` that repeats a name in its block or a parameter
    fn bind(&mut self, binding: &str) -> Result<(), GenerationError> {
        if self.scopes.iter().any(|scope| scope.contains(binding)) {
            return Err(unsupported(&format!("redeclaration of `{}`", binding)));
        }
        if let Some(scope) = self.scopes.last_mut() {
            scope.insert(binding.to_string());
        }
        Ok(())
    }

    // ── Statements ─────────────────────────────────────

    fn body(&mut self, statements: &[Statement]) -> Result<(), GenerationError> {
        self.depth += 1;
        self.scopes.push(BTreeSet::new());
        for statement in statements {
            self.statement(statement)?;
        }
        self.scopes.pop();
        self.depth -= 1;
        Ok(())
    }

    fn loop_body(&mut self, statements: &[Statement]) -> Result<(), GenerationError> {
        self.loops += 1;
        self.body(statements)?;
        self.loops -= 1;
        Ok(())
    }

    fn statement(&mut self, statement: &Statement) -> Result<(), GenerationError> {
        match &statement.kind {
            StatementKind::If {
                condition,
                then_branch,
                else_branch,
            } => {
                let head = format!("if ({}) {{", self.boolean(condition, "if condition", 0)?);
                self.line(&head);
                self.if_tail(then_branch, else_branch)
            }
            StatementKind::While { condition, body } => {
                let head = format!("while ({}) {{", self.boolean(condition, "while condition", 0)?);
                self.line(&head);
                self.loop_body(body)?;
                self.line("}");
                Ok(())
            }
            StatementKind::For {
                init,
                condition,
                update,
                body,
            } => {
                self.scopes.push(BTreeSet::new());
                let init = match init {
                    Some(init) => self.simple_statement(init)?,
                    None => String::new(),
                };
                let condition = match condition {
                    Some(c) => format!(" {}", self.boolean(c, "for condition", 0)?),
                    None => String::new(),
                };
                let update = match update {
                    Some(u) => format!(" {}", self.expression(u)?),
                    None => String::new(),
                };
                self.line(&format!("for ({};{};{}) {{", init, condition, update));
                self.loop_body(body)?;
                self.line("}");
                self.scopes.pop();
                Ok(())
            }
            StatementKind::ForOf {
                binding,
                iterable,
                body,
            } => {
                let iterable = self.expression(iterable)?;
                self.scopes.push(BTreeSet::new());
                self.bind(binding)?;
                self.line(&format!("for (let {} of __iter({})) {{", name(binding)?, iterable));
                self.loop_body(body)?;
                self.line("}");
                self.scopes.pop();
                Ok(())
            }
            _ => {
                let text = self.simple_statement(statement)?;
                self.line(&format!("{};", text));
                Ok(())
            }
        }
    }

    fn if_tail(&mut self, then_branch: &[Statement], else_branch: &[Statement]) -> Result<(), GenerationError> {
        self.body(then_branch)?;
        match else_branch {
            [] => self.line("}"),
            [Statement {
                kind:
                    StatementKind::If {
                        condition,
                        then_branch,
                        else_branch,
                    },
                ..
            }] => {
                let head = format!("}} else if ({}) {{", self.boolean(condition, "if condition", 0)?);
                self.line(&head);
                return self.if_tail(then_branch, else_branch);
            }
            _ => {
                self.line("} else {");
                self.body(else_branch)?;
                self.line("}");
            }
        }
        Ok(())
    }

    /// A statement that fits on one line, without the trailing `;`
    fn simple_statement(&mut self, statement: &Statement) -> Result<String, GenerationError> {
        Ok(match &statement.kind {
            StatementKind::Let { name: binding, value } => {
                let value = self.value(value)?;
                self.bind(binding)?;
                format!("let {} = {}", name(binding)?, value)
            }
            StatementKind::Expression { expression } => self.expression(expression)?,
            StatementKind::Break | StatementKind::Continue if self.loops == 0 => {
                let keyword = if matches!(statement.kind, StatementKind::Break) { "break" } else { "continue" };
                return Err(unsupported(&format!("`{}` outside of a loop", keyword)));
            }
            StatementKind::Break => "break".to_string(),
            StatementKind::Continue => "continue".to_string(),
            StatementKind::Return { value: None } => "return".to_string(),
            StatementKind::Return { value: Some(value) } => format!("return {}", self.value(value)?),
            StatementKind::Throw { value } => format!("throw {}", self.expression(value)?),
            StatementKind::If { .. }
            | StatementKind::While { .. }
            | StatementKind::For { .. }
            | StatementKind::ForOf { .. } => {
                return Err(unsupported("block statement in a `for` header"))
            }
        })
    }

    // ── Expressions ────────────────────────────────────

    /// An expression whose result is stored or passed on; places are copied
    fn value(&self, expr: &Expression) -> Result<String, GenerationError> {
        let text = self.expression(expr)?;
        Ok(match expr {
            Expression::Ident { .. }
            | Expression::Member { .. }
            | Expression::Index { .. }
            | Expression::Assign { .. }
            | Expression::This => format!("__clone({})", text),
            _ => text,
        })
    }

    /// An expression that must be boolean, checked unless it always is
    fn boolean(&self, expr: &Expression, context: &str, min_prec: u8) -> Result<String, GenerationError> {
        if yields_boolean(expr) {
            self.operand(expr, min_prec)
        } else {
            Ok(format!("__bool({}, {})", self.expression(expr)?, js_string(context)))
        }
    }

    fn expression(&self, expr: &Expression) -> Result<String, GenerationError> {
        Ok(match expr {
            Expression::Literal { value } => literal(value)?,
            Expression::Ident { name: ident } => name(ident)?.to_string(),
            Expression::This if self.contract.is_some() || self.detached => "this".to_string(),
            Expression::This => fail("Undefined reference: `this` outside a contract"),
            Expression::Array { elements } => {
                let items = elements
                    .iter()
                    .map(|e| self.value(e))
                    .collect::<Result<Vec<_>, _>>()?;
                format!("[{}]", items.join(", "))
            }
            Expression::Object { entries } => {
                if entries.is_empty() {
                    return Ok("{}".to_string());
                }
                let items = entries
                    .iter()
                    .map(|entry| Ok(format!("{}: {}", js_string(&entry.key), self.value(&entry.value)?)))
                    .collect::<Result<Vec<_>, GenerationError>>()?;
                format!("{{ {} }}", items.join(", "))
            }
            Expression::Member { object, property } => match self.undeclared(object, property) {
                Some(failure) => failure,
                None => format!("__get({}, {})", self.expression(object)?, js_string(property)),
            },
            Expression::Index { object, index } => {
                format!("__index({}, {})", self.expression(object)?, self.expression(index)?)
            }
            Expression::Call { callee, arguments } => self.call(callee, arguments)?,
            Expression::Unary { op: UnaryOp::Not, operand } => {
                format!("!{}", self.boolean(operand, "operand of `!`", 9)?)
            }
            Expression::Unary { op: UnaryOp::Negate, operand } => {
                format!("__neg({})", self.expression(operand)?)
            }
            Expression::Binary { op, left, right } => self.binary(*op, left, right)?,
            Expression::Assign { op, target, value } => self.assign(*op, target, value)?,
        })
    }

    /// Reading or writing `this.field` needs a contract declaring `field`
    fn undeclared(&self, object: &Expression, property: &str) -> Option<String> {
        if !matches!(object, Expression::This) {
            return None;
        }
        match self.contract {
            None if self.detached => None,
            None => Some(fail("Undefined reference: `this` outside a contract")),
            Some(contract) if contract.field(property).is_none() => {
                Some(fail(&format!("Undefined reference: this.{}", property)))
            }
            Some(_) => None,
        }
    }

    fn binary(&self, op: BinaryOp, left: &Expression, right: &Expression) -> Result<String, GenerationError> {
        let prec = op.precedence();
        match op {
            BinaryOp::Equal => Ok(format!("__eq({}, {})", self.expression(left)?, self.expression(right)?)),
            BinaryOp::NotEqual => Ok(format!("!__eq({}, {})", self.expression(left)?, self.expression(right)?)),
            BinaryOp::And | BinaryOp::Or => Ok(format!(
                "{} {} {}",
                self.boolean(left, "logical operand", prec)?,
                op.symbol(),
                self.boolean(right, "logical operand", prec + 1)?
            )),
            BinaryOp::Less | BinaryOp::LessEqual | BinaryOp::Greater | BinaryOp::GreaterEqual => Ok(format!(
                "__compare({}, {}, {}) {} 0",
                self.expression(left)?,
                self.expression(right)?,
                js_string(op.symbol()),
                op.symbol()
            )),
            _ => Ok(format!(
                "{}({}, {})",
                arithmetic(op),
                self.expression(left)?,
                self.expression(right)?
            )),
        }
    }

    fn assign(&self, op: AssignOp, target: &Expression, value: &Expression) -> Result<String, GenerationError> {
        let (object, key) = match target {
            Expression::Ident { name: ident } => {
                let ident = name(ident)?;
                return Ok(match op.binary() {
                    None => format!("{} = {}", ident, self.value(value)?),
                    Some(arith) => format!(
                        "{} = {}({}, {})",
                        ident,
                        arithmetic(arith),
                        ident,
                        self.expression(value)?
                    ),
                });
            }
            Expression::Member { object, property } => {
                if let Some(failure) = self.undeclared(object, property) {
                    return Ok(failure);
                }
                (self.expression(object)?, js_string(property))
            }
            Expression::Index { object, index } => (self.expression(object)?, self.expression(index)?),
            _ => return Err(unsupported("assignment to a computed expression")),
        };

        Ok(match op.binary() {
            None => format!("__set({}, {}, {})", object, key, self.value(value)?),
            Some(arith) => format!(
                "__update({}, {}, {}, {})",
                object,
                key,
                arithmetic(arith),
                self.expression(value)?
            ),
        })
    }

    fn call(&self, callee: &Expression, arguments: &[Expression]) -> Result<String, GenerationError> {
        let args = arguments
            .iter()
            .map(|a| self.value(a))
            .collect::<Result<Vec<_>, _>>()?;

        match callee {
            Expression::Ident { name: function } => {
                let declared = self.program.map_or(false, |p| p.function(function).is_some());
                if function == "error" && !declared {
                    Ok(format!("error({})", args.join(", ")))
                } else {
                    let mut all = vec!["ctx".to_string()];
                    all.extend(args);
                    Ok(format!("{}({})", name(function)?, all.join(", ")))
                }
            }
            Expression::Member { object, property } => {
                if let (Expression::This, Some(contract)) = (&**object, self.contract) {
                    if contract.function(property).is_some() {
                        let mut all = vec!["this".to_string(), "ctx".to_string()];
                        all.extend(args);
                        return Ok(format!(
                            "{}.functions.{}.call({})",
                            contract.name,
                            js_key(property),
                            all.join(", ")
                        ));
                    }
                }
                if !builtins::is_known_method(property) {
                    return Err(unsupported(&format!("method `{}`", property)));
                }
                Ok(format!(
                    "__method({}, {}, [{}])",
                    self.expression(object)?,
                    js_string(property),
                    args.join(", ")
                ))
            }
            _ => Err(unsupported("call of a computed expression")),
        }
    }

    fn operand(&self, expr: &Expression, min_prec: u8) -> Result<String, GenerationError> {
        let text = self.expression(expr)?;
        Ok(if expr.precedence() < min_prec {
            format!("({})", text)
        } else {
            text
        })
    }
}

// ── Helpers ────────────────────────────────────────────────

/// Prelude helper performing an arithmetic operator
fn arithmetic(op: BinaryOp) -> &'static str {
    match op {
        BinaryOp::Add => "__add",
        BinaryOp::Subtract => "__sub",
        BinaryOp::Multiply => "__mul",
        BinaryOp::Divide => "__div",
        BinaryOp::Modulo => "__mod",
        _ => "__pow",
    }
}

/// Whether `expr` evaluates to a boolean or throws
fn yields_boolean(expr: &Expression) -> bool {
    match expr {
        Expression::Literal {
            value: Literal::Boolean(_),
        } => true,
        Expression::Unary { op: UnaryOp::Not, .. } => true,
        Expression::Binary { op, .. } => matches!(
            op,
            BinaryOp::And
                | BinaryOp::Or
                | BinaryOp::Equal
                | BinaryOp::NotEqual
                | BinaryOp::Less
                | BinaryOp::LessEqual
                | BinaryOp::Greater
                | BinaryOp::GreaterEqual
        ),
        _ => false,
    }
}

/// An expression that throws `message` when evaluated
fn fail(message: &str) -> String {
    format!("__fail({})", js_string(message))
}

fn literal(value: &Literal) -> Result<String, GenerationError> {
    Ok(match value {
        Literal::Null => "null".to_string(),
        Literal::Boolean(b) => b.to_string(),
        Literal::Integer(i) if i.unsigned_abs() <= MAX_SAFE_INTEGER as u64 => i.to_string(),
        Literal::Integer(i) => {
            return Err(unsupported(&format!("integer literal {} beyond ±(2^53 - 1)", i)))
        }
        Literal::Float(v) if v.is_finite() => format_float(*v),
        Literal::Float(_) => return Err(unsupported("non-finite number literal")),
        Literal::String(s) => js_string(s),
    })
}

/// JSON escaping is valid JavaScript string syntax
fn js_string(s: &str) -> String {
    serde_json::Value::String(s.to_string()).to_string()
}

fn js_key(key: &str) -> String {
    let mut chars = key.chars();
    let plain = chars
        .next()
        .map_or(false, |c| c.is_ascii_alphabetic() || c == '_' || c == '$')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$');
    if plain {
        key.to_string()
    } else {
        js_string(key)
    }
}

fn name(ident: &str) -> Result<&str, GenerationError> {
    if JS_RESERVED.contains(&ident) {
        Err(unsupported(&format!("identifier `{}` is reserved in JavaScript", ident)))
    } else if ident.starts_with("__") {
        Err(unsupported(&format!("identifier `{}` clashes with generated helpers", ident)))
    } else {
        Ok(ident)
    }
}

/// JavaScript numbers hold 64-bit integers only approximately
fn exact_in_javascript(ty: &Type, position: &str) -> Result<(), GenerationError> {
    match ty {
        Type::I64 | Type::U64 => Err(unsupported(&format!("{} of type {}", position, ty))),
        Type::Array { element } => exact_in_javascript(element, position),
        Type::Map { key, value } => {
            exact_in_javascript(key, position)?;
            exact_in_javascript(value, position)
        }
        Type::Object { fields } => fields
            .iter()
            .try_for_each(|f| exact_in_javascript(&f.ty, position)),
        _ => Ok(()),
    }
}

fn unsupported(construct: &str) -> GenerationError {
    GenerationError::Unsupported {
        construct: construct.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse;

    const SOURCE: &str = r#"
        function double(n: number): number {
            return n * 2;
        }

        @public
        collection Counter {
            id: string;
            count: number;
            tags?: string[];

            function increment(by: number): number {
                if (by == 0) {
                    throw error("nothing to add");
                } else if (by < 0) {
                    this.count -= by;
                } else {
                    this.count += double(by);
                }
                return this.count;
            }

            function tag(label: string) {
                let tags = this.tags;
                tags.push(label.trim());
                this.tags = tags;
                this.increment(1);
            }
        }
    "#;

    fn program_js() -> String {
        generate(&Node::Program(parse(SOURCE).unwrap())).unwrap()
    }

    fn function_js(source: &str) -> Result<String, GenerationError> {
        generate(&Node::Program(parse(source).unwrap()))
    }

    fn unsupported_construct(result: Result<String, GenerationError>) -> String {
        match result {
            Err(GenerationError::Unsupported { construct }) => construct,
            other => panic!("expected Unsupported, got {:?}", other),
        }
    }

    /// Run `script` under node, or `None` when node is not installed
    fn run_node(label: &str, script: &str) -> Option<std::process::Output> {
        let path = std::env::temp_dir().join(format!("charter-{}-{}.js", label, std::process::id()));
        std::fs::write(&path, script).unwrap();
        let output = std::process::Command::new("node").arg(&path).output();
        let _ = std::fs::remove_file(&path);
        match output {
            Ok(output) => Some(output),
            Err(_) => {
                eprintln!("node not found; skipping");
                None
            }
        }
    }

    // ── Layout ─────────────────────────────────────────

    #[test]
    fn test_program_layout() {
        let js = program_js();
        assert!(js.starts_with("\"use strict\";"));
        assert!(js.contains("function double(ctx, n) {\n    return __mul(n, 2);\n}\n"));
        assert!(js.contains("const Counter = {\n    name: \"Counter\",\n"));
        assert!(js.contains(
            "{ name: \"tags\", type: \"string[]\", required: false, decorators: [] },"
        ));
        assert!(js.contains("        increment: function (ctx, by) {\n"));
        assert!(js.trim_end().ends_with("};"));
    }

    #[test]
    fn test_single_function_includes_prelude() {
        let program = parse(SOURCE).unwrap();
        let function = program.function("double").unwrap().clone();
        let js = generate(&Node::FunctionDef(function)).unwrap();
        assert!(js.starts_with("\"use strict\";"));
        assert!(js.contains("function __mul(a, b)"));
        assert!(js.ends_with("\nfunction double(ctx, n) {\n    return __mul(n, 2);\n}\n"));
    }

    #[test]
    fn test_single_contract_function_keeps_receiver() {
        let program = parse(SOURCE).unwrap();
        let function = program.contract("Counter").unwrap().function("increment").unwrap().clone();
        let js = generate(&Node::FunctionDef(function)).unwrap();
        assert!(js.contains("return __clone(__get(this, \"count\"));"));

        let free = function_js("function f() { return this.count; }").unwrap();
        assert!(free.contains("__fail(\"Undefined reference: `this` outside a contract\")"));
    }

    #[test]
    fn test_contract_fragment_includes_prelude() {
        let program = parse(SOURCE).unwrap();
        let contract = program.contract("Counter").unwrap().clone();
        let js = generate(&Node::Contract(contract)).unwrap();
        assert!(js.contains("function __eq(a, b)"));
        assert!(js.contains("const Counter = {"));
    }

    // ── Lowering ───────────────────────────────────────

    #[test]
    fn test_equality_and_else_if() {
        let js = program_js();
        assert!(js.contains("if (__eq(by, 0)) {"));
        assert!(js.contains("} else if (__compare(by, 0, \"<\") < 0) {"));
        assert!(js.contains("throw error(\"nothing to add\");"));
        assert!(js.contains("__update(this, \"count\", __sub, by);"));
        assert!(js.contains("__update(this, \"count\", __add, double(ctx, __clone(by)));"));
        assert!(js.contains("return __clone(__get(this, \"count\"));"));
    }

    #[test]
    fn test_places_are_copied() {
        let js = program_js();
        assert!(js.contains("let tags = __clone(__get(this, \"tags\"));"));
        assert!(js.contains("__method(tags, \"push\", [__method(label, \"trim\", [])]);"));
        assert!(js.contains("__set(this, \"tags\", __clone(tags));"));
    }

    #[test]
    fn test_sibling_call_binds_instance() {
        let js = program_js();
        assert!(js.contains("Counter.functions.increment.call(this, ctx, 1);"));
    }

    #[test]
    fn test_power_with_unary_base() {
        let js = function_js("function f(a: number): number { return -a ** 2; }").unwrap();
        assert!(js.contains("return __pow(__neg(a), 2);"));
    }

    #[test]
    fn test_division_and_strings() {
        let js = function_js(
            "function f(a: number, s: string): string { a /= 2; return s + \"\\\"q\\n\" + a % 3; }",
        )
        .unwrap();
        assert!(js.contains("a = __div(a, 2);"));
        assert!(js.contains(r#"return __add(__add(s, "\"q\n"), __mod(a, 3));"#));
    }

    #[test]
    fn test_conditions_must_be_boolean() {
        let js = function_js(
            r#"function f(a: number, b: boolean): boolean {
                while (b) { b = !b; }
                if (a > 1 && b || !(a < 0)) { return true; }
                return a == 1 && b;
            }"#,
        )
        .unwrap();
        assert!(js.contains("while (__bool(b, \"while condition\")) {"));
        assert!(js.contains("b = !__bool(b, \"operand of `!`\");"));
        assert!(js.contains(
            "if (__compare(a, 1, \">\") > 0 && __bool(b, \"logical operand\") || !(__compare(a, 0, \"<\") < 0)) {"
        ));
        assert!(js.contains("return __eq(a, 1) && __bool(b, \"logical operand\");"));
    }

    #[test]
    fn test_reads_and_writes_are_checked() {
        let js = function_js(
            r#"function f(xs: number[], m: map<string, number>): number {
                xs[0] = m["k"];
                xs[1] += xs.length;
                return xs[0];
            }"#,
        )
        .unwrap();
        assert!(js.contains("__set(xs, 0, __clone(__index(m, \"k\")));"));
        assert!(js.contains("__update(xs, 1, __add, __get(xs, \"length\"));"));
        assert!(js.contains("return __clone(__index(xs, 0));"));
    }

    #[test]
    fn test_for_of_iterates_a_copy() {
        let js = function_js(
            "function sum(xs: number[]): number { let total = 0; for (let x of xs) { total += x; } return total; }",
        )
        .unwrap();
        assert!(js.contains("for (let x of __iter(xs)) {"));
        assert!(js.contains("total = __add(total, x);"));
    }

    #[test]
    fn test_undeclared_field_throws_when_reached() {
        let js = function_js(
            "collection C { id: string; function f() { this.missing = 1; return this.nope; } }",
        )
        .unwrap();
        assert!(js.contains("__fail(\"Undefined reference: this.missing\");"));
        assert!(js.contains("return __clone(__fail(\"Undefined reference: this.nope\"));"));
    }

    // ── Unsupported ────────────────────────────────────

    #[test]
    fn test_wide_integers_are_unsupported() {
        let construct = unsupported_construct(function_js("function f(a: i64) {}"));
        assert!(construct.contains("i64"));
        assert!(function_js("function f(): u64[] { return []; }").is_err());
    }

    #[test]
    fn test_unsafe_integer_literal_is_unsupported() {
        let construct =
            unsupported_construct(function_js("function f(): number { return 9007199254740993; }"));
        assert!(construct.contains("9007199254740993"));
        assert!(function_js("function f(): number { return -9007199254740991; }").is_ok());
    }

    #[test]
    fn test_unknown_method_is_unsupported() {
        let construct = unsupported_construct(function_js("function f(a: string[]) { a.reverse(); }"));
        assert_eq!(construct, "method `reverse`");
    }

    #[test]
    fn test_javascript_reserved_identifier_is_unsupported() {
        assert!(function_js("function f() { let delete = 1; }").is_err());
    }

    #[test]
    fn test_redeclaration_is_unsupported() {
        // Hand-built trees can carry what the parser refuses
        let mut program = parse("function f(a: number) { let b = 1; let c = 2; }").unwrap();
        if let StatementKind::Let { ref mut name, .. } = program.functions[0].body[1].kind {
            *name = "b".into();
        }
        let construct = unsupported_construct(generate(&Node::Program(program.clone())));
        assert_eq!(construct, "redeclaration of `b`");

        if let StatementKind::Let { ref mut name, .. } = program.functions[0].body[0].kind {
            *name = "a".into();
        }
        let construct = unsupported_construct(generate(&Node::Program(program)));
        assert_eq!(construct, "redeclaration of `a`");
    }

    #[test]
    fn test_break_outside_loop_is_unsupported() {
        let mut program = parse("function f() { while (true) { break; } }").unwrap();
        let StatementKind::While { ref body, .. } = program.functions[0].body[0].kind else {
            panic!("expected while loop");
        };
        let inner = body.clone();
        program.functions[0].body = inner;
        let construct = unsupported_construct(generate(&Node::Program(program)));
        assert_eq!(construct, "`break` outside of a loop");
    }

    // ── Under node ─────────────────────────────────────

    #[test]
    fn test_output_is_valid_javascript() {
        let path = std::env::temp_dir().join(format!("charter-check-{}.js", std::process::id()));
        std::fs::write(&path, program_js()).unwrap();
        let status = std::process::Command::new("node").arg("--check").arg(&path).status();
        let _ = std::fs::remove_file(&path);
        match status {
            Ok(status) => assert!(status.success(), "node rejected the generated program"),
            Err(_) => eprintln!("node not found; skipping"),
        }
    }

    #[test]
    fn test_output_behaves_like_interpreter() {
        use crate::interpreter::{interpret, value, Value};
        use serde_json::json;

        let program = parse(SOURCE).unwrap();
        let instance = json!({ "id": "c1", "count": 2 });
        let incremented = interpret(&program, "Counter", "increment", &[json!(3)], &instance).unwrap();
        let untagged = interpret(&program, "Counter", "tag", &[json!(" a ")], &instance).unwrap_err();
        let mismatch = value::binary(BinaryOp::Multiply, &Value::String("x".into()), &Value::Integer(2))
            .unwrap_err();

        let driver = r#"
const ctx = { publicKey: null };
const instance = { id: "c1", count: 2 };
const out = [];
const attempt = (run) => {
    try {
        out.push(run());
    } catch (e) {
        out.push(e.message);
    }
};
attempt(() => Counter.functions.increment.call(instance, ctx, 3));
attempt(() => Counter.functions.increment.call(instance, ctx, 0));
attempt(() => Counter.functions.tag.call({ id: "c1", count: 2 }, ctx, " a "));
attempt(() => double(ctx, "x"));
out.push(instance);
console.log(JSON.stringify(out));
"#;
        let Some(output) = run_node("run", &format!("{}{}", program_js(), driver)) else {
            return;
        };
        assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));

        let printed: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
        assert_eq!(
            printed,
            json!([
                incremented.return_value,
                "nothing to add",
                untagged.to_string(),
                mismatch.to_string(),
                incremented.instance
            ])
        );
    }

    // ── Determinism ────────────────────────────────────

    #[test]
    fn test_determinism_100_iterations() {
        let first = program_js();
        for i in 0..100 {
            assert_eq!(program_js(), first, "Determinism failure at iteration {}", i);
        }
    }
}
