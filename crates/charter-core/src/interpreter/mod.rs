//! Interpreter — runs a contract function against a data instance
//!
//! A tree-walking evaluator over the AST. The instance is passed in
//! explicitly and threaded through execution as `this`; nothing is
//! ambient or global.
//!
//! # Transaction model
//!
//! The body works on a private copy of the instance. Only when the body
//! completes and every changed field still matches its declared type is
//! the copy handed back in an [`Outcome`]. Any error discards it.
//!
//! # Bounds
//!
//! Every statement and loop iteration costs one step; each nested call
//! adds one level of depth; each nested block or subexpression adds one
//! level of nesting. Exceeding [`Limits`] aborts with
//! `RuntimeError::LimitExceeded`.

pub mod builtins;
pub mod value;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub use value::Value;

use crate::error::RuntimeError;
use crate::parser::ast::*;
use crate::schema;
use crate::signature::PublicKey;

type Result<T> = std::result::Result<T, RuntimeError>;

// ── Configuration ─────────────────────────────────────────

/// Resource bounds for one call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Limits {
    pub max_steps: u64,
    pub max_call_depth: usize,
    /// Blocks and subexpressions open at once, summed across calls
    pub max_nesting: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Limits {
            max_steps: 1_000_000,
            max_call_depth: 64,
            max_nesting: 512,
        }
    }
}

/// Who is calling; exposed to the body as `ctx`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallContext {
    pub public_key: Option<PublicKey>,
}

/// Successful call: the return value and the next instance
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Outcome {
    #[serde(rename = "returnValue")]
    pub return_value: serde_json::Value,
    pub instance: serde_json::Value,
}

// ── Interpreter ───────────────────────────────────────────

pub struct Interpreter<'p> {
    program: &'p Program,
    limits: Limits,
}

impl<'p> Interpreter<'p> {
    pub fn new(program: &'p Program) -> Self {
        Interpreter {
            program,
            limits: Limits::default(),
        }
    }

    pub fn with_limits(mut self, limits: Limits) -> Self {
        self.limits = limits;
        self
    }

    /// Run `contract.function(args)` against `instance`
    ///
    /// A `null` instance stands for a record that does not exist yet.
    ///
    /// # Errors
    /// Any `RuntimeError`; no instance is returned in that case.
    pub fn call(
        &self,
        contract: &str,
        function: &str,
        args: &[serde_json::Value],
        instance: &serde_json::Value,
        ctx: &CallContext,
    ) -> Result<Outcome> {
        let declared = self
            .program
            .contract(contract)
            .ok_or_else(|| RuntimeError::UndefinedReference(format!("contract `{}`", contract)))?;
        let def = declared.function(function).ok_or_else(|| {
            RuntimeError::UndefinedReference(format!("function `{}.{}`", contract, function))
        })?;

        let this = match instance {
            serde_json::Value::Null => Value::Object(BTreeMap::new()),
            serde_json::Value::Object(_) => Value::from_json(instance),
            other => {
                return Err(RuntimeError::TypeError(format!(
                    "instance must be an object, found {}",
                    schema::describe(other)
                )))
            }
        };

        let ctx_value = {
            let key = ctx
                .public_key
                .map_or(Value::Null, |k| Value::String(k.to_hex()));
            Value::Object(BTreeMap::from([("publicKey".to_string(), key)]))
        };

        tracing::debug!(contract, function, args = args.len(), "interpreting call");

        let mut machine = Machine {
            program: self.program,
            limits: self.limits,
            steps: 0,
            depth: 0,
            nesting: 0,
            this,
            ctx: ctx_value,
        };

        let args: Vec<Value> = args.iter().map(Value::from_json).collect();
        let return_value = machine.invoke(def, Some(declared), args)?;
        machine.commit(declared, instance)?;

        tracing::debug!(contract, function, steps = machine.steps, "call completed");

        Ok(Outcome {
            return_value: return_value.to_json(),
            instance: machine.this.to_json(),
        })
    }
}

/// Run a call with default limits and no caller identity
pub fn interpret(
    program: &Program,
    contract: &str,
    function: &str,
    args: &[serde_json::Value],
    instance: &serde_json::Value,
) -> Result<Outcome> {
    Interpreter::new(program).call(contract, function, args, instance, &CallContext::default())
}

// ── Execution state ───────────────────────────────────────

struct Machine<'p> {
    program: &'p Program,
    limits: Limits,
    steps: u64,
    depth: usize,
    nesting: usize,
    this: Value,
    ctx: Value,
}

/// Locals of one function activation
struct Frame<'p> {
    contract: Option<&'p Contract>,
    scopes: Vec<BTreeMap<String, Value>>,
}

impl<'p> Frame<'p> {
    fn lookup(&self, name: &str) -> Option<&Value> {
        self.scopes.iter().rev().find_map(|scope| scope.get(name))
    }

    fn lookup_mut(&mut self, name: &str) -> Option<&mut Value> {
        self.scopes.iter_mut().rev().find_map(|scope| scope.get_mut(name))
    }

    fn declare(&mut self, name: &str, value: Value) {
        if let Some(scope) = self.scopes.last_mut() {
            scope.insert(name.to_string(), value);
        }
    }
}

/// How a statement finished
enum Flow {
    Next,
    Break,
    Continue,
    Return(Value),
}

/// An assignable location, resolved before the value is written
struct Place {
    root: Root,
    steps: Vec<Step>,
}

enum Root {
    Local(String),
    This,
}

enum Step {
    Key(String),
    Index(i64),
}

impl<'p> Machine<'p> {
    fn step(&mut self) -> Result<()> {
        self.steps += 1;
        if self.steps > self.limits.max_steps {
            return Err(RuntimeError::LimitExceeded(format!(
                "more than {} steps",
                self.limits.max_steps
            )));
        }
        Ok(())
    }

    fn nest(&mut self) -> Result<()> {
        self.nesting += 1;
        if self.nesting > self.limits.max_nesting {
            return Err(RuntimeError::LimitExceeded(format!(
                "nesting deeper than {}",
                self.limits.max_nesting
            )));
        }
        Ok(())
    }

    // ── Calls ──────────────────────────────────────────

    fn invoke(
        &mut self,
        def: &'p FunctionDef,
        contract: Option<&'p Contract>,
        args: Vec<Value>,
    ) -> Result<Value> {
        self.check_arguments(def, &args)?;

        self.depth += 1;
        if self.depth > self.limits.max_call_depth {
            return Err(RuntimeError::LimitExceeded(format!(
                "call depth above {}",
                self.limits.max_call_depth
            )));
        }

        let mut locals = BTreeMap::new();
        let mut args = args.into_iter();
        for parameter in &def.parameters {
            locals.insert(parameter.name.clone(), args.next().unwrap_or(Value::Null));
        }
        let mut frame = Frame {
            contract,
            scopes: vec![locals],
        };

        let value = match self.exec_block(&mut frame, &def.body)? {
            Flow::Return(value) => value,
            Flow::Next => Value::Null,
            Flow::Break | Flow::Continue => {
                return Err(RuntimeError::TypeError(format!(
                    "`{}`: break or continue outside of a loop",
                    def.name
                )))
            }
        };
        self.depth -= 1;

        if let Some(ref ty) = def.return_type {
            let issues = schema::check_value(self.program, ty, &value.to_json(), "return value");
            if let Some(issue) = issues.first() {
                return Err(RuntimeError::TypeError(format!("`{}`: {}", def.name, issue)));
            }
        }

        Ok(value)
    }

    fn check_arguments(&self, def: &FunctionDef, args: &[Value]) -> Result<()> {
        let mismatch = |message: String| RuntimeError::ArityOrTypeMismatch {
            function: def.name.clone(),
            message,
        };

        let required = def.parameters.iter().filter(|p| p.required).count();
        if args.len() > def.parameters.len() || args.len() < required {
            return Err(mismatch(format!(
                "expected {} argument(s), found {}",
                if required == def.parameters.len() {
                    required.to_string()
                } else {
                    format!("{} to {}", required, def.parameters.len())
                },
                args.len()
            )));
        }

        for (parameter, arg) in def.parameters.iter().zip(args) {
            if !parameter.required && *arg == Value::Null {
                continue;
            }
            let issues =
                schema::check_value(self.program, &parameter.ty, &arg.to_json(), &parameter.name);
            if let Some(issue) = issues.first() {
                return Err(mismatch(issue.to_string()));
            }
        }

        Ok(())
    }

    /// Re-check every changed field against its declared type
    fn commit(&self, contract: &Contract, original: &serde_json::Value) -> Result<()> {
        let Value::Object(ref fields) = self.this else {
            return Err(RuntimeError::TypeError("`this` is no longer an object".into()));
        };

        for field in &contract.fields {
            let before = original.get(&field.name).unwrap_or(&serde_json::Value::Null);
            let after = fields.get(&field.name).unwrap_or(&Value::Null);
            if after.to_json() == *before {
                continue;
            }

            if *after == Value::Null {
                if field.required {
                    return Err(RuntimeError::TypeError(format!(
                        "required field `{}` cannot be null",
                        field.name
                    )));
                }
                continue;
            }

            let issues = schema::check_value(self.program, &field.ty, &after.to_json(), &field.name);
            if let Some(issue) = issues.first() {
                return Err(RuntimeError::TypeError(issue.to_string()));
            }
        }

        Ok(())
    }

    // ── Statements ─────────────────────────────────────

    fn exec_block(&mut self, frame: &mut Frame<'p>, body: &'p [Statement]) -> Result<Flow> {
        self.nest()?;
        frame.scopes.push(BTreeMap::new());
        for statement in body {
            let flow = self.exec(frame, statement)?;
            if !matches!(flow, Flow::Next) {
                frame.scopes.pop();
                self.nesting -= 1;
                return Ok(flow);
            }
        }
        frame.scopes.pop();
        self.nesting -= 1;
        Ok(Flow::Next)
    }

    fn exec(&mut self, frame: &mut Frame<'p>, statement: &'p Statement) -> Result<Flow> {
        self.step()?;

        match &statement.kind {
            StatementKind::Let { name, value } => {
                let value = self.eval(frame, value)?;
                frame.declare(name, value);
                Ok(Flow::Next)
            }
            StatementKind::Expression { expression } => {
                self.eval(frame, expression)?;
                Ok(Flow::Next)
            }
            StatementKind::If {
                condition,
                then_branch,
                else_branch,
            } => {
                if self.eval(frame, condition)?.as_bool("if condition")? {
                    self.exec_block(frame, then_branch)
                } else {
                    self.exec_block(frame, else_branch)
                }
            }
            StatementKind::While { condition, body } => {
                while self.eval(frame, condition)?.as_bool("while condition")? {
                    self.step()?;
                    match self.exec_block(frame, body)? {
                        Flow::Break => break,
                        Flow::Return(value) => return Ok(Flow::Return(value)),
                        Flow::Next | Flow::Continue => {}
                    }
                }
                Ok(Flow::Next)
            }
            StatementKind::For {
                init,
                condition,
                update,
                body,
            } => {
                frame.scopes.push(BTreeMap::new());
                let flow = self.exec_for(frame, init.as_deref(), condition.as_ref(), update.as_ref(), body);
                frame.scopes.pop();
                flow
            }
            StatementKind::ForOf {
                binding,
                iterable,
                body,
            } => {
                let items = match self.eval(frame, iterable)? {
                    Value::Array(items) => items,
                    Value::String(s) => s.chars().map(|c| Value::String(c.to_string())).collect(),
                    other => {
                        return Err(RuntimeError::TypeError(format!(
                            "cannot iterate over {}",
                            other.type_name()
                        )))
                    }
                };

                for item in items {
                    self.step()?;
                    frame.scopes.push(BTreeMap::from([(binding.clone(), item)]));
                    let flow = self.exec_block(frame, body);
                    frame.scopes.pop();
                    match flow? {
                        Flow::Break => break,
                        Flow::Return(value) => return Ok(Flow::Return(value)),
                        Flow::Next | Flow::Continue => {}
                    }
                }
                Ok(Flow::Next)
            }
            StatementKind::Break => Ok(Flow::Break),
            StatementKind::Continue => Ok(Flow::Continue),
            StatementKind::Return { value } => {
                let value = match value {
                    Some(expr) => self.eval(frame, expr)?,
                    None => Value::Null,
                };
                Ok(Flow::Return(value))
            }
            StatementKind::Throw { value } => {
                let value = self.eval(frame, value)?;
                Err(RuntimeError::Thrown(builtins::thrown_message(&value)))
            }
        }
    }

    fn exec_for(
        &mut self,
        frame: &mut Frame<'p>,
        init: Option<&'p Statement>,
        condition: Option<&'p Expression>,
        update: Option<&'p Expression>,
        body: &'p [Statement],
    ) -> Result<Flow> {
        if let Some(init) = init {
            self.exec(frame, init)?;
        }

        loop {
            self.step()?;
            if let Some(condition) = condition {
                if !self.eval(frame, condition)?.as_bool("for condition")? {
                    break;
                }
            }
            match self.exec_block(frame, body)? {
                Flow::Break => break,
                Flow::Return(value) => return Ok(Flow::Return(value)),
                Flow::Next | Flow::Continue => {}
            }
            if let Some(update) = update {
                self.eval(frame, update)?;
            }
        }

        Ok(Flow::Next)
    }

    // ── Expressions ────────────────────────────────────

    fn eval(&mut self, frame: &mut Frame<'p>, expr: &'p Expression) -> Result<Value> {
        self.nest()?;
        let value = self.eval_node(frame, expr)?;
        self.nesting -= 1;
        Ok(value)
    }

    fn eval_node(&mut self, frame: &mut Frame<'p>, expr: &'p Expression) -> Result<Value> {
        match expr {
            Expression::Literal { value } => Ok(Value::from(value)),
            Expression::Ident { name } => match frame.lookup(name) {
                Some(value) => Ok(value.clone()),
                None if name == "ctx" => Ok(self.ctx.clone()),
                None => Err(RuntimeError::UndefinedReference(name.clone())),
            },
            Expression::This => {
                if frame.contract.is_none() {
                    return Err(RuntimeError::UndefinedReference(
                        "`this` outside a contract".into(),
                    ));
                }
                Ok(self.this.clone())
            }
            Expression::Array { elements } => {
                let mut items = Vec::with_capacity(elements.len());
                for element in elements {
                    items.push(self.eval(frame, element)?);
                }
                Ok(Value::Array(items))
            }
            Expression::Object { entries } => {
                let mut map = BTreeMap::new();
                for entry in entries {
                    let value = self.eval(frame, &entry.value)?;
                    map.insert(entry.key.clone(), value);
                }
                Ok(Value::Object(map))
            }
            Expression::Member { object, property } => {
                if matches!(**object, Expression::This) {
                    return self.read_field(frame, property);
                }
                let object = self.eval(frame, object)?;
                builtins::property(&object, property)
            }
            Expression::Index { object, index } => {
                let object = self.eval(frame, object)?;
                let index = self.eval(frame, index)?;
                read_index(&object, &index)
            }
            Expression::Call { callee, arguments } => self.eval_call(frame, callee, arguments),
            Expression::Unary { op, operand } => {
                let operand = self.eval(frame, operand)?;
                match op {
                    UnaryOp::Not => Ok(Value::Boolean(!operand.as_bool("operand of `!`")?)),
                    UnaryOp::Negate => value::negate(&operand),
                }
            }
            Expression::Binary { op, left, right } => {
                let left = self.eval(frame, left)?;
                match (op, &left) {
                    (BinaryOp::And, Value::Boolean(false)) => return Ok(Value::Boolean(false)),
                    (BinaryOp::Or, Value::Boolean(true)) => return Ok(Value::Boolean(true)),
                    _ => {}
                }
                let right = self.eval(frame, right)?;
                value::binary(*op, &left, &right)
            }
            Expression::Assign { op, target, value } => {
                let place = self.resolve_place(frame, target)?;
                let rhs = self.eval(frame, value)?;
                let slot = self.place_mut(frame, &place)?;
                let result = match op.binary() {
                    Some(arithmetic) => value::binary(arithmetic, slot, &rhs)?,
                    None => rhs,
                };
                *slot = result.clone();
                Ok(result)
            }
        }
    }

    fn read_field(&self, frame: &Frame<'p>, name: &str) -> Result<Value> {
        let Some(contract) = frame.contract else {
            return Err(RuntimeError::UndefinedReference(
                "`this` outside a contract".into(),
            ));
        };
        if contract.field(name).is_none() {
            return Err(RuntimeError::UndefinedReference(format!("this.{}", name)));
        }
        match &self.this {
            Value::Object(map) => Ok(map.get(name).cloned().unwrap_or(Value::Null)),
            _ => Ok(Value::Null),
        }
    }

    fn eval_call(
        &mut self,
        frame: &mut Frame<'p>,
        callee: &'p Expression,
        arguments: &'p [Expression],
    ) -> Result<Value> {
        match callee {
            // helper(...) or error(...)
            Expression::Ident { name } => {
                let args = self.eval_args(frame, arguments)?;
                if let Some(def) = self.program.function(name) {
                    return self.invoke(def, None, args);
                }
                if name == "error" {
                    return builtins::error_value(&args);
                }
                Err(RuntimeError::UndefinedReference(format!("function `{}`", name)))
            }

            // this.sibling(...)
            Expression::Member { object, property }
                if matches!(**object, Expression::This)
                    && frame.contract.and_then(|c| c.function(property)).is_some() =>
            {
                let args = self.eval_args(frame, arguments)?;
                let contract = frame.contract;
                match contract.and_then(|c| c.function(property)) {
                    Some(def) => self.invoke(def, contract, args),
                    None => Err(RuntimeError::UndefinedReference(format!("this.{}", property))),
                }
            }

            // receiver.method(...)
            Expression::Member { object, property } => {
                if builtins::is_mutating(property) && object.is_place() {
                    let place = self.resolve_place(frame, object)?;
                    let args = self.eval_args(frame, arguments)?;
                    let receiver = self.place_mut(frame, &place)?;
                    builtins::call_method(receiver, property, args)
                } else {
                    let mut receiver = self.eval(frame, object)?;
                    let args = self.eval_args(frame, arguments)?;
                    builtins::call_method(&mut receiver, property, args)
                }
            }

            other => Err(RuntimeError::TypeError(format!(
                "`{}` is not callable",
                crate::normalizer::format_expression(other)
            ))),
        }
    }

    fn eval_args(&mut self, frame: &mut Frame<'p>, arguments: &'p [Expression]) -> Result<Vec<Value>> {
        let mut args = Vec::with_capacity(arguments.len());
        for argument in arguments {
            args.push(self.eval(frame, argument)?);
        }
        Ok(args)
    }

    // ── Places ─────────────────────────────────────────

    fn resolve_place(&mut self, frame: &mut Frame<'p>, expr: &'p Expression) -> Result<Place> {
        match expr {
            Expression::Ident { name } => {
                if frame.lookup(name).is_none() {
                    return Err(RuntimeError::UndefinedReference(name.clone()));
                }
                Ok(Place {
                    root: Root::Local(name.clone()),
                    steps: Vec::new(),
                })
            }
            Expression::Member { object, property } => {
                if matches!(**object, Expression::This) {
                    let declared = frame.contract.and_then(|c| c.field(property)).is_some();
                    if !declared {
                        return Err(RuntimeError::UndefinedReference(format!("this.{}", property)));
                    }
                    return Ok(Place {
                        root: Root::This,
                        steps: vec![Step::Key(property.clone())],
                    });
                }
                let mut place = self.resolve_place(frame, object)?;
                place.steps.push(Step::Key(property.clone()));
                Ok(place)
            }
            Expression::Index { object, index } => {
                let mut place = self.resolve_place(frame, object)?;
                let step = match self.eval(frame, index)? {
                    Value::Integer(i) => Step::Index(i),
                    Value::Unsigned(u) => Step::Key(u.to_string()),
                    Value::String(key) => Step::Key(key),
                    other => {
                        return Err(RuntimeError::TypeError(format!(
                            "cannot index with {}",
                            other.type_name()
                        )))
                    }
                };
                place.steps.push(step);
                Ok(place)
            }
            _ => Err(RuntimeError::TypeError("invalid assignment target".into())),
        }
    }

    fn place_mut<'a>(&'a mut self, frame: &'a mut Frame<'p>, place: &Place) -> Result<&'a mut Value> {
        let mut current = match &place.root {
            Root::Local(name) => frame
                .lookup_mut(name)
                .ok_or_else(|| RuntimeError::UndefinedReference(name.clone()))?,
            Root::This => &mut self.this,
        };
        for step in &place.steps {
            current = descend(current, step)?;
        }
        Ok(current)
    }
}

fn descend<'v>(value: &'v mut Value, step: &Step) -> Result<&'v mut Value> {
    match (value, step) {
        (Value::Object(map), Step::Key(key)) => Ok(map.entry(key.clone()).or_insert(Value::Null)),
        (Value::Object(map), Step::Index(i)) => {
            Ok(map.entry(i.to_string()).or_insert(Value::Null))
        }
        (Value::Array(items), Step::Index(i)) => {
            let len = items.len();
            usize::try_from(*i)
                .ok()
                .and_then(|index| items.get_mut(index))
                .ok_or(RuntimeError::IndexOutOfBounds { index: *i, len })
        }
        (other, Step::Key(key)) => Err(RuntimeError::TypeError(format!(
            "cannot set property `{}` on {}",
            key,
            other.type_name()
        ))),
        (other, Step::Index(_)) => Err(RuntimeError::TypeError(format!(
            "cannot index into {}",
            other.type_name()
        ))),
    }
}

fn read_index(object: &Value, index: &Value) -> Result<Value> {
    match (object, index) {
        (Value::Array(items), Value::Integer(i)) => usize::try_from(*i)
            .ok()
            .and_then(|index| items.get(index))
            .cloned()
            .ok_or(RuntimeError::IndexOutOfBounds {
                index: *i,
                len: items.len(),
            }),
        (Value::String(s), Value::Integer(i)) => {
            let len = s.chars().count();
            usize::try_from(*i)
                .ok()
                .and_then(|index| s.chars().nth(index))
                .map(|c| Value::String(c.to_string()))
                .ok_or(RuntimeError::IndexOutOfBounds { index: *i, len })
        }
        (Value::Object(map), Value::String(key)) => {
            Ok(map.get(key).cloned().unwrap_or(Value::Null))
        }
        (Value::Object(map), Value::Integer(_) | Value::Unsigned(_)) => {
            Ok(map.get(&index.to_string()).cloned().unwrap_or(Value::Null))
        }
        (object, index) => Err(RuntimeError::TypeError(format!(
            "cannot index {} with {}",
            object.type_name(),
            index.type_name()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse;
    use serde_json::json;

    const COUNTER: &str = r#"
        function clamp(x: number, lo: number, hi: number): number {
            if (x < lo) { return lo; }
            if (x > hi) { return hi; }
            return x;
        }

        collection Counter {
            id: string;
            count: i32;
            history?: number[];
            meta?: map<string, string>;

            constructor (id: string) {
                this.id = id;
                this.count = 0;
            }

            function noop() {}

            function increment(by: number): number {
                this.count += by;
                return this.count;
            }

            function bounded(by: number): number {
                this.count = clamp(this.count + by, 0, 10);
                return this.count;
            }

            function divide(): number {
                this.count = 5;
                return 1 / 0;
            }

            function sumTo(n: number): number {
                let total = 0;
                for (let i = 1; i <= n; i += 1) {
                    if (i == 3) { continue; }
                    if (i > 6) { break; }
                    total += i;
                }
                return total;
            }

            function firstOver(limit: number) {
                for (let h of this.history) {
                    if (h > limit) { return h; }
                }
                return null;
            }

            function record(value: number) {
                if (this.history == null) { this.history = []; }
                this.history.push(value);
                let copy = this.history;
                copy.push(999);
                return copy.length;
            }

            function countdown(): number {
                let n = 3;
                let steps = 0;
                while (true) {
                    n -= 1;
                    steps += 1;
                    if (n == 0) { break; }
                }
                return steps;
            }

            function forever() { while (true) {} }

            function recurse(): number { return this.recurse(); }

            function fail(reason: string) { throw error("failed: " + reason); }

            function writeUnknown() { this.missing = 1; }

            function readUnknown() { return this.missing; }

            function badType() { this.count = "lots"; }

            function whoami() { return ctx.publicKey; }

            function setMeta(key: string, value: string) {
                if (this.meta == null) { this.meta = {}; }
                this.meta[key] = value;
            }

            function outOfBounds() {
                let xs = [1, 2];
                xs[5] = 3;
            }

            function nonBoolean() { if (1) { return 1; } }

            function escape() { while (true) { break; } }
        }

        collection Ledger {
            id: string;
            big: u64;

            function noop() {}

            function bump() { this.big += 1; }
        }
    "#;

    fn program() -> Program {
        parse(COUNTER).unwrap()
    }

    fn instance() -> serde_json::Value {
        json!({ "id": "c1", "count": 2 })
    }

    fn call(function: &str, args: &[serde_json::Value]) -> Result<Outcome> {
        interpret(&program(), "Counter", function, args, &instance())
    }

    // ── Arity and types ────────────────────────────────

    #[test]
    fn test_zero_parameter_function() {
        assert!(call("noop", &[]).is_ok());
        let err = call("noop", &[json!(1)]).unwrap_err();
        assert!(matches!(err, RuntimeError::ArityOrTypeMismatch { ref function, .. } if function == "noop"));
    }

    #[test]
    fn test_argument_type_mismatch() {
        let err = call("increment", &[json!("one")]).unwrap_err();
        assert!(matches!(err, RuntimeError::ArityOrTypeMismatch { ref message, .. } if message.contains("by")));
    }

    // ── Execution ──────────────────────────────────────

    #[test]
    fn test_mutates_instance_copy() {
        let original = instance();
        let outcome = interpret(&program(), "Counter", "increment", &[json!(3)], &original).unwrap();
        assert_eq!(outcome.return_value, json!(5));
        assert_eq!(outcome.instance, json!({ "id": "c1", "count": 5 }));
        assert_eq!(original["count"], json!(2));
    }

    #[test]
    fn test_constructor_on_null_instance() {
        let outcome = interpret(&program(), "Counter", "constructor", &[json!("new")], &json!(null)).unwrap();
        assert_eq!(outcome.instance, json!({ "id": "new", "count": 0 }));
        assert_eq!(outcome.return_value, json!(null));
    }

    #[test]
    fn test_program_level_function() {
        let outcome = call("bounded", &[json!(100)]).unwrap();
        assert_eq!(outcome.return_value, json!(10));
    }

    #[test]
    fn test_loops_break_and_continue() {
        // 1 + 2 + 4 + 5 + 6
        assert_eq!(call("sumTo", &[json!(10)]).unwrap().return_value, json!(18));
        assert_eq!(call("countdown", &[]).unwrap().return_value, json!(3));
    }

    #[test]
    fn test_return_unwinds_from_for_of() {
        let program = program();
        let data = json!({ "id": "c1", "count": 0, "history": [1, 5, 9] });
        let outcome = interpret(&program, "Counter", "firstOver", &[json!(4)], &data).unwrap();
        assert_eq!(outcome.return_value, json!(5));
    }

    #[test]
    fn test_values_do_not_alias() {
        let outcome = call("record", &[json!(7)]).unwrap();
        assert_eq!(outcome.instance["history"], json!([7]));
        assert_eq!(outcome.return_value, json!(2));
    }

    #[test]
    fn test_map_assignment() {
        let outcome = call("setMeta", &[json!("color"), json!("red")]).unwrap();
        assert_eq!(outcome.instance["meta"], json!({ "color": "red" }));
    }

    #[test]
    fn test_ctx_public_key() {
        let program = program();
        let key: PublicKey = "11".repeat(32).parse().unwrap();
        let ctx = CallContext {
            public_key: Some(key),
        };
        let outcome = Interpreter::new(&program)
            .call("Counter", "whoami", &[], &instance(), &ctx)
            .unwrap();
        assert_eq!(outcome.return_value, json!("11".repeat(32)));
        assert_eq!(call("whoami", &[]).unwrap().return_value, json!(null));
    }

    // ── Runtime errors ─────────────────────────────────

    #[test]
    fn test_division_by_zero_returns_no_instance() {
        assert_eq!(call("divide", &[]), Err(RuntimeError::DivisionByZero));
    }

    #[test]
    fn test_undefined_references() {
        assert!(matches!(call("writeUnknown", &[]), Err(RuntimeError::UndefinedReference(_))));
        assert!(matches!(call("readUnknown", &[]), Err(RuntimeError::UndefinedReference(_))));
        assert!(matches!(call("nothing", &[]), Err(RuntimeError::UndefinedReference(_))));
    }

    #[test]
    fn test_commit_rechecks_field_types() {
        assert!(matches!(call("badType", &[]), Err(RuntimeError::TypeError(_))));
    }

    #[test]
    fn test_thrown_error_message() {
        assert_eq!(
            call("fail", &[json!("nope")]),
            Err(RuntimeError::Thrown("failed: nope".into()))
        );
    }

    #[test]
    fn test_index_out_of_bounds() {
        assert_eq!(
            call("outOfBounds", &[]),
            Err(RuntimeError::IndexOutOfBounds { index: 5, len: 2 })
        );
    }

    #[test]
    fn test_conditions_must_be_boolean() {
        assert!(matches!(call("nonBoolean", &[]), Err(RuntimeError::TypeError(_))));
    }

    #[test]
    fn test_break_escaping_function_is_error() {
        // Only reachable from a JSON AST; the parser rejects it
        let mut program = program();
        let counter = &mut program.contracts[0];
        let escape = counter.functions.iter_mut().find(|f| f.name == "escape").unwrap();
        let StatementKind::While { ref body, .. } = escape.body[0].kind else {
            panic!("expected while loop");
        };
        let inner = body.clone();
        escape.body = inner;

        let err = interpret(&program, "Counter", "escape", &[], &instance()).unwrap_err();
        assert!(matches!(err, RuntimeError::TypeError(ref m) if m.contains("outside of a loop")));
    }

    // ── Large integers ─────────────────────────────────

    #[test]
    fn test_u64_max_survives_untouched_field() {
        let data = json!({ "id": "l1", "big": u64::MAX });
        let outcome = interpret(&program(), "Ledger", "noop", &[], &data).unwrap();
        assert_eq!(outcome.instance, data);
    }

    #[test]
    fn test_integer_arithmetic_past_i64() {
        let data = json!({ "id": "l1", "big": i64::MAX });
        let outcome = interpret(&program(), "Ledger", "bump", &[], &data).unwrap();
        assert_eq!(outcome.instance["big"], json!(9223372036854775808u64));

        let data = json!({ "id": "l1", "big": u64::MAX });
        let err = interpret(&program(), "Ledger", "bump", &[], &data).unwrap_err();
        assert!(matches!(err, RuntimeError::TypeError(ref m) if m.contains("overflow")));
    }

    // ── Limits ─────────────────────────────────────────

    #[test]
    fn test_step_limit() {
        let program = program();
        let result = Interpreter::new(&program)
            .with_limits(Limits {
                max_steps: 1_000,
                ..Limits::default()
            })
            .call("Counter", "forever", &[], &instance(), &CallContext::default());
        assert!(matches!(result, Err(RuntimeError::LimitExceeded(_))));
    }

    #[test]
    fn test_call_depth_limit() {
        assert!(matches!(call("recurse", &[]), Err(RuntimeError::LimitExceeded(_))));
    }

    #[test]
    fn test_nesting_limit() {
        let source = format!(
            "function deep(): number {{ return {}1{}; }}",
            "(1 + ".repeat(20),
            ")".repeat(20)
        );
        let program = parse(&source).unwrap();
        let deep = &program.functions[0];

        let mut machine = Machine {
            program: &program,
            limits: Limits {
                max_nesting: 16,
                ..Limits::default()
            },
            steps: 0,
            depth: 0,
            nesting: 0,
            this: Value::Null,
            ctx: Value::Null,
        };
        let err = machine.invoke(deep, None, vec![]).unwrap_err();
        assert!(matches!(err, RuntimeError::LimitExceeded(ref m) if m.contains("nesting")));

        machine.limits = Limits::default();
        machine.nesting = 0;
        machine.depth = 0;
        assert_eq!(machine.invoke(deep, None, vec![]).unwrap(), Value::Integer(21));
        assert_eq!(machine.nesting, 0);
    }

    #[test]
    fn test_limits_deserialize_with_defaults() {
        let limits: Limits = serde_json::from_str(r#"{"max_steps": 10}"#).unwrap();
        assert_eq!(limits.max_steps, 10);
        assert_eq!(limits.max_call_depth, 64);
        assert_eq!(limits.max_nesting, 512);
    }

    // ── Determinism ────────────────────────────────────

    #[test]
    fn test_determinism_100_iterations() {
        let first = call("sumTo", &[json!(50)]).unwrap();
        for i in 0..100 {
            let result = call("sumTo", &[json!(50)]).unwrap();
            assert_eq!(first, result, "Non-determinism at iteration {}", i);
        }
    }
}
