//! Charter parser — tokenizer, AST types, and recursive descent parser
//!
//! Declarations and statements are parsed by recursive descent; expressions
//! use precedence climbing over the table in [`ast::BinaryOp::precedence`]:
//!
//! ```text
//! =  += -= *= /=        right, target must be a place
//! ||                    left
//! &&                    left
//! == !=                 non-associative
//! < <= > >=             non-associative
//! + -                   left
//! * / %                 left
//! **                    right
//! ! -  (prefix)
//! .name [index] (args)  postfix
//! ```
//!
//! Parsing is all-or-nothing: either a complete [`ast::Program`] or the
//! first [`ParseError`], positioned at the offending token.
//!
//! Besides the grammar, the parser enforces:
//! - blocks and expressions nest at most [`MAX_NESTING`] levels deep
//! - `break` and `continue` appear only inside a loop
//! - a `let` never redeclares a name already in scope, parameters included

pub mod ast;
pub mod tokenizer;

use std::collections::{BTreeMap, BTreeSet};

use ast::*;
use tokenizer::{Span, SpannedToken, Token, Tokenizer};

use crate::error::ParseError;

/// Parse Charter source text into a program AST
///
/// # Guarantees
/// - Deterministic: same input always produces same AST
/// - Pure: no I/O, no global state
///
/// # Errors
/// Returns `ParseError` with line:column of the offending token.
///
/// # Example
/// ```
/// let program = charter_core::parser::parse("contract Counter { count: number; }").unwrap();
/// assert_eq!(program.contracts[0].name, "Counter");
/// ```
pub fn parse(input: &str) -> Result<Program, ParseError> {
    let tokens = Tokenizer::new(input).tokenize()?;
    let program = Parser::new(tokens).parse_program()?;
    tracing::debug!(
        contracts = program.contracts.len(),
        functions = program.functions.len(),
        "parsed program"
    );
    Ok(program)
}

/// Parse a single expression (used by tests and tooling)
pub fn parse_expression(input: &str) -> Result<Expression, ParseError> {
    let tokens = Tokenizer::new(input).tokenize()?;
    let mut parser = Parser::new(tokens);
    let expr = parser.parse_expression()?;
    parser.expect(&Token::Eof, "end of input")?;
    Ok(expr)
}

/// Deepest nesting of blocks, and height of any expression or type tree
pub const MAX_NESTING: usize = 64;

struct Parser {
    tokens: Vec<SpannedToken>,
    position: usize,
    /// Open blocks, parentheses and prefix operators
    depth: usize,
    /// Height of the expression returned last
    height: usize,
    /// Loops enclosing the current statement
    loops: usize,
    /// Names bound in each open block of the current function
    scopes: Vec<BTreeSet<String>>,
}

impl Parser {
    fn new(tokens: Vec<SpannedToken>) -> Self {
        Parser {
            tokens,
            position: 0,
            depth: 0,
            height: 0,
            loops: 0,
            scopes: Vec::new(),
        }
    }

    // ── Token helpers ──────────────────────────────────────

    fn peek(&self) -> &Token {
        self.peek_at(0)
    }

    fn peek_at(&self, offset: usize) -> &Token {
        let index = (self.position + offset).min(self.tokens.len() - 1);
        &self.tokens[index].token
    }

    fn span(&self) -> Span {
        self.tokens[self.position.min(self.tokens.len() - 1)].span
    }

    fn advance(&mut self) -> SpannedToken {
        let token = self.tokens[self.position.min(self.tokens.len() - 1)].clone();
        if self.position < self.tokens.len() - 1 {
            self.position += 1;
        }
        token
    }

    fn check(&self, token: &Token) -> bool {
        std::mem::discriminant(self.peek()) == std::mem::discriminant(token)
    }

    fn eat(&mut self, token: &Token) -> bool {
        if self.check(token) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, token: &Token, what: &str) -> Result<Span, ParseError> {
        if self.check(token) {
            Ok(self.advance().span)
        } else {
            Err(self.unexpected(what))
        }
    }

    fn unexpected(&self, what: &str) -> ParseError {
        ParseError::at(
            &self.span(),
            format!("Unexpected {}, expected {}", self.peek(), what),
        )
    }

    /// A user-chosen name; reserved words are rejected here
    fn expect_name(&mut self, what: &str) -> Result<(String, Span), ParseError> {
        match self.peek().clone() {
            Token::Identifier(name) => {
                let span = self.advance().span;
                Ok((name, span))
            }
            token if token.is_reserved() => Err(ParseError::at(
                &self.span(),
                format!("Reserved word {} cannot be used as {}", token, what),
            )),
            _ => Err(self.unexpected(what)),
        }
    }

    fn is_contextual(&self, offset: usize, word: &str) -> bool {
        matches!(self.peek_at(offset), Token::Identifier(name) if name == word)
    }

    // ── Nesting ────────────────────────────────────────────

    fn enter(&mut self) -> Result<(), ParseError> {
        self.depth += 1;
        if self.depth > MAX_NESTING {
            return Err(ParseError::at(
                &self.span(),
                format!("Nested too deeply (more than {} levels)", MAX_NESTING),
            ));
        }
        Ok(())
    }

    fn leave(&mut self) {
        self.depth -= 1;
    }

    /// Record the height of a node built over children at most `height` tall
    fn grow(&mut self, height: usize) -> Result<usize, ParseError> {
        let height = height + 1;
        if height > MAX_NESTING {
            return Err(ParseError::at(
                &self.span(),
                format!("Nested too deeply (more than {} levels)", MAX_NESTING),
            ));
        }
        self.height = height;
        Ok(height)
    }

    /// Bind `name` in the innermost block, refusing to hide another binding
    fn bind(&mut self, name: &str, span: &Span) -> Result<(), ParseError> {
        if self.scopes.iter().any(|scope| scope.contains(name)) {
            return Err(ParseError::at(
                span,
                format!("`{}` is already declared in this scope", name),
            ));
        }
        if let Some(scope) = self.scopes.last_mut() {
            scope.insert(name.to_string());
        }
        Ok(())
    }

    fn loop_body(&mut self) -> Result<Vec<Statement>, ParseError> {
        self.loops += 1;
        let body = self.parse_block()?;
        self.loops -= 1;
        Ok(body)
    }

    // ── Declarations ───────────────────────────────────────

    fn parse_program(&mut self) -> Result<Program, ParseError> {
        let mut program = Program::default();
        let mut contract_names = BTreeSet::new();
        let mut function_names = BTreeSet::new();

        while !self.check(&Token::Eof) {
            let decorators = self.parse_decorators()?;
            match self.peek() {
                Token::Contract | Token::Collection => {
                    let contract = self.parse_contract(decorators)?;
                    if !contract_names.insert(contract.name.clone()) {
                        return Err(ParseError::at(
                            &contract.span,
                            format!("Duplicate contract `{}`", contract.name),
                        ));
                    }
                    program.contracts.push(contract);
                }
                Token::Function => {
                    let function = self.parse_function(decorators)?;
                    if !function_names.insert(function.name.clone()) {
                        return Err(ParseError::at(
                            &function.span,
                            format!("Duplicate function `{}`", function.name),
                        ));
                    }
                    program.functions.push(function);
                }
                _ => return Err(self.unexpected("`contract`, `collection` or `function`")),
            }
        }

        Ok(program)
    }

    fn parse_decorators(&mut self) -> Result<Vec<Decorator>, ParseError> {
        let mut decorators = Vec::new();

        while self.check(&Token::At) {
            let span = self.advance().span;
            let (name, _) = self.expect_name("decorator name")?;
            let mut arguments = Vec::new();

            if self.eat(&Token::LParen) && !self.eat(&Token::RParen) {
                loop {
                    arguments.push(self.parse_decorator_arg()?);
                    if self.eat(&Token::Comma) {
                        if self.check(&Token::RParen) {
                            return Err(self.unexpected("decorator argument"));
                        }
                        continue;
                    }
                    self.expect(&Token::RParen, "`,` or `)`")?;
                    break;
                }
            }

            decorators.push(Decorator {
                name,
                arguments,
                span,
            });
        }

        Ok(decorators)
    }

    fn parse_decorator_arg(&mut self) -> Result<DecoratorArg, ParseError> {
        let arg = match self.peek().clone() {
            Token::Identifier(name) => {
                self.advance();
                // Dotted field paths: `@call(profile.owner)`
                let mut path = name;
                while self.eat(&Token::Dot) {
                    let (segment, _) = self.expect_name("field name after `.`")?;
                    path.push('.');
                    path.push_str(&segment);
                }
                return Ok(DecoratorArg::Ident(path));
            }
            Token::StringLiteral(s) => DecoratorArg::String(s),
            Token::IntegerLiteral(i) => DecoratorArg::Integer(i),
            Token::FloatLiteral(v) => DecoratorArg::Float(v),
            Token::True => DecoratorArg::Boolean(true),
            Token::False => DecoratorArg::Boolean(false),
            Token::Minus => {
                self.advance();
                return match self.peek().clone() {
                    Token::IntegerLiteral(i) => {
                        self.advance();
                        Ok(DecoratorArg::Integer(-i))
                    }
                    Token::FloatLiteral(v) => {
                        self.advance();
                        Ok(DecoratorArg::Float(-v))
                    }
                    _ => Err(self.unexpected("number")),
                };
            }
            _ => return Err(self.unexpected("decorator argument (identifier or literal)")),
        };
        self.advance();
        Ok(arg)
    }

    fn parse_contract(&mut self, decorators: Vec<Decorator>) -> Result<Contract, ParseError> {
        let keyword_token = self.advance();
        let keyword = match keyword_token.token {
            Token::Collection => ContractKeyword::Collection,
            _ => ContractKeyword::Contract,
        };
        let (name, _) = self.expect_name("contract name")?;
        self.expect(&Token::LBrace, "`{`")?;

        let mut contract = Contract {
            name,
            keyword,
            decorators,
            fields: Vec::new(),
            functions: Vec::new(),
            span: keyword_token.span,
        };
        // member name -> "field" | "function"
        let mut declared: BTreeMap<String, &'static str> = BTreeMap::new();

        while !self.eat(&Token::RBrace) {
            let decorators = self.parse_decorators()?;

            let (name, span, kind) = if self.check(&Token::Function)
                || (self.is_contextual(0, "constructor") && self.peek_at(1) == &Token::LParen)
            {
                let function = self.parse_function(decorators)?;
                let entry = (function.name.clone(), function.span, "function");
                contract.functions.push(function);
                entry
            } else {
                let field = self.parse_field(decorators)?;
                let entry = (field.name.clone(), field.span, "field");
                contract.fields.push(field);
                entry
            };

            if let Some(previous) = declared.insert(name.clone(), kind) {
                let message = if previous == kind {
                    format!("Duplicate {} `{}` in contract `{}`", kind, name, contract.name)
                } else {
                    format!(
                        "`{}` is already declared as a {} in contract `{}`",
                        name, previous, contract.name
                    )
                };
                return Err(ParseError::at(&span, message));
            }
        }

        Ok(contract)
    }

    fn parse_field(&mut self, decorators: Vec<Decorator>) -> Result<Field, ParseError> {
        let (name, span) = self.expect_name("field name or `function`")?;
        let required = !self.eat(&Token::Question);
        self.expect(&Token::Colon, "`:`")?;
        let ty = self.parse_type()?;
        self.expect(&Token::Semicolon, "`;`")?;

        Ok(Field {
            name,
            ty,
            required,
            decorators,
            span,
        })
    }

    fn parse_function(&mut self, decorators: Vec<Decorator>) -> Result<FunctionDef, ParseError> {
        let (name, span) = if self.check(&Token::Function) {
            let span = self.advance().span;
            let (name, _) = self.expect_name("function name")?;
            (name, span)
        } else {
            // `constructor (...)` shorthand
            let span = self.advance().span;
            ("constructor".to_string(), span)
        };

        self.expect(&Token::LParen, "`(`")?;
        let parameters = self.parse_parameters()?;
        self.expect(&Token::RParen, "`,` or `)`")?;

        let return_type = if self.eat(&Token::Colon) {
            Some(self.parse_type()?)
        } else {
            None
        };

        // `ctx` is the implicit first parameter
        let mut names: BTreeSet<String> = parameters.iter().map(|p| p.name.clone()).collect();
        names.insert("ctx".to_string());
        self.scopes = vec![names];
        self.loops = 0;
        let body = self.parse_block()?;
        self.scopes.clear();

        Ok(FunctionDef {
            name,
            parameters,
            return_type,
            body,
            decorators,
            span,
        })
    }

    fn parse_parameters(&mut self) -> Result<Vec<Parameter>, ParseError> {
        let mut parameters: Vec<Parameter> = Vec::new();
        if self.check(&Token::RParen) {
            return Ok(parameters);
        }

        loop {
            let (name, span) = self.expect_name("parameter name")?;
            if parameters.iter().any(|p| p.name == name) {
                return Err(ParseError::at(
                    &span,
                    format!("Duplicate parameter `{}`", name),
                ));
            }
            let required = !self.eat(&Token::Question);
            self.expect(&Token::Colon, "`:`")?;
            let ty = self.parse_type()?;
            parameters.push(Parameter {
                name,
                ty,
                required,
                span,
            });

            if !self.eat(&Token::Comma) {
                return Ok(parameters);
            }
        }
    }

    // ── Types ──────────────────────────────────────────────

    fn parse_type(&mut self) -> Result<Type, ParseError> {
        self.enter()?;
        let ty = self.parse_type_rest()?;
        self.leave();
        Ok(ty)
    }

    fn parse_type_rest(&mut self) -> Result<Type, ParseError> {
        let mut height = 1;
        let mut ty = match self.peek().clone() {
            Token::Identifier(name) if name == "map" && self.peek_at(1) == &Token::Less => {
                self.advance();
                self.advance();
                let key = self.parse_type()?;
                let key_height = self.height;
                self.expect(&Token::Comma, "`,`")?;
                let value = self.parse_type()?;
                height = self.grow(key_height.max(self.height))?;
                self.expect(&Token::Greater, "`>`")?;
                Type::Map {
                    key: Box::new(key),
                    value: Box::new(value),
                }
            }
            Token::Identifier(name) => {
                self.advance();
                Type::from_name(&name).unwrap_or(Type::Reference { contract: name })
            }
            Token::LBrace => {
                self.advance();
                let mut fields: Vec<ObjectField> = Vec::new();
                let mut tallest = 0;
                while !self.eat(&Token::RBrace) {
                    let (name, span) = self.expect_name("field name")?;
                    if fields.iter().any(|f| f.name == name) {
                        return Err(ParseError::at(
                            &span,
                            format!("Duplicate field `{}` in object type", name),
                        ));
                    }
                    let required = !self.eat(&Token::Question);
                    self.expect(&Token::Colon, "`:`")?;
                    let ty = self.parse_type()?;
                    tallest = tallest.max(self.height);
                    self.expect(&Token::Semicolon, "`;`")?;
                    fields.push(ObjectField { name, ty, required });
                }
                height = self.grow(tallest)?;
                Type::Object { fields }
            }
            _ => return Err(self.unexpected("type")),
        };

        while self.check(&Token::LBracket) {
            self.advance();
            self.expect(&Token::RBracket, "`]`")?;
            height = self.grow(height)?;
            ty = Type::Array {
                element: Box::new(ty),
            };
        }

        self.height = height;
        Ok(ty)
    }

    // ── Statements ─────────────────────────────────────────

    fn parse_block(&mut self) -> Result<Vec<Statement>, ParseError> {
        self.expect(&Token::LBrace, "`{`")?;
        self.enter()?;
        self.scopes.push(BTreeSet::new());
        let mut statements = Vec::new();
        while !self.eat(&Token::RBrace) {
            statements.push(self.parse_statement()?);
        }
        self.scopes.pop();
        self.leave();
        Ok(statements)
    }

    fn parse_statement(&mut self) -> Result<Statement, ParseError> {
        let span = self.span();
        let kind = match self.peek() {
            Token::Let => {
                let kind = self.parse_let()?;
                self.expect(&Token::Semicolon, "`;`")?;
                kind
            }
            Token::If => self.parse_if()?,
            Token::While => {
                self.advance();
                self.expect(&Token::LParen, "`(`")?;
                let condition = self.parse_expression()?;
                self.expect(&Token::RParen, "`)`")?;
                let body = self.loop_body()?;
                StatementKind::While { condition, body }
            }
            Token::For => self.parse_for()?,
            Token::Break | Token::Continue => {
                let kind = if self.check(&Token::Break) {
                    StatementKind::Break
                } else {
                    StatementKind::Continue
                };
                if self.loops == 0 {
                    return Err(ParseError::at(
                        &span,
                        format!("{} outside of a loop", self.peek()),
                    ));
                }
                self.advance();
                self.expect(&Token::Semicolon, "`;`")?;
                kind
            }
            Token::Return => {
                self.advance();
                let value = if self.check(&Token::Semicolon) {
                    None
                } else {
                    Some(self.parse_expression()?)
                };
                self.expect(&Token::Semicolon, "`;`")?;
                StatementKind::Return { value }
            }
            Token::Throw => {
                self.advance();
                let value = self.parse_expression()?;
                self.expect(&Token::Semicolon, "`;`")?;
                StatementKind::Throw { value }
            }
            _ => {
                let expression = self.parse_expression()?;
                self.expect(&Token::Semicolon, "`;`")?;
                StatementKind::Expression { expression }
            }
        };

        Ok(Statement { kind, span })
    }

    /// `let name = value` without the trailing `;`
    fn parse_let(&mut self) -> Result<StatementKind, ParseError> {
        self.expect(&Token::Let, "`let`")?;
        let (name, span) = self.expect_name("variable name")?;
        self.expect(&Token::Assign, "`=`")?;
        let value = self.parse_expression()?;
        self.bind(&name, &span)?;
        Ok(StatementKind::Let { name, value })
    }

    fn parse_if(&mut self) -> Result<StatementKind, ParseError> {
        self.expect(&Token::If, "`if`")?;
        // `else if` chains nest without passing through a block
        self.enter()?;
        let kind = self.parse_if_rest()?;
        self.leave();
        Ok(kind)
    }

    fn parse_if_rest(&mut self) -> Result<StatementKind, ParseError> {
        self.expect(&Token::LParen, "`(`")?;
        let condition = self.parse_expression()?;
        self.expect(&Token::RParen, "`)`")?;
        let then_branch = self.parse_block()?;

        let else_branch = if self.eat(&Token::Else) {
            if self.check(&Token::If) {
                let span = self.span();
                vec![Statement {
                    kind: self.parse_if()?,
                    span,
                }]
            } else {
                self.parse_block()?
            }
        } else {
            Vec::new()
        };

        Ok(StatementKind::If {
            condition,
            then_branch,
            else_branch,
        })
    }

    /// The loop header gets its own scope around the body's
    fn parse_for(&mut self) -> Result<StatementKind, ParseError> {
        self.expect(&Token::For, "`for`")?;
        self.expect(&Token::LParen, "`(`")?;
        self.scopes.push(BTreeSet::new());
        let kind = self.parse_for_rest()?;
        self.scopes.pop();
        Ok(kind)
    }

    fn parse_for_rest(&mut self) -> Result<StatementKind, ParseError> {
        // for (let x of items) { ... }
        if self.check(&Token::Let) && self.is_contextual(2, "of") {
            self.advance();
            let (binding, span) = self.expect_name("variable name")?;
            self.advance();
            let iterable = self.parse_expression()?;
            self.bind(&binding, &span)?;
            self.expect(&Token::RParen, "`)`")?;
            let body = self.loop_body()?;
            return Ok(StatementKind::ForOf {
                binding,
                iterable,
                body,
            });
        }

        let init = if self.check(&Token::Semicolon) {
            None
        } else {
            let span = self.span();
            let kind = if self.check(&Token::Let) {
                self.parse_let()?
            } else {
                StatementKind::Expression {
                    expression: self.parse_expression()?,
                }
            };
            Some(Box::new(Statement { kind, span }))
        };
        self.expect(&Token::Semicolon, "`;`")?;

        let condition = if self.check(&Token::Semicolon) {
            None
        } else {
            Some(self.parse_expression()?)
        };
        self.expect(&Token::Semicolon, "`;`")?;

        let update = if self.check(&Token::RParen) {
            None
        } else {
            Some(self.parse_expression()?)
        };
        self.expect(&Token::RParen, "`)`")?;

        let body = self.loop_body()?;

        Ok(StatementKind::For {
            init,
            condition,
            update,
            body,
        })
    }

    // ── Expressions ────────────────────────────────────────

    fn parse_expression(&mut self) -> Result<Expression, ParseError> {
        self.enter()?;
        let expr = self.parse_assignment()?;
        self.leave();
        Ok(expr)
    }

    fn parse_assignment(&mut self) -> Result<Expression, ParseError> {
        let target = self.parse_binary(2)?;
        let target_height = self.height;

        let op = match self.peek() {
            Token::Assign => AssignOp::Assign,
            Token::PlusAssign => AssignOp::Add,
            Token::MinusAssign => AssignOp::Subtract,
            Token::StarAssign => AssignOp::Multiply,
            Token::SlashAssign => AssignOp::Divide,
            _ => return Ok(target),
        };

        if !target.is_place() {
            return Err(ParseError::at(
                &self.span(),
                format!("Invalid assignment target before {}", self.peek()),
            ));
        }
        self.advance();
        let value = self.parse_expression()?;
        self.grow(target_height.max(self.height))?;

        Ok(Expression::Assign {
            op,
            target: Box::new(target),
            value: Box::new(value),
        })
    }

    fn binary_op(token: &Token) -> Option<BinaryOp> {
        Some(match token {
            Token::OrOr => BinaryOp::Or,
            Token::AndAnd => BinaryOp::And,
            Token::EqualEqual => BinaryOp::Equal,
            Token::BangEqual => BinaryOp::NotEqual,
            Token::Less => BinaryOp::Less,
            Token::LessEqual => BinaryOp::LessEqual,
            Token::Greater => BinaryOp::Greater,
            Token::GreaterEqual => BinaryOp::GreaterEqual,
            Token::Plus => BinaryOp::Add,
            Token::Minus => BinaryOp::Subtract,
            Token::Star => BinaryOp::Multiply,
            Token::Slash => BinaryOp::Divide,
            Token::Percent => BinaryOp::Modulo,
            Token::StarStar => BinaryOp::Power,
            _ => return None,
        })
    }

    /// Precedence climbing over binary operators binding at least `min_prec`
    fn parse_binary(&mut self, min_prec: u8) -> Result<Expression, ParseError> {
        let mut left = self.parse_unary()?;
        let mut height = self.height;

        loop {
            let op = match Self::binary_op(self.peek()) {
                Some(op) if op.precedence() >= min_prec => op,
                _ => break,
            };
            self.advance();

            let next_min = match op.associativity() {
                Associativity::Right => op.precedence(),
                Associativity::Left | Associativity::None => op.precedence() + 1,
            };
            self.enter()?;
            let right = self.parse_binary(next_min)?;
            self.leave();
            height = self.grow(height.max(self.height))?;
            left = Expression::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };

            if op.associativity() == Associativity::None {
                if let Some(next) = Self::binary_op(self.peek()) {
                    if next.precedence() == op.precedence() {
                        return Err(ParseError::at(
                            &self.span(),
                            format!(
                                "Comparison operators cannot be chained: {} after {}; add parentheses",
                                next.symbol(),
                                op.symbol()
                            ),
                        ));
                    }
                }
            }
        }

        self.height = height;
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expression, ParseError> {
        let op = match self.peek() {
            Token::Bang => UnaryOp::Not,
            Token::Minus => UnaryOp::Negate,
            _ => return self.parse_postfix(),
        };
        self.advance();
        self.enter()?;
        let operand = self.parse_unary()?;
        self.leave();
        self.grow(self.height)?;
        Ok(Expression::Unary {
            op,
            operand: Box::new(operand),
        })
    }

    fn parse_postfix(&mut self) -> Result<Expression, ParseError> {
        let mut expr = self.parse_primary()?;
        let mut height = self.height;

        loop {
            match self.peek() {
                Token::Dot => {
                    self.advance();
                    let (property, _) = self.expect_name("property name")?;
                    height = self.grow(height)?;
                    expr = Expression::Member {
                        object: Box::new(expr),
                        property,
                    };
                }
                Token::LBracket => {
                    self.advance();
                    let index = self.parse_expression()?;
                    self.expect(&Token::RBracket, "`]`")?;
                    height = self.grow(height.max(self.height))?;
                    expr = Expression::Index {
                        object: Box::new(expr),
                        index: Box::new(index),
                    };
                }
                Token::LParen => {
                    self.advance();
                    let (arguments, tallest) = self.parse_list(&Token::RParen)?;
                    height = self.grow(height.max(tallest))?;
                    expr = Expression::Call {
                        callee: Box::new(expr),
                        arguments,
                    };
                }
                _ => {
                    self.height = height;
                    return Ok(expr);
                }
            }
        }
    }

    /// Comma-separated expressions up to and including `close`, with the
    /// height of the tallest
    fn parse_list(&mut self, close: &Token) -> Result<(Vec<Expression>, usize), ParseError> {
        let mut items = Vec::new();
        let mut tallest = 0;
        if self.eat(close) {
            return Ok((items, tallest));
        }
        loop {
            items.push(self.parse_expression()?);
            tallest = tallest.max(self.height);
            if self.eat(&Token::Comma) {
                continue;
            }
            let what = format!("`,` or {}", close);
            self.expect(close, &what)?;
            return Ok((items, tallest));
        }
    }

    fn parse_primary(&mut self) -> Result<Expression, ParseError> {
        let literal = |value| Expression::Literal { value };
        self.height = 1;

        let expr = match self.peek().clone() {
            Token::IntegerLiteral(i) => literal(Literal::Integer(i)),
            Token::FloatLiteral(v) => literal(Literal::Float(v)),
            Token::StringLiteral(s) => literal(Literal::String(s)),
            Token::True => literal(Literal::Boolean(true)),
            Token::False => literal(Literal::Boolean(false)),
            Token::Null => literal(Literal::Null),
            Token::This => Expression::This,
            Token::Identifier(name) => Expression::Ident { name },
            Token::LParen => {
                self.advance();
                let inner = self.parse_expression()?;
                self.expect(&Token::RParen, "`)`")?;
                return Ok(inner);
            }
            Token::LBracket => {
                self.advance();
                let (elements, tallest) = self.parse_list(&Token::RBracket)?;
                self.grow(tallest)?;
                return Ok(Expression::Array { elements });
            }
            Token::LBrace => {
                self.advance();
                return self.parse_object_literal();
            }
            _ => return Err(self.unexpected("expression")),
        };

        self.advance();
        Ok(expr)
    }

    /// Called after the opening `{`
    fn parse_object_literal(&mut self) -> Result<Expression, ParseError> {
        let mut entries: Vec<ObjectEntry> = Vec::new();
        let mut tallest = 0;
        if self.eat(&Token::RBrace) {
            return Ok(Expression::Object { entries });
        }

        loop {
            let span = self.span();
            let key = match self.peek().clone() {
                Token::Identifier(name) => name,
                Token::StringLiteral(s) => s,
                _ => return Err(self.unexpected("object key")),
            };
            self.advance();
            if entries.iter().any(|e| e.key == key) {
                return Err(ParseError::at(
                    &span,
                    format!("Duplicate key `{}` in object literal", key),
                ));
            }
            self.expect(&Token::Colon, "`:`")?;
            let value = self.parse_expression()?;
            tallest = tallest.max(self.height);
            entries.push(ObjectEntry { key, value });

            if self.eat(&Token::Comma) {
                continue;
            }
            self.expect(&Token::RBrace, "`,` or `}`")?;
            self.grow(tallest)?;
            return Ok(Expression::Object { entries });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn int(i: i64) -> Expression {
        Expression::Literal {
            value: Literal::Integer(i),
        }
    }

    fn ident(name: &str) -> Expression {
        Expression::Ident { name: name.into() }
    }

    fn binary(op: BinaryOp, left: Expression, right: Expression) -> Expression {
        Expression::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    const ACCOUNT: &str = r#"
        @public
        collection Account {
            @read
            id: string;
            name?: string;
            @call(owner)
            balance: number;
            @delegate
            owner: PublicKey;
            tags: string[];
            limits: map<string, u32>;
            profile?: { bio: string; age?: i32; };
            parent?: Account;

            constructor (id: string) {
                this.id = id;
                this.balance = 0;
            }

            @call(owner)
            function deposit(amount: number): number {
                this.balance += amount;
                return this.balance;
            }
        }
    "#;

    // ── Declarations ───────────────────────────────────

    #[test]
    fn test_parse_contract_structure() {
        let program = parse(ACCOUNT).unwrap();
        assert_eq!(program.contracts.len(), 1);
        let account = &program.contracts[0];

        assert_eq!(account.name, "Account");
        assert_eq!(account.keyword, ContractKeyword::Collection);
        assert_eq!(account.decorators[0].kind(), DecoratorKind::Public);
        assert_eq!(account.fields.len(), 8);
        assert_eq!(account.functions.len(), 2);

        let name = account.field("name").unwrap();
        assert!(!name.required);

        let balance = account.field("balance").unwrap();
        assert_eq!(balance.ty, Type::Number);
        assert_eq!(
            balance.decorators[0].kind(),
            DecoratorKind::Call(vec!["owner".into()])
        );

        assert_eq!(
            account.field("tags").unwrap().ty,
            Type::Array {
                element: Box::new(Type::String)
            }
        );
        assert_eq!(
            account.field("limits").unwrap().ty,
            Type::Map {
                key: Box::new(Type::String),
                value: Box::new(Type::U32)
            }
        );
        assert_eq!(
            account.field("parent").unwrap().ty,
            Type::Reference {
                contract: "Account".into()
            }
        );
        assert!(matches!(
            account.field("profile").unwrap().ty,
            Type::Object { ref fields } if fields.len() == 2 && !fields[1].required
        ));
    }

    #[test]
    fn test_parse_functions_and_constructor() {
        let program = parse(ACCOUNT).unwrap();
        let account = &program.contracts[0];

        let constructor = account.function("constructor").unwrap();
        assert_eq!(constructor.parameters.len(), 1);
        assert_eq!(constructor.body.len(), 2);

        let deposit = account.function("deposit").unwrap();
        assert_eq!(deposit.return_type, Some(Type::Number));
        assert_eq!(deposit.decorators[0].name, "call");
        assert!(matches!(
            deposit.body[0].kind,
            StatementKind::Expression {
                expression: Expression::Assign { op: AssignOp::Add, .. }
            }
        ));
    }

    #[test]
    fn test_parse_top_level_function() {
        let program = parse("function double(x: number): number { return x * 2; }").unwrap();
        assert!(program.contracts.is_empty());
        assert_eq!(program.functions[0].name, "double");
    }

    #[test]
    fn test_unknown_decorator_is_accepted() {
        let program = parse("contract A { @audited(\"q3\", 2) x: string; }").unwrap();
        let field = &program.contracts[0].fields[0];
        assert_eq!(field.decorators[0].kind(), DecoratorKind::Unknown("audited".into()));
        assert_eq!(
            field.decorators[0].arguments,
            vec![DecoratorArg::String("q3".into()), DecoratorArg::Integer(2)]
        );
    }

    #[test]
    fn test_decorator_dotted_path() {
        let program = parse("contract A { @call(profile.owner, admins) x: string; }").unwrap();
        let field = &program.contracts[0].fields[0];
        assert_eq!(
            field.decorators[0].kind(),
            DecoratorKind::Call(vec!["profile.owner".into(), "admins".into()])
        );
        assert!(parse("contract A { @call(profile.) x: string; }").is_err());
    }

    // ── Statements ─────────────────────────────────────

    #[test]
    fn test_parse_control_flow() {
        let src = r#"
            function f(items: number[]): number {
                let total = 0;
                for (let i = 0; i < 10; i += 1) {
                    if (i == 3) { continue; } else if (i == 8) { break; } else { total += i; }
                }
                for (let item of items) { total = total + item; }
                while (total > 100) { total -= 100; }
                return total;
            }
        "#;
        let program = parse(src).unwrap();
        let body = &program.functions[0].body;
        assert_eq!(body.len(), 5);
        assert!(matches!(body[1].kind, StatementKind::For { .. }));
        assert!(matches!(body[2].kind, StatementKind::ForOf { ref binding, .. } if binding == "item"));
        assert!(matches!(body[3].kind, StatementKind::While { .. }));
        assert!(matches!(body[4].kind, StatementKind::Return { value: Some(_) }));

        if let StatementKind::For { body: ref loop_body, .. } = body[1].kind {
            if let StatementKind::If { ref else_branch, .. } = loop_body[0].kind {
                assert!(matches!(else_branch[0].kind, StatementKind::If { .. }));
            } else {
                panic!("expected if");
            }
        }
    }

    #[test]
    fn test_statement_spans() {
        let program = parse("function f() {\n    let x = 1;\n    return x;\n}").unwrap();
        let body = &program.functions[0].body;
        assert_eq!((body[0].span.line, body[0].span.column), (2, 5));
        assert_eq!((body[1].span.line, body[1].span.column), (3, 5));
    }

    // ── Expressions ────────────────────────────────────

    #[test]
    fn test_multiplication_binds_tighter_than_addition() {
        let expr = parse_expression("1 + 2 * 3").unwrap();
        assert_eq!(
            expr,
            binary(BinaryOp::Add, int(1), binary(BinaryOp::Multiply, int(2), int(3)))
        );
    }

    #[test]
    fn test_subtraction_is_left_associative() {
        let expr = parse_expression("a - b - c").unwrap();
        assert_eq!(
            expr,
            binary(
                BinaryOp::Subtract,
                binary(BinaryOp::Subtract, ident("a"), ident("b")),
                ident("c")
            )
        );
    }

    #[test]
    fn test_power_is_right_associative() {
        let expr = parse_expression("2 ** 3 ** 2").unwrap();
        assert_eq!(
            expr,
            binary(BinaryOp::Power, int(2), binary(BinaryOp::Power, int(3), int(2)))
        );
    }

    #[test]
    fn test_logical_operators_bind_loosest() {
        let expr = parse_expression("a < 1 || b && c == d").unwrap();
        assert_eq!(
            expr,
            binary(
                BinaryOp::Or,
                binary(BinaryOp::Less, ident("a"), int(1)),
                binary(
                    BinaryOp::And,
                    ident("b"),
                    binary(BinaryOp::Equal, ident("c"), ident("d"))
                )
            )
        );
    }

    #[test]
    fn test_comparisons_are_non_associative() {
        let err = parse_expression("a < b < c").unwrap_err();
        assert!(err.message.contains("cannot be chained"));
        assert_eq!(err.column, 7);

        let err = parse_expression("a == b != c").unwrap_err();
        assert!(err.message.contains("cannot be chained"));

        // Different levels are fine
        assert!(parse_expression("a < b == c").is_ok());
    }

    #[test]
    fn test_unary_and_postfix() {
        let expr = parse_expression("!this.tags.includes(x)").unwrap();
        let Expression::Unary { op, operand } = expr else {
            panic!("expected unary");
        };
        assert_eq!(op, UnaryOp::Not);
        assert!(matches!(*operand, Expression::Call { ref arguments, .. } if arguments.len() == 1));
    }

    #[test]
    fn test_assignment_is_right_associative() {
        let expr = parse_expression("a = b = 1").unwrap();
        let Expression::Assign { value, .. } = expr else {
            panic!("expected assignment");
        };
        assert!(matches!(*value, Expression::Assign { .. }));
    }

    #[test]
    fn test_invalid_assignment_target() {
        let err = parse_expression("1 + 2 = 3").unwrap_err();
        assert!(err.message.contains("Invalid assignment target"));
        assert_eq!(err.column, 7);
    }

    #[test]
    fn test_array_and_object_literals() {
        let expr = parse_expression("[1, { a: 2, \"b c\": [] }]").unwrap();
        let Expression::Array { elements } = expr else {
            panic!("expected array");
        };
        assert_eq!(elements.len(), 2);
        assert!(matches!(elements[1], Expression::Object { ref entries } if entries[1].key == "b c"));
    }

    // ── Errors ─────────────────────────────────────────

    #[test]
    fn test_error_points_at_offending_token() {
        let err = parse("function f( { }").unwrap_err();
        assert_eq!((err.line, err.column), (1, 12));
        assert!(err.message.contains("`{`"), "{}", err.message);
    }

    #[test]
    fn test_error_on_second_line() {
        let err = parse("contract A {\n  x string;\n}").unwrap_err();
        assert_eq!((err.line, err.column), (2, 5));
    }

    #[test]
    fn test_unbalanced_braces() {
        let err = parse("contract A { x: string;").unwrap_err();
        assert!(err.message.contains("end of input"));
    }

    #[test]
    fn test_unterminated_literal() {
        let err = parse("function f() { return \"abc; }").unwrap_err();
        assert!(err.message.contains("Unterminated string"));
        assert_eq!(err.column, 23);
    }

    #[test]
    fn test_duplicate_field() {
        let err = parse("contract A {\n  x: string;\n  x: number;\n}").unwrap_err();
        assert!(err.message.contains("Duplicate field `x`"));
        assert_eq!((err.line, err.column), (3, 3));
    }

    #[test]
    fn test_field_function_name_clash() {
        let err = parse("contract A { x: string; function x() {} }").unwrap_err();
        assert!(err.message.contains("already declared as a field"));
    }

    #[test]
    fn test_duplicate_function_and_contract() {
        assert!(parse("contract A { function f() {} function f() {} }")
            .unwrap_err()
            .message
            .contains("Duplicate function `f`"));
        assert!(parse("contract A {} contract A {}")
            .unwrap_err()
            .message
            .contains("Duplicate contract `A`"));
        assert!(parse("function f(a: number, a: number) {}")
            .unwrap_err()
            .message
            .contains("Duplicate parameter `a`"));
    }

    #[test]
    fn test_reserved_word_misuse() {
        let err = parse("contract A { return: string; }").unwrap_err();
        assert!(err.message.contains("Reserved word `return`"));
        let err = parse("function f() { let this = 1; }").unwrap_err();
        assert!(err.message.contains("Reserved word `this`"));
    }

    #[test]
    fn test_malformed_decorator_arguments() {
        let err = parse("contract A { @call(owner, ) x: string; }").unwrap_err();
        assert!(err.message.contains("decorator argument"));

        let err = parse("contract A { @call(owner x: string; }").unwrap_err();
        assert!(err.message.contains("`,` or `)`"));

        let err = parse("contract A { @call(1 + 2) x: string; }").unwrap_err();
        assert!(err.message.contains("`,` or `)`"));

        let err = parse("contract A { @call([owner]) x: string; }").unwrap_err();
        assert!(err.message.contains("decorator argument"));
    }

    // ── Scoping and loops ──────────────────────────────

    #[test]
    fn test_break_outside_loop() {
        let err = parse("contract A { x: number; function f(): number {\n  break;\n  return 5; } }").unwrap_err();
        assert_eq!((err.line, err.column), (2, 3));
        assert!(err.message.contains("`break` outside of a loop"), "{}", err.message);

        let err = parse("function f() { if (true) { continue; } }").unwrap_err();
        assert!(err.message.contains("`continue` outside of a loop"));

        assert!(parse("function f() { while (true) { if (true) { break; } } }").is_ok());
        assert!(parse("function f(xs: number[]) { for (let x of xs) { continue; } }").is_ok());
    }

    #[test]
    fn test_let_cannot_redeclare() {
        let err = parse("function f() { let b = 2; let b = 3; }").unwrap_err();
        assert!(err.message.contains("`b` is already declared"), "{}", err.message);
        assert_eq!(err.column, 31);

        let err = parse("function f(a: number) { let a = 1; }").unwrap_err();
        assert!(err.message.contains("`a` is already declared"));

        let err = parse("function f() { let ctx = 1; }").unwrap_err();
        assert!(err.message.contains("`ctx`"));

        let err = parse("function f(x: number) { if (true) { let x = 2; } }").unwrap_err();
        assert!(err.message.contains("`x`"));

        let err = parse("function f(xs: number[]) { for (let i = 0; i < 1; i += 1) { let i = 2; } }").unwrap_err();
        assert!(err.message.contains("`i`"));

        let err = parse("function f(xs: number[]) { for (let xs of xs) {} }").unwrap_err();
        assert!(err.message.contains("`xs`"));
    }

    #[test]
    fn test_sibling_blocks_may_reuse_names() {
        let src = r#"
            function f(flag: boolean): number {
                if (flag) { let n = 1; return n; } else { let n = 2; return n; }
            }
            function g(xs: number[]) {
                for (let i = 0; i < 2; i += 1) {}
                for (let i = 0; i < 2; i += 1) {}
                for (let x of xs) {}
                let x = 1;
            }
        "#;
        assert!(parse(src).is_ok());
    }

    // ── Nesting limits ─────────────────────────────────

    fn in_function(expr: &str) -> String {
        format!("function f(a: number): number {{ return {}; }}", expr)
    }

    #[test]
    fn test_deep_parentheses_are_an_error() {
        let deep = format!("{}1{}", "(".repeat(50_000), ")".repeat(50_000));
        let err = parse(&in_function(&deep)).unwrap_err();
        assert!(err.message.contains("Nested too deeply"), "{}", err.message);

        let shallow = format!("{}1{}", "(".repeat(40), ")".repeat(40));
        assert!(parse(&in_function(&shallow)).is_ok());
    }

    #[test]
    fn test_long_operator_chains_are_bounded() {
        let long = vec!["a"; 5_000].join(" + ");
        assert!(parse(&in_function(&long)).unwrap_err().message.contains("Nested too deeply"));

        let short = vec!["a"; 50].join(" + ");
        assert!(parse(&in_function(&short)).is_ok());

        let powers = vec!["a"; 10_000].join(" ** ");
        assert!(parse(&in_function(&powers)).is_err());

        let negations = format!("{}a", "-".repeat(10_000));
        assert!(parse(&in_function(&negations)).is_err());

        let members = format!("a{}", ".b".repeat(10_000));
        assert!(parse(&in_function(&members)).is_err());

        let calls = format!("a{}", "()".repeat(10_000));
        assert!(parse(&in_function(&calls)).is_err());
    }

    #[test]
    fn test_deep_blocks_and_types_are_bounded() {
        let blocks = format!(
            "function f() {{ {} }}",
            "if (true) {".repeat(10_000) + &"}".repeat(10_000)
        );
        assert!(parse(&blocks).unwrap_err().message.contains("Nested too deeply"));

        let else_ifs = format!(
            "function f(a: number) {{ if (a == 0) {{}}{} }}",
            " else if (a == 1) {}".repeat(10_000)
        );
        assert!(parse(&else_ifs).is_err());

        let arrays = format!("contract A {{ x: string{}; }}", "[]".repeat(10_000));
        assert!(parse(&arrays).unwrap_err().message.contains("Nested too deeply"));

        let maps = format!(
            "contract A {{ x: {}string{}; }}",
            "map<string, ".repeat(10_000),
            ">".repeat(10_000)
        );
        assert!(parse(&maps).is_err());

        assert!(parse("contract A { x: map<string, number[][]>[]; }").is_ok());
    }

    // ── Determinism proof ──────────────────────────────

    #[test]
    fn test_parse_determinism_100_iterations() {
        let first = parse(ACCOUNT).unwrap();
        for i in 0..100 {
            let result = parse(ACCOUNT).unwrap();
            assert_eq!(first, result, "Determinism failure at iteration {}", i);
        }
    }
}
