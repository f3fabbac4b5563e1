//! Charter AST types — the tree every later stage reads
//!
//! The tree is produced once by the parser and never mutated afterwards.
//! Every node owns its children; there are no back references.
//!
//! All types derive `Serialize`/`Deserialize` so the tree can cross the
//! host boundary as JSON. Statements and expressions are tagged by
//! `"kind"`; contracts, fields, functions, parameters, decorators and
//! statements carry their source `"span"`.

use serde::{Deserialize, Serialize};

use super::tokenizer::Span;

// ── Root ──────────────────────────────────────────────────

/// A parsed source file: contracts plus free-standing helper functions
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Program {
    pub contracts: Vec<Contract>,
    pub functions: Vec<FunctionDef>,
}

impl Program {
    pub fn contract(&self, name: &str) -> Option<&Contract> {
        self.contracts.iter().find(|c| c.name == name)
    }

    pub fn function(&self, name: &str) -> Option<&FunctionDef> {
        self.functions.iter().find(|f| f.name == name)
    }

    /// Look up a contract by name, or take the only one when no name is given
    pub fn resolve_contract(&self, name: Option<&str>) -> Option<&Contract> {
        match name {
            Some(name) => self.contract(name),
            None if self.contracts.len() == 1 => self.contracts.first(),
            None => None,
        }
    }
}

/// An AST fragment as accepted at the host boundary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum Node {
    Program(Program),
    Contract(Contract),
    FunctionDef(FunctionDef),
}

// ── Contracts ─────────────────────────────────────────────

/// Which keyword introduced a contract; kept so formatting round-trips
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContractKeyword {
    #[default]
    Contract,
    Collection,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contract {
    pub name: String,
    #[serde(default)]
    pub keyword: ContractKeyword,
    pub decorators: Vec<Decorator>,
    pub fields: Vec<Field>,
    pub functions: Vec<FunctionDef>,
    #[serde(default)]
    pub span: Span,
}

impl Contract {
    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn function(&self, name: &str) -> Option<&FunctionDef> {
        self.functions.iter().find(|f| f.name == name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: Type,
    pub required: bool,
    pub decorators: Vec<Decorator>,
    #[serde(default)]
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionDef {
    pub name: String,
    pub parameters: Vec<Parameter>,
    #[serde(rename = "returnType")]
    pub return_type: Option<Type>,
    pub body: Vec<Statement>,
    pub decorators: Vec<Decorator>,
    #[serde(default)]
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Parameter {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: Type,
    pub required: bool,
    #[serde(default)]
    pub span: Span,
}

// ── Decorators ────────────────────────────────────────────

/// `@name(arg, ...)` as written in the source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decorator {
    pub name: String,
    pub arguments: Vec<DecoratorArg>,
    #[serde(default)]
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value")]
pub enum DecoratorArg {
    Ident(String),
    String(String),
    Integer(i64),
    Float(f64),
    Boolean(bool),
}

impl std::fmt::Display for DecoratorArg {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            DecoratorArg::Ident(name) => write!(f, "{}", name),
            DecoratorArg::String(s) => write!(f, "{}", quote(s)),
            DecoratorArg::Integer(i) => write!(f, "{}", i),
            DecoratorArg::Float(v) => write!(f, "{}", format_float(*v)),
            DecoratorArg::Boolean(b) => write!(f, "{}", b),
        }
    }
}

/// The closed vocabulary of decorators the validators understand
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecoratorKind {
    /// Anyone may write the field or call the function
    Public,
    /// Readable, never writable through a state transition
    Read,
    /// Only identities stored at the named paths of the previous instance
    Call(Vec<String>),
    /// The field holds an identity; only that identity may reassign it
    Delegate,
    /// Uniqueness across a corpus; enforced by the caller
    Unique,
    /// Index hint over the named fields; enforced by the caller
    Index(Vec<String>),
    Unknown(String),
}

impl DecoratorKind {
    /// True for decorators that govern who may write or call
    pub fn is_access_rule(&self) -> bool {
        matches!(
            self,
            DecoratorKind::Public | DecoratorKind::Read | DecoratorKind::Call(_) | DecoratorKind::Delegate
        )
    }
}

impl Decorator {
    pub fn kind(&self) -> DecoratorKind {
        let paths = || {
            self.arguments
                .iter()
                .map(|arg| match arg {
                    DecoratorArg::Ident(s) | DecoratorArg::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .collect::<Vec<_>>()
        };
        match self.name.as_str() {
            "public" => DecoratorKind::Public,
            "read" => DecoratorKind::Read,
            "call" => DecoratorKind::Call(paths()),
            "delegate" => DecoratorKind::Delegate,
            "unique" => DecoratorKind::Unique,
            "index" => DecoratorKind::Index(paths()),
            other => DecoratorKind::Unknown(other.to_string()),
        }
    }
}

// ── Types ─────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum Type {
    String,
    Number,
    Boolean,
    Bytes,
    PublicKey,
    I32,
    I64,
    U32,
    U64,
    F32,
    F64,
    Array { element: Box<Type> },
    Map { key: Box<Type>, value: Box<Type> },
    Object { fields: Vec<ObjectField> },
    /// A record of another contract, referenced by id
    Reference { contract: String },
}

/// Field of an inline object type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectField {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: Type,
    pub required: bool,
}

impl Type {
    /// Resolve a primitive type keyword
    pub fn from_name(name: &str) -> Option<Type> {
        Some(match name {
            "string" => Type::String,
            "number" => Type::Number,
            "boolean" => Type::Boolean,
            "bytes" => Type::Bytes,
            "PublicKey" => Type::PublicKey,
            "i32" => Type::I32,
            "i64" => Type::I64,
            "u32" => Type::U32,
            "u64" => Type::U64,
            "f32" => Type::F32,
            "f64" => Type::F64,
            _ => return None,
        })
    }

    pub fn is_integer(&self) -> bool {
        matches!(self, Type::I32 | Type::I64 | Type::U32 | Type::U64)
    }

    pub fn is_numeric(&self) -> bool {
        self.is_integer() || matches!(self, Type::Number | Type::F32 | Type::F64)
    }
}

impl std::fmt::Display for Type {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Type::String => write!(f, "string"),
            Type::Number => write!(f, "number"),
            Type::Boolean => write!(f, "boolean"),
            Type::Bytes => write!(f, "bytes"),
            Type::PublicKey => write!(f, "PublicKey"),
            Type::I32 => write!(f, "i32"),
            Type::I64 => write!(f, "i64"),
            Type::U32 => write!(f, "u32"),
            Type::U64 => write!(f, "u64"),
            Type::F32 => write!(f, "f32"),
            Type::F64 => write!(f, "f64"),
            Type::Array { element } => write!(f, "{}[]", element),
            Type::Map { key, value } => write!(f, "map<{}, {}>", key, value),
            Type::Object { fields } => {
                write!(f, "{{")?;
                for field in fields {
                    let optional = if field.required { "" } else { "?" };
                    write!(f, " {}{}: {};", field.name, optional, field.ty)?;
                }
                write!(f, " }}")
            }
            Type::Reference { contract } => write!(f, "{}", contract),
        }
    }
}

// ── Statements ────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Statement {
    #[serde(flatten)]
    pub kind: StatementKind,
    #[serde(default)]
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum StatementKind {
    Let {
        name: String,
        value: Expression,
    },
    Expression {
        expression: Expression,
    },
    If {
        condition: Expression,
        then_branch: Vec<Statement>,
        else_branch: Vec<Statement>,
    },
    While {
        condition: Expression,
        body: Vec<Statement>,
    },
    For {
        init: Option<Box<Statement>>,
        condition: Option<Expression>,
        update: Option<Expression>,
        body: Vec<Statement>,
    },
    ForOf {
        binding: String,
        iterable: Expression,
        body: Vec<Statement>,
    },
    Break,
    Continue,
    Return {
        value: Option<Expression>,
    },
    Throw {
        value: Expression,
    },
}

// ── Expressions ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum Expression {
    Literal {
        value: Literal,
    },
    Ident {
        name: String,
    },
    This,
    Array {
        elements: Vec<Expression>,
    },
    Object {
        entries: Vec<ObjectEntry>,
    },
    Member {
        object: Box<Expression>,
        property: String,
    },
    Index {
        object: Box<Expression>,
        index: Box<Expression>,
    },
    Call {
        callee: Box<Expression>,
        arguments: Vec<Expression>,
    },
    Unary {
        op: UnaryOp,
        operand: Box<Expression>,
    },
    Binary {
        op: BinaryOp,
        left: Box<Expression>,
        right: Box<Expression>,
    },
    Assign {
        op: AssignOp,
        target: Box<Expression>,
        value: Box<Expression>,
    },
}

impl Expression {
    /// Names, members and index expressions can be assigned to
    pub fn is_place(&self) -> bool {
        match self {
            Expression::Ident { .. } => true,
            Expression::Member { object, .. } | Expression::Index { object, .. } => {
                matches!(**object, Expression::This) || object.is_place()
            }
            _ => false,
        }
    }

    /// Binding strength used by the parser and both printers
    pub fn precedence(&self) -> u8 {
        match self {
            Expression::Assign { .. } => 1,
            Expression::Binary { op, .. } => op.precedence(),
            Expression::Unary { .. } => 9,
            _ => 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectEntry {
    pub key: String,
    pub value: Expression,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Literal {
    Null,
    Boolean(bool),
    Integer(i64),
    Float(f64),
    String(String),
}

impl std::fmt::Display for Literal {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Literal::Null => write!(f, "null"),
            Literal::Boolean(b) => write!(f, "{}", b),
            Literal::Integer(i) => write!(f, "{}", i),
            Literal::Float(v) => write!(f, "{}", format_float(*v)),
            Literal::String(s) => write!(f, "{}", quote(s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnaryOp {
    Not,
    Negate,
}

impl UnaryOp {
    pub fn symbol(&self) -> &'static str {
        match self {
            UnaryOp::Not => "!",
            UnaryOp::Negate => "-",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinaryOp {
    Or,
    And,
    Equal,
    NotEqual,
    Less,
    LessEqual,
    Greater,
    GreaterEqual,
    Add,
    Subtract,
    Multiply,
    Divide,
    Modulo,
    Power,
}

/// How operators of equal precedence group
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Associativity {
    Left,
    Right,
    None,
}

impl BinaryOp {
    pub fn symbol(&self) -> &'static str {
        match self {
            BinaryOp::Or => "||",
            BinaryOp::And => "&&",
            BinaryOp::Equal => "==",
            BinaryOp::NotEqual => "!=",
            BinaryOp::Less => "<",
            BinaryOp::LessEqual => "<=",
            BinaryOp::Greater => ">",
            BinaryOp::GreaterEqual => ">=",
            BinaryOp::Add => "+",
            BinaryOp::Subtract => "-",
            BinaryOp::Multiply => "*",
            BinaryOp::Divide => "/",
            BinaryOp::Modulo => "%",
            BinaryOp::Power => "**",
        }
    }

    /// 2 (`||`) through 8 (`**`); assignment is 1, unary 9, postfix 10
    pub fn precedence(&self) -> u8 {
        match self {
            BinaryOp::Or => 2,
            BinaryOp::And => 3,
            BinaryOp::Equal | BinaryOp::NotEqual => 4,
            BinaryOp::Less | BinaryOp::LessEqual | BinaryOp::Greater | BinaryOp::GreaterEqual => 5,
            BinaryOp::Add | BinaryOp::Subtract => 6,
            BinaryOp::Multiply | BinaryOp::Divide | BinaryOp::Modulo => 7,
            BinaryOp::Power => 8,
        }
    }

    pub fn associativity(&self) -> Associativity {
        match self {
            BinaryOp::Power => Associativity::Right,
            BinaryOp::Equal
            | BinaryOp::NotEqual
            | BinaryOp::Less
            | BinaryOp::LessEqual
            | BinaryOp::Greater
            | BinaryOp::GreaterEqual => Associativity::None,
            _ => Associativity::Left,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AssignOp {
    Assign,
    Add,
    Subtract,
    Multiply,
    Divide,
}

impl AssignOp {
    pub fn symbol(&self) -> &'static str {
        match self {
            AssignOp::Assign => "=",
            AssignOp::Add => "+=",
            AssignOp::Subtract => "-=",
            AssignOp::Multiply => "*=",
            AssignOp::Divide => "/=",
        }
    }

    /// The arithmetic a compound assignment performs
    pub fn binary(&self) -> Option<BinaryOp> {
        match self {
            AssignOp::Assign => None,
            AssignOp::Add => Some(BinaryOp::Add),
            AssignOp::Subtract => Some(BinaryOp::Subtract),
            AssignOp::Multiply => Some(BinaryOp::Multiply),
            AssignOp::Divide => Some(BinaryOp::Divide),
        }
    }
}

// ── Text helpers ──────────────────────────────────────────

/// Double-quoted string literal with escapes the tokenizer understands
pub fn quote(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '\r' => out.push_str("\\r"),
            '\0' => out.push_str("\\0"),
            c => out.push(c),
        }
    }
    out.push('"');
    out
}

/// Floats always keep a fractional part so they re-tokenize as floats
pub fn format_float(v: f64) -> String {
    let text = format!("{}", v);
    if text.contains('.') || text.contains('e') || text.contains("inf") || text.contains("NaN") {
        text
    } else {
        format!("{}.0", text)
    }
}
