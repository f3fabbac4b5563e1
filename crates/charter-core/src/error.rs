//! Error types for the Charter engine
//!
//! Each stage owns its error type so callers can match on exactly the
//! failures that stage produces. [`Error`] wraps them all for the JSON
//! boundary and the CLI. Validation and authorization errors carry every
//! problem found, not just the first one.

use serde::Serialize;

use crate::parser::tokenizer::Span;

// ── Parse ─────────────────────────────────────────────────

/// Malformed source text. Line and column point at the offending token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
#[error("Parse error at {line}:{column}: {message}")]
pub struct ParseError {
    pub line: usize,
    pub column: usize,
    pub message: String,
}

impl ParseError {
    pub fn at(span: &Span, message: impl Into<String>) -> Self {
        ParseError {
            line: span.line,
            column: span.column,
            message: message.into(),
        }
    }
}

// ── Schema validation ─────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum IssueKind {
    MissingField,
    ExtraField,
    TypeMismatch,
    InvalidValue,
}

/// One mismatch between a data instance and its contract
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldIssue {
    pub path: String,
    pub kind: IssueKind,
    pub expected: String,
    pub actual: String,
}

impl std::fmt::Display for FieldIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self.kind {
            IssueKind::MissingField => {
                write!(f, "missing field `{}` ({})", self.path, self.expected)
            }
            IssueKind::ExtraField => write!(f, "unexpected field `{}`", self.path),
            IssueKind::TypeMismatch => write!(
                f,
                "`{}` expected {}, found {}",
                self.path, self.expected, self.actual
            ),
            IssueKind::InvalidValue => write!(
                f,
                "`{}` is not a valid {}: {}",
                self.path, self.expected, self.actual
            ),
        }
    }
}

/// A data instance does not match its contract's field declarations
#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
#[error("Validation error in `{contract}`: {}", join(.issues))]
pub struct ValidationError {
    pub contract: String,
    pub issues: Vec<FieldIssue>,
}

impl ValidationError {
    /// Issues recorded against the given path
    pub fn issues_at(&self, path: &str) -> Vec<&FieldIssue> {
        self.issues.iter().filter(|i| i.path == path).collect()
    }
}

// ── Interpretation ────────────────────────────────────────

/// Interpretation failure. No instance is returned when one of these occurs.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RuntimeError {
    #[error("Cannot call `{function}`: {message}")]
    ArityOrTypeMismatch { function: String, message: String },

    #[error("Type error: {0}")]
    TypeError(String),

    #[error("Division by zero")]
    DivisionByZero,

    #[error("Undefined reference: {0}")]
    UndefinedReference(String),

    #[error("Index {index} out of bounds for length {len}")]
    IndexOutOfBounds { index: i64, len: usize },

    #[error("Thrown: {0}")]
    Thrown(String),

    #[error("Limit exceeded: {0}")]
    LimitExceeded(String),
}

impl RuntimeError {
    /// Variant name used in the error interchange `details`
    pub fn variant(&self) -> &'static str {
        match self {
            RuntimeError::ArityOrTypeMismatch { .. } => "ArityOrTypeMismatch",
            RuntimeError::TypeError(_) => "TypeError",
            RuntimeError::DivisionByZero => "DivisionByZero",
            RuntimeError::UndefinedReference(_) => "UndefinedReference",
            RuntimeError::IndexOutOfBounds { .. } => "IndexOutOfBounds",
            RuntimeError::Thrown(_) => "Thrown",
            RuntimeError::LimitExceeded(_) => "LimitExceeded",
        }
    }
}

// ── Authorization ─────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ViolationKind {
    ImmutableField,
    Forbidden,
    InvalidSignature,
    UnknownDecorator,
}

/// One decorator rule broken by a state transition
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Violation {
    pub path: String,
    pub kind: ViolationKind,
    pub message: String,
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:?} at `{}`: {}", self.kind, self.path, self.message)
    }
}

/// A write or call is not permitted for the presented caller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
#[error("Authorization error in `{contract}`: {}", join(.violations))]
pub struct AuthorizationError {
    pub contract: String,
    pub violations: Vec<Violation>,
}

impl AuthorizationError {
    pub fn has(&self, kind: ViolationKind) -> bool {
        self.violations.iter().any(|v| v.kind == kind)
    }

    pub fn violations_at(&self, path: &str) -> Vec<&Violation> {
        self.violations.iter().filter(|v| v.path == path).collect()
    }
}

// ── Transpilation ─────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GenerationError {
    #[error("Unsupported construct: {construct}")]
    Unsupported { construct: String },
}

// ── Umbrella ──────────────────────────────────────────────

/// Any failure produced by the engine
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    #[error(transparent)]
    Authorization(#[from] AuthorizationError),

    #[error(transparent)]
    Generation(#[from] GenerationError),

    /// Malformed JSON or unresolvable names at the host boundary
    #[error("Interchange error: {0}")]
    Interchange(String),
}

impl Error {
    /// Error kind as it appears in the `"error"` field of the interchange form
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Parse(_) => "ParseError",
            Error::Validation(_) => "ValidationError",
            Error::Runtime(_) => "RuntimeError",
            Error::Authorization(_) => "AuthorizationError",
            Error::Generation(_) => "GenerationError",
            Error::Interchange(_) => "InterchangeError",
        }
    }

    /// `{ "error": kind, "message": text, "details": [...] }`
    pub fn to_interchange(&self) -> serde_json::Value {
        let details = match self {
            Error::Parse(e) => vec![serde_json::json!({
                "line": e.line,
                "column": e.column,
            })],
            Error::Validation(e) => e
                .issues
                .iter()
                .map(|issue| serde_json::to_value(issue).unwrap_or_default())
                .collect(),
            Error::Runtime(e) => vec![serde_json::json!({ "kind": e.variant() })],
            Error::Authorization(e) => e
                .violations
                .iter()
                .map(|v| serde_json::to_value(v).unwrap_or_default())
                .collect(),
            Error::Generation(GenerationError::Unsupported { construct }) => {
                vec![serde_json::json!({ "kind": "Unsupported", "construct": construct })]
            }
            Error::Interchange(_) => Vec::new(),
        };
        serde_json::json!({
            "error": self.kind(),
            "message": self.to_string(),
            "details": details,
        })
    }
}

fn join<T: std::fmt::Display>(items: &[T]) -> String {
    items
        .iter()
        .map(|i| i.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, Error>;
