//! Charter Core - contract language engine
//!
//! Charter declares data contracts: typed fields plus functions, guarded by
//! access-control decorators. This crate is the whole engine; the CLI and
//! the C binding are thin shells over it.
//!
//! # Architecture
//!
//! ```text
//! Source → Parser → AST ─┬→ Normalizer   → canonical text + SHA-256
//!                        ├→ Verifier     → static diagnostics
//!                        ├→ Schema       → validate_set
//!                        ├→ Interpreter  → return value + next instance
//!                        ├→ Authorization→ validate_set_decorators
//!                        └→ Transpiler   → JavaScript
//! ```
//!
//! # Guarantees
//!
//! - **Deterministic**: same input always produces identical output
//! - **Stateless**: no global state, no I/O, every call is independent
//! - **Bounded**: interpretation is limited in steps and call depth
//! - **All-or-nothing**: a failed call never yields a partial instance

pub mod api;
pub mod authorization;
pub mod error;
pub mod interpreter;
pub mod normalizer;
pub mod parser;
pub mod schema;
pub mod signature;
pub mod transpiler;
pub mod verifier;

pub use authorization::{validate_call_decorators, validate_set_decorators};
pub use error::{
    AuthorizationError, Error, GenerationError, ParseError, Result, RuntimeError,
    ValidationError,
};
pub use interpreter::{interpret, CallContext, Interpreter, Limits, Outcome, Value};
pub use parser::ast::*;
pub use parser::parse;
pub use schema::{validate_set, ValidationReport};
pub use signature::{Ed25519Verifier, PublicKey, TransitionVerifier, TrustedCaller};
pub use transpiler::generate;
