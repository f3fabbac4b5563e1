//! JSON boundary — string-in, string-out entry points for hosts
//!
//! Every function takes JSON text and returns JSON text, so a binding
//! only has to move strings across. An AST argument may be a `Node`
//! (`{"kind": "Program", …}` as produced by [`parse_json`], or a single
//! `Contract`) or a bare `Program` object.
//!
//! Failures are [`Error`]s; [`Error::to_interchange`] gives their wire form.

use serde::Deserialize;
use serde_json::{json, Value as Json};

use crate::error::Error;
use crate::interpreter::{CallContext, Interpreter};
use crate::parser::ast::{Node, Program};
use crate::signature::{
    DetachedPayload, Ed25519Verifier, PublicKey, Transition, TransitionVerifier, TrustedCaller,
};
use crate::Result;

/// Parse source text into the AST interchange form
pub fn parse_json(source: &str) -> Result<String> {
    let program = crate::parser::parse(source)?;
    to_text(&Node::Program(program))
}

/// Run a contract function; the result is `{ "returnValue", "instance" }`
///
/// `public_key` reaches the body as `ctx.publicKey` without verification.
pub fn interpret_json(
    ast: &str,
    contract: &str,
    function: &str,
    args: &str,
    instance: &str,
    public_key: Option<&str>,
) -> Result<String> {
    let program = program_from_json(ast)?;
    let args: Vec<Json> = from_text(args, "args")?;
    let instance: Json = from_text(instance, "instance")?;
    let ctx = CallContext {
        public_key: public_key.map(parse_key).transpose()?,
    };

    let outcome = Interpreter::new(&program).call(contract, function, &args, &instance, &ctx)?;
    to_text(&outcome)
}

/// Validate data against a contract; `contract` may be omitted when the
/// program declares exactly one
pub fn validate_set_json(ast: &str, contract: Option<&str>, data: &str) -> Result<String> {
    let program = program_from_json(ast)?;
    let data: Json = from_text(data, "data")?;
    let name = resolve_contract(&program, contract)?;

    let report = crate::schema::validate_set(&program, &name, &data)?;
    to_text(&json!({
        "valid": true,
        "contract": report.contract,
        "deferred": report.deferred,
    }))
}

/// Check a write against the contract's decorators
///
/// With a `signature` (hex), the caller must have signed `message`, or the
/// compact JSON of `new` when no message is given.
///
/// **Without a signature nothing is authenticated**: `public_key` is
/// trusted as claimed, so any caller can pass any key. Omit the signature
/// only when the host has already authenticated the caller.
#[allow(clippy::too_many_arguments)]
pub fn validate_set_decorators_json(
    ast: &str,
    contract: &str,
    new: &str,
    previous: &str,
    public_key: Option<&str>,
    signature: Option<&str>,
    message: Option<&str>,
) -> Result<String> {
    let program = program_from_json(ast)?;
    let new: Json = from_text(new, "new")?;
    let previous: Json = from_text(previous, "previous")?;
    let key = public_key.map(parse_key).transpose()?;

    let verifier: Box<dyn TransitionVerifier> = match (signature, message) {
        (None, _) => Box::new(TrustedCaller),
        (Some(signature), Some(message)) => Box::new(
            Ed25519Verifier::from_hex(signature, DetachedPayload(message.as_bytes().to_vec()))
                .map_err(|e| Error::Interchange(e.to_string()))?,
        ),
        (Some(signature), None) => Box::new(
            Ed25519Verifier::from_hex(signature, signed_instance)
                .map_err(|e| Error::Interchange(e.to_string()))?,
        ),
    };

    crate::authorization::validate_set_decorators(
        &program,
        contract,
        &new,
        &previous,
        key.as_ref(),
        verifier.as_ref(),
    )?;
    to_text(&json!({ "valid": true }))
}

/// Emit JavaScript for a `Node`
pub fn generate_json(node: &str) -> Result<String> {
    let node: Node = from_text(node, "node")?;
    let source = crate::transpiler::generate(&node)?;
    to_text(&json!({ "source": source }))
}

// ── Helpers ────────────────────────────────────────────────

fn signed_instance(transition: &Transition<'_>) -> Vec<u8> {
    transition.next.to_string().into_bytes()
}

/// Accept `Node::Program`, `Node::Contract` or a bare `Program`
///
/// The `"kind"` key picks the shape up front, so a malformed AST reports
/// the field that is actually wrong.
pub fn program_from_json(ast: &str) -> Result<Program> {
    #[derive(Deserialize)]
    struct Shape {
        kind: Option<Json>,
    }

    let shape: Shape = from_text(ast, "ast")?;
    if shape.kind.is_none() {
        return from_text(ast, "ast");
    }

    match from_text::<Node>(ast, "ast")? {
        Node::Program(program) => Ok(program),
        Node::Contract(contract) => Ok(Program {
            contracts: vec![contract],
            functions: Vec::new(),
        }),
        Node::FunctionDef(function) => Ok(Program {
            contracts: Vec::new(),
            functions: vec![function],
        }),
    }
}

fn resolve_contract(program: &Program, contract: Option<&str>) -> Result<String> {
    match program.resolve_contract(contract) {
        Some(found) => Ok(found.name.clone()),
        // Unknown names are reported by the validator itself
        None => contract.map(str::to_string).ok_or_else(|| {
            Error::Interchange(format!(
                "a contract name is required: the program declares {} contracts",
                program.contracts.len()
            ))
        }),
    }
}

fn parse_key(text: &str) -> Result<PublicKey> {
    text.parse::<PublicKey>()
        .map_err(|e| Error::Interchange(format!("invalid public key: {}", e)))
}

fn from_text<T: serde::de::DeserializeOwned>(text: &str, what: &str) -> Result<T> {
    serde_json::from_str(text).map_err(|e| Error::Interchange(format!("invalid {} JSON: {}", what, e)))
}

fn to_text<T: serde::Serialize>(value: &T) -> Result<String> {
    serde_json::to_string(value).map_err(|e| Error::Interchange(format!("serialization failed: {}", e)))
}
