use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::{Path, PathBuf};
use std::process;

use charter_core::error::Error;
use charter_core::interpreter::{CallContext, Interpreter, Limits};
use charter_core::signature::{
    DetachedPayload, Ed25519Verifier, PublicKey, SignatureError, Transition, TransitionVerifier,
    TrustedCaller,
};
use charter_core::verifier::Severity;
use charter_core::{normalizer, verifier, Node, Program};

/// Charter — contract language toolchain
///
/// Parse, format, verify, validate, run and transpile Charter contracts.
#[derive(Parser)]
#[command(name = "charter", version, about, long_about = None)]
struct Cli {
    /// Only print results, no status lines
    #[arg(long, short, global = true)]
    quiet: bool,

    /// Log engine stages to stderr (overrides RUST_LOG)
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Parse a source file and report its structure
    Parse {
        /// Path to .charter file
        file: PathBuf,
        /// Print the AST as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print the canonical form of a source file
    Fmt {
        /// Path to .charter file
        file: PathBuf,
        /// Rewrite the file in place
        #[arg(long)]
        write: bool,
    },

    /// Compute semantic hash (SHA-256) of a source file
    Hash {
        /// Path to .charter file
        file: PathBuf,
    },

    /// Static checks: types, decorator paths, suspicious combinations
    Verify {
        /// Path to .charter file
        file: PathBuf,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Validate a data instance against a contract
    Validate {
        /// Path to .charter file
        file: PathBuf,
        /// Instance as JSON text
        #[arg(long)]
        data: String,
        /// Contract name; optional when the file declares one contract
        #[arg(long)]
        contract: Option<String>,
    },

    /// Run a contract function against an instance
    Call {
        /// Path to .charter file
        file: PathBuf,
        #[arg(long)]
        contract: String,
        #[arg(long)]
        function: String,
        /// Arguments as a JSON array
        #[arg(long, default_value = "[]")]
        args: String,
        /// Instance as JSON text; `null` for a new record
        #[arg(long, default_value = "null")]
        instance: String,
        /// Caller key, 64 hex characters; exposed as ctx.publicKey, never verified
        #[arg(long)]
        public_key: Option<String>,
        #[arg(long)]
        max_steps: Option<u64>,
        #[arg(long)]
        max_depth: Option<usize>,
    },

    /// Check that a state transition is allowed for a caller
    Authorize {
        /// Path to .charter file
        file: PathBuf,
        #[arg(long)]
        contract: String,
        /// Proposed instance as JSON text
        #[arg(long)]
        new: String,
        /// Current instance as JSON text; `null` on creation
        #[arg(long, default_value = "null")]
        previous: String,
        /// Caller key, 64 hex characters
        #[arg(long)]
        public_key: Option<String>,
        /// Detached ed25519 signature, 128 hex characters
        #[arg(long, conflicts_with = "trusted", requires = "public_key")]
        signature: Option<String>,
        /// Signed message; defaults to the compact JSON of the new instance
        #[arg(long, requires = "signature")]
        message: Option<String>,
        /// UNAUTHENTICATED: accept --public-key as the caller without any signature
        ///
        /// Nothing proves the caller holds the key; any key can be claimed.
        /// Only pass this when the caller was already authenticated upstream.
        #[arg(long)]
        trusted: bool,
    },

    /// Transpile to JavaScript
    Generate {
        /// Path to .charter file
        file: PathBuf,
        /// Only this contract
        #[arg(long)]
        contract: Option<String>,
        /// Only this function (of --contract, or a top-level one)
        #[arg(long)]
        function: Option<String>,
    },

    /// Show version information
    Version,
}

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("cannot write {path}: {source}")]
    Write {
        path: String,
        source: std::io::Error,
    },

    #[error("invalid {what}: {source}")]
    Json {
        what: &'static str,
        source: serde_json::Error,
    },

    #[error("{0}")]
    Usage(String),

    #[error(transparent)]
    Engine(#[from] Error),
}

impl CliError {
    /// 1 when the input was understood but rejected, 2 otherwise
    fn exit_code(&self) -> i32 {
        match self {
            CliError::Engine(Error::Parse(_) | Error::Interchange(_)) => 2,
            CliError::Engine(_) => 1,
            _ => 2,
        }
    }
}

type CliResult = Result<i32, CliError>;

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let quiet = cli.quiet;
    let result = match cli.command {
        Commands::Parse { file, json } => cmd_parse(&file, json, quiet),
        Commands::Fmt { file, write } => cmd_fmt(&file, write, quiet),
        Commands::Hash { file } => cmd_hash(&file),
        Commands::Verify { file, json } => cmd_verify(&file, json, quiet),
        Commands::Validate {
            file,
            data,
            contract,
        } => cmd_validate(&file, &data, contract.as_deref(), quiet),
        Commands::Call {
            file,
            contract,
            function,
            args,
            instance,
            public_key,
            max_steps,
            max_depth,
        } => {
            let mut limits = Limits::default();
            if let Some(steps) = max_steps {
                limits.max_steps = steps;
            }
            if let Some(depth) = max_depth {
                limits.max_call_depth = depth;
            }
            cmd_call(
                &file,
                &contract,
                &function,
                &args,
                &instance,
                public_key.as_deref(),
                limits,
            )
        }
        Commands::Authorize {
            file,
            contract,
            new,
            previous,
            public_key,
            signature,
            message,
            trusted,
        } => cmd_authorize(
            &file,
            &contract,
            &new,
            &previous,
            public_key.as_deref(),
            Signing {
                signature,
                message,
                trusted,
            },
            quiet,
        ),
        Commands::Generate {
            file,
            contract,
            function,
        } => cmd_generate(&file, contract.as_deref(), function.as_deref()),
        Commands::Version => {
            println!(
                "charter {} (charter-core {})",
                env!("CARGO_PKG_VERSION"),
                env!("CARGO_PKG_VERSION")
            );
            Ok(0)
        }
    };

    let exit_code = match result {
        Ok(code) => code,
        Err(e) => {
            report(&e);
            e.exit_code()
        }
    };

    process::exit(exit_code);
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        tracing_subscriber::EnvFilter::new("debug")
    } else {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

// ── Commands ──────────────────────────────────────────────

fn cmd_parse(file: &Path, json: bool, quiet: bool) -> CliResult {
    let program = load(file)?;
    if json {
        let text = serde_json::to_string_pretty(&Node::Program(program)).map_err(|source| {
            CliError::Json {
                what: "AST",
                source,
            }
        })?;
        println!("{}", text);
        return Ok(0);
    }

    if !quiet {
        println!("{} {}", "✓".green(), file.display());
    }
    for contract in &program.contracts {
        println!(
            "contract {} ({} fields, {} functions)",
            contract.name.bold(),
            contract.fields.len(),
            contract.functions.len()
        );
    }
    for function in &program.functions {
        println!("function {}", function.name.bold());
    }
    Ok(0)
}

fn cmd_fmt(file: &Path, write: bool, quiet: bool) -> CliResult {
    let program = load(file)?;
    let canonical = normalizer::format_program(&program);
    if write {
        std::fs::write(file, &canonical).map_err(|source| CliError::Write {
            path: file.display().to_string(),
            source,
        })?;
        if !quiet {
            println!("{} formatted {}", "✓".green(), file.display());
        }
    } else {
        print!("{}", canonical);
    }
    Ok(0)
}

fn cmd_hash(file: &Path) -> CliResult {
    let program = load(file)?;
    println!("{}", normalizer::semantic_hash(&program));
    Ok(0)
}

fn cmd_verify(file: &Path, json: bool, quiet: bool) -> CliResult {
    let program = load(file)?;
    let result = verifier::verify(&program);
    let code = if result.is_valid() { 0 } else { 1 };

    if json {
        let output = serde_json::json!({
            "valid": result.is_valid(),
            "errors": result.errors().len(),
            "warnings": result.warnings().len(),
            "diagnostics": result.diagnostics,
        });
        println!("{}", output);
        return Ok(code);
    }

    for diagnostic in &result.diagnostics {
        match diagnostic.severity {
            Severity::Error => eprintln!("{} {}", "✗".red(), diagnostic),
            Severity::Warning => eprintln!("{} {}", "!".yellow(), diagnostic),
        }
    }
    if !quiet && result.is_valid() {
        println!(
            "{} {} verified ({} warnings)",
            "✓".green(),
            file.display(),
            result.warnings().len()
        );
    }
    Ok(code)
}

fn cmd_validate(file: &Path, data: &str, contract: Option<&str>, quiet: bool) -> CliResult {
    let program = load(file)?;
    let data = json_arg(data, "--data")?;
    let name = match program.resolve_contract(contract) {
        Some(found) => found.name.clone(),
        None => match contract {
            Some(name) => name.to_string(),
            None => {
                return Err(CliError::Usage(format!(
                    "--contract is required: {} declares {} contracts",
                    file.display(),
                    program.contracts.len()
                )))
            }
        },
    };

    let report = charter_core::validate_set(&program, &name, &data).map_err(Error::from)?;
    if !quiet {
        println!("{} instance is a valid {}", "✓".green(), report.contract.bold());
    }
    for constraint in &report.deferred {
        println!(
            "  deferred {:?}({})",
            constraint.kind,
            constraint.fields.join(", ")
        );
    }
    Ok(0)
}

fn cmd_call(
    file: &Path,
    contract: &str,
    function: &str,
    args: &str,
    instance: &str,
    public_key: Option<&str>,
    limits: Limits,
) -> CliResult {
    let program = load(file)?;
    let args = match json_arg(args, "--args")? {
        serde_json::Value::Array(items) => items,
        _ => return Err(CliError::Usage("--args must be a JSON array".into())),
    };
    let instance = json_arg(instance, "--instance")?;
    let ctx = CallContext {
        public_key: public_key.map(key_arg).transpose()?,
    };

    let outcome = Interpreter::new(&program)
        .with_limits(limits)
        .call(contract, function, &args, &instance, &ctx)
        .map_err(Error::from)?;
    let text = serde_json::to_string_pretty(&outcome).map_err(|source| CliError::Json {
        what: "outcome",
        source,
    })?;
    println!("{}", text);
    Ok(0)
}

struct Signing {
    signature: Option<String>,
    message: Option<String>,
    trusted: bool,
}

/// Refuses every identity check; used when no signature was given
struct Unsigned;

impl TransitionVerifier for Unsigned {
    fn verify(&self, _key: &PublicKey, _transition: &Transition<'_>) -> Result<(), SignatureError> {
        Err(SignatureError::Malformed(
            "no signature supplied (pass --signature or --trusted)".into(),
        ))
    }
}

fn compact_next(transition: &Transition<'_>) -> Vec<u8> {
    transition.next.to_string().into_bytes()
}

fn cmd_authorize(
    file: &Path,
    contract: &str,
    new: &str,
    previous: &str,
    public_key: Option<&str>,
    signing: Signing,
    quiet: bool,
) -> CliResult {
    let program = load(file)?;
    let new = json_arg(new, "--new")?;
    let previous = json_arg(previous, "--previous")?;
    let key = public_key.map(key_arg).transpose()?;

    let bad_signature = |e: SignatureError| CliError::Usage(format!("--signature: {}", e));
    let checker: Box<dyn TransitionVerifier> = match (signing.signature, signing.message) {
        (Some(signature), Some(message)) => Box::new(
            Ed25519Verifier::from_hex(&signature, DetachedPayload(message.into_bytes()))
                .map_err(bad_signature)?,
        ),
        (Some(signature), None) => {
            Box::new(Ed25519Verifier::from_hex(&signature, compact_next).map_err(bad_signature)?)
        }
        (None, _) if signing.trusted => Box::new(TrustedCaller),
        (None, _) => Box::new(Unsigned),
    };

    charter_core::validate_set_decorators(
        &program,
        contract,
        &new,
        &previous,
        key.as_ref(),
        checker.as_ref(),
    )
    .map_err(Error::from)?;

    if !quiet {
        println!("{} transition allowed", "✓".green());
    }
    Ok(0)
}

fn cmd_generate(file: &Path, contract: Option<&str>, function: Option<&str>) -> CliResult {
    let program = load(file)?;
    let node = select(program, contract, function)?;
    let source = charter_core::generate(&node).map_err(Error::from)?;
    print!("{}", source);
    Ok(0)
}

// ── Helpers ───────────────────────────────────────────────

fn load(file: &Path) -> Result<Program, CliError> {
    let source = std::fs::read_to_string(file).map_err(|source| CliError::Read {
        path: file.display().to_string(),
        source,
    })?;
    Ok(charter_core::parse(&source).map_err(Error::from)?)
}

fn select(program: Program, contract: Option<&str>, function: Option<&str>) -> Result<Node, CliError> {
    let missing = |what: String| CliError::Usage(format!("no {} in this file", what));
    match (contract, function) {
        (None, None) => Ok(Node::Program(program)),
        (Some(c), None) => program
            .contract(c)
            .cloned()
            .map(Node::Contract)
            .ok_or_else(|| missing(format!("contract `{}`", c))),
        (Some(c), Some(f)) => program
            .contract(c)
            .and_then(|found| found.function(f))
            .cloned()
            .map(Node::FunctionDef)
            .ok_or_else(|| missing(format!("function `{}.{}`", c, f))),
        (None, Some(f)) => program
            .function(f)
            .cloned()
            .map(Node::FunctionDef)
            .ok_or_else(|| missing(format!("function `{}`", f))),
    }
}

fn json_arg(text: &str, what: &'static str) -> Result<serde_json::Value, CliError> {
    serde_json::from_str(text).map_err(|source| CliError::Json { what, source })
}

fn key_arg(text: &str) -> Result<PublicKey, CliError> {
    text.parse::<PublicKey>()
        .map_err(|e| CliError::Usage(format!("--public-key: {}", e)))
}

fn report(error: &CliError) {
    let label = "error".red().bold();
    match error {
        CliError::Engine(Error::Validation(e)) => {
            eprintln!("{}: `{}` does not match its contract", label, e.contract);
            for issue in &e.issues {
                eprintln!("  {} {}", "✗".red(), issue);
            }
        }
        CliError::Engine(Error::Authorization(e)) => {
            eprintln!("{}: transition denied by `{}`", label, e.contract);
            for violation in &e.violations {
                eprintln!("  {} {}", "✗".red(), violation);
            }
        }
        other => eprintln!("{}: {}", label, other),
    }
}
