//! C-FFI layer for Charter — for cgo, ctypes and other FFI consumers.
//!
//! ZERO logic here. Every call forwards JSON text to `charter_core::api`.
//!
//! # Memory Contract
//!
//! All functions that return `*mut c_char` allocate via `CString`.
//! The caller MUST free the returned strings by calling `charter_free_string()`.
//!
//! # Errors
//!
//! On failure `error` holds the interchange JSON
//! `{ "error": kind, "message": text, "details": [...] }`.

use std::ffi::{CStr, CString};
use std::os::raw::c_char;

use charter_core::api;
use charter_core::Error;

/// Result of a Charter FFI call.
/// Exactly one of `result` and `error` is non-null.
/// The caller MUST free both with `charter_free_string()`.
#[repr(C)]
pub struct CharterResult {
    pub result: *mut c_char,
    pub error: *mut c_char,
}

impl CharterResult {
    fn ok(value: String) -> Self {
        CharterResult {
            result: into_c(value),
            error: std::ptr::null_mut(),
        }
    }

    fn err(error: Error) -> Self {
        CharterResult {
            result: std::ptr::null_mut(),
            error: into_c(error.to_interchange().to_string()),
        }
    }

    fn wrap(outcome: charter_core::Result<String>) -> Self {
        match outcome {
            Ok(value) => CharterResult::ok(value),
            Err(e) => CharterResult::err(e),
        }
    }
}

/// Interior NULs cannot cross the boundary; JSON output never has them
fn into_c(text: String) -> *mut c_char {
    let bytes: Vec<u8> = text.into_bytes().into_iter().filter(|b| *b != 0).collect();
    CString::new(bytes).unwrap_or_default().into_raw()
}

/// Required string argument
unsafe fn arg<'a>(ptr: *const c_char, name: &str) -> Result<&'a str, Error> {
    optional(ptr, name)?.ok_or_else(|| Error::Interchange(format!("`{}` must not be null", name)))
}

/// Null means "not given"
unsafe fn optional<'a>(ptr: *const c_char, name: &str) -> Result<Option<&'a str>, Error> {
    if ptr.is_null() {
        return Ok(None);
    }
    CStr::from_ptr(ptr)
        .to_str()
        .map(Some)
        .map_err(|_| Error::Interchange(format!("`{}` is not valid UTF-8", name)))
}

/// Parse source text; the result is the AST as JSON.
///
/// # Safety
/// `source` must be a valid null-terminated UTF-8 C string.
#[no_mangle]
pub unsafe extern "C" fn charter_parse(source: *const c_char) -> CharterResult {
    CharterResult::wrap(arg(source, "source").and_then(api::parse_json))
}

/// Canonical form of source text.
///
/// # Safety
/// `source` must be a valid null-terminated UTF-8 C string.
#[no_mangle]
pub unsafe extern "C" fn charter_normalize(source: *const c_char) -> CharterResult {
    CharterResult::wrap(arg(source, "source").and_then(charter_core::normalizer::normalize))
}

/// Run `contract.function(args)` on `instance`.
/// Returns JSON: `{ "returnValue": ..., "instance": ... }`
///
/// # Safety
/// All pointers must be valid null-terminated UTF-8 C strings;
/// `public_key` may be null.
#[no_mangle]
pub unsafe extern "C" fn charter_interpret(
    ast: *const c_char,
    contract: *const c_char,
    function: *const c_char,
    args: *const c_char,
    instance: *const c_char,
    public_key: *const c_char,
) -> CharterResult {
    let call = || {
        api::interpret_json(
            arg(ast, "ast")?,
            arg(contract, "contract")?,
            arg(function, "function")?,
            arg(args, "args")?,
            arg(instance, "instance")?,
            optional(public_key, "public_key")?,
        )
    };
    CharterResult::wrap(call())
}

/// Validate `data` against a contract; `contract` may be null when the
/// program declares exactly one.
///
/// # Safety
/// `ast` and `data` must be valid null-terminated UTF-8 C strings;
/// `contract` may be null.
#[no_mangle]
pub unsafe extern "C" fn charter_validate_set(
    ast: *const c_char,
    contract: *const c_char,
    data: *const c_char,
) -> CharterResult {
    let call = || {
        api::validate_set_json(
            arg(ast, "ast")?,
            optional(contract, "contract")?,
            arg(data, "data")?,
        )
    };
    CharterResult::wrap(call())
}

/// Check a `previous → new` transition against the contract's decorators.
///
/// # Warning
/// A null `signature` means the caller is NOT authenticated: `public_key`
/// is trusted as claimed. Pass null only when the host has already
/// verified the caller holds that key.
///
/// # Safety
/// `ast`, `contract`, `new_data` and `previous_data` must be valid
/// null-terminated UTF-8 C strings; `public_key`, `signature` and
/// `message` may be null.
#[no_mangle]
pub unsafe extern "C" fn charter_validate_set_decorators(
    ast: *const c_char,
    contract: *const c_char,
    new_data: *const c_char,
    previous_data: *const c_char,
    public_key: *const c_char,
    signature: *const c_char,
    message: *const c_char,
) -> CharterResult {
    let call = || {
        api::validate_set_decorators_json(
            arg(ast, "ast")?,
            arg(contract, "contract")?,
            arg(new_data, "new_data")?,
            arg(previous_data, "previous_data")?,
            optional(public_key, "public_key")?,
            optional(signature, "signature")?,
            optional(message, "message")?,
        )
    };
    CharterResult::wrap(call())
}

/// Transpile an AST node to JavaScript.
/// Returns JSON: `{ "source": "..." }`
///
/// # Safety
/// `node` must be a valid null-terminated UTF-8 C string.
#[no_mangle]
pub unsafe extern "C" fn charter_generate(node: *const c_char) -> CharterResult {
    CharterResult::wrap(arg(node, "node").and_then(api::generate_json))
}

/// Free a string previously returned by a Charter FFI function.
///
/// # Safety
/// `ptr` must be a pointer previously returned by a Charter FFI function,
/// or null (in which case this is a no-op).
#[no_mangle]
pub unsafe extern "C" fn charter_free_string(ptr: *mut c_char) {
    if !ptr.is_null() {
        drop(CString::from_raw(ptr));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SOURCE: &str = "contract Counter { count: number; function add(n: number): number { this.count += n; return this.count; } }";

    fn c(text: &str) -> CString {
        CString::new(text).unwrap()
    }

    /// Take ownership of both strings and free them
    unsafe fn collect(result: CharterResult) -> (Option<String>, Option<String>) {
        let read = |ptr: *mut c_char| {
            if ptr.is_null() {
                None
            } else {
                let text = CStr::from_ptr(ptr).to_str().unwrap().to_string();
                charter_free_string(ptr);
                Some(text)
            }
        };
        (read(result.result), read(result.error))
    }

    fn ast() -> String {
        let source = c(SOURCE);
        let (result, error) = unsafe { collect(charter_parse(source.as_ptr())) };
        assert!(error.is_none());
        result.unwrap()
    }

    #[test]
    fn test_parse_and_interpret() {
        let ast = c(&ast());
        let contract = c("Counter");
        let function = c("add");
        let args = c("[2]");
        let instance = c(r#"{"count": 40}"#);

        let (result, error) = unsafe {
            collect(charter_interpret(
                ast.as_ptr(),
                contract.as_ptr(),
                function.as_ptr(),
                args.as_ptr(),
                instance.as_ptr(),
                std::ptr::null(),
            ))
        };
        assert!(error.is_none(), "{:?}", error);
        let value: serde_json::Value = serde_json::from_str(&result.unwrap()).unwrap();
        assert_eq!(value["returnValue"], 42);
    }

    #[test]
    fn test_parse_error_is_interchange_json() {
        let source = c("contract {");
        let (result, error) = unsafe { collect(charter_parse(source.as_ptr())) };
        assert!(result.is_none());
        let value: serde_json::Value = serde_json::from_str(&error.unwrap()).unwrap();
        assert_eq!(value["error"], "ParseError");
    }

    #[test]
    fn test_null_required_argument() {
        let (result, error) = unsafe { collect(charter_parse(std::ptr::null())) };
        assert!(result.is_none());
        assert!(error.unwrap().contains("must not be null"));
    }

    #[test]
    fn test_validate_set_without_contract_name() {
        let ast = c(&ast());
        let data = c(r#"{"count": "many"}"#);
        let (_, error) =
            unsafe { collect(charter_validate_set(ast.as_ptr(), std::ptr::null(), data.as_ptr())) };
        let value: serde_json::Value = serde_json::from_str(&error.unwrap()).unwrap();
        assert_eq!(value["error"], "ValidationError");
        assert_eq!(value["details"][0]["path"], "count");
    }

    #[test]
    fn test_generate() {
        let ast = c(&ast());
        let (result, _) = unsafe { collect(charter_generate(ast.as_ptr())) };
        assert!(result.unwrap().contains("const Counter"));
    }

    #[test]
    fn test_free_null_is_noop() {
        unsafe { charter_free_string(std::ptr::null_mut()) };
    }
}
