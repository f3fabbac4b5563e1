//! Decorator/authorization validator — guards state transitions
//!
//! Given a contract, the previous and proposed instance and a caller key,
//! decides whether the write is allowed. Only fields that differ between
//! the two snapshots are checked (`null` and absent are the same).
//!
//! # Policy
//!
//! Violations are aggregated: every changed field is checked and every
//! broken rule reported, in field declaration order, followed by
//! undeclared keys in sorted order.
//!
//! # Identities
//!
//! `@call(paths…)` names the callers allowed by the keys found at `paths`
//! in `previous`. When the instance is being created there is no
//! `previous`, so the paths are read from `new`: the creator must sign and
//! be one of the identities the new record names.
//!
//! # Signatures
//!
//! The caller's signature is checked at most once, and only when some rule
//! needs to know who the caller is. What was signed is up to the
//! [`TransitionVerifier`] the host passes in.

use std::collections::BTreeSet;

use serde_json::Value as Json;

use crate::error::{AuthorizationError, Violation, ViolationKind};
use crate::parser::ast::*;
use crate::signature::{PublicKey, SignatureError, Transition, TransitionVerifier};

/// Check a write `previous → new` against the decorators of `contract`
///
/// `previous` is `null` when the instance is being created; identity
/// paths then resolve against `new`.
///
/// # Errors
/// `AuthorizationError` listing every violated rule.
pub fn validate_set_decorators(
    program: &Program,
    contract: &str,
    new: &Json,
    previous: &Json,
    public_key: Option<&PublicKey>,
    verifier: &dyn TransitionVerifier,
) -> Result<(), AuthorizationError> {
    let Some(declared) = program.contract(contract) else {
        return Err(single(contract, "", ViolationKind::Forbidden, "unknown contract"));
    };

    let empty = serde_json::Map::new();
    let creating = previous.is_null();
    let previous_map = previous.as_object().unwrap_or(&empty);
    let Some(new_map) = new.as_object() else {
        return Err(single(
            contract,
            "",
            ViolationKind::Forbidden,
            "the new instance must be an object",
        ));
    };

    let mut guard = Guard {
        caller: public_key,
        verifier,
        transition: Transition {
            contract,
            function: None,
            previous,
            next: new,
        },
        verified: None,
        identities: if creating { new } else { previous },
        violations: Vec::new(),
    };

    for field in &declared.fields {
        let before = present(previous_map.get(&field.name));
        let after = present(new_map.get(&field.name));
        if before == after {
            continue;
        }
        guard.check_field(declared, field, before.is_none(), creating);
    }

    let undeclared: BTreeSet<&String> = previous_map
        .keys()
        .chain(new_map.keys())
        .filter(|key| declared.field(key).is_none())
        .collect();
    for key in undeclared {
        if present(previous_map.get(key)) != present(new_map.get(key)) {
            guard.deny(key, ViolationKind::Forbidden, "field is not declared by the contract");
        }
    }

    tracing::debug!(
        contract,
        violations = guard.violations.len(),
        "checked write decorators"
    );

    guard.finish(contract)
}

/// Check that the caller may invoke `function` on an instance in state `previous`
///
/// # Errors
/// `AuthorizationError` listing every violated rule.
pub fn validate_call_decorators(
    program: &Program,
    contract: &str,
    function: &str,
    previous: &Json,
    public_key: Option<&PublicKey>,
    verifier: &dyn TransitionVerifier,
) -> Result<(), AuthorizationError> {
    let Some(declared) = program.contract(contract) else {
        return Err(single(contract, "", ViolationKind::Forbidden, "unknown contract"));
    };
    let Some(def) = declared.function(function) else {
        return Err(single(contract, function, ViolationKind::Forbidden, "unknown function"));
    };

    let nothing = Json::Null;
    let mut guard = Guard {
        caller: public_key,
        verifier,
        transition: Transition {
            contract,
            function: Some(function),
            previous,
            next: &nothing,
        },
        verified: None,
        identities: previous,
        violations: Vec::new(),
    };

    let kinds: Vec<DecoratorKind> = def.decorators.iter().map(|d| d.kind()).collect();
    let mut identity_paths = Vec::new();
    let mut open = false;
    let mut governed = false;

    for kind in kinds {
        match kind {
            DecoratorKind::Public | DecoratorKind::Read => {
                open = true;
                governed = true;
            }
            DecoratorKind::Call(paths) => {
                identity_paths.extend(paths);
                governed = true;
            }
            DecoratorKind::Unknown(name) => guard.deny(
                function,
                ViolationKind::UnknownDecorator,
                &format!("unrecognized decorator @{}", name),
            ),
            DecoratorKind::Delegate | DecoratorKind::Unique | DecoratorKind::Index(_) => {}
        }
    }

    if !governed {
        guard.check_contract_rules(declared, function);
    } else if !open && !identity_paths.is_empty() {
        guard.require_identity(function, &identity_paths, false);
    }

    tracing::debug!(
        contract,
        function,
        violations = guard.violations.len(),
        "checked call decorators"
    );

    guard.finish(contract)
}

// ── Rule evaluation ────────────────────────────────────────

struct Guard<'a> {
    caller: Option<&'a PublicKey>,
    verifier: &'a dyn TransitionVerifier,
    transition: Transition<'a>,
    /// Outcome of the one signature check, once performed
    verified: Option<Result<(), SignatureError>>,
    /// Instance whose fields name the permitted callers
    identities: &'a Json,
    violations: Vec<Violation>,
}

impl<'a> Guard<'a> {
    fn deny(&mut self, path: &str, kind: ViolationKind, message: &str) {
        self.violations.push(Violation {
            path: path.to_string(),
            kind,
            message: message.to_string(),
        });
    }

    fn finish(self, contract: &str) -> Result<(), AuthorizationError> {
        if self.violations.is_empty() {
            Ok(())
        } else {
            Err(AuthorizationError {
                contract: contract.to_string(),
                violations: self.violations,
            })
        }
    }

    fn check_field(&mut self, contract: &Contract, field: &Field, was_absent: bool, creating: bool) {
        let path = field.name.as_str();
        let mut identity_paths = Vec::new();
        let mut delegate = false;
        let mut public = false;
        let mut governed = false;

        for decorator in &field.decorators {
            match decorator.kind() {
                DecoratorKind::Unknown(name) => {
                    self.deny(
                        path,
                        ViolationKind::UnknownDecorator,
                        &format!("unrecognized decorator @{} on a modified field", name),
                    );
                    return;
                }
                DecoratorKind::Read => {
                    governed = true;
                    if !creating {
                        self.deny(path, ViolationKind::ImmutableField, "field is read-only");
                        return;
                    }
                }
                DecoratorKind::Public => {
                    public = true;
                    governed = true;
                }
                DecoratorKind::Call(paths) => {
                    identity_paths.extend(paths);
                    governed = true;
                }
                DecoratorKind::Delegate => {
                    delegate = true;
                    governed = true;
                }
                DecoratorKind::Unique | DecoratorKind::Index(_) => {}
            }
        }

        if public {
            return;
        }
        if delegate {
            // The first holder of a delegate field may be set by anyone
            if was_absent {
                return;
            }
            identity_paths.push(field.name.clone());
        }
        if !identity_paths.is_empty() {
            self.require_identity(path, &identity_paths, false);
        } else if !governed {
            self.check_contract_rules(contract, path);
        }
    }

    /// Apply contract-level decorators to an item with no rules of its own
    fn check_contract_rules(&mut self, contract: &Contract, path: &str) {
        let mut identity_paths = Vec::new();
        for decorator in &contract.decorators {
            match decorator.kind() {
                DecoratorKind::Call(paths) => identity_paths.extend(paths),
                DecoratorKind::Unknown(name) => self.deny(
                    path,
                    ViolationKind::UnknownDecorator,
                    &format!("unrecognized contract decorator @{}", name),
                ),
                _ => {}
            }
        }
        if !identity_paths.is_empty() {
            self.require_identity(path, &identity_paths, true);
        }
    }

    /// The caller must have signed and be one of the identities at `paths`
    fn require_identity(&mut self, path: &str, paths: &[String], contract_level: bool) {
        let Some(key) = self.caller else {
            self.deny(path, ViolationKind::Forbidden, "a signed caller is required");
            return;
        };

        if let Err(e) = self.authenticate(key) {
            self.deny(path, ViolationKind::InvalidSignature, &e.to_string());
            return;
        }

        let mut identities = Vec::new();
        for identity_path in paths {
            if let Some(value) = lookup(self.identities, identity_path) {
                collect_identities(value, &mut identities);
            }
        }

        if !identities.contains(key) {
            let scope = if contract_level { "contract rule" } else { "rule" };
            self.deny(
                path,
                ViolationKind::Forbidden,
                &format!(
                    "caller is not an identity named by the {} @call({})",
                    scope,
                    paths.join(", ")
                ),
            );
        }
    }

    fn authenticate(&mut self, key: &PublicKey) -> Result<(), SignatureError> {
        if self.verified.is_none() {
            self.verified = Some(self.verifier.verify(key, &self.transition));
        }
        self.verified.clone().unwrap_or(Ok(()))
    }
}

// ── Helpers ────────────────────────────────────────────────

fn single(contract: &str, path: &str, kind: ViolationKind, message: &str) -> AuthorizationError {
    AuthorizationError {
        contract: contract.to_string(),
        violations: vec![Violation {
            path: path.to_string(),
            kind,
            message: message.to_string(),
        }],
    }
}

/// `null` counts as absent
fn present(value: Option<&Json>) -> Option<&Json> {
    value.filter(|v| !v.is_null())
}

/// Follow a dotted path through nested objects
fn lookup<'v>(value: &'v Json, path: &str) -> Option<&'v Json> {
    path.split('.').try_fold(value, |current, segment| current.get(segment))
}

/// Keys held by a field: a key string, a `{ "id": key }` reference, or arrays of either
fn collect_identities(value: &Json, out: &mut Vec<PublicKey>) {
    match value {
        Json::String(s) => {
            if let Ok(key) = s.parse::<PublicKey>() {
                out.push(key);
            }
        }
        Json::Array(items) => items.iter().for_each(|item| collect_identities(item, out)),
        Json::Object(map) => {
            if let Some(id) = map.get("id") {
                collect_identities(id, out);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse;
    use crate::signature::{DetachedPayload, Ed25519Verifier, TrustedCaller};
    use ed25519_dalek::{Signer, SigningKey};
    use serde_json::json;

    const ACCOUNT: &str = r#"
        collection Account {
            @read
            id: string;
            @delegate
            owner: PublicKey;
            @call(owner)
            balance: number;
            @call(admins, owner)
            frozen?: boolean;
            admins?: PublicKey[];
            @public
            note?: string;
            @audited
            score?: number;
            label?: string;

            @call(owner)
            function withdraw(amount: number) {}

            @public
            function ping() {}

            function open() {}

            @sometimes
            function odd() {}
        }

        @call(admin)
        contract Managed {
            admin: PublicKey;
            value?: number;
        }
    "#;

    fn signing(seed: u8) -> SigningKey {
        SigningKey::from_bytes(&[seed; 32])
    }

    fn key(seed: u8) -> PublicKey {
        PublicKey::from_bytes(signing(seed).verifying_key().to_bytes())
    }

    fn program() -> Program {
        parse(ACCOUNT).unwrap()
    }

    fn previous() -> Json {
        json!({ "id": "a1", "owner": key(1).to_hex(), "balance": 10 })
    }

    fn with(base: Json, field: &str, value: Json) -> Json {
        let mut next = base;
        next[field] = value;
        next
    }

    fn write(new: &Json, caller: Option<&PublicKey>) -> Result<(), AuthorizationError> {
        validate_set_decorators(&program(), "Account", new, &previous(), caller, &TrustedCaller)
    }

    // ── Identity rules ─────────────────────────────────

    #[test]
    fn test_owner_signed_write_succeeds() {
        let new = with(previous(), "balance", json!(20));
        let message = serde_json::to_vec(&new).unwrap();
        let signature = signing(1).sign(&message).to_bytes();
        let verifier = Ed25519Verifier::new(&signature, DetachedPayload(message)).unwrap();

        let result = validate_set_decorators(
            &program(),
            "Account",
            &new,
            &previous(),
            Some(&key(1)),
            &verifier,
        );
        assert_eq!(result, Ok(()));
    }

    #[test]
    fn test_signature_from_other_key_is_invalid() {
        let new = with(previous(), "balance", json!(20));
        let message = serde_json::to_vec(&new).unwrap();
        let signature = signing(2).sign(&message).to_bytes();
        let verifier = Ed25519Verifier::new(&signature, DetachedPayload(message)).unwrap();

        let err = validate_set_decorators(
            &program(),
            "Account",
            &new,
            &previous(),
            Some(&key(1)),
            &verifier,
        )
        .unwrap_err();
        assert!(err.has(ViolationKind::InvalidSignature));
    }

    #[test]
    fn test_non_owner_is_forbidden() {
        let new = with(previous(), "balance", json!(20));
        let err = write(&new, Some(&key(2))).unwrap_err();
        assert_eq!(err.violations.len(), 1);
        assert_eq!(err.violations[0].kind, ViolationKind::Forbidden);
        assert_eq!(err.violations[0].path, "balance");
    }

    #[test]
    fn test_missing_caller_is_forbidden() {
        let new = with(previous(), "balance", json!(20));
        let err = write(&new, None).unwrap_err();
        assert!(err.violations[0].message.contains("signed caller"));
    }

    #[test]
    fn test_identity_from_array_path() {
        let mut before = previous();
        before["admins"] = json!([key(3).to_hex(), key(4).to_hex()]);
        let new = with(before.clone(), "frozen", json!(true));
        let result = validate_set_decorators(
            &program(),
            "Account",
            &new,
            &before,
            Some(&key(4)),
            &TrustedCaller,
        );
        assert_eq!(result, Ok(()));
    }

    #[test]
    fn test_delegate_reassignment_needs_current_holder() {
        let new = with(previous(), "owner", json!(key(2).to_hex()));
        assert_eq!(write(&new, Some(&key(1))), Ok(()));
        let err = write(&new, Some(&key(2))).unwrap_err();
        assert!(err.has(ViolationKind::Forbidden));
    }

    // ── Immutability ───────────────────────────────────

    #[test]
    fn test_read_field_is_immutable_regardless_of_signature() {
        let new = with(previous(), "id", json!("a2"));
        let err = write(&new, Some(&key(1))).unwrap_err();
        assert_eq!(err.violations_at("id")[0].kind, ViolationKind::ImmutableField);
    }

    #[test]
    fn test_creation_initialises_read_and_delegate_fields() {
        let new = json!({ "id": "a1", "owner": key(1).to_hex() });
        let result = validate_set_decorators(
            &program(),
            "Account",
            &new,
            &Json::Null,
            None,
            &TrustedCaller,
        );
        assert_eq!(result, Ok(()));
    }

    #[test]
    fn test_creation_resolves_call_paths_in_new_instance() {
        let new = json!({ "id": "a1", "owner": key(1).to_hex(), "balance": 5 });
        let create = |caller: Option<&PublicKey>| {
            validate_set_decorators(&program(), "Account", &new, &Json::Null, caller, &TrustedCaller)
        };
        assert_eq!(create(Some(&key(1))), Ok(()));

        let err = create(Some(&key(2))).unwrap_err();
        assert_eq!(err.violations_at("balance")[0].kind, ViolationKind::Forbidden);
        let err = create(None).unwrap_err();
        assert!(err.violations_at("balance")[0].message.contains("signed caller"));
    }

    #[test]
    fn test_unchanged_fields_are_not_checked() {
        let mut new = previous();
        new["label"] = Json::Null;
        assert_eq!(write(&new, None), Ok(()));
    }

    // ── Open and unknown rules ─────────────────────────

    #[test]
    fn test_public_and_undecorated_fields_are_open() {
        let new = with(with(previous(), "note", json!("hi")), "label", json!("x"));
        assert_eq!(write(&new, None), Ok(()));
    }

    #[test]
    fn test_unknown_decorator_on_modified_field_is_denied() {
        let new = with(previous(), "score", json!(1));
        let err = write(&new, Some(&key(1))).unwrap_err();
        assert_eq!(err.violations[0].kind, ViolationKind::UnknownDecorator);
    }

    #[test]
    fn test_undeclared_key_is_forbidden() {
        let new = with(previous(), "color", json!("red"));
        let err = write(&new, None).unwrap_err();
        assert_eq!(err.violations_at("color")[0].kind, ViolationKind::Forbidden);
    }

    #[test]
    fn test_violations_are_aggregated_in_order() {
        let mut new = previous();
        new["id"] = json!("changed");
        new["balance"] = json!(0);
        new["score"] = json!(3);
        new["zzz"] = json!(1);
        new["aaa"] = json!(1);
        let err = write(&new, Some(&key(9))).unwrap_err();
        let paths: Vec<&str> = err.violations.iter().map(|v| v.path.as_str()).collect();
        assert_eq!(paths, vec!["id", "balance", "score", "aaa", "zzz"]);
    }

    // ── Contract-level rules ───────────────────────────

    #[test]
    fn test_contract_level_call_rule() {
        let before = json!({ "admin": key(5).to_hex(), "value": 1 });
        let new = json!({ "admin": key(5).to_hex(), "value": 2 });
        let program = program();
        assert_eq!(
            validate_set_decorators(&program, "Managed", &new, &before, Some(&key(5)), &TrustedCaller),
            Ok(())
        );
        let err = validate_set_decorators(&program, "Managed", &new, &before, Some(&key(6)), &TrustedCaller)
            .unwrap_err();
        assert!(err.violations[0].message.contains("contract rule"));
    }

    // ── Call rules ─────────────────────────────────────

    #[test]
    fn test_call_decorators() {
        let program = program();
        let check = |function: &str, caller: Option<&PublicKey>| {
            validate_call_decorators(&program, "Account", function, &previous(), caller, &TrustedCaller)
        };

        assert_eq!(check("withdraw", Some(&key(1))), Ok(()));
        assert!(check("withdraw", Some(&key(2))).unwrap_err().has(ViolationKind::Forbidden));
        assert_eq!(check("ping", None), Ok(()));
        assert_eq!(check("open", None), Ok(()));
        assert!(check("odd", None).unwrap_err().has(ViolationKind::UnknownDecorator));
        assert!(check("missing", None).unwrap_err().has(ViolationKind::Forbidden));
    }

    #[test]
    fn test_signature_checked_once() {
        use std::cell::Cell;

        struct Counting(Cell<u32>);
        impl TransitionVerifier for Counting {
            fn verify(&self, _: &PublicKey, _: &Transition<'_>) -> Result<(), SignatureError> {
                self.0.set(self.0.get() + 1);
                Ok(())
            }
        }

        let counting = Counting(Cell::new(0));
        let mut new = previous();
        new["balance"] = json!(1);
        new["owner"] = json!(key(1).to_hex().to_uppercase());
        new["frozen"] = json!(true);
        let _ = validate_set_decorators(&program(), "Account", &new, &previous(), Some(&key(1)), &counting);
        assert_eq!(counting.0.get(), 1);

        let unsigned = Counting(Cell::new(0));
        let new = with(previous(), "label", json!("x"));
        let _ = validate_set_decorators(&program(), "Account", &new, &previous(), Some(&key(1)), &unsigned);
        assert_eq!(unsigned.0.get(), 0);
    }
}
