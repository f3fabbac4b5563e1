//! Caller identity and signature strategies
//!
//! The engine never decides what bytes a caller signs. That is fixed by the
//! host's protocol and plugged in through [`TransitionVerifier`]. Two
//! strategies ship with the crate:
//!
//! - [`Ed25519Verifier`] checks a detached ed25519 signature over a payload
//!   the host supplies, or derives from the [`Transition`] with a closure.
//! - [`TrustedCaller`] accepts any key, for hosts that authenticated the
//!   caller before reaching the engine.

use std::str::FromStr;

use ed25519_dalek::{Signature, VerifyingKey};
use serde::{Serialize, Serializer};

/// A 32-byte ed25519 public key, written as 64 hex characters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PublicKey([u8; 32]);

impl PublicKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        PublicKey(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyError {
    #[error("invalid hex in public key: {0}")]
    Hex(String),

    #[error("public key must be 32 bytes, found {0}")]
    Length(usize),
}

impl FromStr for PublicKey {
    type Err = KeyError;

    /// Accepts lowercase or uppercase hex with an optional `0x` prefix
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits = s.strip_prefix("0x").unwrap_or(s);
        let bytes = hex::decode(digits).map_err(|e| KeyError::Hex(e.to_string()))?;
        let len = bytes.len();
        let array: [u8; 32] = bytes.try_into().map_err(|_| KeyError::Length(len))?;
        Ok(PublicKey(array))
    }
}

impl std::fmt::Display for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl Serialize for PublicKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

// ── Transitions ────────────────────────────────────────────

/// What the caller is asking permission for
///
/// `function` is set when a function call is being authorized; `next` is
/// `Null` in that case.
#[derive(Debug, Clone, Copy)]
pub struct Transition<'a> {
    pub contract: &'a str,
    pub function: Option<&'a str>,
    pub previous: &'a serde_json::Value,
    pub next: &'a serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SignatureError {
    #[error("malformed signature: {0}")]
    Malformed(String),

    #[error("public key is not a valid ed25519 point")]
    InvalidKey,

    #[error("signature does not verify against the presented key")]
    Mismatch,
}

/// Decides whether `key` really authorized `transition`
pub trait TransitionVerifier {
    fn verify(&self, key: &PublicKey, transition: &Transition<'_>) -> Result<(), SignatureError>;
}

/// Accepts every key
#[derive(Debug, Clone, Copy, Default)]
pub struct TrustedCaller;

impl TransitionVerifier for TrustedCaller {
    fn verify(&self, _key: &PublicKey, _transition: &Transition<'_>) -> Result<(), SignatureError> {
        Ok(())
    }
}

// ── Ed25519 ────────────────────────────────────────────────

/// The bytes a caller signed
pub trait SigningPayload {
    fn payload(&self, transition: &Transition<'_>) -> Vec<u8>;
}

/// Payload supplied verbatim by the host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetachedPayload(pub Vec<u8>);

impl SigningPayload for DetachedPayload {
    fn payload(&self, _transition: &Transition<'_>) -> Vec<u8> {
        self.0.clone()
    }
}

impl<F> SigningPayload for F
where
    F: Fn(&Transition<'_>) -> Vec<u8>,
{
    fn payload(&self, transition: &Transition<'_>) -> Vec<u8> {
        self(transition)
    }
}

/// Detached ed25519 signature over a host-defined payload
pub struct Ed25519Verifier<P> {
    signature: Signature,
    payload: P,
}

impl<P: SigningPayload> Ed25519Verifier<P> {
    pub fn new(signature: &[u8], payload: P) -> Result<Self, SignatureError> {
        let signature =
            Signature::from_slice(signature).map_err(|e| SignatureError::Malformed(e.to_string()))?;
        Ok(Ed25519Verifier { signature, payload })
    }

    /// Signature given as 128 hex characters, optional `0x`
    pub fn from_hex(signature: &str, payload: P) -> Result<Self, SignatureError> {
        let digits = signature.strip_prefix("0x").unwrap_or(signature);
        let bytes = hex::decode(digits).map_err(|e| SignatureError::Malformed(e.to_string()))?;
        Self::new(&bytes, payload)
    }
}

impl<P: SigningPayload> TransitionVerifier for Ed25519Verifier<P> {
    fn verify(&self, key: &PublicKey, transition: &Transition<'_>) -> Result<(), SignatureError> {
        let verifying_key =
            VerifyingKey::from_bytes(key.as_bytes()).map_err(|_| SignatureError::InvalidKey)?;
        let message = self.payload.payload(transition);
        verifying_key
            .verify_strict(&message, &self.signature)
            .map_err(|_| SignatureError::Mismatch)
    }
}
