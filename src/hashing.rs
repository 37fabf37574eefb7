//! Hashing System - SHA-256 for Artifacts and Jobs, PBKDF2 for Credentials
//!
//! Content hashes identify artifact bytes. Job hashes make an edit request
//! auditable: the same request against the same input always hashes the same.

use hmac::Hmac;
use pbkdf2::pbkdf2;
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fmt::Write as _;
use subtle::ConstantTimeEq;

/// PBKDF2 rounds for newly sealed credentials
pub const CREDENTIAL_ITERATIONS: u32 = 100_000;

/// Lowercase hex of SHA-256(data)
pub fn sha256_hex(data: &[u8]) -> String {
    to_hex(&Sha256::digest(data))
}

/// Serialize with every object's keys in byte order and no whitespace.
pub fn canonical_json<T: Serialize>(value: &T) -> Result<String, serde_json::Error> {
    serde_json::to_string(&canonicalize(serde_json::to_value(value)?))
}

fn canonicalize(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map.into_iter().collect();
            entries.sort_unstable_by(|(a, _), (b, _)| a.cmp(b));
            Value::Object(
                entries
                    .into_iter()
                    .map(|(key, inner)| (key, canonicalize(inner)))
                    .collect(),
            )
        }
        Value::Array(items) => Value::Array(items.into_iter().map(canonicalize).collect()),
        scalar => scalar,
    }
}

/// Hash of stored artifact bytes
pub fn content_hash(bytes: &[u8]) -> String {
    sha256_hex(bytes)
}

/// Compute job hash for audit logging
/// job_hash = sha256(input_ref + canonical_operation + engine_version)
pub fn compute_job_hash(
    input_ref: &str,
    operation: &impl Serialize,
    engine_version: &str,
) -> Result<String, serde_json::Error> {
    let canonical_operation = canonical_json(operation)?;
    let combined = format!("{}:{}:{}", input_ref, canonical_operation, engine_version);
    Ok(sha256_hex(combined.as_bytes()))
}

/// PBKDF2-HMAC-SHA256 of `secret`, 32 bytes, hex encoded.
///
/// `None` only if the PRF rejects the key, which HMAC never does.
pub fn credential_hash(salt: &str, secret: &str, iterations: u32) -> Option<String> {
    let mut key = [0u8; 32];
    pbkdf2::<Hmac<Sha256>>(secret.as_bytes(), salt.as_bytes(), iterations, &mut key).ok()?;
    Some(to_hex(&key))
}

/// Constant-time comparison of two hex digests
pub fn digest_eq(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().fold(String::with_capacity(bytes.len() * 2), |mut out, b| {
        let _ = write!(out, "{:02x}", b);
        out
    })
}
