//! Client identity hashing and secret comparison.
//!
//! The server never keys a pool by the raw client id: the id is mixed with
//! the shared secret (HMAC-SHA256) so a stored pool key reveals neither the
//! secret nor the identity.

use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// Derive the pool key for a client id under the given secret.
///
/// Deterministic: the same `(secret, client_id)` always yields the same key,
/// and changing either input changes the output.
pub fn hash_key_id(secret: &str, client_id: &str) -> String {
    // new_from_slice only fails on oversized keys, which HMAC accepts anyway.
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .expect("HMAC accepts keys of any length");
    mac.update(client_id.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Constant-time comparison of two secrets.
///
/// Both inputs are digested first so the comparison touches fixed-length,
/// attacker-independent data, and the digests are compared without
/// short-circuiting.
pub fn secrets_match(provided: &str, expected: &str) -> bool {
    let provided = Sha256::digest(provided.as_bytes());
    let expected = Sha256::digest(expected.as_bytes());
    provided.ct_eq(&expected).into()
}
