//! Verification key derivation (spec.md §4.G).
//!
//! Must reproduce the algorithm exactly: the two certs' SPKI DER hex are
//! sorted then reversed (larger hex first) so the result is symmetric in
//! argument order, hashed together with the second-granularity timestamp,
//! and the first 8 hex chars of the digest are uppercased.

use sha2::{Digest, Sha256};

use crate::crypto::public_key_der_hex;
use crate::error::{ProtocolError, Result};

pub fn generate_verification_key(
    our_cert_pem: &str,
    peer_cert_pem: &str,
    timestamp_ms: i64,
) -> Result<String> {
    let h1 = public_key_der_hex(our_cert_pem)?;
    let h2 = public_key_der_hex(peer_cert_pem)?;

    let mut sorted = [h1, h2];
    sorted.sort();
    sorted.reverse();

    let first = hex::decode(&sorted[0])
        .map_err(|e| ProtocolError::InvalidIdentity(format!("bad public key hex: {e}")))?;
    let second = hex::decode(&sorted[1])
        .map_err(|e| ProtocolError::InvalidIdentity(format!("bad public key hex: {e}")))?;

    let mut hasher = Sha256::new();
    hasher.update(&first);
    hasher.update(&second);
    hasher.update((timestamp_ms / 1000).to_string().as_bytes());

    let digest = hasher.finalize();
    Ok(hex::encode(digest)[..8].to_uppercase())
}
