//! HMAC-SHA256 payload signing.
//!
//! The signature is computed over the exact bytes placed on the wire, never
//! over a re-serialization, so receivers can verify it byte-for-byte.

use hmac::{Hmac, Mac};
use rand::RngCore;
use rand::rngs::OsRng;
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::error::WebhookError;

type HmacSha256 = Hmac<Sha256>;

/// Compute the lowercase hex HMAC-SHA256 of `body` keyed with `secret`.
///
/// Deterministic and side-effect free. The only failure is an unusable key
/// (empty secret).
pub fn sign(secret: &str, body: &[u8]) -> Result<String, WebhookError> {
    if secret.is_empty() {
        return Err(WebhookError::SigningKey("secret must not be empty".to_string()));
    }

    let mut mac = <HmacSha256 as Mac>::new_from_slice(secret.as_bytes())
        .map_err(|e| WebhookError::SigningKey(e.to_string()))?;
    mac.update(body);

    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Check a received signature in constant time.
///
/// This is what a receiver does; it is exposed for tests and for tenants
/// embedding this crate.
pub fn verify(secret: &str, body: &[u8], signature_hex: &str) -> bool {
    match sign(secret, body) {
        Ok(computed) => computed.as_bytes().ct_eq(signature_hex.as_bytes()).into(),
        Err(_) => false,
    }
}

/// Generate `len` random bytes from the OS CSPRNG, hex-encoded.
///
/// Used for shared secrets, verify tokens and handshake challenges.
pub fn random_hex(len: usize) -> String {
    let mut bytes = vec![0u8; len];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}
