//! HMAC-SHA256 payload signing.
//!
//! Deliveries to subscribers with a secret carry
//! `X-Outpost-Signature-256: sha256=<hex>`, computed over the exact request
//! body bytes. [`verify_signature`] is the receiving side of the same scheme.

use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::{DeliveryError, Result};

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the payload signature.
pub const SIGNATURE_HEADER: &str = "X-Outpost-Signature-256";

const SIGNATURE_PREFIX: &str = "sha256=";

/// Lowercase hex HMAC-SHA256 of `payload` keyed by `secret`.
///
/// # Errors
///
/// Returns a configuration error if the key is rejected.
pub fn generate_hmac_hex(payload: &[u8], secret: &str) -> Result<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| DeliveryError::configuration(format!("invalid signing secret: {e}")))?;
    mac.update(payload);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Signature header value for `payload`: `sha256=<hex>`.
///
/// # Errors
///
/// Returns a configuration error if the key is rejected.
pub fn sign_payload(payload: &[u8], secret: &str) -> Result<String> {
    Ok(format!("{SIGNATURE_PREFIX}{}", generate_hmac_hex(payload, secret)?))
}

/// Checks a received signature against `payload`.
///
/// Accepts `sha256=<hex>` or 64 raw hex characters. Comparison is constant
/// time in the signature length.
pub fn verify_signature(payload: &[u8], signature: &str, secret: &str) -> bool {
    if secret.is_empty() {
        return false;
    }
    let Some(received) = parse_signature(signature.trim()) else {
        return false;
    };
    generate_hmac_hex(payload, secret)
        .map(|expected| timing_safe_eq(&received.to_ascii_lowercase(), &expected))
        .unwrap_or(false)
}

fn parse_signature(signature: &str) -> Option<&str> {
    let hex = signature.strip_prefix(SIGNATURE_PREFIX).unwrap_or(signature);
    (hex.len() == 64 && hex.chars().all(|c| c.is_ascii_hexdigit())).then_some(hex)
}

/// Constant-time string equality.
pub fn timing_safe_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.bytes().zip(b.bytes()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
