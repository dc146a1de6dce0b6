//! Webhook payload signing and verification
//!
//! The signed payload is `"{timestamp}.{body}"`; the signature header value
//! is `v1=<hex(HMAC-SHA256(secret, signed_payload))>`. Verification is
//! exported for client SDKs: constant-time comparison plus a timestamp
//! tolerance window against replay.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// Default verification tolerance (seconds)
pub const DEFAULT_TOLERANCE_S: u64 = 300;

/// Sign a body at a unix-seconds timestamp
pub fn generate_signature(body: &str, secret: &str, timestamp: i64) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts keys of any length");
    mac.update(format!("{}.{}", timestamp, body).as_bytes());
    format!("v1={}", hex::encode(mac.finalize().into_bytes()))
}

/// Verify a signature produced by [`generate_signature`].
///
/// Returns true iff the signature matches (compared in constant time) and
/// `|now - timestamp| <= tolerance_s`.
pub fn verify_webhook_signature(
    body: &str,
    signature: &str,
    secret: &str,
    timestamp: i64,
    tolerance_s: u64,
    now: i64,
) -> bool {
    if now.abs_diff(timestamp) > tolerance_s {
        return false;
    }
    let expected = generate_signature(body, secret, timestamp);
    expected.as_bytes().ct_eq(signature.as_bytes()).into()
}
