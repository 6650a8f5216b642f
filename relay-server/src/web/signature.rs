//! Webhook signature verification.
//!
//! The platform signs each webhook delivery with HMAC-SHA256 over the raw
//! request body, keyed by the app secret, and sends it as
//! `X-Hub-Signature-256: sha256=<hex digest>`.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use tracing::warn;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "x-hub-signature-256";

const SIGNATURE_PREFIX: &str = "sha256=";

/// Verify an `X-Hub-Signature-256` header value against the raw body.
///
/// Returns `false` for a missing header, a header without the `sha256=`
/// prefix, or a digest that does not match.
pub fn verify_hub_signature(app_secret: &str, body: &[u8], header: Option<&str>) -> bool {
    let Some(header) = header else {
        warn!("webhook_signature_missing");
        return false;
    };

    let Some(provided) = header.trim().strip_prefix(SIGNATURE_PREFIX) else {
        warn!("webhook_signature_malformed");
        return false;
    };

    let mut mac = match HmacSha256::new_from_slice(app_secret.as_bytes()) {
        Ok(m) => m,
        Err(_) => {
            warn!("webhook_signature_invalid_key");
            return false;
        }
    };
    mac.update(body);

    let expected = hex::encode(mac.finalize().into_bytes());
    let valid = constant_time_compare(&expected, &provided.to_ascii_lowercase());

    if !valid {
        warn!(
            expected_length = expected.len(),
            actual_length = provided.len(),
            body_length = body.len(),
            "webhook_signature_mismatch"
        );
    }

    valid
}

/// Constant-time string comparison to prevent timing attacks.
fn constant_time_compare(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut result = 0u8;
    for (x, y) in a.bytes().zip(b.bytes()) {
        result |= x ^ y;
    }
    result == 0
}

/// Signature checking is on only when a non-blank app secret is configured.
pub fn is_signature_verification_enabled(app_secret: &Option<String>) -> bool {
    app_secret
        .as_ref()
        .map(|k| !k.trim().is_empty())
        .unwrap_or(false)
}

#[cfg(test)]
pub(crate) fn sign(app_secret: &str, body: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(app_secret.as_bytes()).unwrap();
    mac.update(body);
    format!("{SIGNATURE_PREFIX}{}", hex::encode(mac.finalize().into_bytes()))
}
