use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "X-Webhook-Signature";
const SIGNATURE_PREFIX: &str = "sha256=";

/// Lowercase hex HMAC-SHA256 of `body` keyed with `secret`.
pub fn sign(secret: &str, body: &[u8]) -> String {
    // HMAC accepts keys of any length, including empty.
    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(m) => m,
        Err(_) => unreachable!("HMAC-SHA256 takes keys of any length"),
    };
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

/// Value for the `X-Webhook-Signature` header: `sha256=<64 hex chars>`.
pub fn signature_header_value(secret: &str, body: &[u8]) -> String {
    format!("{}{}", SIGNATURE_PREFIX, sign(secret, body))
}

/// Checks an inbound signature against the raw received body.
///
/// Accepts `sha256=<hex>` or bare hex. Malformed input yields `false`.
/// The digest comparison is constant-time.
pub fn verify_signature(body: &[u8], signature: &str, secret: &str) -> bool {
    let signature = signature.trim();
    let expected_hex = signature
        .strip_prefix(SIGNATURE_PREFIX)
        .unwrap_or(signature);

    let expected = match hex::decode(expected_hex) {
        Ok(bytes) => bytes,
        Err(_) => return false,
    };

    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(m) => m,
        Err(_) => return false,
    };
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}
