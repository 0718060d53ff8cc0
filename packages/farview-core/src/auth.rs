//! Challenge-response authentication.
//!
//! The primary sends `AUTH_CHALLENGE|salt=…`; the viewer answers with
//! HMAC-SHA256 keyed by the UTF-8 password bytes over the UTF-8 salt bytes,
//! rendered as lowercase hex.

use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::utils::to_lower_hex;

type HmacSha256 = Hmac<Sha256>;

/// Computes the AUTH_RESPONSE hash for a challenge salt.
#[must_use]
pub fn challenge_response(password: &str, salt: &str) -> String {
    // HMAC accepts keys of any length; new_from_slice cannot fail for SHA-256.
    let mut mac = HmacSha256::new_from_slice(password.as_bytes())
        .expect("HMAC-SHA256 accepts any key length");
    mac.update(salt.as_bytes());
    to_lower_hex(&mac.finalize().into_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    // RFC 4231 test case 2: key "Jefe", data "what do ya want for nothing?".
    #[test]
    fn matches_rfc4231_vector() {
        let hash = challenge_response("Jefe", "what do ya want for nothing?");
        assert_eq!(
            hash,
            "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
    }

    #[test]
    fn output_is_lowercase_hex() {
        let hash = challenge_response("pw", "abc");
        assert_eq!(hash.len(), 64);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn different_salts_differ() {
        assert_ne!(challenge_response("pw", "a"), challenge_response("pw", "b"));
    }
}
