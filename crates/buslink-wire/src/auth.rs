//! Shared-secret authentication of the handshake.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Generate the HMAC-SHA256 signature over `nonce + credential`.
pub fn sign(secret: &str, nonce: &str, credential: &str) -> String {
    // HMAC accepts keys of any length, so this cannot fail.
    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return String::new(),
    };
    mac.update(nonce.as_bytes());
    mac.update(credential.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Verify a signature using constant-time comparison.
pub fn verify(secret: &str, nonce: &str, credential: &str, signature: &str) -> bool {
    let expected = sign(secret, nonce, credential);
    !expected.is_empty()
        && subtle::ConstantTimeEq::ct_eq(expected.as_bytes(), signature.as_bytes()).into()
}

/// Fresh nonce for an outgoing `Auth` frame.
pub fn nonce() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_verify() {
        let sig = sign("secret", "n-1", "partner");
        assert_eq!(sig.len(), 64);
        assert!(verify("secret", "n-1", "partner", &sig));
    }

    #[test]
    fn test_wrong_secret_or_credential() {
        let sig = sign("secret", "n-1", "partner");
        assert!(!verify("other", "n-1", "partner", &sig));
        assert!(!verify("secret", "n-1", "intruder", &sig));
        assert!(!verify("secret", "n-2", "partner", &sig));
        assert!(!verify("secret", "n-1", "partner", ""));
    }
}
