use hmac::{Hmac, KeyInit, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// HMAC-SHA256 signer scoped to one application's key pair.
#[derive(Debug, Clone)]
pub struct Token {
    pub key: String,
    pub secret: String,
}

impl Token {
    pub fn new(key: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            secret: secret.into(),
        }
    }

    /// Lowercase-hex HMAC-SHA256 of `data` under the app secret.
    pub fn sign(&self, data: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes())
            .expect("HMAC accepts keys of any length");
        mac.update(data.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    pub fn verify(&self, data: &str, signature: &str) -> bool {
        secure_compare(&self.sign(data), signature)
    }
}

/// Constant-time string comparison. Length leaks; contents do not.
pub fn secure_compare(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.bytes().zip(b.bytes()) {
        diff |= x ^ y;
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_is_deterministic_lowercase_hex() {
        let token = Token::new("app-key", "app-secret");
        let sig = token.sign("1234.5678:private-room");
        assert_eq!(sig, token.sign("1234.5678:private-room"));
        assert_eq!(sig.len(), 64);
        assert!(sig.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn verify_rejects_tampered_signature() {
        let token = Token::new("app-key", "app-secret");
        let sig = token.sign("1234.5678:private-room");
        assert!(token.verify("1234.5678:private-room", &sig));

        // Flip one hex digit.
        let mut bad = sig.clone().into_bytes();
        bad[0] = if bad[0] == b'a' { b'b' } else { b'a' };
        let bad = String::from_utf8(bad).unwrap();
        assert!(!token.verify("1234.5678:private-room", &bad));
    }

    #[test]
    fn secure_compare_handles_length_mismatch() {
        assert!(secure_compare("abc", "abc"));
        assert!(!secure_compare("abc", "abd"));
        assert!(!secure_compare("abc", "abcd"));
        assert!(secure_compare("", ""));
    }
}
