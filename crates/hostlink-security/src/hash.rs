//! Nonce, digest and header helpers.

use rand::RngCore;
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

/// Security headers attached to every outbound HTTP request.
pub const SECURITY_HEADERS: [(&str, &str); 4] = [
    ("X-Content-Type-Options", "nosniff"),
    ("X-Frame-Options", "DENY"),
    ("Cache-Control", "no-store"),
    (
        "Strict-Transport-Security",
        "max-age=31536000; includeSubDomains",
    ),
];

/// Generate `len` bytes of OS randomness, hex-encoded.
pub fn generate_nonce(len: usize) -> String {
    let mut bytes = vec![0u8; len];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Lowercase hex SHA-256 digest of `data`.
pub fn sha256_hex(data: impl AsRef<[u8]>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data.as_ref());
    format!("{:x}", hasher.finalize())
}

/// Compare two strings without early exit on the first differing byte.
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

/// The standard security header pairs.
pub const fn security_headers() -> &'static [(&'static str, &'static str)] {
    &SECURITY_HEADERS
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nonce_length_is_twice_byte_count() {
        assert_eq!(generate_nonce(16).len(), 32);
        assert_eq!(generate_nonce(0).len(), 0);
    }

    #[test]
    fn nonces_differ() {
        assert_ne!(generate_nonce(32), generate_nonce(32));
    }

    #[test]
    fn sha256_known_vector() {
        assert_eq!(
            sha256_hex("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn constant_time_comparison() {
        assert!(constant_time_eq("token-a", "token-a"));
        assert!(!constant_time_eq("token-a", "token-b"));
        assert!(!constant_time_eq("short", "longer-value"));
    }

    #[test]
    fn headers_include_nosniff() {
        assert!(
            security_headers()
                .iter()
                .any(|(k, v)| *k == "X-Content-Type-Options" && *v == "nosniff")
        );
    }
}
