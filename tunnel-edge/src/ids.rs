//! Identifier utilities (spec.md §4.1): subdomain normalization and
//! validation, the reserved-name list, and cryptographically-random
//! subdomain/token generation. Tokens are hashed with SHA-256 before
//! storage and compared in constant time.

use rand::rngs::OsRng;
use rand::Rng;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

/// Subdomains that would otherwise collide with the edge's own surfaces
/// (admin API, dashboard, well-known infra names). Extendable.
pub const RESERVED_SUBDOMAINS: &[&str] = &[
    "api", "admin", "www", "dashboard", "app", "status", "mail", "ftp", "test", "staging",
    "webhook",
];

const SUBDOMAIN_CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// Lowercases a candidate subdomain. This is the only normalization step —
/// callers validate with [`is_valid`] afterward.
pub fn normalize(s: &str) -> String {
    s.to_lowercase()
}

/// `true` iff `s` is 3–63 characters of `[a-z0-9-]`, has no leading or
/// trailing hyphen, and is not in [`RESERVED_SUBDOMAINS`].
pub fn is_valid(s: &str) -> bool {
    if s.len() < 3 || s.len() > 63 {
        return false;
    }
    if s.starts_with('-') || s.ends_with('-') {
        return false;
    }
    if !s.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-') {
        return false;
    }
    !RESERVED_SUBDOMAINS.contains(&s)
}

/// Draws an `n`-character candidate over `[a-z0-9]` from a cryptographic
/// RNG. Used for auto-generated subdomains and saved names.
pub fn random_subdomain(n: usize) -> String {
    let mut rng = OsRng;
    (0..n)
        .map(|_| {
            let idx = rng.random_range(0..SUBDOMAIN_CHARSET.len());
            SUBDOMAIN_CHARSET[idx] as char
        })
        .collect()
}

/// Generates a 32-byte random auth token, hex-encoded.
pub fn random_token() -> String {
    let mut rng = OsRng;
    let bytes: [u8; 32] = rng.random();
    hex_encode(&bytes)
}

/// Hashes a token with SHA-256, the form it is compared and stored in.
pub fn hash_token(token: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hasher.finalize().into()
}

/// Constant-time comparison of two equal-length byte slices.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.ct_eq(b).into()
}

fn hex_encode(bytes: &[u8]) -> String {
    use std::fmt::Write;
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        write!(s, "{:02x}", b).expect("writing to a String cannot fail");
    }
    s
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_lowercases() {
        assert_eq!(normalize("MyApp"), "myapp");
    }

    #[test]
    fn valid_subdomains() {
        assert!(is_valid("myapp"));
        assert!(is_valid("my-app-123"));
        assert!(is_valid("abc"));
    }

    #[test]
    fn rejects_bad_length_hyphens_and_reserved() {
        assert!(!is_valid("ab"));
        assert!(!is_valid(&"a".repeat(64)));
        assert!(!is_valid("-myapp"));
        assert!(!is_valid("myapp-"));
        assert!(!is_valid("My_App"));
        assert!(!is_valid("admin"));
    }

    #[test]
    fn random_subdomain_has_requested_length_and_charset() {
        let s = random_subdomain(8);
        assert_eq!(s.len(), 8);
        assert!(s.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
    }

    #[test]
    fn token_hash_is_constant_time_comparable() {
        let token = random_token();
        let hash_a = hash_token(&token);
        let hash_b = hash_token(&token);
        assert!(constant_time_eq(&hash_a, &hash_b));
        assert!(!constant_time_eq(&hash_a, &hash_token("other")));
    }
}
