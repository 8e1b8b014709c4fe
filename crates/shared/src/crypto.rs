//! Cryptographic utilities for invitation codes and session keys.

use rand::Rng;
use sha2::{Digest, Sha256};

/// Characters used for invitation codes. Uppercase alphanumeric, avoiding
/// the easily confused 0, O, I and 1.
pub const INVITATION_CODE_CHARSET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

/// Characters used for opaque session keys.
const SESSION_KEY_CHARSET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZabcdefghjkmnpqrstuvwxyz23456789";

/// Length of generated session keys.
pub const SESSION_KEY_LENGTH: usize = 32;

/// Computes SHA-256 hash of the input and returns it as a hex string.
pub fn sha256_hex(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
}

/// Generates a random string of `length` characters drawn from `charset`.
///
/// Uses the thread-local CSPRNG.
pub fn random_string(length: usize, charset: &[u8]) -> String {
    let mut rng = rand::thread_rng();
    (0..length)
        .map(|_| {
            let idx = rng.gen_range(0..charset.len());
            charset[idx] as char
        })
        .collect()
}

/// Generates an invitation code of the given length.
pub fn generate_invitation_code(length: usize) -> String {
    random_string(length, INVITATION_CODE_CHARSET)
}

/// Generates an opaque key for a server-side session.
pub fn generate_session_key() -> String {
    random_string(SESSION_KEY_LENGTH, SESSION_KEY_CHARSET)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha256_hex() {
        let hash = sha256_hex("test");
        assert_eq!(hash.len(), 64);
        assert_eq!(
            hash,
            "9f86d081884c7d659a2feaa0c55ad015a3bf4f1b2b0b822cd15d6c15b0f00a08"
        );
    }

    #[test]
    fn test_sha256_hex_empty_string() {
        assert_eq!(
            sha256_hex(""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_generate_invitation_code_length_and_charset() {
        for length in 6..=10 {
            let code = generate_invitation_code(length);
            assert_eq!(code.len(), length);
            for c in code.chars() {
                assert!(c.is_ascii_uppercase() || c.is_ascii_digit(), "Invalid char: {}", c);
                assert!(c != 'O' && c != 'I' && c != '0' && c != '1');
            }
        }
    }

    #[test]
    fn test_generate_invitation_code_uniqueness() {
        let codes: std::collections::HashSet<String> =
            (0..100).map(|_| generate_invitation_code(10)).collect();
        assert!(codes.len() >= 99);
    }

    #[test]
    fn test_generate_session_key() {
        let key = generate_session_key();
        assert_eq!(key.len(), SESSION_KEY_LENGTH);
        assert!(!key.contains('0'));
        assert!(!key.contains('l'));
        assert_ne!(key, generate_session_key());
    }
}
