//! Digest engine: email digests, salted password digests, salts, and
//! display obfuscation.
//!
//! Every function here is stateless and safe to call from any number of
//! threads at once. Salt generation goes through [`SaltSource`] so the
//! chunk processor can be driven with a deterministic source in tests.
//!
//! The password path is SHA-512 over `salt ‖ password` with a 16-byte
//! CSPRNG salt. This is a fast hash: it is only acceptable because every
//! record carries its own salt, so precomputed tables are useless and
//! brute force has to be repeated per record. Deployments that need
//! reversible-by-operator material use the keyed cipher scheme in
//! [`credential`](crate::credential) instead.

use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha512};

use crate::models::{EmailDigest, EMAIL_DIGEST_LEN, SALT_LEN};

/// Character used to mask every other password character.
const OBFUSCATION_CHAR: char = '*';

/// Digest of the trimmed, lower-cased email.
pub fn digest_email(email: &str) -> EmailDigest {
    let normalized = email.trim().to_lowercase();
    let hash = Sha512::digest(normalized.as_bytes());
    let mut bytes = [0u8; EMAIL_DIGEST_LEN];
    bytes.copy_from_slice(&hash);
    EmailDigest::from_bytes(bytes)
}

/// SHA-512 over `salt ‖ password_bytes` (salt first).
pub fn digest_password(password: &str, salt: &[u8]) -> Vec<u8> {
    let mut hasher = Sha512::new();
    hasher.update(salt);
    hasher.update(password.as_bytes());
    hasher.finalize().to_vec()
}

/// Fresh salt from the operating system CSPRNG.
pub fn generate_salt() -> [u8; SALT_LEN] {
    let mut salt = [0u8; SALT_LEN];
    OsRng.fill_bytes(&mut salt);
    salt
}

/// Supplier of per-record salts.
pub trait SaltSource: Send + Sync {
    fn next_salt(&self) -> [u8; SALT_LEN];
}

/// Production salt source backed by [`generate_salt`].
#[derive(Debug, Default, Clone, Copy)]
pub struct OsSaltSource;

impl SaltSource for OsSaltSource {
    fn next_salt(&self) -> [u8; SALT_LEN] {
        generate_salt()
    }
}

/// Masks characters at even positions: `"password"` → `"*a*s*o*d"`.
///
/// Display only. Never used for matching.
pub fn obfuscate(password: &str) -> String {
    password
        .chars()
        .enumerate()
        .map(|(i, c)| if i % 2 == 0 { OBFUSCATION_CHAR } else { c })
        .collect()
}

/// Best-effort domain of an email address.
///
/// Everything after the last `@`, trimmed and lower-cased, without a
/// trailing dot. Empty when the address has no `@`.
pub fn domain_of(email: &str) -> String {
    match email.rsplit_once('@') {
        Some((_, host)) => host.trim().trim_end_matches('.').to_lowercase(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_email_digest_ignores_case_and_whitespace() {
        assert_eq!(
            digest_email("User@Example.com "),
            digest_email("user@example.com")
        );
        assert_eq!(
            digest_email("\tUSER@EXAMPLE.COM"),
            digest_email("user@example.com")
        );
        assert_ne!(digest_email("user@example.com"), digest_email("user@example.org"));
    }

    #[test]
    fn test_email_digest_length() {
        assert_eq!(digest_email("a@b.c").as_bytes().len(), 64);
    }

    #[test]
    fn test_password_digest_deterministic_for_fixed_salt() {
        let salt = [9u8; SALT_LEN];
        assert_eq!(
            digest_password("hunter2", &salt),
            digest_password("hunter2", &salt)
        );
        assert_ne!(
            digest_password("hunter2", &salt),
            digest_password("hunter3", &salt)
        );
    }

    #[test]
    fn test_password_digest_differs_per_salt() {
        let a = digest_password("hunter2", &[1u8; SALT_LEN]);
        let b = digest_password("hunter2", &[2u8; SALT_LEN]);
        assert_ne!(a, b);
    }

    #[test]
    fn test_salt_first_concatenation() {
        let salt = b"0123456789abcdef";
        let expected = Sha512::digest(b"0123456789abcdefpw").to_vec();
        assert_eq!(digest_password("pw", salt), expected);
    }

    #[test]
    fn test_generated_salts_are_distinct() {
        let a = generate_salt();
        let b = OsSaltSource.next_salt();
        assert_ne!(a, b);
    }

    #[test]
    fn test_obfuscate_shape() {
        assert_eq!(obfuscate("password"), "*a*s*o*d");
        assert_eq!(obfuscate(""), "");
        assert_eq!(obfuscate("x"), "*");
        assert_eq!(obfuscate("pässwörd").chars().count(), 8);
    }

    #[test]
    fn test_domain_of() {
        assert_eq!(domain_of("bob@Test.com"), "test.com");
        assert_eq!(domain_of("odd@name@host.org."), "host.org");
        assert_eq!(domain_of("no-at-sign"), "");
        assert_eq!(domain_of("trailing@"), "");
    }
}
