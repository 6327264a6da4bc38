//! Password verification material.
//!
//! A [`CredentialScheme`] mints [`Credential`]s for new leaks and checks a
//! candidate plaintext against stored material. The chunk processor only
//! talks to this trait, so switching a deployment between salted digests
//! and keyed ciphertext does not touch the matching algorithm.
//!
//! Minting follows the active scheme; verification follows the stored
//! variant. Salted digests verify under either scheme. Keyed ciphertext
//! verifies whenever a cipher key is configured, so rows written before a
//! scheme switch keep matching.

use std::sync::Arc;

use anyhow::{bail, Context};
use base64::{engine::general_purpose::STANDARD, Engine};
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha512};

use crate::config::{CredentialsConfig, SchemeKind};
use crate::digest::{digest_password, OsSaltSource, SaltSource};
use crate::error::CryptoError;
use crate::models::{Credential, NONCE_LEN};

/// Length in bytes of the keyed-cipher key.
pub const CIPHER_KEY_LEN: usize = 32;

/// Deployment-selected way of protecting and verifying passwords.
pub trait CredentialScheme: Send + Sync {
    /// Name of the variant this scheme mints.
    fn name(&self) -> &'static str;

    /// Protect a plaintext password for a new leak record.
    fn protect(&self, password: &str) -> Result<Credential, CryptoError>;

    /// Does `password` match the stored material, whichever variant it is?
    fn verify(&self, credential: &Credential, password: &str) -> Result<bool, CryptoError>;
}

/// Check `password` against a salted digest.
pub fn verify_salted_digest(salt: &[u8], digest: &[u8], password: &str) -> bool {
    digest_password(password, salt).as_slice() == digest
}

/// Salted SHA-512 digests with a fresh salt per record.
///
/// Keyed ciphertext left by an earlier deployment verifies when a cipher
/// is attached with [`with_cipher`](Self::with_cipher).
pub struct SaltedDigestScheme {
    salts: Arc<dyn SaltSource>,
    cipher: Option<KeyedCipherScheme>,
}

impl SaltedDigestScheme {
    pub fn new(salts: Arc<dyn SaltSource>) -> Self {
        Self {
            salts,
            cipher: None,
        }
    }

    pub fn with_cipher(mut self, cipher: KeyedCipherScheme) -> Self {
        self.cipher = Some(cipher);
        self
    }
}

impl Default for SaltedDigestScheme {
    fn default() -> Self {
        Self::new(Arc::new(OsSaltSource))
    }
}

impl CredentialScheme for SaltedDigestScheme {
    fn name(&self) -> &'static str {
        "salted-digest"
    }

    fn protect(&self, password: &str) -> Result<Credential, CryptoError> {
        let salt = self.salts.next_salt();
        let digest = digest_password(password, &salt);
        Ok(Credential::SaltedDigest { salt, digest })
    }

    fn verify(&self, credential: &Credential, password: &str) -> Result<bool, CryptoError> {
        match credential {
            Credential::SaltedDigest { salt, digest } => {
                Ok(verify_salted_digest(salt, digest, password))
            }
            Credential::KeyedCipher { .. } => match &self.cipher {
                Some(cipher) => cipher.verify(credential, password),
                None => Err(CryptoError::MissingKey(credential.kind())),
            },
        }
    }
}

/// ChaCha20-Poly1305 ciphertext under a key held outside the store.
pub struct KeyedCipherScheme {
    cipher: ChaCha20Poly1305,
}

impl KeyedCipherScheme {
    pub fn new(key: &[u8; CIPHER_KEY_LEN]) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(Key::from_slice(key)),
        }
    }

    /// Build from a base64-encoded 32-byte key.
    pub fn from_base64_key(encoded: &str) -> Result<Self, CryptoError> {
        let raw = STANDARD
            .decode(encoded.trim())
            .map_err(|e| CryptoError::InvalidKey(format!("not base64: {}", e)))?;
        let key: [u8; CIPHER_KEY_LEN] = raw.as_slice().try_into().map_err(|_| {
            CryptoError::InvalidKey(format!(
                "expected {} bytes, got {}",
                CIPHER_KEY_LEN,
                raw.len()
            ))
        })?;
        Ok(Self::new(&key))
    }
}

impl CredentialScheme for KeyedCipherScheme {
    fn name(&self) -> &'static str {
        "keyed-cipher"
    }

    fn protect(&self, password: &str) -> Result<Credential, CryptoError> {
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);
        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), password.as_bytes())
            .map_err(|e| CryptoError::Cipher(e.to_string()))?;
        Ok(Credential::KeyedCipher { nonce, ciphertext })
    }

    fn verify(&self, credential: &Credential, password: &str) -> Result<bool, CryptoError> {
        match credential {
            Credential::KeyedCipher { nonce, ciphertext } => {
                let plaintext = self
                    .cipher
                    .decrypt(Nonce::from_slice(nonce), ciphertext.as_slice())
                    .map_err(|e| CryptoError::Cipher(e.to_string()))?;
                // Compare digests so the check does not short-circuit on a prefix.
                Ok(Sha512::digest(&plaintext) == Sha512::digest(password.as_bytes()))
            }
            Credential::SaltedDigest { salt, digest } => {
                Ok(verify_salted_digest(salt, digest, password))
            }
        }
    }
}

/// Build the scheme configured in `[credentials]`.
///
/// The cipher key is read from the environment variable named by
/// `key_env`, never from the config file itself. It is required for
/// `keyed-cipher`; under `salted-digest` it is optional and only used to
/// verify keyed rows already in the store.
pub fn scheme_from_config(config: &CredentialsConfig) -> anyhow::Result<Arc<dyn CredentialScheme>> {
    let cipher = cipher_from_env(&config.key_env)?;
    match (config.scheme, cipher) {
        (SchemeKind::SaltedDigest, None) => Ok(Arc::new(SaltedDigestScheme::default())),
        (SchemeKind::SaltedDigest, Some(cipher)) => {
            Ok(Arc::new(SaltedDigestScheme::default().with_cipher(cipher)))
        }
        (SchemeKind::KeyedCipher, Some(cipher)) => Ok(Arc::new(cipher)),
        (SchemeKind::KeyedCipher, None) => bail!(
            "credentials.scheme is keyed-cipher but ${} is not set",
            config.key_env
        ),
    }
}

fn cipher_from_env(key_env: &str) -> anyhow::Result<Option<KeyedCipherScheme>> {
    let encoded = match std::env::var(key_env) {
        Ok(value) if !value.trim().is_empty() => value,
        _ => return Ok(None),
    };
    let cipher = KeyedCipherScheme::from_base64_key(&encoded)
        .with_context(|| format!("invalid cipher key in ${}", key_env))?;
    Ok(Some(cipher))
}
