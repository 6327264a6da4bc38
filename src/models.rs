//! Core data models used throughout Leak Monitor.
//!
//! These types represent the credentials, leak records, domains, and
//! customers that flow through the ingestion and query pipeline.

use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use uuid::Uuid;

/// Length in bytes of an email digest (SHA-512).
pub const EMAIL_DIGEST_LEN: usize = 64;

/// Length in bytes of a per-record password salt.
pub const SALT_LEN: usize = 16;

/// Length in bytes of a ChaCha20-Poly1305 nonce.
pub const NONCE_LEN: usize = 12;

/// A single credential pair parsed from an input line.
///
/// The email is trimmed and lower-cased, the password is trimmed.
/// Never persisted as-is.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IngestionRecord {
    pub email: String,
    pub password: String,
}

impl IngestionRecord {
    /// Builds a normalized record from raw field values.
    pub fn new(email: &str, password: &str) -> Self {
        Self {
            email: email.trim().to_lowercase(),
            password: password.trim().to_string(),
        }
    }
}

/// Irreversible digest of a normalized email address.
///
/// Compared and hashed by content, so it can key lookup maps directly.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EmailDigest([u8; EMAIL_DIGEST_LEN]);

impl EmailDigest {
    pub fn from_bytes(bytes: [u8; EMAIL_DIGEST_LEN]) -> Self {
        Self(bytes)
    }

    /// Builds a digest from a stored blob. Returns `None` on a length mismatch.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let arr: [u8; EMAIL_DIGEST_LEN] = bytes.try_into().ok()?;
        Some(Self(arr))
    }

    pub fn as_bytes(&self) -> &[u8; EMAIL_DIGEST_LEN] {
        &self.0
    }

    /// Displayable base64 form used in query responses.
    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.0)
    }
}

impl fmt::Debug for EmailDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EmailDigest({})", self.to_base64())
    }
}

/// Opaque identity of a stored leak.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct LeakId(pub Uuid);

impl LeakId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for LeakId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for LeakId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Password verification material stored with a leak.
///
/// Which variant gets minted depends on the deployment's
/// [`CredentialScheme`](crate::credential::CredentialScheme); matching only
/// ever goes through the scheme's `verify`.
#[derive(Clone, PartialEq, Eq)]
pub enum Credential {
    /// SHA-512 over salt‖password.
    SaltedDigest {
        salt: [u8; SALT_LEN],
        digest: Vec<u8>,
    },
    /// ChaCha20-Poly1305 ciphertext under an externally held key.
    KeyedCipher {
        nonce: [u8; NONCE_LEN],
        ciphertext: Vec<u8>,
    },
}

impl Credential {
    /// Stable tag persisted alongside the material.
    pub fn kind(&self) -> &'static str {
        match self {
            Credential::SaltedDigest { .. } => "salted-digest",
            Credential::KeyedCipher { .. } => "keyed-cipher",
        }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Material stays out of logs.
        write!(f, "Credential({})", self.kind())
    }
}

/// Lightweight customer reference carried on leaks and domains.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct CustomerRef {
    pub id: Uuid,
    pub name: String,
}

/// Persistent, privacy-preserving record of one observed (email, password) pair.
#[derive(Debug, Clone)]
pub struct LeakRecord {
    pub id: LeakId,
    pub email_digest: EmailDigest,
    pub credential: Credential,
    pub obfuscated_password: String,
    pub domain: String,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub customers: Vec<CustomerRef>,
}

/// A monitored domain and the customers interested in it.
#[derive(Debug, Clone)]
pub struct DomainRecord {
    pub id: Uuid,
    pub name: String,
    pub customers: Vec<CustomerRef>,
}

/// A customer and the domains it monitors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CustomerRecord {
    pub id: Uuid,
    pub name: String,
    pub domains: Vec<String>,
}

/// Customer entry inside a [`LeakSummary`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CustomerSummary {
    pub id: Uuid,
    pub name: String,
}

/// Query response shape for one leak. Never carries the plaintext password.
#[derive(Debug, Clone, Serialize)]
pub struct LeakSummary {
    pub id: LeakId,
    pub email_hash: String,
    pub obfuscated_password: String,
    pub domain: String,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub customers: Vec<CustomerSummary>,
}

impl From<&LeakRecord> for LeakSummary {
    fn from(leak: &LeakRecord) -> Self {
        Self {
            id: leak.id,
            email_hash: leak.email_digest.to_base64(),
            obfuscated_password: leak.obfuscated_password.clone(),
            domain: leak.domain.clone(),
            first_seen: leak.first_seen,
            last_seen: leak.last_seen,
            customers: leak
                .customers
                .iter()
                .map(|c| CustomerSummary {
                    id: c.id,
                    name: c.name.clone(),
                })
                .collect(),
        }
    }
}
