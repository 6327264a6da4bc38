//! Error types for the ingestion and query pipeline.
//!
//! | Error | Scope | Handling |
//! |-------|-------|----------|
//! | [`ParseError`] | one input line | dropped and counted, ingestion continues |
//! | [`IngestError`] | one chunk | chunk fails, other chunks are unaffected |
//! | digest changed under a guarded insert | one record | re-checked inside the write, then touched or inserted |
//! | [`CryptoError`] | one record | counted in `failed_records`, which fails [`IngestReport::ensure_complete`](crate::ingest::IngestReport::ensure_complete) |
//! | [`QueryError::NotFound`] | one query | surfaced to the caller |

use uuid::Uuid;

/// Failures of the backing store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("{entity} '{value}' already exists")]
    Duplicate { entity: &'static str, value: String },

    #[error("stored row is corrupt: {0}")]
    Corrupt(String),

    #[error("store backend unavailable: {0}")]
    Unavailable(String),
}

/// Failures of the credential schemes.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("cipher failure: {0}")]
    Cipher(String),

    #[error("invalid cipher key: {0}")]
    InvalidKey(String),

    #[error("credential of kind '{0}' needs a cipher key, but none is configured")]
    MissingKey(&'static str),
}

/// A malformed input line.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("line {line}: not valid CSV: {reason}")]
    Csv { line: u64, reason: String },

    #[error("line {line}: expected 2 fields, found {found}")]
    FieldCount { line: u64, found: usize },

    #[error("line {line}: empty {field}")]
    EmptyField { line: u64, field: &'static str },
}

/// Failures that abort one chunk or the ingestion call as a whole.
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("failed to read input stream: {0}")]
    Io(#[from] std::io::Error),

    #[error("lookup failed: {0}")]
    Lookup(#[source] StoreError),

    #[error("commit failed: {0}")]
    Commit(#[source] StoreError),

    #[error("could not open store session: {0}")]
    Session(#[source] StoreError),

    #[error("hashing task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("ingestion incomplete: {failed_chunks} of {chunks} chunks failed, {failed_records} records dropped")]
    Incomplete {
        failed_chunks: usize,
        chunks: usize,
        failed_records: usize,
    },
}

/// Failures of the query and customer surfaces.
#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    #[error("{entity} with ID {id} not found")]
    NotFound { entity: &'static str, id: Uuid },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("{0}")]
    Conflict(String),

    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for QueryError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Duplicate { .. } => QueryError::Conflict(err.to_string()),
            other => QueryError::Store(other),
        }
    }
}
