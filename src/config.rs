//! TOML configuration.
//!
//! ```toml
//! [db]
//! path = "./data/leaks.sqlite"
//!
//! [ingest]
//! max_chunks = 20
//! max_parallel_chunks = 8
//!
//! [credentials]
//! scheme = "salted-digest"   # or "keyed-cipher"
//! key_env = "LEAKMON_CIPHER_KEY"
//!
//! [server]
//! bind = "127.0.0.1:8080"
//!
//! [logging]
//! level = "info"
//! json = false
//! ```
//!
//! Only `[db].path` is required; every other key has a default.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub credentials: CredentialsConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_busy_timeout_secs")]
    pub busy_timeout_secs: u64,
}

fn default_max_connections() -> u32 {
    8
}
fn default_busy_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct IngestConfig {
    /// Target number of partitions per ingestion run.
    #[serde(default = "default_max_chunks")]
    pub max_chunks: usize,
    /// Chunks processed concurrently.
    #[serde(default = "default_max_parallel_chunks")]
    pub max_parallel_chunks: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            max_chunks: default_max_chunks(),
            max_parallel_chunks: default_max_parallel_chunks(),
        }
    }
}

fn default_max_chunks() -> usize {
    20
}
fn default_max_parallel_chunks() -> usize {
    8
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum SchemeKind {
    #[default]
    SaltedDigest,
    KeyedCipher,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CredentialsConfig {
    #[serde(default)]
    pub scheme: SchemeKind,
    /// Environment variable holding the base64 cipher key.
    #[serde(default = "default_key_env")]
    pub key_env: String,
}

impl Default for CredentialsConfig {
    fn default() -> Self {
        Self {
            scheme: SchemeKind::default(),
            key_env: default_key_env(),
        }
    }
}

fn default_key_env() -> String {
    "LEAKMON_CIPHER_KEY".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            max_upload_bytes: default_max_upload_bytes(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:8080".to_string()
}
fn default_max_upload_bytes() -> usize {
    256 * 1024 * 1024
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            json: false,
        }
    }
}

fn default_level() -> String {
    "info".to_string()
}

impl Config {
    /// Config with defaults everywhere and the given database path.
    pub fn with_db_path(path: impl Into<PathBuf>) -> Self {
        Self {
            db: DbConfig {
                path: path.into(),
                max_connections: default_max_connections(),
                busy_timeout_secs: default_busy_timeout_secs(),
            },
            ingest: IngestConfig::default(),
            credentials: CredentialsConfig::default(),
            server: ServerConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    parse_config(&content)
}

/// Parse and validate configuration text.
pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;

    if config.db.max_connections == 0 {
        anyhow::bail!("db.max_connections must be > 0");
    }

    if config.ingest.max_chunks == 0 {
        anyhow::bail!("ingest.max_chunks must be > 0");
    }

    if config.ingest.max_parallel_chunks == 0 {
        anyhow::bail!("ingest.max_parallel_chunks must be > 0");
    }

    if config.credentials.scheme == SchemeKind::KeyedCipher
        && config.credentials.key_env.trim().is_empty()
    {
        anyhow::bail!("credentials.key_env must be set when scheme is 'keyed-cipher'");
    }

    if config.server.max_upload_bytes == 0 {
        anyhow::bail!("server.max_upload_bytes must be > 0");
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config_gets_defaults() {
        let cfg = parse_config("[db]\npath = \"/tmp/x.sqlite\"\n").unwrap();
        assert_eq!(cfg.ingest.max_chunks, 20);
        assert_eq!(cfg.ingest.max_parallel_chunks, 8);
        assert_eq!(cfg.credentials.scheme, SchemeKind::SaltedDigest);
        assert_eq!(cfg.credentials.key_env, "LEAKMON_CIPHER_KEY");
        assert_eq!(cfg.server.bind, "127.0.0.1:8080");
        assert!(!cfg.logging.json);
    }

    #[test]
    fn test_keyed_cipher_scheme_parses() {
        let cfg = parse_config(
            "[db]\npath = \"x.sqlite\"\n[credentials]\nscheme = \"keyed-cipher\"\nkey_env = \"MY_KEY\"\n",
        )
        .unwrap();
        assert_eq!(cfg.credentials.scheme, SchemeKind::KeyedCipher);
        assert_eq!(cfg.credentials.key_env, "MY_KEY");
    }

    #[test]
    fn test_zero_chunks_rejected() {
        let err = parse_config("[db]\npath = \"x\"\n[ingest]\nmax_chunks = 0\n").unwrap_err();
        assert!(err.to_string().contains("max_chunks"));
    }

    #[test]
    fn test_unknown_scheme_rejected() {
        assert!(parse_config("[db]\npath = \"x\"\n[credentials]\nscheme = \"rot13\"\n").is_err());
    }
}
