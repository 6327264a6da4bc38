//! Schema creation. Every statement is idempotent, so `leakmon init` can be
//! re-run safely against an existing database.

use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS leaks (
        id TEXT PRIMARY KEY,
        email_digest BLOB NOT NULL,
        credential_kind TEXT NOT NULL,
        credential_iv BLOB NOT NULL,
        credential_secret BLOB NOT NULL,
        obfuscated_password TEXT NOT NULL,
        domain TEXT NOT NULL,
        first_seen INTEGER NOT NULL,
        last_seen INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS domains (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL UNIQUE
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS customers (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL UNIQUE
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS customer_domains (
        customer_id TEXT NOT NULL REFERENCES customers(id) ON DELETE CASCADE,
        domain_id TEXT NOT NULL REFERENCES domains(id) ON DELETE CASCADE,
        PRIMARY KEY (customer_id, domain_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS leak_customers (
        leak_id TEXT NOT NULL REFERENCES leaks(id) ON DELETE CASCADE,
        customer_id TEXT NOT NULL REFERENCES customers(id) ON DELETE CASCADE,
        PRIMARY KEY (leak_id, customer_id)
    )
    "#,
    // Single-row counter bumped by every guarded insert. The bump is the
    // first statement of the transaction so the write lock is taken before
    // any row counts are read.
    r#"
    CREATE TABLE IF NOT EXISTS insert_epoch (
        id INTEGER PRIMARY KEY CHECK (id = 1),
        epoch INTEGER NOT NULL
    )
    "#,
    "INSERT OR IGNORE INTO insert_epoch (id, epoch) VALUES (1, 0)",
    "CREATE INDEX IF NOT EXISTS idx_leaks_email_digest ON leaks(email_digest)",
    "CREATE INDEX IF NOT EXISTS idx_leaks_domain_first_seen ON leaks(domain, first_seen DESC)",
    "CREATE INDEX IF NOT EXISTS idx_customer_domains_domain ON customer_domains(domain_id)",
    "CREATE INDEX IF NOT EXISTS idx_leak_customers_customer ON leak_customers(customer_id)",
];

/// Apply the schema to an open pool.
pub async fn migrate_pool(pool: &SqlitePool) -> Result<()> {
    for statement in SCHEMA {
        sqlx::query(statement).execute(pool).await?;
    }
    Ok(())
}

/// Connect using `config`, apply the schema, and close the pool.
pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    migrate_pool(&pool).await?;
    pool.close().await;
    Ok(())
}
