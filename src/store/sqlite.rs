//! SQLite-backed [`Store`] implementation.
//!
//! Each [`SqliteSession`] owns one pooled connection for its lifetime.
//! Multi-statement writes run inside a `sqlx` transaction, so a session
//! dropped mid-write rolls back before the connection returns to the pool.
//!
//! Timestamps are stored as UTC milliseconds. `IN (...)` lists are built
//! with [`QueryBuilder`] and split into batches of [`BIND_BATCH`].

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::pool::PoolConnection;
use sqlx::sqlite::SqliteRow;
use sqlx::{Connection, QueryBuilder, Row, Sqlite, SqliteConnection, SqlitePool};
use uuid::Uuid;

use crate::error::StoreError;
use crate::models::{
    Credential, CustomerRecord, CustomerRef, DomainRecord, EmailDigest, LeakId, LeakRecord,
    NONCE_LEN, SALT_LEN,
};

use super::{oldest_first, InsertGuard, InsertOutcome, Store, StoreSession, StoreStats};

/// Maximum number of bound values per `IN (...)` list.
const BIND_BATCH: usize = 500;

const LEAK_COLUMNS: &str = "id, email_digest, credential_kind, credential_iv, credential_secret, \
                            obfuscated_password, domain, first_seen, last_seen";

/// SQLite implementation of the [`Store`] trait.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn session(&self) -> Result<Box<dyn StoreSession>, StoreError> {
        let conn = self.pool.acquire().await?;
        Ok(Box::new(SqliteSession { conn }))
    }
}

/// One pooled connection, held until the session is dropped.
pub struct SqliteSession {
    conn: PoolConnection<Sqlite>,
}

fn corrupt(what: &str, detail: impl std::fmt::Display) -> StoreError {
    StoreError::Corrupt(format!("{}: {}", what, detail))
}

fn to_millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>, StoreError> {
    DateTime::from_timestamp_millis(ms).ok_or_else(|| corrupt("timestamp out of range", ms))
}

fn parse_uuid(raw: &str) -> Result<Uuid, StoreError> {
    Uuid::parse_str(raw).map_err(|e| corrupt("bad uuid", e))
}

fn map_unique(err: sqlx::Error, entity: &'static str, value: &str) -> StoreError {
    match &err {
        sqlx::Error::Database(db) if db.is_unique_violation() => StoreError::Duplicate {
            entity,
            value: value.to_string(),
        },
        _ => StoreError::Database(err),
    }
}

/// Split a credential into (kind, iv, secret) columns.
fn encode_credential(credential: &Credential) -> (&'static str, Vec<u8>, Vec<u8>) {
    match credential {
        Credential::SaltedDigest { salt, digest } => {
            (credential.kind(), salt.to_vec(), digest.clone())
        }
        Credential::KeyedCipher { nonce, ciphertext } => {
            (credential.kind(), nonce.to_vec(), ciphertext.clone())
        }
    }
}

fn decode_credential(kind: &str, iv: Vec<u8>, secret: Vec<u8>) -> Result<Credential, StoreError> {
    match kind {
        "salted-digest" => {
            let salt: [u8; SALT_LEN] = iv
                .as_slice()
                .try_into()
                .map_err(|_| corrupt("salt length", iv.len()))?;
            Ok(Credential::SaltedDigest {
                salt,
                digest: secret,
            })
        }
        "keyed-cipher" => {
            let nonce: [u8; NONCE_LEN] = iv
                .as_slice()
                .try_into()
                .map_err(|_| corrupt("nonce length", iv.len()))?;
            Ok(Credential::KeyedCipher {
                nonce,
                ciphertext: secret,
            })
        }
        other => Err(corrupt("unknown credential kind", other)),
    }
}

fn leak_from_row(row: &SqliteRow) -> Result<LeakRecord, StoreError> {
    let id: String = row.try_get("id")?;
    let digest: Vec<u8> = row.try_get("email_digest")?;
    let kind: String = row.try_get("credential_kind")?;

    Ok(LeakRecord {
        id: LeakId(parse_uuid(&id)?),
        email_digest: EmailDigest::from_slice(&digest)
            .ok_or_else(|| corrupt("email digest length", digest.len()))?,
        credential: decode_credential(
            &kind,
            row.try_get("credential_iv")?,
            row.try_get("credential_secret")?,
        )?,
        obfuscated_password: row.try_get("obfuscated_password")?,
        domain: row.try_get("domain")?,
        first_seen: from_millis(row.try_get("first_seen")?)?,
        last_seen: from_millis(row.try_get("last_seen")?)?,
        customers: Vec::new(),
    })
}

/// Every stored leak for one digest, oldest first, without customers.
async fn leaks_for_digest(
    conn: &mut SqliteConnection,
    digest: &EmailDigest,
) -> Result<Vec<LeakRecord>, StoreError> {
    let sql = format!("SELECT {} FROM leaks WHERE email_digest = ?", LEAK_COLUMNS);
    let rows = sqlx::query(&sql)
        .bind(digest.as_bytes().to_vec())
        .fetch_all(&mut *conn)
        .await?;

    let mut leaks = rows
        .iter()
        .map(leak_from_row)
        .collect::<Result<Vec<_>, _>>()?;
    oldest_first(&mut leaks);
    Ok(leaks)
}

/// Customers linked to each of `leaks`, attached in name order.
async fn attach_customers(
    conn: &mut SqliteConnection,
    leaks: &mut [LeakRecord],
) -> Result<(), StoreError> {
    let mut links: HashMap<LeakId, Vec<CustomerRef>> = HashMap::new();
    let ids: Vec<String> = leaks.iter().map(|l| l.id.to_string()).collect();

    for batch in ids.chunks(BIND_BATCH) {
        let mut qb = QueryBuilder::<Sqlite>::new(
            "SELECT lc.leak_id, c.id, c.name FROM leak_customers lc \
             JOIN customers c ON c.id = lc.customer_id WHERE lc.leak_id IN (",
        );
        let mut sep = qb.separated(", ");
        for id in batch {
            sep.push_bind(id.clone());
        }
        sep.push_unseparated(") ORDER BY c.name");

        for row in qb.build().fetch_all(&mut *conn).await? {
            let leak_id: String = row.try_get(0)?;
            let customer_id: String = row.try_get(1)?;
            links
                .entry(LeakId(parse_uuid(&leak_id)?))
                .or_default()
                .push(CustomerRef {
                    id: parse_uuid(&customer_id)?,
                    name: row.try_get(2)?,
                });
        }
    }

    for leak in leaks.iter_mut() {
        if let Some(customers) = links.remove(&leak.id) {
            leak.customers = customers;
        }
    }
    Ok(())
}

/// Domain names for each customer in `ids`, sorted by name.
async fn customer_domains(
    conn: &mut SqliteConnection,
    ids: &[Uuid],
) -> Result<HashMap<Uuid, Vec<String>>, StoreError> {
    let mut out: HashMap<Uuid, Vec<String>> = HashMap::new();
    for batch in ids.chunks(BIND_BATCH) {
        let mut qb = QueryBuilder::<Sqlite>::new(
            "SELECT cd.customer_id, d.name FROM customer_domains cd \
             JOIN domains d ON d.id = cd.domain_id WHERE cd.customer_id IN (",
        );
        let mut sep = qb.separated(", ");
        for id in batch {
            sep.push_bind(id.to_string());
        }
        sep.push_unseparated(") ORDER BY d.name");

        for row in qb.build().fetch_all(&mut *conn).await? {
            let customer_id: String = row.try_get(0)?;
            out.entry(parse_uuid(&customer_id)?)
                .or_default()
                .push(row.try_get(1)?);
        }
    }
    Ok(out)
}

/// Insert missing domains and point `customer_id` at exactly `domains`.
async fn set_customer_domains(
    conn: &mut SqliteConnection,
    customer_id: Uuid,
    domains: &[String],
) -> Result<(), StoreError> {
    sqlx::query("DELETE FROM customer_domains WHERE customer_id = ?")
        .bind(customer_id.to_string())
        .execute(&mut *conn)
        .await?;

    for name in domains {
        sqlx::query("INSERT OR IGNORE INTO domains (id, name) VALUES (?, ?)")
            .bind(Uuid::new_v4().to_string())
            .bind(name)
            .execute(&mut *conn)
            .await?;

        sqlx::query(
            "INSERT OR IGNORE INTO customer_domains (customer_id, domain_id) \
             SELECT ?, id FROM domains WHERE name = ?",
        )
        .bind(customer_id.to_string())
        .bind(name)
        .execute(&mut *conn)
        .await?;
    }
    Ok(())
}

impl SqliteSession {
    async fn load_customer(&mut self, id: Uuid) -> Result<Option<CustomerRecord>, StoreError> {
        let row = sqlx::query("SELECT name FROM customers WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&mut *self.conn)
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let mut domains = customer_domains(&mut self.conn, &[id]).await?;
        Ok(Some(CustomerRecord {
            id,
            name: row.try_get("name")?,
            domains: domains.remove(&id).unwrap_or_default(),
        }))
    }
}

#[async_trait]
impl StoreSession for SqliteSession {
    async fn find_leaks_by_email_digests(
        &mut self,
        digests: &[EmailDigest],
    ) -> Result<Vec<LeakRecord>, StoreError> {
        let mut leaks = Vec::new();
        for batch in digests.chunks(BIND_BATCH) {
            let mut qb = QueryBuilder::<Sqlite>::new(format!(
                "SELECT {} FROM leaks WHERE email_digest IN (",
                LEAK_COLUMNS
            ));
            let mut sep = qb.separated(", ");
            for digest in batch {
                sep.push_bind(digest.as_bytes().to_vec());
            }
            sep.push_unseparated(")");

            for row in qb.build().fetch_all(&mut *self.conn).await? {
                leaks.push(leak_from_row(&row)?);
            }
        }
        attach_customers(&mut self.conn, &mut leaks).await?;
        Ok(leaks)
    }

    async fn find_domains_by_names(
        &mut self,
        names: &[String],
    ) -> Result<Vec<DomainRecord>, StoreError> {
        let mut domains = Vec::new();
        for batch in names.chunks(BIND_BATCH) {
            let mut qb = QueryBuilder::<Sqlite>::new("SELECT id, name FROM domains WHERE name IN (");
            let mut sep = qb.separated(", ");
            for name in batch {
                sep.push_bind(name.clone());
            }
            sep.push_unseparated(")");

            for row in qb.build().fetch_all(&mut *self.conn).await? {
                let id: String = row.try_get("id")?;
                domains.push(DomainRecord {
                    id: parse_uuid(&id)?,
                    name: row.try_get("name")?,
                    customers: Vec::new(),
                });
            }
        }

        let mut links: HashMap<Uuid, Vec<CustomerRef>> = HashMap::new();
        let ids: Vec<String> = domains.iter().map(|d| d.id.to_string()).collect();
        for batch in ids.chunks(BIND_BATCH) {
            let mut qb = QueryBuilder::<Sqlite>::new(
                "SELECT cd.domain_id, c.id, c.name FROM customer_domains cd \
                 JOIN customers c ON c.id = cd.customer_id WHERE cd.domain_id IN (",
            );
            let mut sep = qb.separated(", ");
            for id in batch {
                sep.push_bind(id.clone());
            }
            sep.push_unseparated(") ORDER BY c.name");

            for row in qb.build().fetch_all(&mut *self.conn).await? {
                let domain_id: String = row.try_get(0)?;
                let customer_id: String = row.try_get(1)?;
                links
                    .entry(parse_uuid(&domain_id)?)
                    .or_default()
                    .push(CustomerRef {
                        id: parse_uuid(&customer_id)?,
                        name: row.try_get(2)?,
                    });
            }
        }

        for domain in &mut domains {
            if let Some(customers) = links.remove(&domain.id) {
                domain.customers = customers;
            }
        }
        Ok(domains)
    }

    async fn bulk_insert(
        &mut self,
        leaks: Vec<LeakRecord>,
        guard: &InsertGuard,
    ) -> Result<InsertOutcome, StoreError> {
        let mut outcome = InsertOutcome::default();
        if leaks.is_empty() {
            return Ok(outcome);
        }

        let mut tx = self.conn.begin().await?;

        // Take the write lock before reading counts.
        sqlx::query("UPDATE insert_epoch SET epoch = epoch + 1 WHERE id = 1")
            .execute(&mut *tx)
            .await?;

        let mut digests: Vec<EmailDigest> = leaks.iter().map(|l| l.email_digest).collect();
        digests.sort();
        digests.dedup();

        let mut current: HashMap<EmailDigest, usize> = HashMap::new();
        for batch in digests.chunks(BIND_BATCH) {
            let mut qb = QueryBuilder::<Sqlite>::new(
                "SELECT email_digest, COUNT(*) FROM leaks WHERE email_digest IN (",
            );
            let mut sep = qb.separated(", ");
            for digest in batch {
                sep.push_bind(digest.as_bytes().to_vec());
            }
            sep.push_unseparated(") GROUP BY email_digest");

            for row in qb.build().fetch_all(&mut *tx).await? {
                let raw: Vec<u8> = row.try_get(0)?;
                let count: i64 = row.try_get(1)?;
                let digest = EmailDigest::from_slice(&raw)
                    .ok_or_else(|| corrupt("email digest length", raw.len()))?;
                current.insert(digest, count as usize);
            }
        }

        let mut rows_by_digest: HashMap<EmailDigest, Vec<LeakRecord>> = HashMap::new();
        for leak in leaks {
            let now = current.get(&leak.email_digest).copied().unwrap_or(0);
            if now != guard.expected(&leak.email_digest) {
                let Some(resolver) = guard.resolver() else {
                    outcome.conflicts.push(leak);
                    continue;
                };
                outcome.rechecked += 1;

                if !rows_by_digest.contains_key(&leak.email_digest) {
                    let rows = leaks_for_digest(&mut *tx, &leak.email_digest).await?;
                    rows_by_digest.insert(leak.email_digest, rows);
                }
                let rows = rows_by_digest
                    .get(&leak.email_digest)
                    .map(Vec::as_slice)
                    .unwrap_or_default();

                if let Some(id) = resolver.resolve(&leak, rows) {
                    outcome.touched += sqlx::query("UPDATE leaks SET last_seen = ? WHERE id = ?")
                        .bind(to_millis(leak.last_seen))
                        .bind(id.to_string())
                        .execute(&mut *tx)
                        .await?
                        .rows_affected() as usize;
                    continue;
                }
            }

            let (kind, iv, secret) = encode_credential(&leak.credential);
            sqlx::query(
                r#"
                INSERT INTO leaks (id, email_digest, credential_kind, credential_iv,
                                   credential_secret, obfuscated_password, domain,
                                   first_seen, last_seen)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(leak.id.to_string())
            .bind(leak.email_digest.as_bytes().to_vec())
            .bind(kind)
            .bind(iv)
            .bind(secret)
            .bind(&leak.obfuscated_password)
            .bind(&leak.domain)
            .bind(to_millis(leak.first_seen))
            .bind(to_millis(leak.last_seen))
            .execute(&mut *tx)
            .await?;

            for customer in &leak.customers {
                sqlx::query(
                    "INSERT OR IGNORE INTO leak_customers (leak_id, customer_id) \
                     SELECT ?, id FROM customers WHERE id = ?",
                )
                .bind(leak.id.to_string())
                .bind(customer.id.to_string())
                .execute(&mut *tx)
                .await?;
            }

            outcome.inserted += 1;
        }

        tx.commit().await?;
        Ok(outcome)
    }

    async fn bulk_touch_last_seen(
        &mut self,
        ids: &[LeakId],
        at: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        if ids.is_empty() {
            return Ok(0);
        }

        let mut tx = self.conn.begin().await?;
        let mut touched = 0;
        for batch in ids.chunks(BIND_BATCH) {
            let mut qb = QueryBuilder::<Sqlite>::new("UPDATE leaks SET last_seen = ");
            qb.push_bind(to_millis(at));
            qb.push(" WHERE id IN (");
            let mut sep = qb.separated(", ");
            for id in batch {
                sep.push_bind(id.to_string());
            }
            sep.push_unseparated(")");
            touched += qb.build().execute(&mut *tx).await?.rows_affected();
        }
        tx.commit().await?;
        Ok(touched)
    }

    async fn find_leaks_by_domains(
        &mut self,
        domains: &[String],
    ) -> Result<Vec<LeakRecord>, StoreError> {
        let mut leaks = Vec::new();
        for batch in domains.chunks(BIND_BATCH) {
            let mut qb = QueryBuilder::<Sqlite>::new(format!(
                "SELECT {} FROM leaks WHERE domain IN (",
                LEAK_COLUMNS
            ));
            let mut sep = qb.separated(", ");
            for domain in batch {
                sep.push_bind(domain.clone());
            }
            sep.push_unseparated(")");

            for row in qb.build().fetch_all(&mut *self.conn).await? {
                leaks.push(leak_from_row(&row)?);
            }
        }
        // Batches are merged, so order here rather than in SQL.
        leaks.sort_by(|a, b| b.first_seen.cmp(&a.first_seen).then(a.id.cmp(&b.id)));
        attach_customers(&mut self.conn, &mut leaks).await?;
        Ok(leaks)
    }

    async fn link_customer(
        &mut self,
        customer_id: Uuid,
        leak_ids: &[LeakId],
    ) -> Result<u64, StoreError> {
        if leak_ids.is_empty() {
            return Ok(0);
        }

        let mut tx = self.conn.begin().await?;
        let mut created = 0;
        for id in leak_ids {
            created += sqlx::query(
                "INSERT OR IGNORE INTO leak_customers (leak_id, customer_id) \
                 SELECT l.id, c.id FROM leaks l, customers c WHERE l.id = ? AND c.id = ?",
            )
            .bind(id.to_string())
            .bind(customer_id.to_string())
            .execute(&mut *tx)
            .await?
            .rows_affected();
        }
        tx.commit().await?;
        Ok(created)
    }

    async fn create_customer(
        &mut self,
        name: &str,
        domains: &[String],
    ) -> Result<CustomerRecord, StoreError> {
        let id = Uuid::new_v4();
        let mut tx = self.conn.begin().await?;

        sqlx::query("INSERT INTO customers (id, name) VALUES (?, ?)")
            .bind(id.to_string())
            .bind(name)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_unique(e, "customer", name))?;

        set_customer_domains(&mut *tx, id, domains).await?;
        tx.commit().await?;

        self.load_customer(id)
            .await?
            .ok_or_else(|| corrupt("customer vanished after insert", id))
    }

    async fn list_customers(&mut self) -> Result<Vec<CustomerRecord>, StoreError> {
        let rows = sqlx::query("SELECT id, name FROM customers ORDER BY name")
            .fetch_all(&mut *self.conn)
            .await?;

        let mut customers = Vec::with_capacity(rows.len());
        for row in &rows {
            let id: String = row.try_get("id")?;
            customers.push(CustomerRecord {
                id: parse_uuid(&id)?,
                name: row.try_get("name")?,
                domains: Vec::new(),
            });
        }

        let ids: Vec<Uuid> = customers.iter().map(|c| c.id).collect();
        let mut domains = customer_domains(&mut self.conn, &ids).await?;
        for customer in &mut customers {
            customer.domains = domains.remove(&customer.id).unwrap_or_default();
        }
        Ok(customers)
    }

    async fn get_customer(&mut self, id: Uuid) -> Result<Option<CustomerRecord>, StoreError> {
        self.load_customer(id).await
    }

    async fn update_customer(
        &mut self,
        id: Uuid,
        name: &str,
        domains: &[String],
    ) -> Result<Option<CustomerRecord>, StoreError> {
        let mut tx = self.conn.begin().await?;

        let updated = sqlx::query("UPDATE customers SET name = ? WHERE id = ?")
            .bind(name)
            .bind(id.to_string())
            .execute(&mut *tx)
            .await
            .map_err(|e| map_unique(e, "customer", name))?
            .rows_affected();

        if updated == 0 {
            return Ok(None);
        }

        set_customer_domains(&mut *tx, id, domains).await?;
        tx.commit().await?;

        self.load_customer(id).await
    }

    async fn delete_customer(&mut self, id: Uuid) -> Result<bool, StoreError> {
        let deleted = sqlx::query("DELETE FROM customers WHERE id = ?")
            .bind(id.to_string())
            .execute(&mut *self.conn)
            .await?
            .rows_affected();
        Ok(deleted > 0)
    }

    async fn stats(&mut self) -> Result<StoreStats, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT
                (SELECT COUNT(*) FROM leaks) AS leaks,
                (SELECT COUNT(*) FROM domains) AS domains,
                (SELECT COUNT(*) FROM customers) AS customers,
                (SELECT COUNT(*) FROM leak_customers) AS customer_links
            "#,
        )
        .fetch_one(&mut *self.conn)
        .await?;

        Ok(StoreStats {
            leaks: row.try_get::<i64, _>("leaks")? as u64,
            domains: row.try_get::<i64, _>("domains")? as u64,
            customers: row.try_get::<i64, _>("customers")? as u64,
            customer_links: row.try_get::<i64, _>("customer_links")? as u64,
        })
    }
}
