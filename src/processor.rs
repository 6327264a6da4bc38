//! Chunk processor: decides, for one partition, which input records are
//! new leaks and which re-observe an existing one, then commits both
//! write sets through the chunk's own store session.
//!
//! # Phases
//!
//! 1. **Precompute**: collapse exact repeats, then digest each distinct
//!    email and extract its domain (rayon, on a blocking thread).
//! 2. **Lookup**: bulk-fetch leaks by digest and domains by name.
//! 3. **Decide**: per record, in input order, verify the password against
//!    each candidate for its digest (oldest `first_seen` first). The first
//!    match is touched; otherwise a new leak is minted with the domain's
//!    customers attached.
//! 4. **Commit**: one set-based last-seen update, then a guarded insert.
//!    A record whose digest gained rows since the lookup is verified
//!    against the digest's current rows inside the insert's write lock,
//!    then touched or inserted. Nothing is dropped for losing a race.
//!
//! Exact `(email, password)` repeats are dropped before any work, so a
//! chunk never mints the same pair twice.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use rayon::prelude::*;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::credential::CredentialScheme;
use crate::digest::{digest_email, domain_of, obfuscate};
use crate::error::IngestError;
use crate::models::{CustomerRef, EmailDigest, IngestionRecord, LeakId, LeakRecord};
use crate::store::{oldest_first, ConflictResolver, InsertGuard, StoreSession};

/// Counters for one processed chunk.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChunkReport {
    pub records: usize,
    pub inserted: usize,
    pub touched: usize,
    /// Records whose password could not be protected.
    pub failed: usize,
    /// Records re-checked because a concurrent writer added rows for their email.
    pub rechecked: usize,
    /// The chunk stopped before committing because cancellation fired.
    pub cancelled: bool,
}

/// A new leak together with the input record it was minted from.
#[derive(Debug, Clone)]
pub struct PlannedInsert {
    pub record: IngestionRecord,
    pub leak: LeakRecord,
}

/// Write sets for one chunk, decided against one lookup snapshot.
#[derive(Debug, Default)]
pub struct ChunkPlan {
    pub inserts: Vec<PlannedInsert>,
    /// Existing leaks to touch, deduplicated, in first-match order.
    pub touches: Vec<LeakId>,
    pub guard: InsertGuard,
    pub failed: usize,
}

enum Decision {
    Touch(LeakId),
    Insert(LeakRecord),
    Failed,
}

/// Processes partitions with an injected credential scheme.
#[derive(Clone)]
pub struct ChunkProcessor {
    scheme: Arc<dyn CredentialScheme>,
}

impl ChunkProcessor {
    pub fn new(scheme: Arc<dyn CredentialScheme>) -> Self {
        Self { scheme }
    }

    /// Plan and commit one chunk.
    ///
    /// Lookup failures and commit failures fail the chunk. Per-record
    /// problems are counted in [`ChunkReport::failed`] instead.
    pub async fn process(
        &self,
        session: &mut dyn StoreSession,
        records: Vec<IngestionRecord>,
        cancel: &CancellationToken,
    ) -> Result<ChunkReport, IngestError> {
        let mut report = ChunkReport {
            records: records.len(),
            ..ChunkReport::default()
        };

        let plan = self.plan(session, records).await?;
        report.failed += plan.failed;
        self.commit(session, plan, cancel, &mut report).await?;

        Ok(report)
    }

    /// Decide the write sets for `records` against the store's current state.
    pub async fn plan(
        &self,
        session: &mut dyn StoreSession,
        records: Vec<IngestionRecord>,
    ) -> Result<ChunkPlan, IngestError> {
        let started = Instant::now();
        let (records, keys) = tokio::task::spawn_blocking(move || precompute(records)).await?;
        debug!(
            records = records.len(),
            emails = keys.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "precomputed digests"
        );

        let started = Instant::now();
        let digests: Vec<EmailDigest> = {
            let mut d: Vec<EmailDigest> = keys.values().map(|(digest, _)| *digest).collect();
            d.sort();
            d.dedup();
            d
        };
        let existing = session
            .find_leaks_by_email_digests(&digests)
            .await
            .map_err(IngestError::Lookup)?;

        let domain_names: Vec<String> = {
            let mut names: Vec<String> = keys
                .values()
                .map(|(_, domain)| domain.clone())
                .filter(|d| !d.is_empty())
                .collect();
            names.sort();
            names.dedup();
            names
        };
        let domains = session
            .find_domains_by_names(&domain_names)
            .await
            .map_err(IngestError::Lookup)?;
        debug!(
            existing = existing.len(),
            domains = domains.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "loaded snapshot"
        );

        let candidates = group_candidates(existing);
        let customers: HashMap<String, Vec<CustomerRef>> = domains
            .into_iter()
            .map(|d| (d.name, d.customers))
            .collect();

        let started = Instant::now();
        let scheme = self.scheme.clone();
        let now = Utc::now();
        let plan = tokio::task::spawn_blocking(move || {
            decide_all(scheme.as_ref(), records, &keys, &candidates, &customers, now)
        })
        .await?;
        debug!(
            inserts = plan.inserts.len(),
            touches = plan.touches.len(),
            failed = plan.failed,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "matched records"
        );

        Ok(plan)
    }

    /// Commit a plan: touches first, then the guarded insert.
    async fn commit(
        &self,
        session: &mut dyn StoreSession,
        plan: ChunkPlan,
        cancel: &CancellationToken,
        report: &mut ChunkReport,
    ) -> Result<(), IngestError> {
        let started = Instant::now();

        if !plan.touches.is_empty() {
            if cancel.is_cancelled() {
                report.cancelled = true;
                return Ok(());
            }
            let touched = session
                .bulk_touch_last_seen(&plan.touches, Utc::now())
                .await
                .map_err(IngestError::Commit)?;
            report.touched += touched as usize;
        }

        if plan.inserts.is_empty() {
            return Ok(());
        }
        if cancel.is_cancelled() {
            report.cancelled = true;
            return Ok(());
        }

        let mut passwords = HashMap::with_capacity(plan.inserts.len());
        let mut leaks = Vec::with_capacity(plan.inserts.len());
        for planned in plan.inserts {
            passwords.insert(planned.leak.id, planned.record.password);
            leaks.push(planned.leak);
        }
        let guard = plan.guard.with_resolver(Arc::new(PendingPasswords {
            scheme: self.scheme.clone(),
            passwords,
        }));

        let outcome = session
            .bulk_insert(leaks, &guard)
            .await
            .map_err(IngestError::Commit)?;
        report.inserted += outcome.inserted;
        report.touched += outcome.touched;
        report.rechecked += outcome.rechecked;

        if !outcome.conflicts.is_empty() {
            warn!(
                records = outcome.conflicts.len(),
                "store withheld inserts without resolving them"
            );
            report.failed += outcome.conflicts.len();
        }
        if outcome.rechecked > 0 {
            info!(
                rechecked = outcome.rechecked,
                touched = outcome.touched,
                "resolved inserts racing a concurrent writer"
            );
        }

        info!(
            inserted = outcome.inserted,
            touched = report.touched,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "committed chunk"
        );

        Ok(())
    }
}

/// Plaintexts of a chunk's pending inserts, keyed by the leak minted for
/// each. Lets the store re-check an insert against rows written after the
/// chunk's lookup.
struct PendingPasswords {
    scheme: Arc<dyn CredentialScheme>,
    passwords: HashMap<LeakId, String>,
}

impl ConflictResolver for PendingPasswords {
    fn resolve(&self, pending: &LeakRecord, current: &[LeakRecord]) -> Option<LeakId> {
        let password = self.passwords.get(&pending.id)?;
        first_match(self.scheme.as_ref(), current, password)
    }
}

/// First candidate whose stored credential verifies `password`.
fn first_match(
    scheme: &dyn CredentialScheme,
    candidates: &[LeakRecord],
    password: &str,
) -> Option<LeakId> {
    for candidate in candidates {
        match scheme.verify(&candidate.credential, password) {
            Ok(true) => return Some(candidate.id),
            Ok(false) => {}
            Err(e) => warn!(
                leak_id = %candidate.id,
                error = %e,
                "could not verify stored credential; treating as non-match"
            ),
        }
    }
    None
}

type EmailKeys = HashMap<String, (EmailDigest, String)>;

/// Drop exact repeats and compute `(digest, domain)` once per email.
fn precompute(records: Vec<IngestionRecord>) -> (Vec<IngestionRecord>, EmailKeys) {
    let mut seen = HashSet::new();
    let records: Vec<IngestionRecord> = records
        .into_iter()
        .filter(|r| seen.insert(r.clone()))
        .collect();

    let mut emails: Vec<&str> = Vec::new();
    let mut seen_emails = HashSet::new();
    for r in &records {
        if seen_emails.insert(r.email.as_str()) {
            emails.push(r.email.as_str());
        }
    }

    let keys: EmailKeys = emails
        .par_iter()
        .map(|email| {
            (
                email.to_string(),
                (digest_email(email), domain_of(email)),
            )
        })
        .collect();

    (records, keys)
}

/// Group leaks by digest, oldest first within each group.
fn group_candidates(existing: Vec<LeakRecord>) -> HashMap<EmailDigest, Vec<LeakRecord>> {
    let mut grouped: HashMap<EmailDigest, Vec<LeakRecord>> = HashMap::new();
    for leak in existing {
        grouped.entry(leak.email_digest).or_default().push(leak);
    }
    for group in grouped.values_mut() {
        oldest_first(group);
    }
    grouped
}

fn decide_all(
    scheme: &dyn CredentialScheme,
    records: Vec<IngestionRecord>,
    keys: &EmailKeys,
    candidates: &HashMap<EmailDigest, Vec<LeakRecord>>,
    customers: &HashMap<String, Vec<CustomerRef>>,
    now: DateTime<Utc>,
) -> ChunkPlan {
    let decisions: Vec<Decision> = records
        .par_iter()
        .map(|record| decide(scheme, record, keys, candidates, customers, now))
        .collect();

    let mut plan = ChunkPlan::default();
    let mut touched = HashSet::new();
    for (record, decision) in records.into_iter().zip(decisions) {
        match decision {
            Decision::Touch(id) => {
                if touched.insert(id) {
                    plan.touches.push(id);
                }
            }
            Decision::Insert(leak) => {
                let count = candidates.get(&leak.email_digest).map_or(0, Vec::len);
                plan.guard.expect(leak.email_digest, count);
                plan.inserts.push(PlannedInsert { record, leak });
            }
            Decision::Failed => plan.failed += 1,
        }
    }
    plan
}

fn decide(
    scheme: &dyn CredentialScheme,
    record: &IngestionRecord,
    keys: &EmailKeys,
    candidates: &HashMap<EmailDigest, Vec<LeakRecord>>,
    customers: &HashMap<String, Vec<CustomerRef>>,
    now: DateTime<Utc>,
) -> Decision {
    let (digest, domain) = match keys.get(&record.email) {
        Some((digest, domain)) => (*digest, domain.clone()),
        None => (digest_email(&record.email), domain_of(&record.email)),
    };

    if let Some(group) = candidates.get(&digest) {
        if let Some(id) = first_match(scheme, group, &record.password) {
            return Decision::Touch(id);
        }
    }

    let credential = match scheme.protect(&record.password) {
        Ok(c) => c,
        Err(e) => {
            warn!(error = %e, "could not protect password; dropping record");
            return Decision::Failed;
        }
    };

    Decision::Insert(LeakRecord {
        id: LeakId::new(),
        email_digest: digest,
        credential,
        obfuscated_password: obfuscate(&record.password),
        customers: customers.get(&domain).cloned().unwrap_or_default(),
        domain,
        first_seen: now,
        last_seen: now,
    })
}
