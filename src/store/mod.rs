//! Storage abstraction for Leak Monitor.
//!
//! [`Store`] is a session factory. Every unit of work (one ingestion chunk,
//! one query, one customer edit) opens its own [`StoreSession`], uses it
//! exclusively, and drops it when done. Backends release their connection
//! on drop, so release happens on every exit path, errors included.
//!
//! Implementations must be `Send + Sync` to work with async runtimes.
//!
//! # Insert guard
//!
//! Concurrent chunks decide "new vs. existing" from snapshots taken at
//! the start of their work. [`StoreSession::bulk_insert`] takes an
//! [`InsertGuard`] with the per-digest row count each decision was based
//! on. Inside the write, a record whose digest gained rows since then is
//! handed to the guard's [`ConflictResolver`] together with the digest's
//! current rows: a match sets that leak's `last_seen`, anything else is
//! inserted. Without a resolver such records are withheld and reported in
//! [`InsertOutcome::conflicts`].

pub mod memory;
pub mod sqlite;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::StoreError;
use crate::models::{CustomerRecord, DomainRecord, EmailDigest, LeakId, LeakRecord};

pub use memory::InMemoryStore;
pub use sqlite::SqliteStore;

/// Re-checks a withheld insert against the rows its digest has now.
pub trait ConflictResolver: Send + Sync {
    /// The stored leak `pending` re-observes, if any. `current` holds every
    /// stored leak with the same digest, oldest first.
    fn resolve(&self, pending: &LeakRecord, current: &[LeakRecord]) -> Option<LeakId>;
}

/// Row counts per email digest, as observed in a chunk's snapshot.
#[derive(Clone, Default)]
pub struct InsertGuard {
    expected: HashMap<EmailDigest, usize>,
    resolver: Option<Arc<dyn ConflictResolver>>,
}

impl InsertGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `digest` had `count` rows when the decision was made.
    pub fn expect(&mut self, digest: EmailDigest, count: usize) {
        self.expected.insert(digest, count);
    }

    /// Expected count for a digest; digests never declared expect zero rows.
    pub fn expected(&self, digest: &EmailDigest) -> usize {
        self.expected.get(digest).copied().unwrap_or(0)
    }

    /// Resolve changed digests inside the write instead of withholding them.
    pub fn with_resolver(mut self, resolver: Arc<dyn ConflictResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn resolver(&self) -> Option<&dyn ConflictResolver> {
        self.resolver.as_deref()
    }
}

impl fmt::Debug for InsertGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InsertGuard")
            .field("expected", &self.expected)
            .field("resolver", &self.resolver.is_some())
            .finish()
    }
}

/// Result of a guarded bulk insert.
#[derive(Debug, Default)]
pub struct InsertOutcome {
    pub inserted: usize,
    /// Records whose digest changed and that matched a row added since.
    pub touched: usize,
    /// Records re-checked by the resolver.
    pub rechecked: usize,
    /// Records withheld because their digest changed and no resolver was set.
    pub conflicts: Vec<LeakRecord>,
}

/// Order leaks sharing a digest the way candidates are scanned:
/// `first_seen` ascending, then id.
pub fn oldest_first(leaks: &mut [LeakRecord]) {
    leaks.sort_by(|a, b| a.first_seen.cmp(&b.first_seen).then(a.id.cmp(&b.id)));
}

/// Storage counters for `leakmon stats`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub leaks: u64,
    pub domains: u64,
    pub customers: u64,
    pub customer_links: u64,
}

/// A backing store that hands out scoped sessions.
#[async_trait]
pub trait Store: Send + Sync {
    /// Acquire a session for exclusive use by one unit of work.
    async fn session(&self) -> Result<Box<dyn StoreSession>, StoreError>;
}

/// Operations available inside one session.
///
/// # Operations
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`find_leaks_by_email_digests`](StoreSession::find_leaks_by_email_digests) | Bulk leak lookup by digest |
/// | [`find_domains_by_names`](StoreSession::find_domains_by_names) | Bulk domain lookup with customers |
/// | [`bulk_insert`](StoreSession::bulk_insert) | Guarded insert of new leaks |
/// | [`bulk_touch_last_seen`](StoreSession::bulk_touch_last_seen) | Set-based last-seen update |
/// | [`find_leaks_by_domains`](StoreSession::find_leaks_by_domains) | Leaks for a customer's domains |
/// | [`link_customer`](StoreSession::link_customer) | Idempotent leak↔customer links |
#[async_trait]
pub trait StoreSession: Send {
    /// Leaks whose email digest is in `digests`, with their customers.
    async fn find_leaks_by_email_digests(
        &mut self,
        digests: &[EmailDigest],
    ) -> Result<Vec<LeakRecord>, StoreError>;

    /// Domains named in `names`, with their interested customers.
    async fn find_domains_by_names(
        &mut self,
        names: &[String],
    ) -> Result<Vec<DomainRecord>, StoreError>;

    /// Insert new leaks and their customer links in one transaction.
    /// Records whose digest no longer matches `guard` are resolved or
    /// withheld as described in the module docs.
    async fn bulk_insert(
        &mut self,
        leaks: Vec<LeakRecord>,
        guard: &InsertGuard,
    ) -> Result<InsertOutcome, StoreError>;

    /// Set `last_seen = at` for every id in `ids`. Returns rows updated.
    async fn bulk_touch_last_seen(
        &mut self,
        ids: &[LeakId],
        at: DateTime<Utc>,
    ) -> Result<u64, StoreError>;

    /// Leaks in any of `domains`, newest first-seen first.
    async fn find_leaks_by_domains(
        &mut self,
        domains: &[String],
    ) -> Result<Vec<LeakRecord>, StoreError>;

    /// Link `customer_id` to every leak in `leak_ids`. Existing links are
    /// left alone. Returns the number of links created.
    async fn link_customer(
        &mut self,
        customer_id: Uuid,
        leak_ids: &[LeakId],
    ) -> Result<u64, StoreError>;

    /// Create a customer, creating any missing domains.
    async fn create_customer(
        &mut self,
        name: &str,
        domains: &[String],
    ) -> Result<CustomerRecord, StoreError>;

    /// All customers ordered by name.
    async fn list_customers(&mut self) -> Result<Vec<CustomerRecord>, StoreError>;

    async fn get_customer(&mut self, id: Uuid) -> Result<Option<CustomerRecord>, StoreError>;

    /// Rename a customer and replace its domain set. `None` if absent.
    async fn update_customer(
        &mut self,
        id: Uuid,
        name: &str,
        domains: &[String],
    ) -> Result<Option<CustomerRecord>, StoreError>;

    /// Delete a customer. Returns `false` if it did not exist.
    async fn delete_customer(&mut self, id: Uuid) -> Result<bool, StoreError>;

    async fn stats(&mut self) -> Result<StoreStats, StoreError>;
}
