//! In-memory [`Store`] implementation for tests and embedding.
//!
//! Uses `HashMap`, `HashSet` and `Vec` behind one `std::sync::RwLock`.
//! A guarded insert takes the write lock for its whole check-and-insert,
//! which gives it the same atomicity as the SQLite transaction.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::StoreError;
use crate::models::{CustomerRecord, CustomerRef, DomainRecord, EmailDigest, LeakId, LeakRecord};

use super::{oldest_first, InsertGuard, InsertOutcome, Store, StoreSession, StoreStats};

struct StoredCustomer {
    name: String,
    domains: Vec<String>,
}

#[derive(Default)]
struct MemoryState {
    /// Leaks in insertion order; `customers` is always empty here.
    leaks: Vec<LeakRecord>,
    domains: HashMap<String, Uuid>,
    customers: HashMap<Uuid, StoredCustomer>,
    leak_customers: HashSet<(LeakId, Uuid)>,
}

impl MemoryState {
    fn customer_ref(&self, id: Uuid) -> Option<CustomerRef> {
        self.customers.get(&id).map(|c| CustomerRef {
            id,
            name: c.name.clone(),
        })
    }

    fn with_customers(&self, leak: &LeakRecord) -> LeakRecord {
        let mut customers: Vec<CustomerRef> = self
            .leak_customers
            .iter()
            .filter(|(leak_id, _)| *leak_id == leak.id)
            .filter_map(|(_, cid)| self.customer_ref(*cid))
            .collect();
        customers.sort_by(|a, b| a.name.cmp(&b.name));
        LeakRecord {
            customers,
            ..leak.clone()
        }
    }

    fn customer_record(&self, id: Uuid) -> Option<CustomerRecord> {
        self.customers.get(&id).map(|c| CustomerRecord {
            id,
            name: c.name.clone(),
            domains: c.domains.clone(),
        })
    }

    fn name_taken(&self, name: &str, except: Option<Uuid>) -> bool {
        self.customers
            .iter()
            .any(|(id, c)| c.name == name && Some(*id) != except)
    }

    fn ensure_domains(&mut self, domains: &[String]) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        for name in domains {
            if !names.contains(name) {
                names.push(name.clone());
            }
            self.domains
                .entry(name.clone())
                .or_insert_with(Uuid::new_v4);
        }
        names
    }
}

/// In-memory store for tests and embedding.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    state: Arc<RwLock<MemoryState>>,
    unavailable: Arc<AtomicBool>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent operation fail with [`StoreError::Unavailable`].
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn session(&self) -> Result<Box<dyn StoreSession>, StoreError> {
        Ok(Box::new(MemorySession {
            state: self.state.clone(),
            unavailable: self.unavailable.clone(),
        }))
    }
}

/// Session over the shared in-memory state.
pub struct MemorySession {
    state: Arc<RwLock<MemoryState>>,
    unavailable: Arc<AtomicBool>,
}

impl MemorySession {
    fn read(&self) -> Result<RwLockReadGuard<'_, MemoryState>, StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("in-memory store offline".into()));
        }
        self.state
            .read()
            .map_err(|_| StoreError::Unavailable("lock poisoned".into()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, MemoryState>, StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("in-memory store offline".into()));
        }
        self.state
            .write()
            .map_err(|_| StoreError::Unavailable("lock poisoned".into()))
    }
}

#[async_trait]
impl StoreSession for MemorySession {
    async fn find_leaks_by_email_digests(
        &mut self,
        digests: &[EmailDigest],
    ) -> Result<Vec<LeakRecord>, StoreError> {
        let wanted: HashSet<&EmailDigest> = digests.iter().collect();
        let state = self.read()?;
        Ok(state
            .leaks
            .iter()
            .filter(|l| wanted.contains(&l.email_digest))
            .map(|l| state.with_customers(l))
            .collect())
    }

    async fn find_domains_by_names(
        &mut self,
        names: &[String],
    ) -> Result<Vec<DomainRecord>, StoreError> {
        let state = self.read()?;
        let mut out = Vec::new();
        for name in names {
            let Some(id) = state.domains.get(name) else {
                continue;
            };
            let mut customers: Vec<CustomerRef> = state
                .customers
                .iter()
                .filter(|(_, c)| c.domains.contains(name))
                .map(|(cid, c)| CustomerRef {
                    id: *cid,
                    name: c.name.clone(),
                })
                .collect();
            customers.sort_by(|a, b| a.name.cmp(&b.name));
            out.push(DomainRecord {
                id: *id,
                name: name.clone(),
                customers,
            });
        }
        Ok(out)
    }

    async fn bulk_insert(
        &mut self,
        leaks: Vec<LeakRecord>,
        guard: &InsertGuard,
    ) -> Result<InsertOutcome, StoreError> {
        let mut state = self.write()?;

        let mut current: HashMap<EmailDigest, usize> = HashMap::new();
        for leak in &state.leaks {
            *current.entry(leak.email_digest).or_default() += 1;
        }

        let mut outcome = InsertOutcome::default();
        for leak in leaks {
            let now = current.get(&leak.email_digest).copied().unwrap_or(0);
            if now != guard.expected(&leak.email_digest) {
                let Some(resolver) = guard.resolver() else {
                    outcome.conflicts.push(leak);
                    continue;
                };
                outcome.rechecked += 1;

                let mut rows: Vec<LeakRecord> = state
                    .leaks
                    .iter()
                    .filter(|l| l.email_digest == leak.email_digest)
                    .cloned()
                    .collect();
                oldest_first(&mut rows);

                if let Some(id) = resolver.resolve(&leak, &rows) {
                    if let Some(existing) = state.leaks.iter_mut().find(|l| l.id == id) {
                        existing.last_seen = leak.last_seen;
                        outcome.touched += 1;
                    }
                    continue;
                }
            }
            for c in &leak.customers {
                if state.customers.contains_key(&c.id) {
                    state.leak_customers.insert((leak.id, c.id));
                }
            }
            state.leaks.push(LeakRecord {
                customers: Vec::new(),
                ..leak
            });
            outcome.inserted += 1;
        }
        Ok(outcome)
    }

    async fn bulk_touch_last_seen(
        &mut self,
        ids: &[LeakId],
        at: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let wanted: HashSet<&LeakId> = ids.iter().collect();
        let mut state = self.write()?;
        let mut touched = 0;
        for leak in state.leaks.iter_mut().filter(|l| wanted.contains(&l.id)) {
            leak.last_seen = at;
            touched += 1;
        }
        Ok(touched)
    }

    async fn find_leaks_by_domains(
        &mut self,
        domains: &[String],
    ) -> Result<Vec<LeakRecord>, StoreError> {
        let state = self.read()?;
        let mut leaks: Vec<LeakRecord> = state
            .leaks
            .iter()
            .filter(|l| domains.contains(&l.domain))
            .map(|l| state.with_customers(l))
            .collect();
        leaks.sort_by(|a, b| b.first_seen.cmp(&a.first_seen).then(a.id.cmp(&b.id)));
        Ok(leaks)
    }

    async fn link_customer(
        &mut self,
        customer_id: Uuid,
        leak_ids: &[LeakId],
    ) -> Result<u64, StoreError> {
        let mut state = self.write()?;
        if !state.customers.contains_key(&customer_id) {
            return Ok(0);
        }
        let mut created = 0;
        for id in leak_ids {
            let exists = state.leaks.iter().any(|l| l.id == *id);
            if exists && state.leak_customers.insert((*id, customer_id)) {
                created += 1;
            }
        }
        Ok(created)
    }

    async fn create_customer(
        &mut self,
        name: &str,
        domains: &[String],
    ) -> Result<CustomerRecord, StoreError> {
        let mut state = self.write()?;
        if state.name_taken(name, None) {
            return Err(StoreError::Duplicate {
                entity: "customer",
                value: name.to_string(),
            });
        }
        let domains = state.ensure_domains(domains);
        let id = Uuid::new_v4();
        state.customers.insert(
            id,
            StoredCustomer {
                name: name.to_string(),
                domains: domains.clone(),
            },
        );
        Ok(CustomerRecord {
            id,
            name: name.to_string(),
            domains,
        })
    }

    async fn list_customers(&mut self) -> Result<Vec<CustomerRecord>, StoreError> {
        let state = self.read()?;
        let mut out: Vec<CustomerRecord> = state
            .customers
            .keys()
            .filter_map(|id| state.customer_record(*id))
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    async fn get_customer(&mut self, id: Uuid) -> Result<Option<CustomerRecord>, StoreError> {
        Ok(self.read()?.customer_record(id))
    }

    async fn update_customer(
        &mut self,
        id: Uuid,
        name: &str,
        domains: &[String],
    ) -> Result<Option<CustomerRecord>, StoreError> {
        let mut state = self.write()?;
        if !state.customers.contains_key(&id) {
            return Ok(None);
        }
        if state.name_taken(name, Some(id)) {
            return Err(StoreError::Duplicate {
                entity: "customer",
                value: name.to_string(),
            });
        }
        let domains = state.ensure_domains(domains);
        if let Some(c) = state.customers.get_mut(&id) {
            c.name = name.to_string();
            c.domains = domains;
        }
        Ok(state.customer_record(id))
    }

    async fn delete_customer(&mut self, id: Uuid) -> Result<bool, StoreError> {
        let mut state = self.write()?;
        if state.customers.remove(&id).is_none() {
            return Ok(false);
        }
        state.leak_customers.retain(|(_, cid)| *cid != id);
        Ok(true)
    }

    async fn stats(&mut self) -> Result<StoreStats, StoreError> {
        let state = self.read()?;
        Ok(StoreStats {
            leaks: state.leaks.len() as u64,
            domains: state.domains.len() as u64,
            customers: state.customers.len() as u64,
            customer_links: state.leak_customers.len() as u64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::digest_email;
    use crate::models::{Credential, SALT_LEN};
    use crate::store::ConflictResolver;

    fn leak(email: &str, domain: &str) -> LeakRecord {
        let now = Utc::now();
        LeakRecord {
            id: LeakId::new(),
            email_digest: digest_email(email),
            credential: Credential::SaltedDigest {
                salt: [0; SALT_LEN],
                digest: vec![1; 64],
            },
            obfuscated_password: "*a".into(),
            domain: domain.into(),
            first_seen: now,
            last_seen: now,
            customers: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_guard_withholds_changed_digests() {
        let store = InMemoryStore::new();
        let mut s = store.session().await.unwrap();

        let first = s
            .bulk_insert(vec![leak("a@x.com", "x.com")], &InsertGuard::new())
            .await
            .unwrap();
        assert_eq!(first.inserted, 1);

        // Snapshot said zero rows, but one exists now.
        let second = s
            .bulk_insert(
                vec![leak("a@x.com", "x.com"), leak("b@x.com", "x.com")],
                &InsertGuard::new(),
            )
            .await
            .unwrap();
        assert_eq!(second.inserted, 1);
        assert_eq!(second.conflicts.len(), 1);
        assert_eq!(second.conflicts[0].email_digest, digest_email("a@x.com"));

        let mut guard = InsertGuard::new();
        guard.expect(digest_email("a@x.com"), 1);
        let third = s
            .bulk_insert(vec![leak("a@x.com", "x.com")], &guard)
            .await
            .unwrap();
        assert_eq!(third.inserted, 1);
        assert!(third.conflicts.is_empty());
    }

    /// Treats leaks with the same masked password as one credential.
    struct SameMask;

    impl ConflictResolver for SameMask {
        fn resolve(&self, pending: &LeakRecord, current: &[LeakRecord]) -> Option<LeakId> {
            current
                .iter()
                .find(|c| c.obfuscated_password == pending.obfuscated_password)
                .map(|c| c.id)
        }
    }

    #[tokio::test]
    async fn test_resolver_touches_or_inserts_changed_digests() {
        let store = InMemoryStore::new();
        let mut s = store.session().await.unwrap();
        let existing = leak("a@x.com", "x.com");
        let existing_id = existing.id;
        s.bulk_insert(vec![existing], &InsertGuard::new())
            .await
            .unwrap();

        let mut same = leak("a@x.com", "x.com");
        same.last_seen += chrono::Duration::seconds(30);
        let seen_at = same.last_seen;
        let mut other = leak("a@x.com", "x.com");
        other.obfuscated_password = "*b".into();

        let guard = InsertGuard::new().with_resolver(Arc::new(SameMask));
        let outcome = s.bulk_insert(vec![same, other], &guard).await.unwrap();
        assert_eq!(outcome.rechecked, 2);
        assert_eq!(outcome.touched, 1);
        assert_eq!(outcome.inserted, 1);
        assert!(outcome.conflicts.is_empty());

        let found = s
            .find_leaks_by_email_digests(&[digest_email("a@x.com")])
            .await
            .unwrap();
        assert_eq!(found.len(), 2);
        let kept = found.iter().find(|l| l.id == existing_id).unwrap();
        assert_eq!(kept.last_seen, seen_at);
    }

    #[tokio::test]
    async fn test_touch_only_changes_last_seen() {
        let store = InMemoryStore::new();
        let mut s = store.session().await.unwrap();
        let l = leak("a@x.com", "x.com");
        let first_seen = l.first_seen;
        let id = l.id;
        s.bulk_insert(vec![l], &InsertGuard::new()).await.unwrap();

        let later = first_seen + chrono::Duration::seconds(60);
        assert_eq!(s.bulk_touch_last_seen(&[id], later).await.unwrap(), 1);

        let found = s
            .find_leaks_by_email_digests(&[digest_email("a@x.com")])
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].first_seen, first_seen);
        assert_eq!(found[0].last_seen, later);
    }

    #[tokio::test]
    async fn test_customer_domains_and_duplicates() {
        let store = InMemoryStore::new();
        let mut s = store.session().await.unwrap();
        let acme = s
            .create_customer("Acme", &["test.com".to_string()])
            .await
            .unwrap();
        assert!(matches!(
            s.create_customer("Acme", &["other.com".to_string()]).await,
            Err(StoreError::Duplicate { .. })
        ));

        let domains = s
            .find_domains_by_names(&["test.com".to_string(), "nope.com".to_string()])
            .await
            .unwrap();
        assert_eq!(domains.len(), 1);
        assert_eq!(domains[0].customers[0].id, acme.id);

        assert!(s.delete_customer(acme.id).await.unwrap());
        assert!(!s.delete_customer(acme.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_unavailable_store_fails() {
        let store = InMemoryStore::new();
        store.set_unavailable(true);
        let mut s = store.session().await.unwrap();
        assert!(matches!(
            s.find_leaks_by_email_digests(&[digest_email("a@x.com")]).await,
            Err(StoreError::Unavailable(_))
        ));
    }
}
