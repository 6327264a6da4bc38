use chrono::{Duration, Utc};
use tempfile::TempDir;
use uuid::Uuid;

use leak_monitor::config::Config;
use leak_monitor::credential::{CredentialScheme, KeyedCipherScheme, SaltedDigestScheme};
use leak_monitor::db;
use leak_monitor::digest::{digest_email, obfuscate};
use leak_monitor::error::StoreError;
use leak_monitor::migrate;
use leak_monitor::models::{CustomerRef, LeakId, LeakRecord};
use leak_monitor::store::{ConflictResolver, InsertGuard, SqliteStore, Store};
use std::collections::HashMap;
use std::sync::Arc;

async fn open() -> (TempDir, SqliteStore) {
    let tmp = TempDir::new().unwrap();
    let config = Config::with_db_path(tmp.path().join("data/leaks.sqlite"));
    let pool = db::connect(&config).await.unwrap();
    migrate::migrate_pool(&pool).await.unwrap();
    (tmp, SqliteStore::new(pool))
}

/// Matches a pending record against stored rows by its known plaintext.
struct KnownPasswords {
    scheme: Arc<SaltedDigestScheme>,
    passwords: HashMap<LeakId, String>,
}

impl ConflictResolver for KnownPasswords {
    fn resolve(&self, pending: &LeakRecord, current: &[LeakRecord]) -> Option<LeakId> {
        let password = self.passwords.get(&pending.id)?;
        current
            .iter()
            .find(|row| self.scheme.verify(&row.credential, password).unwrap_or(false))
            .map(|row| row.id)
    }
}

fn leak(scheme: &dyn CredentialScheme, email: &str, password: &str) -> LeakRecord {
    let now = Utc::now();
    LeakRecord {
        id: LeakId::new(),
        email_digest: digest_email(email),
        credential: scheme.protect(password).unwrap(),
        obfuscated_password: obfuscate(password),
        domain: email.rsplit('@').next().unwrap_or_default().to_string(),
        first_seen: now,
        last_seen: now,
        customers: Vec::new(),
    }
}

#[tokio::test]
async fn test_migrations_are_idempotent() {
    let (_tmp, store) = open().await;
    migrate::migrate_pool(store.pool()).await.unwrap();
    let stats = store.session().await.unwrap().stats().await.unwrap();
    assert_eq!(stats.leaks, 0);
}

#[tokio::test]
async fn test_leak_roundtrip_preserves_fields() {
    let (_tmp, store) = open().await;
    let scheme = SaltedDigestScheme::default();
    let mut s = store.session().await.unwrap();

    let original = leak(&scheme, "alice@test.com", "secret1");
    let outcome = s
        .bulk_insert(vec![original.clone()], &InsertGuard::new())
        .await
        .unwrap();
    assert_eq!(outcome.inserted, 1);

    let found = s
        .find_leaks_by_email_digests(&[digest_email("alice@test.com")])
        .await
        .unwrap();
    assert_eq!(found.len(), 1);
    let got = &found[0];
    assert_eq!(got.id, original.id);
    assert_eq!(got.email_digest, original.email_digest);
    assert_eq!(got.credential, original.credential);
    assert_eq!(got.obfuscated_password, "*e*r*t*");
    assert_eq!(got.domain, "test.com");
    assert_eq!(
        got.first_seen.timestamp_millis(),
        original.first_seen.timestamp_millis()
    );
    assert!(scheme.verify(&got.credential, "secret1").unwrap());
}

#[tokio::test]
async fn test_keyed_cipher_credentials_roundtrip() {
    let (_tmp, store) = open().await;
    let scheme = KeyedCipherScheme::new(&[9u8; 32]);
    let mut s = store.session().await.unwrap();

    s.bulk_insert(vec![leak(&scheme, "k@x.com", "hunter2")], &InsertGuard::new())
        .await
        .unwrap();
    let found = s
        .find_leaks_by_email_digests(&[digest_email("k@x.com")])
        .await
        .unwrap();
    assert_eq!(found[0].credential.kind(), "keyed-cipher");
    assert!(scheme.verify(&found[0].credential, "hunter2").unwrap());
    assert!(!scheme.verify(&found[0].credential, "hunter3").unwrap());
}

#[tokio::test]
async fn test_guard_withholds_stale_digests() {
    let (_tmp, store) = open().await;
    let scheme = SaltedDigestScheme::default();
    let mut s = store.session().await.unwrap();

    s.bulk_insert(vec![leak(&scheme, "a@x.com", "1")], &InsertGuard::new())
        .await
        .unwrap();

    let stale = leak(&scheme, "a@x.com", "2");
    let fresh = leak(&scheme, "b@x.com", "3");
    let outcome = s
        .bulk_insert(vec![stale.clone(), fresh], &InsertGuard::new())
        .await
        .unwrap();
    assert_eq!(outcome.inserted, 1);
    assert_eq!(outcome.conflicts.len(), 1);
    assert_eq!(outcome.conflicts[0].id, stale.id);

    let mut guard = InsertGuard::new();
    guard.expect(digest_email("a@x.com"), 1);
    let outcome = s.bulk_insert(vec![stale], &guard).await.unwrap();
    assert_eq!(outcome.inserted, 1);
    assert_eq!(s.stats().await.unwrap().leaks, 3);
}

#[tokio::test]
async fn test_resolver_rechecks_inside_the_write() {
    let (_tmp, store) = open().await;
    let scheme = Arc::new(SaltedDigestScheme::default());
    let mut s = store.session().await.unwrap();

    // A concurrent writer stored two passwords for a@x.com after our lookup.
    let theirs = leak(&*scheme, "a@x.com", "same");
    s.bulk_insert(
        vec![theirs.clone(), leak(&*scheme, "a@x.com", "other")],
        &InsertGuard::new(),
    )
    .await
    .unwrap();

    let mut repeat = leak(&*scheme, "a@x.com", "same");
    repeat.last_seen = theirs.last_seen + Duration::hours(1);
    let new = leak(&*scheme, "a@x.com", "mine");
    let passwords = HashMap::from([
        (repeat.id, "same".to_string()),
        (new.id, "mine".to_string()),
    ]);

    let mut guard = InsertGuard::new();
    guard.expect(digest_email("a@x.com"), 0);
    let guard = guard.with_resolver(Arc::new(KnownPasswords {
        scheme: Arc::clone(&scheme),
        passwords,
    }));
    let outcome = s
        .bulk_insert(vec![repeat.clone(), new.clone()], &guard)
        .await
        .unwrap();
    assert_eq!(outcome.rechecked, 2);
    assert_eq!(outcome.touched, 1);
    assert_eq!(outcome.inserted, 1);
    assert!(outcome.conflicts.is_empty());

    let rows = s
        .find_leaks_by_email_digests(&[digest_email("a@x.com")])
        .await
        .unwrap();
    assert_eq!(rows.len(), 3);
    assert!(rows.iter().any(|r| r.id == new.id));
    let kept = rows.iter().find(|r| r.id == theirs.id).unwrap();
    assert_eq!(kept.last_seen.timestamp_millis(), repeat.last_seen.timestamp_millis());
}

#[tokio::test]
async fn test_touch_updates_only_last_seen() {
    let (_tmp, store) = open().await;
    let scheme = SaltedDigestScheme::default();
    let mut s = store.session().await.unwrap();

    let l = leak(&scheme, "a@x.com", "1");
    s.bulk_insert(vec![l.clone()], &InsertGuard::new())
        .await
        .unwrap();

    let later = l.first_seen + Duration::hours(3);
    let touched = s
        .bulk_touch_last_seen(&[l.id, LeakId::new()], later)
        .await
        .unwrap();
    assert_eq!(touched, 1);

    let got = &s
        .find_leaks_by_email_digests(&[l.email_digest])
        .await
        .unwrap()[0];
    assert_eq!(got.first_seen.timestamp_millis(), l.first_seen.timestamp_millis());
    assert_eq!(got.last_seen.timestamp_millis(), later.timestamp_millis());
    assert_eq!(got.credential, l.credential);
}

#[tokio::test]
async fn test_customer_crud_and_domains() {
    let (_tmp, store) = open().await;
    let mut s = store.session().await.unwrap();

    let acme = s
        .create_customer("Acme", &["acme.io".to_string(), "test.com".to_string()])
        .await
        .unwrap();
    assert_eq!(acme.domains, vec!["acme.io", "test.com"]);

    // Shared domain rows are reused.
    s.create_customer("Beta", &["test.com".to_string()])
        .await
        .unwrap();
    let stats = s.stats().await.unwrap();
    assert_eq!(stats.domains, 2);
    assert_eq!(stats.customers, 2);

    let err = s
        .create_customer("Acme", &["other.com".to_string()])
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::Duplicate { entity: "customer", .. }));

    let domains = s
        .find_domains_by_names(&["test.com".to_string()])
        .await
        .unwrap();
    let names: Vec<&str> = domains[0].customers.iter().map(|c| c.name.as_str()).collect();
    assert_eq!(names, vec!["Acme", "Beta"]);

    let renamed = s
        .update_customer(acme.id, "Acme Corp", &["acme.io".to_string()])
        .await
        .unwrap()
        .unwrap();
    assert_eq!(renamed.name, "Acme Corp");
    assert_eq!(renamed.domains, vec!["acme.io"]);
    assert!(s
        .update_customer(Uuid::new_v4(), "Ghost", &["g.com".to_string()])
        .await
        .unwrap()
        .is_none());

    let listed = s.list_customers().await.unwrap();
    assert_eq!(listed.len(), 2);
    assert_eq!(listed[0].name, "Acme Corp");

    assert!(s.delete_customer(acme.id).await.unwrap());
    assert!(!s.delete_customer(acme.id).await.unwrap());
    assert!(s.get_customer(acme.id).await.unwrap().is_none());
}

#[tokio::test]
async fn test_links_are_idempotent_and_cascade() {
    let (_tmp, store) = open().await;
    let scheme = SaltedDigestScheme::default();
    let mut s = store.session().await.unwrap();

    let acme = s
        .create_customer("Acme", &["test.com".to_string()])
        .await
        .unwrap();

    let mut linked = leak(&scheme, "bob@test.com", "x");
    linked.customers = vec![CustomerRef {
        id: acme.id,
        name: acme.name.clone(),
    }];
    let unlinked = leak(&scheme, "carol@test.com", "y");
    s.bulk_insert(vec![linked.clone(), unlinked.clone()], &InsertGuard::new())
        .await
        .unwrap();
    assert_eq!(s.stats().await.unwrap().customer_links, 1);

    let created = s
        .link_customer(acme.id, &[linked.id, unlinked.id])
        .await
        .unwrap();
    assert_eq!(created, 1);
    let again = s
        .link_customer(acme.id, &[linked.id, unlinked.id])
        .await
        .unwrap();
    assert_eq!(again, 0);

    let leaks = s
        .find_leaks_by_domains(&["test.com".to_string()])
        .await
        .unwrap();
    assert_eq!(leaks.len(), 2);
    assert!(leaks.iter().all(|l| l.customers.len() == 1));

    s.delete_customer(acme.id).await.unwrap();
    assert_eq!(s.stats().await.unwrap().customer_links, 0);
    assert_eq!(s.stats().await.unwrap().leaks, 2);
}

#[tokio::test]
async fn test_domain_query_orders_newest_first() {
    let (_tmp, store) = open().await;
    let scheme = SaltedDigestScheme::default();
    let mut s = store.session().await.unwrap();

    let mut old = leak(&scheme, "old@d.com", "1");
    old.first_seen = Utc::now() - Duration::days(10);
    old.last_seen = old.first_seen;
    let new = leak(&scheme, "new@d.com", "2");
    s.bulk_insert(vec![old.clone(), new.clone()], &InsertGuard::new())
        .await
        .unwrap();

    let leaks = s.find_leaks_by_domains(&["d.com".to_string()]).await.unwrap();
    assert_eq!(leaks[0].id, new.id);
    assert_eq!(leaks[1].id, old.id);
}
