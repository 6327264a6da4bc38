//! Leak queries.
//!
//! Two entry points, shared by the CLI and the HTTP server:
//!
//! - [`search_by_email`]: every leak recorded for one email address.
//! - [`search_by_customer`]: every leak in a customer's monitored domains.
//!   Leaks not yet linked to the customer are linked as a side effect, so
//!   repeated calls create no duplicate links.
//!
//! Results are [`LeakSummary`] values, newest `first_seen` first. They
//! carry the base64 email digest and the masked password only.

use anyhow::Result;
use uuid::Uuid;

use crate::config::Config;
use crate::db;
use crate::digest::digest_email;
use crate::error::QueryError;
use crate::models::{LeakId, LeakRecord, LeakSummary};
use crate::store::Store;

fn summarize(mut leaks: Vec<LeakRecord>) -> Vec<LeakSummary> {
    leaks.sort_by(|a, b| b.first_seen.cmp(&a.first_seen).then(a.id.cmp(&b.id)));
    leaks.iter().map(LeakSummary::from).collect()
}

pub async fn search_by_email(store: &dyn Store, email: &str) -> Result<Vec<LeakSummary>, QueryError> {
    if email.trim().is_empty() {
        return Err(QueryError::InvalidInput("email must not be blank".into()));
    }

    let digest = digest_email(email);
    let mut session = store.session().await?;
    let leaks = session.find_leaks_by_email_digests(&[digest]).await?;
    Ok(summarize(leaks))
}

pub async fn search_by_customer(
    store: &dyn Store,
    customer_id: Uuid,
) -> Result<Vec<LeakSummary>, QueryError> {
    let mut session = store.session().await?;
    let customer = session
        .get_customer(customer_id)
        .await?
        .ok_or(QueryError::NotFound {
            entity: "customer",
            id: customer_id,
        })?;

    let leaks = session.find_leaks_by_domains(&customer.domains).await?;
    let unlinked: Vec<LeakId> = leaks
        .iter()
        .filter(|l| !l.customers.iter().any(|c| c.id == customer_id))
        .map(|l| l.id)
        .collect();

    if unlinked.is_empty() {
        return Ok(summarize(leaks));
    }

    let linked = session.link_customer(customer_id, &unlinked).await?;
    tracing::info!(customer = %customer_id, linked, "linked leaks to customer");

    let leaks = session.find_leaks_by_domains(&customer.domains).await?;
    Ok(summarize(leaks))
}

fn print_leaks(leaks: &[LeakSummary]) {
    if leaks.is_empty() {
        println!("No leaks found.");
        return;
    }

    for (i, leak) in leaks.iter().enumerate() {
        println!(
            "{}. {}  password: {}  domain: {}",
            i + 1,
            leak.id,
            leak.obfuscated_password,
            if leak.domain.is_empty() { "-" } else { &leak.domain }
        );
        println!("    email hash: {}", leak.email_hash);
        println!(
            "    first seen: {}  last seen: {}",
            leak.first_seen.format("%Y-%m-%d %H:%M:%S"),
            leak.last_seen.format("%Y-%m-%d %H:%M:%S")
        );
        if !leak.customers.is_empty() {
            let names: Vec<&str> = leak.customers.iter().map(|c| c.name.as_str()).collect();
            println!("    customers: {}", names.join(", "));
        }
        println!();
    }
}

pub async fn run_query(config: &Config, email: &str) -> Result<()> {
    let store = db::open_store(config).await?;
    let leaks = search_by_email(&store, email).await?;
    print_leaks(&leaks);
    Ok(())
}

pub async fn run_customer_leaks(config: &Config, customer_id: Uuid) -> Result<()> {
    let store = db::open_store(config).await?;
    let leaks = search_by_customer(&store, customer_id).await?;
    print_leaks(&leaks);
    Ok(())
}
