//! Customer and monitored-domain management.
//!
//! Used by the `leakmon customer ...` commands and the `/customers` HTTP
//! routes. Domain names are normalized the same way ingestion extracts
//! them from emails, so customer domains and leak domains compare equal.

use anyhow::Result;
use serde::Deserialize;
use uuid::Uuid;

use crate::config::Config;
use crate::db;
use crate::error::QueryError;
use crate::models::CustomerRecord;
use crate::store::Store;

/// Create/update payload.
#[derive(Debug, Clone, Deserialize)]
pub struct CustomerInput {
    pub name: String,
    #[serde(default)]
    pub domains: Vec<String>,
}

/// Trim, lower-case and strip a leading `@` or trailing `.`.
pub fn normalize_domain(raw: &str) -> String {
    raw.trim()
        .trim_start_matches('@')
        .trim_end_matches('.')
        .to_lowercase()
}

/// Validated `(name, domains)`; domains are sorted and deduplicated.
pub fn validate(input: &CustomerInput) -> Result<(String, Vec<String>), QueryError> {
    let name = input.name.trim();
    if name.is_empty() {
        return Err(QueryError::InvalidInput("customer name must not be blank".into()));
    }

    let mut domains: Vec<String> = input
        .domains
        .iter()
        .map(|d| normalize_domain(d))
        .filter(|d| !d.is_empty())
        .collect();
    domains.sort();
    domains.dedup();

    if domains.is_empty() {
        return Err(QueryError::InvalidInput(
            "customer needs at least one domain".into(),
        ));
    }
    Ok((name.to_string(), domains))
}

fn not_found(id: Uuid) -> QueryError {
    QueryError::NotFound {
        entity: "customer",
        id,
    }
}

pub async fn create_customer(
    store: &dyn Store,
    input: &CustomerInput,
) -> Result<CustomerRecord, QueryError> {
    let (name, domains) = validate(input)?;
    let mut session = store.session().await?;
    Ok(session.create_customer(&name, &domains).await?)
}

pub async fn list_customers(store: &dyn Store) -> Result<Vec<CustomerRecord>, QueryError> {
    let mut session = store.session().await?;
    Ok(session.list_customers().await?)
}

pub async fn get_customer(store: &dyn Store, id: Uuid) -> Result<CustomerRecord, QueryError> {
    let mut session = store.session().await?;
    session.get_customer(id).await?.ok_or_else(|| not_found(id))
}

/// Rename a customer and replace its domain set.
pub async fn update_customer(
    store: &dyn Store,
    id: Uuid,
    input: &CustomerInput,
) -> Result<CustomerRecord, QueryError> {
    let (name, domains) = validate(input)?;
    let mut session = store.session().await?;
    session
        .update_customer(id, &name, &domains)
        .await?
        .ok_or_else(|| not_found(id))
}

pub async fn delete_customer(store: &dyn Store, id: Uuid) -> Result<(), QueryError> {
    let mut session = store.session().await?;
    if session.delete_customer(id).await? {
        Ok(())
    } else {
        Err(not_found(id))
    }
}

fn print_customer(c: &CustomerRecord) {
    println!("{}  {:<24} {}", c.id, c.name, c.domains.join(", "));
}

pub async fn run_customer_add(config: &Config, name: &str, domains: &[String]) -> Result<()> {
    let store = db::open_store(config).await?;
    let input = CustomerInput {
        name: name.to_string(),
        domains: domains.to_vec(),
    };
    let customer = create_customer(&store, &input).await?;
    print_customer(&customer);
    println!("ok");
    Ok(())
}

pub async fn run_customer_list(config: &Config) -> Result<()> {
    let store = db::open_store(config).await?;
    let customers = list_customers(&store).await?;

    if customers.is_empty() {
        println!("No customers.");
        return Ok(());
    }
    println!("{:<36}  {:<24} DOMAINS", "ID", "NAME");
    for c in &customers {
        print_customer(c);
    }
    Ok(())
}

pub async fn run_customer_get(config: &Config, id: Uuid) -> Result<()> {
    let store = db::open_store(config).await?;
    let customer = get_customer(&store, id).await?;
    println!("{}", serde_json::to_string_pretty(&customer)?);
    Ok(())
}

pub async fn run_customer_update(
    config: &Config,
    id: Uuid,
    name: &str,
    domains: &[String],
) -> Result<()> {
    let store = db::open_store(config).await?;
    let input = CustomerInput {
        name: name.to_string(),
        domains: domains.to_vec(),
    };
    let customer = update_customer(&store, id, &input).await?;
    print_customer(&customer);
    println!("ok");
    Ok(())
}

pub async fn run_customer_remove(config: &Config, id: Uuid) -> Result<()> {
    let store = db::open_store(config).await?;
    delete_customer(&store, id).await?;
    println!("removed {}", id);
    println!("ok");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;

    fn input(name: &str, domains: &[&str]) -> CustomerInput {
        CustomerInput {
            name: name.to_string(),
            domains: domains.iter().map(|d| d.to_string()).collect(),
        }
    }

    #[test]
    fn test_validate_normalizes_domains() {
        let (name, domains) =
            validate(&input(" Acme ", &["Test.COM", " @acme.io.", "test.com", ""])).unwrap();
        assert_eq!(name, "Acme");
        assert_eq!(domains, vec!["acme.io", "test.com"]);
    }

    #[test]
    fn test_validate_rejects_blank_name_and_no_domains() {
        assert!(matches!(
            validate(&input("  ", &["a.com"])),
            Err(QueryError::InvalidInput(_))
        ));
        assert!(matches!(
            validate(&input("Acme", &[" "])),
            Err(QueryError::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn test_crud_lifecycle() {
        let store = InMemoryStore::new();
        let acme = create_customer(&store, &input("Acme", &["test.com"]))
            .await
            .unwrap();
        create_customer(&store, &input("Beta", &["beta.io"]))
            .await
            .unwrap();

        let all = list_customers(&store).await.unwrap();
        assert_eq!(
            all.iter().map(|c| c.name.as_str()).collect::<Vec<_>>(),
            vec!["Acme", "Beta"]
        );

        let updated = update_customer(&store, acme.id, &input("Acme Corp", &["acme.io"]))
            .await
            .unwrap();
        assert_eq!(updated.name, "Acme Corp");
        assert_eq!(updated.domains, vec!["acme.io"]);

        delete_customer(&store, acme.id).await.unwrap();
        assert!(matches!(
            get_customer(&store, acme.id).await,
            Err(QueryError::NotFound { .. })
        ));
        assert!(matches!(
            delete_customer(&store, acme.id).await,
            Err(QueryError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_duplicate_name_is_conflict() {
        let store = InMemoryStore::new();
        create_customer(&store, &input("Acme", &["a.com"]))
            .await
            .unwrap();
        assert!(matches!(
            create_customer(&store, &input("Acme", &["b.com"])).await,
            Err(QueryError::Conflict(_))
        ));
    }
}
