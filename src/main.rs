//! # Leak Monitor CLI (`leakmon`)
//!
//! ## Usage
//!
//! ```bash
//! leakmon --config ./config/leakmon.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `leakmon init` | Create the SQLite database and run schema migrations |
//! | `leakmon ingest <file\|->` | Ingest an `email,password` CSV file or stdin |
//! | `leakmon query <email>` | Show leaks recorded for an email |
//! | `leakmon customer add\|list\|get\|update\|remove` | Manage customers |
//! | `leakmon customer-leaks <id>` | Leaks in a customer's domains |
//! | `leakmon stats` | Row counts and database size |
//! | `leakmon serve` | Start the HTTP server |
//!
//! ## Examples
//!
//! ```bash
//! leakmon init
//! leakmon customer add Acme --domain acme.com --domain acme.io
//! gunzip -c dump.csv.gz | leakmon ingest -
//! leakmon query alice@acme.com
//! ```

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use uuid::Uuid;

use leak_monitor::{config, customers, ingest, logging, migrate, query, server, stats};

/// Leak Monitor CLI: ingest leaked credential dumps and query them.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/leakmon.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "leakmon",
    about = "Leak Monitor: privacy-preserving ingestion and lookup of leaked credentials",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/leakmon.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Idempotent: running it multiple times is safe.
    Init,

    /// Ingest a credential dump.
    ///
    /// The input is comma-delimited `email,password` with no header.
    /// Malformed lines are skipped and counted.
    Ingest {
        /// Input file, or `-` for stdin.
        input: String,
    },

    /// Show every leak recorded for an email address.
    Query {
        email: String,
    },

    /// Manage customers and their monitored domains.
    Customer {
        #[command(subcommand)]
        action: CustomerAction,
    },

    /// Show leaks in a customer's domains, linking any new ones.
    CustomerLeaks {
        /// Customer UUID.
        id: Uuid,
    },

    /// Show database statistics.
    Stats,

    /// Start the HTTP server on `[server].bind`.
    Serve,
}

#[derive(Subcommand)]
enum CustomerAction {
    /// Create a customer.
    Add {
        name: String,
        /// Monitored domain (repeatable).
        #[arg(long = "domain", required = true)]
        domains: Vec<String>,
    },
    /// List all customers.
    List,
    /// Show one customer as JSON.
    Get { id: Uuid },
    /// Rename a customer and replace its domains.
    Update {
        id: Uuid,
        name: String,
        #[arg(long = "domain", required = true)]
        domains: Vec<String>,
    },
    /// Delete a customer.
    Remove { id: Uuid },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let cfg = config::load_config(&cli.config)
        .with_context(|| format!("Could not load config from {}", cli.config.display()))?;
    logging::init_logging(&cfg.logging)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Ingest { input } => {
            ingest::run_ingest(&cfg, &input).await?;
        }
        Commands::Query { email } => {
            query::run_query(&cfg, &email).await?;
        }
        Commands::Customer { action } => match action {
            CustomerAction::Add { name, domains } => {
                customers::run_customer_add(&cfg, &name, &domains).await?;
            }
            CustomerAction::List => {
                customers::run_customer_list(&cfg).await?;
            }
            CustomerAction::Get { id } => {
                customers::run_customer_get(&cfg, id).await?;
            }
            CustomerAction::Update { id, name, domains } => {
                customers::run_customer_update(&cfg, id, &name, &domains).await?;
            }
            CustomerAction::Remove { id } => {
                customers::run_customer_remove(&cfg, id).await?;
            }
        },
        Commands::CustomerLeaks { id } => {
            query::run_customer_leaks(&cfg, id).await?;
        }
        Commands::Stats => {
            stats::run_stats(&cfg).await?;
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
    }

    Ok(())
}
