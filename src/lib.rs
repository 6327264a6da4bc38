//! # Leak Monitor
//!
//! Ingests bulk dumps of leaked `(email, password)` pairs, stores them as
//! privacy-preserving leak records, and answers "has this email leaked?"
//! and "which leaks touch this customer's domains?".
//!
//! Stored leaks carry a SHA-512 email digest, password verification
//! material (salted digest or keyed ciphertext), a masked password for
//! display, the email's domain, and first/last-seen timestamps. Plaintext
//! passwords and emails are never persisted.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌─────────────┐   ┌────────────┐   ┌──────────┐
//! │ CSV feed │──▶│  Coordinator │──▶│ Partitions │──▶│  Chunk   │──▶ SQLite
//! │ file/HTTP│   │ parse+dedup │   │   (≤ K)    │   │processors│
//! └──────────┘   └─────────────┘   └────────────┘   └──────────┘
//!                                                        │
//!                               ┌────────────────────────┤
//!                               ▼                        ▼
//!                          ┌──────────┐            ┌──────────┐
//!                          │   CLI    │            │   HTTP   │
//!                          │(leakmon) │            │  (axum)  │
//!                          └──────────┘            └──────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`digest`] | Email/password digests, salts, masking |
//! | [`credential`] | Password verification schemes |
//! | [`partition`] | Chunk partitioner |
//! | [`processor`] | Per-chunk new-vs-touch decisions and commits |
//! | [`ingest`] | Stream parsing and concurrent chunk orchestration |
//! | [`query`] | Email and customer leak queries |
//! | [`customers`] | Customer and domain management |
//! | [`store`] | Storage traits, in-memory and SQLite backends |
//! | [`server`] | HTTP server |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |
//! | [`logging`] | tracing subscriber setup |
//! | [`error`] | Error types |

pub mod config;
pub mod credential;
pub mod customers;
pub mod db;
pub mod digest;
pub mod error;
pub mod ingest;
pub mod logging;
pub mod migrate;
pub mod models;
pub mod partition;
pub mod processor;
pub mod query;
pub mod server;
pub mod stats;
pub mod store;
