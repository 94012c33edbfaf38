//! Replix Metadata
//!
//! Replication rules, dataset locks and storage endpoints, persisted in
//! PostgreSQL. An in-memory store implements the same traits for tests
//! and development.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │                         Catalog                           │
//! │  RuleStore + LockStore + EndpointCatalog + CandidateSource│
//! │                                                           │
//! │   ┌────────────────────┐        ┌────────────────────┐    │
//! │   │      Database      │        │    MemoryStore     │    │
//! │   │    (PostgreSQL)    │        │   (parking_lot)    │    │
//! │   └────────────────────┘        └────────────────────┘    │
//! │              │                            │               │
//! │   ┌──────────────────────────────────────────────────┐    │
//! │   │   RuleTransaction (create + update, atomically)  │    │
//! │   └──────────────────────────────────────────────────┘    │
//! └───────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use replix_metadata::{Database, DbConfig, RuleStore};
//!
//! let db = Database::new(DbConfig::default()).await?;
//! db.migrate().await?;
//!
//! let mut tx = db.begin().await?;
//! let child = tx.create_rule(new_rule).await?;
//! tx.update_rule(parent, RuleUpdate::supersede(child)).await?;
//! tx.commit().await?;
//! ```

pub mod memory;
pub mod models;
pub mod postgres;
pub mod store;

pub use memory::{MemoryStore, MemoryTransaction};
pub use models::*;
pub use postgres::{Database, DbConfig, PgRuleTransaction};
pub use store::{
    CandidateSource, Catalog, EndpointCatalog, LockStore, Result, RuleStore, RuleTransaction,
    StoreError,
};
