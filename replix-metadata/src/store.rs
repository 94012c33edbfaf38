//! Store traits
//!
//! Collaborator interfaces consumed by the rebalancer. Both the in-memory
//! store and the PostgreSQL database implement all of them.

use crate::models::{DatasetLock, NewRule, ReplicationRule, RuleUpdate, ScanRow};
use async_trait::async_trait;
use replix_core::{Expr, ExpressionFilter, ReplixError, StorageEndpoint};
use std::collections::BTreeSet;
use thiserror::Error;
use uuid::Uuid;

/// Store errors
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Rule not found: {0}")]
    RuleNotFound(Uuid),

    #[error("Duplicate rule: {0}")]
    DuplicateRule(String),

    #[error("Rule already superseded: {0}")]
    RuleSuperseded(Uuid),

    #[error("Insufficient account limit: {0}")]
    InsufficientAccountLimit(String),

    #[error("Insufficient target endpoints: {0}")]
    InsufficientTargets(String),

    #[error("Endpoint not found: {0}")]
    EndpointNotFound(String),

    #[error(transparent)]
    Expression(#[from] ReplixError),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl StoreError {
    /// Placement failures that only affect a single rule
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::RuleNotFound(_)
                | Self::RuleSuperseded(_)
                | Self::DuplicateRule(_)
                | Self::InsufficientAccountLimit(_)
                | Self::InsufficientTargets(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Read access to replication rules plus the transactional write path
#[async_trait]
pub trait RuleStore: Send + Sync {
    async fn get_rule(&self, id: Uuid) -> Result<ReplicationRule>;

    /// Open a unit of work. Writes become visible to other readers only
    /// when the transaction commits.
    async fn begin(&self) -> Result<Box<dyn RuleTransaction>>;
}

/// Unit of work over the rule and lock tables.
///
/// Dropping an uncommitted transaction discards its writes.
#[async_trait]
pub trait RuleTransaction: Send {
    async fn list_dataset_locks(&mut self, scope: &str, name: &str) -> Result<Vec<DatasetLock>>;

    async fn create_rule(&mut self, rule: NewRule) -> Result<Uuid>;

    async fn update_rule(&mut self, id: Uuid, update: RuleUpdate) -> Result<()>;

    async fn commit(self: Box<Self>) -> Result<()>;

    async fn rollback(self: Box<Self>) -> Result<()>;
}

#[async_trait]
pub trait LockStore: Send + Sync {
    async fn list_dataset_locks(&self, scope: &str, name: &str) -> Result<Vec<DatasetLock>>;
}

/// Endpoint attribute reader
#[async_trait]
pub trait EndpointCatalog: Send + Sync {
    async fn get_endpoint(&self, name: &str) -> Result<StorageEndpoint>;

    async fn list_endpoints(&self) -> Result<Vec<StorageEndpoint>>;

    /// Resolve an RSE expression to endpoint names
    async fn resolve_expression(
        &self,
        expression: &str,
        filter: &ExpressionFilter,
    ) -> Result<BTreeSet<String>> {
        let expr = Expr::parse(expression)?;
        let endpoints = self.list_endpoints().await?;
        Ok(expr.resolve(&endpoints, filter))
    }
}

/// Relational view used by the standard-mode candidate scan
#[async_trait]
pub trait CandidateSource: Send + Sync {
    /// Rows for every open, unsuperseded rule holding a dataset lock at
    /// `endpoint`. Eligibility filtering happens in the scanner.
    async fn scan_rows(&self, endpoint: &str) -> Result<Vec<ScanRow>>;
}

/// Everything the rebalancer needs from the metadata layer
pub trait Catalog: RuleStore + LockStore + EndpointCatalog + CandidateSource {}

impl<T> Catalog for T where T: RuleStore + LockStore + EndpointCatalog + CandidateSource {}
