//! PostgreSQL database operations for replix metadata
//!
//! Implements the store traits using SQLx.

use crate::models::*;
use crate::store::{
    CandidateSource, EndpointCatalog, LockStore, Result, RuleStore, RuleTransaction, StoreError,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use replix_core::{EndpointType, StorageEndpoint};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{FromRow, Postgres, Transaction};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tracing::{debug, info, instrument};
use uuid::Uuid;

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                StoreError::DuplicateRule(db.message().to_string())
            }
            _ => StoreError::Database(err.to_string()),
        }
    }
}

impl From<sqlx::migrate::MigrateError> for StoreError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        StoreError::Database(err.to_string())
    }
}

/// Database configuration
#[derive(Debug, Clone)]
pub struct DbConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connect_timeout: Duration,
    pub idle_timeout: Duration,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            url: "postgres://localhost/replix".to_string(),
            max_connections: 4,
            min_connections: 1,
            connect_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(300),
        }
    }
}

/// PostgreSQL database client
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

const LOCK_COLUMNS: &str = r#"
    dsl.scope, dsl.name, dsl.rule_id, rses.name AS rse,
    dsl.bytes, dsl.length, dsl.accessed_at, dsl.created_at
"#;

#[derive(FromRow)]
struct EndpointRecord {
    id: Uuid,
    name: String,
    availability_write: bool,
    free_space: Option<i64>,
}

#[derive(FromRow)]
struct AttributeRecord {
    rse_id: Uuid,
    key: String,
    value: String,
}

#[derive(FromRow)]
struct ScanRecord {
    #[sqlx(flatten)]
    rule: ReplicationRule,
    dataset_did_type: DidType,
    dataset_is_open: bool,
    dataset_bytes: Option<i64>,
    dataset_length: Option<i64>,
    lock_accessed_at: Option<DateTime<Utc>>,
    locks_at_endpoint: i64,
    archival_locks: i64,
}

impl From<ScanRecord> for ScanRow {
    fn from(record: ScanRecord) -> Self {
        let dataset = DatasetInfo {
            scope: record.rule.scope.clone(),
            name: record.rule.name.clone(),
            did_type: record.dataset_did_type,
            is_open: record.dataset_is_open,
            bytes: record.dataset_bytes,
            length: record.dataset_length,
        };
        ScanRow {
            rule: record.rule,
            dataset,
            accessed_at: record.lock_accessed_at,
            locks_at_endpoint: record.locks_at_endpoint,
            archival_locks: record.archival_locks,
        }
    }
}

impl Database {
    /// Create a new database connection pool
    pub async fn new(config: DbConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.connect_timeout)
            .idle_timeout(config.idle_timeout)
            .connect(&config.url)
            .await?;

        info!("Connected to PostgreSQL database");
        Ok(Self { pool })
    }

    /// Run migrations
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("Database migrations complete");
        Ok(())
    }

    /// Get the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn load_endpoints(&self, name: Option<&str>) -> Result<Vec<StorageEndpoint>> {
        let records = sqlx::query_as::<_, EndpointRecord>(
            r#"
            SELECT id, name, availability_write, free_space
            FROM rses
            WHERE deleted = FALSE AND ($1::VARCHAR IS NULL OR name = $1)
            ORDER BY name
            "#,
        )
        .bind(name)
        .fetch_all(&self.pool)
        .await?;

        let ids: Vec<Uuid> = records.iter().map(|r| r.id).collect();
        let attributes = sqlx::query_as::<_, AttributeRecord>(
            "SELECT rse_id, key, value FROM rse_attributes WHERE rse_id = ANY($1)",
        )
        .bind(&ids)
        .fetch_all(&self.pool)
        .await?;

        let mut by_endpoint: HashMap<Uuid, BTreeMap<String, String>> = HashMap::new();
        for attr in attributes {
            by_endpoint
                .entry(attr.rse_id)
                .or_default()
                .insert(attr.key, attr.value);
        }

        records
            .into_iter()
            .map(|r| {
                let attrs = by_endpoint.remove(&r.id).unwrap_or_default();
                StorageEndpoint::from_attributes(
                    r.id,
                    r.name,
                    r.availability_write,
                    r.free_space.map(|f| f.max(0) as u64),
                    attrs,
                )
                .map_err(StoreError::from)
            })
            .collect()
    }
}

#[async_trait]
impl RuleStore for Database {
    async fn get_rule(&self, id: Uuid) -> Result<ReplicationRule> {
        sqlx::query_as::<_, ReplicationRule>("SELECT * FROM rules WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::RuleNotFound(id))
    }

    async fn begin(&self) -> Result<Box<dyn RuleTransaction>> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgRuleTransaction { tx }))
    }
}

#[async_trait]
impl LockStore for Database {
    async fn list_dataset_locks(&self, scope: &str, name: &str) -> Result<Vec<DatasetLock>> {
        let locks = sqlx::query_as::<_, DatasetLock>(&format!(
            "SELECT {} FROM dataset_locks dsl JOIN rses ON rses.id = dsl.rse_id \
             WHERE dsl.scope = $1 AND dsl.name = $2",
            LOCK_COLUMNS
        ))
        .bind(scope)
        .bind(name)
        .fetch_all(&self.pool)
        .await?;
        Ok(locks)
    }
}

#[async_trait]
impl EndpointCatalog for Database {
    async fn get_endpoint(&self, name: &str) -> Result<StorageEndpoint> {
        self.load_endpoints(Some(name))
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| StoreError::EndpointNotFound(name.to_string()))
    }

    async fn list_endpoints(&self) -> Result<Vec<StorageEndpoint>> {
        self.load_endpoints(None).await
    }
}

#[async_trait]
impl CandidateSource for Database {
    #[instrument(skip(self))]
    async fn scan_rows(&self, endpoint: &str) -> Result<Vec<ScanRow>> {
        let records = sqlx::query_as::<_, ScanRecord>(
            r#"
            SELECT r.*,
                   d.did_type AS dataset_did_type,
                   d.is_open AS dataset_is_open,
                   d.bytes AS dataset_bytes,
                   d.length AS dataset_length,
                   dsl.accessed_at AS lock_accessed_at,
                   (SELECT count(*) FROM dataset_locks x
                     WHERE x.scope = dsl.scope AND x.name = dsl.name AND x.rse_id = dsl.rse_id)
                       AS locks_at_endpoint,
                   (SELECT count(*) FROM dataset_locks x
                     JOIN rse_attributes a ON a.rse_id = x.rse_id AND a.key = 'type' AND a.value = ANY($2)
                     WHERE x.scope = dsl.scope AND x.name = dsl.name)
                       AS archival_locks
            FROM dataset_locks dsl
            JOIN rses s ON s.id = dsl.rse_id
            JOIN rules r ON r.id = dsl.rule_id
            JOIN dids d ON d.scope = dsl.scope AND d.name = dsl.name
            WHERE s.name = $1
              AND r.state = 'OPEN'
              AND r.child_rule_id IS NULL
            ORDER BY dsl.accessed_at ASC NULLS FIRST, d.bytes DESC
            "#,
        )
        .bind(endpoint)
        .bind(&EndpointType::ARCHIVAL_NAMES[..])
        .fetch_all(&self.pool)
        .await?;

        debug!(rows = records.len(), "Collected scan rows");
        Ok(records.into_iter().map(ScanRow::from).collect())
    }
}

/// Unit of work backed by a PostgreSQL transaction
pub struct PgRuleTransaction {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl RuleTransaction for PgRuleTransaction {
    async fn list_dataset_locks(&mut self, scope: &str, name: &str) -> Result<Vec<DatasetLock>> {
        let locks = sqlx::query_as::<_, DatasetLock>(&format!(
            "SELECT {} FROM dataset_locks dsl JOIN rses ON rses.id = dsl.rse_id \
             WHERE dsl.scope = $1 AND dsl.name = $2",
            LOCK_COLUMNS
        ))
        .bind(scope)
        .bind(name)
        .fetch_all(&mut *self.tx)
        .await?;
        Ok(locks)
    }

    #[instrument(skip(self, rule), fields(scope = %rule.scope, name = %rule.name))]
    async fn create_rule(&mut self, rule: NewRule) -> Result<Uuid> {
        let expires_at = rule.expires_at(Utc::now());
        let id: Uuid = sqlx::query_scalar(
            r#"
            INSERT INTO rules (
                id, scope, name, did_type, account, copies, rse_expression, grouping, weight,
                expires_at, locked, subscription_id, source_replica_expression, activity,
                notification, purge_replicas, ignore_availability, comments, ask_approval,
                asynchronous, ignore_account_limit, priority, state
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16,
                    $17, $18, $19, $20, $21, $22, 'REPLICATING')
            RETURNING id
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&rule.scope)
        .bind(&rule.name)
        .bind(rule.did_type)
        .bind(&rule.account)
        .bind(rule.copies)
        .bind(&rule.rse_expression)
        .bind(rule.grouping)
        .bind(&rule.weight)
        .bind(expires_at)
        .bind(rule.locked)
        .bind(rule.subscription_id)
        .bind(&rule.source_replica_expression)
        .bind(&rule.activity)
        .bind(rule.notification)
        .bind(rule.purge_replicas)
        .bind(rule.ignore_availability)
        .bind(&rule.comments)
        .bind(rule.ask_approval)
        .bind(rule.asynchronous)
        .bind(rule.ignore_account_limit)
        .bind(rule.priority)
        .fetch_one(&mut *self.tx)
        .await?;

        debug!(rule_id = %id, rse_expression = %rule.rse_expression, "Rule created");
        Ok(id)
    }

    #[instrument(skip(self))]
    async fn update_rule(&mut self, id: Uuid, update: RuleUpdate) -> Result<()> {
        let expires_at = update
            .lifetime_secs
            .map(|secs| Utc::now() + chrono::Duration::seconds(secs));

        let result = sqlx::query(
            r#"
            UPDATE rules
            SET child_rule_id = COALESCE($2, child_rule_id),
                expires_at = CASE WHEN $3 THEN $4 ELSE expires_at END,
                updated_at = NOW()
            WHERE id = $1
              AND ($2::uuid IS NULL OR child_rule_id IS NULL)
            "#,
        )
        .bind(id)
        .bind(update.child_rule_id)
        .bind(expires_at.is_some())
        .bind(expires_at)
        .execute(&mut *self.tx)
        .await?;

        if result.rows_affected() == 0 {
            // Tell a missing rule apart from one linked by a concurrent run.
            let existing: Option<(Option<Uuid>,)> =
                sqlx::query_as("SELECT child_rule_id FROM rules WHERE id = $1")
                    .bind(id)
                    .fetch_optional(&mut *self.tx)
                    .await?;
            return Err(match existing {
                Some(_) => StoreError::RuleSuperseded(id),
                None => StoreError::RuleNotFound(id),
            });
        }
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.tx.rollback().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_db_config_default() {
        let config = DbConfig::default();
        assert!(config.url.starts_with("postgres://"));
        assert!(config.max_connections >= config.min_connections);
    }

    #[test]
    fn test_scan_record_conversion() {
        let now = Utc::now();
        let record = ScanRecord {
            rule: ReplicationRule {
                id: Uuid::new_v4(),
                scope: "data18".to_string(),
                name: "ds1".to_string(),
                did_type: DidType::Dataset,
                account: "panda".to_string(),
                copies: 1,
                rse_expression: "SITE_A".to_string(),
                grouping: RuleGrouping::Dataset,
                weight: None,
                source_replica_expression: None,
                state: RuleState::Open,
                expires_at: None,
                locked: false,
                child_rule_id: None,
                subscription_id: None,
                activity: "T0 Export".to_string(),
                notification: false,
                purge_replicas: false,
                priority: 3,
                comments: None,
                created_at: now,
                updated_at: now,
            },
            dataset_did_type: DidType::Dataset,
            dataset_is_open: false,
            dataset_bytes: Some(10),
            dataset_length: Some(2),
            lock_accessed_at: None,
            locks_at_endpoint: 1,
            archival_locks: 1,
        };

        let row = ScanRow::from(record);
        assert_eq!(row.dataset.scope, "data18");
        assert_eq!(row.dataset.bytes, Some(10));
        assert_eq!(row.locks_at_endpoint, 1);
    }
}
