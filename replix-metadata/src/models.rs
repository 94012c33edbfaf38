//! Database models for replix metadata
//!
//! These structs map directly to PostgreSQL tables.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Replication rule state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "varchar", rename_all = "UPPERCASE")]
pub enum RuleState {
    Open,
    Replicating,
    Stuck,
    Suspended,
}

impl Default for RuleState {
    fn default() -> Self {
        Self::Replicating
    }
}

impl std::fmt::Display for RuleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Open => write!(f, "OPEN"),
            Self::Replicating => write!(f, "REPLICATING"),
            Self::Stuck => write!(f, "STUCK"),
            Self::Suspended => write!(f, "SUSPENDED"),
        }
    }
}

/// How the replicas of a multi-file dataset are co-located
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "varchar", rename_all = "UPPERCASE")]
pub enum RuleGrouping {
    All,
    Dataset,
    None,
}

impl Default for RuleGrouping {
    fn default() -> Self {
        Self::Dataset
    }
}

/// Kind of data identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "varchar", rename_all = "UPPERCASE")]
pub enum DidType {
    File,
    Dataset,
    Container,
}

/// Replication rule
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct ReplicationRule {
    pub id: Uuid,

    // Data identifier
    pub scope: String,
    pub name: String,
    pub did_type: DidType,

    // Ownership
    pub account: String,

    // Placement
    pub copies: i32,
    pub rse_expression: String,
    pub grouping: RuleGrouping,
    pub weight: Option<String>,
    pub source_replica_expression: Option<String>,

    // Lifecycle
    pub state: RuleState,
    pub expires_at: Option<DateTime<Utc>>,
    pub locked: bool,
    pub child_rule_id: Option<Uuid>,
    pub subscription_id: Option<Uuid>,

    // Transfer options
    pub activity: String,
    pub notification: bool,
    pub purge_replicas: bool,
    pub priority: i32,

    // Metadata
    pub comments: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ReplicationRule {
    /// A rule with a child has been superseded by a rebalancing
    pub fn is_superseded(&self) -> bool {
        self.child_rule_id.is_some()
    }

    /// Remaining lifetime relative to `now`, floored at zero.
    ///
    /// `None` when the rule never expires.
    pub fn remaining_lifetime(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.expires_at
            .map(|expires| (expires - now).max(Duration::zero()))
    }
}

/// A rule enforcing a replica of a dataset at an endpoint
#[derive(Debug, Clone, FromRow, Serialize, Deserialize, PartialEq, Eq)]
pub struct DatasetLock {
    pub scope: String,
    pub name: String,
    pub rule_id: Uuid,
    /// Endpoint name
    pub rse: String,
    pub bytes: Option<i64>,
    pub length: Option<i64>,
    pub accessed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Data identifier metadata
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct DatasetInfo {
    pub scope: String,
    pub name: String,
    pub did_type: DidType,
    /// Dataset still accepts new members
    pub is_open: bool,
    pub bytes: Option<i64>,
    pub length: Option<i64>,
}

/// Parameters for creating a new rule
#[derive(Debug, Clone)]
pub struct NewRule {
    pub scope: String,
    pub name: String,
    pub did_type: DidType,
    pub account: String,
    pub copies: i32,
    pub rse_expression: String,
    pub grouping: RuleGrouping,
    pub weight: Option<String>,
    /// Seconds until expiry, `None` for a rule that never expires
    pub lifetime_secs: Option<i64>,
    pub locked: bool,
    pub subscription_id: Option<Uuid>,
    pub source_replica_expression: Option<String>,
    pub activity: String,
    pub notification: bool,
    pub purge_replicas: bool,
    pub ignore_availability: bool,
    pub comments: Option<String>,
    pub ask_approval: bool,
    pub asynchronous: bool,
    pub ignore_account_limit: bool,
    pub priority: i32,
}

impl NewRule {
    /// Absolute expiry for a rule created at `now`
    pub fn expires_at(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.lifetime_secs.map(|secs| now + Duration::seconds(secs))
    }
}

/// Partial update of an existing rule
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuleUpdate {
    pub child_rule_id: Option<Uuid>,
    /// New lifetime in seconds from now
    pub lifetime_secs: Option<i64>,
}

impl RuleUpdate {
    /// Link a parent to its child and expire it immediately
    pub fn supersede(child_rule_id: Uuid) -> Self {
        Self {
            child_rule_id: Some(child_rule_id),
            lifetime_secs: Some(0),
        }
    }
}

/// One row examined by the rebalancing candidate scan
#[derive(Debug, Clone)]
pub struct ScanRow {
    pub rule: ReplicationRule,
    pub dataset: DatasetInfo,
    /// Last access of the lock at the scanned endpoint
    pub accessed_at: Option<DateTime<Utc>>,
    /// Locks of this dataset at the scanned endpoint
    pub locks_at_endpoint: i64,
    /// Locks of this dataset at archival-class endpoints
    pub archival_locks: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(expires_at: Option<DateTime<Utc>>) -> ReplicationRule {
        let now = Utc::now();
        ReplicationRule {
            id: Uuid::new_v4(),
            scope: "data18".to_string(),
            name: "ds1".to_string(),
            did_type: DidType::Dataset,
            account: "root".to_string(),
            copies: 1,
            rse_expression: "SITE_A".to_string(),
            grouping: RuleGrouping::Dataset,
            weight: None,
            source_replica_expression: None,
            state: RuleState::Open,
            expires_at,
            locked: false,
            child_rule_id: None,
            subscription_id: None,
            activity: "User Subscriptions".to_string(),
            notification: false,
            purge_replicas: false,
            priority: 3,
            comments: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_remaining_lifetime() {
        let now = Utc::now();
        assert_eq!(rule(None).remaining_lifetime(now), None);
        assert_eq!(
            rule(Some(now + Duration::hours(2))).remaining_lifetime(now),
            Some(Duration::hours(2))
        );
        assert_eq!(
            rule(Some(now - Duration::hours(2))).remaining_lifetime(now),
            Some(Duration::zero())
        );
    }

    #[test]
    fn test_supersede_update() {
        let child = Uuid::new_v4();
        let update = RuleUpdate::supersede(child);
        assert_eq!(update.child_rule_id, Some(child));
        assert_eq!(update.lifetime_secs, Some(0));
    }

    #[test]
    fn test_rule_state_display() {
        assert_eq!(RuleState::Open.to_string(), "OPEN");
        assert!(!rule(None).is_superseded());
    }
}
