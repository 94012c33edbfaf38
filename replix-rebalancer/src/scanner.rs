//! Candidate Scanner
//!
//! Enumerates the rules that may be moved off a source endpoint:
//! - Standard mode filters the live rule and lock tables
//! - Decommission mode aggregates the latest weekly lock dump
//!
//! Candidates are recomputed on every scan and never persisted.

use crate::feed::{aggregate, dump_date, parse_dump, LockDumpFeed};
use chrono::{DateTime, Duration, Utc};
use replix_metadata::{Catalog, DidType, RuleGrouping, RuleState, ScanRow, StoreError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

pub type Result<T> = std::result::Result<T, StoreError>;

/// Where candidates come from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RebalanceMode {
    /// Live rule and lock tables
    #[default]
    Standard,
    /// Weekly lock dump of an endpoint being retired
    Decommission,
}

impl fmt::Display for RebalanceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Standard => write!(f, "standard"),
            Self::Decommission => write!(f, "decommission"),
        }
    }
}

impl FromStr for RebalanceMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "standard" => Ok(Self::Standard),
            "decommission" => Ok(Self::Decommission),
            other => Err(format!("unknown rebalance mode: {}", other)),
        }
    }
}

/// A rule that may be relocated
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RebalanceCandidate {
    pub scope: String,
    pub name: String,
    pub rule_id: Uuid,
    pub rse_expression: String,
    pub subscription_id: Option<Uuid>,
    pub bytes: u64,
    pub files: u64,
}

/// Structural eligibility thresholds for standard mode
#[derive(Debug, Clone)]
pub struct EligibilityPolicy {
    /// Rules younger than this stay put
    pub min_rule_age: Duration,
    /// Expiring rules need at least this much lifetime left
    pub min_remaining_lifetime: Duration,
    /// Only rules owned by these accounts are moved
    pub privileged_accounts: BTreeSet<String>,
}

impl Default for EligibilityPolicy {
    fn default() -> Self {
        Self {
            min_rule_age: Duration::days(60),
            min_remaining_lifetime: Duration::days(60),
            privileged_accounts: ["panda", "root", "ddmadmin"]
                .into_iter()
                .map(String::from)
                .collect(),
        }
    }
}

impl EligibilityPolicy {
    /// Whether a scan row passes every eligibility predicate at `now`
    pub fn is_eligible(&self, row: &ScanRow, now: DateTime<Utc>) -> bool {
        let rule = &row.rule;
        let dataset = &row.dataset;

        let lifetime_ok = rule
            .expires_at
            .map_or(true, |expires| expires > now + self.min_remaining_lifetime);

        rule.state == RuleState::Open
            && rule.copies == 1
            && rule.did_type == DidType::Dataset
            && !rule.is_superseded()
            && rule.created_at < now - self.min_rule_age
            && lifetime_ok
            && self.privileged_accounts.contains(&rule.account)
            && matches!(rule.grouping, RuleGrouping::Dataset | RuleGrouping::All)
            && dataset.did_type == DidType::Dataset
            && !dataset.is_open
            && dataset.bytes.is_some()
            && row.locks_at_endpoint == 1
            && row.archival_locks > 0
    }
}

/// Candidate scanner
pub struct Scanner<S> {
    catalog: Arc<S>,
    feed: Option<Arc<dyn LockDumpFeed>>,
    policy: EligibilityPolicy,
}

impl<S: Catalog> Scanner<S> {
    pub fn new(catalog: Arc<S>, policy: EligibilityPolicy) -> Self {
        Self {
            catalog,
            feed: None,
            policy,
        }
    }

    /// Attach the lock dump feed used in decommission mode
    pub fn with_feed(mut self, feed: Arc<dyn LockDumpFeed>) -> Self {
        self.feed = Some(feed);
        self
    }

    pub fn policy(&self) -> &EligibilityPolicy {
        &self.policy
    }

    /// Scan `endpoint` for candidates, in processing order
    pub async fn scan(&self, endpoint: &str, mode: RebalanceMode) -> Result<Vec<RebalanceCandidate>> {
        self.scan_at(endpoint, mode, Utc::now()).await
    }

    /// Scan as if the current time were `now`
    #[instrument(skip(self))]
    pub async fn scan_at(
        &self,
        endpoint: &str,
        mode: RebalanceMode,
        now: DateTime<Utc>,
    ) -> Result<Vec<RebalanceCandidate>> {
        let candidates = match mode {
            RebalanceMode::Standard => self.scan_standard(endpoint, now).await?,
            RebalanceMode::Decommission => self.scan_decommission(endpoint, now).await,
        };

        info!(
            endpoint = endpoint,
            mode = %mode,
            candidates = candidates.len(),
            "Scan complete"
        );
        Ok(candidates)
    }

    async fn scan_standard(&self, endpoint: &str, now: DateTime<Utc>) -> Result<Vec<RebalanceCandidate>> {
        let rows = self.catalog.scan_rows(endpoint).await?;
        let total = rows.len();

        let mut eligible: Vec<(Option<DateTime<Utc>>, RebalanceCandidate)> = rows
            .into_iter()
            .filter(|row| self.policy.is_eligible(row, now))
            .map(|row| {
                let candidate = RebalanceCandidate {
                    scope: row.dataset.scope,
                    name: row.dataset.name,
                    rule_id: row.rule.id,
                    rse_expression: row.rule.rse_expression,
                    subscription_id: row.rule.subscription_id,
                    bytes: row.dataset.bytes.unwrap_or(0).max(0) as u64,
                    files: row.dataset.length.unwrap_or(0).max(0) as u64,
                };
                (row.accessed_at, candidate)
            })
            .collect();

        debug!(rows = total, eligible = eligible.len(), "Filtered scan rows");

        // Never-accessed first, then stalest; larger datasets first on ties.
        eligible.sort_by(|(a_at, a), (b_at, b)| a_at.cmp(b_at).then(b.bytes.cmp(&a.bytes)));

        Ok(eligible.into_iter().map(|(_, c)| c).collect())
    }

    async fn scan_decommission(&self, endpoint: &str, now: DateTime<Utc>) -> Vec<RebalanceCandidate> {
        let Some(feed) = &self.feed else {
            warn!(endpoint = endpoint, "No lock dump feed configured");
            return Vec::new();
        };

        let date = dump_date(now.date_naive());
        let content = match feed.fetch(endpoint, &date).await {
            Ok(Some(content)) => content,
            Ok(None) => {
                warn!(endpoint = endpoint, date = %date, "Lock dump not published");
                return Vec::new();
            }
            Err(e) => {
                warn!(endpoint = endpoint, date = %date, error = %e, "Lock dump unavailable");
                return Vec::new();
            }
        };

        let rows = parse_dump(&content);
        let mut candidates = Vec::new();

        for usage in aggregate(&rows) {
            // A failed lookup is treated as a deleted rule.
            let rule = match self.catalog.get_rule(usage.rule_id).await {
                Ok(rule) => rule,
                Err(e) => {
                    debug!(rule_id = %usage.rule_id, error = %e, "Rule lookup failed, ignoring");
                    continue;
                }
            };

            if rule.state != RuleState::Open || rule.is_superseded() {
                continue;
            }

            candidates.push(RebalanceCandidate {
                scope: rule.scope,
                name: rule.name,
                rule_id: rule.id,
                rse_expression: usage.rse_expression,
                subscription_id: rule.subscription_id,
                bytes: usage.bytes,
                files: usage.files,
            });
        }

        debug!(rows = rows.len(), candidates = candidates.len(), "Aggregated lock dump");
        candidates
    }
}
