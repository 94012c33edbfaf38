//! Rebalance Orchestrator
//!
//! Drives one bounded batch:
//! - Snapshots the source endpoint attributes once
//! - Walks the scanner's candidates in order, applying budget filters
//! - Chooses a target and derives a child rule per surviving candidate
//!
//! Each candidate ends in a tagged [`CandidateOutcome`]. Recoverable
//! placement failures skip the candidate; anything else aborts the run while
//! keeping the relocations already committed.

use crate::derivation::{derive_rule, Derivation, DerivationOptions};
use crate::report::{RebalanceReport, Relocation, SkipReason, SkippedCandidate};
use crate::scanner::{RebalanceCandidate, RebalanceMode, Scanner};
use crate::selector::FreeSpaceSource;
use crate::target::{PlacementOverrides, TargetSelector};
use replix_core::StorageEndpoint;
use replix_metadata::{Catalog, RuleState, StoreError};
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// Default byte budget of a run
pub const DEFAULT_MAX_BYTES: u64 = 1_000_000_000;
/// Default priority of derived rules
pub const DEFAULT_PRIORITY: i32 = 3;
/// Highest accepted rule priority
pub const MAX_PRIORITY: i32 = 5;

/// Orchestrator errors
#[derive(Error, Debug)]
pub enum RebalanceError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Source endpoint unavailable: {0}")]
    Endpoint(#[source] StoreError),

    #[error("Candidate scan failed: {0}")]
    Scan(#[source] StoreError),

    #[error("Rebalancing rule {rule_id} failed: {source}")]
    Candidate {
        rule_id: Uuid,
        #[source]
        source: StoreError,
    },
}

pub type Result<T> = std::result::Result<T, RebalanceError>;

/// Parameters of one run
#[derive(Debug, Clone)]
pub struct RebalanceRequest {
    pub source_endpoint: String,
    pub max_bytes: u64,
    /// Unbounded when `None`
    pub max_files: Option<u64>,
    pub dry_run: bool,
    pub exclude_expression: Option<String>,
    pub force_expression: Option<String>,
    pub mode: RebalanceMode,
    pub priority: i32,
    pub source_replica_expression: Option<String>,
    pub comment: Option<String>,
}

impl RebalanceRequest {
    pub fn new(source_endpoint: impl Into<String>) -> Self {
        Self {
            source_endpoint: source_endpoint.into(),
            max_bytes: DEFAULT_MAX_BYTES,
            max_files: None,
            dry_run: false,
            exclude_expression: None,
            force_expression: None,
            mode: RebalanceMode::Standard,
            priority: DEFAULT_PRIORITY,
            source_replica_expression: None,
            comment: None,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.source_endpoint.trim().is_empty() {
            return Err(RebalanceError::InvalidRequest(
                "source endpoint must not be empty".to_string(),
            ));
        }
        if !(0..=MAX_PRIORITY).contains(&self.priority) {
            return Err(RebalanceError::InvalidRequest(format!(
                "priority {} outside 0..={}",
                self.priority, MAX_PRIORITY
            )));
        }
        if self.max_bytes == 0 {
            return Err(RebalanceError::InvalidRequest(
                "max_bytes must be positive".to_string(),
            ));
        }
        Ok(())
    }

    fn overrides(&self) -> PlacementOverrides {
        PlacementOverrides {
            exclude_expression: self.exclude_expression.clone(),
            force_expression: self.force_expression.clone(),
        }
    }
}

/// Bytes and files consumed so far in a run
#[derive(Debug, Clone)]
pub struct RebalanceBudget {
    pub max_bytes: u64,
    pub max_files: Option<u64>,
    pub bytes: u64,
    pub files: u64,
}

impl RebalanceBudget {
    pub fn new(max_bytes: u64, max_files: Option<u64>) -> Self {
        Self {
            max_bytes,
            max_files,
            bytes: 0,
            files: 0,
        }
    }

    /// Reason a candidate would overrun the budget, if any
    pub fn check(&self, bytes: u64, files: u64) -> Option<SkipReason> {
        if self.bytes.saturating_add(bytes) > self.max_bytes {
            return Some(SkipReason::ByteBudget);
        }
        match self.max_files {
            Some(max) if self.files.saturating_add(files) > max => Some(SkipReason::FileBudget),
            _ => None,
        }
    }

    pub fn consume(&mut self, bytes: u64, files: u64) {
        self.bytes += bytes;
        self.files += files;
    }
}

/// Tagged result of processing one candidate
#[derive(Debug)]
pub enum CandidateOutcome {
    Relocated(Relocation),
    Skipped(SkipReason),
    Fatal(RebalanceError),
}

/// Rebalance orchestrator
pub struct Orchestrator<S, F> {
    catalog: Arc<S>,
    scanner: Scanner<S>,
    targets: TargetSelector<S, F>,
    /// Activity stamped on derived rules instead of the parent's
    activity: Option<String>,
}

impl<S: Catalog, F: FreeSpaceSource> Orchestrator<S, F> {
    pub fn new(catalog: Arc<S>, scanner: Scanner<S>, targets: TargetSelector<S, F>) -> Self {
        Self {
            catalog,
            scanner,
            targets,
            activity: None,
        }
    }

    pub fn with_activity(mut self, activity: Option<String>) -> Self {
        self.activity = activity;
        self
    }

    pub fn targets(&self) -> &TargetSelector<S, F> {
        &self.targets
    }

    /// Run one batch
    #[instrument(skip(self, request), fields(endpoint = %request.source_endpoint, mode = %request.mode))]
    pub async fn run(&self, request: &RebalanceRequest) -> Result<RebalanceReport> {
        request.validate()?;

        let source = self
            .catalog
            .get_endpoint(&request.source_endpoint)
            .await
            .map_err(RebalanceError::Endpoint)?;

        let candidates = self
            .scanner
            .scan(&request.source_endpoint, request.mode)
            .await
            .map_err(RebalanceError::Scan)?;

        info!(
            candidates = candidates.len(),
            max_bytes = request.max_bytes,
            max_files = ?request.max_files,
            dry_run = request.dry_run,
            "Starting rebalance"
        );

        let mut report = RebalanceReport::new(&request.source_endpoint, request.mode, request.dry_run);
        let mut budget = RebalanceBudget::new(request.max_bytes, request.max_files);

        for candidate in candidates {
            let outcome = if request.force_expression.is_some() && candidate.subscription_id.is_some() {
                CandidateOutcome::Skipped(SkipReason::SubscriptionManaged)
            } else if let Some(reason) = budget.check(candidate.bytes, candidate.files) {
                CandidateOutcome::Skipped(reason)
            } else {
                self.process(&candidate, &source, request).await
            };

            match outcome {
                CandidateOutcome::Relocated(relocation) => {
                    info!(
                        scope = %relocation.scope,
                        name = %relocation.name,
                        target = %relocation.target_expression,
                        bytes = relocation.bytes,
                        "Relocated"
                    );
                    budget.consume(relocation.bytes, relocation.files);
                    report.record(relocation);
                }
                CandidateOutcome::Skipped(reason) => {
                    debug!(rule_id = %candidate.rule_id, reason = %reason, "Skipped candidate");
                    report.skip(SkippedCandidate {
                        scope: candidate.scope,
                        name: candidate.name,
                        rule_id: candidate.rule_id,
                        reason,
                    });
                }
                CandidateOutcome::Fatal(e) => {
                    error!(
                        error = %e,
                        relocations = report.relocations.len(),
                        bytes = report.total_bytes,
                        "Aborting rebalance"
                    );
                    return Err(e);
                }
            }
        }

        report.finish();
        info!(summary = %report.summary(), "Rebalance complete");
        Ok(report)
    }

    async fn process(
        &self,
        candidate: &RebalanceCandidate,
        source: &StorageEndpoint,
        request: &RebalanceRequest,
    ) -> CandidateOutcome {
        match self.try_process(candidate, source, request).await {
            Ok(outcome) => outcome,
            Err(StoreError::RuleSuperseded(_)) => {
                warn!(rule_id = %candidate.rule_id, "Rule linked by a concurrent run, skipping");
                CandidateOutcome::Skipped(SkipReason::RuleChanged("superseded".to_string()))
            }
            Err(e) if e.is_recoverable() => {
                warn!(rule_id = %candidate.rule_id, error = %e, "Placement failed, skipping");
                CandidateOutcome::Skipped(SkipReason::Placement(e.to_string()))
            }
            Err(e) => CandidateOutcome::Fatal(RebalanceError::Candidate {
                rule_id: candidate.rule_id,
                source: e,
            }),
        }
    }

    async fn try_process(
        &self,
        candidate: &RebalanceCandidate,
        source: &StorageEndpoint,
        request: &RebalanceRequest,
    ) -> std::result::Result<CandidateOutcome, StoreError> {
        let rule = self.catalog.get_rule(candidate.rule_id).await?;
        if let Some(child) = rule.child_rule_id {
            return Ok(CandidateOutcome::Skipped(SkipReason::RuleChanged(format!(
                "superseded by {}",
                child
            ))));
        }
        if rule.state != RuleState::Open {
            return Ok(CandidateOutcome::Skipped(SkipReason::RuleChanged(format!(
                "state {}",
                rule.state
            ))));
        }

        let other_endpoints: HashSet<String> = self
            .catalog
            .list_dataset_locks(&candidate.scope, &candidate.name)
            .await?
            .into_iter()
            .map(|lock| lock.rse)
            .collect();

        let target = self
            .targets
            .select(
                &rule,
                source,
                &candidate.rse_expression,
                &other_endpoints,
                &request.overrides(),
            )
            .await?;

        let derived_rule_id = if request.dry_run {
            None
        } else {
            let options = DerivationOptions {
                activity: self.activity.clone(),
                priority: request.priority,
                source_replica_expression: request.source_replica_expression.clone(),
                comment: request.comment.clone(),
            };
            match derive_rule(self.catalog.as_ref(), &rule, &target, &options).await? {
                Derivation::Created(id) => Some(id),
                Derivation::ConcurrentReplica => {
                    return Ok(CandidateOutcome::Skipped(SkipReason::ConcurrentReplica(target)))
                }
            }
        };

        Ok(CandidateOutcome::Relocated(Relocation {
            scope: candidate.scope.clone(),
            name: candidate.name.clone(),
            bytes: candidate.bytes,
            files: candidate.files,
            target_expression: target,
            source_rule_id: candidate.rule_id,
            derived_rule_id,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_request_defaults() {
        let request = RebalanceRequest::new("SITE_A");
        assert_eq!(request.max_bytes, 1_000_000_000);
        assert_eq!(request.priority, 3);
        assert!(request.max_files.is_none());
        assert!(request.validate().is_ok());
    }

    #[test]
    fn test_request_validation() {
        let mut request = RebalanceRequest::new(" ");
        assert!(matches!(request.validate(), Err(RebalanceError::InvalidRequest(_))));

        request.source_endpoint = "SITE_A".to_string();
        request.priority = 6;
        assert!(request.validate().is_err());

        request.priority = 0;
        request.max_bytes = 0;
        assert!(request.validate().is_err());
    }

    #[test]
    fn test_budget_checks() {
        let mut budget = RebalanceBudget::new(50, Some(4));
        assert_eq!(budget.check(80, 1), Some(SkipReason::ByteBudget));
        assert_eq!(budget.check(10, 5), Some(SkipReason::FileBudget));
        assert_eq!(budget.check(50, 4), None);

        budget.consume(40, 3);
        assert_eq!(budget.check(10, 1), None);
        assert_eq!(budget.check(11, 1), Some(SkipReason::ByteBudget));
        assert_eq!(budget.check(10, 2), Some(SkipReason::FileBudget));
    }

    proptest! {
        #[test]
        fn prop_budget_never_exceeded(
            sizes in proptest::collection::vec((0u64..100, 0u64..10), 0..50),
            max_bytes in 1u64..500,
            max_files in proptest::option::of(0u64..40),
        ) {
            let mut budget = RebalanceBudget::new(max_bytes, max_files);
            for (bytes, files) in sizes {
                if budget.check(bytes, files).is_none() {
                    budget.consume(bytes, files);
                }
            }
            prop_assert!(budget.bytes <= max_bytes);
            if let Some(max) = max_files {
                prop_assert!(budget.files <= max);
            }
        }
    }
}
