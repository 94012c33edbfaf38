//! Rebalance report
//!
//! Returned by every run; the binary logs it and renders it as a table or
//! as JSON.

use crate::scanner::RebalanceMode;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt::{self, Write};
use uuid::Uuid;

const GB: f64 = 1e9;

/// An accepted relocation
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Relocation {
    pub scope: String,
    pub name: String,
    pub bytes: u64,
    pub files: u64,
    pub target_expression: String,
    pub source_rule_id: Uuid,
    /// `None` in dry-run mode
    pub derived_rule_id: Option<Uuid>,
}

/// Why a candidate was not relocated
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum SkipReason {
    /// Force expressions never apply to subscription-managed rules
    SubscriptionManaged,
    /// Would exceed the byte budget
    ByteBudget,
    /// Would exceed the file budget
    FileBudget,
    /// Recoverable placement failure
    Placement(String),
    /// The dataset is already locked at the chosen target
    ConcurrentReplica(String),
    /// The rule was superseded or left the OPEN state after the scan
    RuleChanged(String),
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SubscriptionManaged => write!(f, "subscription-managed rule"),
            Self::ByteBudget => write!(f, "byte budget exceeded"),
            Self::FileBudget => write!(f, "file budget exceeded"),
            Self::Placement(reason) => write!(f, "placement failed: {}", reason),
            Self::ConcurrentReplica(target) => write!(f, "concurrent replica at {}", target),
            Self::RuleChanged(detail) => write!(f, "rule changed since scan: {}", detail),
        }
    }
}

/// A candidate that was passed over
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedCandidate {
    pub scope: String,
    pub name: String,
    pub rule_id: Uuid,
    pub reason: SkipReason,
}

/// Result of one rebalancing run
#[derive(Debug, Clone, Serialize)]
pub struct RebalanceReport {
    pub source_endpoint: String,
    pub mode: RebalanceMode,
    pub dry_run: bool,
    pub relocations: Vec<Relocation>,
    pub skipped: Vec<SkippedCandidate>,
    pub total_bytes: u64,
    pub total_files: u64,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl RebalanceReport {
    pub fn new(source_endpoint: impl Into<String>, mode: RebalanceMode, dry_run: bool) -> Self {
        let now = Utc::now();
        Self {
            source_endpoint: source_endpoint.into(),
            mode,
            dry_run,
            relocations: Vec::new(),
            skipped: Vec::new(),
            total_bytes: 0,
            total_files: 0,
            started_at: now,
            finished_at: now,
        }
    }

    /// Record an accepted relocation and add it to the totals
    pub fn record(&mut self, relocation: Relocation) {
        self.total_bytes += relocation.bytes;
        self.total_files += relocation.files;
        self.relocations.push(relocation);
    }

    pub fn skip(&mut self, skipped: SkippedCandidate) {
        self.skipped.push(skipped);
    }

    pub fn finish(&mut self) {
        self.finished_at = Utc::now();
    }

    /// Get summary statistics
    pub fn summary(&self) -> String {
        format!(
            "{} ({}{}): {} relocations, {:.2} GB in {} files, {} skipped",
            self.source_endpoint,
            self.mode,
            if self.dry_run { ", dry run" } else { "" },
            self.relocations.len(),
            self.total_bytes as f64 / GB,
            self.total_files,
            self.skipped.len()
        )
    }

    /// Human-readable relocation table
    pub fn render_table(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "Mode:    {}", self.mode.to_string().to_uppercase());
        let _ = writeln!(out, "Dry Run: {}", self.dry_run);
        let _ = writeln!(out, "scope:name rule_id bytes(GB) target child_rule_id");
        for r in &self.relocations {
            let child = r
                .derived_rule_id
                .map(|id| id.to_string())
                .unwrap_or_else(|| "-".to_string());
            let _ = writeln!(
                out,
                "{}:{} {} {:.2} {} {}",
                r.scope,
                r.name,
                r.source_rule_id,
                r.bytes as f64 / GB,
                r.target_expression,
                child
            );
        }
        let _ = writeln!(out, "{}", self.summary());
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn relocation(bytes: u64, derived: Option<Uuid>) -> Relocation {
        Relocation {
            scope: "data18".to_string(),
            name: "ds1".to_string(),
            bytes,
            files: 3,
            target_expression: "SITE_B".to_string(),
            source_rule_id: Uuid::nil(),
            derived_rule_id: derived,
        }
    }

    #[test]
    fn test_record_accumulates_totals() {
        let mut report = RebalanceReport::new("SITE_A", RebalanceMode::Standard, false);
        report.record(relocation(2_000_000_000, Some(Uuid::new_v4())));
        report.record(relocation(500_000_000, Some(Uuid::new_v4())));

        assert_eq!(report.total_bytes, 2_500_000_000);
        assert_eq!(report.total_files, 6);
        assert!(report.summary().contains("2 relocations"));
        assert!(report.summary().contains("2.50 GB"));
    }

    #[test]
    fn test_render_table_dry_run() {
        let mut report = RebalanceReport::new("SITE_A", RebalanceMode::Decommission, true);
        report.record(relocation(1_000_000_000, None));
        report.skip(SkippedCandidate {
            scope: "data18".to_string(),
            name: "ds2".to_string(),
            rule_id: Uuid::nil(),
            reason: SkipReason::ByteBudget,
        });
        report.finish();

        let table = report.render_table();
        assert!(table.contains("Mode:    DECOMMISSION"));
        assert!(table.contains("data18:ds1"));
        assert!(table.contains("SITE_B -"));
        assert!(table.contains("1 skipped"));
    }

    #[test]
    fn test_serializes_skip_reason() {
        let json = serde_json::to_value(SkipReason::Placement("no disk".to_string())).unwrap();
        assert_eq!(json["kind"], "placement");
        assert_eq!(json["detail"], "no disk");
        assert_eq!(
            SkipReason::ConcurrentReplica("SITE_B".into()).to_string(),
            "concurrent replica at SITE_B"
        );
    }
}
