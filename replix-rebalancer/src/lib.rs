//! Replix Rebalancer Library
//!
//! Relieves a storage endpoint of load by moving eligible replication rules
//! elsewhere. A move never transfers bytes itself: it creates a derived rule
//! at the new target and retires the original, and the transfer subsystem
//! satisfies the new rule later.
//!
//! The rebalancer performs:
//! - Candidate scanning (live tables, or weekly lock dumps when decommissioning)
//! - Target selection under tier policy with free-space weighting
//! - Transactional rule derivation within byte and file budgets

pub mod config;
pub mod derivation;
pub mod feed;
pub mod orchestrator;
pub mod report;
pub mod scanner;
pub mod selector;
pub mod target;

// Re-export main types
pub use config::{ConfigError, RebalancerConfig};
pub use derivation::{derive_rule, Derivation, DerivationOptions};
pub use feed::{FeedError, FileLockDumpFeed, HttpLockDumpFeed, LockDumpFeed};
pub use orchestrator::{
    CandidateOutcome, Orchestrator, RebalanceBudget, RebalanceError, RebalanceRequest,
};
pub use report::{RebalanceReport, Relocation, SkipReason, SkippedCandidate};
pub use scanner::{EligibilityPolicy, RebalanceCandidate, RebalanceMode, Scanner};
pub use selector::{
    CatalogFreeSpace, FreeSpaceSource, SelectionError, StaticFreeSpace, WeightedEndpointSelector,
};
pub use target::{PlacementError, PlacementOverrides, TargetSelector};
