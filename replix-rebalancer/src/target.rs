//! Target Selector
//!
//! Computes the new RSE expression for a rule being moved off an endpoint.
//! Tier policy:
//! - tier 1 moves to another tier-1 disk endpoint
//! - tier 2 moves to another tier-2 disk endpoint
//! - tier 3 moves to a tier-2 disk endpoint
//!
//! Non-disk sources need an explicit force expression.

use crate::selector::{FreeSpaceSource, SelectionError, WeightedEndpointSelector};
use replix_core::expression::{difference, union_difference};
use replix_core::{EndpointType, ExpressionFilter, StorageEndpoint};
use replix_core::{TIER_LOCAL, TIER_PRIMARY, TIER_REGIONAL};
use replix_metadata::{EndpointCatalog, ReplicationRule, RuleGrouping, StoreError};
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, instrument, warn};

/// Placement errors
#[derive(Error, Debug)]
pub enum PlacementError {
    #[error("Insufficient target endpoints: {0}")]
    InsufficientTargets(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl PlacementError {
    /// Whether only the current candidate is affected
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::InsufficientTargets(_) => true,
            Self::Store(e) => e.is_recoverable(),
        }
    }
}

impl From<SelectionError> for PlacementError {
    fn from(err: SelectionError) -> Self {
        match err {
            SelectionError::InsufficientTargets { .. } => Self::InsufficientTargets(err.to_string()),
            SelectionError::Metric(e) => Self::Store(e),
        }
    }
}

impl From<PlacementError> for StoreError {
    fn from(err: PlacementError) -> Self {
        match err {
            PlacementError::InsufficientTargets(msg) => StoreError::InsufficientTargets(msg),
            PlacementError::Store(e) => e,
        }
    }
}

pub type Result<T> = std::result::Result<T, PlacementError>;

/// Administrative placement overrides
#[derive(Debug, Clone, Default)]
pub struct PlacementOverrides {
    /// Endpoints that must not receive the data
    pub exclude_expression: Option<String>,
    /// Endpoints the data must go to
    pub force_expression: Option<String>,
}

/// Target selector
pub struct TargetSelector<C, F> {
    catalog: Arc<C>,
    selector: WeightedEndpointSelector<F>,
}

impl<C: EndpointCatalog, F: FreeSpaceSource> TargetSelector<C, F> {
    pub fn new(catalog: Arc<C>, selector: WeightedEndpointSelector<F>) -> Self {
        Self { catalog, selector }
    }

    pub fn selector(&self) -> &WeightedEndpointSelector<F> {
        &self.selector
    }

    /// Choose the RSE expression replacing `source_expression` for `rule`.
    ///
    /// `other_endpoints` already hold a lock for the dataset and are never
    /// picked.
    #[instrument(skip_all, fields(rule_id = %rule.id, source = %source.name))]
    pub async fn select(
        &self,
        rule: &ReplicationRule,
        source: &StorageEndpoint,
        source_expression: &str,
        other_endpoints: &HashSet<String>,
        overrides: &PlacementOverrides,
    ) -> Result<String> {
        if !source.endpoint_type.is_disk() && overrides.force_expression.is_none() {
            warn!(
                endpoint_type = %source.endpoint_type,
                "Non-disk endpoints need a force expression"
            );
            return Err(PlacementError::InsufficientTargets(format!(
                "{} is not a disk endpoint and no force expression was given",
                source.name
            )));
        }

        let exclusion = target_exclusion(source, overrides.exclude_expression.as_deref());
        let writable = ExpressionFilter::writable();

        let expression = match &overrides.force_expression {
            Some(force) if rule.grouping == RuleGrouping::None => {
                // Keep covering the parts of the dataset not at the source.
                union_difference(force, source_expression, &exclusion)
            }
            Some(force) => difference(force, &exclusion),
            None => {
                let current = self
                    .catalog
                    .resolve_expression(source_expression, &ExpressionFilter::default())
                    .await?;
                if current.len() > 1 {
                    let target = difference(source_expression, &exclusion);
                    debug!(target = %target, "Source expression already distributed");
                    return Ok(target);
                }
                tier_expression(source, &exclusion)?
            }
        };

        let candidates = self.catalog.resolve_expression(&expression, &writable).await?;
        debug!(expression = %expression, candidates = candidates.len(), "Resolved targets");

        let chosen = self
            .selector
            .select(&candidates, 0, other_endpoints, 1)
            .await?;

        chosen
            .into_iter()
            .next()
            .ok_or_else(|| PlacementError::InsufficientTargets(expression))
    }
}

/// Endpoints excluded from placement: the exclude expression minus the
/// source, or just the source.
pub fn target_exclusion(source: &StorageEndpoint, exclude_expression: Option<&str>) -> String {
    match exclude_expression {
        Some(exclude) => difference(exclude, &source.name),
        None => source.name.clone(),
    }
}

fn tier_expression(source: &StorageEndpoint, exclusion: &str) -> Result<String> {
    let tier = match source.tier {
        TIER_PRIMARY => TIER_PRIMARY,
        TIER_REGIONAL | TIER_LOCAL => TIER_REGIONAL,
        other => {
            return Err(PlacementError::InsufficientTargets(format!(
                "no placement policy for tier {} endpoint {}",
                other, source.name
            )))
        }
    };

    Ok(difference(
        &format!("tier={}&type={}", tier, EndpointType::Disk.as_str()),
        exclusion,
    ))
}
