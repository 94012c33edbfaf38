//! Rule derivation
//!
//! Creates the child rule of a relocation and links its parent inside one
//! unit of work: the parent becomes visible as superseded exactly when the
//! child is committed.

use chrono::{DateTime, Utc};
use replix_metadata::{
    NewRule, ReplicationRule, Result, RuleStore, RuleTransaction, RuleUpdate,
};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Outcome of a derivation attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Derivation {
    /// Child committed and parent linked
    Created(Uuid),
    /// The dataset is already locked at the target; nothing was written
    ConcurrentReplica,
}

/// Fields of the child rule not inherited from the parent
#[derive(Debug, Clone, Default)]
pub struct DerivationOptions {
    /// Replaces the parent's activity
    pub activity: Option<String>,
    pub priority: i32,
    /// Replaces the parent's source replica expression
    pub source_replica_expression: Option<String>,
    /// Replaces the parent's comment
    pub comment: Option<String>,
}

/// Child rule placing the parent's dataset at `target_expression`
pub fn child_rule(
    parent: &ReplicationRule,
    target_expression: &str,
    options: &DerivationOptions,
    now: DateTime<Utc>,
) -> NewRule {
    NewRule {
        scope: parent.scope.clone(),
        name: parent.name.clone(),
        did_type: parent.did_type,
        account: parent.account.clone(),
        copies: parent.copies,
        rse_expression: target_expression.to_string(),
        grouping: parent.grouping,
        weight: parent.weight.clone(),
        lifetime_secs: parent.remaining_lifetime(now).map(|d| d.num_seconds()),
        locked: parent.locked,
        subscription_id: parent.subscription_id,
        source_replica_expression: options
            .source_replica_expression
            .clone()
            .or_else(|| parent.source_replica_expression.clone()),
        activity: options
            .activity
            .clone()
            .unwrap_or_else(|| parent.activity.clone()),
        notification: parent.notification,
        purge_replicas: parent.purge_replicas,
        ignore_availability: false,
        comments: options.comment.clone().or_else(|| parent.comments.clone()),
        ask_approval: false,
        asynchronous: false,
        ignore_account_limit: true,
        priority: options.priority,
    }
}

/// Derive a child of `parent` at `target_expression` and supersede the parent.
///
/// Any error rolls the unit of work back; no partial state is committed.
#[instrument(skip(store, parent, options), fields(parent = %parent.id))]
pub async fn derive_rule<S>(
    store: &S,
    parent: &ReplicationRule,
    target_expression: &str,
    options: &DerivationOptions,
) -> Result<Derivation>
where
    S: RuleStore + ?Sized,
{
    let mut tx = store.begin().await?;

    match link_child(tx.as_mut(), parent, target_expression, options).await {
        Ok(Derivation::Created(child)) => {
            tx.commit().await?;
            info!(child = %child, target = target_expression, "Derived rule committed");
            Ok(Derivation::Created(child))
        }
        Ok(Derivation::ConcurrentReplica) => {
            tx.rollback().await?;
            Ok(Derivation::ConcurrentReplica)
        }
        Err(e) => {
            if let Err(rollback) = tx.rollback().await {
                warn!(error = %rollback, "Rollback failed");
            }
            Err(e)
        }
    }
}

async fn link_child(
    tx: &mut dyn RuleTransaction,
    parent: &ReplicationRule,
    target_expression: &str,
    options: &DerivationOptions,
) -> Result<Derivation> {
    let locks = tx.list_dataset_locks(&parent.scope, &parent.name).await?;
    if locks.iter().any(|lock| lock.rse == target_expression) {
        debug!(target = target_expression, "Concurrent replica exists at target");
        return Ok(Derivation::ConcurrentReplica);
    }

    let child = tx
        .create_rule(child_rule(parent, target_expression, options, Utc::now()))
        .await?;
    tx.update_rule(parent.id, RuleUpdate::supersede(child)).await?;

    Ok(Derivation::Created(child))
}
