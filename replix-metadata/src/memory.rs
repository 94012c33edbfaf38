//! In-memory metadata store
//!
//! Used for testing and development. Not persistent. Transactions stage
//! their writes and apply them under a single write lock on commit.

use crate::models::*;
use crate::store::{
    CandidateSource, EndpointCatalog, LockStore, Result, RuleStore, RuleTransaction, StoreError,
};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use replix_core::StorageEndpoint;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

#[derive(Default)]
struct State {
    rules: HashMap<Uuid, ReplicationRule>,
    locks: Vec<DatasetLock>,
    datasets: HashMap<(String, String), DatasetInfo>,
    endpoints: BTreeMap<String, StorageEndpoint>,
    /// Committed rule creations and updates
    mutations: u64,
}

impl State {
    fn duplicate_of(&self, rule: &NewRule) -> Option<Uuid> {
        self.rules
            .values()
            .find(|r| {
                !r.is_superseded()
                    && r.scope == rule.scope
                    && r.name == rule.name
                    && r.account == rule.account
                    && r.rse_expression == rule.rse_expression
            })
            .map(|r| r.id)
    }
}

/// In-memory metadata store
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<RwLock<State>>,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_endpoint(&self, endpoint: StorageEndpoint) {
        self.state
            .write()
            .endpoints
            .insert(endpoint.name.clone(), endpoint);
    }

    pub fn add_dataset(&self, dataset: DatasetInfo) {
        self.state
            .write()
            .datasets
            .insert((dataset.scope.clone(), dataset.name.clone()), dataset);
    }

    /// Insert a rule as-is, bypassing the transactional path
    pub fn add_rule(&self, rule: ReplicationRule) {
        self.state.write().rules.insert(rule.id, rule);
    }

    pub fn add_lock(&self, lock: DatasetLock) {
        self.state.write().locks.push(lock);
    }

    /// Overwrite the free-space metric of an endpoint
    pub fn set_free_space(&self, endpoint: &str, bytes: u64) {
        if let Some(ep) = self.state.write().endpoints.get_mut(endpoint) {
            ep.free_space = Some(bytes);
        }
    }

    pub fn rule(&self, id: Uuid) -> Option<ReplicationRule> {
        self.state.read().rules.get(&id).cloned()
    }

    pub fn rule_count(&self) -> usize {
        self.state.read().rules.len()
    }

    /// Number of committed rule creations and updates
    pub fn mutation_count(&self) -> u64 {
        self.state.read().mutations
    }
}

#[async_trait]
impl RuleStore for MemoryStore {
    async fn get_rule(&self, id: Uuid) -> Result<ReplicationRule> {
        self.rule(id).ok_or(StoreError::RuleNotFound(id))
    }

    async fn begin(&self) -> Result<Box<dyn RuleTransaction>> {
        Ok(Box::new(MemoryTransaction {
            state: self.state.clone(),
            staged: Vec::new(),
        }))
    }
}

#[async_trait]
impl LockStore for MemoryStore {
    async fn list_dataset_locks(&self, scope: &str, name: &str) -> Result<Vec<DatasetLock>> {
        Ok(dataset_locks(&self.state.read(), scope, name))
    }
}

#[async_trait]
impl EndpointCatalog for MemoryStore {
    async fn get_endpoint(&self, name: &str) -> Result<StorageEndpoint> {
        self.state
            .read()
            .endpoints
            .get(name)
            .cloned()
            .ok_or_else(|| StoreError::EndpointNotFound(name.to_string()))
    }

    async fn list_endpoints(&self) -> Result<Vec<StorageEndpoint>> {
        Ok(self.state.read().endpoints.values().cloned().collect())
    }
}

#[async_trait]
impl CandidateSource for MemoryStore {
    async fn scan_rows(&self, endpoint: &str) -> Result<Vec<ScanRow>> {
        let state = self.state.read();
        let mut rows = Vec::new();

        for lock in state.locks.iter().filter(|l| l.rse == endpoint) {
            let Some(rule) = state.rules.get(&lock.rule_id) else {
                continue;
            };
            if rule.state != RuleState::Open || rule.is_superseded() {
                continue;
            }
            let Some(dataset) = state
                .datasets
                .get(&(lock.scope.clone(), lock.name.clone()))
            else {
                continue;
            };

            let same_dataset = || {
                state
                    .locks
                    .iter()
                    .filter(|l| l.scope == lock.scope && l.name == lock.name)
            };
            let locks_at_endpoint = same_dataset().filter(|l| l.rse == endpoint).count() as i64;
            let archival_locks = same_dataset()
                .filter(|l| {
                    state
                        .endpoints
                        .get(&l.rse)
                        .map_or(false, |ep| ep.endpoint_type.is_archival())
                })
                .count() as i64;

            rows.push(ScanRow {
                rule: rule.clone(),
                dataset: dataset.clone(),
                accessed_at: lock.accessed_at,
                locks_at_endpoint,
                archival_locks,
            });
        }

        debug!(endpoint = endpoint, rows = rows.len(), "Collected scan rows");
        Ok(rows)
    }
}

fn dataset_locks(state: &State, scope: &str, name: &str) -> Vec<DatasetLock> {
    state
        .locks
        .iter()
        .filter(|l| l.scope == scope && l.name == name)
        .cloned()
        .collect()
}

enum Staged {
    Create(ReplicationRule),
    Update(Uuid, RuleUpdate),
}

/// Staged unit of work against a [`MemoryStore`]
pub struct MemoryTransaction {
    state: Arc<RwLock<State>>,
    staged: Vec<Staged>,
}

impl MemoryTransaction {
    fn staged_rule(&self, id: Uuid) -> bool {
        self.staged
            .iter()
            .any(|s| matches!(s, Staged::Create(rule) if rule.id == id))
    }

    fn staged_link(&self, id: Uuid) -> bool {
        self.staged
            .iter()
            .any(|s| {
                matches!(s, Staged::Update(target, u) if *target == id && u.child_rule_id.is_some())
            })
    }
}

/// Reject a commit that would leave any staged update unapplied
fn validate_staged(state: &State, staged: &[Staged]) -> Result<()> {
    let created: HashSet<Uuid> = staged
        .iter()
        .filter_map(|s| match s {
            Staged::Create(rule) => Some(rule.id),
            Staged::Update(..) => None,
        })
        .collect();

    for s in staged {
        let Staged::Update(id, update) = s else {
            continue;
        };
        match state.rules.get(id) {
            None if !created.contains(id) => {
                return Err(StoreError::Internal(format!(
                    "rule {} vanished during commit",
                    id
                )))
            }
            Some(rule) if update.child_rule_id.is_some() && rule.is_superseded() => {
                return Err(StoreError::RuleSuperseded(*id))
            }
            _ => {}
        }
    }
    Ok(())
}

#[async_trait]
impl RuleTransaction for MemoryTransaction {
    async fn list_dataset_locks(&mut self, scope: &str, name: &str) -> Result<Vec<DatasetLock>> {
        Ok(dataset_locks(&self.state.read(), scope, name))
    }

    async fn create_rule(&mut self, rule: NewRule) -> Result<Uuid> {
        let duplicate = self.state.read().duplicate_of(&rule).is_some()
            || self.staged.iter().any(|s| {
                matches!(s, Staged::Create(r) if r.scope == rule.scope
                    && r.name == rule.name
                    && r.account == rule.account
                    && r.rse_expression == rule.rse_expression)
            });
        if duplicate {
            return Err(StoreError::DuplicateRule(format!(
                "{}:{} for {} at {}",
                rule.scope, rule.name, rule.account, rule.rse_expression
            )));
        }

        let now = Utc::now();
        let id = Uuid::new_v4();
        let expires_at = rule.expires_at(now);
        self.staged.push(Staged::Create(ReplicationRule {
            id,
            scope: rule.scope,
            name: rule.name,
            did_type: rule.did_type,
            account: rule.account,
            copies: rule.copies,
            rse_expression: rule.rse_expression,
            grouping: rule.grouping,
            weight: rule.weight,
            source_replica_expression: rule.source_replica_expression,
            state: RuleState::Replicating,
            expires_at,
            locked: rule.locked,
            child_rule_id: None,
            subscription_id: rule.subscription_id,
            activity: rule.activity,
            notification: rule.notification,
            purge_replicas: rule.purge_replicas,
            priority: rule.priority,
            comments: rule.comments,
            created_at: now,
            updated_at: now,
        }));

        Ok(id)
    }

    async fn update_rule(&mut self, id: Uuid, update: RuleUpdate) -> Result<()> {
        match self.state.read().rules.get(&id) {
            None if !self.staged_rule(id) => return Err(StoreError::RuleNotFound(id)),
            Some(rule) if update.child_rule_id.is_some() && rule.is_superseded() => {
                return Err(StoreError::RuleSuperseded(id))
            }
            _ => {}
        }
        if update.child_rule_id.is_some() && self.staged_link(id) {
            return Err(StoreError::RuleSuperseded(id));
        }
        self.staged.push(Staged::Update(id, update));
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let now = Utc::now();
        let MemoryTransaction { state, staged } = *self;
        let mut state = state.write();
        validate_staged(&state, &staged)?;

        for staged in staged {
            match staged {
                Staged::Create(rule) => {
                    state.rules.insert(rule.id, rule);
                }
                Staged::Update(id, update) => {
                    let Some(rule) = state.rules.get_mut(&id) else {
                        continue;
                    };
                    if let Some(child) = update.child_rule_id {
                        rule.child_rule_id = Some(child);
                    }
                    if let Some(secs) = update.lifetime_secs {
                        rule.expires_at = Some(now + chrono::Duration::seconds(secs));
                    }
                    rule.updated_at = now;
                }
            }
            state.mutations += 1;
        }

        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        debug!(discarded = self.staged.len(), "Transaction rolled back");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use replix_core::EndpointType;

    fn new_rule(rse: &str) -> NewRule {
        NewRule {
            scope: "data18".to_string(),
            name: "ds1".to_string(),
            did_type: DidType::Dataset,
            account: "root".to_string(),
            copies: 1,
            rse_expression: rse.to_string(),
            grouping: RuleGrouping::Dataset,
            weight: None,
            lifetime_secs: None,
            locked: false,
            subscription_id: None,
            source_replica_expression: None,
            activity: "Data rebalancing".to_string(),
            notification: false,
            purge_replicas: false,
            ignore_availability: false,
            comments: None,
            ask_approval: false,
            asynchronous: false,
            ignore_account_limit: true,
            priority: 3,
        }
    }

    #[tokio::test]
    async fn test_writes_invisible_until_commit() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        let id = tx.create_rule(new_rule("SITE_A")).await.unwrap();

        assert!(store.get_rule(id).await.is_err());
        tx.commit().await.unwrap();

        let rule = store.get_rule(id).await.unwrap();
        assert_eq!(rule.rse_expression, "SITE_A");
        assert_eq!(store.mutation_count(), 1);
    }

    #[tokio::test]
    async fn test_rollback_discards_writes() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        tx.create_rule(new_rule("SITE_A")).await.unwrap();
        tx.rollback().await.unwrap();

        assert_eq!(store.rule_count(), 0);
        assert_eq!(store.mutation_count(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_rule_rejected() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        tx.create_rule(new_rule("SITE_A")).await.unwrap();
        let err = tx.create_rule(new_rule("SITE_A")).await.unwrap_err();
        assert!(matches!(err, StoreError::DuplicateRule(_)));
    }

    #[tokio::test]
    async fn test_update_links_staged_child() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        let parent = tx.create_rule(new_rule("SITE_A")).await.unwrap();
        tx.commit().await.unwrap();

        let mut tx = store.begin().await.unwrap();
        let child = tx.create_rule(new_rule("SITE_B")).await.unwrap();
        tx.update_rule(parent, RuleUpdate::supersede(child)).await.unwrap();
        tx.commit().await.unwrap();

        let parent = store.get_rule(parent).await.unwrap();
        assert_eq!(parent.child_rule_id, Some(child));
        assert!(parent.expires_at.unwrap() <= Utc::now());
    }

    #[tokio::test]
    async fn test_update_missing_rule() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        let err = tx
            .update_rule(Uuid::new_v4(), RuleUpdate::default())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::RuleNotFound(_)));
    }

    async fn linked_parent(store: &MemoryStore) -> Uuid {
        let mut tx = store.begin().await.unwrap();
        let parent = tx.create_rule(new_rule("SITE_A")).await.unwrap();
        tx.commit().await.unwrap();

        let mut tx = store.begin().await.unwrap();
        let child = tx.create_rule(new_rule("SITE_B")).await.unwrap();
        tx.update_rule(parent, RuleUpdate::supersede(child)).await.unwrap();
        tx.commit().await.unwrap();
        parent
    }

    #[tokio::test]
    async fn test_superseded_parent_cannot_be_relinked() {
        let store = MemoryStore::new();
        let parent = linked_parent(&store).await;

        let mut tx = store.begin().await.unwrap();
        let other = tx.create_rule(new_rule("SITE_C")).await.unwrap();
        let err = tx
            .update_rule(parent, RuleUpdate::supersede(other))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::RuleSuperseded(id) if id == parent));
        assert!(err.is_recoverable());

        // Lifetime-only updates stay allowed.
        tx.update_rule(parent, RuleUpdate { child_rule_id: None, lifetime_secs: Some(0) })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_racing_link_commits_nothing() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        let parent = tx.create_rule(new_rule("SITE_A")).await.unwrap();
        tx.commit().await.unwrap();

        let mut first = store.begin().await.unwrap();
        let child = first.create_rule(new_rule("SITE_B")).await.unwrap();
        first.update_rule(parent, RuleUpdate::supersede(child)).await.unwrap();

        let mut second = store.begin().await.unwrap();
        let late = second.create_rule(new_rule("SITE_C")).await.unwrap();
        second.update_rule(parent, RuleUpdate::supersede(late)).await.unwrap();

        first.commit().await.unwrap();
        let mutations = store.mutation_count();
        let err = second.commit().await.unwrap_err();

        assert!(matches!(err, StoreError::RuleSuperseded(_)));
        assert!(store.rule(late).is_none());
        assert_eq!(store.rule(parent).unwrap().child_rule_id, Some(child));
        assert_eq!(store.mutation_count(), mutations);
    }

    #[tokio::test]
    async fn test_superseded_rule_not_a_duplicate() {
        let store = MemoryStore::new();
        linked_parent(&store).await;

        let mut tx = store.begin().await.unwrap();
        tx.create_rule(new_rule("SITE_A")).await.unwrap();
        tx.commit().await.unwrap();
        assert_eq!(store.rule_count(), 3);
    }

    #[tokio::test]
    async fn test_resolve_expression_uses_endpoints() {
        let store = MemoryStore::new();
        store.add_endpoint(StorageEndpoint::new("A", EndpointType::Disk, 2));
        store.add_endpoint(StorageEndpoint::new("B", EndpointType::Disk, 2).read_only());
        store.add_endpoint(StorageEndpoint::new("C", EndpointType::Archival, 1));

        let all = store
            .resolve_expression("tier=2", &Default::default())
            .await
            .unwrap();
        assert_eq!(all.len(), 2);

        let writable = store
            .resolve_expression("tier=2", &replix_core::ExpressionFilter::writable())
            .await
            .unwrap();
        assert_eq!(writable.into_iter().collect::<Vec<_>>(), vec!["A".to_string()]);

        assert!(store.resolve_expression("tier=(", &Default::default()).await.is_err());
        assert!(matches!(
            store.get_endpoint("Z").await,
            Err(StoreError::EndpointNotFound(_))
        ));
    }
}
