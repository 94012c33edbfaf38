//! Weighted Endpoint Selector
//!
//! Picks target endpoints at random, with probability proportional to their
//! free space. The free-space metric is injectable so placement can be
//! reproduced with synthetic values, and the RNG is seeded so a run is
//! deterministic for a given seed.

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use replix_metadata::{EndpointCatalog, StoreError};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// Selection errors
#[derive(Error, Debug)]
pub enum SelectionError {
    #[error("Insufficient target endpoints: {have} eligible, {need} required")]
    InsufficientTargets { have: usize, need: usize },

    #[error("Free space metric unavailable: {0}")]
    Metric(#[from] StoreError),
}

pub type Result<T> = std::result::Result<T, SelectionError>;

/// Live free-space metric of an endpoint
#[async_trait]
pub trait FreeSpaceSource: Send + Sync {
    /// Free bytes at `endpoint`, `None` when the metric is not published
    async fn free_space(&self, endpoint: &str) -> std::result::Result<Option<u64>, StoreError>;
}

/// Free space as recorded in the endpoint catalog
pub struct CatalogFreeSpace<C> {
    catalog: Arc<C>,
}

impl<C> CatalogFreeSpace<C> {
    pub fn new(catalog: Arc<C>) -> Self {
        Self { catalog }
    }
}

#[async_trait]
impl<C: EndpointCatalog> FreeSpaceSource for CatalogFreeSpace<C> {
    async fn free_space(&self, endpoint: &str) -> std::result::Result<Option<u64>, StoreError> {
        match self.catalog.get_endpoint(endpoint).await {
            Ok(ep) => Ok(ep.free_space),
            Err(StoreError::EndpointNotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// Fixed metric values
#[derive(Debug, Clone, Default)]
pub struct StaticFreeSpace {
    values: HashMap<String, u64>,
}

impl StaticFreeSpace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, endpoint: impl Into<String>, bytes: u64) -> Self {
        self.values.insert(endpoint.into(), bytes);
        self
    }
}

#[async_trait]
impl FreeSpaceSource for StaticFreeSpace {
    async fn free_space(&self, endpoint: &str) -> std::result::Result<Option<u64>, StoreError> {
        Ok(self.values.get(endpoint).copied())
    }
}

/// Free-space weighted endpoint selector
pub struct WeightedEndpointSelector<F> {
    metric: F,
    rng: Mutex<StdRng>,
    /// Number of selections performed
    selections: AtomicU64,
}

impl<F: FreeSpaceSource> WeightedEndpointSelector<F> {
    /// Create a selector; without a seed the RNG is seeded from entropy
    pub fn new(metric: F, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        Self {
            metric,
            rng: Mutex::new(rng),
            selections: AtomicU64::new(0),
        }
    }

    /// Select `copies` distinct endpoints out of `candidates`.
    ///
    /// Blacklisted endpoints, endpoints without a metric value, full endpoints
    /// and endpoints with less than `size_hint` free bytes are never chosen.
    pub async fn select(
        &self,
        candidates: &BTreeSet<String>,
        size_hint: u64,
        blacklist: &HashSet<String>,
        copies: usize,
    ) -> Result<Vec<String>> {
        self.selections.fetch_add(1, Ordering::Relaxed);

        let mut weighted = Vec::with_capacity(candidates.len());
        for endpoint in candidates.iter().filter(|e| !blacklist.contains(*e)) {
            match self.metric.free_space(endpoint).await? {
                Some(free) if free > 0 && free >= size_hint => {
                    weighted.push((endpoint.clone(), free))
                }
                _ => {}
            }
        }

        if weighted.len() < copies {
            return Err(SelectionError::InsufficientTargets {
                have: weighted.len(),
                need: copies,
            });
        }

        let chosen = self.pick(weighted, copies);
        debug!(candidates = candidates.len(), chosen = ?chosen, "Selected endpoints");
        Ok(chosen)
    }

    /// Number of times `select` has been invoked
    pub fn selection_count(&self) -> u64 {
        self.selections.load(Ordering::Relaxed)
    }

    /// Weighted draw without replacement; every weight is positive
    fn pick(&self, mut weighted: Vec<(String, u64)>, copies: usize) -> Vec<String> {
        let mut rng = self.rng.lock();
        let mut chosen = Vec::with_capacity(copies);

        for _ in 0..copies {
            let total: u128 = weighted.iter().map(|(_, w)| *w as u128).sum();
            let mut point = rng.gen_range(0..total);
            let idx = weighted
                .iter()
                .position(|(_, w)| {
                    let w = *w as u128;
                    if point < w {
                        true
                    } else {
                        point -= w;
                        false
                    }
                })
                .unwrap_or(weighted.len() - 1);
            chosen.push(weighted.swap_remove(idx).0);
        }

        chosen
    }
}
