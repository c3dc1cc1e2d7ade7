//! Features manager: the single authority mapping feature identities to ids
//! and discretization borders.
//!
//! Static features (dense float, one-hot categorical, precomputed CTR) are
//! registered at construction. Tree-CTR features are registered lazily by
//! whichever scorer discovers them first; registration is atomic
//! check-then-insert under a single lock, so concurrent discovery of the
//! same CTR from several devices lands on exactly one entry.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use super::{Ctr, CtrConfig, FeatureId};

/// Kind of a statically registered feature.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StaticFeature {
    /// Continuous feature with threshold borders.
    Float,
    /// Categorical feature tested with a one-hot "take bin" split.
    Categorical,
    /// Precomputed target-statistic feature (static CTR).
    Ctr,
}

struct FeatureEntry {
    kind: StaticFeature,
    borders: Arc<[f32]>,
}

struct Registry {
    entries: Vec<FeatureEntry>,
    ctr_ids: HashMap<Ctr, FeatureId>,
    ctr_by_id: HashMap<FeatureId, Ctr>,
}

/// Thread-safe feature registry.
///
/// Only manager state persists across boosting iterations; everything else
/// in the search engine is rebuilt per tree.
pub struct FeaturesManager {
    registry: Mutex<Registry>,
    ctr_configs: Vec<CtrConfig>,
    tree_ctrs_enabled: bool,
}

impl FeaturesManager {
    /// Create a manager with no features registered.
    ///
    /// `ctr_configs` lists the statistic configurations synthesized for
    /// tree CTRs; an empty list disables tree-CTR search.
    pub fn new(ctr_configs: Vec<CtrConfig>) -> Self {
        let tree_ctrs_enabled = !ctr_configs.is_empty();
        Self {
            registry: Mutex::new(Registry {
                entries: Vec::new(),
                ctr_ids: HashMap::new(),
                ctr_by_id: HashMap::new(),
            }),
            ctr_configs,
            tree_ctrs_enabled,
        }
    }

    /// Register a static feature; returns its global id.
    ///
    /// Ids are dense and assigned in registration order, so callers can
    /// register features in dataset order and use the ids directly in grids.
    pub fn register_feature(
        &self,
        kind: StaticFeature,
        borders: impl Into<Arc<[f32]>>,
    ) -> FeatureId {
        let mut registry = self.registry.lock().expect("feature registry poisoned");
        registry.entries.push(FeatureEntry {
            kind,
            borders: borders.into(),
        });
        (registry.entries.len() - 1) as FeatureId
    }

    /// Whether the CTR identity already has an id and borders.
    pub fn is_known(&self, ctr: &Ctr) -> bool {
        let registry = self.registry.lock().expect("feature registry poisoned");
        registry.ctr_ids.contains_key(ctr)
    }

    /// Register a CTR with its borders; returns its id.
    ///
    /// Idempotent: if the identity is already registered the existing id is
    /// returned and the borders argument is discarded. Finding the entry
    /// present is the expected outcome of a discovery race, not an error.
    pub fn add_ctr(&self, ctr: Ctr, borders: Vec<f32>) -> FeatureId {
        let mut registry = self.registry.lock().expect("feature registry poisoned");
        if let Some(&id) = registry.ctr_ids.get(&ctr) {
            return id;
        }
        registry.entries.push(FeatureEntry {
            kind: StaticFeature::Ctr,
            borders: borders.into(),
        });
        let id = (registry.entries.len() - 1) as FeatureId;
        registry.ctr_ids.insert(ctr.clone(), id);
        registry.ctr_by_id.insert(id, ctr);
        id
    }

    /// Id of a registered CTR identity.
    pub fn ctr_feature_id(&self, ctr: &Ctr) -> Option<FeatureId> {
        let registry = self.registry.lock().expect("feature registry poisoned");
        registry.ctr_ids.get(ctr).copied()
    }

    /// CTR identity behind a feature id, if the feature is a tree CTR.
    pub fn ctr_for_id(&self, id: FeatureId) -> Option<Ctr> {
        let registry = self.registry.lock().expect("feature registry poisoned");
        registry.ctr_by_id.get(&id).cloned()
    }

    /// Discretization borders of a feature.
    pub fn borders(&self, id: FeatureId) -> Arc<[f32]> {
        let registry = self.registry.lock().expect("feature registry poisoned");
        Arc::clone(&registry.entries[id as usize].borders)
    }

    pub fn is_cat(&self, id: FeatureId) -> bool {
        let registry = self.registry.lock().expect("feature registry poisoned");
        registry.entries[id as usize].kind == StaticFeature::Categorical
    }

    pub fn is_ctr(&self, id: FeatureId) -> bool {
        let registry = self.registry.lock().expect("feature registry poisoned");
        registry.entries[id as usize].kind == StaticFeature::Ctr
    }

    /// Number of registered features (static plus discovered CTRs).
    pub fn feature_count(&self) -> usize {
        let registry = self.registry.lock().expect("feature registry poisoned");
        registry.entries.len()
    }

    /// Statistic configurations synthesized for tree CTRs.
    #[inline]
    pub fn ctr_configs(&self) -> &[CtrConfig] {
        &self.ctr_configs
    }

    #[inline]
    pub fn tree_ctrs_enabled(&self) -> bool {
        self.tree_ctrs_enabled
    }
}
