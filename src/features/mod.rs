//! Feature identities: tensors, CTR configurations, and the features manager.
//!
//! A *tensor* is a combination of categorical feature ids (plus any binary
//! splits already applied to it) treated as a joint key for CTR computation.
//! A *CTR* is a tensor together with a statistic configuration; its identity
//! is value-based, never pointer-based, because the same combination can be
//! discovered independently on several devices.

mod manager;

pub use manager::{FeaturesManager, StaticFeature};

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

use crate::tree::BinarySplit;

/// Global feature identifier assigned by the [`FeaturesManager`].
pub type FeatureId = u32;

/// Sentinel id meaning "no feature" (no candidates existed at all).
pub const INVALID_FEATURE: FeatureId = FeatureId::MAX;

/// A combination of categorical feature ids plus applied binary splits,
/// used as the joint key for CTR computation.
///
/// Identity is value-based: two tensors with the same sorted categorical
/// ids and the same split sequence are the same tensor.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FeatureTensor {
    cat_features: Vec<FeatureId>,
    splits: Vec<BinarySplit>,
}

impl FeatureTensor {
    /// Tensor over a single categorical feature.
    pub fn from_cat_feature(feature: FeatureId) -> Self {
        Self {
            cat_features: vec![feature],
            splits: Vec::new(),
        }
    }

    /// Add a categorical feature to the combination (keeps ids sorted and unique).
    pub fn add_cat_feature(&mut self, feature: FeatureId) {
        if let Err(pos) = self.cat_features.binary_search(&feature) {
            self.cat_features.insert(pos, feature);
        }
    }

    /// Add an applied binary split to the combination.
    pub fn add_binary_split(&mut self, split: BinarySplit) {
        if !self.splits.contains(&split) {
            self.splits.push(split);
        }
    }

    #[inline]
    pub fn cat_features(&self) -> &[FeatureId] {
        &self.cat_features
    }

    #[inline]
    pub fn splits(&self) -> &[BinarySplit] {
        &self.splits
    }

    /// Tensor complexity: number of joined categorical features.
    #[inline]
    pub fn complexity(&self) -> usize {
        self.cat_features.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.cat_features.is_empty() && self.splits.is_empty()
    }

    /// Stable 64-bit hash used for per-tensor noise-seed derivation.
    ///
    /// `DefaultHasher::new()` uses fixed keys, so the value is reproducible
    /// across runs for the same tensor.
    pub fn hash64(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.hash(&mut hasher);
        hasher.finish()
    }
}

/// CTR statistic kind.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum CtrType {
    /// Per-bucket target sums over the joint key.
    Buckets,
    /// Frequency of the joint key value.
    FeatureFreq,
    /// Borders-classified target statistics.
    Borders,
}

/// CTR statistic configuration: kind plus prior.
#[derive(Clone, Copy, Debug)]
pub struct CtrConfig {
    pub ctr_type: CtrType,
    pub prior: f32,
}

impl CtrConfig {
    pub fn new(ctr_type: CtrType, prior: f32) -> Self {
        Self { ctr_type, prior }
    }
}

// Prior is compared bitwise so configs stay usable as map keys.
impl PartialEq for CtrConfig {
    fn eq(&self, other: &Self) -> bool {
        self.ctr_type == other.ctr_type && self.prior.to_bits() == other.prior.to_bits()
    }
}

impl Eq for CtrConfig {}

impl Hash for CtrConfig {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.ctr_type.hash(state);
        self.prior.to_bits().hash(state);
    }
}

/// A categorical target statistic: tensor plus configuration.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Ctr {
    pub tensor: FeatureTensor,
    pub config: CtrConfig,
}

impl Ctr {
    pub fn new(tensor: FeatureTensor, config: CtrConfig) -> Self {
        Self { tensor, config }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tensor_identity_is_value_based() {
        let mut a = FeatureTensor::from_cat_feature(3);
        a.add_cat_feature(1);
        let mut b = FeatureTensor::from_cat_feature(1);
        b.add_cat_feature(3);

        assert_eq!(a, b);
        assert_eq!(a.hash64(), b.hash64());
        assert_eq!(a.complexity(), 2);
    }

    #[test]
    fn tensor_dedups_features() {
        let mut t = FeatureTensor::from_cat_feature(2);
        t.add_cat_feature(2);
        assert_eq!(t.cat_features(), &[2]);
    }

    #[test]
    fn tensor_hash_is_stable_across_clones() {
        let mut t = FeatureTensor::from_cat_feature(7);
        t.add_cat_feature(4);
        assert_eq!(t.hash64(), t.clone().hash64());
    }

    #[test]
    fn ctr_config_compares_prior_bitwise() {
        let a = CtrConfig::new(CtrType::Buckets, 0.5);
        let b = CtrConfig::new(CtrType::Buckets, 0.5);
        let c = CtrConfig::new(CtrType::Buckets, 0.25);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
