//! Builder assembling a [`SearchDataSet`] and registering its features.
//!
//! Dataset binarization itself is external; the builder takes already
//! binarized columns, registers every feature with the features manager so
//! ids stay authoritative in one place, and distributes feature columns
//! across devices round-robin.

use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_xoshiro::Xoshiro256PlusPlus;

use crate::execution::DeviceId;
use crate::features::{FeaturesManager, StaticFeature};

use super::{BinnedGrid, CatFeatureStorage, DatasetId, GridFeature, SearchDataSet};

/// Builder for [`SearchDataSet`].
pub struct SearchDataSetBuilder<'a> {
    manager: &'a FeaturesManager,
    doc_count: usize,
    device_count: usize,
    next_device: DeviceId,

    dense_features: Vec<GridFeature>,
    dense_columns: Vec<Vec<u8>>,
    binary_features: Vec<GridFeature>,
    binary_columns: Vec<Vec<u8>>,
    ctr_features: Vec<GridFeature>,
    ctr_columns: Vec<Vec<u8>>,

    cat_ids: Vec<u32>,
    cat_value_counts: Vec<u32>,
    cat_values: Vec<u32>,

    indices: Option<Vec<u32>>,
    ctr_permutations: Vec<Vec<u32>>,
}

impl<'a> SearchDataSetBuilder<'a> {
    pub fn new(manager: &'a FeaturesManager, doc_count: usize, device_count: usize) -> Self {
        assert!(device_count > 0);
        Self {
            manager,
            doc_count,
            device_count,
            next_device: 0,
            dense_features: Vec::new(),
            dense_columns: Vec::new(),
            binary_features: Vec::new(),
            binary_columns: Vec::new(),
            ctr_features: Vec::new(),
            ctr_columns: Vec::new(),
            cat_ids: Vec::new(),
            cat_value_counts: Vec::new(),
            cat_values: Vec::new(),
            indices: None,
            ctr_permutations: Vec::new(),
        }
    }

    fn take_device(&mut self) -> DeviceId {
        let device = self.next_device;
        self.next_device = (self.next_device + 1) % self.device_count;
        device
    }

    /// Dense numeric feature: `borders.len() + 1` bins, document order.
    pub fn add_float_feature(mut self, borders: Vec<f32>, bins: Vec<u8>) -> Self {
        assert_eq!(bins.len(), self.doc_count);
        let bin_count = borders.len() as u32 + 1;
        let feature_id = self.manager.register_feature(StaticFeature::Float, borders);
        let device = self.take_device();
        self.dense_features.push(GridFeature {
            feature_id,
            bin_count,
            one_hot: false,
            device,
        });
        self.dense_columns.push(bins);
        self
    }

    /// Binary feature: a single border, document order.
    pub fn add_binary_feature(mut self, border: f32, bins: Vec<u8>) -> Self {
        assert_eq!(bins.len(), self.doc_count);
        let feature_id = self
            .manager
            .register_feature(StaticFeature::Float, vec![border]);
        let device = self.take_device();
        self.binary_features.push(GridFeature {
            feature_id,
            bin_count: 2,
            one_hot: false,
            device,
        });
        self.binary_columns.push(bins);
        self
    }

    /// One-hot categorical feature scored as a dense column, document order.
    pub fn add_one_hot_feature(mut self, value_count: u32, bins: Vec<u8>) -> Self {
        assert_eq!(bins.len(), self.doc_count);
        let feature_id = self
            .manager
            .register_feature(StaticFeature::Categorical, Vec::new());
        let device = self.take_device();
        self.dense_features.push(GridFeature {
            feature_id,
            bin_count: value_count,
            one_hot: true,
            device,
        });
        self.dense_columns.push(bins);
        self
    }

    /// Precomputed target-CTR feature; bins in dataset row order.
    pub fn add_precomputed_ctr(mut self, borders: Vec<f32>, bins: Vec<u8>) -> Self {
        assert_eq!(bins.len(), self.doc_count);
        let bin_count = borders.len() as u32 + 1;
        let feature_id = self.manager.register_feature(StaticFeature::Ctr, borders);
        let device = self.take_device();
        self.ctr_features.push(GridFeature {
            feature_id,
            bin_count,
            one_hot: false,
            device,
        });
        self.ctr_columns.push(bins);
        self
    }

    /// Raw categorical feature, joint-key source for tree CTRs.
    pub fn add_cat_feature(mut self, value_count: u32, values: Vec<u32>) -> Self {
        assert_eq!(values.len(), self.doc_count);
        debug_assert!(values.iter().all(|&v| v < value_count));
        let feature_id = self
            .manager
            .register_feature(StaticFeature::Categorical, Vec::new());
        self.cat_ids.push(feature_id);
        self.cat_value_counts.push(value_count);
        self.cat_values.extend_from_slice(&values);
        self
    }

    /// Learn permutation (`indices[row] = document id`); identity if unset.
    pub fn indices(mut self, indices: Vec<u32>) -> Self {
        assert_eq!(indices.len(), self.doc_count);
        self.indices = Some(indices);
        self
    }

    /// Generate `count` deterministic document orders for CTR computation.
    pub fn ctr_permutations(mut self, count: usize, seed: u64) -> Self {
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(seed);
        self.ctr_permutations = (0..count)
            .map(|_| {
                let mut order: Vec<u32> = (0..self.doc_count as u32).collect();
                order.shuffle(&mut rng);
                order
            })
            .collect();
        self
    }

    pub fn build(self, id: DatasetId) -> SearchDataSet {
        let doc_count = self.doc_count;
        let indices = self
            .indices
            .unwrap_or_else(|| (0..doc_count as u32).collect());

        SearchDataSet::new(
            id,
            doc_count,
            BinnedGrid::new(self.dense_features, self.dense_columns, doc_count),
            BinnedGrid::new(self.binary_features, self.binary_columns, doc_count),
            BinnedGrid::new(self.ctr_features, self.ctr_columns, doc_count),
            CatFeatureStorage::new(
                self.cat_ids,
                self.cat_value_counts,
                self.cat_values,
                doc_count,
            ),
            indices,
            self.ctr_permutations,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::GridFamily;

    #[test]
    fn builder_registers_features_in_order() {
        let manager = FeaturesManager::new(Vec::new());
        let dataset = SearchDataSetBuilder::new(&manager, 4, 2)
            .add_float_feature(vec![0.5, 1.5], vec![0, 1, 2, 1])
            .add_binary_feature(0.5, vec![0, 1, 0, 1])
            .add_cat_feature(3, vec![0, 1, 2, 0])
            .build(DatasetId(7));

        assert_eq!(manager.feature_count(), 3);
        assert_eq!(dataset.locate(0), Some((GridFamily::Dense, 0)));
        assert_eq!(dataset.locate(1), Some((GridFamily::Binary, 0)));
        assert!(manager.is_cat(2));
        assert_eq!(dataset.cat_features().value_count(2), 3);
    }

    #[test]
    fn permutations_are_deterministic() {
        let manager = FeaturesManager::new(Vec::new());
        let a = SearchDataSetBuilder::new(&manager, 16, 1)
            .ctr_permutations(2, 42)
            .build(DatasetId(0));
        let manager2 = FeaturesManager::new(Vec::new());
        let b = SearchDataSetBuilder::new(&manager2, 16, 1)
            .ctr_permutations(2, 42)
            .build(DatasetId(0));

        assert_eq!(a.ctr_permutations(), b.ctr_permutations());
        assert_ne!(a.ctr_permutations()[0], a.ctr_permutations()[1]);
    }

    #[test]
    fn devices_round_robin() {
        let manager = FeaturesManager::new(Vec::new());
        let dataset = SearchDataSetBuilder::new(&manager, 2, 2)
            .add_float_feature(vec![0.5], vec![0, 1])
            .add_float_feature(vec![0.5], vec![1, 0])
            .add_float_feature(vec![0.5], vec![0, 0])
            .build(DatasetId(1));

        let devices: Vec<_> = dataset
            .features()
            .features()
            .iter()
            .map(|f| f.device)
            .collect();
        assert_eq!(devices, vec![0, 1, 0]);
    }
}
