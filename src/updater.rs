//! Tree updater: applies chosen splits to the per-document leaf bins.
//!
//! Leaf bins shift one bit per depth (`leaf' = leaf << 1 | predicate`), so
//! sibling leaves stay adjacent and the subset re-partitioning after a
//! split is a stable sort on the extended bin. Splits on static features
//! read their grid column; tree-CTR splits arrive as precomputed predicate
//! bits because the winning CTR column only exists on the device that
//! scored it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use fixedbitset::FixedBitSet;

use crate::data::{DatasetId, SearchDataSet};
use crate::tree::{BinarySplit, SplitKind};

/// Final leaf bins per dataset, kept for leaf-value estimation after the
/// structure search returns.
#[derive(Default)]
pub struct BinCache {
    bins: Mutex<HashMap<DatasetId, Arc<Vec<u32>>>>,
}

impl BinCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn store(&self, id: DatasetId, bins: Vec<u32>) -> Arc<Vec<u32>> {
        let bins = Arc::new(bins);
        let mut cache = self.bins.lock().expect("bin cache poisoned");
        cache.insert(id, Arc::clone(&bins));
        bins
    }

    pub fn get(&self, id: DatasetId) -> Option<Arc<Vec<u32>>> {
        let cache = self.bins.lock().expect("bin cache poisoned");
        cache.get(&id).cloned()
    }
}

/// Per-tree leaf assignment, one `u32` leaf index per document.
pub struct TreeUpdater<'a> {
    dataset: &'a SearchDataSet,
    doc_bins: Vec<u32>,
    depth: u32,
}

impl<'a> TreeUpdater<'a> {
    pub fn new(dataset: &'a SearchDataSet) -> Self {
        Self {
            dataset,
            doc_bins: vec![0; dataset.doc_count()],
            depth: 0,
        }
    }

    #[inline]
    pub fn depth(&self) -> u32 {
        self.depth
    }

    /// Current leaf of every document.
    #[inline]
    pub fn doc_bins(&self) -> &[u32] {
        &self.doc_bins
    }

    /// Apply a split on a static feature by reading its grid column.
    ///
    /// # Panics
    /// Panics if the feature has no column in any static grid family;
    /// tree-CTR splits must go through [`add_split_with_bits`](Self::add_split_with_bits).
    pub fn add_split(&mut self, split: &BinarySplit) -> &[u32] {
        for doc in 0..self.doc_bins.len() {
            let bin = match self.dataset.static_bin(split.feature_id, doc) {
                Some(bin) => bin as u32,
                None => panic!("feature {} has no static column", split.feature_id),
            };
            let bit = match split.kind {
                SplitKind::TakeGreater => bin > split.bin_id,
                SplitKind::TakeBin => bin == split.bin_id,
            };
            self.doc_bins[doc] = (self.doc_bins[doc] << 1) | bit as u32;
        }
        self.depth += 1;
        &self.doc_bins
    }

    /// Apply a split from precomputed per-document predicate bits.
    pub fn add_split_with_bits(&mut self, bits: &FixedBitSet) -> &[u32] {
        assert_eq!(bits.len(), self.doc_bins.len());
        for (doc, bin) in self.doc_bins.iter_mut().enumerate() {
            *bin = (*bin << 1) | bits.contains(doc) as u32;
        }
        self.depth += 1;
        &self.doc_bins
    }

    /// Finish the tree: hand the final bins to the cache and return them.
    pub fn finish(self, cache: &BinCache) -> Arc<Vec<u32>> {
        cache.store(self.dataset.id(), self.doc_bins)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::SearchDataSetBuilder;
    use crate::features::FeaturesManager;

    fn two_feature_dataset(manager: &FeaturesManager) -> SearchDataSet {
        SearchDataSetBuilder::new(manager, 4, 1)
            .add_float_feature(vec![0.5, 1.5], vec![0, 1, 2, 1])
            .add_one_hot_feature(3, vec![2, 0, 1, 2])
            .build(DatasetId(7))
    }

    #[test]
    fn splits_shift_leaf_bits() {
        let manager = FeaturesManager::new(Vec::new());
        let dataset = two_feature_dataset(&manager);
        let mut updater = TreeUpdater::new(&dataset);

        // bin > 0 over column [0, 1, 2, 1]
        updater.add_split(&BinarySplit::new(0, 0, SplitKind::TakeGreater));
        assert_eq!(updater.doc_bins(), &[0, 1, 1, 1]);

        // bin == 2 over column [2, 0, 1, 2]
        updater.add_split(&BinarySplit::new(1, 2, SplitKind::TakeBin));
        assert_eq!(updater.doc_bins(), &[1, 2, 2, 3]);
        assert_eq!(updater.depth(), 2);
    }

    #[test]
    fn bit_splits_match_column_splits() {
        let manager = FeaturesManager::new(Vec::new());
        let dataset = two_feature_dataset(&manager);

        let mut by_column = TreeUpdater::new(&dataset);
        by_column.add_split(&BinarySplit::new(0, 1, SplitKind::TakeGreater));

        let mut bits = FixedBitSet::with_capacity(4);
        bits.insert(2); // only document 2 has bin > 1
        let mut by_bits = TreeUpdater::new(&dataset);
        by_bits.add_split_with_bits(&bits);

        assert_eq!(by_column.doc_bins(), by_bits.doc_bins());
    }

    #[test]
    fn finish_caches_final_bins() {
        let manager = FeaturesManager::new(Vec::new());
        let dataset = two_feature_dataset(&manager);
        let cache = BinCache::new();

        let mut updater = TreeUpdater::new(&dataset);
        updater.add_split(&BinarySplit::new(0, 0, SplitKind::TakeGreater));
        let bins = updater.finish(&cache);

        assert_eq!(bins.as_slice(), &[0, 1, 1, 1]);
        assert_eq!(cache.get(DatasetId(7)), Some(bins));
        assert_eq!(cache.get(DatasetId(99)), None);
    }
}
