//! Binarized feature grids and the dataset surface consumed by the searcher.
//!
//! The dataset provider (loading, binarization) is an external collaborator;
//! this module only defines the shapes the search engine reads:
//!
//! - three static [`BinnedGrid`] families (dense numeric, binary,
//!   precomputed target-CTR),
//! - raw categorical storage used as the joint-key source when tree CTRs
//!   are materialized,
//! - the learn permutation and its inverse ("direct order" access).
//!
//! Dense and binary grids are indexed by document id; the CTR grid lives in
//! dataset row order, which is why the searcher gathers a second, "direct"
//! observation order through the inverse permutation.

mod builder;

pub use builder::SearchDataSetBuilder;

use std::sync::Arc;

use crate::execution::DeviceId;
use crate::features::FeatureId;

/// Stable identity of a device-side dataset, used to key cached bins.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DatasetId(pub u64);

/// Metadata of one feature inside a grid.
#[derive(Clone, Copy, Debug)]
pub struct GridFeature {
    /// Global feature id assigned by the features manager.
    pub feature_id: FeatureId,
    /// Number of distinct bin values.
    pub bin_count: u32,
    /// One-hot feature: split predicate is `bin == b` instead of `bin > b`.
    pub one_hot: bool,
    /// Device the feature column is resident on.
    pub device: DeviceId,
}

impl GridFeature {
    /// Number of candidate split bins for this feature.
    ///
    /// For ordinal features the last bin has nothing above it, so a feature
    /// with `k` bins yields `k - 1` candidates; one-hot features yield one
    /// candidate per bin.
    #[inline]
    pub fn candidate_bins(&self) -> u32 {
        if self.one_hot {
            self.bin_count
        } else {
            self.bin_count.saturating_sub(1)
        }
    }
}

/// A binarized feature family: one `u8` bin per document per feature,
/// stored feature-major.
#[derive(Clone, Debug, Default)]
pub struct BinnedGrid {
    features: Vec<GridFeature>,
    bins: Vec<u8>,
    doc_count: usize,
}

impl BinnedGrid {
    /// Build a grid from per-feature columns.
    ///
    /// # Panics
    /// Panics if a column length differs from `doc_count` or a bin value
    /// exceeds the feature's `bin_count`.
    pub fn new(features: Vec<GridFeature>, columns: Vec<Vec<u8>>, doc_count: usize) -> Self {
        assert_eq!(features.len(), columns.len());
        let mut bins = Vec::with_capacity(features.len() * doc_count);
        for (feature, column) in features.iter().zip(&columns) {
            assert_eq!(column.len(), doc_count, "feature column length mismatch");
            debug_assert!(
                column.iter().all(|&b| (b as u32) < feature.bin_count),
                "bin value out of range for feature {}",
                feature.feature_id
            );
            bins.extend_from_slice(column);
        }
        Self {
            features,
            bins,
            doc_count,
        }
    }

    /// Empty grid over `doc_count` documents.
    pub fn empty(doc_count: usize) -> Self {
        Self {
            features: Vec::new(),
            bins: Vec::new(),
            doc_count,
        }
    }

    #[inline]
    pub fn feature_count(&self) -> usize {
        self.features.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }

    #[inline]
    pub fn doc_count(&self) -> usize {
        self.doc_count
    }

    #[inline]
    pub fn features(&self) -> &[GridFeature] {
        &self.features
    }

    /// Bin column of one feature.
    #[inline]
    pub fn column(&self, feature_idx: usize) -> &[u8] {
        let start = feature_idx * self.doc_count;
        &self.bins[start..start + self.doc_count]
    }

    /// Bin of one document for one feature.
    #[inline]
    pub fn bin(&self, feature_idx: usize, doc: usize) -> u8 {
        self.bins[feature_idx * self.doc_count + doc]
    }

    /// Total candidate (feature, bin) pairs across the grid.
    pub fn candidate_count(&self) -> usize {
        self.features
            .iter()
            .map(|f| f.candidate_bins() as usize)
            .sum()
    }

    /// Position of a global feature id inside this grid.
    pub fn position_of(&self, feature_id: FeatureId) -> Option<usize> {
        self.features.iter().position(|f| f.feature_id == feature_id)
    }
}

/// Raw categorical bins, the joint-key source for tree-CTR materialization.
#[derive(Clone, Debug, Default)]
pub struct CatFeatureStorage {
    features: Vec<FeatureId>,
    value_counts: Vec<u32>,
    values: Vec<u32>,
    doc_count: usize,
}

impl CatFeatureStorage {
    pub fn new(
        features: Vec<FeatureId>,
        value_counts: Vec<u32>,
        values: Vec<u32>,
        doc_count: usize,
    ) -> Self {
        assert_eq!(features.len(), value_counts.len());
        assert_eq!(values.len(), features.len() * doc_count);
        Self {
            features,
            value_counts,
            values,
            doc_count,
        }
    }

    #[inline]
    pub fn feature_ids(&self) -> &[FeatureId] {
        &self.features
    }

    /// Distinct value count of a categorical feature.
    pub fn value_count(&self, feature_id: FeatureId) -> u32 {
        let pos = self.position_of(feature_id).expect("unknown cat feature");
        self.value_counts[pos]
    }

    /// Category column of a feature, indexed by document id.
    pub fn column(&self, feature_id: FeatureId) -> &[u32] {
        let pos = self.position_of(feature_id).expect("unknown cat feature");
        let start = pos * self.doc_count;
        &self.values[start..start + self.doc_count]
    }

    fn position_of(&self, feature_id: FeatureId) -> Option<usize> {
        self.features.iter().position(|&f| f == feature_id)
    }
}

/// Which grid family a feature column lives in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GridFamily {
    Dense,
    Binary,
    TargetCtr,
}

/// The dataset surface the structure search reads.
pub struct SearchDataSet {
    id: DatasetId,
    doc_count: usize,
    features: Arc<BinnedGrid>,
    binary_features: Arc<BinnedGrid>,
    target_ctrs: Arc<BinnedGrid>,
    cat_features: CatFeatureStorage,
    /// Learn permutation: `indices[row] = document id`.
    indices: Vec<u32>,
    /// Inverse permutation: `inverse_indices[doc] = row`.
    inverse_indices: Vec<u32>,
    /// Document orders used for leakage-free CTR computation.
    ctr_permutations: Vec<Vec<u32>>,
}

impl SearchDataSet {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: DatasetId,
        doc_count: usize,
        features: BinnedGrid,
        binary_features: BinnedGrid,
        target_ctrs: BinnedGrid,
        cat_features: CatFeatureStorage,
        indices: Vec<u32>,
        ctr_permutations: Vec<Vec<u32>>,
    ) -> Self {
        assert_eq!(indices.len(), doc_count);
        let mut inverse_indices = vec![0u32; doc_count];
        for (row, &doc) in indices.iter().enumerate() {
            inverse_indices[doc as usize] = row as u32;
        }
        Self {
            id,
            doc_count,
            features: Arc::new(features),
            binary_features: Arc::new(binary_features),
            target_ctrs: Arc::new(target_ctrs),
            cat_features,
            indices,
            inverse_indices,
            ctr_permutations,
        }
    }

    #[inline]
    pub fn id(&self) -> DatasetId {
        self.id
    }

    #[inline]
    pub fn doc_count(&self) -> usize {
        self.doc_count
    }

    #[inline]
    pub fn features(&self) -> &Arc<BinnedGrid> {
        &self.features
    }

    #[inline]
    pub fn binary_features(&self) -> &Arc<BinnedGrid> {
        &self.binary_features
    }

    #[inline]
    pub fn target_ctrs(&self) -> &Arc<BinnedGrid> {
        &self.target_ctrs
    }

    #[inline]
    pub fn cat_features(&self) -> &CatFeatureStorage {
        &self.cat_features
    }

    #[inline]
    pub fn indices(&self) -> &[u32] {
        &self.indices
    }

    #[inline]
    pub fn inverse_indices(&self) -> &[u32] {
        &self.inverse_indices
    }

    #[inline]
    pub fn ctr_permutations(&self) -> &[Vec<u32>] {
        &self.ctr_permutations
    }

    /// Locate a static feature id across the three grid families.
    pub fn locate(&self, feature_id: FeatureId) -> Option<(GridFamily, usize)> {
        if let Some(pos) = self.features.position_of(feature_id) {
            return Some((GridFamily::Dense, pos));
        }
        if let Some(pos) = self.binary_features.position_of(feature_id) {
            return Some((GridFamily::Binary, pos));
        }
        self.target_ctrs
            .position_of(feature_id)
            .map(|pos| (GridFamily::TargetCtr, pos))
    }

    /// Bin of a document for a static feature.
    ///
    /// Dense and binary grids are keyed by document id; the CTR grid by
    /// dataset row, so the inverse permutation is applied first.
    pub fn static_bin(&self, feature_id: FeatureId, doc: usize) -> Option<u8> {
        let (family, pos) = self.locate(feature_id)?;
        let bin = match family {
            GridFamily::Dense => self.features.bin(pos, doc),
            GridFamily::Binary => self.binary_features.bin(pos, doc),
            GridFamily::TargetCtr => {
                let row = self.inverse_indices[doc] as usize;
                self.target_ctrs.bin(pos, row)
            }
        };
        Some(bin)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feature(id: FeatureId, bin_count: u32) -> GridFeature {
        GridFeature {
            feature_id: id,
            bin_count,
            one_hot: false,
            device: 0,
        }
    }

    #[test]
    fn grid_layout_is_feature_major() {
        let grid = BinnedGrid::new(
            vec![feature(0, 3), feature(1, 2)],
            vec![vec![0, 1, 2, 0], vec![1, 0, 1, 0]],
            4,
        );

        assert_eq!(grid.column(0), &[0, 1, 2, 0]);
        assert_eq!(grid.bin(1, 2), 1);
        // f0: 3 bins -> 2 candidates, f1: 2 bins -> 1 candidate
        assert_eq!(grid.candidate_count(), 3);
    }

    #[test]
    fn one_hot_candidates_cover_every_bin() {
        let f = GridFeature {
            feature_id: 5,
            bin_count: 4,
            one_hot: true,
            device: 0,
        };
        assert_eq!(f.candidate_bins(), 4);
    }

    #[test]
    fn ctr_grid_is_read_in_direct_order() {
        let features = BinnedGrid::empty(3);
        let binary = BinnedGrid::empty(3);
        let ctrs = BinnedGrid::new(vec![feature(2, 3)], vec![vec![0, 1, 2]], 3);
        let dataset = SearchDataSet::new(
            DatasetId(1),
            3,
            features,
            binary,
            ctrs,
            CatFeatureStorage::default(),
            vec![2, 0, 1], // document 2 sits at row 0
            Vec::new(),
        );

        assert_eq!(dataset.static_bin(2, 2), Some(0));
        assert_eq!(dataset.static_bin(2, 0), Some(1));
        assert_eq!(dataset.locate(9), None);
    }
}
