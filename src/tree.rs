//! Oblivious tree structure: the ordered list of applied binary splits.
//!
//! An oblivious tree tests the same feature/threshold at every node of a
//! depth, so the whole structure is just a split sequence. The structure is
//! append-only while one search runs and immutable once returned.

use serde::{Deserialize, Serialize};

use crate::features::FeatureId;

/// How a split predicate reads a binarized feature value.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SplitKind {
    /// Continuous/ordinal: documents with `bin > bin_id` go right.
    TakeGreater,
    /// One-hot categorical: documents with `bin == bin_id` go right.
    TakeBin,
}

/// A single oblivious-tree level: feature, bin, and predicate kind.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BinarySplit {
    pub feature_id: FeatureId,
    pub bin_id: u32,
    pub kind: SplitKind,
}

impl BinarySplit {
    pub fn new(feature_id: FeatureId, bin_id: u32, kind: SplitKind) -> Self {
        Self {
            feature_id,
            bin_id,
            kind,
        }
    }
}

/// Ordered sequence of applied splits; one entry per tree depth.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObliviousTreeStructure {
    splits: Vec<BinarySplit>,
}

impl ObliviousTreeStructure {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether this exact split was already applied at some depth.
    ///
    /// A duplicate winning split is the early-stop signal: no further
    /// useful split exists anywhere in the tree.
    pub fn has_split(&self, split: &BinarySplit) -> bool {
        self.splits.contains(split)
    }

    /// Append the split for the next depth.
    pub fn push(&mut self, split: BinarySplit) {
        self.splits.push(split);
    }

    #[inline]
    pub fn splits(&self) -> &[BinarySplit] {
        &self.splits
    }

    /// Tree depth (number of applied splits).
    #[inline]
    pub fn depth(&self) -> usize {
        self.splits.len()
    }

    /// Leaf count of the finished tree.
    #[inline]
    pub fn leaves(&self) -> usize {
        1 << self.splits.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_duplicate_splits() {
        let mut structure = ObliviousTreeStructure::new();
        let split = BinarySplit::new(2, 1, SplitKind::TakeGreater);

        assert!(!structure.has_split(&split));
        structure.push(split);
        assert!(structure.has_split(&split));

        // Same feature, different bin is a distinct split.
        let other = BinarySplit::new(2, 0, SplitKind::TakeGreater);
        assert!(!structure.has_split(&other));
    }

    #[test]
    fn depth_and_leaves() {
        let mut structure = ObliviousTreeStructure::new();
        assert_eq!(structure.leaves(), 1);

        structure.push(BinarySplit::new(0, 0, SplitKind::TakeGreater));
        structure.push(BinarySplit::new(1, 3, SplitKind::TakeBin));

        assert_eq!(structure.depth(), 2);
        assert_eq!(structure.leaves(), 4);
    }
}
