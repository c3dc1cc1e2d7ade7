//! Optimization subsets: per-document leaf-bin assignment and the partition
//! table.
//!
//! A partition is a contiguous range of sorted slots holding the documents
//! of one (leaf, fold) cell. `bins` and `indices` are parallel arrays:
//! `bins[i]` is the partition id of the document sitting at sorted slot `i`
//! and `indices[i]` is that document's target position. Partition ids encode
//! `leaf << fold_bits | fold`, so re-partitioning after a split is a stable
//! counting sort.
//!
//! The table is sized for the maximum leaf count (`fold_stripe << max_depth`)
//! up front; folds beyond `fold_count` inside a stripe stay empty.

use std::sync::Arc;

use crate::target::L2Target;

/// Contiguous range of sorted slots holding one (leaf, fold) cell.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DataPartition {
    pub offset: u32,
    pub size: u32,
}

/// Aggregate statistics of one partition.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct PartitionStats {
    pub count: u32,
    /// Sum of weighted gradients.
    pub sum: f64,
    /// Sum of weights.
    pub weight: f64,
}

/// Snapshot of the subset state a score helper reads on its stream.
///
/// Buffers are copied out so submitted device work never borrows from the
/// mutable subset (the host may re-partition while older jobs still run).
#[derive(Clone)]
pub struct SubsetsView {
    pub partitions: Arc<[DataPartition]>,
    pub target: Arc<[f32]>,
    pub weights: Arc<[f32]>,
    pub fold_count: u32,
    pub fold_bits: u32,
    pub depth: u32,
}

/// Per-tree partition state: leaf-bin assignment, sorted document order,
/// and gathered gradient/weight buffers.
pub struct OptimizationSubsets {
    bins: Vec<u32>,
    indices: Vec<u32>,
    partitions: Vec<DataPartition>,
    gathered_target: Vec<f32>,
    gathered_weights: Vec<f32>,
    target: L2Target,
    fold_count: u32,
    fold_bits: u32,
    current_depth: u32,
    max_depth: u32,
}

/// Ceiling log2, with `int_log2(1) == 0`.
#[inline]
pub(crate) fn int_log2(x: u32) -> u32 {
    if x <= 1 {
        0
    } else {
        u32::BITS - (x - 1).leading_zeros()
    }
}

impl OptimizationSubsets {
    /// Create subsets from a built gradient target and initial fold bins.
    ///
    /// `initial_bins[i]` is the fold id of target position `i` (the leaf is
    /// zero at depth zero).
    pub fn new(target: L2Target, initial_bins: Vec<u32>, fold_count: u32, max_depth: u32) -> Self {
        assert_eq!(initial_bins.len(), target.len());
        assert!(fold_count >= 1);
        let fold_bits = int_log2(fold_count);
        let max_parts = (1usize << fold_bits) << max_depth;
        let n = initial_bins.len();

        let mut subsets = Self {
            bins: initial_bins,
            indices: (0..n as u32).collect(),
            partitions: vec![DataPartition::default(); max_parts],
            gathered_target: vec![0.0; n],
            gathered_weights: vec![0.0; n],
            target,
            fold_count,
            fold_bits,
            current_depth: 0,
            max_depth,
        };
        subsets.update();
        subsets
    }

    #[inline]
    pub fn doc_count(&self) -> usize {
        self.bins.len()
    }

    #[inline]
    pub fn fold_count(&self) -> u32 {
        self.fold_count
    }

    #[inline]
    pub fn fold_bits(&self) -> u32 {
        self.fold_bits
    }

    #[inline]
    pub fn current_depth(&self) -> u32 {
        self.current_depth
    }

    /// Partition count addressable at the current depth.
    #[inline]
    pub fn active_partition_count(&self) -> usize {
        (1usize << self.fold_bits) << self.current_depth
    }

    /// Sorted target positions, grouped by partition.
    #[inline]
    pub fn indices(&self) -> &[u32] {
        &self.indices
    }

    /// Partition table restricted to the current depth.
    #[inline]
    pub fn current_partitions(&self) -> &[DataPartition] {
        &self.partitions[..self.active_partition_count()]
    }

    /// Recompute partition boundaries from `bins` by a stable counting sort
    /// and re-gather target/weights into partition order.
    ///
    /// O(documents + partitions).
    pub fn update(&mut self) {
        let part_count = self.active_partition_count();
        let n = self.bins.len();

        let mut counts = vec![0u32; part_count];
        for &bin in &self.bins {
            counts[bin as usize] += 1;
        }

        let mut offsets = vec![0u32; part_count];
        let mut cursor = 0u32;
        for (part, &count) in counts.iter().enumerate() {
            self.partitions[part] = DataPartition {
                offset: cursor,
                size: count,
            };
            offsets[part] = cursor;
            cursor += count;
        }
        for partition in self.partitions[part_count..].iter_mut() {
            *partition = DataPartition::default();
        }
        debug_assert_eq!(cursor as usize, n);

        let mut sorted_bins = vec![0u32; n];
        let mut sorted_indices = vec![0u32; n];
        for i in 0..n {
            let bin = self.bins[i];
            let dst = offsets[bin as usize] as usize;
            offsets[bin as usize] += 1;
            sorted_bins[dst] = bin;
            sorted_indices[dst] = self.indices[i];
        }
        self.bins = sorted_bins;
        self.indices = sorted_indices;

        for (slot, &pos) in self.indices.iter().enumerate() {
            self.gathered_target[slot] = self.target.weighted_target[pos as usize];
            self.gathered_weights[slot] = self.target.weights[pos as usize];
        }
    }

    /// Reduce gradient/weight sums per active partition. Pure.
    pub fn compute_partition_stats(&self) -> Arc<[PartitionStats]> {
        self.current_partitions()
            .iter()
            .map(|part| {
                let begin = part.offset as usize;
                let end = begin + part.size as usize;
                let mut sum = 0.0f64;
                let mut weight = 0.0f64;
                for slot in begin..end {
                    sum += self.gathered_target[slot] as f64;
                    weight += self.gathered_weights[slot] as f64;
                }
                PartitionStats {
                    count: part.size,
                    sum,
                    weight,
                }
            })
            .collect()
    }

    /// Snapshot for asynchronous score computation.
    pub fn device_view(&self) -> SubsetsView {
        SubsetsView {
            partitions: Arc::from(self.current_partitions()),
            target: Arc::from(self.gathered_target.as_slice()),
            weights: Arc::from(self.gathered_weights.as_slice()),
            fold_count: self.fold_count,
            fold_bits: self.fold_bits,
            depth: self.current_depth,
        }
    }

    /// Re-partition after a split decision.
    ///
    /// `doc_bins[doc]` is the post-split leaf of each document (one more bit
    /// than before); `observation_indices[i]` is the document id at sorted
    /// slot `i`, gathered for the *current* partitioning. Doubles the
    /// addressable partition count and re-sorts.
    pub fn split(&mut self, doc_bins: &[u32], observation_indices: &[u32]) {
        assert!(
            self.current_depth < self.max_depth,
            "split beyond the partition table capacity"
        );
        assert_eq!(observation_indices.len(), self.bins.len());

        let fold_mask = (1u32 << self.fold_bits) - 1;
        for (i, bin) in self.bins.iter_mut().enumerate() {
            let leaf = doc_bins[observation_indices[i] as usize];
            *bin = (leaf << self.fold_bits) | (*bin & fold_mask);
        }
        self.current_depth += 1;
        self.update();
    }
}
