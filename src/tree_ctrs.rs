//! Tree CTRs: lazily materialized target statistics over joint categorical
//! keys discovered during the search.
//!
//! # Design
//!
//! Every depth, the current base tensor (categorical features and binary
//! splits applied so far) is extended with each remaining categorical
//! feature; each candidate tensor yields one CTR per configured statistic.
//! Candidate datasets are sharded across devices by tensor hash, scored in
//! parallel, and reduced through [`TreeCtrVisitor`] to a single best split.
//!
//! CTR values are computed in a fixed document order with running
//! statistics, so a document only ever sees documents before it. The first
//! document of the order gets the pure prior.
//!
//! The winning CTR is registered with the features manager on read, which
//! makes it addressable by later trees; registration is idempotent, so
//! rediscovery from another device is a no-op.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use fixedbitset::FixedBitSet;
use rayon::prelude::*;
use tracing::debug;

use crate::data::{BinnedGrid, GridFeature, SearchDataSet};
use crate::execution::{DeviceId, ExecutionContext};
use crate::features::{Ctr, CtrConfig, CtrType, FeatureTensor, FeaturesManager};
use crate::score::{BestSplitProperties, ScoreHelper, ScoreOptions};
use crate::subsets::{OptimizationSubsets, PartitionStats};
use crate::tree::{BinarySplit, SplitKind};

/// Limits for tree-CTR candidate generation and quantization.
#[derive(Clone, Copy, Debug, serde::Serialize, serde::Deserialize)]
pub struct TreeCtrOptions {
    /// Maximum categorical features joined into one tensor.
    pub max_tensor_complexity: usize,
    /// Maximum discretization borders per materialized CTR.
    pub max_borders: usize,
    /// Split-free tensors strictly below this complexity get their borders
    /// registered eagerly, so later trees reuse the quantization instead of
    /// recomputing it.
    pub max_complexity_for_borders_caching: usize,
}

impl Default for TreeCtrOptions {
    fn default() -> Self {
        Self {
            max_tensor_complexity: 4,
            max_borders: 15,
            max_complexity_for_borders_caching: 2,
        }
    }
}

/// One candidate tensor materialized on one device: a CTR per configured
/// statistic, binarized into a scoreable grid.
///
/// Grid feature ids are *local* CTR indices; the visitor remaps the winner
/// to a global id at registration time.
pub struct TreeCtrDataSet {
    device: DeviceId,
    ctrs: Vec<Ctr>,
    borders: Vec<Vec<f32>>,
    grid: Arc<BinnedGrid>,
}

impl TreeCtrDataSet {
    /// Materialize every configured statistic of one tensor host-side.
    ///
    /// `ctr_target[doc]` is the statistic source value and `order` the
    /// leakage-free document walk; `applied_bits` resolves splits with no
    /// static column. Already-registered CTR identities reuse their cached
    /// borders.
    #[allow(clippy::too_many_arguments)]
    pub fn materialize(
        tensor: FeatureTensor,
        configs: &[CtrConfig],
        dataset: &SearchDataSet,
        manager: &FeaturesManager,
        ctr_target: &[f32],
        order: &[u32],
        applied_bits: &HashMap<BinarySplit, FixedBitSet>,
        max_borders: usize,
        device: DeviceId,
    ) -> Self {
        let doc_count = dataset.doc_count();
        let keys = joint_keys(&tensor, dataset, applied_bits);

        let mut ctrs = Vec::with_capacity(configs.len());
        let mut all_borders = Vec::with_capacity(configs.len());
        let mut features = Vec::with_capacity(configs.len());
        let mut columns = Vec::with_capacity(configs.len());

        for (idx, &config) in configs.iter().enumerate() {
            let ctr = Ctr::new(tensor.clone(), config);
            let values = ctr_values(&keys, config, ctr_target, order);
            let borders = match manager.ctr_feature_id(&ctr) {
                Some(id) => manager.borders(id).to_vec(),
                None => quantile_borders(&values, max_borders),
            };
            let bins = binarize(&values, &borders);

            features.push(GridFeature {
                feature_id: idx as u32,
                bin_count: borders.len() as u32 + 1,
                one_hot: false,
                device,
            });
            columns.push(bins);
            ctrs.push(ctr);
            all_borders.push(borders);
        }

        Self {
            device,
            ctrs,
            borders: all_borders,
            grid: Arc::new(BinnedGrid::new(features, columns, doc_count)),
        }
    }

    #[inline]
    pub fn device(&self) -> DeviceId {
        self.device
    }

    #[inline]
    pub fn ctrs(&self) -> &[Ctr] {
        &self.ctrs
    }

    #[inline]
    pub fn grid(&self) -> &Arc<BinnedGrid> {
        &self.grid
    }

    #[inline]
    pub fn borders(&self, local_idx: usize) -> &[f32] {
        &self.borders[local_idx]
    }
}

/// Joint key of the tensor per document: categorical values folded together
/// with the bits of the tensor's applied binary splits.
///
/// Splits on discovered CTR features have no static column; their
/// per-document predicates must be present in `applied_bits` (recorded when
/// the split was applied). An unresolvable split is a hard error: dropping
/// its bit would materialize values under an identity that claims to
/// include it.
fn joint_keys(
    tensor: &FeatureTensor,
    dataset: &SearchDataSet,
    applied_bits: &HashMap<BinarySplit, FixedBitSet>,
) -> Vec<u64> {
    let doc_count = dataset.doc_count();
    let mut keys = vec![0u64; doc_count];

    for &cat in tensor.cat_features() {
        let values = dataset.cat_features().column(cat);
        let cardinality = dataset.cat_features().value_count(cat) as u64;
        for (key, &value) in keys.iter_mut().zip(values) {
            *key = key.wrapping_mul(cardinality).wrapping_add(value as u64);
        }
    }
    for split in tensor.splits() {
        if let Some(bits) = applied_bits.get(split) {
            for (doc, key) in keys.iter_mut().enumerate() {
                *key = (*key << 1) | bits.contains(doc) as u64;
            }
            continue;
        }
        for (doc, key) in keys.iter_mut().enumerate() {
            let bin = match dataset.static_bin(split.feature_id, doc) {
                Some(bin) => bin as u32,
                None => panic!(
                    "feature {} has no static column and no recorded split bits",
                    split.feature_id
                ),
            };
            let bit = match split.kind {
                SplitKind::TakeGreater => bin > split.bin_id,
                SplitKind::TakeBin => bin == split.bin_id,
            };
            *key = (*key << 1) | bit as u64;
        }
    }
    keys
}

/// Running CTR values over `order`: each document's value is computed from
/// the documents preceding it, then its own statistic is folded in.
fn ctr_values(keys: &[u64], config: CtrConfig, ctr_target: &[f32], order: &[u32]) -> Vec<f32> {
    let mut stats: HashMap<u64, (f64, f64)> = HashMap::new();
    let mut values = vec![0.0f32; keys.len()];
    let prior = config.prior as f64;

    for (seen, &doc) in order.iter().enumerate() {
        let doc = doc as usize;
        let entry = stats.entry(keys[doc]).or_insert((0.0, 0.0));
        values[doc] = match config.ctr_type {
            CtrType::Buckets | CtrType::Borders => ((entry.1 + prior) / (entry.0 + 1.0)) as f32,
            CtrType::FeatureFreq => ((entry.0 + prior) / (seen as f64 + 1.0)) as f32,
        };
        entry.0 += 1.0;
        entry.1 += ctr_target[doc] as f64;
    }
    values
}

/// Evenly spaced sample quantiles, deduplicated.
fn quantile_borders(values: &[f32], max_borders: usize) -> Vec<f32> {
    if values.is_empty() {
        return Vec::new();
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f32::total_cmp);

    let n = sorted.len();
    let mut borders = Vec::with_capacity(max_borders);
    for i in 1..=max_borders {
        let pos = (i * n / (max_borders + 1)).min(n - 1);
        borders.push(sorted[pos]);
    }
    borders.dedup_by(|a, b| a.to_bits() == b.to_bits());
    // A border equal to the maximum separates nothing.
    while borders.last().map(|&b| b >= sorted[n - 1]).unwrap_or(false) {
        borders.pop();
    }
    borders
}

/// `bins[doc]` = number of borders strictly below the value.
fn binarize(values: &[f32], borders: &[f32]) -> Vec<u8> {
    values
        .iter()
        .map(|&v| borders.partition_point(|&b| b < v) as u8)
        .collect()
}

/// Per-depth candidate generator: owns the base tensor and the materialized
/// candidate datasets, sharded per device.
pub struct TreeCtrDataSetsHelper<'a> {
    dataset: &'a SearchDataSet,
    manager: &'a FeaturesManager,
    options: TreeCtrOptions,
    ctr_target: Vec<f32>,
    base_tensor: FeatureTensor,
    /// Predicate bits of applied splits that have no static column.
    applied_bits: HashMap<BinarySplit, FixedBitSet>,
    sets_per_device: Vec<Vec<TreeCtrDataSet>>,
}

impl<'a> TreeCtrDataSetsHelper<'a> {
    /// Build the helper and the depth-zero candidate sets.
    ///
    /// `ctr_target[doc]` is the per-document statistic source, the gradient
    /// at the current ensemble state, indexed by document id.
    pub fn new(
        dataset: &'a SearchDataSet,
        manager: &'a FeaturesManager,
        context: &ExecutionContext,
        options: TreeCtrOptions,
        ctr_target: Vec<f32>,
    ) -> Self {
        assert_eq!(ctr_target.len(), dataset.doc_count());
        let mut helper = Self {
            dataset,
            manager,
            options,
            ctr_target,
            base_tensor: FeatureTensor::default(),
            applied_bits: HashMap::new(),
            sets_per_device: (0..context.device_count()).map(|_| Vec::new()).collect(),
        };
        helper.rebuild_sets();
        helper
    }

    #[inline]
    pub fn base_tensor(&self) -> &FeatureTensor {
        &self.base_tensor
    }

    /// Candidate datasets resident on one device.
    #[inline]
    pub fn device_sets(&self, device: DeviceId) -> &[TreeCtrDataSet] {
        &self.sets_per_device[device]
    }

    pub fn set_count(&self) -> usize {
        self.sets_per_device.iter().map(Vec::len).sum()
    }

    /// Fold an applied split on a static feature into the base tensor and
    /// rebuild candidates.
    ///
    /// A categorical split joins its feature into the tensor; any other
    /// split is carried as a binary-split bit of the joint key.
    pub fn add_split(&mut self, split: &BinarySplit) {
        if self.manager.is_cat(split.feature_id) {
            self.base_tensor.add_cat_feature(split.feature_id);
        } else {
            self.base_tensor.add_binary_split(*split);
        }
        self.rebuild_sets();
    }

    /// Fold an applied split on a discovered CTR feature into the base
    /// tensor: the winning CTR's tensor becomes the new base, and the
    /// split's per-document predicate bits are recorded so later
    /// materializations can fold the bit into their joint keys.
    pub fn add_ctr_split(&mut self, split: &BinarySplit, bits: &FixedBitSet) {
        let ctr = match self.manager.ctr_for_id(split.feature_id) {
            Some(ctr) => ctr,
            None => panic!("feature {} is not a registered ctr", split.feature_id),
        };
        self.applied_bits.insert(*split, bits.clone());
        self.base_tensor = ctr.tensor;
        self.base_tensor.add_binary_split(*split);
        self.rebuild_sets();
    }

    /// Score every candidate set through the visitor, one rayon task per
    /// device. Blocks until all sets are scored.
    pub fn visit_sets(
        &self,
        visitor: &TreeCtrVisitor<'_>,
        context: &ExecutionContext,
        subsets: &OptimizationSubsets,
        observation_indices: &Arc<[u32]>,
        part_stats: &Arc<[PartitionStats]>,
    ) {
        self.sets_per_device.par_iter().for_each(|sets| {
            for set in sets {
                visitor.visit(set, context, subsets, observation_indices, part_stats);
            }
        });
    }

    fn rebuild_sets(&mut self) {
        let device_count = self.sets_per_device.len();
        for sets in &mut self.sets_per_device {
            sets.clear();
        }
        if !self.manager.tree_ctrs_enabled() {
            return;
        }

        let permutations = self.dataset.ctr_permutations();
        if permutations.is_empty() {
            return;
        }
        let configs = self.manager.ctr_configs();

        for &cat in self.dataset.cat_features().feature_ids() {
            if self.base_tensor.cat_features().contains(&cat) {
                continue;
            }
            let mut tensor = self.base_tensor.clone();
            tensor.add_cat_feature(cat);
            if tensor.complexity() > self.options.max_tensor_complexity {
                continue;
            }

            let hash = tensor.hash64();
            let device = (hash % device_count as u64) as DeviceId;
            let order = &permutations[(hash % permutations.len() as u64) as usize];
            let set = TreeCtrDataSet::materialize(
                tensor,
                configs,
                self.dataset,
                self.manager,
                &self.ctr_target,
                order,
                &self.applied_bits,
                self.options.max_borders,
                device,
            );
            self.sets_per_device[device].push(set);
        }

        debug!(
            candidates = self.set_count(),
            complexity = self.base_tensor.complexity() + 1,
            "rebuilt tree-ctr candidate sets"
        );
    }
}

struct BestScore {
    score: f32,
    device: Option<DeviceId>,
}

struct DeviceBest {
    score: f32,
    ctr: Ctr,
    bin_id: u32,
    borders: Vec<f32>,
    split_bits: FixedBitSet,
}

/// Reduces scored candidate sets to a single best tree-CTR split.
///
/// `visit` is safe to call concurrently from several device tasks. The
/// shared critical section only compares and publishes a score; the
/// winning candidate's payload (split bits included) is built outside it
/// and stored in the publishing device's slot. Scores on one device only
/// ever improve, so after all visits the slot of `best.device` holds the
/// overall winner.
pub struct TreeCtrVisitor<'a> {
    manager: &'a FeaturesManager,
    score_options: ScoreOptions,
    ctr_options: TreeCtrOptions,
    score_std_dev: f64,
    seeds: Vec<u64>,
    best: Mutex<BestScore>,
    device_results: Vec<Mutex<Option<DeviceBest>>>,
}

impl<'a> TreeCtrVisitor<'a> {
    /// `seed` is mixed per device; each visited set further mixes its
    /// tensor hash in, so scores do not depend on the visiting order.
    ///
    /// `initial_score` is the best score the static families produced;
    /// only candidates improving on it become the visitor's best.
    pub fn new(
        manager: &'a FeaturesManager,
        device_count: usize,
        score_options: ScoreOptions,
        ctr_options: TreeCtrOptions,
        score_std_dev: f64,
        seed: u64,
        initial_score: f32,
    ) -> Self {
        let seeds = (0..device_count)
            .map(|d| crate::random::device_seed(seed, d))
            .collect();
        Self {
            manager,
            score_options,
            ctr_options,
            score_std_dev,
            seeds,
            best: Mutex::new(BestScore {
                score: initial_score,
                device: None,
            }),
            device_results: (0..device_count).map(|_| Mutex::new(None)).collect(),
        }
    }

    /// Score one candidate set and fold its winner into the running best.
    pub fn visit(
        &self,
        set: &TreeCtrDataSet,
        context: &ExecutionContext,
        subsets: &OptimizationSubsets,
        observation_indices: &Arc<[u32]>,
        part_stats: &Arc<[PartitionStats]>,
    ) {
        self.cache_ctr_borders(set);

        let tensor_hash = set.ctrs()[0].tensor.hash64();
        let seed = self.seeds[set.device()].wrapping_add(tensor_hash);
        let helper = ScoreHelper::new(context, Arc::clone(set.grid()), self.score_options);
        helper.submit_compute(subsets, Arc::clone(observation_indices));
        helper.compute_optimal_split(Arc::clone(part_stats), self.score_std_dev, seed);
        let candidate = helper.read_and_remap_optimal_split();

        if !candidate.is_valid() {
            return;
        }
        if !self.try_publish(set.device(), candidate.score) {
            return;
        }

        let local_idx = candidate.feature_id as usize;
        let column = set.grid().column(local_idx);
        let mut bits = FixedBitSet::with_capacity(column.len());
        for (doc, &bin) in column.iter().enumerate() {
            if (bin as u32) > candidate.bin_id {
                bits.insert(doc);
            }
        }
        let mut slot = self.device_results[set.device()]
            .lock()
            .expect("visitor state poisoned");
        *slot = Some(DeviceBest {
            score: candidate.score,
            ctr: set.ctrs()[local_idx].clone(),
            bin_id: candidate.bin_id,
            borders: set.borders(local_idx).to_vec(),
            split_bits: bits,
        });
    }

    /// Whether any visited set produced a valid candidate.
    pub fn has_split(&self) -> bool {
        self.best.lock().expect("visitor state poisoned").device.is_some()
    }

    /// Register the winning CTR and return its split over global feature ids.
    ///
    /// # Panics
    /// Panics if called before any set produced a candidate; check
    /// [`has_split`](Self::has_split) first.
    pub fn best_split_properties(&self) -> BestSplitProperties {
        let (device, score) = {
            let best = self.best.lock().expect("visitor state poisoned");
            let device = best.device.expect("no tree-ctr candidate was scored");
            (device, best.score)
        };
        let slot = self.device_results[device]
            .lock()
            .expect("visitor state poisoned");
        let won = slot.as_ref().expect("winning device published no candidate");
        assert!(won.bin_id <= u8::MAX as u32, "tree-ctr bin exceeds u8 range");

        let feature_id = self.manager.add_ctr(won.ctr.clone(), won.borders.clone());
        BestSplitProperties {
            feature_id,
            bin_id: won.bin_id,
            score,
        }
    }

    /// Per-document predicate bits of the winning split, so the updater can
    /// apply it without rematerializing the CTR.
    pub fn best_split_bits(&self) -> FixedBitSet {
        let device = self
            .best
            .lock()
            .expect("visitor state poisoned")
            .device
            .expect("no tree-ctr candidate was scored");
        let slot = self.device_results[device]
            .lock()
            .expect("visitor state poisoned");
        slot.as_ref()
            .expect("winning device published no candidate")
            .split_bits
            .clone()
    }

    /// Register borders of cheap tensors eagerly so later trees reuse the
    /// same quantization. Tensors carrying applied binary splits are never
    /// cached: their identity is tied to this tree's structure.
    fn cache_ctr_borders(&self, set: &TreeCtrDataSet) {
        for (idx, ctr) in set.ctrs().iter().enumerate() {
            if !ctr.tensor.splits().is_empty()
                || ctr.tensor.complexity() >= self.ctr_options.max_complexity_for_borders_caching
            {
                continue;
            }
            if !self.manager.is_known(ctr) {
                self.manager.add_ctr(ctr.clone(), set.borders(idx).to_vec());
            }
        }
    }

    fn try_publish(&self, device: DeviceId, score: f32) -> bool {
        let mut best = self.best.lock().expect("visitor state poisoned");
        if score >= best.score {
            return false;
        }
        best.score = score;
        best.device = Some(device);
        true
    }
}
