//! Oblivious-tree structure searcher: the per-depth orchestration loop.
//!
//! # Design
//!
//! One searcher builds one tree. `fit` runs the same state machine every
//! depth:
//!
//! 1. reduce partition statistics,
//! 2. gather the two observation orders (leaf order for dense/binary
//!    grids, direct order for the row-ordered CTR grid),
//! 3. submit histogram + scoring work for all three static families on
//!    their streams, then barrier,
//! 4. reduce to the best static split, let the tree-CTR visitor try to
//!    improve on it,
//! 5. apply the winner through the updater, re-split the subsets, and
//!    fold the split into the tree-CTR base tensor.
//!
//! A duplicate winning split means no further useful split exists anywhere
//! in the tree and stops the search early; a sentinel winner (no candidate
//! features at all) is an error.
//!
//! Determinism: one seeded random stream per tree, helper seeds drawn in a
//! fixed order each depth; rerunning with the same seed and dataset gives
//! the same split sequence.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::data::{GridFamily, SearchDataSet};
use crate::execution::ExecutionContext;
use crate::features::FeaturesManager;
use crate::random::SearchRandom;
use crate::score::{take_best, ScoreHelper, ScoreOptions};
use crate::subsets::OptimizationSubsets;
use crate::target::{Bootstrap, BootstrapKind, L2Target, SearchTarget};
use crate::tree::{BinarySplit, ObliviousTreeStructure, SplitKind};
use crate::tree_ctrs::{TreeCtrDataSetsHelper, TreeCtrOptions, TreeCtrVisitor};
use crate::updater::{BinCache, TreeUpdater};

/// Structure-search failures surfaced to the caller.
#[derive(Debug, Error)]
pub enum SearchError {
    #[error("cannot mix fold-based tasks and a single target on one searcher")]
    MixedTaskKinds,
    #[error("no candidate feature produced a split (best score {score})")]
    NoCandidates { score: f32 },
    #[error("fit requires a target or at least one task")]
    NoTarget,
}

/// Knobs of one structure search.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TreeSearchOptions {
    pub max_depth: u32,
    pub l2_reg: f32,
    pub normalize: bool,
    /// Scales the score-noise standard deviation; zero disables noise.
    pub random_strength: f64,
    pub bootstrap: BootstrapKind,
    /// Keep learn-slice weights at 1.0, bootstrap only test slices.
    pub bootstrap_test_only: bool,
    pub tree_ctrs: TreeCtrOptions,
    pub seed: u64,
}

impl Default for TreeSearchOptions {
    fn default() -> Self {
        Self {
            max_depth: 6,
            l2_reg: 1.0,
            normalize: false,
            random_strength: 1.0,
            bootstrap: BootstrapKind::None,
            bootstrap_test_only: false,
            tree_ctrs: TreeCtrOptions::default(),
            seed: 0,
        }
    }
}

struct SearchTask<'a> {
    learn: &'a dyn SearchTarget,
    test: Option<&'a dyn SearchTarget>,
}

/// Everything `fit` derives from the targets before the depth loop.
struct BuiltTarget {
    target: L2Target,
    fold_bins: Vec<u32>,
    /// Document id per target position.
    doc_ids: Vec<u32>,
    fold_count: u32,
    score_std_dev: f64,
    /// Raw gradient per document id, the tree-CTR statistic source.
    ctr_target: Vec<f32>,
}

/// Searches the structure of a single oblivious tree.
pub struct ObliviousTreeSearcher<'a> {
    context: &'a ExecutionContext,
    manager: &'a FeaturesManager,
    dataset: &'a SearchDataSet,
    bin_cache: &'a BinCache,
    options: TreeSearchOptions,
    single_target: Option<&'a dyn SearchTarget>,
    tasks: Vec<SearchTask<'a>>,
}

impl<'a> ObliviousTreeSearcher<'a> {
    pub fn new(
        context: &'a ExecutionContext,
        manager: &'a FeaturesManager,
        dataset: &'a SearchDataSet,
        bin_cache: &'a BinCache,
        options: TreeSearchOptions,
    ) -> Self {
        assert!(options.max_depth > 0, "max_depth must be positive");
        Self {
            context,
            manager,
            dataset,
            bin_cache,
            options,
            single_target: None,
            tasks: Vec::new(),
        }
    }

    /// Single-task mode: one target, one fold.
    pub fn set_target(&mut self, target: &'a dyn SearchTarget) -> Result<(), SearchError> {
        if !self.tasks.is_empty() {
            return Err(SearchError::MixedTaskKinds);
        }
        self.single_target = Some(target);
        Ok(())
    }

    /// Fold-based mode: each task is one fold with a learn slice and an
    /// optional test slice.
    pub fn add_task(
        &mut self,
        learn: &'a dyn SearchTarget,
        test: Option<&'a dyn SearchTarget>,
    ) -> Result<(), SearchError> {
        if self.single_target.is_some() {
            return Err(SearchError::MixedTaskKinds);
        }
        self.tasks.push(SearchTask { learn, test });
        Ok(())
    }

    pub fn set_random_strength(&mut self, random_strength: f64) {
        self.options.random_strength = random_strength;
    }

    /// Run the structure search; returns the tree and the final leaf bin
    /// of every document (also stored in the bin cache).
    pub fn fit(&self) -> Result<(ObliviousTreeStructure, Arc<Vec<u32>>), SearchError> {
        let mut random = SearchRandom::new(self.options.seed);
        let built = self.build_search_target(&mut random)?;

        let score_options = ScoreOptions {
            l2_reg: self.options.l2_reg,
            normalize: self.options.normalize,
        };
        let dense_helper = ScoreHelper::new(
            self.context,
            Arc::clone(self.dataset.features()),
            score_options,
        );
        let binary_helper = ScoreHelper::new(
            self.context,
            Arc::clone(self.dataset.binary_features()),
            score_options,
        );
        let ctr_helper = ScoreHelper::new(
            self.context,
            Arc::clone(self.dataset.target_ctrs()),
            score_options,
        );

        let mut tree_ctrs = self.make_tree_ctr_helper(&built);
        let mut subsets = OptimizationSubsets::new(
            built.target.clone(),
            built.fold_bins.clone(),
            built.fold_count,
            self.options.max_depth,
        );
        let mut updater = TreeUpdater::new(self.dataset);
        let mut structure = ObliviousTreeStructure::new();

        for depth in 0..self.options.max_depth {
            let part_stats = subsets.compute_partition_stats();

            // Leaf order: document ids grouped by partition. Direct order:
            // dataset rows of the same documents, for the row-ordered grid.
            let leaf_order: Arc<[u32]> = subsets
                .indices()
                .iter()
                .map(|&pos| built.doc_ids[pos as usize])
                .collect::<Vec<_>>()
                .into();
            let direct_order: Arc<[u32]> = leaf_order
                .iter()
                .map(|&doc| self.dataset.inverse_indices()[doc as usize])
                .collect::<Vec<_>>()
                .into();

            // Fixed draw order keeps scores reproducible per seed.
            let dense_seed = random.next_seed();
            let binary_seed = random.next_seed();
            let ctr_seed = random.next_seed();
            let tree_ctr_seed = random.next_seed();

            dense_helper.submit_compute(&subsets, Arc::clone(&leaf_order));
            binary_helper.submit_compute(&subsets, Arc::clone(&leaf_order));
            ctr_helper.submit_compute(&subsets, Arc::clone(&direct_order));
            dense_helper.compute_optimal_split(
                Arc::clone(&part_stats),
                built.score_std_dev,
                dense_seed,
            );
            binary_helper.compute_optimal_split(
                Arc::clone(&part_stats),
                built.score_std_dev,
                binary_seed,
            );
            ctr_helper.compute_optimal_split(Arc::clone(&part_stats), built.score_std_dev, ctr_seed);
            self.context.wait_complete();

            let best = take_best([
                dense_helper.read_and_remap_optimal_split(),
                binary_helper.read_and_remap_optimal_split(),
                ctr_helper.read_and_remap_optimal_split(),
            ]);

            // Tree CTRs only supersede a strictly better static split.
            let mut visitor_split = None;
            if let Some(helper) = tree_ctrs.as_ref() {
                if helper.set_count() > 0 {
                    let visitor = TreeCtrVisitor::new(
                        self.manager,
                        self.context.device_count(),
                        score_options,
                        self.options.tree_ctrs,
                        built.score_std_dev,
                        tree_ctr_seed,
                        best.score,
                    );
                    helper.visit_sets(&visitor, self.context, &subsets, &leaf_order, &part_stats);
                    if visitor.has_split() {
                        visitor_split =
                            Some((visitor.best_split_properties(), visitor.best_split_bits()));
                    }
                }
            }

            let (winner, split_bits) = match visitor_split {
                Some((props, bits)) => (props, Some(bits)),
                None => (best, None),
            };
            if !winner.is_valid() {
                return Err(SearchError::NoCandidates {
                    score: winner.score,
                });
            }

            let split = BinarySplit::new(
                winner.feature_id,
                winner.bin_id,
                self.split_kind(winner.feature_id),
            );
            info!(
                depth,
                feature = split.feature_id,
                bin = split.bin_id,
                kind = ?split.kind,
                ctr = self.manager.is_ctr(split.feature_id),
                score = winner.score,
                "chose split"
            );

            if structure.has_split(&split) {
                debug!(depth, "best split already applied, stopping early");
                break;
            }
            structure.push(split);

            let doc_bins: Vec<u32> = match &split_bits {
                Some(bits) => updater.add_split_with_bits(bits).to_vec(),
                None => updater.add_split(&split).to_vec(),
            };

            if depth + 1 < self.options.max_depth {
                subsets.split(&doc_bins, &leaf_order);
                if let Some(helper) = tree_ctrs.as_mut() {
                    // A tree-CTR winner carries its predicate bits; a static
                    // winner resolves through its column.
                    match &split_bits {
                        Some(bits) => helper.add_ctr_split(&split, bits),
                        None => helper.add_split(&split),
                    }
                }
            }
        }

        let bins = updater.finish(self.bin_cache);
        Ok((structure, bins))
    }

    fn split_kind(&self, feature_id: u32) -> SplitKind {
        match self.dataset.locate(feature_id) {
            Some((GridFamily::Dense, pos)) if self.dataset.features().features()[pos].one_hot => {
                SplitKind::TakeBin
            }
            // Binary, precomputed-CTR, and tree-CTR features are ordinal.
            _ => SplitKind::TakeGreater,
        }
    }

    fn make_tree_ctr_helper(&self, built: &BuiltTarget) -> Option<TreeCtrDataSetsHelper<'a>> {
        if !self.manager.tree_ctrs_enabled()
            || self.dataset.cat_features().feature_ids().is_empty()
            || self.dataset.ctr_permutations().is_empty()
        {
            return None;
        }
        Some(TreeCtrDataSetsHelper::new(
            self.dataset,
            self.manager,
            self.context,
            self.options.tree_ctrs,
            built.ctr_target.clone(),
        ))
    }

    /// Build the weighted gradient target, fold assignment, and noise level.
    fn build_search_target(&self, random: &mut SearchRandom) -> Result<BuiltTarget, SearchError> {
        // (target, fold, is_test) slices in a fixed order.
        let mut slices: Vec<(&dyn SearchTarget, u32, bool)> = Vec::new();
        let fold_count;
        if let Some(target) = self.single_target {
            slices.push((target, 0, false));
            fold_count = 1;
        } else {
            if self.tasks.is_empty() {
                return Err(SearchError::NoTarget);
            }
            // Each task owns a pair of adjacent fold bins: learn documents
            // in the even bin, test documents in the odd one.
            for (task_idx, task) in self.tasks.iter().enumerate() {
                slices.push((task.learn, 2 * task_idx as u32, false));
                if let Some(test) = task.test {
                    slices.push((test, 2 * task_idx as u32 + 1, true));
                }
            }
            fold_count = 2 * self.tasks.len() as u32;
        }

        let bootstrap = Bootstrap::new(self.options.bootstrap);
        let mut weighted_target = Vec::new();
        let mut weights = Vec::new();
        let mut fold_bins = Vec::new();
        let mut doc_ids = Vec::new();
        let mut ctr_target = vec![0.0f32; self.dataset.doc_count()];
        let mut noise_sum2 = 0.0f64;
        let mut noise_count = 0usize;

        for &(target, fold, is_test) in &slices {
            let n = target.indices().len();
            let mut gradient = vec![0.0f32; n];
            target.gradient_at_zero(&mut gradient);

            let multipliers = if is_test || !self.options.bootstrap_test_only {
                bootstrap.bootstraped_weights(n, random)
            } else {
                vec![1.0; n]
            };

            for i in 0..n {
                let doc = target.indices()[i];
                let weight = target.weights()[i] * multipliers[i];
                let value = gradient[i] * weight;
                weighted_target.push(value);
                weights.push(weight);
                fold_bins.push(fold);
                doc_ids.push(doc);
                ctr_target[doc as usize] = gradient[i];

                // Noise level follows the raw test-slice gradients, before
                // bootstrap weighting; without test slices it stays zero.
                if is_test {
                    noise_sum2 += (gradient[i] as f64) * (gradient[i] as f64);
                    noise_count += 1;
                }
            }
        }

        let score_std_dev = if self.options.random_strength > 0.0 && noise_count > 0 {
            self.options.random_strength * (noise_sum2 / noise_count as f64).sqrt()
        } else {
            0.0
        };

        Ok(BuiltTarget {
            target: L2Target {
                weighted_target,
                weights,
            },
            fold_bins,
            doc_ids,
            fold_count,
            score_std_dev,
            ctr_target,
        })
    }
}
