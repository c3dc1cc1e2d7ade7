//! Score helpers: per-family candidate-split scoring on execution streams.
//!
//! One helper serves one [`BinnedGrid`] family (dense, binary, or
//! precomputed CTR). All three run concurrently on separate streams per
//! depth; the orchestrator must barrier before reading results because the
//! histogram scratch is reused across depths.
//!
//! The contract is two-phase on purpose: `submit_compute` and
//! `compute_optimal_split` enqueue work and return immediately, preserving
//! stream overlap across helpers; `read_and_remap_optimal_split` is the
//! only blocking entry point.

use std::sync::{Arc, Mutex};

use rand::SeedableRng;
use rand_distr::{Distribution, StandardNormal};
use rand_xoshiro::Xoshiro256PlusPlus;

use crate::data::BinnedGrid;
use crate::execution::{ExecutionContext, Stream};
use crate::features::{FeatureId, INVALID_FEATURE};
use crate::random::candidate_seed;
use crate::subsets::{OptimizationSubsets, PartitionStats, SubsetsView};

/// The winning candidate of one helper: global feature id, bin, score.
///
/// Lower score wins (this is a minimization); ties break toward the lower
/// feature id, then the lower bin id, keeping the reduction deterministic.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BestSplitProperties {
    pub feature_id: FeatureId,
    pub bin_id: u32,
    pub score: f32,
}

impl BestSplitProperties {
    /// Sentinel returned when no candidate features exist.
    pub const fn invalid() -> Self {
        Self {
            feature_id: INVALID_FEATURE,
            bin_id: 0,
            score: f32::INFINITY,
        }
    }

    #[inline]
    pub fn is_valid(&self) -> bool {
        self.feature_id != INVALID_FEATURE
    }

    /// Strict "wins against" ordering used by every best-of reduction.
    pub fn better_than(&self, other: &Self) -> bool {
        if !self.is_valid() {
            return false;
        }
        if !other.is_valid() {
            return true;
        }
        if self.score != other.score {
            return self.score < other.score;
        }
        if self.feature_id != other.feature_id {
            return self.feature_id < other.feature_id;
        }
        self.bin_id < other.bin_id
    }
}

/// Reduce candidates from several helpers to the single best split.
pub fn take_best<I>(candidates: I) -> BestSplitProperties
where
    I: IntoIterator<Item = BestSplitProperties>,
{
    let mut best = BestSplitProperties::invalid();
    for candidate in candidates {
        if candidate.better_than(&best) {
            best = candidate;
        }
    }
    best
}

/// Scoring configuration shared by all helpers of one searcher.
#[derive(Clone, Copy, Debug)]
pub struct ScoreOptions {
    /// L2 regularization added to every group weight.
    pub l2_reg: f32,
    /// Normalize group contributions by group weight.
    pub normalize: bool,
}

impl Default for ScoreOptions {
    fn default() -> Self {
        Self {
            l2_reg: 1.0,
            normalize: false,
        }
    }
}

/// Accumulated statistics of one document group.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
struct GroupStats {
    sum: f64,
    weight: f64,
}

struct ScoreState {
    /// `(weight, sum)` of the "taken" group, `histograms[candidate * part_count + part]`.
    histograms: Vec<GroupStats>,
    part_count: usize,
    /// Winning candidate index and score, remapped lazily by the reader.
    best: Option<(usize, f32)>,
}

/// Candidate-split scorer over one binarized grid family.
pub struct ScoreHelper {
    grid: Arc<BinnedGrid>,
    options: ScoreOptions,
    stream: Stream,
    state: Arc<Mutex<ScoreState>>,
}

impl ScoreHelper {
    /// Create a helper with its own execution stream.
    pub fn new(context: &ExecutionContext, grid: Arc<BinnedGrid>, options: ScoreOptions) -> Self {
        Self {
            grid,
            options,
            stream: context.request_stream(),
            state: Arc::new(Mutex::new(ScoreState {
                histograms: Vec::new(),
                part_count: 0,
                best: None,
            })),
        }
    }

    /// Asynchronously accumulate per-(feature, bin, partition) statistics
    /// for the current partitioning.
    ///
    /// `observation_indices[slot]` is the document id at sorted slot `slot`,
    /// in whichever order this grid family is stored (leaf order for dense
    /// and binary grids, direct order for the CTR grid).
    pub fn submit_compute(&self, subsets: &OptimizationSubsets, observation_indices: Arc<[u32]>) {
        if self.grid.is_empty() {
            return;
        }
        let grid = Arc::clone(&self.grid);
        let view = subsets.device_view();
        let state = Arc::clone(&self.state);

        self.stream.submit(move || {
            accumulate_histograms(&grid, &view, &observation_indices, &state);
        });
    }

    /// Asynchronously finalize a regularized, noise-perturbed score per
    /// candidate and record the per-helper best.
    ///
    /// Noise is `score_std_dev * N(0, 1)` from a stream derived of `seed`
    /// and the candidate index, so a fixed seed reproduces scores exactly.
    pub fn compute_optimal_split(
        &self,
        part_stats: Arc<[PartitionStats]>,
        score_std_dev: f64,
        seed: u64,
    ) {
        if self.grid.is_empty() {
            return;
        }
        let grid = Arc::clone(&self.grid);
        let state = Arc::clone(&self.state);
        let options = self.options;

        self.stream.submit(move || {
            score_candidates(&grid, &part_stats, options, score_std_dev, seed, &state);
        });
    }

    /// Block on the helper's stream and return the best split with the
    /// internal candidate index remapped to a global feature id.
    ///
    /// Returns the sentinel split when the grid holds no candidates.
    pub fn read_and_remap_optimal_split(&self) -> BestSplitProperties {
        self.stream.wait();
        let mut state = self.state.lock().expect("score state poisoned");
        let best = state.best.take();
        drop(state);

        match best {
            None => BestSplitProperties::invalid(),
            Some((candidate, score)) => {
                let (feature_pos, bin_id) = self.remap_candidate(candidate);
                BestSplitProperties {
                    feature_id: self.grid.features()[feature_pos].feature_id,
                    bin_id,
                    score,
                }
            }
        }
    }

    /// Raw group histograms, for verification against a reference
    /// accumulation. Blocks on the stream.
    pub fn read_histograms(&self) -> Vec<(f64, f64)> {
        self.stream.wait();
        let state = self.state.lock().expect("score state poisoned");
        state.histograms.iter().map(|g| (g.weight, g.sum)).collect()
    }

    /// Map a flat candidate index back to (feature position, bin id).
    fn remap_candidate(&self, mut candidate: usize) -> (usize, u32) {
        for (pos, feature) in self.grid.features().iter().enumerate() {
            let bins = feature.candidate_bins() as usize;
            if candidate < bins {
                return (pos, candidate as u32);
            }
            candidate -= bins;
        }
        unreachable!("candidate index out of grid range");
    }
}

fn accumulate_histograms(
    grid: &BinnedGrid,
    view: &SubsetsView,
    observation_indices: &[u32],
    state: &Mutex<ScoreState>,
) {
    let part_count = view.partitions.len();
    let candidate_count = grid.candidate_count();

    let mut histograms = vec![GroupStats::default(); candidate_count * part_count];
    let mut candidate_base = 0usize;

    for (feature_pos, feature) in grid.features().iter().enumerate() {
        let column = grid.column(feature_pos);
        let bin_count = feature.bin_count as usize;
        let candidates = feature.candidate_bins() as usize;
        let mut per_bin = vec![GroupStats::default(); bin_count];

        for (part_idx, part) in view.partitions.iter().enumerate() {
            per_bin.iter_mut().for_each(|s| *s = GroupStats::default());

            let begin = part.offset as usize;
            let end = begin + part.size as usize;
            for slot in begin..end {
                let doc = observation_indices[slot] as usize;
                let bin = column[doc] as usize;
                per_bin[bin].sum += view.target[slot] as f64;
                per_bin[bin].weight += view.weights[slot] as f64;
            }

            if feature.one_hot {
                // Taken group is the single bin.
                for bin in 0..candidates {
                    histograms[(candidate_base + bin) * part_count + part_idx] = per_bin[bin];
                }
            } else {
                // Taken group is the prefix `bin <= b`.
                let mut running = GroupStats::default();
                for bin in 0..candidates {
                    running.sum += per_bin[bin].sum;
                    running.weight += per_bin[bin].weight;
                    histograms[(candidate_base + bin) * part_count + part_idx] = running;
                }
            }
        }
        candidate_base += candidates;
    }

    let mut state = state.lock().expect("score state poisoned");
    state.histograms = histograms;
    state.part_count = part_count;
    state.best = None;
}

fn score_candidates(
    grid: &BinnedGrid,
    part_stats: &[PartitionStats],
    options: ScoreOptions,
    score_std_dev: f64,
    seed: u64,
    state: &Mutex<ScoreState>,
) {
    let mut state = state.lock().expect("score state poisoned");
    let part_count = state.part_count;
    debug_assert_eq!(part_count, part_stats.len());

    let candidate_count = grid.candidate_count();
    let mut best: Option<(usize, f32)> = None;

    for candidate in 0..candidate_count {
        let mut score = 0.0f64;
        for (part_idx, total) in part_stats.iter().enumerate() {
            let taken = state.histograms[candidate * part_count + part_idx];
            let rest = GroupStats {
                sum: total.sum - taken.sum,
                weight: total.weight - taken.weight,
            };
            score += group_score(&taken, &options);
            score += group_score(&rest, &options);
        }

        if score_std_dev > 0.0 {
            let mut rng =
                Xoshiro256PlusPlus::seed_from_u64(candidate_seed(seed, candidate as u64));
            let noise: f64 = StandardNormal.sample(&mut rng);
            score += noise * score_std_dev;
        }

        let score = score as f32;
        let wins = match best {
            None => true,
            Some((_, best_score)) => score < best_score,
        };
        if wins {
            best = Some((candidate, score));
        }
    }

    state.best = best;
}

/// Negated regularized group contribution; lower totals are better splits.
#[inline]
fn group_score(group: &GroupStats, options: &ScoreOptions) -> f64 {
    if group.weight <= 0.0 {
        return 0.0;
    }
    let score = -(group.sum * group.sum) / (group.weight + options.l2_reg as f64);
    if options.normalize {
        score / group.weight
    } else {
        score
    }
}
