//! Integration tests for the oblivious-tree structure search.
//!
//! These run the full per-depth loop over small hand-built datasets.

use symboost::data::{DatasetId, SearchDataSetBuilder};
use symboost::execution::ExecutionContext;
use symboost::features::{CtrConfig, CtrType, FeaturesManager};
use symboost::searcher::{ObliviousTreeSearcher, TreeSearchOptions};
use symboost::target::{BootstrapKind, L2SearchTarget};
use symboost::tree::SplitKind;
use symboost::updater::BinCache;

fn quiet_options(max_depth: u32) -> TreeSearchOptions {
    TreeSearchOptions {
        max_depth,
        random_strength: 0.0,
        ..Default::default()
    }
}

#[test]
fn test_single_binary_feature_splits_at_depth_one() {
    let manager = FeaturesManager::new(Vec::new());
    let dataset = SearchDataSetBuilder::new(&manager, 4, 1)
        .add_binary_feature(0.5, vec![0, 0, 1, 1])
        .build(DatasetId(1));
    let context = ExecutionContext::new(1);
    let cache = BinCache::new();
    let target = L2SearchTarget::from_residuals(vec![1.0, 1.0, -1.0, -1.0]);

    let mut searcher =
        ObliviousTreeSearcher::new(&context, &manager, &dataset, &cache, quiet_options(1));
    searcher.set_target(&target).unwrap();
    let (structure, bins) = searcher.fit().unwrap();

    assert_eq!(structure.depth(), 1);
    let split = structure.splits()[0];
    assert_eq!(split.feature_id, 0);
    assert_eq!(split.bin_id, 0);
    assert_eq!(split.kind, SplitKind::TakeGreater);
    // Documents with bin > 0 land in leaf 1.
    assert_eq!(bins.as_slice(), &[0, 0, 1, 1]);
}

#[test]
fn test_one_informative_feature_stops_after_one_split() {
    let manager = FeaturesManager::new(Vec::new());
    let dataset = SearchDataSetBuilder::new(&manager, 8, 1)
        .add_binary_feature(0.5, vec![0, 0, 0, 0, 1, 1, 1, 1])
        .build(DatasetId(2));
    let context = ExecutionContext::new(1);
    let cache = BinCache::new();
    let target =
        L2SearchTarget::from_residuals(vec![1.0, 1.0, 1.0, 1.0, -1.0, -1.0, -1.0, -1.0]);

    let mut searcher =
        ObliviousTreeSearcher::new(&context, &manager, &dataset, &cache, quiet_options(3));
    searcher.set_target(&target).unwrap();
    let (structure, bins) = searcher.fit().unwrap();

    // The only useful split wins depth two as well, which stops the search.
    assert_eq!(structure.depth(), 1);
    assert!(bins.iter().all(|&b| b < 2));
}

#[test]
fn test_same_seed_reproduces_the_structure() {
    let manager = FeaturesManager::new(Vec::new());
    let dataset = SearchDataSetBuilder::new(&manager, 8, 2)
        .add_float_feature(vec![0.5, 1.5], vec![0, 1, 2, 0, 1, 2, 0, 1])
        .add_float_feature(vec![0.5], vec![0, 1, 0, 1, 0, 1, 0, 1])
        .add_float_feature(vec![0.5, 1.5, 2.5], vec![3, 2, 1, 0, 3, 2, 1, 0])
        .build(DatasetId(3));
    let context = ExecutionContext::new(2);
    let cache = BinCache::new();
    // A test slice gives the search a non-zero noise level, so the runs
    // actually draw from the seeded stream.
    let learn = L2SearchTarget::new(
        vec![2.0, -1.0, 0.5, -0.5],
        vec![1.0; 4],
        vec![0, 1, 2, 3],
    );
    let test = L2SearchTarget::new(
        vec![1.5, -2.0, 0.25, -0.25],
        vec![1.0; 4],
        vec![4, 5, 6, 7],
    );

    let run = |seed: u64| {
        let options = TreeSearchOptions {
            max_depth: 3,
            random_strength: 1.0,
            seed,
            ..Default::default()
        };
        let mut searcher =
            ObliviousTreeSearcher::new(&context, &manager, &dataset, &cache, options);
        searcher.add_task(&learn, Some(&test)).unwrap();
        searcher.fit().unwrap().0
    };

    assert_eq!(run(42), run(42));
}

#[test]
fn test_tree_ctr_beats_uninformative_static_feature() {
    let manager = FeaturesManager::new(vec![CtrConfig::new(CtrType::Buckets, 0.5)]);
    let n = 16;
    // Static feature uncorrelated with the target; the categorical feature
    // carries the whole signal.
    let static_bins: Vec<u8> = (0..n).map(|i| (i % 2) as u8).collect();
    let cat_values: Vec<u32> = (0..n).map(|i| (i / 8) as u32).collect();
    let target: Vec<f32> = cat_values
        .iter()
        .map(|&v| if v == 0 { 1.0 } else { -1.0 })
        .collect();

    let dataset = SearchDataSetBuilder::new(&manager, n, 1)
        .add_float_feature(vec![0.5], static_bins)
        .add_cat_feature(2, cat_values)
        .ctr_permutations(1, 11)
        .build(DatasetId(4));
    let context = ExecutionContext::new(1);
    let cache = BinCache::new();
    let search_target = L2SearchTarget::from_residuals(target);

    let mut searcher =
        ObliviousTreeSearcher::new(&context, &manager, &dataset, &cache, quiet_options(1));
    searcher.set_target(&search_target).unwrap();
    let (structure, _) = searcher.fit().unwrap();

    assert_eq!(structure.depth(), 1);
    let split = structure.splits()[0];
    assert!(manager.is_ctr(split.feature_id));
    assert!(!manager.borders(split.feature_id).is_empty());
    assert!(manager.ctr_for_id(split.feature_id).is_some());
}

#[test]
fn test_tree_ctr_split_chains_into_deeper_ctr_candidates() {
    let manager = FeaturesManager::new(vec![CtrConfig::new(CtrType::Buckets, 0.5)]);
    let n = 16;
    // No static features at all: both depths must come from tree CTRs, and
    // the second candidate is materialized on top of the applied first
    // split, whose predicate exists only as per-document bits.
    let cat0: Vec<u32> = (0..n).map(|i| (i / 8) as u32).collect();
    let cat1: Vec<u32> = (0..n).map(|i| (i % 4) as u32).collect();
    let target: Vec<f32> = cat0
        .iter()
        .map(|&v| if v == 0 { 1.0 } else { -1.0 })
        .collect();

    let dataset = SearchDataSetBuilder::new(&manager, n, 1)
        .add_cat_feature(2, cat0)
        .add_cat_feature(4, cat1)
        .ctr_permutations(1, 11)
        .build(DatasetId(7));
    let context = ExecutionContext::new(1);
    let cache = BinCache::new();
    let search_target = L2SearchTarget::from_residuals(target);

    let mut searcher =
        ObliviousTreeSearcher::new(&context, &manager, &dataset, &cache, quiet_options(2));
    searcher.set_target(&search_target).unwrap();
    let (structure, bins) = searcher.fit().unwrap();

    assert_eq!(structure.depth(), 2);
    let first = structure.splits()[0];
    let second = structure.splits()[1];
    assert!(manager.is_ctr(first.feature_id));
    assert!(manager.is_ctr(second.feature_id));

    let first_tensor = manager.ctr_for_id(first.feature_id).unwrap().tensor;
    assert!(first_tensor.splits().is_empty());
    // The second winner's identity carries the first split and both
    // categorical features.
    let second_tensor = manager.ctr_for_id(second.feature_id).unwrap().tensor;
    assert_eq!(second_tensor.splits(), &[first]);
    assert_eq!(second_tensor.complexity(), 2);
    assert_eq!(bins.len(), n);
}

#[test]
fn test_final_bins_are_cached_per_dataset() {
    let manager = FeaturesManager::new(Vec::new());
    let dataset = SearchDataSetBuilder::new(&manager, 4, 1)
        .add_float_feature(vec![0.5, 1.5], vec![0, 1, 2, 1])
        .build(DatasetId(5));
    let context = ExecutionContext::new(1);
    let cache = BinCache::new();
    let target = L2SearchTarget::from_residuals(vec![3.0, 1.0, -3.0, -1.0]);

    let mut searcher =
        ObliviousTreeSearcher::new(&context, &manager, &dataset, &cache, quiet_options(2));
    searcher.set_target(&target).unwrap();
    let (structure, bins) = searcher.fit().unwrap();

    assert_eq!(cache.get(DatasetId(5)), Some(bins.clone()));
    assert!(bins.iter().all(|&b| (b as usize) < structure.leaves()));
}

#[test]
fn test_fold_tasks_with_test_only_bootstrap() {
    let manager = FeaturesManager::new(Vec::new());
    let dataset = SearchDataSetBuilder::new(&manager, 8, 1)
        .add_binary_feature(0.5, vec![0, 0, 1, 1, 0, 0, 1, 1])
        .build(DatasetId(6));
    let context = ExecutionContext::new(1);
    let cache = BinCache::new();

    let learn = L2SearchTarget::new(
        vec![1.0, 1.0, -1.0, -1.0],
        vec![1.0; 4],
        vec![0, 1, 2, 3],
    );
    let test = L2SearchTarget::new(
        vec![1.0, 1.0, -1.0, -1.0],
        vec![1.0; 4],
        vec![4, 5, 6, 7],
    );

    let options = TreeSearchOptions {
        max_depth: 2,
        bootstrap: BootstrapKind::Bayesian { temperature: 1.0 },
        bootstrap_test_only: true,
        random_strength: 0.0,
        seed: 13,
        ..Default::default()
    };
    let mut searcher = ObliviousTreeSearcher::new(&context, &manager, &dataset, &cache, options);
    searcher.add_task(&learn, Some(&test)).unwrap();
    let (structure, bins) = searcher.fit().unwrap();

    assert!(structure.depth() >= 1);
    assert_eq!(structure.splits()[0].feature_id, 0);
    assert_eq!(bins.len(), 8);
}
