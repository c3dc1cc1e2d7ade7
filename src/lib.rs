//! Structure search for oblivious decision trees inside a gradient-boosting
//! trainer.
//!
//! An oblivious tree applies the same binary split at every node of a
//! depth; searching its structure means picking, level by level, the best
//! split over dense numeric features, binary features, precomputed target
//! statistics, and dynamically synthesized categorical-combination
//! statistics (tree CTRs), under a regularized squared-error score with
//! deterministic seeded noise.
//!
//! The accelerator model is an explicit [`execution::ExecutionContext`]:
//! ordered work streams with push-work/barrier-wait semantics. Histogram
//! accumulation and candidate scoring run asynchronously on streams; the
//! orchestrator in [`searcher`] only blocks at explicit barriers.
//!
//! Dataset loading, binarization, the outer boosting loop, and leaf-value
//! estimation are external collaborators; see [`data::SearchDataSet`] for
//! the surface they provide and [`updater::BinCache`] for what the search
//! leaves behind.

pub mod data;
pub mod execution;
pub mod features;
pub mod random;
pub mod score;
pub mod searcher;
pub mod subsets;
pub mod target;
pub mod tree;
pub mod tree_ctrs;
pub mod updater;

pub use searcher::{ObliviousTreeSearcher, SearchError, TreeSearchOptions};
pub use tree::{BinarySplit, ObliviousTreeStructure, SplitKind};
