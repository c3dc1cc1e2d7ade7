//! Gradient target contract and the per-tree search target buffers.
//!
//! Target-function definitions live outside this crate; the searcher only
//! needs the gradient at the current ensemble state, per-document weights,
//! and the document ids the target covers. [`L2SearchTarget`] ships as the
//! squared-error implementation used by tests and the default trainer.

mod bootstrap;

pub use bootstrap::{Bootstrap, BootstrapKind};

/// Contract every optimization target must satisfy.
pub trait SearchTarget {
    /// Write the per-document gradient at the current ensemble state.
    /// `out.len()` equals `indices().len()`.
    fn gradient_at_zero(&self, out: &mut [f32]);

    /// Per-document weights, aligned with `indices()`.
    fn weights(&self) -> &[f32];

    /// Document ids this target covers, in observation order.
    fn indices(&self) -> &[u32];
}

/// Squared-error target: gradient at zero is the residual itself.
pub struct L2SearchTarget {
    target: Vec<f32>,
    weights: Vec<f32>,
    indices: Vec<u32>,
}

impl L2SearchTarget {
    pub fn new(target: Vec<f32>, weights: Vec<f32>, indices: Vec<u32>) -> Self {
        assert_eq!(target.len(), weights.len());
        assert_eq!(target.len(), indices.len());
        Self {
            target,
            weights,
            indices,
        }
    }

    /// Target over documents `0..n` with unit weights.
    pub fn from_residuals(target: Vec<f32>) -> Self {
        let n = target.len();
        Self {
            weights: vec![1.0; n],
            indices: (0..n as u32).collect(),
            target,
        }
    }
}

impl SearchTarget for L2SearchTarget {
    fn gradient_at_zero(&self, out: &mut [f32]) {
        out.copy_from_slice(&self.target);
    }

    fn weights(&self) -> &[f32] {
        &self.weights
    }

    fn indices(&self) -> &[u32] {
        &self.indices
    }
}

/// Weighted gradient buffers the searcher builds once per tree.
///
/// `weighted_target[i]` is the gradient multiplied by the (bootstrapped)
/// weight of the document at target position `i`.
#[derive(Clone, Debug, Default)]
pub struct L2Target {
    pub weighted_target: Vec<f32>,
    pub weights: Vec<f32>,
}

impl L2Target {
    #[inline]
    pub fn len(&self) -> usize {
        self.weighted_target.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.weighted_target.is_empty()
    }
}
