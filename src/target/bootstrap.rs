//! Bootstrap: per-document multiplicative weights drawn before the gradient
//! target is built.

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::random::SearchRandom;

/// Bootstrap flavor.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub enum BootstrapKind {
    /// All weights 1.0.
    None,
    /// Bayesian bootstrap: `(-ln u)^temperature`.
    Bayesian { temperature: f32 },
    /// Bernoulli bootstrap: weight 1 with probability `take_fraction`, else 0.
    Bernoulli { take_fraction: f32 },
}

impl Default for BootstrapKind {
    fn default() -> Self {
        BootstrapKind::None
    }
}

/// Draws bootstrap weight vectors from the tree's random stream.
#[derive(Clone, Copy, Debug, Default)]
pub struct Bootstrap {
    kind: BootstrapKind,
}

impl Bootstrap {
    pub fn new(kind: BootstrapKind) -> Self {
        if let BootstrapKind::Bernoulli { take_fraction } = kind {
            assert!(
                (0.0..=1.0).contains(&take_fraction),
                "take_fraction must lie in [0, 1]"
            );
        }
        Self { kind }
    }

    /// One multiplicative weight per document position.
    pub fn bootstraped_weights(&self, len: usize, random: &mut SearchRandom) -> Vec<f32> {
        match self.kind {
            BootstrapKind::None => vec![1.0; len],
            BootstrapKind::Bayesian { temperature } => (0..len)
                .map(|_| {
                    let u: f32 = random.gen::<f32>().max(f32::MIN_POSITIVE);
                    (-u.ln()).powf(temperature)
                })
                .collect(),
            BootstrapKind::Bernoulli { take_fraction } => (0..len)
                .map(|_| {
                    if random.gen::<f32>() < take_fraction {
                        1.0
                    } else {
                        0.0
                    }
                })
                .collect(),
        }
    }
}
