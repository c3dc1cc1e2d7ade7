//! Deterministic random stream for one tree search.
//!
//! A single stream is seeded once per tree; per-helper seeds are drawn from
//! it in a fixed order each depth, and per-tensor noise seeds are derived by
//! a fixed linear-congruential mix of a base seed with the device index and
//! the tensor hash. Re-running with the same base seed and enumeration order
//! reproduces identical scores.

use rand::{Rng, RngCore, SeedableRng};
use rand_xoshiro::Xoshiro256PlusPlus;

/// Linear-congruential constants used for seed mixing.
pub(crate) const LCG_MUL: u64 = 664525;
pub(crate) const LCG_ADD: u64 = 1013904223;

/// Derive the per-device noise seed from a base seed.
#[inline]
pub fn device_seed(base: u64, device: usize) -> u64 {
    base.wrapping_add(LCG_MUL.wrapping_mul(device as u64))
        .wrapping_add(LCG_ADD)
}

/// Mix a seed with a candidate index to get an independent noise stream
/// per (feature, bin) candidate.
#[inline]
pub fn candidate_seed(seed: u64, candidate: u64) -> u64 {
    seed.wrapping_mul(LCG_MUL)
        .wrapping_add(LCG_ADD)
        .wrapping_add(candidate.wrapping_mul(0x9E37_79B9_7F4A_7C15))
}

/// Deterministic pseudo-random stream used by one tree search.
pub struct SearchRandom {
    rng: Xoshiro256PlusPlus,
}

impl SearchRandom {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: Xoshiro256PlusPlus::seed_from_u64(seed),
        }
    }

    /// Next raw 64-bit value (used as a helper/visitor base seed).
    #[inline]
    pub fn next_seed(&mut self) -> u64 {
        self.rng.next_u64()
    }

    #[inline]
    pub fn gen_uniform(&mut self) -> f32 {
        self.rng.gen::<f32>()
    }
}

impl RngCore for SearchRandom {
    fn next_u32(&mut self) -> u32 {
        self.rng.next_u32()
    }

    fn next_u64(&mut self) -> u64 {
        self.rng.next_u64()
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        self.rng.fill_bytes(dest)
    }

    fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand::Error> {
        self.rng.try_fill_bytes(dest)
    }
}
