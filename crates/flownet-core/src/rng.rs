//! Deterministic PRNG for per-process quality variation.
//!
//! SplitMix64: 8 bytes of state, fast, and reproducible on every platform,
//! so two engines with the same seed start processes with identical
//! efficiencies.

use crate::fixed::Fixed64;

/// SplitMix64 pseudo-random number generator.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct SimRng {
    state: u64,
}

impl SimRng {
    pub fn new(seed: u64) -> Self {
        Self { state: seed }
    }

    /// Generate the next `u64` in the sequence.
    pub fn next_u64(&mut self) -> u64 {
        self.state = self.state.wrapping_add(0x9E37_79B9_7F4A_7C15);
        let mut z = self.state;
        z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
        z ^ (z >> 31)
    }

    /// A uniform value in `[0, 1)`.
    pub fn next_unit(&mut self) -> Fixed64 {
        // The upper 32 bits become the fractional part of a Q32.32 value.
        Fixed64::from_bits((self.next_u64() >> 32) as i64)
    }

    /// A uniform value in `[1 - variance, 1 + variance)`.
    ///
    /// A zero (or negative) variance always yields exactly one and does not
    /// advance the generator.
    pub fn quality_factor(&mut self, variance: Fixed64) -> Fixed64 {
        if variance <= Fixed64::ZERO {
            return Fixed64::ONE;
        }
        // unit * 2 - 1 maps [0, 1) onto [-1, 1).
        let signed = self.next_unit() * 2 - Fixed64::ONE;
        Fixed64::ONE + signed * variance
    }

    pub fn state(&self) -> u64 {
        self.state
    }
}
