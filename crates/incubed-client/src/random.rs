//! Randomness for node selection.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;

pub trait RandomSource: Send {
    /// A value in `[0, 1)`.
    fn next_unit(&mut self) -> f64;
}

/// ChaCha20, seeded for reproducible selection or from OS entropy.
pub struct ChaChaSource(ChaCha20Rng);

impl ChaChaSource {
    pub fn seeded(seed: u64) -> Self {
        Self(ChaCha20Rng::seed_from_u64(seed))
    }

    pub fn from_entropy() -> Self {
        Self(ChaCha20Rng::from_entropy())
    }
}

impl RandomSource for ChaChaSource {
    fn next_unit(&mut self) -> f64 {
        self.0.gen::<f64>()
    }
}

/// Replays the given values in a cycle.
#[derive(Clone, Debug)]
pub struct FixedSource {
    values: Vec<f64>,
    next: usize,
}

impl FixedSource {
    pub fn new(values: Vec<f64>) -> Self {
        Self { values, next: 0 }
    }
}

impl RandomSource for FixedSource {
    fn next_unit(&mut self) -> f64 {
        if self.values.is_empty() {
            return 0.0;
        }
        let value = self.values[self.next % self.values.len()];
        self.next += 1;
        value.clamp(0.0, 1.0 - f64::EPSILON)
    }
}
