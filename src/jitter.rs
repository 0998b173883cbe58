use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Draws randomized intervals from `[avg·(1−v), avg·(1+v)]`.
///
/// Used to desynchronize periodic store writes across a fleet of agents.
/// Owns its own RNG so tests can seed it deterministically.
pub struct JitteredInterval {
    average: Duration,
    variance: f64,
    rng: StdRng,
}

impl JitteredInterval {
    /// Create a generator with the given average and relative variance.
    ///
    /// `variance` is clamped to [0, 1]; 0.5 means ±50%.
    pub fn new(average: Duration, variance: f64) -> Self {
        Self::with_rng(average, variance, StdRng::from_entropy())
    }

    /// Create a generator with an explicit RNG.
    pub fn with_rng(average: Duration, variance: f64, rng: StdRng) -> Self {
        Self {
            average,
            variance: variance.clamp(0.0, 1.0),
            rng,
        }
    }

    /// Create a deterministically seeded generator.
    pub fn with_seed(average: Duration, variance: f64, seed: u64) -> Self {
        Self::with_rng(average, variance, StdRng::seed_from_u64(seed))
    }

    /// Draw the next interval.
    pub fn next(&mut self) -> Duration {
        if self.variance == 0.0 || self.average.is_zero() {
            return self.average;
        }

        let avg = self.average.as_secs_f64();
        let r: f64 = self.rng.gen();
        let offset = 2.0 * r * (self.variance * avg) - self.variance * avg;

        Duration::from_secs_f64((avg + offset).max(0.0))
    }

    /// Smallest interval this generator can draw.
    pub fn minimum(&self) -> Duration {
        Duration::from_secs_f64(self.average.as_secs_f64() * (1.0 - self.variance))
    }

    /// Nominal average interval.
    pub fn average(&self) -> Duration {
        self.average
    }
}
