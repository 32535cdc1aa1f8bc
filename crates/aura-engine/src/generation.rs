//! Initial field generation for cells with no persisted state.
//!
//! Fertility is sampled at the cell center and at the four orthogonal
//! neighbour centers. The mean is scaled by the configured ceiling and a
//! small multiplicative jitter, clamped, and rounded to the cell's base.
//!
//! Jitter is drawn from a ChaCha8 stream seeded from
//! `(seed, dimension, coord)`, so a cell generates to the same base no
//! matter which thread or pass first observes it.

use aura_core::{CellCoord, DimensionId, EnvironmentSource, ResourceField};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

/// Sizes new cells from environmental fertility.
#[derive(Clone, Debug)]
pub struct Generator {
    seed: u64,
    ceiling: u16,
    jitter: f32,
}

impl Generator {
    /// Create a generator. `jitter` is the relative noise amplitude.
    pub fn new(seed: u64, ceiling: u16, jitter: f32) -> Self {
        Self {
            seed,
            ceiling,
            jitter,
        }
    }

    /// Compute the base for a cell.
    pub fn base_for(
        &self,
        env: &dyn EnvironmentSource,
        dim: DimensionId,
        coord: CellCoord,
    ) -> u16 {
        let mut sum = sample(env, dim, coord);
        for n in coord.neighbours() {
            sum += sample(env, dim, n);
        }
        let mean = sum / 5.0;

        let mut rng = ChaCha8Rng::seed_from_u64(self.cell_seed(dim, coord));
        let noise: f32 = rng.random_range(-1.0..=1.0);

        let ceiling = self.ceiling as f32;
        let raw = mean * ceiling * (1.0 + noise * self.jitter);
        raw.clamp(0.0, ceiling).round() as u16
    }

    /// Generate a fresh, dirty field for a cell.
    pub fn generate(
        &self,
        env: &dyn EnvironmentSource,
        dim: DimensionId,
        coord: CellCoord,
    ) -> ResourceField {
        ResourceField::generated(self.base_for(env, dim, coord))
    }

    fn cell_seed(&self, dim: DimensionId, coord: CellCoord) -> u64 {
        let packed = ((coord.x as u32 as u64) << 32) | coord.z as u32 as u64;
        self.seed ^ dim.seed_mix() ^ packed.wrapping_mul(0x9E37_79B9_7F4A_7C15)
    }
}

fn sample(env: &dyn EnvironmentSource, dim: DimensionId, coord: CellCoord) -> f32 {
    let f = env.fertility_at(dim, coord.center());
    if f.is_nan() {
        0.0
    } else {
        f.clamp(0.0, 1.0)
    }
}
