//! Benchmark profiles for the aura diffusion engine.
//!
//! - [`reference_grid`]: 64x64 cells (4K), roughly a loaded render area
//! - [`stress_grid`]: 256x256 cells (64K)
//!
//! Both are filled deterministically from a seed so runs are comparable.

#![forbid(unsafe_code)]
#![deny(rustdoc::broken_intra_doc_links)]

use aura_core::{CellCoord, ResourceField};
use aura_engine::FieldGrid;

/// Build a `side x side` grid with uneven, seed-derived fields.
pub fn profile_grid(side: i32, seed: u64) -> FieldGrid {
    let grid = FieldGrid::new();
    for z in 0..side {
        for x in 0..side {
            let h = hash(seed, x, z);
            let base = (h % 501) as u16;
            let vis = (h >> 16) as f32 % (base as f32 * 1.4 + 1.0);
            let flux = (h >> 40) as f32 % (base as f32 * 0.2 + 1.0);
            grid.put(CellCoord::new(x, z), ResourceField::new(base, vis, flux));
        }
    }
    grid
}

/// 64x64 cells.
pub fn reference_grid(seed: u64) -> FieldGrid {
    profile_grid(64, seed)
}

/// 256x256 cells.
pub fn stress_grid(seed: u64) -> FieldGrid {
    profile_grid(256, seed)
}

fn hash(seed: u64, x: i32, z: i32) -> u64 {
    let mut h = seed ^ ((x as u32 as u64) << 32 | z as u32 as u64);
    h = h.wrapping_mul(0x9E37_79B9_7F4A_7C15);
    h ^= h >> 29;
    h = h.wrapping_mul(0xBF58_476D_1CE4_E5B9);
    h ^ (h >> 32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn profiles_are_deterministic() {
        let a = profile_grid(8, 3);
        let b = profile_grid(8, 3);
        assert_eq!(a.len(), 64);
        for coord in a.coords() {
            assert_eq!(a.get(coord), b.get(coord));
        }
    }

    #[test]
    fn profile_values_are_in_range() {
        let grid = profile_grid(16, 9);
        for coord in grid.coords() {
            let f = grid.get(coord).unwrap();
            assert!(f.base() <= 500);
            assert!(f.vis() >= 0.0 && f.flux() >= 0.0);
        }
    }
}
