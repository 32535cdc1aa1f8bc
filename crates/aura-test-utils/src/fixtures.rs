//! Canned grids for diffusion tests and benchmarks.

use aura_core::{CellCoord, StoredCell};

/// A stored cell.
pub fn stored(base: u16, vis: f32, flux: f32) -> StoredCell {
    StoredCell { base, vis, flux }
}

/// Every coordinate of a `width x depth` rectangle anchored at the
/// origin, in row-major order.
pub fn rect(width: i32, depth: i32) -> Vec<CellCoord> {
    (0..depth)
        .flat_map(|z| (0..width).map(move |x| CellCoord::new(x, z)))
        .collect()
}

/// A rectangle whose cells alternate between full and empty, the
/// roughest field the diffuser can be handed.
pub fn checkerboard(width: i32, depth: i32, base: u16) -> Vec<(CellCoord, StoredCell)> {
    rect(width, depth)
        .into_iter()
        .map(|c| {
            let vis = if (c.x + c.z) % 2 == 0 { base as f32 } else { 0.0 };
            (c, stored(base, vis, 0.0))
        })
        .collect()
}
