//! Collaborator traits consumed by the engine.
//!
//! - [`PersistenceGateway`]: load and save one cell's triple.
//! - [`EnvironmentSource`]: fertility scalar sampled at generation time.
//!
//! Both are called from engine-owned threads, hence `Send + Sync`.

use crate::error::PersistError;
use crate::field::StoredCell;
use crate::id::{CellCoord, DimensionId, WorldPos};

/// Durable storage for cell state, keyed by `(dimension, coordinate)`.
pub trait PersistenceGateway: Send + Sync {
    /// Load a cell. `Ok(None)` is a miss, which triggers generation.
    fn load_cell(
        &self,
        dim: DimensionId,
        coord: CellCoord,
    ) -> Result<Option<StoredCell>, PersistError>;

    /// Save a cell's current triple.
    fn save_cell(
        &self,
        dim: DimensionId,
        coord: CellCoord,
        cell: StoredCell,
    ) -> Result<(), PersistError>;
}

/// Supplies the environmental fertility used to size new cells.
pub trait EnvironmentSource: Send + Sync {
    /// Fertility at a world position, expected in `[0, 1]`.
    ///
    /// Values outside the range are clamped by the caller; NaN counts
    /// as zero.
    fn fertility_at(&self, dim: DimensionId, pos: WorldPos) -> f32;
}
