//! Test utilities and mock collaborators for aura development.
//!
//! Provides in-memory and failing implementations of
//! [`PersistenceGateway`], scripted [`EnvironmentSource`]s, and
//! [`init_logging`] for tests that want to see engine logs.

#![forbid(unsafe_code)]
#![allow(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

pub mod fixtures;

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

use aura_core::{
    CellCoord, DimensionId, EnvironmentSource, PersistError, PersistenceGateway, StoredCell,
    WorldPos,
};

/// Route `log` output through `env_logger` in test mode.
///
/// Safe to call from every test; only the first call installs the
/// logger. Filter with `RUST_LOG`.
pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

// ── Gateways ─────────────────────────────────────────────────────

/// `HashMap`-backed gateway that counts traffic.
#[derive(Default)]
pub struct MemoryGateway {
    cells: Mutex<HashMap<(DimensionId, CellCoord), StoredCell>>,
    saves: AtomicUsize,
    loads: AtomicUsize,
}

impl MemoryGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-populate a cell as though a previous session saved it.
    pub fn insert(&self, dim: DimensionId, coord: CellCoord, cell: StoredCell) {
        self.map().insert((dim, coord), cell);
    }

    /// Stored state for a cell, bypassing the counters.
    pub fn get(&self, dim: DimensionId, coord: CellCoord) -> Option<StoredCell> {
        self.map().get(&(dim, coord)).copied()
    }

    /// Number of stored cells.
    pub fn len(&self) -> usize {
        self.map().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map().is_empty()
    }

    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::Acquire)
    }

    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::Acquire)
    }

    fn map(&self) -> std::sync::MutexGuard<'_, HashMap<(DimensionId, CellCoord), StoredCell>> {
        self.cells.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl PersistenceGateway for MemoryGateway {
    fn load_cell(
        &self,
        dim: DimensionId,
        coord: CellCoord,
    ) -> Result<Option<StoredCell>, PersistError> {
        self.loads.fetch_add(1, Ordering::AcqRel);
        Ok(self.get(dim, coord))
    }

    fn save_cell(
        &self,
        dim: DimensionId,
        coord: CellCoord,
        cell: StoredCell,
    ) -> Result<(), PersistError> {
        self.saves.fetch_add(1, Ordering::AcqRel);
        self.map().insert((dim, coord), cell);
        Ok(())
    }
}

/// Gateway whose every call fails with an I/O error.
pub struct FailingGateway;

impl PersistenceGateway for FailingGateway {
    fn load_cell(
        &self,
        _dim: DimensionId,
        _coord: CellCoord,
    ) -> Result<Option<StoredCell>, PersistError> {
        Err(PersistError::Io {
            reason: "store offline".into(),
        })
    }

    fn save_cell(
        &self,
        _dim: DimensionId,
        _coord: CellCoord,
        _cell: StoredCell,
    ) -> Result<(), PersistError> {
        Err(PersistError::Io {
            reason: "store offline".into(),
        })
    }
}

// ── Environments ─────────────────────────────────────────────────

/// The same fertility everywhere.
#[derive(Clone, Copy, Debug)]
pub struct ConstFertility(pub f32);

impl EnvironmentSource for ConstFertility {
    fn fertility_at(&self, _dim: DimensionId, _pos: WorldPos) -> f32 {
        self.0
    }
}

/// Fertility computed by a closure.
pub struct FnFertility<F>(pub F);

impl<F> EnvironmentSource for FnFertility<F>
where
    F: Fn(DimensionId, WorldPos) -> f32 + Send + Sync,
{
    fn fertility_at(&self, dim: DimensionId, pos: WorldPos) -> f32 {
        (self.0)(dim, pos)
    }
}
