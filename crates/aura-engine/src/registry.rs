//! Explicit registry of active dimensions.
//!
//! A dimension is *active* while it has an entry here: a [`FieldGrid`],
//! a [`Diffuser`] behind the pass lock, its phase index, its pending
//! rift, and the worker driving its passes. Entries are created on
//! activation (first materialised cell) and destroyed on deactivation
//! (grid emptied, explicit deactivate, or engine shutdown).
//!
//! The registry lock is held only for lookups and membership changes.
//! [`insert_cell`](SimulationRegistry::insert_cell) and
//! [`deactivate_if_empty`](SimulationRegistry::deactivate_if_empty)
//! both go through it, so a cell can never be inserted into a grid that
//! has just been judged empty and torn down. A deactivated grid's final
//! save is queued before the registry lock is released, so a load that
//! reactivates the dimension is always answered after that save.
//!
//! Two more locks keep persistence in order:
//! - the *lifecycle* lock of a cell (one of a fixed set of stripes) is
//!   held across fetch-then-insert and across remove-then-save, so a
//!   load and an unload of the same cell never interleave;
//! - the *persist order* lock is held by every path that snapshots
//!   cells and queues them, so saves of one dimension reach the queue
//!   in the order their snapshots were taken.
//!
//! Lock order: lifecycle, registry, persist order, grid, cell.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use aura_core::{CellCoord, DimensionId, PersistError, ResourceField, WorldPos};
use indexmap::IndexMap;

use crate::diffuser::{Diffuser, PassReport};
use crate::grid::FieldGrid;
use crate::persist::{PendingSave, PersistenceQueue};
use crate::phase::{PhaseTables, PHASE_COUNT};
use crate::scheduler::DimensionWorker;

/// Number of lifecycle lock stripes per dimension.
const LIFECYCLE_STRIPES: usize = 64;

// ── DimensionState ───────────────────────────────────────────────

/// Everything one active dimension owns.
#[derive(Debug)]
pub struct DimensionState {
    dim: DimensionId,
    grid: FieldGrid,
    /// The pass lock: holding it is the only way to run a pass.
    diffuser: Mutex<Diffuser>,
    phase: AtomicU8,
    rift: Mutex<Option<WorldPos>>,
    passes: AtomicU64,
    lifecycle: Box<[Mutex<()>]>,
    persist_order: Mutex<()>,
}

impl DimensionState {
    /// Fresh state with a diffuser seeded from `seed` and the dimension.
    pub fn new(dim: DimensionId, seed: u64, rift_divisor: f32) -> Self {
        Self {
            dim,
            grid: FieldGrid::new(),
            diffuser: Mutex::new(Diffuser::seeded(seed ^ dim.seed_mix(), rift_divisor)),
            phase: AtomicU8::new(0),
            rift: Mutex::new(None),
            passes: AtomicU64::new(0),
            lifecycle: (0..LIFECYCLE_STRIPES).map(|_| Mutex::new(())).collect(),
            persist_order: Mutex::new(()),
        }
    }

    /// The dimension this state belongs to.
    pub fn dim(&self) -> DimensionId {
        self.dim
    }

    /// The dimension's live cells.
    pub fn grid(&self) -> &FieldGrid {
        &self.grid
    }

    /// Current phase index in `0..8`.
    pub fn phase(&self) -> u8 {
        self.phase.load(Ordering::Acquire)
    }

    /// Set the phase index; it wraps modulo the cycle length.
    pub fn set_phase(&self, phase: u8) {
        self.phase
            .store(phase % PHASE_COUNT as u8, Ordering::Release);
    }

    /// Passes completed so far.
    pub fn passes(&self) -> u64 {
        self.passes.load(Ordering::Acquire)
    }

    /// Run one pass under the pass lock and record any rift.
    pub fn run_pass(&self, tables: &PhaseTables) -> PassReport {
        let mut diffuser = self
            .diffuser
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let mods = tables.modifiers(self.phase());
        let report = diffuser.run_pass(&self.grid, mods);
        if let Some(pos) = report.rift {
            *self.rift_slot() = Some(pos);
        }
        self.passes.fetch_add(1, Ordering::AcqRel);
        report
    }

    fn stripe(&self, coord: CellCoord) -> usize {
        let h = (coord.x as u32).wrapping_mul(0x9E37_79B1) ^ (coord.z as u32).wrapping_mul(0x85EB_CA6B);
        (h >> 16) as usize % self.lifecycle.len()
    }

    /// Lock the lifecycle stripe of `coord`.
    pub(crate) fn lifecycle_lock(&self, coord: CellCoord) -> MutexGuard<'_, ()> {
        self.lifecycle[self.stripe(coord)]
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Lock the persist order. Hold it from snapshot until queued.
    pub(crate) fn persist_order(&self) -> MutexGuard<'_, ()> {
        self.persist_order
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Evict one cell, queueing its final state if it is dirty.
    ///
    /// The save is queued before the persist order is released. Returns
    /// whether a live cell was evicted.
    pub(crate) fn evict_cell(
        &self,
        coord: CellCoord,
        persist: &PersistenceQueue,
    ) -> Result<bool, PersistError> {
        let _order = self.persist_order();
        let Some(field) = self.grid.remove(coord) else {
            return Ok(false);
        };
        if field.is_dirty() {
            persist.submit(self.dim, vec![(coord, field.to_stored())])?;
        }
        Ok(true)
    }

    /// Evict every cell and queue the dirty ones.
    pub(crate) fn seal(&self, persist: &PersistenceQueue) -> Result<PendingSave, PersistError> {
        let _order = self.persist_order();
        let batch: Vec<_> = self
            .grid
            .drain_all()
            .into_iter()
            .filter(|(_, field)| field.is_dirty())
            .map(|(coord, field)| (coord, field.to_stored()))
            .collect();
        persist.queue_save(self.dim, batch)
    }

    /// Hold the pass lock, keeping every pass out.
    #[cfg(test)]
    pub(crate) fn hold_pass_lock(&self) -> MutexGuard<'_, Diffuser> {
        self.diffuser.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Take the pending rift, leaving none.
    pub fn take_rift(&self) -> Option<WorldPos> {
        self.rift_slot().take()
    }

    fn rift_slot(&self) -> MutexGuard<'_, Option<WorldPos>> {
        self.rift.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// ── SimulationRegistry ───────────────────────────────────────────

struct DimensionEntry {
    state: Arc<DimensionState>,
    worker: DimensionWorker,
}

/// A dimension removed from the registry. Its cells are already
/// evicted and queued; the caller stops the worker and collects the
/// save outcome.
pub(crate) struct Deactivated {
    pub state: Arc<DimensionState>,
    pub worker: DimensionWorker,
    pub saved: Result<PendingSave, PersistError>,
}

/// Map of active dimensions.
#[derive(Default)]
pub struct SimulationRegistry {
    dims: RwLock<IndexMap<DimensionId, DimensionEntry>>,
}

impl SimulationRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, IndexMap<DimensionId, DimensionEntry>> {
        self.dims.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, IndexMap<DimensionId, DimensionEntry>> {
        self.dims.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// State of an active dimension.
    pub fn get(&self, dim: DimensionId) -> Option<Arc<DimensionState>> {
        self.read().get(&dim).map(|e| Arc::clone(&e.state))
    }

    /// Active dimensions in activation order.
    pub fn active(&self) -> Vec<DimensionId> {
        self.read().keys().copied().collect()
    }

    /// Number of active dimensions.
    pub fn len(&self) -> usize {
        self.read().len()
    }

    /// Whether no dimension is active.
    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Return the dimension's state, activating it with `start` first if
    /// needed. `start` runs under the registry lock.
    pub(crate) fn activate<E>(
        &self,
        dim: DimensionId,
        start: impl FnOnce() -> Result<(Arc<DimensionState>, DimensionWorker), E>,
    ) -> Result<Arc<DimensionState>, E> {
        if let Some(state) = self.get(dim) {
            return Ok(state);
        }
        let mut dims = self.write();
        if let Some(entry) = dims.get(&dim) {
            return Ok(Arc::clone(&entry.state));
        }
        let (state, worker) = start()?;
        log::info!("dimension {dim} activated");
        dims.insert(
            dim,
            DimensionEntry {
                state: Arc::clone(&state),
                worker,
            },
        );
        Ok(state)
    }

    /// Insert a field into `state`'s grid if `state` is still the active
    /// entry for its dimension.
    ///
    /// Returns `false` if the dimension was deactivated in the meantime.
    pub(crate) fn insert_cell(
        &self,
        state: &Arc<DimensionState>,
        coord: CellCoord,
        field: ResourceField,
    ) -> bool {
        let dims = self.read();
        match dims.get(&state.dim) {
            Some(entry) if Arc::ptr_eq(&entry.state, state) => {
                state.grid.insert_if_absent(coord, field);
                true
            }
            _ => false,
        }
    }

    /// Remove a dimension whose grid is empty.
    pub(crate) fn deactivate_if_empty(
        &self,
        dim: DimensionId,
        persist: &PersistenceQueue,
    ) -> Option<Deactivated> {
        let mut dims = self.write();
        if !dims.get(&dim)?.state.grid.is_empty() {
            return None;
        }
        let entry = dims.shift_remove(&dim)?;
        Some(entry.seal(persist))
    }

    /// Remove a dimension unconditionally.
    pub(crate) fn deactivate(
        &self,
        dim: DimensionId,
        persist: &PersistenceQueue,
    ) -> Option<Deactivated> {
        let mut dims = self.write();
        let entry = dims.shift_remove(&dim)?;
        Some(entry.seal(persist))
    }

    /// Remove every dimension.
    pub(crate) fn drain(&self, persist: &PersistenceQueue) -> Vec<Deactivated> {
        let mut dims = self.write();
        let gone = dims.drain(..).map(|(_, entry)| entry.seal(persist)).collect();
        gone
    }
}

impl DimensionEntry {
    /// Evict and queue the grid. Called with the registry lock held.
    fn seal(self, persist: &PersistenceQueue) -> Deactivated {
        let saved = self.state.seal(persist);
        Deactivated {
            state: self.state,
            worker: self.worker,
            saved,
        }
    }
}

impl std::fmt::Debug for SimulationRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimulationRegistry")
            .field("active", &self.active())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::time::Duration;

    use aura_test_utils::MemoryGateway;

    fn queue(gw: &Arc<MemoryGateway>) -> PersistenceQueue {
        PersistenceQueue::start(gw.clone(), 8).unwrap()
    }

    fn dormant(dim: DimensionId) -> (Arc<DimensionState>, DimensionWorker) {
        (
            Arc::new(DimensionState::new(dim, 7, 5000.0)),
            DimensionWorker::dormant(dim),
        )
    }

    #[test]
    fn activate_creates_once() {
        let reg = SimulationRegistry::new();
        let dim = DimensionId(1);
        let a = reg.activate::<()>(dim, || Ok(dormant(dim))).unwrap();
        let b = reg
            .activate::<()>(dim, || panic!("second activation must reuse the entry"))
            .unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(reg.active(), vec![dim]);
    }

    #[test]
    fn failed_activation_leaves_nothing() {
        let reg = SimulationRegistry::new();
        let r = reg.activate(DimensionId(0), || Err("boom"));
        assert_eq!(r.unwrap_err(), "boom");
        assert!(reg.is_empty());
    }

    #[test]
    fn deactivate_if_empty_respects_cells() {
        let gw = Arc::new(MemoryGateway::new());
        let persist = queue(&gw);
        let reg = SimulationRegistry::new();
        let dim = DimensionId(2);
        let state = reg.activate::<()>(dim, || Ok(dormant(dim))).unwrap();
        assert!(reg.insert_cell(&state, CellCoord::new(0, 0), ResourceField::generated(10)));
        assert!(reg.deactivate_if_empty(dim, &persist).is_none());

        assert!(state.evict_cell(CellCoord::new(0, 0), &persist).unwrap());
        let mut gone = reg.deactivate_if_empty(dim, &persist).unwrap();
        gone.worker.stop(Duration::from_millis(10));
        assert_eq!(gone.saved.unwrap().wait().unwrap().saved, 0);
        assert!(reg.get(dim).is_none());
        persist.shutdown();
        assert!(gw.get(dim, CellCoord::new(0, 0)).is_some());
    }

    #[test]
    fn stale_state_rejects_insert() {
        let gw = Arc::new(MemoryGateway::new());
        let persist = queue(&gw);
        let reg = SimulationRegistry::new();
        let dim = DimensionId(3);
        let old = reg.activate::<()>(dim, || Ok(dormant(dim))).unwrap();
        assert!(reg.deactivate(dim, &persist).is_some());
        assert!(!reg.insert_cell(&old, CellCoord::new(1, 1), ResourceField::generated(5)));
        assert!(old.grid().is_empty());
    }

    #[test]
    fn phase_wraps_and_rift_is_consumed_once() {
        let state = DimensionState::new(DimensionId(0), 0, 1.0);
        state.set_phase(11);
        assert_eq!(state.phase(), 3);

        state
            .grid()
            .put(CellCoord::new(1, 1), ResourceField::new(100, 0.0, 90.0));
        let report = state.run_pass(&PhaseTables::uniform(1.0, 0.0));
        assert_eq!(report.rift, Some(CellCoord::new(1, 1).center()));
        assert_eq!(state.passes(), 1);
        assert_eq!(state.take_rift(), Some(CellCoord::new(1, 1).center()));
        assert_eq!(state.take_rift(), None);
    }

    #[test]
    fn drain_empties_registry() {
        let gw = Arc::new(MemoryGateway::new());
        let persist = queue(&gw);
        let reg = SimulationRegistry::new();
        for d in 0..3 {
            reg.activate::<()>(DimensionId(d), || Ok(dormant(DimensionId(d))))
                .unwrap();
        }
        assert_eq!(reg.len(), 3);
        assert_eq!(reg.drain(&persist).len(), 3);
        assert!(reg.is_empty());
    }

    #[test]
    fn deactivation_queues_dirty_cells_before_returning() {
        let gw = Arc::new(MemoryGateway::new());
        let persist = queue(&gw);
        let reg = SimulationRegistry::new();
        let dim = DimensionId(5);
        let state = reg.activate::<()>(dim, || Ok(dormant(dim))).unwrap();
        reg.insert_cell(&state, CellCoord::new(0, 0), ResourceField::generated(40));
        reg.insert_cell(&state, CellCoord::new(1, 0), ResourceField::new(40, 1.0, 0.0));
        let held = state.grid().slot(CellCoord::new(0, 0)).unwrap();

        let gone = reg.deactivate(dim, &persist).unwrap();
        assert!(held.is_evicted());
        // A load queued now is answered after the deactivation save.
        assert!(persist.load(dim, CellCoord::new(0, 0)).unwrap().is_some());
        assert_eq!(persist.load(dim, CellCoord::new(1, 0)).unwrap(), None);
        assert_eq!(gone.saved.unwrap().wait().unwrap().saved, 1);
    }

    #[test]
    fn lifecycle_stripes_spread_coordinates() {
        let state = DimensionState::new(DimensionId(0), 0, 5000.0);
        let stripes: HashSet<usize> = (-8..8)
            .flat_map(|x| (-8..8).map(move |z| CellCoord::new(x, z)))
            .map(|c| state.stripe(c))
            .collect();
        assert!(stripes.len() > LIFECYCLE_STRIPES / 2);

        let origin = CellCoord::new(0, 0);
        let _held = state.lifecycle_lock(origin);
        let other = (1..)
            .map(|x| CellCoord::new(x, 0))
            .find(|c| state.stripe(*c) != state.stripe(origin))
            .unwrap();
        assert!(state.lifecycle[state.stripe(other)].try_lock().is_ok());
        assert!(state.lifecycle[state.stripe(origin)].try_lock().is_err());
    }
}
