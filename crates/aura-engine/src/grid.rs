//! Sparse, concurrency-safe per-dimension cell storage.
//!
//! [`FieldGrid`] maps [`CellCoord`] to a shared [`CellSlot`]. The map
//! lock is only held long enough to look up, insert, or remove a slot;
//! every read-modify-write of a field happens under that cell's own
//! mutex. The unit of synchronisation is therefore one cell, and a
//! diffusion pass never stalls gameplay queries on other cells.
//!
//! A slot removed from the map is marked *evicted* under its own lock.
//! Anyone still holding the `Arc` (a query that looked it up just before
//! removal, or an in-flight pass) sees an evicted slot as absent, so no
//! mutation can land after the final snapshot was taken for persistence.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use aura_core::{CellCoord, ResourceField, StoredCell};
use indexmap::IndexMap;

/// Lock-protected contents of one slot.
#[derive(Debug)]
pub(crate) struct SlotState {
    pub(crate) field: ResourceField,
    pub(crate) evicted: bool,
}

/// One cell's field behind its own mutex.
#[derive(Debug)]
pub struct CellSlot {
    state: Mutex<SlotState>,
}

impl CellSlot {
    /// Wrap a field in a live slot.
    pub fn new(field: ResourceField) -> Self {
        Self {
            state: Mutex::new(SlotState {
                field,
                evicted: false,
            }),
        }
    }

    /// Lock the slot. A poisoned lock is recovered: fields are only ever
    /// assigned whole, clamped values, so the contents stay valid.
    pub(crate) fn lock(&self) -> MutexGuard<'_, SlotState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `f` against the field if the slot is still live.
    pub fn with_live<R>(&self, f: impl FnOnce(&mut ResourceField) -> R) -> Option<R> {
        let mut guard = self.lock();
        if guard.evicted {
            return None;
        }
        Some(f(&mut guard.field))
    }

    /// Copy of the field, or `None` once evicted.
    pub fn snapshot(&self) -> Option<ResourceField> {
        self.with_live(|field| field.clone())
    }

    /// Whether the slot has been evicted.
    pub fn is_evicted(&self) -> bool {
        self.lock().evicted
    }

    /// Mark the slot evicted and return its final state.
    ///
    /// Returns `None` if it was already evicted.
    fn evict(&self) -> Option<ResourceField> {
        let mut guard = self.lock();
        if guard.evicted {
            return None;
        }
        guard.evicted = true;
        Some(guard.field.clone())
    }
}

/// Aggregate view of one grid.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct GridSummary {
    /// Live cells.
    pub cells: usize,
    /// Live cells with unsaved changes.
    pub dirty: usize,
    /// Sum of vis over live cells.
    pub total_vis: f64,
    /// Sum of flux over live cells.
    pub total_flux: f64,
}

/// Sparse map from cell coordinate to slot for one dimension.
#[derive(Debug, Default)]
pub struct FieldGrid {
    cells: RwLock<IndexMap<CellCoord, Arc<CellSlot>>>,
}

impl FieldGrid {
    /// An empty grid.
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, IndexMap<CellCoord, Arc<CellSlot>>> {
        self.cells.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, IndexMap<CellCoord, Arc<CellSlot>>> {
        self.cells.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// The slot at `coord`, if live.
    pub fn slot(&self, coord: CellCoord) -> Option<Arc<CellSlot>> {
        self.read().get(&coord).cloned()
    }

    /// Copy of the field at `coord`.
    pub fn get(&self, coord: CellCoord) -> Option<ResourceField> {
        self.slot(coord)?.snapshot()
    }

    /// Store `field` at `coord`, swapping it in whole if a live slot
    /// already exists.
    pub fn put(&self, coord: CellCoord, field: ResourceField) {
        if let Some(slot) = self.slot(coord) {
            let mut guard = slot.lock();
            if !guard.evicted {
                guard.field = field;
                return;
            }
        }
        self.write().insert(coord, Arc::new(CellSlot::new(field)));
    }

    /// Insert `field` only if no slot exists at `coord`.
    ///
    /// Returns `true` if the field was inserted.
    pub fn insert_if_absent(&self, coord: CellCoord, field: ResourceField) -> bool {
        let mut cells = self.write();
        if cells.contains_key(&coord) {
            return false;
        }
        cells.insert(coord, Arc::new(CellSlot::new(field)));
        true
    }

    /// Remove and evict the slot at `coord`, returning its final state.
    pub fn remove(&self, coord: CellCoord) -> Option<ResourceField> {
        let slot = self.write().shift_remove(&coord)?;
        slot.evict()
    }

    /// Remove and evict every slot, returning the final states.
    pub fn drain_all(&self) -> Vec<(CellCoord, ResourceField)> {
        let drained: Vec<_> = self.write().drain(..).collect();
        drained
            .into_iter()
            .filter_map(|(coord, slot)| slot.evict().map(|field| (coord, field)))
            .collect()
    }

    /// Whether `coord` has a live slot.
    pub fn contains(&self, coord: CellCoord) -> bool {
        self.read().contains_key(&coord)
    }

    /// Number of live cells.
    pub fn len(&self) -> usize {
        self.read().len()
    }

    /// Whether the grid has no live cells.
    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Coordinates of all live cells, in insertion order.
    pub fn coords(&self) -> Vec<CellCoord> {
        self.read().keys().copied().collect()
    }

    /// Collect the persisted form of every dirty cell and clear the flags.
    pub fn drain_dirty(&self) -> Vec<(CellCoord, StoredCell)> {
        let slots: Vec<_> = self
            .read()
            .iter()
            .map(|(coord, slot)| (*coord, Arc::clone(slot)))
            .collect();
        slots
            .into_iter()
            .filter_map(|(coord, slot)| {
                slot.with_live(|field| field.take_dirty().then(|| field.to_stored()))
                    .flatten()
                    .map(|stored| (coord, stored))
            })
            .collect()
    }

    /// Re-flag cells whose save did not make it into the queue.
    pub fn mark_dirty(&self, coords: impl IntoIterator<Item = CellCoord>) {
        for coord in coords {
            if let Some(slot) = self.slot(coord) {
                slot.with_live(|field| field.mark_dirty());
            }
        }
    }

    /// Totals over live cells.
    pub fn summary(&self) -> GridSummary {
        let slots: Vec<_> = self.read().values().cloned().collect();
        let mut summary = GridSummary::default();
        for slot in slots {
            if let Some(field) = slot.snapshot() {
                summary.cells += 1;
                if field.is_dirty() {
                    summary.dirty += 1;
                }
                summary.total_vis += field.vis() as f64;
                summary.total_flux += field.flux() as f64;
            }
        }
        summary
    }
}
