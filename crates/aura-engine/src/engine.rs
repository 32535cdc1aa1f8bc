//! The aura engine: query surface plus cell and dimension lifecycle.
//!
//! [`AuraEngine`] is shared by reference (typically behind an `Arc`)
//! between gameplay threads, which call the query and mutation methods,
//! and the host's chunk lifecycle, which calls
//! [`load_cell`](AuraEngine::load_cell) and
//! [`unload_cell`](AuraEngine::unload_cell). Every query on a cell that
//! is not loaded is a no-op returning zero; none of them can fail.

use std::error::Error;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use aura_core::{
    CellCoord, DimensionId, EnvironmentSource, PersistError, PersistenceGateway, ResourceField,
    WorldPos,
};

use crate::config::{ConfigError, EngineConfig};
use crate::diffuser::PassReport;
use crate::generation::Generator;
use crate::persist::{PendingSave, PersistenceQueue, SaveOutcome};
use crate::registry::{Deactivated, DimensionState, SimulationRegistry};
use crate::scheduler::{self, DimensionWorker, PassContext};

// ── EngineError ──────────────────────────────────────────────────

/// Errors from engine lifecycle operations.
#[derive(Debug, PartialEq)]
pub enum EngineError {
    /// Configuration failed validation.
    Config(ConfigError),
    /// The persistence gateway failed.
    Persist(PersistError),
    /// A background thread could not be spawned.
    ThreadSpawnFailed {
        /// Which thread and why.
        reason: String,
    },
    /// The engine has been shut down.
    ShutDown,
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(e) => write!(f, "config: {e}"),
            Self::Persist(e) => write!(f, "persistence: {e}"),
            Self::ThreadSpawnFailed { reason } => write!(f, "thread spawn failed: {reason}"),
            Self::ShutDown => write!(f, "engine has shut down"),
        }
    }
}

impl Error for EngineError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Config(e) => Some(e),
            Self::Persist(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ConfigError> for EngineError {
    fn from(e: ConfigError) -> Self {
        Self::Config(e)
    }
}

impl From<PersistError> for EngineError {
    fn from(e: PersistError) -> Self {
        match e {
            PersistError::Closed => Self::ShutDown,
            other => Self::Persist(other),
        }
    }
}

// ── DimensionSummary ─────────────────────────────────────────────

/// Snapshot of one active dimension.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DimensionSummary {
    /// The dimension.
    pub dim: DimensionId,
    /// Live cells.
    pub cells: usize,
    /// Live cells with unsaved changes.
    pub dirty: usize,
    /// Sum of vis over live cells.
    pub total_vis: f64,
    /// Sum of flux over live cells.
    pub total_flux: f64,
    /// Current phase index.
    pub phase: u8,
    /// Passes completed.
    pub passes: u64,
}

// ── AuraEngine ───────────────────────────────────────────────────

/// Thread-safe aura simulation over any number of dimensions.
pub struct AuraEngine {
    config: EngineConfig,
    registry: SimulationRegistry,
    ctx: Arc<PassContext>,
    env: Arc<dyn EnvironmentSource>,
    generator: Generator,
    closed: AtomicBool,
}

impl AuraEngine {
    /// Validate `config` and start the persistence thread.
    ///
    /// No dimension is active until its first cell is loaded.
    pub fn new(
        config: EngineConfig,
        gateway: Arc<dyn PersistenceGateway>,
        env: Arc<dyn EnvironmentSource>,
    ) -> Result<Self, EngineError> {
        config.validate()?;
        let persist = Arc::new(PersistenceQueue::start(
            gateway,
            config.persist_queue_capacity,
        )?);
        let ctx = Arc::new(PassContext {
            tables: config.phases.clone(),
            cadence: config.cadence,
            flush_every_passes: config.flush_every_passes,
            persist,
        });
        let generator = Generator::new(config.seed, config.ceiling, config.generation_jitter);
        log::info!(
            "aura engine started (cadence {:?}, seed {})",
            config.cadence,
            config.seed
        );
        Ok(Self {
            config,
            registry: SimulationRegistry::new(),
            ctx,
            env,
            generator,
            closed: AtomicBool::new(false),
        })
    }

    /// The validated configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // ── Queries ──────────────────────────────────────────────────

    fn with_cell<R>(
        &self,
        dim: DimensionId,
        coord: CellCoord,
        f: impl FnOnce(&mut ResourceField) -> R,
    ) -> Option<R> {
        self.registry.get(dim)?.grid().slot(coord)?.with_live(f)
    }

    /// Current vis, or 0 if the cell is not loaded.
    pub fn get_vis(&self, dim: DimensionId, coord: CellCoord) -> f32 {
        self.with_cell(dim, coord, |f| f.vis()).unwrap_or(0.0)
    }

    /// Current flux, or 0 if the cell is not loaded.
    pub fn get_flux(&self, dim: DimensionId, coord: CellCoord) -> f32 {
        self.with_cell(dim, coord, |f| f.flux()).unwrap_or(0.0)
    }

    /// `vis + flux`, or 0 if the cell is not loaded.
    pub fn get_total_aura(&self, dim: DimensionId, coord: CellCoord) -> f32 {
        self.with_cell(dim, coord, |f| f.total()).unwrap_or(0.0)
    }

    /// The cell's base capacity, or 0 if the cell is not loaded.
    pub fn get_aura_base(&self, dim: DimensionId, coord: CellCoord) -> u16 {
        self.with_cell(dim, coord, |f| f.base()).unwrap_or(0)
    }

    /// Whether the cell is loaded.
    pub fn is_loaded(&self, dim: DimensionId, coord: CellCoord) -> bool {
        self.with_cell(dim, coord, |_| ()).is_some()
    }

    // ── Mutations ────────────────────────────────────────────────

    /// Add vis to a cell, clamping at the limit.
    ///
    /// Returns `false` without effect if `amount` is not positive and
    /// finite or the cell is not loaded.
    pub fn add_vis(&self, dim: DimensionId, coord: CellCoord, amount: f32) -> bool {
        self.with_cell(dim, coord, |f| f.add_vis(amount))
            .unwrap_or(false)
    }

    /// Add flux to a cell, clamping at the limit.
    ///
    /// Returns `false` without effect if `amount` is not positive and
    /// finite or the cell is not loaded.
    pub fn add_flux(&self, dim: DimensionId, coord: CellCoord, amount: f32) -> bool {
        self.with_cell(dim, coord, |f| f.add_flux(amount))
            .unwrap_or(false)
    }

    /// How much vis [`drain_vis`](Self::drain_vis) would remove right
    /// now, without changing the cell.
    pub fn peek_drain_vis(&self, dim: DimensionId, coord: CellCoord, amount: f32) -> f32 {
        self.with_cell(dim, coord, |f| f.available_vis(amount))
            .unwrap_or(0.0)
    }

    /// Remove up to `amount` vis and return what was removed.
    pub fn drain_vis(&self, dim: DimensionId, coord: CellCoord, amount: f32) -> f32 {
        self.with_cell(dim, coord, |f| f.drain_vis(amount))
            .unwrap_or(0.0)
    }

    /// How much flux [`drain_flux`](Self::drain_flux) would remove right
    /// now, without changing the cell.
    pub fn peek_drain_flux(&self, dim: DimensionId, coord: CellCoord, amount: f32) -> f32 {
        self.with_cell(dim, coord, |f| f.available_flux(amount))
            .unwrap_or(0.0)
    }

    /// Remove up to `amount` flux and return what was removed.
    pub fn drain_flux(&self, dim: DimensionId, coord: CellCoord, amount: f32) -> f32 {
        self.with_cell(dim, coord, |f| f.drain_flux(amount))
            .unwrap_or(0.0)
    }

    /// Advisory: whether gameplay should refrain from draining the cell.
    ///
    /// Nothing enforces it; `drain_vis` works regardless.
    pub fn should_preserve_aura(
        &self,
        dim: DimensionId,
        coord: CellCoord,
        has_privilege: bool,
    ) -> bool {
        self.with_cell(dim, coord, |f| f.should_preserve(has_privilege))
            .unwrap_or(false)
    }

    // ── Rifts, phases, passes ────────────────────────────────────

    /// Take the pending rift position for a dimension.
    ///
    /// Each rift is returned at most once; a later rift overwrites an
    /// unpolled one.
    pub fn poll_rift(&self, dim: DimensionId) -> Option<WorldPos> {
        self.registry.get(dim)?.take_rift()
    }

    /// Set a dimension's phase index (wrapping modulo 8).
    ///
    /// Returns `false` if the dimension is not active.
    pub fn set_phase(&self, dim: DimensionId, phase: u8) -> bool {
        match self.registry.get(dim) {
            Some(state) => {
                state.set_phase(phase);
                true
            }
            None => false,
        }
    }

    /// Run one pass over a dimension on the calling thread.
    ///
    /// Serialised with the dimension's worker; returns `None` if the
    /// dimension is not active.
    pub fn pass_now(&self, dim: DimensionId) -> Option<PassReport> {
        let state = self.registry.get(dim)?;
        Some(scheduler::scheduled_pass(&state, &self.ctx))
    }

    /// Live totals for an active dimension.
    pub fn dimension_summary(&self, dim: DimensionId) -> Option<DimensionSummary> {
        let state = self.registry.get(dim)?;
        let grid = state.grid().summary();
        Some(DimensionSummary {
            dim,
            cells: grid.cells,
            dirty: grid.dirty,
            total_vis: grid.total_vis,
            total_flux: grid.total_flux,
            phase: state.phase(),
            passes: state.passes(),
        })
    }

    /// Active dimensions in activation order.
    pub fn active_dimensions(&self) -> Vec<DimensionId> {
        self.registry.active()
    }

    // ── Lifecycle ────────────────────────────────────────────────

    fn ensure_open(&self) -> Result<(), EngineError> {
        if self.closed.load(Ordering::Acquire) {
            Err(EngineError::ShutDown)
        } else {
            Ok(())
        }
    }

    fn spawn_dimension(
        &self,
        dim: DimensionId,
    ) -> Result<(Arc<DimensionState>, DimensionWorker), EngineError> {
        // Checked under the registry lock so shutdown cannot miss it.
        self.ensure_open()?;
        let state = Arc::new(DimensionState::new(
            dim,
            self.config.seed,
            self.config.rift_divisor,
        ));
        let worker = DimensionWorker::start(Arc::clone(&state), Arc::clone(&self.ctx))?;
        Ok((state, worker))
    }

    /// Persisted state for a cell, or a freshly generated field.
    fn fetch(&self, dim: DimensionId, coord: CellCoord) -> Result<ResourceField, EngineError> {
        match self.ctx.persist.load(dim, coord) {
            Ok(Some(stored)) if stored.is_well_formed() => Ok(ResourceField::from_stored(stored)),
            Ok(Some(stored)) => {
                log::warn!("malformed state {stored:?} for {coord} in dimension {dim}; regenerating");
                Ok(self.generator.generate(self.env.as_ref(), dim, coord))
            }
            Ok(None) => Ok(self.generator.generate(self.env.as_ref(), dim, coord)),
            Err(PersistError::Closed) => Err(EngineError::ShutDown),
            Err(err) => {
                log::warn!("loading {coord} in dimension {dim} failed ({err}); generating");
                Ok(self.generator.generate(self.env.as_ref(), dim, coord))
            }
        }
    }

    /// Materialise a cell, loading it or generating it.
    ///
    /// Activates the dimension (starting its worker) if needed. Loading
    /// an already loaded cell is a no-op. The cell's lifecycle lock is
    /// held from the membership check until the insert, so no eviction
    /// of the same cell can slip between the fetch and the insert.
    pub fn load_cell(&self, dim: DimensionId, coord: CellCoord) -> Result<(), EngineError> {
        loop {
            self.ensure_open()?;
            let state = self.registry.activate(dim, || self.spawn_dimension(dim))?;
            let _cell = state.lifecycle_lock(coord);
            if state.grid().contains(coord) {
                return Ok(());
            }
            let field = self.fetch(dim, coord)?;
            if self.registry.insert_cell(&state, coord, field) {
                return Ok(());
            }
            log::debug!("dimension {dim} deactivated while loading {coord}; retrying");
        }
    }

    /// Evict a cell, queueing its final save.
    ///
    /// The save is queued before the lifecycle lock is released, so a
    /// reload always observes it. Deactivates the dimension if this was
    /// its last cell. Unloading a cell that is not loaded is a no-op.
    pub fn unload_cell(&self, dim: DimensionId, coord: CellCoord) -> Result<(), EngineError> {
        self.ensure_open()?;
        let Some(state) = self.registry.get(dim) else {
            return Ok(());
        };
        {
            let _cell = state.lifecycle_lock(coord);
            state.evict_cell(coord, &self.ctx.persist)?;
        }
        if let Some(gone) = self.registry.deactivate_if_empty(dim, &self.ctx.persist) {
            self.retire(gone)?;
        }
        Ok(())
    }

    /// Save every dirty cell of a dimension and wait for the gateway.
    ///
    /// Returns the number of cells saved. On failure the batch stays
    /// dirty for the next flush.
    pub fn flush_dimension(&self, dim: DimensionId) -> Result<usize, EngineError> {
        self.ensure_open()?;
        let Some(state) = self.registry.get(dim) else {
            return Ok(0);
        };
        let (coords, pending) = {
            let _order = state.persist_order();
            let batch = state.grid().drain_dirty();
            let coords: Vec<CellCoord> = batch.iter().map(|(coord, _)| *coord).collect();
            (coords, self.ctx.persist.queue_save(dim, batch))
        };
        let result = pending
            .and_then(PendingSave::wait)
            .map_err(EngineError::from)
            .and_then(saved_or_error);
        if result.is_err() {
            state.grid().mark_dirty(coords);
        }
        result
    }

    /// Stop a dimension's worker, evict all its cells, and save them.
    ///
    /// No-op if the dimension is not active.
    pub fn deactivate_dimension(&self, dim: DimensionId) -> Result<(), EngineError> {
        self.ensure_open()?;
        match self.registry.deactivate(dim, &self.ctx.persist) {
            Some(gone) => self.retire(gone).map(|_| ()),
            None => Ok(()),
        }
    }

    /// Stop a deactivated dimension's worker and wait for its final save.
    ///
    /// The grid was already evicted and queued under the registry lock;
    /// a pass still running sees only evicted slots.
    fn retire(&self, gone: Deactivated) -> Result<usize, EngineError> {
        let Deactivated {
            state,
            mut worker,
            saved,
        } = gone;
        let dim = state.dim();
        worker.stop(self.config.stop_timeout);

        let saved = saved
            .and_then(PendingSave::wait)
            .map_err(EngineError::from)
            .and_then(saved_or_error)?;
        log::info!("dimension {dim} deactivated after {} passes; {saved} cells saved", state.passes());
        Ok(saved)
    }

    /// Deactivate every dimension, save everything, and stop the
    /// persistence thread.
    ///
    /// Idempotent. Afterwards lifecycle calls fail with
    /// [`EngineError::ShutDown`] and queries return zero.
    pub fn shutdown(&self) -> Result<(), EngineError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let mut first_error = None;
        for gone in self.registry.drain(&self.ctx.persist) {
            let dim = gone.state.dim();
            if let Err(e) = self.retire(gone) {
                log::error!("flushing dimension {dim} during shutdown failed: {e}");
                first_error.get_or_insert(e);
            }
        }
        self.ctx.persist.shutdown();
        log::info!("aura engine shut down");
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl Drop for AuraEngine {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            log::error!("aura engine shutdown on drop failed: {e}");
        }
    }
}

impl fmt::Debug for AuraEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuraEngine")
            .field("active", &self.registry.active())
            .field("closed", &self.closed.load(Ordering::Acquire))
            .finish()
    }
}

fn saved_or_error(outcome: SaveOutcome) -> Result<usize, EngineError> {
    match outcome.first_error {
        Some(err) => Err(EngineError::from(err)),
        None => Ok(outcome.saved),
    }
}
