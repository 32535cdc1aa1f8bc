//! Per-cell diffusion: equalization, regeneration, conversion, rifts.
//!
//! One pass visits every live cell of a grid once. For each cell:
//!
//! 1. `ceiling = base * phase.max`.
//! 2. The four orthogonal neighbours are examined in a freshly shuffled
//!    order. The vis target is the lowest-vis neighbour with headroom
//!    (`vis + flux < base * phase.max`); the flux target is the
//!    lowest-flux neighbour. Ties go to whichever came first in the
//!    shuffled order.
//! 3. Vis moves to the vis target when it holds less than 75% of the
//!    cell's vis; flux moves to the flux target when the cell is above
//!    `max(5, base / 10)` and the target holds less than `flux / 1.75`.
//!    Each transfer moves at most [`MAX_TRANSFER`], so a pass is a
//!    rate-limited low-pass filter rather than a solve to equilibrium.
//! 4. Regeneration, conversion, or stagnation (first match wins).
//! 5. A rift may fire when flux passes 75% of the ceiling.
//!
//! A transfer locks both cells (lower coordinate first) and re-checks
//! its condition against the locked values, so it is atomic with
//! respect to any concurrent add or drain on either cell.

use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, MutexGuard};
use std::time::{Duration, Instant};

use aura_core::{CellCoord, CellFault, ResourceField, WorldPos};
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use smallvec::SmallVec;

use crate::grid::{CellSlot, FieldGrid, SlotState};
use crate::phase::PhaseModifiers;

/// Largest amount moved by one equalization transfer.
pub const MAX_TRANSFER: f32 = 1.0;

/// Vis flows only while `target.vis / cell.vis` is below this ratio.
const VIS_RATIO: f32 = 0.75;

/// Flux flows only while `target.flux < cell.flux / FLUX_DIVISOR`.
const FLUX_DIVISOR: f32 = 1.75;

/// Minimum flux a cell must hold before it sheds flux.
const FLUX_FLOOR: f32 = 5.0;

/// Vis above `ceiling * OVERFLOW` may convert to flux.
const OVERFLOW: f32 = 1.25;

/// Vis at or below `ceiling * STAGNATION` may breed flux.
const STAGNATION: f32 = 0.1;

/// Per-pass chance of conversion or stagnation once eligible.
const EVENT_CHANCE: f32 = 0.1;

/// Flux above `ceiling * RIFT_THRESHOLD` makes a rift possible.
const RIFT_THRESHOLD: f32 = 0.75;

/// What step 4 did to a cell.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum Regrowth {
    /// No branch changed the cell.
    #[default]
    None,
    /// Vis grew toward the ceiling.
    Regenerated,
    /// Surplus vis converted into flux.
    Converted,
    /// Flux appeared in a depleted cell.
    Stagnated,
}

/// Outcome of diffusing one cell.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct CellStep {
    /// Vis moved to a neighbour.
    pub vis_transfer: bool,
    /// Flux moved to a neighbour.
    pub flux_transfer: bool,
    /// Result of the regeneration branch.
    pub regrowth: Regrowth,
    /// A rift fired at this cell.
    pub rift: bool,
}

/// Totals for one pass over a grid.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PassReport {
    /// Cells diffused (excludes cells evicted mid-pass).
    pub cells: usize,
    /// Vis transfers performed.
    pub vis_transfers: usize,
    /// Flux transfers performed.
    pub flux_transfers: usize,
    /// Cells whose vis regenerated.
    pub regenerated: usize,
    /// Cells that converted vis to flux.
    pub converted: usize,
    /// Cells that stagnated.
    pub stagnated: usize,
    /// Cells skipped because of a fault.
    pub faults: usize,
    /// Last rift position triggered during the pass.
    pub rift: Option<WorldPos>,
    /// Wall time of the pass.
    pub elapsed: Duration,
}

impl PassReport {
    fn record(&mut self, coord: CellCoord, step: CellStep) {
        self.cells += 1;
        self.vis_transfers += step.vis_transfer as usize;
        self.flux_transfers += step.flux_transfer as usize;
        match step.regrowth {
            Regrowth::None => {}
            Regrowth::Regenerated => self.regenerated += 1,
            Regrowth::Converted => self.converted += 1,
            Regrowth::Stagnated => self.stagnated += 1,
        }
        if step.rift {
            self.rift = Some(coord.center());
        }
    }
}

#[derive(Clone, Copy)]
enum Resource {
    Vis,
    Flux,
}

/// Runs diffusion passes with an injectable random source.
///
/// The random source drives neighbour shuffling, conversion and
/// stagnation rolls, and rift rolls. Seeding it makes a pass over a
/// given grid fully reproducible.
#[derive(Debug)]
pub struct Diffuser<R = ChaCha8Rng> {
    rng: R,
    rift_divisor: f32,
}

impl Diffuser<ChaCha8Rng> {
    /// A diffuser driven by a ChaCha8 stream from `seed`.
    pub fn seeded(seed: u64, rift_divisor: f32) -> Self {
        Self::new(ChaCha8Rng::seed_from_u64(seed), rift_divisor)
    }
}

impl<R: Rng> Diffuser<R> {
    /// A diffuser driven by `rng`.
    pub fn new(rng: R, rift_divisor: f32) -> Self {
        Self { rng, rift_divisor }
    }

    /// Diffuse every live cell once.
    ///
    /// A fault in one cell is logged and counted; the pass continues
    /// with the next cell.
    pub fn run_pass(&mut self, grid: &FieldGrid, phase: PhaseModifiers) -> PassReport {
        let start = Instant::now();
        let mut report = PassReport::default();

        for coord in grid.coords() {
            let outcome =
                panic::catch_unwind(AssertUnwindSafe(|| self.step_cell(grid, coord, phase)))
                    .unwrap_or_else(|payload| {
                        Err(CellFault::Panicked {
                            reason: panic_reason(payload.as_ref()),
                        })
                    });
            match outcome {
                Ok(Some(step)) => report.record(coord, step),
                Ok(None) => {}
                Err(fault) => {
                    log::warn!("skipping cell {coord}: {fault}");
                    report.faults += 1;
                }
            }
        }

        report.elapsed = start.elapsed();
        report
    }

    /// Diffuse one cell.
    ///
    /// Returns `Ok(None)` if the cell is not live.
    pub fn step_cell(
        &mut self,
        grid: &FieldGrid,
        coord: CellCoord,
        phase: PhaseModifiers,
    ) -> Result<Option<CellStep>, CellFault> {
        let Some(slot) = grid.slot(coord) else {
            return Ok(None);
        };
        let Some(center) = slot.snapshot() else {
            return Ok(None);
        };
        let ceiling = center.base() as f32 * phase.max;
        if !ceiling.is_finite() || !phase.vis_rate.is_finite() || !phase.flux_rate.is_finite() {
            return Err(CellFault::NonFinite);
        }

        let mut order = coord.neighbours();
        order.shuffle(&mut self.rng);
        let neighbours: SmallVec<[(CellCoord, Arc<CellSlot>, ResourceField); 4]> = order
            .into_iter()
            .filter_map(|n| {
                let s = grid.slot(n)?;
                let f = s.snapshot()?;
                Some((n, s, f))
            })
            .collect();

        let mut vis_target: Option<usize> = None;
        let mut flux_target: Option<usize> = None;
        for (i, (_, _, f)) in neighbours.iter().enumerate() {
            if has_headroom(f, phase.max)
                && vis_target.is_none_or(|j| f.vis() < neighbours[j].2.vis())
            {
                vis_target = Some(i);
            }
            if flux_target.is_none_or(|j| f.flux() < neighbours[j].2.flux()) {
                flux_target = Some(i);
            }
        }

        let mut step = CellStep::default();

        if let Some(i) = vis_target {
            let (n_coord, n_slot, _) = &neighbours[i];
            step.vis_transfer = transfer(&slot, coord, n_slot, *n_coord, Resource::Vis, |c, n| {
                has_headroom(n, phase.max) && n.vis() < c.vis() && n.vis() / c.vis() < VIS_RATIO
            })?;
        }

        if let Some(i) = flux_target {
            let (n_coord, n_slot, _) = &neighbours[i];
            step.flux_transfer =
                transfer(&slot, coord, n_slot, *n_coord, Resource::Flux, |c, n| {
                    c.flux() > FLUX_FLOOR.max(c.base() as f32 / 10.0)
                        && n.flux() < c.flux() / FLUX_DIVISOR
                })?;
        }

        let mut guard = slot.lock();
        if guard.evicted {
            return Ok(Some(step));
        }
        let field = &mut guard.field;

        step.regrowth = self.regrow(field, ceiling, phase)?;

        if field.flux() > ceiling * RIFT_THRESHOLD
            && self.rng.random::<f32>() < field.flux() / self.rift_divisor
        {
            step.rift = true;
        }

        Ok(Some(step))
    }

    fn regrow(
        &mut self,
        field: &mut ResourceField,
        ceiling: f32,
        phase: PhaseModifiers,
    ) -> Result<Regrowth, CellFault> {
        let total = field.total();
        if total < ceiling {
            let add = (ceiling - total).min(phase.vis_rate);
            if add > 0.0 {
                field.set_vis(checked(field.vis() + add)?);
                return Ok(Regrowth::Regenerated);
            }
            return Ok(Regrowth::None);
        }
        if field.vis() > ceiling * OVERFLOW && self.rng.random::<f32>() < EVENT_CHANCE {
            if phase.flux_rate > 0.0 {
                let vis = checked(field.vis() - phase.flux_rate)?;
                let flux = checked(field.flux() + phase.flux_rate)?;
                field.set_vis(vis);
                field.set_flux(flux);
                return Ok(Regrowth::Converted);
            }
            return Ok(Regrowth::None);
        }
        if field.vis() <= ceiling * STAGNATION
            && field.vis() >= field.flux()
            && self.rng.random::<f32>() < EVENT_CHANCE
            && phase.flux_rate > 0.0
        {
            field.set_flux(checked(field.flux() + phase.flux_rate)?);
            return Ok(Regrowth::Stagnated);
        }
        Ok(Regrowth::None)
    }
}

fn has_headroom(field: &ResourceField, max: f32) -> bool {
    field.total() < field.base() as f32 * max
}

fn checked(v: f32) -> Result<f32, CellFault> {
    if v.is_finite() {
        Ok(v)
    } else {
        Err(CellFault::NonFinite)
    }
}

/// Lock two distinct slots in coordinate order.
///
/// Returns the guards in argument order.
fn lock_pair<'a>(
    a: &'a CellSlot,
    a_coord: CellCoord,
    b: &'a CellSlot,
    b_coord: CellCoord,
) -> (MutexGuard<'a, SlotState>, MutexGuard<'a, SlotState>) {
    if a_coord < b_coord {
        let ga = a.lock();
        let gb = b.lock();
        (ga, gb)
    } else {
        let gb = b.lock();
        let ga = a.lock();
        (ga, gb)
    }
}

/// Move up to [`MAX_TRANSFER`] of `resource` from `cell` to `target`
/// if `eligible` still holds for the locked values.
fn transfer(
    cell: &CellSlot,
    cell_coord: CellCoord,
    target: &CellSlot,
    target_coord: CellCoord,
    resource: Resource,
    eligible: impl FnOnce(&ResourceField, &ResourceField) -> bool,
) -> Result<bool, CellFault> {
    let (mut c, mut n) = lock_pair(cell, cell_coord, target, target_coord);
    if c.evicted || n.evicted || !eligible(&c.field, &n.field) {
        return Ok(false);
    }
    let (from, to) = match resource {
        Resource::Vis => (c.field.vis(), n.field.vis()),
        Resource::Flux => (c.field.flux(), n.field.flux()),
    };
    let t = (from - to).min(MAX_TRANSFER);
    let from = checked(from - t)?;
    let to = checked(to + t)?;
    match resource {
        Resource::Vis => {
            c.field.set_vis(from);
            n.field.set_vis(to);
        }
        Resource::Flux => {
            c.field.set_flux(from);
            n.field.set_flux(to);
        }
    }
    Ok(true)
}

fn panic_reason(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
