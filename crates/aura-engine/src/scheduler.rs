//! Per-dimension pass workers.
//!
//! Each active dimension gets one thread that sleeps for a cadence,
//! runs a pass under the dimension's pass lock, and periodically hands
//! dirty cells to the persistence queue. Sleeps use `park_timeout`, so
//! [`stop`](DimensionWorker::stop) wakes the worker immediately instead
//! of waiting out the cadence.
//!
//! A pass that overruns its cadence is not followed by catch-up passes:
//! the missed slots are skipped and the overrun is logged.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use aura_core::DimensionId;

use crate::diffuser::PassReport;
use crate::engine::EngineError;
use crate::persist::PersistenceQueue;
use crate::phase::PhaseTables;
use crate::registry::DimensionState;

/// Settings every worker shares.
pub(crate) struct PassContext {
    pub tables: PhaseTables,
    pub cadence: Duration,
    pub flush_every_passes: u32,
    pub persist: Arc<PersistenceQueue>,
}

/// Hand a dimension's dirty cells to the queue without blocking.
///
/// Cells that do not fit are re-marked dirty for the next flush.
pub(crate) fn flush_periodic(state: &DimensionState, persist: &PersistenceQueue) {
    let dim = state.dim();
    let grid = state.grid();
    let _order = state.persist_order();
    let batch = grid.drain_dirty();
    let count = batch.len();
    if let Err(rejected) = persist.enqueue(dim, batch) {
        log::debug!(
            "persistence queue full; {} of {count} dirty cells in dimension {dim} deferred",
            rejected.len()
        );
        grid.mark_dirty(rejected.into_iter().map(|(coord, _)| coord));
    }
}

/// Run one pass and hand dirty cells to the queue every
/// `flush_every_passes` passes.
pub(crate) fn scheduled_pass(state: &DimensionState, ctx: &PassContext) -> PassReport {
    let report = state.run_pass(&ctx.tables);
    if report.faults > 0 {
        log::warn!(
            "pass over dimension {} skipped {} faulty cells",
            state.dim(),
            report.faults
        );
    }
    if state.passes() % u64::from(ctx.flush_every_passes) == 0 {
        flush_periodic(state, &ctx.persist);
    }
    report
}

/// Handle to one dimension's pass thread.
pub(crate) struct DimensionWorker {
    dim: DimensionId,
    shutdown: Arc<AtomicBool>,
    stopped: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl DimensionWorker {
    /// Spawn the worker. Its first pass runs one cadence from now.
    pub fn start(state: Arc<DimensionState>, ctx: Arc<PassContext>) -> Result<Self, EngineError> {
        let dim = state.dim();
        let shutdown = Arc::new(AtomicBool::new(false));
        let stopped = Arc::new(AtomicBool::new(false));

        let worker_shutdown = Arc::clone(&shutdown);
        let worker_stopped = Arc::clone(&stopped);
        let handle = thread::Builder::new()
            .name(format!("aura-dim-{dim}"))
            .spawn(move || {
                run(&state, &ctx, &worker_shutdown);
                worker_stopped.store(true, Ordering::Release);
            })
            .map_err(|e| EngineError::ThreadSpawnFailed {
                reason: format!("worker for dimension {dim}: {e}"),
            })?;

        log::debug!("worker for dimension {dim} started");
        Ok(Self {
            dim,
            shutdown,
            stopped,
            handle: Some(handle),
        })
    }

    /// A worker with no thread, already stopped.
    #[cfg(test)]
    pub fn dormant(dim: DimensionId) -> Self {
        Self {
            dim,
            shutdown: Arc::new(AtomicBool::new(true)),
            stopped: Arc::new(AtomicBool::new(true)),
            handle: None,
        }
    }

    /// Whether the thread has left its loop.
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Ask the worker to stop and wait up to `timeout` for it.
    ///
    /// An in-flight pass always finishes first. Returns `true` if the
    /// thread was joined; a worker that misses the deadline is detached
    /// and logged. Calling `stop` again is a no-op that returns `true`.
    pub fn stop(&mut self, timeout: Duration) -> bool {
        let Some(handle) = self.handle.take() else {
            return true;
        };
        self.shutdown.store(true, Ordering::Release);
        handle.thread().unpark();

        let deadline = Instant::now() + timeout;
        while !self.is_stopped() {
            if Instant::now() >= deadline {
                log::warn!(
                    "worker for dimension {} did not stop within {timeout:?}; detaching",
                    self.dim
                );
                return false;
            }
            thread::sleep(Duration::from_millis(1));
        }

        match handle.join() {
            Ok(()) => {
                log::debug!("worker for dimension {} stopped", self.dim);
                true
            }
            Err(_) => {
                log::error!("worker for dimension {} panicked", self.dim);
                false
            }
        }
    }
}

impl Drop for DimensionWorker {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(handle) = &self.handle {
            handle.thread().unpark();
        }
    }
}

/// Sleep until `deadline` or until shutdown is requested.
///
/// Returns `false` if shutdown was requested.
fn park_until(deadline: Instant, shutdown: &AtomicBool) -> bool {
    loop {
        if shutdown.load(Ordering::Acquire) {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        thread::park_timeout(deadline - now);
    }
}

/// Move a deadline that has already passed forward in whole cadences
/// until it lies after `now`.
///
/// Returns the new deadline and the number of slots skipped.
fn skip_missed(next: Instant, now: Instant, cadence: Duration) -> (Instant, u32) {
    if now <= next {
        return (next, 0);
    }
    let behind = (now - next).as_nanos() / cadence.as_nanos();
    let skipped = u32::try_from(behind)
        .unwrap_or(u32::MAX)
        .saturating_add(1);
    (next + cadence.saturating_mul(skipped), skipped)
}

fn run(state: &DimensionState, ctx: &PassContext, shutdown: &AtomicBool) {
    let dim = state.dim();
    let cadence = ctx.cadence;
    let mut next = Instant::now() + cadence;

    while park_until(next, shutdown) {
        let report = scheduled_pass(state, ctx);

        let (resumed, skipped) = skip_missed(next + cadence, Instant::now(), cadence);
        if skipped > 0 {
            log::warn!(
                "pass over dimension {dim} took {:?}, over the {cadence:?} cadence; skipping {skipped}",
                report.elapsed
            );
        }
        next = resumed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aura_core::{CellCoord, ResourceField};
    use aura_test_utils::MemoryGateway;

    fn ctx(cadence: Duration, flush_every_passes: u32, gw: Arc<MemoryGateway>) -> Arc<PassContext> {
        Arc::new(PassContext {
            tables: PhaseTables::uniform(1.0, 0.25),
            cadence,
            flush_every_passes,
            persist: Arc::new(PersistenceQueue::start(gw, 64).unwrap()),
        })
    }

    #[test]
    fn worker_runs_passes_at_cadence() {
        let gw = Arc::new(MemoryGateway::new());
        let state = Arc::new(DimensionState::new(DimensionId(0), 1, 5000.0));
        state
            .grid()
            .put(CellCoord::new(0, 0), ResourceField::new(100, 0.0, 0.0));

        let mut worker =
            DimensionWorker::start(Arc::clone(&state), ctx(Duration::from_millis(5), 1000, gw))
                .unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while state.passes() < 3 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(2));
        }
        assert!(worker.stop(Duration::from_secs(2)));
        assert!(state.passes() >= 3);
        let vis = state.grid().get(CellCoord::new(0, 0)).unwrap().vis();
        assert_eq!(vis, 0.25 * state.passes() as f32);
    }

    #[test]
    fn stop_is_idempotent_and_fast_with_long_cadence() {
        let gw = Arc::new(MemoryGateway::new());
        let state = Arc::new(DimensionState::new(DimensionId(1), 1, 5000.0));
        let mut worker =
            DimensionWorker::start(Arc::clone(&state), ctx(Duration::from_secs(60), 1, gw))
                .unwrap();
        let start = Instant::now();
        assert!(worker.stop(Duration::from_secs(2)));
        assert!(start.elapsed() < Duration::from_secs(1));
        assert!(worker.stop(Duration::from_secs(2)));
        assert!(worker.is_stopped());
        assert_eq!(state.passes(), 0);
    }

    #[test]
    fn stop_before_start_is_noop() {
        let mut worker = DimensionWorker::dormant(DimensionId(4));
        assert!(worker.stop(Duration::from_millis(1)));
    }

    #[test]
    fn periodic_flush_reaches_gateway() {
        let gw = Arc::new(MemoryGateway::new());
        let state = Arc::new(DimensionState::new(DimensionId(2), 1, 5000.0));
        state.grid().put(CellCoord::new(3, 3), ResourceField::generated(40));
        let ctx = ctx(Duration::from_millis(2), 1, Arc::clone(&gw));

        let mut worker = DimensionWorker::start(Arc::clone(&state), Arc::clone(&ctx)).unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while state.passes() < 2 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(2));
        }
        assert!(worker.stop(Duration::from_secs(2)));
        ctx.persist.shutdown();
        assert!(gw.get(DimensionId(2), CellCoord::new(3, 3)).is_some());
    }

    #[test]
    fn full_queue_re_marks_cells_dirty() {
        let state = DimensionState::new(DimensionId(0), 1, 5000.0);
        state.grid().put(CellCoord::new(0, 0), ResourceField::generated(10));
        let persist = PersistenceQueue::start(Arc::new(MemoryGateway::new()), 1).unwrap();
        persist.shutdown();

        flush_periodic(&state, &persist);
        assert_eq!(state.grid().summary().dirty, 1);
    }

    #[test]
    fn skip_missed_keeps_deadlines_on_time() {
        let base = Instant::now();
        let cadence = Duration::from_millis(10);
        assert_eq!(skip_missed(base, base, cadence), (base, 0));
        assert_eq!(
            skip_missed(base + cadence, base, cadence),
            (base + cadence, 0)
        );

        let (next, skipped) = skip_missed(base, base + Duration::from_millis(35), cadence);
        assert_eq!(skipped, 4);
        assert_eq!(next, base + Duration::from_millis(40));

        let (next, skipped) = skip_missed(base, base + Duration::from_millis(30), cadence);
        assert_eq!(skipped, 4);
        assert!(next > base + Duration::from_millis(30));
    }

    #[test]
    fn skip_missed_saturates_instead_of_wrapping() {
        let base = Instant::now();
        let (next, skipped) =
            skip_missed(base, base + Duration::from_secs(10), Duration::from_nanos(1));
        assert_eq!(skipped, u32::MAX);
        assert_eq!(next, base + Duration::from_nanos(u64::from(u32::MAX)));
    }

    #[test]
    fn overrunning_pass_skips_slots_instead_of_catching_up() {
        let gw = Arc::new(MemoryGateway::new());
        let state = Arc::new(DimensionState::new(DimensionId(5), 1, 5000.0));
        let cadence = Duration::from_millis(50);

        // Stall the worker's first pass for twenty cadences.
        let stall = state.hold_pass_lock();
        let mut worker =
            DimensionWorker::start(Arc::clone(&state), ctx(cadence, 1000, gw)).unwrap();
        thread::sleep(cadence * 20);
        assert_eq!(state.passes(), 0);
        drop(stall);

        let deadline = Instant::now() + Duration::from_secs(5);
        while state.passes() < 1 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        thread::sleep(Duration::from_millis(10));
        let after_stall = state.passes();
        assert!(worker.stop(Duration::from_secs(2)));
        assert!(after_stall >= 1);
        assert!(after_stall <= 3, "{after_stall} passes ran right after the stall");
    }

    #[test]
    fn pass_now_and_worker_share_the_pass_lock() {
        let gw = Arc::new(MemoryGateway::new());
        let state = Arc::new(DimensionState::new(DimensionId(6), 1, 5000.0));
        state
            .grid()
            .put(CellCoord::new(0, 0), ResourceField::new(100, 0.0, 0.0));
        let ctx = ctx(Duration::from_millis(1), 1000, gw);

        let stall = state.hold_pass_lock();
        let mut worker = DimensionWorker::start(Arc::clone(&state), Arc::clone(&ctx)).unwrap();
        let caller = {
            let state = Arc::clone(&state);
            let ctx = Arc::clone(&ctx);
            thread::spawn(move || scheduled_pass(&state, &ctx))
        };
        thread::sleep(Duration::from_millis(30));
        assert_eq!(state.passes(), 0);
        assert!(!caller.is_finished());
        drop(stall);

        caller.join().unwrap();
        assert!(worker.stop(Duration::from_secs(2)));
        // Every pass regenerated exactly once: none ran concurrently.
        let vis = state.grid().get(CellCoord::new(0, 0)).unwrap().vis();
        assert_eq!(vis, 0.25 * state.passes() as f32);
    }
}
