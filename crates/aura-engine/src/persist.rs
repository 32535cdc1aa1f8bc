//! Persistence actor: one thread owns all gateway traffic.
//!
//! Loads and saves share a single bounded FIFO channel, so a save queued
//! before a load of the same cell is always applied before that load is
//! answered. Gateway calls therefore never run on a pass worker or a
//! query thread.
//!
//! Ways in:
//! - [`enqueue`](PersistenceQueue::enqueue): non-blocking `try_send`
//!   used by periodic flushes. A full queue hands the batch back.
//! - [`submit`](PersistenceQueue::submit) and
//!   [`queue_save`](PersistenceQueue::queue_save): blocking sends used
//!   by eviction and explicit flushes; `queue_save` also hands back a
//!   [`PendingSave`] to wait on. [`write_through`](PersistenceQueue::write_through)
//!   does both in one call.
//! - [`load`](PersistenceQueue::load): blocking send plus a reply.

use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

use aura_core::{CellCoord, DimensionId, PersistError, PersistenceGateway, StoredCell};
use crossbeam_channel::{Receiver, Sender, TrySendError};

use crate::engine::EngineError;

type Batch = Vec<(CellCoord, StoredCell)>;

enum Job {
    Save {
        dim: DimensionId,
        cells: Batch,
        reply: Option<Sender<SaveOutcome>>,
    },
    Load {
        dim: DimensionId,
        coord: CellCoord,
        reply: Sender<Result<Option<StoredCell>, PersistError>>,
    },
    Shutdown,
}

/// Result of saving one batch.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SaveOutcome {
    /// Cells written successfully.
    pub saved: usize,
    /// Cells the gateway rejected.
    pub failed: usize,
    /// First gateway error in the batch.
    pub first_error: Option<PersistError>,
}

/// A queued save whose outcome has not been collected.
#[derive(Debug)]
pub struct PendingSave {
    reply: Option<Receiver<SaveOutcome>>,
}

impl PendingSave {
    /// Block until the gateway has processed the batch.
    pub fn wait(self) -> Result<SaveOutcome, PersistError> {
        match self.reply {
            Some(rx) => rx.recv().map_err(|_| PersistError::Closed),
            None => Ok(SaveOutcome::default()),
        }
    }
}

/// Handle to the persistence thread.
pub struct PersistenceQueue {
    tx: Sender<Job>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl PersistenceQueue {
    /// Spawn the persistence thread with a queue of `capacity` jobs.
    pub fn start(
        gateway: Arc<dyn PersistenceGateway>,
        capacity: usize,
    ) -> Result<Self, EngineError> {
        let (tx, rx) = crossbeam_channel::bounded(capacity);
        let handle = thread::Builder::new()
            .name("aura-persist".into())
            .spawn(move || run(gateway, rx))
            .map_err(|e| EngineError::ThreadSpawnFailed {
                reason: format!("persistence thread: {e}"),
            })?;
        Ok(Self {
            tx,
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Queue a batch without blocking.
    ///
    /// Returns the batch back if the queue is full or closed; the caller
    /// re-marks those cells dirty.
    pub fn enqueue(&self, dim: DimensionId, cells: Batch) -> Result<(), Batch> {
        if cells.is_empty() {
            return Ok(());
        }
        let job = Job::Save {
            dim,
            cells,
            reply: None,
        };
        match self.tx.try_send(job) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(Job::Save { cells, .. }))
            | Err(TrySendError::Disconnected(Job::Save { cells, .. })) => Err(cells),
            Err(_) => Err(Vec::new()),
        }
    }

    /// Queue a batch, blocking while the queue is full.
    ///
    /// Returns once the batch is durably queued; any later load of the
    /// same cells observes it.
    pub fn submit(&self, dim: DimensionId, cells: Batch) -> Result<(), PersistError> {
        if cells.is_empty() {
            return Ok(());
        }
        self.tx
            .send(Job::Save {
                dim,
                cells,
                reply: None,
            })
            .map_err(|_| PersistError::Closed)
    }

    /// Queue a batch, blocking while the queue is full, and return a
    /// handle to its outcome.
    ///
    /// The batch is ordered against other jobs as soon as this returns;
    /// only collecting the outcome waits on the gateway.
    pub fn queue_save(&self, dim: DimensionId, cells: Batch) -> Result<PendingSave, PersistError> {
        if cells.is_empty() {
            return Ok(PendingSave { reply: None });
        }
        let (reply, rx) = crossbeam_channel::bounded(1);
        self.tx
            .send(Job::Save {
                dim,
                cells,
                reply: Some(reply),
            })
            .map_err(|_| PersistError::Closed)?;
        Ok(PendingSave { reply: Some(rx) })
    }

    /// Save a batch and wait for the gateway to finish with it.
    pub fn write_through(&self, dim: DimensionId, cells: Batch) -> Result<SaveOutcome, PersistError> {
        self.queue_save(dim, cells)?.wait()
    }

    /// Load a cell, after every previously queued save has been applied.
    pub fn load(
        &self,
        dim: DimensionId,
        coord: CellCoord,
    ) -> Result<Option<StoredCell>, PersistError> {
        let (reply, rx) = crossbeam_channel::bounded(1);
        self.tx
            .send(Job::Load { dim, coord, reply })
            .map_err(|_| PersistError::Closed)?;
        rx.recv().map_err(|_| PersistError::Closed)?
    }

    /// Drain the queue, stop the thread, and join it. Idempotent.
    pub fn shutdown(&self) {
        let handle = self
            .handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(handle) = handle else {
            return;
        };
        // Queued jobs ahead of the marker are still processed.
        if self.tx.send(Job::Shutdown).is_err() {
            log::warn!("persistence thread exited before shutdown");
        }
        if handle.join().is_err() {
            log::error!("persistence thread panicked");
        }
    }
}

impl Drop for PersistenceQueue {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run(gateway: Arc<dyn PersistenceGateway>, rx: Receiver<Job>) {
    log::debug!("persistence thread started");
    while let Ok(job) = rx.recv() {
        match job {
            Job::Save { dim, cells, reply } => {
                let outcome = save_batch(gateway.as_ref(), dim, cells);
                match reply {
                    Some(reply) => {
                        let _ = reply.send(outcome);
                    }
                    None => {
                        if let Some(err) = &outcome.first_error {
                            log::warn!(
                                "{} of {} saves failed in dimension {dim}: {err}",
                                outcome.failed,
                                outcome.failed + outcome.saved
                            );
                        }
                    }
                }
            }
            Job::Load { dim, coord, reply } => {
                let _ = reply.send(gateway.load_cell(dim, coord));
            }
            Job::Shutdown => break,
        }
    }
    log::debug!("persistence thread stopped");
}

fn save_batch(gateway: &dyn PersistenceGateway, dim: DimensionId, cells: Batch) -> SaveOutcome {
    let mut outcome = SaveOutcome::default();
    for (coord, cell) in cells {
        match gateway.save_cell(dim, coord, cell) {
            Ok(()) => outcome.saved += 1,
            Err(err) => {
                outcome.failed += 1;
                outcome.first_error.get_or_insert(err);
            }
        }
    }
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use aura_test_utils::{FailingGateway, MemoryGateway};

    fn cell(vis: f32) -> StoredCell {
        StoredCell {
            base: 100,
            vis,
            flux: 0.0,
        }
    }

    #[test]
    fn write_through_then_load_sees_saved_state() {
        let gateway = Arc::new(MemoryGateway::new());
        let queue = PersistenceQueue::start(gateway.clone(), 4).unwrap();
        let dim = DimensionId(0);
        let coord = CellCoord::new(1, 2);

        let outcome = queue.write_through(dim, vec![(coord, cell(42.0))]).unwrap();
        assert_eq!(outcome.saved, 1);
        assert_eq!(queue.load(dim, coord).unwrap(), Some(cell(42.0)));
        assert_eq!(queue.load(dim, CellCoord::new(9, 9)).unwrap(), None);
        queue.shutdown();
    }

    #[test]
    fn queued_save_lands_before_following_load() {
        let gateway = Arc::new(MemoryGateway::new());
        let queue = PersistenceQueue::start(gateway.clone(), 16).unwrap();
        let dim = DimensionId(3);
        let coord = CellCoord::new(0, 0);
        for i in 0..10 {
            queue.enqueue(dim, vec![(coord, cell(i as f32))]).unwrap();
        }
        assert_eq!(queue.load(dim, coord).unwrap(), Some(cell(9.0)));
        queue.shutdown();
    }

    #[test]
    fn failing_gateway_reports_errors() {
        let queue = PersistenceQueue::start(Arc::new(FailingGateway), 4).unwrap();
        let dim = DimensionId(0);
        let outcome = queue
            .write_through(
                dim,
                vec![(CellCoord::new(0, 0), cell(1.0)), (CellCoord::new(1, 0), cell(1.0))],
            )
            .unwrap();
        assert_eq!(outcome.saved, 0);
        assert_eq!(outcome.failed, 2);
        assert!(matches!(outcome.first_error, Some(PersistError::Io { .. })));
        assert!(queue.load(dim, CellCoord::new(0, 0)).is_err());
    }

    #[test]
    fn shutdown_drains_then_closes() {
        let gateway = Arc::new(MemoryGateway::new());
        let queue = PersistenceQueue::start(gateway.clone(), 8).unwrap();
        let dim = DimensionId(1);
        queue.enqueue(dim, vec![(CellCoord::new(5, 5), cell(7.0))]).unwrap();
        queue.shutdown();
        queue.shutdown();

        assert_eq!(gateway.get(dim, CellCoord::new(5, 5)), Some(cell(7.0)));
        assert_eq!(
            queue.load(dim, CellCoord::new(5, 5)),
            Err(PersistError::Closed)
        );
        let rejected = queue.enqueue(dim, vec![(CellCoord::new(6, 6), cell(1.0))]);
        assert_eq!(rejected.unwrap_err().len(), 1);
    }

    #[test]
    fn submitted_eviction_is_visible_to_reload() {
        let gateway = Arc::new(MemoryGateway::new());
        let queue = PersistenceQueue::start(gateway.clone(), 2).unwrap();
        let dim = DimensionId(0);
        let coord = CellCoord::new(-3, 8);
        queue.submit(dim, vec![(coord, cell(12.5))]).unwrap();
        assert_eq!(queue.load(dim, coord).unwrap(), Some(cell(12.5)));
    }

    #[test]
    fn queued_save_is_ordered_before_a_later_load() {
        let gateway = Arc::new(MemoryGateway::new());
        let queue = PersistenceQueue::start(gateway.clone(), 4).unwrap();
        let dim = DimensionId(2);
        let coord = CellCoord::new(4, -4);
        let pending = queue.queue_save(dim, vec![(coord, cell(3.5))]).unwrap();
        assert_eq!(queue.load(dim, coord).unwrap(), Some(cell(3.5)));
        assert_eq!(pending.wait().unwrap().saved, 1);
        assert_eq!(
            queue.queue_save(dim, Vec::new()).unwrap().wait().unwrap(),
            SaveOutcome::default()
        );
    }

    #[test]
    fn empty_batches_are_free() {
        let gateway = Arc::new(MemoryGateway::new());
        let queue = PersistenceQueue::start(gateway.clone(), 1).unwrap();
        assert!(queue.enqueue(DimensionId(0), Vec::new()).is_ok());
        assert_eq!(
            queue.write_through(DimensionId(0), Vec::new()).unwrap(),
            SaveOutcome::default()
        );
        assert_eq!(gateway.save_count(), 0);
    }
}
