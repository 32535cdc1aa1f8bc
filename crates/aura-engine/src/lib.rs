//! Aura diffusion engine.
//!
//! Simulates a two-resource field (`vis` and `flux`) over the sparse
//! cell grid of each active dimension. A dedicated worker per dimension
//! runs one [`Diffuser`] pass per cadence while gameplay threads read
//! and mutate cells through [`AuraEngine`]. Cells are loaded from, or
//! generated in the absence of, a [`PersistenceGateway`] and flushed
//! back through a single persistence thread.
//!
//! [`PersistenceGateway`]: aura_core::PersistenceGateway

#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]
#![forbid(unsafe_code)]

pub mod config;
pub mod diffuser;
pub mod engine;
pub mod generation;
pub mod grid;
pub mod persist;
pub mod phase;
pub mod registry;
pub(crate) mod scheduler;

pub use config::{ConfigError, EngineConfig};
pub use diffuser::{CellStep, Diffuser, PassReport, Regrowth, MAX_TRANSFER};
pub use engine::{AuraEngine, DimensionSummary, EngineError};
pub use generation::Generator;
pub use grid::{CellSlot, FieldGrid, GridSummary};
pub use persist::{PersistenceQueue, SaveOutcome};
pub use phase::{PhaseModifiers, PhaseTables, PHASE_COUNT, PHASE_RATE_TOTAL};
pub use registry::{DimensionState, SimulationRegistry};
