//! Aura: a concurrent two-resource diffusion field over sparse cell grids.
//!
//! This is the top-level facade crate that re-exports the public API from
//! the aura sub-crates.
//!
//! # Quick start
//!
//! ```rust
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use aura::prelude::*;
//!
//! struct Meadow;
//! impl EnvironmentSource for Meadow {
//!     fn fertility_at(&self, _dim: DimensionId, _pos: WorldPos) -> f32 {
//!         0.5
//!     }
//! }
//!
//! struct Forgetful;
//! impl PersistenceGateway for Forgetful {
//!     fn load_cell(&self, _: DimensionId, _: CellCoord) -> Result<Option<StoredCell>, PersistError> {
//!         Ok(None)
//!     }
//!     fn save_cell(&self, _: DimensionId, _: CellCoord, _: StoredCell) -> Result<(), PersistError> {
//!         Ok(())
//!     }
//! }
//!
//! let config = EngineConfig {
//!     cadence: Duration::from_secs(60),
//!     generation_jitter: 0.0,
//!     ..EngineConfig::default()
//! };
//! let engine = AuraEngine::new(config, Arc::new(Forgetful), Arc::new(Meadow)).unwrap();
//!
//! let dim = DimensionId(0);
//! let cell = CellCoord::containing(WorldPos::new(100, -40));
//! engine.load_cell(dim, cell).unwrap();
//! assert_eq!(engine.get_aura_base(dim, cell), 250);
//!
//! assert_eq!(engine.peek_drain_vis(dim, cell, 10.0), 10.0);
//! assert_eq!(engine.drain_vis(dim, cell, 10.0), 10.0);
//! assert_eq!(engine.get_vis(dim, cell), 240.0);
//! engine.shutdown().unwrap();
//! ```
//!
//! # Modules
//!
//! | Module | Sub-crate | Contents |
//! |--------|-----------|----------|
//! | [`types`] | `aura-core` | IDs, `ResourceField`, errors, collaborator traits |
//! | [`engine`] | `aura-engine` | Grid, diffuser, phases, workers, `AuraEngine` |

#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]
#![forbid(unsafe_code)]

/// Core types, traits, and IDs (`aura-core`).
///
/// Contains [`types::ResourceField`], the coordinate types, and the
/// collaborator traits [`types::PersistenceGateway`] and
/// [`types::EnvironmentSource`].
pub use aura_core as types;

/// The simulation engine (`aura-engine`).
///
/// [`engine::AuraEngine`] is the query and lifecycle surface;
/// [`engine::Diffuser`] and [`engine::FieldGrid`] are usable on their own
/// for offline runs.
pub use aura_engine as engine;

/// Common imports for typical aura usage.
pub mod prelude {
    // Core types and traits
    pub use aura_core::{
        CellCoord, DimensionId, EnvironmentSource, PersistenceGateway, ResourceField, StoredCell,
        WorldPos,
    };

    // Errors
    pub use aura_core::{CellFault, PersistError};

    // Engine
    pub use aura_engine::{
        AuraEngine, ConfigError, DimensionSummary, EngineConfig, EngineError, PassReport,
        PhaseTables,
    };
}
