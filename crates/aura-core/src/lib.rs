//! Core types and traits for the aura diffusion engine.
//!
//! This is the leaf crate with zero internal dependencies. It defines
//! the fundamental abstractions used throughout the workspace: cell and
//! dimension identifiers, the per-cell [`ResourceField`] record, error
//! types, and the collaborator traits the engine consumes.

#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]
#![forbid(unsafe_code)]

pub mod error;
pub mod field;
pub mod id;
pub mod traits;

pub use error::{CellFault, PersistError};
pub use field::{clamp_aura, ResourceField, StoredCell, AURA_LIMIT};
pub use id::{CellCoord, DimensionId, WorldPos, CELL_SIZE};
pub use traits::{EnvironmentSource, PersistenceGateway};
