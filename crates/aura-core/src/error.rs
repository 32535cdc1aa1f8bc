//! Error types shared across the aura workspace.
//!
//! Organised by subsystem: persistence (gateway traffic) and per-cell
//! diffusion faults. Neither is ever surfaced to QueryAPI callers; the
//! engine logs and absorbs them.

use std::error::Error;
use std::fmt;

/// Errors reported by a [`PersistenceGateway`](crate::PersistenceGateway)
/// or by the engine's persistence queue.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PersistError {
    /// The backing store failed to read or write.
    Io {
        /// Human-readable description of the failure.
        reason: String,
    },
    /// Stored bytes could not be decoded into a cell triple.
    Malformed {
        /// Description of the decoding issue.
        reason: String,
    },
    /// The persistence queue has shut down.
    Closed,
}

impl fmt::Display for PersistError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io { reason } => write!(f, "persistence i/o failed: {reason}"),
            Self::Malformed { reason } => write!(f, "malformed cell state: {reason}"),
            Self::Closed => write!(f, "persistence queue closed"),
        }
    }
}

impl Error for PersistError {}

/// A fault raised while diffusing a single cell.
///
/// The pass skips the cell, logs the fault, and continues.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CellFault {
    /// An intermediate value was NaN or infinite; nothing was committed.
    NonFinite,
    /// The per-cell step panicked.
    Panicked {
        /// Panic payload, if it was a string.
        reason: String,
    },
}

impl fmt::Display for CellFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NonFinite => write!(f, "non-finite value in cell step"),
            Self::Panicked { reason } => write!(f, "cell step panicked: {reason}"),
        }
    }
}

impl Error for CellFault {}
