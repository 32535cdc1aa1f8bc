//! Engine configuration, validation, and error types.
//!
//! [`EngineConfig`] is the input for constructing an
//! [`AuraEngine`](crate::engine::AuraEngine).
//! [`validate()`](EngineConfig::validate) checks every structural
//! invariant at startup so the pass loop never has to.

use std::error::Error;
use std::fmt;
use std::time::Duration;

use crate::phase::{PhaseTables, PHASE_COUNT};

// ── EngineConfig ───────────────────────────────────────────────────

/// Complete configuration for an aura engine.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Time between two passes over one dimension. Default: 1 s.
    pub cadence: Duration,
    /// Root seed. Diffuser streams and generation jitter derive from it.
    pub seed: u64,
    /// Phase lookup tables.
    pub phases: PhaseTables,
    /// Rift chance is `flux / rift_divisor` once flux passes 75% of the
    /// ceiling. Default: 5000.
    pub rift_divisor: f32,
    /// Capacity of a fully fertile cell. Default: 500.
    pub ceiling: u16,
    /// Relative amplitude of generation noise. Default: 0.1.
    pub generation_jitter: f32,
    /// Dirty cells are handed to the persistence queue every N passes.
    /// Default: 20.
    pub flush_every_passes: u32,
    /// Bounded capacity of the persistence job queue. Default: 256.
    pub persist_queue_capacity: usize,
    /// Upper bound on waiting for a worker to stop. Default: 2 s.
    pub stop_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cadence: Duration::from_secs(1),
            seed: 0,
            phases: PhaseTables::default(),
            rift_divisor: 5000.0,
            ceiling: 500,
            generation_jitter: 0.1,
            flush_every_passes: 20,
            persist_queue_capacity: 256,
            stop_timeout: Duration::from_secs(2),
        }
    }
}

impl EngineConfig {
    /// Validate all structural invariants.
    pub fn validate(&self) -> Result<(), ConfigError> {
        // 1. Cadence must be non-zero.
        if self.cadence.is_zero() {
            return Err(ConfigError::ZeroCadence);
        }
        // 2. Phase tables: finite, positive ceilings, regen within the
        //    flux complement so phaseFluxRate never goes negative.
        for i in 0..PHASE_COUNT {
            let max = self.phases.max_ceiling[i];
            if !max.is_finite() || max <= 0.0 {
                return Err(ConfigError::InvalidPhaseTable {
                    reason: format!("max_ceiling[{i}] must be finite and > 0, got {max}"),
                });
            }
            let regen = self.phases.vis_regen[i];
            if !regen.is_finite() || !(0.0..=0.25).contains(&regen) {
                return Err(ConfigError::InvalidPhaseTable {
                    reason: format!("vis_regen[{i}] must be in [0, 0.25], got {regen}"),
                });
            }
        }
        // 3. Rift divisor.
        if !self.rift_divisor.is_finite() || self.rift_divisor < 1.0 {
            return Err(ConfigError::InvalidRiftDivisor {
                value: self.rift_divisor,
            });
        }
        // 4. Generation.
        if self.ceiling == 0 {
            return Err(ConfigError::ZeroCeiling);
        }
        if !self.generation_jitter.is_finite() || !(0.0..=1.0).contains(&self.generation_jitter) {
            return Err(ConfigError::InvalidJitter {
                value: self.generation_jitter,
            });
        }
        // 5. Persistence.
        if self.flush_every_passes == 0 {
            return Err(ConfigError::ZeroFlushInterval);
        }
        if self.persist_queue_capacity == 0 {
            return Err(ConfigError::ZeroQueueCapacity);
        }
        Ok(())
    }
}

// ── ConfigError ────────────────────────────────────────────────────

/// Errors detected during [`EngineConfig::validate()`].
#[derive(Clone, Debug, PartialEq)]
pub enum ConfigError {
    /// `cadence` is zero.
    ZeroCadence,
    /// A phase table entry is out of range.
    InvalidPhaseTable {
        /// Which entry failed and why.
        reason: String,
    },
    /// `rift_divisor` is NaN, infinite, or below 1.
    InvalidRiftDivisor {
        /// The invalid value.
        value: f32,
    },
    /// `ceiling` is zero.
    ZeroCeiling,
    /// `generation_jitter` is outside `[0, 1]`.
    InvalidJitter {
        /// The invalid value.
        value: f32,
    },
    /// `flush_every_passes` is zero.
    ZeroFlushInterval,
    /// `persist_queue_capacity` is zero.
    ZeroQueueCapacity,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ZeroCadence => write!(f, "cadence must be non-zero"),
            Self::InvalidPhaseTable { reason } => write!(f, "invalid phase table: {reason}"),
            Self::InvalidRiftDivisor { value } => {
                write!(f, "rift_divisor must be finite and >= 1, got {value}")
            }
            Self::ZeroCeiling => write!(f, "ceiling must be at least 1"),
            Self::InvalidJitter { value } => {
                write!(f, "generation_jitter must be in [0, 1], got {value}")
            }
            Self::ZeroFlushInterval => write!(f, "flush_every_passes must be at least 1"),
            Self::ZeroQueueCapacity => write!(f, "persist_queue_capacity must be at least 1"),
        }
    }
}

impl Error for ConfigError {}
