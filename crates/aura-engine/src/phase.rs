//! Cyclic phase modifiers.
//!
//! Each dimension carries a phase index in `0..8`. Once per pass the
//! index is turned into a [`PhaseModifiers`] triple through two fixed
//! lookup tables: the ceiling multiplier and the vis regeneration rate.
//! The flux rate is the complement `0.25 - vis_rate`.

/// Length of the phase cycle.
pub const PHASE_COUNT: usize = 8;

/// Sum of the vis and flux rates in every phase.
pub const PHASE_RATE_TOTAL: f32 = 0.25;

/// Lookup tables indexed by phase.
#[derive(Clone, Debug, PartialEq)]
pub struct PhaseTables {
    /// Ceiling multiplier per phase.
    pub max_ceiling: [f32; PHASE_COUNT],
    /// Vis regeneration per pass per phase.
    pub vis_regen: [f32; PHASE_COUNT],
}

impl Default for PhaseTables {
    fn default() -> Self {
        Self {
            max_ceiling: [1.0, 0.9, 0.85, 0.9, 1.05, 1.1, 1.15, 1.1],
            vis_regen: [0.25, 0.15, 0.1, 0.05, 0.0, 0.05, 0.1, 0.15],
        }
    }
}

impl PhaseTables {
    /// Tables that hold every phase at the same values.
    pub fn uniform(max_ceiling: f32, vis_regen: f32) -> Self {
        Self {
            max_ceiling: [max_ceiling; PHASE_COUNT],
            vis_regen: [vis_regen; PHASE_COUNT],
        }
    }

    /// Modifiers for a phase index. The index wraps modulo the cycle.
    pub fn modifiers(&self, phase: u8) -> PhaseModifiers {
        let i = phase as usize % PHASE_COUNT;
        let vis_rate = self.vis_regen[i];
        PhaseModifiers {
            max: self.max_ceiling[i],
            vis_rate,
            flux_rate: PHASE_RATE_TOTAL - vis_rate,
        }
    }
}

/// Per-pass scalars derived from the current phase.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PhaseModifiers {
    /// Ceiling multiplier (`phaseMax`).
    pub max: f32,
    /// Vis added per pass while below the ceiling.
    pub vis_rate: f32,
    /// Flux produced by conversion or stagnation.
    pub flux_rate: f32,
}
