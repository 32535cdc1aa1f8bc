//! The per-cell resource record and its persisted form.
//!
//! A [`ResourceField`] holds a fixed capacity (`base`), the renewable
//! resource (`vis`), and its pollutant by-product (`flux`). Every mutator
//! re-establishes the invariant `0 <= vis, flux <= AURA_LIMIT` and sets
//! the field's own dirty flag, so a field can never be observed out of
//! range and the persistence layer never needs a back-reference to the
//! host chunk to know whether it changed.

/// Upper bound for `vis` and `flux`.
pub const AURA_LIMIT: f32 = 32766.0;

/// Clamp a value into `[0, AURA_LIMIT]`. NaN maps to zero.
pub fn clamp_aura(v: f32) -> f32 {
    if v.is_nan() {
        0.0
    } else {
        v.clamp(0.0, AURA_LIMIT)
    }
}

/// The persisted triple for one cell.
///
/// Matches the gateway wire shape: one `u16` and two `f32`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct StoredCell {
    /// Fixed capacity assigned at generation.
    pub base: u16,
    /// Stored vis.
    pub vis: f32,
    /// Stored flux.
    pub flux: f32,
}

impl StoredCell {
    /// Whether the triple can be loaded as-is.
    ///
    /// Non-finite or negative values mark the state as malformed; the
    /// engine regenerates such cells instead of loading them.
    pub fn is_well_formed(&self) -> bool {
        self.vis.is_finite() && self.flux.is_finite() && self.vis >= 0.0 && self.flux >= 0.0
    }
}

/// Live resource state of one cell.
#[derive(Clone, Debug, PartialEq)]
pub struct ResourceField {
    base: u16,
    vis: f32,
    flux: f32,
    dirty: bool,
}

impl ResourceField {
    /// Create a clean (not dirty) field, clamping both values.
    pub fn new(base: u16, vis: f32, flux: f32) -> Self {
        Self {
            base,
            vis: clamp_aura(vis),
            flux: clamp_aura(flux),
            dirty: false,
        }
    }

    /// A freshly generated field: `vis = base`, `flux = 0`, already dirty.
    pub fn generated(base: u16) -> Self {
        Self {
            base,
            vis: clamp_aura(base as f32),
            flux: 0.0,
            dirty: true,
        }
    }

    /// Restore a field from its persisted form. Clean on return.
    pub fn from_stored(stored: StoredCell) -> Self {
        Self::new(stored.base, stored.vis, stored.flux)
    }

    /// The persisted form of this field.
    pub fn to_stored(&self) -> StoredCell {
        StoredCell {
            base: self.base,
            vis: self.vis,
            flux: self.flux,
        }
    }

    /// Fixed capacity.
    pub fn base(&self) -> u16 {
        self.base
    }

    /// Current vis.
    pub fn vis(&self) -> f32 {
        self.vis
    }

    /// Current flux.
    pub fn flux(&self) -> f32 {
        self.flux
    }

    /// `vis + flux`.
    pub fn total(&self) -> f32 {
        self.vis + self.flux
    }

    /// Whether the field changed since it was last persisted.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Flag the field as changed.
    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    /// Clear the dirty flag, returning its previous value.
    pub fn take_dirty(&mut self) -> bool {
        std::mem::replace(&mut self.dirty, false)
    }

    /// Overwrite vis (clamped). Marks dirty.
    pub fn set_vis(&mut self, vis: f32) {
        self.vis = clamp_aura(vis);
        self.dirty = true;
    }

    /// Overwrite flux (clamped). Marks dirty.
    pub fn set_flux(&mut self, flux: f32) {
        self.flux = clamp_aura(flux);
        self.dirty = true;
    }

    /// Add vis, clamping at the limit.
    ///
    /// Returns `false` without touching the field when `amount` is not a
    /// positive finite number.
    pub fn add_vis(&mut self, amount: f32) -> bool {
        if !is_positive(amount) {
            return false;
        }
        self.set_vis(self.vis + amount);
        true
    }

    /// Add flux, clamping at the limit. Same contract as [`add_vis`](Self::add_vis).
    pub fn add_flux(&mut self, amount: f32) -> bool {
        if !is_positive(amount) {
            return false;
        }
        self.set_flux(self.flux + amount);
        true
    }

    /// How much vis a drain of `amount` would remove, without removing it.
    pub fn available_vis(&self, amount: f32) -> f32 {
        available(self.vis, amount)
    }

    /// How much flux a drain of `amount` would remove, without removing it.
    pub fn available_flux(&self, amount: f32) -> f32 {
        available(self.flux, amount)
    }

    /// Remove up to `amount` vis and return what was removed.
    pub fn drain_vis(&mut self, amount: f32) -> f32 {
        let actual = self.available_vis(amount);
        if actual > 0.0 {
            self.set_vis(self.vis - actual);
        }
        actual
    }

    /// Remove up to `amount` flux and return what was removed.
    pub fn drain_flux(&mut self, amount: f32) -> f32 {
        let actual = self.available_flux(amount);
        if actual > 0.0 {
            self.set_flux(self.flux - actual);
        }
        actual
    }

    /// Whether gameplay should leave this cell's vis alone.
    ///
    /// True when `vis / base < 0.1` and the caller holds no override
    /// privilege. A zero-capacity cell never asks for preservation.
    pub fn should_preserve(&self, has_privilege: bool) -> bool {
        if has_privilege || self.base == 0 {
            return false;
        }
        self.vis / f32::from(self.base) < 0.1
    }

    /// Whether both values are finite.
    pub fn is_finite(&self) -> bool {
        self.vis.is_finite() && self.flux.is_finite()
    }
}

fn is_positive(amount: f32) -> bool {
    amount.is_finite() && amount > 0.0
}

fn available(stored: f32, amount: f32) -> f32 {
    if !is_positive(amount) {
        return 0.0;
    }
    amount.min(stored).max(0.0)
}
