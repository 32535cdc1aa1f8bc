//! Strongly-typed identifiers for dimensions, cells, and world positions.

use std::fmt;

/// Edge length of one cell in world units.
///
/// One cell corresponds to one host-engine chunk column.
pub const CELL_SIZE: i32 = 16;

/// Identifies a dimension (an independent world with its own grid).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DimensionId(pub i32);

impl DimensionId {
    /// Mix the id into a 64-bit value suitable for seed derivation.
    ///
    /// SplitMix64 finaliser, so adjacent ids yield unrelated streams.
    pub fn seed_mix(self) -> u64 {
        let mut z = (self.0 as i64 as u64).wrapping_add(0x9E37_79B9_7F4A_7C15);
        z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
        z ^ (z >> 31)
    }
}

impl fmt::Display for DimensionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i32> for DimensionId {
    fn from(v: i32) -> Self {
        Self(v)
    }
}

/// A column position in world units.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorldPos {
    /// East-west world coordinate.
    pub x: i32,
    /// North-south world coordinate.
    pub z: i32,
}

impl WorldPos {
    /// Construct a world position.
    pub const fn new(x: i32, z: i32) -> Self {
        Self { x, z }
    }
}

impl fmt::Display for WorldPos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.x, self.z)
    }
}

/// Integer coordinate of one grid cell.
///
/// Ordering is lexicographic on `(x, z)`. The diffuser relies on this
/// total order to lock two cells without deadlocking.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CellCoord {
    /// Cell index along the x axis.
    pub x: i32,
    /// Cell index along the z axis.
    pub z: i32,
}

impl CellCoord {
    /// Construct a cell coordinate.
    pub const fn new(x: i32, z: i32) -> Self {
        Self { x, z }
    }

    /// The cell containing a world position.
    pub fn containing(pos: WorldPos) -> Self {
        Self {
            x: pos.x.div_euclid(CELL_SIZE),
            z: pos.z.div_euclid(CELL_SIZE),
        }
    }

    /// World position of the cell's center column.
    pub fn center(self) -> WorldPos {
        WorldPos {
            x: self.x * CELL_SIZE + CELL_SIZE / 2,
            z: self.z * CELL_SIZE + CELL_SIZE / 2,
        }
    }

    /// The four orthogonal neighbours in fixed order: +x, -x, +z, -z.
    pub fn neighbours(self) -> [CellCoord; 4] {
        [
            Self::new(self.x + 1, self.z),
            Self::new(self.x - 1, self.z),
            Self::new(self.x, self.z + 1),
            Self::new(self.x, self.z - 1),
        ]
    }
}

impl fmt::Display for CellCoord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.x, self.z)
    }
}
