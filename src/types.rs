use core::fmt;

/// Column coordinates of a 16x16 chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct ChunkPos {
    pub x: i32,
    pub z: i32,
}

/// Graph node id of the synthetic source in the distance trackers.
///
/// Sits far outside the world border, so no real chunk ever packs to it.
pub const SOURCE: u64 = ChunkPos::new(1875066, 1875066).to_long();

impl ChunkPos {
    pub const fn new(x: i32, z: i32) -> Self {
        Self { x, z }
    }
    pub const fn to_long(self) -> u64 {
        (self.x as u32 as u64) | ((self.z as u32 as u64) << 32)
    }
    pub const fn from_long(id: u64) -> Self {
        Self {
            x: id as u32 as i32,
            z: (id >> 32) as u32 as i32,
        }
    }
    pub fn from_block(x: f64, z: f64) -> Self {
        Self::new((x / 16.0).floor() as i32, (z / 16.0).floor() as i32)
    }
    pub fn offset(self, dx: i32, dz: i32) -> Self {
        Self::new(self.x + dx, self.z + dz)
    }
    /// Chessboard distance, the metric every level in the engine is measured in.
    pub fn chebyshev(self, other: ChunkPos) -> u32 {
        (self.x - other.x).unsigned_abs().max((self.z - other.z).unsigned_abs())
    }
    pub fn region(self) -> (i32, i32) {
        (self.x >> 5, self.z >> 5)
    }
    /// Index of this chunk inside its 32x32 region.
    pub fn region_index(self) -> usize {
        ((self.x & 31) + (self.z & 31) * 32) as usize
    }
    /// Every position within `radius` rings, row by row from the lowest x.
    pub fn square(self, radius: i32) -> impl Iterator<Item = ChunkPos> {
        (-radius..=radius).flat_map(move |dx| (-radius..=radius).map(move |dz| self.offset(dx, dz)))
    }
}

impl fmt::Display for ChunkPos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.x, self.z)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packing_keeps_negative_coordinates() {
        for pos in [ChunkPos::new(0, 0), ChunkPos::new(-1, 5), ChunkPos::new(i32::MIN, i32::MAX)] {
            assert_eq!(ChunkPos::from_long(pos.to_long()), pos);
        }
        assert_ne!(ChunkPos::new(-1, 0).to_long(), ChunkPos::new(0, -1).to_long());
    }

    #[test]
    fn block_coordinates_round_down() {
        assert_eq!(ChunkPos::from_block(-0.5, 15.9), ChunkPos::new(-1, 0));
        assert_eq!(ChunkPos::from_block(32.0, -16.0), ChunkPos::new(2, -1));
    }

    #[test]
    fn regions_cover_negative_chunks() {
        let pos = ChunkPos::new(-1, 33);
        assert_eq!(pos.region(), (-1, 1));
        assert_eq!(pos.region_index(), 31 + 32);
    }
}
