//! The terrain generator and light engine the chunk manager calls into.
//!
//! Both are collaborators: the manager only decides when and where they run
//! and what they may see. What they actually compute is up to them.

use crate::chunk::{ChunkAccessor, ProtoChunk, BIOME_CELLS, COLUMNS};
use crate::prelude::*;

/// A chunk and its neighbour ring, handed to one generation step.
///
/// Chunks are stored the way a range future collects them, x-major, so the
/// centre sits in the middle.
pub struct WorldGenRegion {
    center: ChunkPos,
    radius: u32,
    chunks: Vec<ChunkAccessor>,
}

impl WorldGenRegion {
    /// `chunks` must be the full square of `radius` rings around `center`.
    pub fn new(center: ChunkPos, radius: u32, chunks: Vec<ChunkAccessor>) -> Self {
        debug_assert_eq!(chunks.len(), (2 * radius as usize + 1).pow(2));
        Self { center, radius, chunks }
    }
    pub fn center(&self) -> ChunkPos {
        self.center
    }
    pub fn radius(&self) -> u32 {
        self.radius
    }
    pub fn center_chunk(&self) -> &ChunkAccessor {
        &self.chunks[self.chunks.len() / 2]
    }
    pub fn get(&self, pos: ChunkPos) -> Option<&ChunkAccessor> {
        if self.center.chebyshev(pos) > self.radius {
            return None;
        }
        let r = self.radius as i32;
        let side = 2 * r + 1;
        let index = (pos.x - self.center.x + r) * side + (pos.z - self.center.z + r);
        self.chunks.get(index as usize)
    }
    pub fn chunks(&self) -> &[ChunkAccessor] {
        &self.chunks
    }
}

pub trait Generator: Send + Sync {
    fn name(&self) -> &str;
    /// Runs the step named `status` on the centre chunk of `region`.
    ///
    /// Neighbours are read-only. Errors and panics both become crash reports.
    fn generate(&self, status: &str, region: &WorldGenRegion) -> Result<(), String>;
}

pub trait LightEngine: Send + Sync {
    fn light(&self, chunk: &ProtoChunk) -> Result<(), String>;
}

/// Rolling hills of value noise. Enough terrain to give every step something
/// to write and every save something to carry.
#[derive(Debug, Clone)]
pub struct SimpleGenerator {
    seed: u64,
}

const SEA_LEVEL: i16 = 62;
// block ids written to the surface layer
const GRASS: u16 = 1;
const SAND: u16 = 2;
const STONE: u16 = 3;
// noise lattice spacing in blocks
const CELL: i32 = 8;

impl SimpleGenerator {
    pub fn new(seed: u64) -> Self {
        Self { seed }
    }

    fn hash(&self, x: i32, z: i32, salt: u64) -> u64 {
        let mut h = self.seed ^ salt.wrapping_mul(0x9E37_79B9_7F4A_7C15);
        h ^= (x as u32 as u64) << 32 | z as u32 as u64;
        // splitmix64 finaliser
        h = (h ^ (h >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
        h = (h ^ (h >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
        h ^ (h >> 31)
    }

    /// Height at a block column, interpolated between lattice points.
    pub fn height_at(&self, x: i32, z: i32) -> i16 {
        let (cx, cz) = (x.div_euclid(CELL), z.div_euclid(CELL));
        let (fx, fz) = (x.rem_euclid(CELL) as f64 / CELL as f64, z.rem_euclid(CELL) as f64 / CELL as f64);
        let corner = |dx, dz| (self.hash(cx + dx, cz + dz, 1) % 48) as f64;
        let top = corner(0, 0) * (1.0 - fx) + corner(1, 0) * fx;
        let bottom = corner(0, 1) * (1.0 - fx) + corner(1, 1) * fx;
        48 + (top * (1.0 - fz) + bottom * fz) as i16
    }

    fn biomes(&self, chunk: &ProtoChunk) {
        let pos = chunk.pos();
        let mut data = chunk.data_mut();
        for cell in 0..BIOME_CELLS {
            let (x, z) = ((cell % 4) as i32, (cell / 4) as i32);
            data.biomes[cell] = (self.hash(pos.x * 4 + x, pos.z * 4 + z, 2) % 8) as u8;
        }
    }

    fn noise(&self, chunk: &ProtoChunk) {
        let pos = chunk.pos();
        let mut data = chunk.data_mut();
        for column in 0..COLUMNS {
            let (x, z) = ((column % 16) as i32, (column / 16) as i32);
            data.heights[column] = self.height_at(pos.x * 16 + x, pos.z * 16 + z);
        }
    }

    fn surface(&self, chunk: &ProtoChunk) {
        let mut data = chunk.data_mut();
        for column in 0..COLUMNS {
            let height = data.heights[column];
            data.surface[column] = match height {
                h if h <= SEA_LEVEL + 1 => SAND,
                h if h > 88 => STONE,
                _ => GRASS,
            };
        }
    }

    /// Trees may not stand next to a taller neighbour chunk's border, which
    /// is why this step needs its ring.
    fn features(&self, region: &WorldGenRegion) -> Result<(), String> {
        let center = region.center_chunk();
        let pos = center.pos();
        let ceiling = region
            .chunks()
            .iter()
            .filter(|chunk| !chunk.same_chunk(center))
            .map(|chunk| chunk.data().heights.iter().copied().max().unwrap_or(0))
            .max()
            .unwrap_or(i16::MAX);
        let proto = center.proto();
        let mut data = proto.data_mut();
        let mut trees = 0;
        for column in 0..COLUMNS {
            let (x, z) = ((column % 16) as i32, (column / 16) as i32);
            let planted = self.hash(pos.x * 16 + x, pos.z * 16 + z, 3) % 61 == 0;
            if planted && data.surface[column] == GRASS && data.heights[column] < ceiling {
                trees += 1;
            }
        }
        data.features = trees;
        Ok(())
    }
}

impl Generator for SimpleGenerator {
    fn name(&self) -> &str {
        "simple"
    }
    fn generate(&self, status: &str, region: &WorldGenRegion) -> Result<(), String> {
        let chunk = region.center_chunk().proto();
        match status {
            "biomes" => self.biomes(chunk),
            "noise" => self.noise(chunk),
            "surface" => self.surface(chunk),
            "features" => return self.features(region),
            _ => {}
        }
        Ok(())
    }
}

/// Open sky lighting: full light on every column, dimmed where it sits in
/// a hollow below its neighbours.
#[derive(Debug, Clone, Copy, Default)]
pub struct SkyLight;

impl LightEngine for SkyLight {
    fn light(&self, chunk: &ProtoChunk) -> Result<(), String> {
        let mut data = chunk.data_mut();
        let heights = data.heights.clone();
        for column in 0..COLUMNS {
            let (x, z) = (column % 16, column / 16);
            let mut highest = heights[column];
            for (dx, dz) in [(-1, 0), (1, 0), (0, -1), (0, 1)] {
                let (nx, nz) = (x as i32 + dx, z as i32 + dz);
                if (0..16).contains(&nx) && (0..16).contains(&nz) {
                    highest = highest.max(heights[(nz * 16 + nx) as usize]);
                }
            }
            let depth = (highest - heights[column]).max(0) as u8;
            data.sky_light[column] = 15u8.saturating_sub(depth / 2);
        }
        data.lit = true;
        Ok(())
    }
}
