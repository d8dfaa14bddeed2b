use super::ChunkStatus;
use crate::prelude::*;
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

pub const BIOME_CELLS: usize = 4 * 4;
pub const COLUMNS: usize = 16 * 16;

/// Column data of one chunk. Indices are `z * 16 + x` (biomes: `z * 4 + x` over 4x4 cells).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkData {
    pub biomes: Vec<u8>,
    pub heights: Vec<i16>,
    pub surface: Vec<u16>,
    pub sky_light: Vec<u8>,
    pub features: u32,
    pub lit: bool,
}
impl Default for ChunkData {
    fn default() -> Self {
        Self {
            biomes: vec![0; BIOME_CELLS],
            heights: vec![0; COLUMNS],
            surface: vec![0; COLUMNS],
            sky_light: vec![0; COLUMNS],
            features: 0,
            lit: false,
        }
    }
}

/// A chunk still moving through generation. Mutated in place by the worker
/// that owns its current step.
#[derive(Debug)]
pub struct ProtoChunk {
    pos: ChunkPos,
    status: AtomicU8,
    unsaved: AtomicBool,
    data: RwLock<ChunkData>,
}
impl ProtoChunk {
    pub fn new(pos: ChunkPos) -> Self {
        Self::with_data(pos, ChunkStatus::EMPTY, ChunkData::default())
    }
    pub fn with_data(pos: ChunkPos, status: ChunkStatus, data: ChunkData) -> Self {
        Self {
            pos,
            status: AtomicU8::new(status.index() as u8),
            unsaved: AtomicBool::new(false),
            data: RwLock::new(data),
        }
    }
    pub fn pos(&self) -> ChunkPos {
        self.pos
    }
    pub fn status(&self) -> ChunkStatus {
        ChunkStatus::from_index(self.status.load(Ordering::Acquire))
    }
    /// Moves the status forward; never back.
    pub fn advance(&self, status: ChunkStatus) {
        self.status.fetch_max(status.index() as u8, Ordering::AcqRel);
    }
    pub fn is_unsaved(&self) -> bool {
        self.unsaved.load(Ordering::Acquire)
    }
    pub fn set_unsaved(&self, unsaved: bool) {
        self.unsaved.store(unsaved, Ordering::Release);
    }
    pub fn data(&self) -> RwLockReadGuard<'_, ChunkData> {
        self.data.read()
    }
    pub fn data_mut(&self) -> RwLockWriteGuard<'_, ChunkData> {
        self.data.write()
    }
}

/// A chunk that made it to full. Wraps the proto chunk it grew out of.
#[derive(Debug)]
pub struct LevelChunk {
    proto: Arc<ProtoChunk>,
    loaded: AtomicBool,
}
impl LevelChunk {
    pub fn wrap(proto: Arc<ProtoChunk>, full: ChunkStatus) -> Self {
        proto.advance(full);
        Self {
            proto,
            loaded: AtomicBool::new(false),
        }
    }
    pub fn pos(&self) -> ChunkPos {
        self.proto.pos()
    }
    pub fn proto(&self) -> &Arc<ProtoChunk> {
        &self.proto
    }
    /// Whether the chunk is currently part of the live world.
    pub fn is_loaded(&self) -> bool {
        self.loaded.load(Ordering::Acquire)
    }
    pub fn set_loaded(&self, loaded: bool) {
        self.loaded.store(loaded, Ordering::Release);
    }
}

#[derive(Debug, Clone)]
pub enum ChunkAccessor {
    Proto(Arc<ProtoChunk>),
    Full(Arc<LevelChunk>),
}
impl ChunkAccessor {
    pub fn proto(&self) -> &Arc<ProtoChunk> {
        match self {
            ChunkAccessor::Proto(proto) => proto,
            ChunkAccessor::Full(full) => full.proto(),
        }
    }
    pub fn pos(&self) -> ChunkPos {
        self.proto().pos()
    }
    pub fn status(&self) -> ChunkStatus {
        self.proto().status()
    }
    pub fn is_unsaved(&self) -> bool {
        self.proto().is_unsaved()
    }
    pub fn set_unsaved(&self, unsaved: bool) {
        self.proto().set_unsaved(unsaved)
    }
    pub fn as_full(&self) -> Option<&Arc<LevelChunk>> {
        match self {
            ChunkAccessor::Full(full) => Some(full),
            ChunkAccessor::Proto(_) => None,
        }
    }
    pub fn data(&self) -> RwLockReadGuard<'_, ChunkData> {
        self.proto().data()
    }
    /// Same underlying chunk, whichever form either side is in.
    pub fn same_chunk(&self, other: &ChunkAccessor) -> bool {
        Arc::ptr_eq(self.proto(), other.proto())
    }
}
