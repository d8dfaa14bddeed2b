//! Where chunks go when they are not in memory.

mod region;

pub use region::{RegionFile, RegionStore, SECTOR_BYTES};

use crate::chunk::SerializedChunk;
use crate::error::StoreError;
use crate::prelude::*;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Synchronous chunk persistence. Only ever called from the loader queue.
pub trait DiskStore: Send + Sync {
    /// `Ok(None)` when nothing was ever written for `pos`.
    fn read(&self, pos: ChunkPos) -> Result<Option<SerializedChunk>, StoreError>;
    fn write(&self, pos: ChunkPos, chunk: &SerializedChunk) -> Result<(), StoreError>;
    fn flush(&self) -> Result<(), StoreError>;
}

/// Keeps every chunk in a map. Writes can be made to fail on demand.
#[derive(Default)]
pub struct MemoryStore {
    chunks: Mutex<FxHashMap<ChunkPos, SerializedChunk>>,
    writes: AtomicUsize,
    fail_writes: AtomicBool,
}
impl MemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::default()
    }
    pub fn insert(&self, chunk: SerializedChunk) {
        self.insert_at(chunk.pos(), chunk);
    }
    /// Files `chunk` under `pos`, whatever position it claims to be.
    pub fn insert_at(&self, pos: ChunkPos, chunk: SerializedChunk) {
        self.chunks.lock().insert(pos, chunk);
    }
    pub fn get(&self, pos: ChunkPos) -> Option<SerializedChunk> {
        self.chunks.lock().get(&pos).cloned()
    }
    pub fn len(&self) -> usize {
        self.chunks.lock().len()
    }
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
    /// Successful writes so far.
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::Acquire)
    }
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::Release);
    }
}
impl DiskStore for MemoryStore {
    fn read(&self, pos: ChunkPos) -> Result<Option<SerializedChunk>, StoreError> {
        Ok(self.get(pos))
    }
    fn write(&self, pos: ChunkPos, chunk: &SerializedChunk) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::Acquire) {
            return Err(StoreError::Io(io::Error::new(io::ErrorKind::Other, "disk full")));
        }
        self.chunks.lock().insert(pos, chunk.clone());
        self.writes.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }
    fn flush(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
