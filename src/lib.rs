mod collections;
pub mod types;
pub mod tracker;
pub mod ticket;
pub mod sorter;
pub mod chunk;
pub mod manager;
pub mod completion;
pub mod executor;
pub mod storage;
pub mod generator;
pub mod config;
pub mod error;
pub mod world;

pub use collections::SlotMap;
pub use config::ServerConfig;
pub use manager::ChunkManager;
pub use types::ChunkPos;
pub use world::World;

mod prelude {
    pub(crate) use crate::collections::*;
    pub(crate) use crate::types::*;
    pub(crate) use parking_lot::Mutex;
    pub(crate) use rustc_hash::{FxHashMap, FxHashSet};
    pub(crate) use std::sync::Arc;
    pub(crate) use std::{io, time};
}

/// Where does the tick thread stop and the pool start?
///
/// The tick thread owns every decision: which holders exist, what level they
/// sit at, when a chunk enters or leaves the world. The pool owns every cost:
/// reading, generating, lighting, writing. Nothing the pool does may change
/// a decision directly. It can only post a closure back.
///
/// That gives two rules that keep the rest honest
///   - a holder map is only touched from `&mut ChunkManager`
///   - a worker only ever sees the futures it was handed, never the map
///
/// What can go wrong between them?
///   - a chunk gets dropped while its generation is still queued.
///     the job runs anyway, finds its level no longer funds the status, and
///     the result is thrown away. wasteful, not wrong.
///   - a chunk gets dropped and then wanted again before its save lands.
///     the holder is still sitting in the unload table, so it is revived
///     instead of rebuilt, and the write that was in flight is ignored.
///   - the disk fills up.
///     writes fail, chunks stay unsaved and stay in memory. that can only go
///     on for so long, but losing the edits is worse than running out of room.
///
/// Priorities move every tick, since players move every tick. Letting every
/// producer lock every queue would make that a lock-ordering puzzle, so all
/// of it goes through one serial sorter instead.
///
/// Open question: should a world that cannot save stop accepting players?
/// For now it keeps running and logs every failed write.
struct Allocations;
