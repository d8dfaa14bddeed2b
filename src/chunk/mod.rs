mod accessor;
mod holder;
mod serial;
mod status;

pub use accessor::{ChunkAccessor, ChunkData, LevelChunk, ProtoChunk, BIOME_CELLS, COLUMNS};
pub use holder::{unloaded, ChunkFuture, ChunkHolder, ChunkResult, FullFuture, FullResult};
pub use serial::{SerializedChunk, DATA_VERSION};
pub use status::{ChunkStatus, FullChunkStatus, StatusDef, StatusTable, StatusTask, FULL_CHUNK_LEVEL};
