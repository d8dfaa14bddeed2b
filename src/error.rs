use crate::prelude::*;
use core::fmt;

/// Why a status future could not produce a chunk.
///
/// Travels inside futures as a value; callers treat every variant as the
/// chunk being unloaded.
#[derive(Debug, Clone, thiserror::Error)]
pub enum LoadFailure {
    #[error("UNLOADED")]
    Unloaded,
    #[error("Unloaded {pos}")]
    UnloadedNeighbour { pos: ChunkPos },
    #[error("unreadable chunk data at {pos}: {reason}")]
    Corrupt { pos: ChunkPos, reason: String },
    #[error(transparent)]
    Generation(Arc<GenerationFailure>),
}

/// A generation step that blew up, with enough context to find the chunk again.
#[derive(Debug, thiserror::Error)]
#[error("{report}")]
pub struct GenerationFailure {
    pub pos: ChunkPos,
    pub report: CrashReport,
}

#[derive(Debug, Clone)]
pub struct CrashReport {
    pub title: String,
    pub cause: String,
    pub sections: Vec<(String, Vec<(String, String)>)>,
}
impl CrashReport {
    pub fn new(title: impl Into<String>, cause: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            cause: cause.into(),
            sections: vec![],
        }
    }
    pub fn section(mut self, name: &str, details: Vec<(&str, String)>) -> Self {
        let details = details.into_iter().map(|(k, v)| (k.to_owned(), v)).collect();
        self.sections.push((name.to_owned(), details));
        self
    }
}
impl fmt::Display for CrashReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "---- Crash Report ----")?;
        writeln!(f, "Description: {}", self.title)?;
        writeln!(f)?;
        writeln!(f, "{}", self.cause)?;
        for (name, details) in &self.sections {
            writeln!(f)?;
            writeln!(f, "-- {name} --")?;
            writeln!(f, "Details:")?;
            for (key, value) in details {
                writeln!(f, "\t{key}: {value}")?;
            }
        }
        Ok(())
    }
}

/// Failure inside a [`crate::storage::DiskStore`].
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("NBT error: {0}")]
    Nbt(#[from] fastnbt::error::Error),
    #[error("unsupported compression type {0}")]
    Compression(u8),
    #[error("malformed region {region:?}: {reason}")]
    Region { region: (i32, i32), reason: String },
    #[error("chunk at {0} is too large for a region file")]
    TooLarge(ChunkPos),
}

#[derive(Debug, thiserror::Error)]
#[error("failed to save chunk at {pos}: {source}")]
pub struct SaveFailure {
    pub pos: ChunkPos,
    #[source]
    pub source: StoreError,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] io::Error),
    #[error("failed to parse config: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid config value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

#[derive(Debug, thiserror::Error)]
pub enum StatusTableError {
    #[error("status table needs at least two statuses")]
    TooShort,
    #[error("status-by-range table must name known statuses, start at the last one and never increase")]
    RangeOrder,
}
