use super::{ChunkAccessor, ChunkData, ProtoChunk, StatusTable, BIOME_CELLS, COLUMNS};
use crate::prelude::*;
use fastnbt::ByteArray;
use serde::{Deserialize, Serialize};

pub const DATA_VERSION: i32 = 2730;

/// On-disk form of a chunk, written as NBT.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerializedChunk {
    #[serde(rename = "DataVersion")]
    pub data_version: i32,
    #[serde(rename = "xPos")]
    pub x: i32,
    #[serde(rename = "zPos")]
    pub z: i32,
    #[serde(rename = "Status")]
    pub status: String,
    #[serde(rename = "Biomes")]
    pub biomes: ByteArray,
    #[serde(rename = "Heights")]
    pub heights: Vec<i16>,
    #[serde(rename = "Surface")]
    pub surface: Vec<i16>,
    #[serde(rename = "SkyLight")]
    pub sky_light: ByteArray,
    #[serde(rename = "Features")]
    pub features: i32,
    #[serde(rename = "isLightOn")]
    pub lit: bool,
}

impl SerializedChunk {
    pub fn from_chunk(chunk: &ChunkAccessor, table: &StatusTable) -> Self {
        let pos = chunk.pos();
        let data = chunk.data();
        Self {
            data_version: DATA_VERSION,
            x: pos.x,
            z: pos.z,
            status: table.name(chunk.status()).to_owned(),
            biomes: ByteArray::new(data.biomes.iter().map(|&b| b as i8).collect()),
            heights: data.heights.clone(),
            surface: data.surface.iter().map(|&s| s as i16).collect(),
            sky_light: ByteArray::new(data.sky_light.iter().map(|&l| l as i8).collect()),
            features: data.features as i32,
            lit: data.lit,
        }
    }

    pub fn pos(&self) -> ChunkPos {
        ChunkPos::new(self.x, self.z)
    }

    /// Rebuilds the proto chunk, rejecting anything that does not fit the table or the column layout.
    pub fn into_proto(self, table: &StatusTable) -> Result<ProtoChunk, String> {
        let status = table
            .by_name(&self.status)
            .ok_or_else(|| format!("unknown status {:?}", self.status))?;
        let biomes = self.biomes.into_inner();
        let sky_light = self.sky_light.into_inner();
        check_len("Biomes", biomes.len(), BIOME_CELLS)?;
        check_len("Heights", self.heights.len(), COLUMNS)?;
        check_len("Surface", self.surface.len(), COLUMNS)?;
        check_len("SkyLight", sky_light.len(), COLUMNS)?;
        let data = ChunkData {
            biomes: biomes.into_iter().map(|b| b as u8).collect(),
            heights: self.heights,
            surface: self.surface.into_iter().map(|s| s as u16).collect(),
            sky_light: sky_light.into_iter().map(|l| l as u8).collect(),
            features: self.features.max(0) as u32,
            lit: self.lit,
        };
        Ok(ProtoChunk::with_data(ChunkPos::new(self.x, self.z), status, data))
    }
}

fn check_len(field: &str, len: usize, expected: usize) -> Result<(), String> {
    if len == expected {
        Ok(())
    } else {
        Err(format!("{field} has {len} entries, expected {expected}"))
    }
}
