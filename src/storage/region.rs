use super::DiskStore;
use crate::chunk::SerializedChunk;
use crate::error::StoreError;
use crate::prelude::*;
use flate2::read::{GzDecoder, ZlibDecoder};
use flate2::write::ZlibEncoder;
use std::fs;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

pub const SECTOR_BYTES: usize = 4096;
const CHUNKS: usize = 32 * 32;
// offsets table, then timestamps
const HEADER_SECTORS: usize = 2;
// chunk lengths are stored in a single byte of sectors
const MAX_SECTORS: usize = 255;

const GZIP: u8 = 1;
const ZLIB: u8 = 2;
const RAW: u8 = 3;

/// One `r.<x>.<z>.mca` file: 1024 chunk slots addressed by a sector table.
///
/// Each slot is `(first_sector << 8) | sector_count` in the first header
/// sector, with a write timestamp in the second. A chunk's payload is its
/// big-endian length (counting the compression byte), the compression
/// byte, then the compressed NBT.
pub struct RegionFile {
    region: (i32, i32),
    file: fs::File,
    offsets: Vec<u32>,
    used: Vec<bool>,
}

impl RegionFile {
    pub fn open(path: &Path, region: (i32, i32)) -> Result<Self, StoreError> {
        let mut file = fs::OpenOptions::new().read(true).write(true).create(true).open(path)?;
        let mut header = vec![0u8; HEADER_SECTORS * SECTOR_BYTES];
        let len = file.metadata()?.len() as usize;
        if len < header.len() {
            file.seek(SeekFrom::Start(0))?;
            file.write_all(&header)?;
        } else {
            file.seek(SeekFrom::Start(0))?;
            file.read_exact(&mut header)?;
        }
        let sectors = len.max(header.len()).div_ceil(SECTOR_BYTES);
        let mut used = vec![false; sectors];
        used[..HEADER_SECTORS].fill(true);
        let mut offsets = Vec::with_capacity(CHUNKS);
        for entry in header[..SECTOR_BYTES].chunks_exact(4) {
            let offset = u32::from_be_bytes([entry[0], entry[1], entry[2], entry[3]]);
            let (start, count) = split(offset);
            if offset != 0 && (start < HEADER_SECTORS || start + count > sectors) {
                log::warn!("region {region:?} has a chunk outside the file, ignoring it");
                offsets.push(0);
                continue;
            }
            used[start..start + count].fill(true);
            offsets.push(offset);
        }
        Ok(Self {
            region,
            file,
            offsets,
            used,
        })
    }

    fn malformed(&self, reason: impl Into<String>) -> StoreError {
        StoreError::Region {
            region: self.region,
            reason: reason.into(),
        }
    }

    /// Decompressed NBT of the chunk, if the slot is taken.
    pub fn read(&mut self, pos: ChunkPos) -> Result<Option<Vec<u8>>, StoreError> {
        let (start, count) = split(self.offsets[pos.region_index()]);
        if count == 0 {
            return Ok(None);
        }
        let mut sectors = vec![0; count * SECTOR_BYTES];
        self.file.seek(SeekFrom::Start((start * SECTOR_BYTES) as u64))?;
        self.file.read_exact(&mut sectors)?;
        let length = u32::from_be_bytes([sectors[0], sectors[1], sectors[2], sectors[3]]) as usize;
        if length == 0 || length + 4 > sectors.len() {
            return Err(self.malformed(format!("chunk {pos} claims {length} bytes in {count} sectors")));
        }
        let compressed = &sectors[5..4 + length];
        let mut nbt = vec![];
        match sectors[4] {
            GZIP => GzDecoder::new(compressed).read_to_end(&mut nbt)?,
            ZLIB => ZlibDecoder::new(compressed).read_to_end(&mut nbt)?,
            RAW => {
                nbt.extend_from_slice(compressed);
                nbt.len()
            }
            other => return Err(StoreError::Compression(other)),
        };
        Ok(Some(nbt))
    }

    pub fn write(&mut self, pos: ChunkPos, nbt: &[u8]) -> Result<(), StoreError> {
        let mut encoder = ZlibEncoder::new(Vec::with_capacity(nbt.len() / 2), flate2::Compression::default());
        encoder.write_all(nbt)?;
        let compressed = encoder.finish()?;

        let mut payload = Vec::with_capacity(compressed.len() + 5);
        payload.extend_from_slice(&(compressed.len() as u32 + 1).to_be_bytes());
        payload.push(ZLIB);
        payload.extend_from_slice(&compressed);
        let count = payload.len().div_ceil(SECTOR_BYTES);
        if count > MAX_SECTORS {
            return Err(StoreError::TooLarge(pos));
        }
        payload.resize(count * SECTOR_BYTES, 0);

        let index = pos.region_index();
        let (old_start, old_count) = split(self.offsets[index]);
        // the old copy stays readable until the header points past it
        let start = self.allocate(count);
        let offset = ((start as u32) << 8) | count as u32;
        if let Err(e) = self.place(index, start, offset, &payload) {
            self.used[start..start + count].fill(false);
            return Err(e);
        }
        self.offsets[index] = offset;
        self.used[old_start..old_start + old_count].fill(false);

        let timestamp = time::SystemTime::now()
            .duration_since(time::UNIX_EPOCH)
            .map_or(0, |since| since.as_secs() as u32);
        self.file.seek(SeekFrom::Start((SECTOR_BYTES + index * 4) as u64))?;
        self.file.write_all(&timestamp.to_be_bytes())?;
        Ok(())
    }

    /// Writes the sectors, then the header entry that points at them.
    fn place(
        &mut self,
        index: usize,
        start: usize,
        offset: u32,
        payload: &[u8],
    ) -> Result<(), StoreError> {
        self.file.seek(SeekFrom::Start((start * SECTOR_BYTES) as u64))?;
        self.file.write_all(payload)?;
        self.file.seek(SeekFrom::Start((index * 4) as u64))?;
        self.file.write_all(&offset.to_be_bytes())?;
        Ok(())
    }

    /// First run of `count` free sectors, growing the file if there is none.
    fn allocate(&mut self, count: usize) -> usize {
        let mut run = 0;
        for (sector, &used) in self.used.iter().enumerate() {
            run = if used { 0 } else { run + 1 };
            if run == count {
                let start = sector + 1 - count;
                self.used[start..=sector].fill(true);
                return start;
            }
        }
        // extend the trailing free run, if any
        let start = self.used.len() - run;
        self.used.resize(start + count, true);
        self.used[start..].fill(true);
        start
    }

    pub fn sync(&self) -> Result<(), StoreError> {
        self.file.sync_data()?;
        Ok(())
    }
}

fn split(offset: u32) -> (usize, usize) {
    ((offset >> 8) as usize, (offset & 0xFF) as usize)
}

/// A directory of region files, opened lazily and kept open.
pub struct RegionStore {
    dir: PathBuf,
    regions: Mutex<FxHashMap<(i32, i32), RegionFile>>,
}

impl RegionStore {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            regions: Mutex::new(FxHashMap::default()),
        })
    }
    pub fn dir(&self) -> &Path {
        &self.dir
    }
    fn path(&self, (x, z): (i32, i32)) -> PathBuf {
        self.dir.join(format!("r.{x}.{z}.mca"))
    }

    fn with_region<T>(
        &self,
        pos: ChunkPos,
        create: bool,
        f: impl FnOnce(&mut RegionFile) -> Result<T, StoreError>,
    ) -> Result<Option<T>, StoreError> {
        let region = pos.region();
        let mut regions = self.regions.lock();
        if !regions.contains_key(&region) {
            let path = self.path(region);
            if !create && !path.exists() {
                return Ok(None);
            }
            log::debug!("opening region file {}", path.display());
            regions.insert(region, RegionFile::open(&path, region)?);
        }
        match regions.get_mut(&region) {
            Some(file) => f(file).map(Some),
            None => Ok(None),
        }
    }
}

impl DiskStore for RegionStore {
    fn read(&self, pos: ChunkPos) -> Result<Option<SerializedChunk>, StoreError> {
        let Some(nbt) = self.with_region(pos, false, |file| file.read(pos))?.flatten() else {
            return Ok(None);
        };
        Ok(Some(fastnbt::from_bytes(&nbt)?))
    }
    fn write(&self, pos: ChunkPos, chunk: &SerializedChunk) -> Result<(), StoreError> {
        let nbt = fastnbt::to_bytes(chunk)?;
        self.with_region(pos, true, |file| file.write(pos, &nbt))?;
        Ok(())
    }
    fn flush(&self) -> Result<(), StoreError> {
        for file in self.regions.lock().values() {
            file.sync()?;
        }
        Ok(())
    }
}
