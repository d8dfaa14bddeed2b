//! The generation pipeline as data.
//!
//! A [`StatusTable`] lists the statuses in order, how far each one reaches
//! into its neighbours, and which ticket levels can afford it. It is built
//! once and shared; nothing here is global.

use crate::error::StatusTableError;

/// Ticket level at which a chunk becomes a full, border-accessible chunk.
pub const FULL_CHUNK_LEVEL: u32 = 33;

/// Position of a status inside its [`StatusTable`]. Later means further along.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChunkStatus(u8);

impl ChunkStatus {
    pub const EMPTY: ChunkStatus = ChunkStatus(0);

    pub fn index(self) -> usize {
        self.0 as usize
    }
    pub(crate) fn from_index(index: u8) -> Self {
        Self(index)
    }
}

/// What reaching a status involves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusTask {
    /// Nothing beyond recording the status.
    Passthrough,
    /// A step of the world generator.
    Generate,
    /// Runs the light engine on the light queue.
    Light,
    /// Promotes the proto chunk into a full chunk on the tick thread.
    Full,
}

#[derive(Debug, Clone)]
pub struct StatusDef {
    pub name: &'static str,
    /// Rings of neighbours that must be ready before this step runs.
    pub range: u32,
    pub task: StatusTask,
}
impl StatusDef {
    pub const fn new(name: &'static str, range: u32, task: StatusTask) -> Self {
        Self { name, range, task }
    }
}

/// How much of a full chunk's behaviour a ticket level buys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum FullChunkStatus {
    Inaccessible,
    Border,
    Ticking,
    EntityTicking,
}
impl FullChunkStatus {
    pub fn from_level(level: u32) -> Self {
        let rank = (FULL_CHUNK_LEVEL as i64 + 1 - level as i64).clamp(0, 3);
        [Self::Inaccessible, Self::Border, Self::Ticking, Self::EntityTicking][rank as usize]
    }
}

#[derive(Debug, Clone)]
pub struct StatusTable {
    defs: Vec<StatusDef>,
    // status required at each distance outside a full chunk
    by_range: Vec<ChunkStatus>,
    distance: Vec<u32>,
}

impl StatusTable {
    /// `defs` run from empty to full; each status's parent is the one before it.
    /// `by_range[d]` is the status a chunk needs when it sits `d` rings outside
    /// a full chunk.
    pub fn new(defs: Vec<StatusDef>, by_range: &[&str]) -> Result<Self, StatusTableError> {
        if defs.len() < 2 || defs.len() > u8::MAX as usize {
            return Err(StatusTableError::TooShort);
        }
        let by_range = by_range
            .iter()
            .map(|name| {
                defs.iter()
                    .position(|def| def.name == *name)
                    .map(|i| ChunkStatus(i as u8))
                    .ok_or(StatusTableError::RangeOrder)
            })
            .collect::<Result<Vec<_>, _>>()?;
        let last = ChunkStatus(defs.len() as u8 - 1);
        if by_range.first() != Some(&last) || by_range.windows(2).any(|w| w[1] > w[0]) {
            return Err(StatusTableError::RangeOrder);
        }

        let mut distance = vec![0; defs.len()];
        let mut d = 0;
        for index in (0..defs.len()).rev() {
            while d + 1 < by_range.len() && index <= by_range[d + 1].index() {
                d += 1;
            }
            distance[index] = d as u32;
        }

        Ok(Self { defs, by_range, distance })
    }

    pub fn vanilla() -> Self {
        use StatusTask::*;
        let defs = vec![
            StatusDef::new("empty", 0, Passthrough),
            StatusDef::new("structure_starts", 0, Generate),
            StatusDef::new("structure_references", 8, Generate),
            StatusDef::new("biomes", 0, Generate),
            StatusDef::new("noise", 8, Generate),
            StatusDef::new("surface", 0, Generate),
            StatusDef::new("carvers", 0, Generate),
            StatusDef::new("liquid_carvers", 0, Generate),
            StatusDef::new("features", 8, Generate),
            StatusDef::new("light", 1, Light),
            StatusDef::new("spawn", 0, Generate),
            StatusDef::new("heightmaps", 0, Generate),
            StatusDef::new("full", 0, Full),
        ];
        let mut by_range = vec!["full", "features", "liquid_carvers"];
        by_range.extend(["structure_starts"; 8]);
        Self::new(defs, &by_range).expect("vanilla status table is consistent")
    }

    pub fn len(&self) -> usize {
        self.defs.len()
    }
    pub fn is_empty(&self) -> bool {
        self.defs.is_empty()
    }
    pub fn statuses(&self) -> impl Iterator<Item = ChunkStatus> {
        (0..self.defs.len() as u8).map(ChunkStatus)
    }
    pub fn full(&self) -> ChunkStatus {
        ChunkStatus(self.defs.len() as u8 - 1)
    }
    pub fn by_name(&self, name: &str) -> Option<ChunkStatus> {
        self.defs.iter().position(|def| def.name == name).map(|i| ChunkStatus(i as u8))
    }
    pub fn name(&self, status: ChunkStatus) -> &'static str {
        self.defs[status.index()].name
    }
    pub fn range(&self, status: ChunkStatus) -> u32 {
        self.defs[status.index()].range
    }
    pub fn task(&self, status: ChunkStatus) -> StatusTask {
        self.defs[status.index()].task
    }
    pub fn parent(&self, status: ChunkStatus) -> ChunkStatus {
        ChunkStatus(status.0.saturating_sub(1))
    }
    /// Rings outside a full chunk at which this status is the best a chunk can get.
    pub fn distance(&self, status: ChunkStatus) -> u32 {
        self.distance[status.index()]
    }
    pub fn max_distance(&self) -> u32 {
        self.by_range.len() as u32
    }

    pub fn status_around_full(&self, distance: i64) -> ChunkStatus {
        if distance < 0 {
            self.full()
        } else if distance >= self.by_range.len() as i64 {
            ChunkStatus::EMPTY
        } else {
            self.by_range[distance as usize]
        }
    }

    /// Status the neighbours `ring` rings away need before `status` can be generated.
    pub fn dependency(&self, status: ChunkStatus, ring: u32) -> ChunkStatus {
        if ring == 0 {
            self.parent(status)
        } else {
            self.status_around_full(self.distance(status) as i64 + ring as i64)
        }
    }

    /// Highest ticket level that still keeps a holder around.
    pub fn max_chunk_distance(&self) -> u32 {
        FULL_CHUNK_LEVEL + self.max_distance()
    }
    pub fn status_for_level(&self, level: u32) -> ChunkStatus {
        if level < FULL_CHUNK_LEVEL {
            self.full()
        } else {
            self.status_around_full((level - FULL_CHUNK_LEVEL) as i64)
        }
    }
    /// Ticket level that makes `status` reachable.
    pub fn level_for_status(&self, status: ChunkStatus) -> u32 {
        FULL_CHUNK_LEVEL + self.distance(status)
    }
    /// Two levels inside full: enough for entity ticking at the centre.
    pub fn player_ticket_level(&self) -> u32 {
        FULL_CHUNK_LEVEL + self.distance(self.full()) - 2
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vanilla_distances() {
        let table = StatusTable::vanilla();
        let status = |name| table.by_name(name).unwrap();
        assert_eq!(table.max_distance(), 11);
        assert_eq!(table.max_chunk_distance(), 44);
        assert_eq!(table.player_ticket_level(), 31);
        assert_eq!(table.distance(table.full()), 0);
        assert_eq!(table.distance(status("light")), 0);
        assert_eq!(table.distance(status("features")), 1);
        assert_eq!(table.distance(status("liquid_carvers")), 2);
        assert_eq!(table.distance(status("noise")), 2);
        assert_eq!(table.distance(status("structure_starts")), 10);
        assert_eq!(table.distance(ChunkStatus::EMPTY), 10);
    }

    #[test]
    fn levels_map_to_statuses() {
        let table = StatusTable::vanilla();
        assert_eq!(table.status_for_level(0), table.full());
        assert_eq!(table.status_for_level(33), table.full());
        assert_eq!(table.status_for_level(34), table.by_name("features").unwrap());
        assert_eq!(table.status_for_level(44), ChunkStatus::EMPTY);
        assert_eq!(table.level_for_status(table.by_name("light").unwrap()), 33);
    }

    #[test]
    fn light_depends_on_features_around_it() {
        let table = StatusTable::vanilla();
        let light = table.by_name("light").unwrap();
        assert_eq!(table.dependency(light, 0), table.by_name("features").unwrap());
        assert_eq!(table.dependency(light, 1), table.by_name("features").unwrap());
        let features = table.by_name("features").unwrap();
        assert_eq!(table.dependency(features, 1), table.by_name("liquid_carvers").unwrap());
        assert_eq!(table.dependency(features, 2), table.by_name("structure_starts").unwrap());
    }

    #[test]
    fn full_status_thresholds() {
        assert_eq!(FullChunkStatus::from_level(31), FullChunkStatus::EntityTicking);
        assert_eq!(FullChunkStatus::from_level(32), FullChunkStatus::Ticking);
        assert_eq!(FullChunkStatus::from_level(33), FullChunkStatus::Border);
        assert_eq!(FullChunkStatus::from_level(34), FullChunkStatus::Inaccessible);
        assert_eq!(FullChunkStatus::from_level(0), FullChunkStatus::EntityTicking);
    }

    #[test]
    fn every_dependency_sits_below_its_status() {
        let table = StatusTable::vanilla();
        for status in table.statuses().skip(1) {
            for ring in 0..=table.range(status) {
                assert!(table.dependency(status, ring) < status);
            }
        }
    }

    #[test]
    fn range_table_must_start_at_full() {
        use StatusTask::*;
        let defs = vec![
            StatusDef::new("empty", 0, Passthrough),
            StatusDef::new("noise", 0, Generate),
            StatusDef::new("full", 0, Full),
        ];
        let err = StatusTable::new(defs.clone(), &["noise", "full"]).unwrap_err();
        assert!(matches!(err, StatusTableError::RangeOrder));
        assert!(StatusTable::new(defs, &["full", "noise"]).is_ok());
    }
}
