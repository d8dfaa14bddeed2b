use super::PlayerId;
use crate::prelude::*;
use crate::tracker::{ChunkTracker, LevelHooks};

/// Distance from every chunk to the nearest player, up to a fixed radius.
pub struct PlayerDistance {
    tracker: ChunkTracker,
    chunks: FxHashMap<u64, u8>,
    max_distance: u32,
}

struct DistanceHooks<'a> {
    players: &'a FxHashMap<u64, FxHashSet<PlayerId>>,
    chunks: &'a mut FxHashMap<u64, u8>,
    max_distance: u32,
    changed: Option<&'a mut FxHashSet<u64>>,
}
impl LevelHooks for DistanceHooks<'_> {
    fn level_from_source(&self, id: u64) -> u32 {
        match self.players.get(&id) {
            Some(players) if !players.is_empty() => 0,
            _ => u32::MAX,
        }
    }
    fn level(&self, id: u64) -> u32 {
        self.chunks.get(&id).map_or(self.max_distance + 1, |&l| l as u32)
    }
    fn set_level(&mut self, id: u64, level: u32) {
        if level > self.max_distance {
            self.chunks.remove(&id);
        } else {
            self.chunks.insert(id, level as u8);
        }
        if let Some(changed) = self.changed.as_deref_mut() {
            changed.insert(id);
        }
    }
}

impl PlayerDistance {
    pub fn new(max_distance: u32) -> Self {
        Self {
            tracker: ChunkTracker::new(max_distance + 2),
            chunks: FxHashMap::default(),
            max_distance,
        }
    }
    pub fn max_distance(&self) -> u32 {
        self.max_distance
    }
    /// Level for a chunk, `max_distance + 1` if no player is close enough.
    pub fn level(&self, pos: u64) -> u32 {
        self.chunks.get(&pos).map_or(self.max_distance + 1, |&l| l as u32)
    }
    pub fn contains(&self, pos: u64) -> bool {
        self.chunks.contains_key(&pos)
    }
    pub fn len(&self) -> usize {
        self.chunks.len()
    }
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }
    pub fn chunks(&self) -> impl Iterator<Item = (u64, u32)> + '_ {
        self.chunks.iter().map(|(&pos, &level)| (pos, level as u32))
    }

    /// A player arrived at (`decrease`) or the last one left `pos`.
    pub fn update(
        &mut self,
        players: &FxHashMap<u64, FxHashSet<PlayerId>>,
        pos: u64,
        decrease: bool,
    ) {
        let hooks = DistanceHooks {
            players,
            chunks: &mut self.chunks,
            max_distance: self.max_distance,
            changed: None,
        };
        let level = if decrease { 0 } else { u32::MAX };
        self.tracker.update(&hooks, pos, level, decrease);
    }

    /// Converges, recording every chunk whose level was written in `changed`.
    pub fn run_updates(
        &mut self,
        players: &FxHashMap<u64, FxHashSet<PlayerId>>,
        changed: Option<&mut FxHashSet<u64>>,
    ) {
        let mut hooks = DistanceHooks {
            players,
            chunks: &mut self.chunks,
            max_distance: self.max_distance,
            changed,
        };
        self.tracker.run_updates(&mut hooks, usize::MAX);
    }
}

/// The view-distance tracker behind player tickets.
///
/// A chunk is in view when its distance is at most `view_distance - 2`.
/// Crossing that line either way is turned into throttled grant or release
/// messages by the [`super::TicketManager`].
pub struct PlayerTickets {
    pub(super) distance: PlayerDistance,
    pub(super) view_distance: u32,
    pub(super) to_update: FxHashSet<u64>,
    // level each chunk is filed under in the throttler, written by the sorter
    pub(super) queue_levels: Arc<Mutex<FxHashMap<u64, u32>>>,
}

impl PlayerTickets {
    pub fn new(max_distance: u32, view_distance: u32) -> Self {
        Self {
            distance: PlayerDistance::new(max_distance),
            view_distance,
            to_update: FxHashSet::default(),
            queue_levels: Arc::default(),
        }
    }
    pub fn view_distance(&self) -> u32 {
        self.view_distance
    }
    pub fn have_ticket_for(&self, level: u32) -> bool {
        level + 2 <= self.view_distance
    }
    pub fn level(&self, pos: u64) -> u32 {
        self.distance.level(pos)
    }
    pub(super) fn queue_level(&self, pos: u64) -> u32 {
        let default = self.distance.max_distance() + 2;
        self.queue_levels.lock().get(&pos).copied().unwrap_or(default)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn players_at(positions: &[ChunkPos]) -> FxHashMap<u64, FxHashSet<PlayerId>> {
        let mut players = FxHashMap::default();
        for (id, pos) in positions.iter().enumerate() {
            players.entry(pos.to_long()).or_insert_with(FxHashSet::default).insert(id);
        }
        players
    }

    #[test]
    fn distance_is_capped_at_the_radius() {
        let mut tracker = PlayerDistance::new(8);
        let players = players_at(&[ChunkPos::new(0, 0)]);
        tracker.update(&players, ChunkPos::new(0, 0).to_long(), true);
        tracker.run_updates(&players, None);
        assert_eq!(tracker.level(ChunkPos::new(3, -8).to_long()), 8);
        assert!(!tracker.contains(ChunkPos::new(9, 0).to_long()));
        assert_eq!(tracker.len(), 17 * 17);
    }

    #[test]
    fn leaving_clears_and_reports_changes() {
        let mut tracker = PlayerDistance::new(2);
        let mut players = players_at(&[ChunkPos::new(0, 0)]);
        let origin = ChunkPos::new(0, 0).to_long();
        tracker.update(&players, origin, true);
        tracker.run_updates(&players, None);

        players.clear();
        tracker.update(&players, origin, false);
        let mut changed = FxHashSet::default();
        tracker.run_updates(&players, Some(&mut changed));
        assert!(tracker.is_empty());
        assert_eq!(changed.len(), 25);
    }

    #[test]
    fn view_distance_threshold() {
        let tickets = PlayerTickets::new(31, 10);
        assert!(tickets.have_ticket_for(8));
        assert!(!tickets.have_ticket_for(9));
        assert_eq!(tickets.queue_level(ChunkPos::new(4, 4).to_long()), 33);
    }
}
