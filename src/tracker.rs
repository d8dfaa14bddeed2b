//! Incremental shortest-distance propagation over the chunk grid.
//!
//! Every chunk is a node joined to its eight neighbours by edges of weight
//! one, plus a synthetic [`SOURCE`] node whose edge weight to each chunk is
//! whatever the owner says it is (a ticket level, zero for a player, ...).
//! The tracker keeps the minimal fixed point of those distances up to date
//! with a bucket queue, one bucket per level, touching only the nodes a
//! change can actually reach.

use crate::prelude::*;

/// Connects a [`ChunkTracker`] to whatever stores the resolved levels.
pub trait LevelHooks {
    /// Level the source hands to `id` directly, `u32::MAX` when there is none.
    fn level_from_source(&self, id: u64) -> u32;
    fn level(&self, id: u64) -> u32;
    fn set_level(&mut self, id: u64, level: u32);
}

pub struct ChunkTracker {
    level_count: u32,
    queues: Vec<FxHashSet<u64>>,
    // pending level of every queued node
    computed: FxHashMap<u64, u8>,
    first_queued: u32,
}

impl ChunkTracker {
    pub fn new(level_count: u32) -> Self {
        assert!(level_count > 1 && level_count < u8::MAX as u32, "unsupported level count {level_count}");
        Self {
            level_count,
            queues: (0..level_count).map(|_| FxHashSet::default()).collect(),
            computed: FxHashMap::default(),
            first_queued: level_count,
        }
    }
    pub fn level_count(&self) -> u32 {
        self.level_count
    }
    /// The level reported for anything the tracker cannot reach.
    pub fn untracked(&self) -> u32 {
        self.level_count - 1
    }
    pub fn has_work(&self) -> bool {
        self.first_queued < self.level_count
    }
    pub fn queued(&self) -> usize {
        self.computed.len()
    }

    /// Records that the source now supplies `level` to `id`.
    ///
    /// `decrease` must be true when the new level is lower than what the
    /// source supplied before. Nothing is written back until [`Self::run_updates`].
    pub fn update<H: LevelHooks>(&mut self, hooks: &H, id: u64, level: u32, decrease: bool) {
        self.check_edge(hooks, SOURCE, id, level, decrease);
    }

    /// Processes up to `max_steps` queued nodes and returns the unused steps.
    pub fn run_updates<H: LevelHooks>(&mut self, hooks: &mut H, mut max_steps: usize) -> usize {
        while self.has_work() && max_steps > 0 {
            max_steps -= 1;
            let bucket = self.first_queued as usize;
            let Some(id) = self.queues[bucket].iter().next().copied() else {
                self.check_first_queued(self.level_count);
                continue;
            };
            self.queues[bucket].remove(&id);
            let level = self.clamp(hooks.level(id));
            if self.queues[bucket].is_empty() {
                self.check_first_queued(self.level_count);
            }
            let pending = self.computed.remove(&id).map_or(level, u32::from);
            if pending < level {
                hooks.set_level(id, pending);
                self.check_neighbours(hooks, id, pending, true);
            } else if pending > level {
                // raise to the ceiling first, neighbours then pull it back down
                self.enqueue(id, pending, self.priority(self.untracked(), pending));
                hooks.set_level(id, self.untracked());
                self.check_neighbours(hooks, id, level, false);
            }
        }
        max_steps
    }

    fn clamp(&self, level: u32) -> u32 {
        level.min(self.untracked())
    }
    fn priority(&self, a: u32, b: u32) -> u32 {
        a.min(b).min(self.untracked())
    }

    fn check_neighbours<H: LevelHooks>(&mut self, hooks: &H, id: u64, level: u32, decrease: bool) {
        let pos = ChunkPos::from_long(id);
        for neighbour in pos.square(1) {
            if neighbour != pos {
                self.check_neighbour(hooks, id, neighbour.to_long(), level, decrease);
            }
        }
    }

    fn check_neighbour<H: LevelHooks>(
        &mut self,
        hooks: &H,
        from: u64,
        to: u64,
        level: u32,
        decrease: bool,
    ) {
        let pending = self.pending(to);
        let proposed = self.clamp(level_from_neighbour(hooks, from, to, level));
        if decrease {
            self.check_edge_with(hooks, from, to, proposed, hooks.level(to), pending, true);
            return;
        }
        // an increase only matters to nodes whose level came through `from`
        let expected = pending.unwrap_or_else(|| self.clamp(hooks.level(to)));
        if proposed == expected {
            let current = if pending.is_some() { hooks.level(to) } else { expected };
            self.check_edge_with(hooks, from, to, self.untracked(), current, pending, false);
        }
    }

    fn check_edge<H: LevelHooks>(
        &mut self,
        hooks: &H,
        from: u64,
        to: u64,
        level: u32,
        decrease: bool,
    ) {
        let pending = self.pending(to);
        self.check_edge_with(hooks, from, to, level, hooks.level(to), pending, decrease);
    }

    #[allow(clippy::too_many_arguments)]
    fn check_edge_with<H: LevelHooks>(
        &mut self,
        hooks: &H,
        from: u64,
        to: u64,
        level: u32,
        current: u32,
        pending: Option<u32>,
        decrease: bool,
    ) {
        if to == SOURCE {
            return;
        }
        let current = self.clamp(current);
        let queued = pending.is_some();
        let pending = pending.unwrap_or(current);
        let computed = if decrease {
            pending.min(self.clamp(level))
        } else {
            self.clamp(self.computed_level(hooks, to, from, level))
        };
        let old_priority = self.priority(current, pending);
        if current != computed {
            let new_priority = self.priority(current, computed);
            if queued && old_priority != new_priority {
                self.dequeue(to, old_priority, new_priority);
            }
            self.enqueue(to, computed, new_priority);
        } else if queued {
            self.dequeue(to, old_priority, self.level_count);
            self.computed.remove(&to);
        }
    }

    /// Best level `id` can get from anything except `excluded`, capped at `max_level`.
    fn computed_level<H: LevelHooks>(
        &self,
        hooks: &H,
        id: u64,
        excluded: u64,
        max_level: u32,
    ) -> u32 {
        let mut best = max_level;
        let pos = ChunkPos::from_long(id);
        for neighbour in pos.square(1) {
            let from = if neighbour == pos { SOURCE } else { neighbour.to_long() };
            if from == excluded {
                continue;
            }
            let level = if from == SOURCE { 0 } else { hooks.level(from) };
            best = best.min(level_from_neighbour(hooks, from, id, level));
            if best == 0 {
                break;
            }
        }
        best
    }

    fn pending(&self, id: u64) -> Option<u32> {
        self.computed.get(&id).map(|&level| level as u32)
    }

    fn enqueue(&mut self, id: u64, level: u32, priority: u32) {
        self.computed.insert(id, level as u8);
        self.queues[priority as usize].insert(id);
        self.first_queued = self.first_queued.min(priority);
    }

    fn dequeue(&mut self, id: u64, priority: u32, max_level: u32) {
        let queue = &mut self.queues[priority as usize];
        queue.remove(&id);
        if queue.is_empty() && self.first_queued == priority {
            self.check_first_queued(max_level);
        }
    }

    fn check_first_queued(&mut self, max_level: u32) {
        let old = self.first_queued;
        self.first_queued = max_level;
        for level in old + 1..max_level {
            if !self.queues[level as usize].is_empty() {
                self.first_queued = level;
                break;
            }
        }
    }
}

fn level_from_neighbour<H: LevelHooks>(hooks: &H, from: u64, to: u64, level: u32) -> u32 {
    if from == SOURCE {
        hooks.level_from_source(to)
    } else {
        level.saturating_add(1)
    }
}
