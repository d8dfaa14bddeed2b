use super::{PlayerDistance, PlayerId, PlayerTickets, Ticket, TicketKey, TicketKind, TicketRegistry};
use crate::chunk::StatusTable;
use crate::executor::{Executor, Mailbox};
use crate::manager::MainThread;
use crate::prelude::*;
use crate::sorter::{QueueId, TaskSorter};
use crate::tracker::{ChunkTracker, LevelHooks};
use std::collections::BTreeSet;

/// Radius of the player tracker that gates natural spawning.
pub const MOB_SPAWN_RANGE: u32 = 8;
/// Furthest view distance the player ticket tracker can express.
pub const MAX_VIEW_DISTANCE: u32 = 33;

/// The side of the chunk map the ticket tracker writes resolved levels into.
pub trait ChunkScheduling {
    /// Ticket level of the holder at `pos`, if there is one.
    fn holder_level(&self, pos: u64) -> Option<u32>;
    /// Whether the holder at `pos` is already on its way out.
    fn is_chunk_to_remove(&self, pos: u64) -> bool;
    /// Applies a level change. Returns whether a holder exists for `pos` afterwards.
    fn update_chunk_scheduling(&mut self, pos: u64, level: u32, old_level: u32) -> bool;
}

#[derive(Default)]
struct PendingUpdates {
    order: Vec<u64>,
    queued: FxHashSet<u64>,
}
impl PendingUpdates {
    fn push(&mut self, pos: u64) {
        if self.queued.insert(pos) {
            self.order.push(pos);
        }
    }
    fn take(&mut self) -> Vec<u64> {
        self.queued.clear();
        core::mem::take(&mut self.order)
    }
}

struct TicketHooks<'a, C> {
    tickets: &'a FxHashMap<u64, BTreeSet<Ticket>>,
    chunks: &'a mut C,
    pending: &'a mut PendingUpdates,
    untracked: u32,
    // whether any level moved
    changed: bool,
}
impl<C: ChunkScheduling> LevelHooks for TicketHooks<'_, C> {
    fn level_from_source(&self, id: u64) -> u32 {
        self.tickets.get(&id).and_then(BTreeSet::first).map_or(u32::MAX, |t| t.level)
    }
    fn level(&self, id: u64) -> u32 {
        if self.chunks.is_chunk_to_remove(id) {
            return self.untracked;
        }
        self.chunks.holder_level(id).unwrap_or(self.untracked)
    }
    fn set_level(&mut self, id: u64, level: u32) {
        let old = self.chunks.holder_level(id).unwrap_or(self.untracked);
        if old == level {
            return;
        }
        self.changed = true;
        if self.chunks.update_chunk_scheduling(id, level, old) {
            self.pending.push(id);
        }
    }
}

macro_rules! hooks {
    ($self:ident, $chunks:expr) => {
        TicketHooks {
            tickets: &$self.tickets,
            chunks: $chunks,
            pending: &mut $self.pending,
            untracked: $self.untracked,
            changed: false,
        }
    };
}

/// Owns every ticket and turns ticket changes into chunk levels.
pub struct TicketManager {
    registry: Arc<TicketRegistry>,
    tickets: FxHashMap<u64, BTreeSet<Ticket>>,
    players_by_chunk: FxHashMap<u64, FxHashSet<PlayerId>>,
    ticket_tracker: ChunkTracker,
    natural_spawn: PlayerDistance,
    player_tickets: PlayerTickets,
    pending: PendingUpdates,
    tickets_to_release: Vec<u64>,
    tick_count: u64,
    throttler: TaskSorter,
    throttle_queue: QueueId,
    untracked: u32,
    player_ticket_level: u32,
    main: MainThread,
}

impl TicketManager {
    /// `throttle` bounds how many player tickets may be waiting on their
    /// chunk at once.
    pub fn new(
        table: &StatusTable,
        registry: Arc<TicketRegistry>,
        view_distance: u32,
        throttle: usize,
        executor: Arc<dyn Executor>,
        main: MainThread,
    ) -> Self {
        let worker: Arc<dyn Executor> = Mailbox::new("player ticket throttler", (), executor.clone());
        let (throttler, queues) = TaskSorter::new(
            "player ticket sorter",
            vec![("player ticket throttler", worker)],
            executor,
            MAX_VIEW_DISTANCE as usize + 2,
            throttle,
        );
        let max_chunk_distance = table.max_chunk_distance();
        Self {
            registry,
            tickets: FxHashMap::default(),
            players_by_chunk: FxHashMap::default(),
            ticket_tracker: ChunkTracker::new(max_chunk_distance + 2),
            natural_spawn: PlayerDistance::new(MOB_SPAWN_RANGE),
            player_tickets: PlayerTickets::new(MAX_VIEW_DISTANCE, view_distance),
            pending: PendingUpdates::default(),
            tickets_to_release: vec![],
            tick_count: 0,
            throttler,
            throttle_queue: queues[0],
            untracked: max_chunk_distance + 1,
            player_ticket_level: table.player_ticket_level(),
            main,
        }
    }

    pub fn tick_count(&self) -> u64 {
        self.tick_count
    }
    pub fn registry(&self) -> &TicketRegistry {
        &self.registry
    }
    pub fn tickets_at(&self, pos: ChunkPos) -> impl Iterator<Item = &Ticket> {
        self.tickets.get(&pos.to_long()).into_iter().flatten()
    }
    /// Level the tickets at `pos` ask for directly, ignoring neighbours.
    pub fn ticket_level(&self, pos: ChunkPos) -> Option<u32> {
        self.tickets_at(pos).next().map(|t| t.level)
    }
    pub fn has_work(&self) -> bool {
        self.ticket_tracker.has_work()
    }

    pub fn add_ticket(
        &mut self,
        chunks: &mut impl ChunkScheduling,
        kind: TicketKind,
        pos: ChunkPos,
        level: u32,
        key: TicketKey,
    ) {
        self.add(chunks, pos.to_long(), Ticket::new(kind, level, key));
    }
    pub fn remove_ticket(
        &mut self,
        chunks: &mut impl ChunkScheduling,
        kind: TicketKind,
        pos: ChunkPos,
        level: u32,
        key: TicketKey,
    ) {
        self.remove(chunks, pos.to_long(), Ticket::new(kind, level, key));
    }
    /// Funds every chunk within `radius` of `pos` at player level or better.
    pub fn add_region_ticket(
        &mut self,
        chunks: &mut impl ChunkScheduling,
        kind: TicketKind,
        pos: ChunkPos,
        radius: u32,
        key: TicketKey,
    ) {
        let level = self.region_level(radius);
        self.add(chunks, pos.to_long(), Ticket::new(kind, level, key));
    }
    pub fn remove_region_ticket(
        &mut self,
        chunks: &mut impl ChunkScheduling,
        kind: TicketKind,
        pos: ChunkPos,
        radius: u32,
        key: TicketKey,
    ) {
        let level = self.region_level(radius);
        self.remove(chunks, pos.to_long(), Ticket::new(kind, level, key));
    }
    fn region_level(&self, radius: u32) -> u32 {
        self.player_ticket_level.saturating_sub(radius)
    }

    fn add(&mut self, chunks: &mut impl ChunkScheduling, pos: u64, mut ticket: Ticket) {
        ticket.created_tick = self.tick_count;
        let set = self.tickets.entry(pos).or_default();
        let old_level = set.first().map_or(u32::MAX, |t| t.level);
        // an identical ticket is replaced, which refreshes its creation tick
        set.replace(ticket);
        if ticket.level < old_level {
            let hooks = hooks!(self, chunks);
            self.ticket_tracker.update(&hooks, pos, ticket.level, true);
        }
    }

    fn remove(&mut self, chunks: &mut impl ChunkScheduling, pos: u64, ticket: Ticket) {
        let Some(set) = self.tickets.get_mut(&pos) else {
            log::warn!("removing {} ticket from {} which has none", ticket.kind.name(), ChunkPos::from_long(pos));
            return;
        };
        set.remove(&ticket);
        let level = set.first().map_or(u32::MAX, |t| t.level);
        if set.is_empty() {
            self.tickets.remove(&pos);
        }
        let hooks = hooks!(self, chunks);
        self.ticket_tracker.update(&hooks, pos, level, false);
    }

    pub fn add_player(&mut self, pos: ChunkPos, player: PlayerId) {
        let id = pos.to_long();
        self.players_by_chunk.entry(id).or_default().insert(player);
        self.natural_spawn.update(&self.players_by_chunk, id, true);
        self.player_tickets.distance.update(&self.players_by_chunk, id, true);
    }

    pub fn remove_player(&mut self, pos: ChunkPos, player: PlayerId) {
        let id = pos.to_long();
        let Some(players) = self.players_by_chunk.get_mut(&id) else { return };
        players.remove(&player);
        if players.is_empty() {
            self.players_by_chunk.remove(&id);
            self.natural_spawn.update(&self.players_by_chunk, id, false);
            self.player_tickets.distance.update(&self.players_by_chunk, id, false);
        }
    }

    /// Advances the ticket clock and drops expired tickets.
    pub fn purge(&mut self, chunks: &mut impl ChunkScheduling) {
        self.tick_count += 1;
        let tick = self.tick_count;
        let registry = &self.registry;
        let mut changed = vec![];
        self.tickets.retain(|&pos, set| {
            let before = set.len();
            set.retain(|ticket| !registry.has_timed_out(ticket, tick));
            if set.len() != before {
                changed.push((pos, set.first().map_or(u32::MAX, |t| t.level)));
            }
            !set.is_empty()
        });
        for (pos, level) in changed {
            let hooks = hooks!(self, chunks);
            self.ticket_tracker.update(&hooks, pos, level, false);
        }
    }

    /// Converges all three trackers. Returns whether any chunk level moved.
    pub fn run_updates(&mut self, chunks: &mut impl ChunkScheduling) -> bool {
        self.natural_spawn.run_updates(&self.players_by_chunk, None);
        self.update_player_tickets();
        let mut hooks = hooks!(self, chunks);
        self.ticket_tracker.run_updates(&mut hooks, usize::MAX);
        hooks.changed
    }

    /// Holders whose level changed since the last call, in the order they changed.
    pub fn take_pending_updates(&mut self) -> Vec<u64> {
        self.pending.take()
    }
    /// Chunks granted a player ticket since the last call.
    pub fn take_tickets_to_release(&mut self) -> Vec<u64> {
        core::mem::take(&mut self.tickets_to_release)
    }
    pub fn has_player_ticket(&self, pos: u64) -> bool {
        self.tickets.get(&pos).map_or(false, |set| set.iter().any(|t| t.kind == TicketKind::Player))
    }

    pub fn has_players_nearby(&mut self, pos: ChunkPos) -> bool {
        self.natural_spawn.run_updates(&self.players_by_chunk, None);
        self.natural_spawn.contains(pos.to_long())
    }
    pub fn natural_spawn_chunk_count(&mut self) -> usize {
        self.natural_spawn.run_updates(&self.players_by_chunk, None);
        self.natural_spawn.len()
    }

    pub fn view_distance(&self) -> u32 {
        self.player_tickets.view_distance()
    }
    /// Re-evaluates every chunk near a player against the new view distance.
    pub fn set_view_distance(&mut self, view_distance: u32) {
        let chunks: Vec<_> = self.player_tickets.distance.chunks().collect();
        for (pos, level) in chunks {
            let was = self.player_tickets.have_ticket_for(level);
            self.on_player_level_change(pos, level, was, level + 2 <= view_distance);
        }
        self.player_tickets.view_distance = view_distance;
    }

    fn update_player_tickets(&mut self) {
        let tickets = &mut self.player_tickets;
        tickets.distance.run_updates(&self.players_by_chunk, Some(&mut tickets.to_update));
        let to_update = core::mem::take(&mut self.player_tickets.to_update);
        let default = MAX_VIEW_DISTANCE + 2;
        for pos in to_update {
            let old = self.player_tickets.queue_level(pos);
            let new = self.player_tickets.level(pos);
            if old == new {
                continue;
            }
            let reader = self.player_tickets.queue_levels.clone();
            let writer = reader.clone();
            self.throttler.on_level_change(
                pos,
                move || reader.lock().get(&pos).copied().unwrap_or(default),
                new,
                move |level| {
                    let mut levels = writer.lock();
                    if level >= default {
                        levels.remove(&pos);
                    } else {
                        levels.insert(pos, level);
                    }
                },
            );
            let was = self.player_tickets.have_ticket_for(old);
            let is = self.player_tickets.have_ticket_for(new);
            self.on_player_level_change(pos, new, was, is);
        }
    }

    fn on_player_level_change(&mut self, pos: u64, level: u32, was_in_view: bool, in_view: bool) {
        if was_in_view == in_view {
            return;
        }
        let main = self.main.clone();
        if in_view {
            let grant = Box::new(move || main.submit(move |manager| manager.grant_player_ticket(pos)));
            self.throttler.submit_blocking(self.throttle_queue, pos, move || level, grant);
        } else {
            let revoke = Box::new(move || main.submit(move |manager| manager.revoke_player_ticket(pos)));
            self.throttler.release(self.throttle_queue, pos, true, revoke);
        }
    }

    fn player_ticket(&self, pos: u64) -> Ticket {
        Ticket::new(TicketKind::Player, self.player_ticket_level, TicketKey::Pos(ChunkPos::from_long(pos)))
    }

    /// Runs on the tick thread once the throttler lets a grant through.
    pub fn grant_player_ticket(&mut self, chunks: &mut impl ChunkScheduling, pos: u64) {
        if self.player_tickets.have_ticket_for(self.player_tickets.level(pos)) {
            let ticket = self.player_ticket(pos);
            self.add(chunks, pos, ticket);
            self.tickets_to_release.push(pos);
        } else {
            self.release_throttle(pos);
        }
    }
    pub fn revoke_player_ticket(&mut self, chunks: &mut impl ChunkScheduling, pos: u64) {
        let ticket = self.player_ticket(pos);
        self.remove(chunks, pos, ticket);
    }
    /// Gives the throttler slot of `pos` back.
    pub fn release_throttle(&self, pos: u64) {
        self.throttler.release(self.throttle_queue, pos, false, Box::new(|| {}));
    }

    pub fn close(&self) {
        self.throttler.close();
    }
}
