use crate::chunk::LevelChunk;
use crate::config::ServerConfig;
use crate::manager::ChunkManager;
use crate::prelude::*;
use crate::ticket::{PlayerId, TicketKey, TicketKind};

// What does a player need from the chunk engine?
//   A ticket-free presence: players fund chunks through the player tracker,
//   not through tickets they own, so logging out can't leak a ticket.
//   A view: which of the chunks around them can be shown right now.
//   That's the ticking ones. A chunk that's merely full may still be missing
//   neighbours the client would render against.
//
// The world never waits on the pool during a normal tick. If chunks are slow
// the view just fills in later.
#[derive(Debug, Clone)]
struct Player {
    name: String,
    position: (f64, f64),
    chunk: ChunkPos,
    view_distance: Option<u32>,
    visible: FxHashSet<ChunkPos>,
}

pub struct World {
    manager: ChunkManager,
    players: SlotMap<Player>,
    view_distance: u32,
    autosave_interval: u64,
    tick: u64,
}

impl World {
    pub fn new(manager: ChunkManager, config: &ServerConfig) -> Self {
        let mut manager = manager;
        manager.set_view_distance(config.view_distance);
        Self {
            manager,
            players: SlotMap::new(),
            view_distance: config.view_distance,
            autosave_interval: config.autosave_interval,
            tick: 0,
        }
    }
    pub fn manager(&self) -> &ChunkManager {
        &self.manager
    }
    pub fn manager_mut(&mut self) -> &mut ChunkManager {
        &mut self.manager
    }
    pub fn player_count(&self) -> usize {
        self.players.len()
    }
    pub fn player_pos(&self, pid: PlayerId) -> Option<(f64, f64)> {
        self.players.get(pid).map(|player| player.position)
    }
    pub fn player_chunk(&self, pid: PlayerId) -> Option<ChunkPos> {
        self.players.get(pid).map(|player| player.chunk)
    }
    /// Chunks `pid` can currently see.
    pub fn visible(&self, pid: PlayerId) -> Option<&FxHashSet<ChunkPos>> {
        self.players.get(pid).map(|player| &player.visible)
    }
    /// A loaded full chunk, if the engine has one at `pos`.
    pub fn chunk_at(&self, pos: ChunkPos) -> Option<Arc<LevelChunk>> {
        let holder = self.manager.holder(pos)?;
        holder.full_chunk_future().get_now()?.ok()
    }
}

impl World {
    pub fn tick_until(&mut self, tickn: u64) {
        while self.tick < tickn {
            // only the tick that catches up may spend spare time unloading
            self.tick(self.tick + 1 == tickn);
            self.tick += 1;
        }
    }
    pub fn next_tick(&self) -> u64 {
        self.tick + 1
    }
    pub fn login(
        &mut self,
        name: impl Into<String>,
        x: f64,
        z: f64,
        view_distance: Option<u32>,
    ) -> PlayerId {
        let chunk = ChunkPos::from_block(x, z);
        let player = Player {
            name: name.into(),
            position: (x, z),
            chunk,
            view_distance,
            visible: FxHashSet::default(),
        };
        log::info!("{} joined at {chunk}", player.name);
        let pid = self.players.insert(player);
        self.manager.add_player(chunk, pid);
        pid
    }
    pub fn request_move(&mut self, pid: PlayerId, x: f64, z: f64) {
        let Some(player) = self.players.get_mut(pid) else {
            log::warn!("move for unknown player {pid}");
            return;
        };
        player.position = (x, z);
        let chunk = ChunkPos::from_block(x, z);
        let old_chunk = core::mem::replace(&mut player.chunk, chunk);
        if old_chunk != chunk {
            log::trace!("{} crossed into {chunk}", player.name);
            self.manager.move_player(old_chunk, chunk, pid);
        }
    }
    pub fn logout(&mut self, pid: PlayerId) {
        if let Some(player) = self.players.release(pid) {
            log::info!("{} left", player.name);
            self.manager.remove_player(player.chunk, pid);
        }
    }
    pub fn set_view_distance(&mut self, view_distance: u32) {
        log::info!("view distance {} -> {view_distance}", self.view_distance);
        self.view_distance = view_distance;
        self.manager.set_view_distance(view_distance);
    }

    /// Funds the area around `center` with a start ticket and blocks until
    /// every chunk in it is ticking.
    pub fn prepare_spawn(&mut self, center: ChunkPos, radius: u32) {
        log::info!("Preparing start region around {center}");
        let started = time::Instant::now();
        self.manager
            .add_region_ticket(TicketKind::Start, center, radius, TicketKey::Unit);
        self.manager.managed_block(|manager| {
            manager.run_ticket_updates();
            center
                .square(radius as i32)
                .all(|pos| manager.holder(pos).map_or(false, |holder| holder.ticking_chunk().is_some()))
        });
        log::info!("Time elapsed: {} ms", started.elapsed().as_millis());
    }

    fn tick(&mut self, has_time_left: bool) {
        self.manager.tick(has_time_left);
        self.update_views();
        if self.tick > 0 && self.tick % self.autosave_interval == 0 {
            log::debug!("autosave at tick {}", self.tick);
            self.manager.save_all(false);
        }
    }

    fn update_views(&mut self) {
        let world_view = self.view_distance;
        let manager = &self.manager;
        for (_, player) in self.players.iter_mut() {
            let radius = player.view_distance.map_or(world_view, |own| own.min(world_view));
            let center = player.chunk;
            player.visible.retain(|pos| center.chebyshev(*pos) <= radius);
            for pos in center.square(radius as i32) {
                let ticking = manager.holder(pos).map_or(false, |holder| holder.ticking_chunk().is_some());
                if ticking {
                    player.visible.insert(pos);
                } else {
                    player.visible.remove(&pos);
                }
            }
        }
    }

    /// Drops every player and saves everything.
    pub fn close(mut self) {
        let pids: Vec<_> = self.players.iter().map(|(pid, _)| pid).collect();
        for pid in pids {
            self.logout(pid);
        }
        self.manager.close();
    }
}
