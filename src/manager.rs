//! The chunk manager: owns every holder and turns ticket levels into work.
//!
//! Everything here runs on the tick thread. Workers report back by posting
//! closures to the [`MainThread`] queue, which the tick drains.

use crate::chunk::{
    ChunkAccessor, ChunkFuture, ChunkHolder, ChunkResult, ChunkStatus, FullChunkStatus, FullFuture, FullResult,
    LevelChunk, ProtoChunk, SerializedChunk, StatusTable, StatusTask,
};
use crate::completion::Completion;
use crate::config::ServerConfig;
use crate::error::{CrashReport, GenerationFailure, LoadFailure, SaveFailure};
use crate::executor::{Executor, Job, Mailbox};
use crate::generator::{Generator, LightEngine, WorldGenRegion};
use crate::prelude::*;
use crate::sorter::{QueueId, TaskSorter};
use crate::storage::DiskStore;
use crate::ticket::{ChunkScheduling, PlayerId, TicketKey, TicketKind, TicketManager, TicketRegistry, MAX_VIEW_DISTANCE};
use crossbeam_channel::{Receiver, Sender};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};

pub type MainTask = Box<dyn FnOnce(&mut ChunkManager) + Send>;

/// The tick thread's inbox. Anything holding a clone can get a closure run
/// against the [`ChunkManager`] on its next drain.
#[derive(Clone)]
pub struct MainThread {
    tx: Sender<MainTask>,
    rx: Receiver<MainTask>,
}

impl Default for MainThread {
    fn default() -> Self {
        Self::new()
    }
}

impl MainThread {
    pub fn new() -> Self {
        let (tx, rx) = crossbeam_channel::unbounded();
        Self { tx, rx }
    }
    pub fn submit(&self, task: impl FnOnce(&mut ChunkManager) + Send + 'static) {
        // we own a receiver, so the channel is never disconnected
        let _ = self.tx.send(Box::new(task));
    }
    /// Runs `f` on the tick thread and completes with its result.
    pub fn call<T: Clone + Send + 'static>(
        &self,
        f: impl FnOnce(&mut ChunkManager) -> T + Send + 'static,
    ) -> Completion<T> {
        let out = Completion::new();
        let done = out.clone();
        self.submit(move |manager| {
            done.complete(f(manager));
        });
        out
    }
    pub fn backlog(&self) -> usize {
        self.rx.len()
    }
    fn next(&self) -> Option<MainTask> {
        self.rx.try_recv().ok()
    }
}

impl Executor for MainThread {
    fn execute(&self, job: Job) {
        self.submit(move |_| job());
    }
}

/// Hears about chunks reaching statuses. Called from any thread.
pub trait ChunkStatusListener: Send + Sync {
    /// `None` when the chunk was unloaded.
    fn on_status_change(&self, _pos: ChunkPos, _status: Option<ChunkStatus>) {}
    fn on_full_status(&self, _pos: ChunkPos, _status: FullChunkStatus) {}
}

pub struct NoopListener;
impl ChunkStatusListener for NoopListener {}

/// Counts chunks around spawn reaching full, and logs every ten percent.
pub struct ProgressLogger {
    center: ChunkPos,
    radius: u32,
    full: ChunkStatus,
    total: usize,
    done: AtomicUsize,
    logged: AtomicUsize,
}
impl ProgressLogger {
    pub fn new(center: ChunkPos, radius: u32, full: ChunkStatus) -> Self {
        let side = 2 * radius as usize + 1;
        Self {
            center,
            radius,
            full,
            total: side * side,
            done: AtomicUsize::new(0),
            logged: AtomicUsize::new(0),
        }
    }
    pub fn progress(&self) -> usize {
        (self.done.load(Ordering::Acquire) * 100 / self.total).min(100)
    }
}
impl ChunkStatusListener for ProgressLogger {
    fn on_status_change(&self, pos: ChunkPos, status: Option<ChunkStatus>) {
        if status != Some(self.full) || self.center.chebyshev(pos) > self.radius {
            return;
        }
        self.done.fetch_add(1, Ordering::AcqRel);
        let percent = self.progress();
        if self.logged.fetch_max(percent, Ordering::AcqRel) / 10 < percent / 10 {
            log::info!("Preparing spawn area: {percent}%");
        }
    }
}

/// A holder on its way out. A holder can pass through here more than once,
/// `id` tells the callbacks of each trip apart.
struct PendingUnload {
    holder: Arc<ChunkHolder>,
    id: u64,
}

/// Position to holder map, the side of the manager the ticket tracker writes into.
pub struct ChunkMap {
    table: Arc<StatusTable>,
    holders: FxHashMap<u64, Arc<ChunkHolder>>,
    pending_unloads: FxHashMap<u64, PendingUnload>,
    next_unload: u64,
    to_drop: FxHashSet<u64>,
}

impl ChunkMap {
    fn new(table: Arc<StatusTable>) -> Self {
        Self {
            table,
            holders: FxHashMap::default(),
            pending_unloads: FxHashMap::default(),
            next_unload: 0,
            to_drop: FxHashSet::default(),
        }
    }
    fn start_unload(&mut self, pos: u64, holder: Arc<ChunkHolder>) -> u64 {
        let id = self.next_unload;
        self.next_unload += 1;
        self.pending_unloads.insert(pos, PendingUnload { holder, id });
        id
    }
    fn is_unloading(&self, pos: u64, id: u64) -> bool {
        self.pending_unloads.get(&pos).map_or(false, |pending| pending.id == id)
    }
}

impl ChunkScheduling for ChunkMap {
    fn holder_level(&self, pos: u64) -> Option<u32> {
        self.holders.get(&pos).map(|holder| holder.ticket_level())
    }
    fn is_chunk_to_remove(&self, pos: u64) -> bool {
        self.to_drop.contains(&pos)
    }
    fn update_chunk_scheduling(&mut self, pos: u64, level: u32, old_level: u32) -> bool {
        let max = self.table.max_chunk_distance();
        if old_level > max && level > max {
            return self.holders.contains_key(&pos);
        }
        if let Some(holder) = self.holders.get(&pos) {
            holder.set_ticket_level(level);
            if level > max {
                self.to_drop.insert(pos);
            } else {
                self.to_drop.remove(&pos);
            }
            return true;
        }
        if level > max {
            return false;
        }
        let holder = match self.pending_unloads.remove(&pos) {
            Some(PendingUnload { holder, .. }) => {
                log::debug!("{} came back before it finished unloading", holder.pos());
                holder.set_ticket_level(level);
                holder
            }
            None => {
                let pos = ChunkPos::from_long(pos);
                log::trace!("new holder for {pos} at level {level}");
                Arc::new(ChunkHolder::new(pos, level, max + 1, self.table.len()))
            }
        };
        self.holders.insert(pos, holder);
        true
    }
}

/// The pieces the manager is plugged into.
pub struct Collaborators {
    pub store: Arc<dyn DiskStore>,
    pub generator: Arc<dyn Generator>,
    pub light: Arc<dyn LightEngine>,
    pub listener: Arc<dyn ChunkStatusListener>,
    /// The pool every queue runs on.
    pub executor: Arc<dyn Executor>,
}

// Shared with every job the manager hands out.
struct Workers {
    table: Arc<StatusTable>,
    store: Arc<dyn DiskStore>,
    generator: Arc<dyn Generator>,
    light: Arc<dyn LightEngine>,
    listener: Arc<dyn ChunkStatusListener>,
    main: MainThread,
    sorter: TaskSorter,
    loader: Arc<Mailbox<()>>,
    mailboxes: [Arc<Mailbox<()>>; 3],
    loader_queue: QueueId,
    worldgen_queue: QueueId,
    light_queue: QueueId,
}

impl Workers {
    /// Files jobs under `holder`'s position at whatever level it has when they are sorted.
    fn queue_executor(&self, queue: QueueId, holder: &Arc<ChunkHolder>) -> Arc<dyn Executor> {
        let holder = holder.clone();
        self.sorter.executor(queue, holder.pos().to_long(), move || holder.queue_level())
    }

    fn release_light_ticket(&self, pos: ChunkPos, status: ChunkStatus) {
        let level = self.table.level_for_status(status);
        self.main
            .submit(move |manager| manager.remove_ticket(TicketKind::Light, pos, level, TicketKey::Pos(pos)));
    }

    fn read_chunk(&self, pos: ChunkPos) -> ChunkResult {
        let proto = match self.store.read(pos) {
            Ok(None) => ProtoChunk::new(pos),
            Ok(Some(serialized)) if serialized.pos() != pos => {
                let reason = format!("stored under {} instead", serialized.pos());
                log::error!("Chunk file at {pos} is in the wrong location: {reason}");
                return Err(LoadFailure::Corrupt { pos, reason });
            }
            Ok(Some(serialized)) => serialized.into_proto(&self.table).map_err(|reason| {
                log::error!("Couldn't load chunk {pos}: {reason}");
                LoadFailure::Corrupt { pos, reason }
            })?,
            Err(e) => {
                log::error!("Couldn't load chunk {pos}: {e}");
                return Err(LoadFailure::Corrupt { pos, reason: e.to_string() });
            }
        };
        log::trace!("read {pos} at {}", self.table.name(proto.status()));
        Ok(ChunkAccessor::Proto(Arc::new(proto)))
    }

    /// Runs the build logic of `status` once its neighbour ring is ready.
    fn run_step(
        self: &Arc<Self>,
        holder: Arc<ChunkHolder>,
        status: ChunkStatus,
        range: u32,
        chunks: Vec<ChunkAccessor>,
    ) -> ChunkFuture {
        let pos = holder.pos();
        let center = chunks[chunks.len() / 2].clone();
        let future = match self.table.task(status) {
            StatusTask::Passthrough => {
                center.proto().advance(status);
                Completion::completed(Ok(center))
            }
            StatusTask::Generate => Completion::completed(self.generate(pos, status, range, center, chunks)),
            StatusTask::Light => self.light(&holder, status, center),
            StatusTask::Full => self
                .main
                .call(move |manager| manager.promote_full(&holder, Ok(center))),
        };
        self.listener.on_status_change(pos, Some(status));
        future
    }

    fn generate(
        &self,
        pos: ChunkPos,
        status: ChunkStatus,
        range: u32,
        center: ChunkAccessor,
        chunks: Vec<ChunkAccessor>,
    ) -> ChunkResult {
        if center.status() >= status {
            return Ok(center);
        }
        let region = WorldGenRegion::new(pos, range, chunks);
        let name = self.table.name(status);
        let cause = match catch_unwind(AssertUnwindSafe(|| self.generator.generate(name, &region))) {
            Ok(Ok(())) => {
                center.proto().advance(status);
                center.set_unsaved(true);
                return Ok(center);
            }
            Ok(Err(cause)) => cause,
            Err(panic) => panic_message(panic),
        };
        Err(self.crash("Exception generating new chunk", pos, status, cause))
    }

    fn light(
        self: &Arc<Self>,
        holder: &Arc<ChunkHolder>,
        status: ChunkStatus,
        center: ChunkAccessor,
    ) -> ChunkFuture {
        let pos = holder.pos();
        let executor = self.queue_executor(self.light_queue, holder);
        let workers = self.clone();
        let lit = Completion::completed(()).map_on(executor, move |()| {
            let proto = center.proto();
            if proto.status() >= status {
                return Ok(center);
            }
            match workers.light.light(proto) {
                Ok(()) => {
                    proto.advance(status);
                    proto.set_unsaved(true);
                    Ok(center)
                }
                Err(cause) => Err(workers.crash("Exception lighting chunk", pos, status, cause)),
            }
        });
        let workers = self.clone();
        lit.on_complete(move |_| workers.release_light_ticket(pos, status));
        lit
    }

    fn crash(&self, title: &str, pos: ChunkPos, status: ChunkStatus, cause: String) -> LoadFailure {
        let report = CrashReport::new(title, cause).section(
            "Chunk to be generated",
            vec![
                ("Location", format!("{},{}", pos.x, pos.z)),
                ("Position hash", pos.to_long().to_string()),
                ("Status", self.table.name(status).to_owned()),
                ("Generator", self.generator.name().to_owned()),
            ],
        );
        log::error!("{report}");
        LoadFailure::Generation(Arc::new(GenerationFailure { pos, report }))
    }
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "generator panicked".to_owned()
    }
}

/// The full chunk in the middle of a range future's result.
fn center_full(result: Result<Vec<ChunkAccessor>, LoadFailure>) -> FullResult {
    let chunks = result?;
    chunks
        .get(chunks.len() / 2)
        .and_then(ChunkAccessor::as_full)
        .cloned()
        .ok_or(LoadFailure::Unloaded)
}

/// View distance as the player ticket tracker counts it.
fn effective_view_distance(view_distance: u32) -> u32 {
    (view_distance + 1).clamp(3, MAX_VIEW_DISTANCE)
}

pub struct ChunkManager {
    workers: Arc<Workers>,
    map: ChunkMap,
    tickets: TicketManager,
    executor: Arc<dyn Executor>,
    // full chunks currently part of the world
    in_world: FxHashSet<u64>,
    retry_unloads: FxHashSet<u64>,
    // the latest write queued for each position
    writes: FxHashMap<u64, Completion<bool>>,
    unloads_per_tick: usize,
    unload_backlog: usize,
    ticking_generated: usize,
}

impl ChunkManager {
    pub fn new(
        table: Arc<StatusTable>,
        registry: Arc<TicketRegistry>,
        config: &ServerConfig,
        collaborators: Collaborators,
    ) -> Self {
        let Collaborators {
            store,
            generator,
            light,
            listener,
            executor,
        } = collaborators;
        let main = MainThread::new();
        let loader = Mailbox::new("chunk loader", (), executor.clone());
        let worldgen = Mailbox::new("world generation", (), executor.clone());
        let light_worker = Mailbox::new("light", (), executor.clone());
        let loader_worker: Arc<dyn Executor> = loader.clone();
        let worldgen_worker: Arc<dyn Executor> = worldgen.clone();
        let light_queue_worker: Arc<dyn Executor> = light_worker.clone();
        let queues = vec![
            ("chunk loader", loader_worker),
            ("world generation", worldgen_worker),
            ("light", light_queue_worker),
        ];
        let level_count = table.max_chunk_distance() as usize + 2;
        let (sorter, ids) = TaskSorter::new("chunk task sorter", queues, executor.clone(), level_count, usize::MAX);
        let tickets = TicketManager::new(
            &table,
            registry,
            effective_view_distance(config.view_distance),
            config.player_ticket_throttle,
            executor.clone(),
            main.clone(),
        );
        let workers = Arc::new(Workers {
            table: table.clone(),
            store,
            generator,
            light,
            listener,
            main,
            sorter,
            loader: loader.clone(),
            mailboxes: [loader, worldgen, light_worker],
            loader_queue: ids[0],
            worldgen_queue: ids[1],
            light_queue: ids[2],
        });
        Self {
            workers,
            map: ChunkMap::new(table),
            tickets,
            executor,
            in_world: FxHashSet::default(),
            retry_unloads: FxHashSet::default(),
            writes: FxHashMap::default(),
            unloads_per_tick: config.unloads_per_tick,
            unload_backlog: config.unload_backlog,
            ticking_generated: 0,
        }
    }

    pub fn table(&self) -> &Arc<StatusTable> {
        &self.workers.table
    }
    pub fn main(&self) -> &MainThread {
        &self.workers.main
    }
    pub fn listener(&self) -> &dyn ChunkStatusListener {
        &*self.workers.listener
    }
    pub(crate) fn sorter(&self) -> &TaskSorter {
        &self.workers.sorter
    }
    pub fn tickets(&self) -> &TicketManager {
        &self.tickets
    }
    pub fn holder(&self, pos: ChunkPos) -> Option<Arc<ChunkHolder>> {
        self.map.holders.get(&pos.to_long()).cloned()
    }
    pub fn holder_count(&self) -> usize {
        self.map.holders.len()
    }
    pub fn pending_unload_count(&self) -> usize {
        self.map.pending_unloads.len()
    }
    pub fn loaded_chunk_count(&self) -> usize {
        self.in_world.len()
    }
    /// Chunks that became ticking since startup.
    pub fn ticking_generated(&self) -> usize {
        self.ticking_generated
    }

    pub fn add_ticket(&mut self, kind: TicketKind, pos: ChunkPos, level: u32, key: TicketKey) {
        self.tickets.add_ticket(&mut self.map, kind, pos, level, key);
    }
    pub fn remove_ticket(&mut self, kind: TicketKind, pos: ChunkPos, level: u32, key: TicketKey) {
        self.tickets.remove_ticket(&mut self.map, kind, pos, level, key);
    }
    pub fn add_region_ticket(
        &mut self,
        kind: TicketKind,
        pos: ChunkPos,
        radius: u32,
        key: TicketKey,
    ) {
        self.tickets.add_region_ticket(&mut self.map, kind, pos, radius, key);
    }
    pub fn remove_region_ticket(
        &mut self,
        kind: TicketKind,
        pos: ChunkPos,
        radius: u32,
        key: TicketKey,
    ) {
        self.tickets.remove_region_ticket(&mut self.map, kind, pos, radius, key);
    }

    pub fn add_player(&mut self, pos: ChunkPos, player: PlayerId) {
        self.tickets.add_player(pos, player);
    }
    pub fn move_player(&mut self, from: ChunkPos, to: ChunkPos, player: PlayerId) {
        if from != to {
            self.tickets.remove_player(from, player);
            self.tickets.add_player(to, player);
        }
    }
    pub fn remove_player(&mut self, pos: ChunkPos, player: PlayerId) {
        self.tickets.remove_player(pos, player);
    }
    pub fn set_view_distance(&mut self, view_distance: u32) {
        self.tickets.set_view_distance(effective_view_distance(view_distance));
    }
    pub fn has_players_nearby(&mut self, pos: ChunkPos) -> bool {
        self.tickets.has_players_nearby(pos)
    }
    pub fn natural_spawn_chunk_count(&mut self) -> usize {
        self.tickets.natural_spawn_chunk_count()
    }

    pub(crate) fn grant_player_ticket(&mut self, pos: u64) {
        self.tickets.grant_player_ticket(&mut self.map, pos);
    }
    pub(crate) fn revoke_player_ticket(&mut self, pos: u64) {
        self.tickets.revoke_player_ticket(&mut self.map, pos);
    }

    /// Drains the tick thread's inbox, including tasks queued while draining.
    pub fn run_main_tasks(&mut self) -> usize {
        let mut ran = 0;
        while let Some(task) = self.workers.main.next() {
            task(self);
            ran += 1;
        }
        ran
    }

    /// One tick of chunk bookkeeping. `has_time_left` lifts the unload budget.
    pub fn tick(&mut self, has_time_left: bool) {
        self.run_main_tasks();
        self.tickets.purge(&mut self.map);
        self.run_ticket_updates();
        self.process_unloads(has_time_left);
    }

    /// Applies pending ticket changes and runs the scheduling pass on every
    /// holder whose level moved. Returns whether anything changed.
    pub fn run_ticket_updates(&mut self) -> bool {
        let changed = self.tickets.run_updates(&mut self.map);
        let pending = self.tickets.take_pending_updates();
        if !pending.is_empty() {
            for pos in pending {
                if let Some(holder) = self.map.holders.get(&pos).cloned() {
                    holder.update_futures(self);
                }
            }
            return true;
        }
        for pos in self.tickets.take_tickets_to_release() {
            let Some(holder) = self.map.holders.get(&pos) else {
                log::warn!("player ticket at {} has no holder", ChunkPos::from_long(pos));
                continue;
            };
            let main = self.workers.main.clone();
            holder
                .entity_ticking_future()
                .on_complete(move |_| main.submit(move |manager| manager.tickets.release_throttle(pos)));
        }
        changed
    }

    /// A future for `status` at `pos`, funding it with a short-lived ticket.
    pub fn get_chunk_future(&mut self, pos: ChunkPos, status: ChunkStatus) -> ChunkFuture {
        let level = self.table().level_for_status(status);
        self.add_ticket(TicketKind::Unknown, pos, level, TicketKey::Pos(pos));
        let absent = |manager: &Self| manager.holder(pos).map_or(true, |holder| holder.ticket_level() > level);
        if absent(self) {
            self.run_ticket_updates();
            if absent(self) {
                log::warn!("no holder for {pos} after adding a ticket");
                return crate::chunk::unloaded();
            }
        }
        match self.holder(pos) {
            Some(holder) => holder.get_or_schedule_future(status, self),
            None => crate::chunk::unloaded(),
        }
    }

    /// The chunk at `pos` if it already reached `status`.
    pub fn get_chunk_now(&self, pos: ChunkPos, status: ChunkStatus) -> Option<ChunkAccessor> {
        let holder = self.map.holders.get(&pos.to_long())?;
        holder.future_if_present(status, self).get_now()?.ok()
    }

    pub(crate) fn schedule(
        &mut self,
        holder: &Arc<ChunkHolder>,
        status: ChunkStatus,
    ) -> ChunkFuture {
        let pos = holder.pos();
        if status == ChunkStatus::EMPTY {
            return self.schedule_load(holder);
        }
        let light = self.table().task(status) == StatusTask::Light;
        if light {
            let level = self.table().level_for_status(status);
            self.add_ticket(TicketKind::Light, pos, level, TicketKey::Pos(pos));
        }
        let parent = holder.get_or_schedule_future(self.table().parent(status), self);
        if let Some(Ok(chunk)) = parent.get_now() {
            if chunk.status() >= status {
                let future = if status == self.table().full() {
                    self.proto_to_full(holder)
                } else {
                    Completion::completed(Ok(chunk))
                };
                if light {
                    self.workers.release_light_ticket(pos, status);
                }
                self.workers.listener.on_status_change(pos, Some(status));
                return future;
            }
        }
        self.schedule_generation(holder, status)
    }

    fn schedule_load(&self, holder: &Arc<ChunkHolder>) -> ChunkFuture {
        let pos = holder.pos();
        let workers = self.workers.clone();
        let executor = self.workers.queue_executor(self.workers.loader_queue, holder);
        Completion::completed(()).map_on(executor, move |()| workers.read_chunk(pos))
    }

    fn schedule_generation(
        &mut self,
        holder: &Arc<ChunkHolder>,
        status: ChunkStatus,
    ) -> ChunkFuture {
        let pos = holder.pos();
        let range = self.table().range(status);
        let table = self.table().clone();
        let neighbours = self.chunk_range_future(pos, range, move |ring| table.dependency(status, ring));
        let executor = self.workers.queue_executor(self.workers.worldgen_queue, holder);
        let workers = self.workers.clone();
        let holder = holder.clone();
        neighbours.then_compose_on(executor, move |result| match result {
            Ok(chunks) => workers.run_step(holder, status, range, chunks),
            Err(failure) => {
                if workers.table.task(status) == StatusTask::Light {
                    workers.release_light_ticket(pos, status);
                }
                Completion::completed(Err(failure))
            }
        })
    }

    /// Every chunk within `radius` of `pos`, each at the status `dependency`
    /// asks for at its ring, in x-major order. The first failure wins.
    pub fn chunk_range_future(
        &mut self,
        pos: ChunkPos,
        radius: u32,
        dependency: impl Fn(u32) -> ChunkStatus,
    ) -> Completion<Result<Vec<ChunkAccessor>, LoadFailure>> {
        let mut parts = Vec::with_capacity((2 * radius as usize + 1).pow(2));
        for neighbour in pos.square(radius as i32) {
            let Some(holder) = self.map.holders.get(&neighbour.to_long()).cloned() else {
                return Completion::completed(Err(LoadFailure::UnloadedNeighbour { pos: neighbour }));
            };
            let future = holder.get_or_schedule_future(dependency(pos.chebyshev(neighbour)), self);
            parts.push(future.map(move |result| {
                result.map_err(|failure| match failure {
                    LoadFailure::Unloaded => LoadFailure::UnloadedNeighbour { pos: neighbour },
                    other => other,
                })
            }));
        }
        Completion::try_all(parts)
    }

    pub(crate) fn prepare_accessible(&mut self, holder: &Arc<ChunkHolder>) -> FullFuture {
        let table = self.table().clone();
        let range = self.chunk_range_future(holder.pos(), 1, move |ring| table.status_around_full(ring as i64));
        let main = self.workers.main.clone();
        range.then_compose(move |result| {
            main.call(move |manager: &mut ChunkManager| -> FullResult {
                let full = center_full(result)?;
                manager.enter_world(&full);
                Ok(full)
            })
        })
    }

    pub(crate) fn prepare_ticking(&mut self, holder: &Arc<ChunkHolder>) -> FullFuture {
        let full = self.table().full();
        let range = self.chunk_range_future(holder.pos(), 1, move |_| full);
        let main = self.workers.main.clone();
        range.then_compose(move |result| {
            main.call(move |manager: &mut ChunkManager| -> FullResult {
                let full = center_full(result)?;
                manager.ticking_generated += 1;
                Ok(full)
            })
        })
    }

    pub(crate) fn prepare_entity_ticking(&mut self, pos: ChunkPos) -> FullFuture {
        let full = self.table().full();
        self.chunk_range_future(pos, 2, move |_| full).map(center_full)
    }

    fn proto_to_full(&self, holder: &Arc<ChunkHolder>) -> ChunkFuture {
        let parent = holder.future_if_present_unchecked(self.table().parent(self.table().full()));
        let main = self.workers.main.clone();
        let holder = holder.clone();
        parent.then_compose(move |result| main.call(move |manager| manager.promote_full(&holder, result)))
    }

    fn promote_full(&mut self, holder: &Arc<ChunkHolder>, result: ChunkResult) -> ChunkResult {
        let chunk = result?;
        if self.table().status_for_level(holder.ticket_level()) < self.table().full() {
            return Err(LoadFailure::Unloaded);
        }
        let full = holder.promote(chunk, self.table().full());
        self.enter_world(&full);
        Ok(ChunkAccessor::Full(full))
    }

    fn enter_world(&mut self, chunk: &Arc<LevelChunk>) {
        if self.in_world.insert(chunk.pos().to_long()) {
            chunk.set_loaded(true);
        }
    }

    /// Moves dropped holders into the unload table, within the per-tick budget
    /// unless `flush` is set or the backlog is too long.
    pub fn process_unloads(&mut self, flush: bool) {
        let candidates: Vec<u64> = self.map.to_drop.iter().copied().collect();
        let mut dropped = 0;
        for pos in candidates {
            if !(flush || dropped < self.unloads_per_tick || self.map.to_drop.len() > self.unload_backlog) {
                break;
            }
            self.map.to_drop.remove(&pos);
            if let Some(holder) = self.map.holders.remove(&pos) {
                let id = self.map.start_unload(pos, holder.clone());
                dropped += 1;
                self.schedule_unload(pos, id, holder);
            }
        }
        for pos in core::mem::take(&mut self.retry_unloads) {
            if let Some(pending) = self.map.pending_unloads.get(&pos) {
                let (id, holder) = (pending.id, pending.holder.clone());
                let chunk = holder.chunk_to_save().get_now().flatten();
                self.write_unload(pos, id, holder, chunk);
            }
        }
    }

    fn schedule_unload(&self, pos: u64, id: u64, holder: Arc<ChunkHolder>) {
        let to_save = holder.chunk_to_save();
        let waited = to_save.clone();
        let main = self.workers.main.clone();
        to_save.on_complete(move |_| main.submit(move |manager| manager.finish_unload(pos, id, holder, waited)));
    }

    fn finish_unload(
        &mut self,
        pos: u64,
        id: u64,
        holder: Arc<ChunkHolder>,
        waited: Completion<Option<ChunkAccessor>>,
    ) {
        // revived, or superseded by a later unload of the same holder
        if !self.map.is_unloading(pos, id) {
            return;
        }
        // something newer was folded in while we waited
        if !holder.chunk_to_save().ptr_eq(&waited) {
            self.schedule_unload(pos, id, holder);
            return;
        }
        let chunk = waited.get_now().flatten();
        if let Some(full) = chunk.as_ref().and_then(ChunkAccessor::as_full) {
            full.set_loaded(false);
        }
        self.in_world.remove(&pos);
        self.workers.listener.on_status_change(holder.pos(), None);
        self.write_unload(pos, id, holder, chunk);
    }

    /// Writes `chunk` if it changed, otherwise waits out a write that is
    /// still in flight. The holder leaves the unload table only once
    /// neither is left.
    fn write_unload(
        &mut self,
        pos: u64,
        id: u64,
        holder: Arc<ChunkHolder>,
        chunk: Option<ChunkAccessor>,
    ) {
        let written = chunk
            .and_then(|chunk| self.save_chunk(&chunk))
            .or_else(|| self.write_in_flight(pos));
        match written {
            None => self.drop_unloaded(pos, id),
            Some(written) => {
                let main = self.workers.main.clone();
                written.on_complete(move |&ok| {
                    main.submit(move |manager| manager.unload_written(pos, id, holder, ok))
                });
            }
        }
    }

    fn unload_written(&mut self, pos: u64, id: u64, holder: Arc<ChunkHolder>, ok: bool) {
        if !self.map.is_unloading(pos, id) {
            return;
        }
        if ok {
            let chunk = holder.chunk_to_save().get_now().flatten();
            self.write_unload(pos, id, holder, chunk);
        } else {
            self.retry_unloads.insert(pos);
        }
    }

    fn drop_unloaded(&mut self, pos: u64, id: u64) {
        if self.map.is_unloading(pos, id) {
            self.map.pending_unloads.remove(&pos);
            log::debug!("unloaded {}", ChunkPos::from_long(pos));
        }
    }

    fn write_in_flight(&self, pos: u64) -> Option<Completion<bool>> {
        self.writes.get(&pos).filter(|write| !write.is_done()).cloned()
    }

    /// Queues a write of `chunk` if it has changes. The result says whether it reached the store.
    fn save_chunk(&mut self, chunk: &ChunkAccessor) -> Option<Completion<bool>> {
        if !chunk.is_unsaved() || chunk.status() == ChunkStatus::EMPTY {
            return None;
        }
        chunk.set_unsaved(false);
        let pos = chunk.pos();
        let serialized = SerializedChunk::from_chunk(chunk, self.table());
        let written = Completion::new();
        let done = written.clone();
        let store = self.workers.store.clone();
        let chunk = chunk.clone();
        self.workers.loader.execute(Box::new(move || {
            let ok = match store.write(pos, &serialized) {
                Ok(()) => true,
                Err(source) => {
                    log::error!("{}", SaveFailure { pos, source });
                    chunk.set_unsaved(true);
                    false
                }
            };
            done.complete(ok);
        }));
        self.writes.retain(|_, write| !write.is_done());
        // the loader is serial, so this write lands after any earlier one for `pos`
        self.writes.insert(pos.to_long(), written.clone());
        Some(written)
    }

    /// Saves every full chunk that was accessible since the last save.
    ///
    /// With `flush`, waits for in-flight work on those chunks, unloads
    /// everything that is due and blocks until the writes are done.
    pub fn save_all(&mut self, flush: bool) {
        let holders: Vec<_> = self
            .map
            .holders
            .values()
            .filter(|holder| holder.was_accessible_since_last_save())
            .cloned()
            .collect();
        if !flush {
            for holder in holders {
                if let Some(Some(chunk)) = holder.chunk_to_save().get_now() {
                    if chunk.as_full().is_some() {
                        self.save_chunk(&chunk);
                        holder.refresh_accessibility();
                    }
                }
            }
            return;
        }

        for holder in &holders {
            holder.refresh_accessibility();
        }
        loop {
            let mut saved = false;
            for holder in &holders {
                let chunk = self.settled_chunk_to_save(holder);
                if let Some(chunk) = chunk.filter(|chunk| chunk.as_full().is_some()) {
                    saved |= self.save_chunk(&chunk).is_some();
                }
            }
            if !saved {
                break;
            }
        }
        self.process_unloads(true);
        self.managed_block(|manager| {
            manager.writes.retain(|_, write| !write.is_done());
            let retrying = &manager.retry_unloads;
            manager.writes.is_empty() && manager.map.pending_unloads.keys().all(|pos| retrying.contains(pos))
        });
        if !self.retry_unloads.is_empty() {
            log::warn!("{} chunks could not be written and stay in memory", self.retry_unloads.len());
        }
        if let Err(e) = self.workers.store.flush() {
            log::error!("failed to flush chunk storage: {e}");
        }
    }

    fn settled_chunk_to_save(&mut self, holder: &Arc<ChunkHolder>) -> Option<ChunkAccessor> {
        loop {
            let future = holder.chunk_to_save();
            self.managed_block(|_| future.is_done());
            if future.ptr_eq(&holder.chunk_to_save()) {
                return future.get_now().flatten();
            }
        }
    }

    /// Keeps the tick thread's inbox, and the pool where it allows, moving until `done`.
    pub fn managed_block(&mut self, mut done: impl FnMut(&mut Self) -> bool) {
        while !done(self) {
            let ran = self.run_main_tasks() + self.executor.help();
            if ran == 0 {
                std::thread::sleep(time::Duration::from_millis(1));
            }
        }
    }

    /// Saves and unloads everything that can go, then stops the queues.
    pub fn close(&mut self) {
        log::info!("Saving chunks");
        self.save_all(true);
        self.tickets.close();
        self.workers.sorter.close();
        for mailbox in &self.workers.mailboxes {
            mailbox.close();
        }
        log::info!("Closed chunk manager with {} holders left", self.map.holders.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_counts_full_chunks_in_range() {
        let full = ChunkStatus::from_index(3);
        let logger = ProgressLogger::new(ChunkPos::new(0, 0), 1, full);
        logger.on_status_change(ChunkPos::new(1, 1), Some(full));
        logger.on_status_change(ChunkPos::new(5, 0), Some(full));
        logger.on_status_change(ChunkPos::new(0, 0), Some(ChunkStatus::from_index(2)));
        assert_eq!(logger.progress(), 100 / 9);
        for pos in ChunkPos::new(0, 0).square(1) {
            logger.on_status_change(pos, Some(full));
        }
        assert_eq!(logger.progress(), 100);
    }

    #[test]
    fn view_distance_is_padded_and_clamped() {
        assert_eq!(effective_view_distance(10), 11);
        assert_eq!(effective_view_distance(0), 3);
        assert_eq!(effective_view_distance(40), MAX_VIEW_DISTANCE);
    }

    #[test]
    fn center_full_needs_a_promoted_chunk() {
        let proto = Arc::new(ProtoChunk::new(ChunkPos::new(0, 0)));
        let chunks = vec![ChunkAccessor::Proto(proto.clone())];
        assert!(matches!(center_full(Ok(chunks)), Err(LoadFailure::Unloaded)));
        let full = Arc::new(LevelChunk::wrap(proto, ChunkStatus::from_index(3)));
        let chunks = vec![ChunkAccessor::Full(full.clone())];
        assert!(Arc::ptr_eq(&center_full(Ok(chunks)).unwrap(), &full));
    }

    #[test]
    fn panics_become_messages() {
        let panic = catch_unwind(|| panic!("boom {}", 3)).unwrap_err();
        assert_eq!(panic_message(panic), "boom 3");
        let panic = catch_unwind(|| panic!("static")).unwrap_err();
        assert_eq!(panic_message(panic), "static");
    }
}
