use chunkserv::chunk::{
    ChunkAccessor, ChunkStatus, ProtoChunk, SerializedChunk, StatusDef, StatusTable, StatusTask,
};
use chunkserv::completion::Completion;
use chunkserv::error::LoadFailure;
use chunkserv::executor::ManualExecutor;
use chunkserv::generator::{Generator, SkyLight, WorldGenRegion};
use chunkserv::manager::{ChunkManager, Collaborators, NoopListener, ProgressLogger};
use chunkserv::storage::MemoryStore;
use chunkserv::ticket::{TicketKey, TicketKind, TicketRegistry};
use chunkserv::{ChunkPos, ServerConfig, World};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;

/// Five statuses, one of each task kind, reaching at most two rings out.
fn table() -> StatusTable {
    use StatusTask::*;
    let defs = vec![
        StatusDef::new("empty", 0, Passthrough),
        StatusDef::new("noise", 0, Generate),
        StatusDef::new("features", 1, Generate),
        StatusDef::new("light", 1, Light),
        StatusDef::new("full", 0, Full),
    ];
    StatusTable::new(defs, &["full", "features", "noise", "empty"]).unwrap()
}

/// Remembers every step it was asked to run.
#[derive(Default)]
struct Recorder {
    calls: Mutex<Vec<(ChunkPos, String)>>,
    // features runs that saw a neighbour without noise
    early: Mutex<Vec<ChunkPos>>,
    fail_at: Option<ChunkPos>,
}
impl Recorder {
    fn count(&self, pos: ChunkPos, status: &str) -> usize {
        self.calls.lock().iter().filter(|(p, s)| *p == pos && s == status).count()
    }
    fn count_status(&self, status: &str) -> usize {
        self.calls.lock().iter().filter(|(_, s)| s == status).count()
    }
}
impl Generator for Recorder {
    fn name(&self) -> &str {
        "recorder"
    }
    fn generate(&self, status: &str, region: &WorldGenRegion) -> Result<(), String> {
        let center = region.center();
        self.calls.lock().push((center, status.to_owned()));
        if status == "features" {
            if region.chunks().iter().any(|chunk| chunk.status().index() < 1) {
                self.early.lock().push(center);
            }
            if self.fail_at == Some(center) {
                return Err(format!("no room for a tree at {center}"));
            }
        }
        Ok(())
    }
}

struct Engine {
    manager: ChunkManager,
    pool: Arc<ManualExecutor>,
    store: Arc<MemoryStore>,
    recorder: Arc<Recorder>,
    table: Arc<StatusTable>,
}

impl Engine {
    fn new(recorder: Recorder) -> Self {
        Self::with(recorder, &config())
    }
    fn with(recorder: Recorder, config: &ServerConfig) -> Self {
        let pool = ManualExecutor::new();
        let store = MemoryStore::new();
        let recorder = Arc::new(recorder);
        let table = Arc::new(table());
        let collaborators = Collaborators {
            store: store.clone(),
            generator: recorder.clone(),
            light: Arc::new(SkyLight),
            listener: Arc::new(NoopListener),
            executor: pool.clone(),
        };
        let manager = ChunkManager::new(table.clone(), Arc::new(TicketRegistry::vanilla()), config, collaborators);
        Self {
            manager,
            pool,
            store,
            recorder,
            table,
        }
    }
    fn status(&self, name: &str) -> ChunkStatus {
        self.table.by_name(name).unwrap()
    }
    /// Runs the tick thread and the pool until neither has anything left.
    fn settle(&mut self) {
        for _ in 0..10_000 {
            let ran = self.manager.run_main_tasks() + self.pool.run_pending();
            let changed = self.manager.run_ticket_updates();
            if ran == 0 && !changed {
                return;
            }
        }
        panic!("engine never settled");
    }
    fn full_chunk(&self, pos: ChunkPos) -> Option<ChunkAccessor> {
        self.manager.get_chunk_now(pos, self.table.full())
    }
    fn entity_ticking(&self, pos: ChunkPos) -> bool {
        self.manager
            .holder(pos)
            .map_or(false, |holder| matches!(holder.entity_ticking_future().get_now(), Some(Ok(_))))
    }
}

fn config() -> ServerConfig {
    ServerConfig {
        view_distance: 2,
        player_ticket_throttle: 1,
        ..ServerConfig::default()
    }
}

#[test]
fn each_status_is_built_once_after_its_neighbours() {
    let mut engine = Engine::new(Recorder::default());
    let center = ChunkPos::new(3, -2);
    engine.manager.add_ticket(TicketKind::Forced, center, 33, TicketKey::Unit);
    engine.settle();

    // 33 at the centre fades to 37 four rings out
    assert_eq!(engine.manager.holder_count(), 81);
    let full = engine.full_chunk(center).expect("centre reached full");
    assert!(full.as_full().unwrap().is_loaded());
    assert!(full.data().lit);
    assert_eq!(engine.manager.loaded_chunk_count(), 1);

    let calls = engine.recorder.calls.lock().clone();
    let unique: HashSet<_> = calls.iter().cloned().collect();
    assert_eq!(unique.len(), calls.len(), "a step ran twice: {calls:?}");
    assert_eq!(engine.recorder.count_status("features"), 9);
    assert_eq!(engine.recorder.count_status("noise"), 25);
    assert!(engine.recorder.early.lock().is_empty());

    let features = engine.status("features");
    let holder = engine.manager.holder(center).unwrap();
    let first = holder.get_or_schedule_future(features, &mut engine.manager);
    let second = holder.get_or_schedule_future(features, &mut engine.manager);
    assert!(first.ptr_eq(&second));
}

#[test]
fn missing_neighbours_fail_the_range() {
    let mut engine = Engine::new(Recorder::default());
    let lone = ChunkPos::new(100, 100);
    engine.manager.add_ticket(TicketKind::Forced, lone, 37, TicketKey::Unit);
    engine.settle();
    assert_eq!(engine.manager.holder_count(), 1);

    // a level the tracker never spread to the neighbours
    let holder = engine.manager.holder(lone).unwrap();
    holder.set_ticket_level(33);
    let full = holder.get_or_schedule_future(engine.table.full(), &mut engine.manager);
    engine.settle();
    match full.get_now() {
        Some(Err(LoadFailure::UnloadedNeighbour { pos })) => assert_eq!(pos, ChunkPos::new(99, 99)),
        Some(Err(other)) => panic!("wrong failure: {other}"),
        Some(Ok(_)) => panic!("full resolved without neighbours"),
        None => panic!("full never resolved"),
    }
    assert_eq!(engine.recorder.count(lone, "features"), 0);
    assert!(engine.full_chunk(lone).is_none());

    // the lone holder itself can still load
    let empty = engine.manager.get_chunk_future(lone, ChunkStatus::EMPTY);
    engine.settle();
    assert!(matches!(empty.get_now(), Some(Ok(_))));
}

/// What an empty chunk at `pos` looks like on disk.
fn stored_empty(engine: &Engine, pos: ChunkPos) -> SerializedChunk {
    let proto = ChunkAccessor::Proto(Arc::new(ProtoChunk::new(pos)));
    SerializedChunk::from_chunk(&proto, &engine.table)
}

#[test]
fn unreadable_chunks_fail_instead_of_regenerating() {
    let mut engine = Engine::new(Recorder::default());
    let bogus = ChunkPos::new(4, 4);
    let mut chunk = stored_empty(&engine, bogus);
    chunk.status = "bogus".to_owned();
    engine.store.insert(chunk);
    let misfiled = ChunkPos::new(-3, 8);
    engine.store.insert_at(misfiled, stored_empty(&engine, ChunkPos::new(9, 9)));

    let noise = engine.status("noise");
    let bad_status = engine.manager.get_chunk_future(bogus, noise);
    let bad_pos = engine.manager.get_chunk_future(misfiled, noise);
    engine.settle();

    match bad_status.get_now() {
        Some(Err(LoadFailure::Corrupt { pos, reason })) => {
            assert_eq!(pos, bogus);
            assert!(reason.contains("bogus"), "{reason}");
        }
        Some(Err(other)) => panic!("wrong failure: {other}"),
        _ => panic!("a chunk with an unknown status loaded"),
    }
    match bad_pos.get_now() {
        Some(Err(LoadFailure::Corrupt { pos, reason })) => {
            assert_eq!(pos, misfiled);
            assert!(reason.contains("(9, 9)"), "{reason}");
        }
        Some(Err(other)) => panic!("wrong failure: {other}"),
        _ => panic!("a chunk stored under the wrong position loaded"),
    }
    assert_eq!(engine.recorder.count(bogus, "noise"), 0);
    assert_eq!(engine.recorder.count(misfiled, "noise"), 0);
    assert_eq!(engine.store.get(bogus).unwrap().status, "bogus");
}

#[test]
fn generation_failures_carry_a_crash_report() {
    let center = ChunkPos::new(-7, 4);
    let mut engine = Engine::new(Recorder {
        fail_at: Some(center),
        ..Recorder::default()
    });
    engine.manager.add_ticket(TicketKind::Forced, center, 33, TicketKey::Unit);
    engine.settle();

    let holder = engine.manager.holder(center).unwrap();
    let failed = holder.future_if_present_unchecked(engine.status("features")).get_now();
    let Some(Err(LoadFailure::Generation(failure))) = failed else {
        panic!("features should have failed with a report");
    };
    assert_eq!(failure.pos, center);
    assert_eq!(failure.report.title, "Exception generating new chunk");
    assert!(failure.report.cause.contains("no room for a tree"));
    let (section, details) = &failure.report.sections[0];
    assert_eq!(section, "Chunk to be generated");
    assert!(details.contains(&("Status".to_owned(), "features".to_owned())));
    assert!(details.contains(&("Generator".to_owned(), "recorder".to_owned())));
    assert!(failure.report.to_string().contains("Location: -7,4"));

    assert!(matches!(holder.full_chunk_future().get_now(), Some(Err(_))));
    assert!(engine.full_chunk(center).is_none());
    assert_eq!(engine.manager.loaded_chunk_count(), 0);
    // neighbours are unaffected
    assert_eq!(engine.recorder.count(center.offset(1, 0), "features"), 1);
}

#[test]
fn unloading_waits_for_late_work_and_writes_the_latest_chunk() {
    let mut engine = Engine::new(Recorder::default());
    let center = ChunkPos::new(0, 0);
    engine.manager.add_ticket(TicketKind::Forced, center, 33, TicketKey::Unit);
    engine.settle();
    let holder = engine.manager.holder(center).unwrap();
    let full = engine.full_chunk(center).unwrap();
    assert!(full.is_unsaved());

    engine.manager.remove_ticket(TicketKind::Forced, center, 33, TicketKey::Unit);
    engine.manager.run_ticket_updates();
    engine.manager.process_unloads(true);
    // work that lands after the unload was scheduled
    let late = Completion::new();
    holder.update_chunk_to_save(late.clone());
    engine.settle();

    assert_eq!(engine.manager.holder_count(), 0);
    assert_eq!(engine.manager.pending_unload_count(), 1);
    assert!(engine.store.get(center).is_none());
    assert!(engine.store.get(center.offset(2, 2)).is_some());

    full.proto().data_mut().features = 7;
    full.set_unsaved(true);
    late.complete(Ok(full.clone()));
    engine.settle();

    assert_eq!(engine.manager.pending_unload_count(), 0);
    let stored = engine.store.get(center).expect("centre was written on unload");
    assert_eq!(stored.status, "full");
    assert_eq!(stored.features, 7);
    assert!(!full.as_full().unwrap().is_loaded());
    assert_eq!(engine.manager.loaded_chunk_count(), 0);
}

#[test]
fn failed_writes_keep_chunks_until_a_retry_succeeds() {
    let mut engine = Engine::new(Recorder::default());
    let center = ChunkPos::new(5, 5);
    engine.manager.add_ticket(TicketKind::Forced, center, 33, TicketKey::Unit);
    engine.settle();

    engine.store.set_fail_writes(true);
    engine.manager.remove_ticket(TicketKind::Forced, center, 33, TicketKey::Unit);
    engine.manager.run_ticket_updates();
    engine.manager.process_unloads(true);
    engine.settle();
    // every chunk that got past empty is still waiting
    assert_eq!(engine.manager.pending_unload_count(), 25);
    assert!(engine.store.is_empty());

    engine.store.set_fail_writes(false);
    engine.manager.process_unloads(false);
    engine.settle();
    assert_eq!(engine.manager.pending_unload_count(), 0);
    assert_eq!(engine.store.len(), 25);
    assert_eq!(engine.store.writes(), 25);
}

#[test]
fn returning_before_the_unload_finishes_revives_the_holder() {
    let mut engine = Engine::new(Recorder::default());
    let center = ChunkPos::new(0, 0);
    engine.manager.add_ticket(TicketKind::Forced, center, 33, TicketKey::Unit);
    engine.settle();
    let holder = engine.manager.holder(center).unwrap();
    let full = engine.full_chunk(center).unwrap();

    engine.manager.remove_ticket(TicketKind::Forced, center, 33, TicketKey::Unit);
    engine.manager.run_ticket_updates();
    engine.manager.process_unloads(true);
    engine.manager.add_ticket(TicketKind::Forced, center, 33, TicketKey::Unit);
    engine.settle();

    let revived = engine.manager.holder(center).unwrap();
    assert!(Arc::ptr_eq(&holder, &revived));
    let again = engine.full_chunk(center).unwrap();
    assert!(again.same_chunk(&full));
    assert!(again.as_full().unwrap().is_loaded());
    assert_eq!(engine.recorder.count(center, "noise"), 1);
}

/// Drops `center`'s ticket and pushes every holder into the unload table.
fn unload(engine: &mut Engine, center: ChunkPos) {
    engine.manager.remove_ticket(TicketKind::Forced, center, 33, TicketKey::Unit);
    engine.manager.run_ticket_updates();
    engine.manager.process_unloads(true);
}

#[test]
fn unloading_again_after_a_revival_still_retries_failed_writes() {
    let mut engine = Engine::new(Recorder::default());
    let center = ChunkPos::new(0, 0);
    engine.manager.add_ticket(TicketKind::Forced, center, 33, TicketKey::Unit);
    engine.settle();
    let holder = engine.manager.holder(center).unwrap();
    let full = engine.full_chunk(center).unwrap();
    let late = Completion::new();
    holder.update_chunk_to_save(late.clone());

    unload(&mut engine, center);
    engine.manager.add_ticket(TicketKind::Forced, center, 33, TicketKey::Unit);
    engine.manager.run_ticket_updates();
    assert!(Arc::ptr_eq(&holder, &engine.manager.holder(center).unwrap()));
    unload(&mut engine, center);

    engine.store.set_fail_writes(true);
    engine.settle();
    full.proto().data_mut().features = 7;
    full.set_unsaved(true);
    late.complete(Ok(full.clone()));
    engine.settle();
    assert!(engine.store.get(center).is_none());
    assert!(full.is_unsaved());
    assert!(engine.manager.pending_unload_count() > 0);

    engine.store.set_fail_writes(false);
    engine.manager.process_unloads(false);
    engine.settle();
    assert_eq!(engine.manager.pending_unload_count(), 0);
    assert_eq!(engine.store.get(center).expect("retried write landed").features, 7);
    assert!(!full.is_unsaved());
}

#[test]
fn holders_stay_revivable_until_their_write_lands() {
    let mut engine = Engine::new(Recorder::default());
    let center = ChunkPos::new(0, 0);
    engine.manager.add_ticket(TicketKind::Forced, center, 33, TicketKey::Unit);
    engine.settle();
    let holder = engine.manager.holder(center).unwrap();
    let full = engine.full_chunk(center).unwrap();
    assert!(full.is_unsaved());
    let late = Completion::new();
    holder.update_chunk_to_save(late.clone());

    unload(&mut engine, center);
    engine.manager.add_ticket(TicketKind::Forced, center, 33, TicketKey::Unit);
    engine.manager.run_ticket_updates();
    unload(&mut engine, center);

    late.complete(Ok(full.clone()));
    // the unload callbacks run, the write sits on the loader
    engine.manager.run_main_tasks();
    assert!(engine.store.get(center).is_none());
    assert!(engine.manager.pending_unload_count() > 0);

    engine.manager.add_ticket(TicketKind::Forced, center, 33, TicketKey::Unit);
    engine.manager.run_ticket_updates();
    let revived = engine.manager.holder(center).expect("holder came back from the unload table");
    assert!(Arc::ptr_eq(&holder, &revived));

    engine.settle();
    assert!(engine.store.get(center).is_some());
    assert_eq!(engine.recorder.count(center, "noise"), 1);
}

#[test]
fn request_tickets_expire_and_chunks_reload_from_disk() {
    let mut engine = Engine::new(Recorder::default());
    let pos = ChunkPos::new(-5, 9);
    let noise = engine.status("noise");
    let requested = engine.manager.get_chunk_future(pos, noise);
    engine.settle();
    assert!(matches!(requested.get_now(), Some(Ok(_))));
    assert_eq!(engine.manager.tickets().ticket_level(pos), Some(35));
    assert_eq!(engine.manager.holder_count(), 25);

    // unknown tickets outlive exactly one purge
    engine.manager.tick(false);
    assert_eq!(engine.manager.holder_count(), 25);
    engine.manager.tick(false);
    engine.settle();
    assert_eq!(engine.manager.tickets().ticket_level(pos), None);
    assert_eq!(engine.manager.holder_count(), 0);
    assert_eq!(engine.manager.pending_unload_count(), 0);
    assert_eq!(engine.store.get(pos).unwrap().status, "noise");

    let again = engine.manager.get_chunk_future(pos, noise);
    engine.settle();
    let chunk = again.get_now().unwrap().unwrap();
    assert_eq!(chunk.status(), noise);
    assert_eq!(engine.recorder.count(pos, "noise"), 1);
}

#[test]
fn player_tickets_are_granted_one_at_a_time() {
    let mut engine = Engine::new(Recorder::default());
    let origin = ChunkPos::new(0, 0);
    // view distance 2 puts the chunks one ring around the player in view
    let in_view: Vec<_> = origin.square(1).collect();
    engine.manager.add_player(origin, 0);

    let mut most_outstanding = 0;
    for _ in 0..10_000 {
        let ran = engine.manager.run_main_tasks() + engine.pool.run_pending();
        let changed = engine.manager.run_ticket_updates();
        let outstanding = in_view
            .iter()
            .filter(|pos| engine.manager.tickets().has_player_ticket(pos.to_long()) && !engine.entity_ticking(**pos))
            .count();
        most_outstanding = most_outstanding.max(outstanding);
        if ran == 0 && !changed {
            break;
        }
    }
    assert!(most_outstanding <= 1, "{most_outstanding} player tickets were in flight at once");
    for pos in &in_view {
        assert!(engine.manager.tickets().has_player_ticket(pos.to_long()), "no ticket at {pos}");
        assert!(engine.entity_ticking(*pos), "{pos} is not entity ticking");
    }
    assert!(engine.manager.has_players_nearby(ChunkPos::new(8, -8)));
    assert!(!engine.manager.has_players_nearby(ChunkPos::new(9, 0)));
    assert_eq!(engine.manager.natural_spawn_chunk_count(), 17 * 17);

    engine.manager.remove_player(origin, 0);
    engine.settle();
    for pos in &in_view {
        assert!(!engine.manager.tickets().has_player_ticket(pos.to_long()));
    }
    assert!(!engine.manager.has_players_nearby(origin));
}

#[test]
fn saving_writes_changed_full_chunks_only_once() {
    let mut engine = Engine::new(Recorder::default());
    let center = ChunkPos::new(1, 1);
    engine.manager.add_ticket(TicketKind::Forced, center, 33, TicketKey::Unit);
    engine.settle();

    engine.manager.save_all(false);
    engine.settle();
    assert_eq!(engine.store.writes(), 1);
    assert!(engine.store.get(center).is_some());

    engine.manager.save_all(false);
    engine.settle();
    assert_eq!(engine.store.writes(), 1);
}

#[test]
fn world_tracks_what_players_can_see() {
    let pool = ManualExecutor::new();
    let store = MemoryStore::new();
    let table = Arc::new(table());
    let spawn = ChunkPos::new(0, 0);
    let progress = Arc::new(ProgressLogger::new(spawn, 1, table.full()));
    let collaborators = Collaborators {
        store: store.clone(),
        generator: Arc::new(Recorder::default()),
        light: Arc::new(SkyLight),
        listener: progress.clone(),
        executor: pool.clone(),
    };
    let config = config();
    let manager = ChunkManager::new(table, Arc::new(TicketRegistry::vanilla()), &config, collaborators);
    let mut world = World::new(manager, &config);

    world.prepare_spawn(spawn, 1);
    assert_eq!(progress.progress(), 100);
    assert!(world.chunk_at(spawn).unwrap().is_loaded());

    let pid = world.login("walker", 8.0, 8.0, None);
    let mut tick = 0;
    while world.visible(pid).unwrap().len() < 25 && tick < 2_000 {
        pool.run_pending();
        tick += 1;
        world.tick_until(tick);
    }
    assert_eq!(world.visible(pid).unwrap().len(), 25);

    world.request_move(pid, 200.0, 8.0);
    let target = ChunkPos::new(12, 0);
    assert_eq!(world.player_chunk(pid), Some(target));
    let limit = tick + 2_000;
    while !world.visible(pid).unwrap().contains(&target) && tick < limit {
        pool.run_pending();
        tick += 1;
        world.tick_until(tick);
    }
    let visible = world.visible(pid).unwrap();
    assert!(visible.contains(&target));
    assert!(visible.iter().all(|pos| pos.chebyshev(target) <= 2));

    world.logout(pid);
    assert_eq!(world.player_count(), 0);
    world.close();
    assert!(store.get(spawn).is_some());
}
