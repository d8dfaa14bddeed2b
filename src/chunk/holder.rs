use super::{ChunkAccessor, ChunkStatus, FullChunkStatus, LevelChunk};
use crate::completion::Completion;
use crate::error::LoadFailure;
use crate::manager::ChunkManager;
use crate::prelude::*;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

pub type ChunkResult = Result<ChunkAccessor, LoadFailure>;
pub type FullResult = Result<Arc<LevelChunk>, LoadFailure>;
pub type ChunkFuture = Completion<ChunkResult>;
pub type FullFuture = Completion<FullResult>;

pub fn unloaded<T: Clone + Send + 'static>() -> Completion<Result<T, LoadFailure>> {
    Completion::completed(Err(LoadFailure::Unloaded))
}

/// Everything the engine knows about one chunk position while it is loaded
/// or loading.
///
/// Only the tick thread calls the scheduling methods; workers only ever see
/// the futures handed out here.
pub struct ChunkHolder {
    pos: ChunkPos,
    ticket_level: AtomicU32,
    old_ticket_level: AtomicU32,
    // level the sorters currently file this chunk's tasks under
    queue_level: AtomicU32,
    futures: Mutex<Vec<Option<ChunkFuture>>>,
    full_chunk: Mutex<FullFuture>,
    ticking: Mutex<FullFuture>,
    entity_ticking: Mutex<FullFuture>,
    chunk_to_save: Mutex<Completion<Option<ChunkAccessor>>>,
    accessible_since_save: AtomicBool,
    promoted: Mutex<Option<Arc<LevelChunk>>>,
}

impl core::fmt::Debug for ChunkHolder {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ChunkHolder")
            .field("pos", &self.pos)
            .field("ticket_level", &self.ticket_level())
            .finish_non_exhaustive()
    }
}

impl ChunkHolder {
    /// `untracked` is the level a position has before any ticket reaches it.
    pub fn new(pos: ChunkPos, level: u32, untracked: u32, status_count: usize) -> Self {
        Self {
            pos,
            ticket_level: AtomicU32::new(level),
            old_ticket_level: AtomicU32::new(untracked),
            queue_level: AtomicU32::new(untracked),
            futures: Mutex::new(vec![None; status_count]),
            full_chunk: Mutex::new(unloaded()),
            ticking: Mutex::new(unloaded()),
            entity_ticking: Mutex::new(unloaded()),
            chunk_to_save: Mutex::new(Completion::completed(None)),
            accessible_since_save: AtomicBool::new(false),
            promoted: Mutex::new(None),
        }
    }

    pub fn pos(&self) -> ChunkPos {
        self.pos
    }
    pub fn ticket_level(&self) -> u32 {
        self.ticket_level.load(Ordering::Acquire)
    }
    pub fn set_ticket_level(&self, level: u32) {
        self.ticket_level.store(level, Ordering::Release);
    }
    pub fn old_ticket_level(&self) -> u32 {
        self.old_ticket_level.load(Ordering::Acquire)
    }
    pub fn queue_level(&self) -> u32 {
        self.queue_level.load(Ordering::Acquire)
    }
    pub fn set_queue_level(&self, level: u32) {
        self.queue_level.store(level, Ordering::Release);
    }

    pub fn full_chunk_future(&self) -> FullFuture {
        self.full_chunk.lock().clone()
    }
    pub fn ticking_future(&self) -> FullFuture {
        self.ticking.lock().clone()
    }
    pub fn entity_ticking_future(&self) -> FullFuture {
        self.entity_ticking.lock().clone()
    }
    pub fn chunk_to_save(&self) -> Completion<Option<ChunkAccessor>> {
        self.chunk_to_save.lock().clone()
    }
    pub fn ticking_chunk(&self) -> Option<Arc<LevelChunk>> {
        self.ticking_future().get_now().and_then(Result::ok)
    }
    pub fn was_accessible_since_last_save(&self) -> bool {
        self.accessible_since_save.load(Ordering::Acquire)
    }
    pub fn refresh_accessibility(&self) {
        let accessible = FullChunkStatus::from_level(self.ticket_level()) >= FullChunkStatus::Border;
        self.accessible_since_save.store(accessible, Ordering::Release);
    }

    /// The future for `status`, or an unloaded one if the level cannot reach it.
    pub fn future_if_present(&self, status: ChunkStatus, manager: &ChunkManager) -> ChunkFuture {
        if manager.table().status_for_level(self.ticket_level()) >= status {
            self.future_if_present_unchecked(status)
        } else {
            unloaded()
        }
    }
    pub fn future_if_present_unchecked(&self, status: ChunkStatus) -> ChunkFuture {
        self.futures.lock()[status.index()].clone().unwrap_or_else(unloaded)
    }

    /// Furthest chunk this holder has produced so far.
    pub fn last_available(&self) -> Option<ChunkAccessor> {
        let futures = self.futures.lock();
        futures.iter().rev().flatten().find_map(|future| future.get_now().and_then(Result::ok))
    }

    /// Hands out the one future that builds `status` for this chunk.
    ///
    /// A pending or successful future is always reused. A failed one is
    /// replaced once the ticket level allows the status again.
    pub fn get_or_schedule_future(
        self: &Arc<Self>,
        status: ChunkStatus,
        manager: &mut ChunkManager,
    ) -> ChunkFuture {
        let existing = self.futures.lock()[status.index()].clone();
        if let Some(future) = &existing {
            if !matches!(future.get_now(), Some(Err(_))) {
                return future.clone();
            }
        }
        if manager.table().status_for_level(self.ticket_level()) >= status {
            let future = manager.schedule(self, status);
            self.update_chunk_to_save(future.clone());
            self.futures.lock()[status.index()] = Some(future.clone());
            return future;
        }
        existing.unwrap_or_else(unloaded)
    }

    /// Makes saving wait for `future`, and save its chunk if it produces one.
    pub fn update_chunk_to_save(&self, future: ChunkFuture) {
        let mut to_save = self.chunk_to_save.lock();
        *to_save = to_save.combine(&future, |previous, result| match result {
            Ok(chunk) => Some(chunk),
            Err(_) => previous,
        });
    }

    /// Points every finished proto result at the promoted chunk.
    pub fn replace_proto(&self, full: &Arc<LevelChunk>) {
        {
            let mut futures = self.futures.lock();
            for slot in futures.iter_mut().flatten() {
                if let Some(Ok(ChunkAccessor::Proto(_))) = slot.get_now() {
                    *slot = Completion::completed(Ok(ChunkAccessor::Full(full.clone())));
                }
            }
        }
        self.update_chunk_to_save(Completion::completed(Ok(ChunkAccessor::Full(full.clone()))));
    }

    /// Wraps the proto chunk into its full form. Only the first call wraps;
    /// every later call gets the same chunk back.
    pub fn promote(&self, chunk: ChunkAccessor, full_status: ChunkStatus) -> Arc<LevelChunk> {
        let mut promoted = self.promoted.lock();
        if let Some(full) = &*promoted {
            return full.clone();
        }
        let full = match chunk {
            ChunkAccessor::Full(full) => full,
            ChunkAccessor::Proto(proto) => {
                let full = Arc::new(LevelChunk::wrap(proto, full_status));
                self.replace_proto(&full);
                full
            }
        };
        *promoted = Some(full.clone());
        full
    }

    /// The scheduling pass, run after the ticket level changed.
    pub fn update_futures(self: &Arc<Self>, manager: &mut ChunkManager) {
        let table = manager.table().clone();
        let old_level = self.old_ticket_level();
        let level = self.ticket_level();
        let old_status = table.status_for_level(old_level);
        let new_status = table.status_for_level(level);
        let was_loaded = old_level <= table.max_chunk_distance();
        let is_loaded = level <= table.max_chunk_distance();
        let old_full = FullChunkStatus::from_level(old_level);
        let new_full = FullChunkStatus::from_level(level);

        if was_loaded {
            // statuses the level no longer funds, and that nobody asked for, fail for good
            let from = if is_loaded { new_status.index() + 1 } else { 0 };
            let mut futures = self.futures.lock();
            for slot in futures.iter_mut().take(old_status.index() + 1).skip(from) {
                if slot.is_none() {
                    *slot = Some(unloaded());
                }
            }
        }

        let was_border = old_full >= FullChunkStatus::Border;
        let is_border = new_full >= FullChunkStatus::Border;
        if is_border {
            self.accessible_since_save.store(true, Ordering::Release);
        }
        if !was_border && is_border {
            let future = manager.prepare_accessible(self);
            self.schedule_full_promotion(manager, &future, FullChunkStatus::Border);
            *self.full_chunk.lock() = future.clone();
            self.update_chunk_to_save(as_chunk_future(&future));
        }
        if was_border && !is_border {
            let old = core::mem::replace(&mut *self.full_chunk.lock(), unloaded());
            self.update_chunk_to_save(as_chunk_future(&old));
        }

        let was_ticking = old_full >= FullChunkStatus::Ticking;
        let is_ticking = new_full >= FullChunkStatus::Ticking;
        if !was_ticking && is_ticking {
            let future = manager.prepare_ticking(self);
            self.schedule_full_promotion(manager, &future, FullChunkStatus::Ticking);
            *self.ticking.lock() = future.clone();
            self.update_chunk_to_save(as_chunk_future(&future));
        }
        if was_ticking && !is_ticking {
            let old = core::mem::replace(&mut *self.ticking.lock(), unloaded());
            old.complete(Err(LoadFailure::Unloaded));
        }

        let was_entity_ticking = old_full >= FullChunkStatus::EntityTicking;
        let is_entity_ticking = new_full >= FullChunkStatus::EntityTicking;
        if !was_entity_ticking && is_entity_ticking {
            let future = manager.prepare_entity_ticking(self.pos);
            self.schedule_full_promotion(manager, &future, FullChunkStatus::EntityTicking);
            *self.entity_ticking.lock() = future;
        }
        if was_entity_ticking && !is_entity_ticking {
            let old = core::mem::replace(&mut *self.entity_ticking.lock(), unloaded());
            old.complete(Err(LoadFailure::Unloaded));
        }

        if new_full < old_full {
            manager.listener().on_full_status(self.pos, new_full);
        }

        let reader = self.clone();
        let writer = self.clone();
        manager.sorter().on_level_change(
            self.pos.to_long(),
            move || reader.queue_level(),
            level,
            move |level| writer.set_queue_level(level),
        );
        self.old_ticket_level.store(level, Ordering::Release);
    }

    fn schedule_full_promotion(
        &self,
        manager: &ChunkManager,
        future: &FullFuture,
        status: FullChunkStatus,
    ) {
        let pos = self.pos;
        let main = manager.main().clone();
        future.on_complete(move |result| {
            if result.is_ok() {
                main.submit(move |manager| manager.listener().on_full_status(pos, status));
            }
        });
    }
}

fn as_chunk_future(future: &FullFuture) -> ChunkFuture {
    future.map(|result| result.map(ChunkAccessor::Full))
}
