//! Funnels every change to the worker queues through one serial actor.
//!
//! Producers never touch a [`PriorityTaskQueue`] directly: submissions,
//! level changes and releases are messages on the sorter's mailbox, so a
//! resort always lands before the next pop of the same queue.

mod queue;

pub use queue::{PriorityTaskQueue, TaskList};

use crate::executor::{Executor, FnExecutor, Job, Mailbox};
use crate::prelude::*;

/// Index of one worker queue inside its [`TaskSorter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueueId(usize);

struct Worker {
    queue: PriorityTaskQueue<Job>,
    executor: Arc<dyn Executor>,
    // nothing was ready at the last poll; the next submission polls again
    sleeping: bool,
}

pub struct SorterState {
    workers: Vec<Worker>,
}

#[derive(Clone)]
pub struct TaskSorter {
    mailbox: Arc<Mailbox<SorterState>>,
}

impl TaskSorter {
    /// One queue per worker, in the order given; the returned ids index them.
    pub fn new(
        name: &str,
        workers: Vec<(&str, Arc<dyn Executor>)>,
        executor: Arc<dyn Executor>,
        level_count: usize,
        max_tasks: usize,
    ) -> (Self, Vec<QueueId>) {
        let ids = (0..workers.len()).map(QueueId).collect();
        let workers = workers
            .into_iter()
            .map(|(worker, executor)| Worker {
                queue: PriorityTaskQueue::new(format!("{worker}_queue"), level_count, max_tasks),
                executor,
                sleeping: true,
            })
            .collect();
        let mailbox = Mailbox::new(name, SorterState { workers }, executor);
        (Self { mailbox }, ids)
    }

    pub fn backlog(&self) -> usize {
        self.mailbox.backlog()
    }

    /// Queues `job` for chunk `pos`, filed under whatever `level` reports
    /// once the sorter gets to it.
    pub fn submit(
        &self,
        queue: QueueId,
        pos: u64,
        level: impl FnOnce() -> u32 + Send + 'static,
        job: Job,
    ) {
        self.submit_with(queue, pos, level, job, false)
    }

    /// Like [`Self::submit`], but popping the job also takes one of the
    /// queue's slots for `pos` until [`Self::release`] gives it back.
    pub fn submit_blocking(
        &self,
        queue: QueueId,
        pos: u64,
        level: impl FnOnce() -> u32 + Send + 'static,
        job: Job,
    ) {
        self.submit_with(queue, pos, level, job, true)
    }

    fn submit_with(
        &self,
        queue: QueueId,
        pos: u64,
        level: impl FnOnce() -> u32 + Send + 'static,
        job: Job,
        add_blocker: bool,
    ) {
        let sorter = self.clone();
        self.mailbox.tell(move |state| {
            let worker = &mut state.workers[queue.0];
            let level = level();
            worker.queue.submit(pos, level, Some(job));
            if add_blocker {
                worker.queue.submit(pos, level, None);
            }
            if worker.sleeping {
                worker.sleeping = false;
                sorter.poll(state, queue);
            }
        });
    }

    /// Drops the blockers of `pos` (all of its tasks with `clear`), frees its
    /// slot, then runs `then` on the sorter.
    pub fn release(&self, queue: QueueId, pos: u64, clear: bool, then: Job) {
        let sorter = self.clone();
        self.mailbox.tell(move |state| {
            let worker = &mut state.workers[queue.0];
            worker.queue.release(pos, clear);
            if worker.sleeping {
                worker.sleeping = false;
                sorter.poll(state, queue);
            }
            then();
        });
    }

    /// Refiles everything queued for `pos` in every queue.
    pub fn on_level_change(
        &self,
        pos: u64,
        old_level: impl FnOnce() -> u32 + Send + 'static,
        new_level: u32,
        set_level: impl FnOnce(u32) + Send + 'static,
    ) {
        self.mailbox.tell(move |state| {
            let old_level = old_level();
            for worker in &mut state.workers {
                worker.queue.resort(old_level, pos, new_level);
            }
            set_level(new_level);
        });
    }

    /// An executor that files each job it is given under `pos` in `queue`.
    pub fn executor(
        &self,
        queue: QueueId,
        pos: u64,
        level: impl Fn() -> u32 + Send + Sync + 'static,
    ) -> Arc<dyn Executor> {
        let sorter = self.clone();
        let level = Arc::new(level);
        Arc::new(FnExecutor(move |job: Job| {
            let level = level.clone();
            sorter.submit(queue, pos, move || level(), job);
        }))
    }

    pub fn close(&self) {
        self.mailbox.close();
    }

    fn poll(&self, state: &mut SorterState, queue: QueueId) {
        let worker = &mut state.workers[queue.0];
        let Some((pos, tasks)) = worker.queue.pop() else {
            worker.sleeping = true;
            return;
        };
        log::trace!("{} hands out {} task(s) for {}", worker.queue.name(), tasks.len(), ChunkPos::from_long(pos));
        let batch = Arc::new(Batch {
            sorter: self.clone(),
            queue,
        });
        for task in tasks {
            match task {
                Some(job) => {
                    let batch = batch.clone();
                    worker.executor.execute(Box::new(move || {
                        job();
                        drop(batch);
                    }));
                }
                None => worker.queue.acquire(pos),
            }
        }
    }
}

// Polls the queue again once every job of a popped batch has run or been dropped.
struct Batch {
    sorter: TaskSorter,
    queue: QueueId,
}
impl Drop for Batch {
    fn drop(&mut self) {
        let sorter = self.sorter.clone();
        let queue = self.queue;
        self.sorter.mailbox.tell(move |state| sorter.poll(state, queue));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::ManualExecutor;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn sorter(max_tasks: usize) -> (Arc<ManualExecutor>, TaskSorter, QueueId) {
        let pool = ManualExecutor::new();
        let worker: Arc<dyn Executor> = pool.clone();
        let (sorter, ids) = TaskSorter::new("sorter", vec![("worker", worker)], pool.clone(), 10, max_tasks);
        (pool, sorter, ids[0])
    }

    fn log_job(log: &Arc<Mutex<Vec<&'static str>>>, entry: &'static str) -> Job {
        let log = log.clone();
        Box::new(move || log.lock().push(entry))
    }

    #[test]
    fn lower_levels_run_first() {
        let (pool, sorter, queue) = sorter(usize::MAX);
        let log = Arc::new(Mutex::new(vec![]));
        // the first submission wakes the queue, so park it behind a level-0 job
        sorter.submit(queue, 0, || 0, log_job(&log, "first"));
        sorter.submit(queue, 1, || 7, log_job(&log, "far"));
        sorter.submit(queue, 2, || 2, log_job(&log, "near"));
        pool.run_pending();
        assert_eq!(*log.lock(), vec!["first", "near", "far"]);
    }

    #[test]
    fn level_change_reorders_queued_work() {
        let (pool, sorter, queue) = sorter(usize::MAX);
        let log = Arc::new(Mutex::new(vec![]));
        sorter.submit(queue, 0, || 0, log_job(&log, "first"));
        sorter.submit(queue, 1, || 3, log_job(&log, "a"));
        sorter.submit(queue, 2, || 4, log_job(&log, "b"));
        let level = Arc::new(AtomicUsize::new(4));
        let l = level.clone();
        sorter.on_level_change(2, || 4, 1, move |new| l.store(new as usize, Ordering::SeqCst));
        pool.run_pending();
        assert_eq!(*log.lock(), vec!["first", "b", "a"]);
        assert_eq!(level.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn blocking_submissions_wait_for_release() {
        let (pool, sorter, queue) = sorter(1);
        let log = Arc::new(Mutex::new(vec![]));
        sorter.submit_blocking(queue, 1, || 1, log_job(&log, "one"));
        sorter.submit_blocking(queue, 2, || 1, log_job(&log, "two"));
        pool.run_pending();
        assert_eq!(*log.lock(), vec!["one"]);

        let released = Arc::new(Mutex::new(false));
        let r = released.clone();
        sorter.release(queue, 1, false, Box::new(move || *r.lock() = true));
        pool.run_pending();
        assert!(*released.lock());
        assert_eq!(*log.lock(), vec!["one", "two"]);
    }

    #[test]
    fn release_with_clear_drops_queued_jobs() {
        let (pool, sorter, queue) = sorter(1);
        let log = Arc::new(Mutex::new(vec![]));
        sorter.submit_blocking(queue, 1, || 1, log_job(&log, "one"));
        sorter.submit_blocking(queue, 2, || 1, log_job(&log, "two"));
        sorter.release(queue, 2, true, Box::new(|| {}));
        sorter.release(queue, 1, false, Box::new(|| {}));
        pool.run_pending();
        assert_eq!(*log.lock(), vec!["one"]);
    }

    #[test]
    fn sorter_executor_files_jobs_under_the_chunk() {
        let (pool, sorter, queue) = sorter(usize::MAX);
        let log = Arc::new(Mutex::new(vec![]));
        let executor = sorter.executor(queue, 5, || 3);
        executor.execute(log_job(&log, "via executor"));
        pool.run_pending();
        assert_eq!(*log.lock(), vec!["via executor"]);
    }
}
