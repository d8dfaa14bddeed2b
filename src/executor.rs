//! Where jobs run: the shared worker pool, serial mailboxes on top of it,
//! and a hand-cranked queue for deterministic tests.

use crate::prelude::*;
use crossbeam_channel::{Receiver, Sender};
use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Weak;

pub type Job = Box<dyn FnOnce() + Send>;

pub trait Executor: Send + Sync {
    fn execute(&self, job: Job);
    /// Runs queued jobs on the calling thread, for executors that allow it.
    /// Returns how many ran.
    fn help(&self) -> usize {
        0
    }
}

/// Adapts a closure into an [`Executor`].
pub struct FnExecutor<F>(pub F);
impl<F: Fn(Job) + Send + Sync> Executor for FnExecutor<F> {
    fn execute(&self, job: Job) {
        (self.0)(job)
    }
}

/// The bounded thread pool every queue in the engine ends up running on.
pub struct WorkerPool {
    pool: rayon::ThreadPool,
}
impl WorkerPool {
    /// `threads == 0` lets rayon pick one per core.
    pub fn new(threads: usize) -> Result<Self, rayon::ThreadPoolBuildError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("chunk-worker-{i}"))
            .panic_handler(|_| log::error!("worker job panicked"))
            .build()?;
        Ok(Self { pool })
    }
    pub fn threads(&self) -> usize {
        self.pool.current_num_threads()
    }
}
impl Executor for WorkerPool {
    fn execute(&self, job: Job) {
        self.pool.spawn(job);
    }
}

/// Jobs queue up until someone calls [`ManualExecutor::run_pending`].
#[derive(Default)]
pub struct ManualExecutor {
    jobs: Mutex<VecDeque<Job>>,
}
impl ManualExecutor {
    pub fn new() -> Arc<Self> {
        Arc::default()
    }
    pub fn pending(&self) -> usize {
        self.jobs.lock().len()
    }
    /// Runs jobs, including ones queued while running, until none are left.
    pub fn run_pending(&self) -> usize {
        let mut ran = 0;
        loop {
            let job = self.jobs.lock().pop_front();
            match job {
                Some(job) => {
                    job();
                    ran += 1;
                }
                None => return ran,
            }
        }
    }
}
impl Executor for ManualExecutor {
    fn execute(&self, job: Job) {
        self.jobs.lock().push_back(job);
    }
    fn help(&self) -> usize {
        self.run_pending()
    }
}

pub type Message<S> = Box<dyn FnOnce(&mut S) + Send>;

// messages handled per drain before yielding the pool thread
const BATCH: usize = 1000;

/// A serial actor: messages run one at a time, in the order they were told,
/// against state nobody else can touch.
///
/// At most one drain job is queued on the executor at any moment.
pub struct Mailbox<S> {
    name: String,
    me: Weak<Mailbox<S>>,
    state: Mutex<S>,
    tx: Sender<Message<S>>,
    rx: Receiver<Message<S>>,
    scheduled: AtomicBool,
    closed: AtomicBool,
    executor: Arc<dyn Executor>,
}

impl<S: Send + 'static> Mailbox<S> {
    pub fn new(name: impl Into<String>, state: S, executor: Arc<dyn Executor>) -> Arc<Self> {
        let (tx, rx) = crossbeam_channel::unbounded();
        Arc::new_cyclic(|me| Self {
            name: name.into(),
            me: me.clone(),
            state: Mutex::new(state),
            tx,
            rx,
            scheduled: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            executor,
        })
    }
    pub fn name(&self) -> &str {
        &self.name
    }
    pub fn backlog(&self) -> usize {
        self.rx.len()
    }
    pub fn tell(&self, message: impl FnOnce(&mut S) + Send + 'static) {
        if self.tx.send(Box::new(message)).is_err() {
            log::warn!("{} dropped a message", self.name);
            return;
        }
        self.schedule();
    }
    /// Stops scheduling drains. Messages already queued are dropped with the mailbox.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    fn schedule(&self) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        if !self.scheduled.swap(true, Ordering::AcqRel) {
            match self.me.upgrade() {
                Some(me) => self.executor.execute(Box::new(move || me.run())),
                None => self.scheduled.store(false, Ordering::Release),
            }
        }
    }

    fn run(&self) {
        {
            let mut state = self.state.lock();
            for _ in 0..BATCH {
                let Ok(message) = self.rx.try_recv() else { break };
                if catch_unwind(AssertUnwindSafe(|| message(&mut state))).is_err() {
                    log::error!("{} message panicked", self.name);
                }
            }
        }
        self.scheduled.store(false, Ordering::Release);
        // a sender may have seen `scheduled` still set and skipped waking us
        if !self.rx.is_empty() {
            self.schedule();
        }
    }
}

impl Executor for Mailbox<()> {
    fn execute(&self, job: Job) {
        self.tell(move |_| job());
    }
}
