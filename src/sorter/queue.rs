use crate::prelude::*;
use std::collections::BTreeMap;

/// Tasks for one chunk, in submission order. `None` is a blocker: popping it
/// acquires the chunk until someone releases it.
pub type TaskList<T> = Vec<Option<T>>;

struct Bucket<T> {
    // submission order of the chunks in this bucket
    order: BTreeMap<u64, u64>,
    tasks: FxHashMap<u64, (u64, TaskList<T>)>,
}
impl<T> Default for Bucket<T> {
    fn default() -> Self {
        Self {
            order: BTreeMap::new(),
            tasks: FxHashMap::default(),
        }
    }
}
impl<T> Bucket<T> {
    fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
    fn entry(&mut self, pos: u64, next_seq: &mut u64) -> &mut TaskList<T> {
        let order = &mut self.order;
        &mut self
            .tasks
            .entry(pos)
            .or_insert_with(|| {
                let seq = *next_seq;
                *next_seq += 1;
                order.insert(seq, pos);
                (seq, vec![])
            })
            .1
    }
    fn remove(&mut self, pos: u64) -> Option<TaskList<T>> {
        let (seq, tasks) = self.tasks.remove(&pos)?;
        self.order.remove(&seq);
        Some(tasks)
    }
    fn pop_first(&mut self) -> Option<(u64, TaskList<T>)> {
        let (_, pos) = self.order.pop_first()?;
        let (_, tasks) = self.tasks.remove(&pos)?;
        Some((pos, tasks))
    }
}

/// Per-level buckets of chunk tasks, lowest level first.
///
/// Not synchronised: a [`super::TaskSorter`] owns every queue and is the only
/// thing that touches them.
pub struct PriorityTaskQueue<T> {
    name: String,
    buckets: Vec<Bucket<T>>,
    first_queued: usize,
    acquired: FxHashSet<u64>,
    max_tasks: usize,
    next_seq: u64,
}

impl<T> PriorityTaskQueue<T> {
    /// Levels at or above `level_count - 1` all share the last bucket.
    pub fn new(name: impl Into<String>, level_count: usize, max_tasks: usize) -> Self {
        assert!(level_count > 0);
        Self {
            name: name.into(),
            buckets: (0..level_count).map(|_| Bucket::default()).collect(),
            first_queued: level_count,
            acquired: FxHashSet::default(),
            max_tasks,
            next_seq: 0,
        }
    }
    pub fn name(&self) -> &str {
        &self.name
    }
    pub fn has_work(&self) -> bool {
        self.first_queued < self.buckets.len()
    }
    /// Chunks currently holding a slot through a popped blocker.
    pub fn acquired(&self) -> usize {
        self.acquired.len()
    }

    fn bucket(&self, level: u32) -> usize {
        (level as usize).min(self.buckets.len() - 1)
    }
    fn skip_empty(&mut self) {
        while self.has_work() && self.buckets[self.first_queued].is_empty() {
            self.first_queued += 1;
        }
    }

    pub fn submit(&mut self, pos: u64, level: u32, task: Option<T>) {
        let bucket = self.bucket(level);
        self.buckets[bucket].entry(pos, &mut self.next_seq).push(task);
        self.first_queued = self.first_queued.min(bucket);
    }

    /// Moves everything queued for `pos` at `old_level` to `new_level`.
    pub fn resort(&mut self, old_level: u32, pos: u64, new_level: u32) {
        let old = self.bucket(old_level);
        let new = self.bucket(new_level);
        if old == new {
            return;
        }
        let Some(tasks) = self.buckets[old].remove(pos) else { return };
        if old == self.first_queued {
            self.skip_empty();
        }
        if !tasks.is_empty() {
            self.buckets[new].entry(pos, &mut self.next_seq).extend(tasks);
            self.first_queued = self.first_queued.min(new);
        }
    }

    /// Drops the chunk's blockers, or all of its tasks when `clear` is set,
    /// and gives back its slot.
    pub fn release(&mut self, pos: u64, clear: bool) {
        for bucket in &mut self.buckets {
            let Some((_, tasks)) = bucket.tasks.get_mut(&pos) else { continue };
            if clear {
                tasks.clear();
            } else {
                tasks.retain(Option::is_some);
            }
            if tasks.is_empty() {
                bucket.remove(pos);
            }
        }
        self.skip_empty();
        self.acquired.remove(&pos);
    }

    pub fn acquire(&mut self, pos: u64) {
        self.acquired.insert(pos);
    }

    /// Takes every task of the oldest chunk in the lowest non-empty bucket,
    /// unless the acquired slots are used up.
    pub fn pop(&mut self) -> Option<(u64, TaskList<T>)> {
        if self.acquired.len() >= self.max_tasks || !self.has_work() {
            return None;
        }
        let popped = self.buckets[self.first_queued].pop_first();
        self.skip_empty();
        popped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue(max_tasks: usize) -> PriorityTaskQueue<&'static str> {
        PriorityTaskQueue::new("test", 10, max_tasks)
    }

    #[test]
    fn pops_lowest_level_first_then_submission_order() {
        let mut q = queue(usize::MAX);
        q.submit(1, 5, Some("a"));
        q.submit(2, 3, Some("b"));
        q.submit(3, 5, Some("c"));
        q.submit(2, 3, Some("d"));
        assert_eq!(q.pop(), Some((2, vec![Some("b"), Some("d")])));
        assert_eq!(q.pop(), Some((1, vec![Some("a")])));
        assert_eq!(q.pop(), Some((3, vec![Some("c")])));
        assert_eq!(q.pop(), None);
        assert!(!q.has_work());
    }

    #[test]
    fn resort_moves_pending_tasks() {
        let mut q = queue(usize::MAX);
        q.submit(1, 2, Some("near"));
        q.submit(7, 8, Some("far"));
        q.resort(8, 7, 0);
        assert_eq!(q.pop(), Some((7, vec![Some("far")])));
        q.resort(2, 1, 9);
        assert_eq!(q.pop(), Some((1, vec![Some("near")])));
    }

    #[test]
    fn levels_past_the_end_share_the_last_bucket() {
        let mut q = queue(usize::MAX);
        q.submit(1, 40, Some("a"));
        q.submit(2, 9, Some("b"));
        assert_eq!(q.pop().map(|(pos, _)| pos), Some(1));
        assert_eq!(q.pop().map(|(pos, _)| pos), Some(2));
    }

    #[test]
    fn blockers_limit_concurrent_chunks() {
        let mut q = queue(2);
        for pos in 0..3 {
            q.submit(pos, 1, Some("grant"));
            q.submit(pos, 1, None);
        }
        for pos in 0..2 {
            let (popped, tasks) = q.pop().unwrap();
            assert_eq!(popped, pos);
            assert_eq!(tasks, vec![Some("grant"), None]);
            q.acquire(popped);
        }
        assert_eq!(q.pop(), None, "both slots are taken");
        q.release(0, false);
        assert_eq!(q.pop().map(|(pos, _)| pos), Some(2));
    }

    #[test]
    fn release_without_clear_keeps_real_tasks() {
        let mut q = queue(usize::MAX);
        q.submit(4, 1, Some("work"));
        q.submit(4, 1, None);
        q.release(4, false);
        assert_eq!(q.pop(), Some((4, vec![Some("work")])));

        q.submit(5, 1, Some("work"));
        q.release(5, true);
        assert!(!q.has_work());
    }
}
