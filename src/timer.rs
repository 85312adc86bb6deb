//! Hierarchical timing wheel.
//!
//! The wheel runs on a logical millisecond clock which only moves through `advance_clock`.
//! Level 0 has a tick of 1ms and `wheel_size` buckets; each higher level has a tick equal to
//! the full span of the level below it and is created lazily when a task is scheduled beyond
//! the span of every existing level. Bucket expirations are tracked in a min-heap, and when a
//! bucket expires its entries are re-inserted against the new clock value, cascading down into
//! finer levels until they are due.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashSet};
use std::panic::{catch_unwind, AssertUnwindSafe};

/// The id of a task scheduled on a timing wheel.
pub type TimerId = u64;

/// A task to be executed once its delay has elapsed.
pub struct TimerTask {
    delay_ms: u64,
    action: Box<dyn FnOnce() + Send + 'static>,
}

impl TimerTask {
    /// Create a new task which will run `action` once `delay_ms` has elapsed on the wheel.
    pub fn new<F>(delay_ms: u64, action: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self { delay_ms, action: Box::new(action) }
    }

    pub fn delay_ms(&self) -> u64 {
        self.delay_ms
    }
}

struct Entry {
    id: TimerId,
    expiration: u64,
    action: Box<dyn FnOnce() + Send + 'static>,
}

#[derive(Default)]
struct Bucket {
    /// The expiration of this bucket, `None` while the bucket is not scheduled.
    expiration: Option<u64>,
    entries: Vec<Entry>,
}

struct Level {
    tick_ms: u64,
    buckets: Vec<Bucket>,
}

impl Level {
    fn new(tick_ms: u64, wheel_size: usize) -> Self {
        Self {
            tick_ms,
            buckets: (0..wheel_size).map(|_| Bucket::default()).collect(),
        }
    }

    fn interval_ms(&self) -> u64 {
        self.tick_ms.saturating_mul(self.buckets.len() as u64)
    }
}

/// A hierarchical timing wheel.
///
/// A wheel has a single owner, all mutation goes through `&mut self`.
pub struct TimingWheel {
    wheel_size: usize,
    /// The current logical time of the wheel in milliseconds.
    current_time: u64,
    levels: Vec<Level>,
    /// Scheduled buckets as `(expiration, level, bucket)`.
    queue: BinaryHeap<Reverse<(u64, usize, usize)>>,
    /// The ids of all pending tasks, cancelled tasks are lazily dropped when their bucket expires.
    live: HashSet<TimerId>,
    next_id: TimerId,
    is_shutdown: bool,
}

impl TimingWheel {
    /// Create a new wheel with the given number of buckets per level.
    pub fn new(wheel_size: usize) -> Self {
        let wheel_size = wheel_size.max(2);
        Self {
            wheel_size,
            current_time: 0,
            levels: vec![Level::new(1, wheel_size)],
            queue: BinaryHeap::new(),
            live: HashSet::new(),
            next_id: 0,
            is_shutdown: false,
        }
    }

    /// Schedule the given task, returning its id.
    ///
    /// The task never fires from within this call, even with a delay of 0; it becomes due on the
    /// next `advance_clock`. Returns `None` if the wheel has been shut down.
    pub fn add(&mut self, task: TimerTask) -> Option<TimerId> {
        if self.is_shutdown {
            tracing::warn!("timing wheel is shut down, dropping task");
            return None;
        }
        let id = self.next_id;
        self.next_id += 1;
        self.live.insert(id);
        let entry = Entry {
            id,
            expiration: self.current_time.saturating_add(task.delay_ms),
            action: task.action,
        };
        self.insert(entry);
        Some(id)
    }

    /// Cancel the task with the given id, returning `true` if it was still pending.
    pub fn cancel(&mut self, id: TimerId) -> bool {
        self.live.remove(&id)
    }

    /// The number of pending tasks.
    pub fn size(&self) -> usize {
        self.live.len()
    }

    /// The current logical time of the wheel.
    pub fn current_time(&self) -> u64 {
        self.current_time
    }

    /// Advance the wheel's clock by `step_ms`, firing every task which has become due.
    ///
    /// Due tasks fire in order of their due time, ties broken by insertion order. A panicking
    /// task is logged and does not prevent the remaining due tasks from firing. Returns the number
    /// of tasks fired.
    pub fn advance_clock(&mut self, step_ms: u64) -> usize {
        if self.is_shutdown {
            return 0;
        }
        let target = self.current_time.saturating_add(step_ms);
        let mut due = Vec::new();
        while let Some(Reverse((expiration, level, idx))) = self.queue.peek().copied() {
            if expiration > target {
                break;
            }
            self.queue.pop();
            let bucket = &mut self.levels[level].buckets[idx];
            if bucket.expiration != Some(expiration) {
                continue;
            }
            bucket.expiration = None;
            let entries = std::mem::take(&mut bucket.entries);
            self.current_time = self.current_time.max(expiration);
            for entry in entries {
                if !self.live.contains(&entry.id) {
                    continue;
                }
                if entry.expiration <= self.current_time {
                    due.push(entry);
                } else {
                    self.insert(entry);
                }
            }
        }
        self.current_time = target;

        due.sort_by_key(|entry| (entry.expiration, entry.id));
        let fired = due.len();
        for entry in due {
            self.live.remove(&entry.id);
            if let Err(panic) = catch_unwind(AssertUnwindSafe(entry.action)) {
                let reason = panic
                    .downcast_ref::<&str>()
                    .map(|val| val.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_default();
                tracing::error!(timer_id = entry.id, %reason, "timer task panicked");
            }
        }
        fired
    }

    /// Shut down the wheel, dropping all pending tasks without firing them.
    pub fn shutdown(&mut self) {
        self.is_shutdown = true;
        self.queue.clear();
        self.live.clear();
        self.levels.truncate(1);
        for bucket in self.levels[0].buckets.iter_mut() {
            bucket.expiration = None;
            bucket.entries.clear();
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.is_shutdown
    }

    /// Place the given entry in the finest level able to hold it.
    fn insert(&mut self, entry: Entry) {
        let mut level = 0;
        loop {
            if level == self.levels.len() {
                let tick_ms = self.levels[level - 1].interval_ms();
                self.levels.push(Level::new(tick_ms, self.wheel_size));
            }
            let lvl = &self.levels[level];
            let level_time = self.current_time - (self.current_time % lvl.tick_ms);
            // The top level always accepts once its span saturates.
            if entry.expiration < level_time.saturating_add(lvl.interval_ms()) || lvl.interval_ms() == u64::MAX {
                break;
            }
            level += 1;
        }

        let wheel_size = self.wheel_size as u64;
        let lvl = &mut self.levels[level];
        let virtual_id = entry.expiration / lvl.tick_ms;
        let idx = (virtual_id % wheel_size) as usize;
        let bucket_expiration = virtual_id * lvl.tick_ms;
        let bucket = &mut lvl.buckets[idx];
        bucket.entries.push(entry);
        if bucket.expiration != Some(bucket_expiration) {
            bucket.expiration = Some(bucket_expiration);
            self.queue.push(Reverse((bucket_expiration, level, idx)));
        }
    }
}
