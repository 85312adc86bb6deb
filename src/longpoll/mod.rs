//! Pull request long polling.
//!
//! Pull requests which find no messages may be held instead of being answered empty. A held
//! request is resumed exactly once, either when new messages arrive on its queue or when its
//! deadline passes. Resumed requests are resubmitted through the dispatch table's pull queue
//! with suspension disallowed, so they are always answered on their second pass.


use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::Result;
use futures::stream::StreamExt;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_stream::wrappers::BroadcastStream;
use uuid::Uuid;

use crate::config::Config;
use crate::dispatch::{DispatchTable, RequestCategory, RequestTask};

const METRIC_HELD_REQUESTS: &str = "rop_longpoll_held_requests";

/// A listener of message arrivals on queues.
pub trait ArrivalListener: Send + Sync {
    /// Called after new messages have been written to the given queue.
    fn on_arrival(&self, topic: &str, queue_id: i32);
}

/// A pull request held until messages arrive or its deadline passes.
#[derive(Debug)]
pub struct HeldPullRequest {
    pub id: Uuid,
    pub task: RequestTask,
    /// The offset the request pulls from.
    pub pull_from_offset: i64,
    pub suspended_at: Instant,
    pub deadline: Instant,
}

impl HeldPullRequest {
    pub fn new(task: RequestTask, pull_from_offset: i64, hold: Duration) -> Self {
        let now = Instant::now();
        Self {
            id: Uuid::new_v4(),
            task,
            pull_from_offset,
            suspended_at: now,
            deadline: now + hold,
        }
    }
}

/// The service holding suspended pull requests, keyed by `{topic}@{queue_id}`.
pub struct PullRequestHoldService {
    held: Mutex<HashMap<String, Vec<HeldPullRequest>>>,
    dispatch: DispatchTable,
    check_interval: Duration,
}

impl PullRequestHoldService {
    /// Create a new instance.
    pub fn new(config: &Config, dispatch: DispatchTable) -> Self {
        metrics::describe_gauge!(METRIC_HELD_REQUESTS, metrics::Unit::Count, "the number of pull requests currently held");
        Self {
            held: Mutex::new(HashMap::new()),
            dispatch,
            check_interval: Duration::from_millis(config.pull_hold_check_interval_ms.max(1)),
        }
    }

    fn build_key(topic: &str, queue_id: i32) -> String {
        format!("{}@{}", topic, queue_id)
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Vec<HeldPullRequest>>> {
        // Critical sections over the map never panic, so a poisoned map is still consistent.
        self.held.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Hold the given request until messages arrive on its queue or its deadline passes.
    pub fn suspend(&self, topic: &str, queue_id: i32, request: HeldPullRequest) {
        tracing::trace!(id = %request.id, topic, queue_id, offset = request.pull_from_offset, "suspending pull request");
        let count = {
            let mut held = self.lock();
            held.entry(Self::build_key(topic, queue_id)).or_default().push(request);
            held.values().map(Vec::len).sum::<usize>()
        };
        metrics::gauge!(METRIC_HELD_REQUESTS).set(count as f64);
    }

    /// Resume every request held on the given queue, in the order they were suspended.
    ///
    /// Returns the number of requests resumed.
    pub fn notify_arrival(&self, topic: &str, queue_id: i32) -> usize {
        let resumed = self.lock().remove(&Self::build_key(topic, queue_id)).unwrap_or_default();
        let count = resumed.len();
        if count > 0 {
            tracing::trace!(topic, queue_id, count, "resuming pull requests on arrival");
            self.resubmit(resumed);
        }
        count
    }

    /// Resume the single held request with the given id, returning `false` if it was already
    /// resumed.
    pub fn resume(&self, topic: &str, queue_id: i32, id: Uuid) -> bool {
        let request = {
            let key = Self::build_key(topic, queue_id);
            let mut held = self.lock();
            let Some(requests) = held.get_mut(&key) else { return false };
            let Some(pos) = requests.iter().position(|request| request.id == id) else { return false };
            let request = requests.remove(pos);
            if requests.is_empty() {
                held.remove(&key);
            }
            request
        };
        tracing::trace!(%id, topic, queue_id, "resuming pull request");
        self.resubmit(vec![request]);
        true
    }

    /// Resume every request whose deadline has passed, returning the number resumed.
    pub fn check_expired(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<HeldPullRequest> = {
            let mut held = self.lock();
            let mut expired = vec![];
            held.retain(|_, requests| {
                let (due, waiting): (Vec<_>, Vec<_>) = requests.drain(..).partition(|request| request.deadline <= now);
                expired.extend(due);
                *requests = waiting;
                !requests.is_empty()
            });
            expired
        };
        let count = expired.len();
        if count > 0 {
            tracing::trace!(count, "resuming expired pull requests");
            self.resubmit(expired);
        }
        count
    }

    /// The number of requests currently held.
    pub fn held_count(&self) -> usize {
        self.lock().values().map(Vec::len).sum()
    }

    /// Answer every held request as system busy, returning the number answered.
    pub fn shutdown(&self) -> usize {
        let drained: Vec<HeldPullRequest> = self.lock().drain().flat_map(|(_, requests)| requests).collect();
        let count = drained.len();
        for request in drained {
            request.task.channel.try_send_busy("broker is shutting down");
        }
        metrics::gauge!(METRIC_HELD_REQUESTS).set(0.0);
        tracing::debug!(count, "pull request hold service has shutdown");
        count
    }

    /// Spawn the task resuming expired requests.
    pub fn spawn_reaper(self: &Arc<Self>, shutdown_rx: BroadcastStream<()>) -> JoinHandle<Result<()>> {
        HoldReaper {
            service: self.clone(),
            shutdown_rx,
        }
        .spawn()
    }

    fn resubmit(&self, requests: Vec<HeldPullRequest>) {
        for request in requests {
            let mut task = request.task;
            task.allow_suspend = false;
            if let Err(err) = self.dispatch.submit(RequestCategory::Pull, task) {
                tracing::warn!(id = %request.id, error = %err, "could not resubmit resumed pull request");
                err.reply_busy();
            }
        }
        metrics::gauge!(METRIC_HELD_REQUESTS).set(self.held_count() as f64);
    }
}

impl ArrivalListener for PullRequestHoldService {
    fn on_arrival(&self, topic: &str, queue_id: i32) {
        self.notify_arrival(topic, queue_id);
    }
}

/// The task periodically resuming expired requests.
struct HoldReaper {
    service: Arc<PullRequestHoldService>,
    shutdown_rx: BroadcastStream<()>,
}

impl HoldReaper {
    fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        tracing::debug!("pull request hold reaper has started");
        let mut check = tokio::time::interval(self.service.check_interval);
        check.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = check.tick() => {
                    self.service.check_expired();
                }
                _ = self.shutdown_rx.next() => break,
            }
        }

        tracing::debug!("pull request hold reaper has shutdown");
        Ok(())
    }
}
