//! Request dispatch.
//!
//! Every request category owns a bounded queue and a pool of worker tasks. Categories never
//! share a queue, so a slow category can not starve a latency sensitive one. Submissions to a
//! full queue are rejected immediately.

#[cfg(test)]
mod mod_test;

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::Result;
use futures::stream::StreamExt;
use tokio::sync::{broadcast, mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_stream::wrappers::BroadcastStream;

use crate::config::Config;
use crate::processor::RequestProcessor;
use crate::remoting::{request_code, response_code, RemotingCommand};

const METRIC_QUEUE_SIZE: &str = "rop_dispatch_queue_size";
const METRIC_HEAD_WAIT: &str = "rop_dispatch_head_wait_ms";
const METRIC_REJECTED: &str = "rop_dispatch_rejected";

/// The category of an inbound request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RequestCategory {
    Send,
    Pull,
    Query,
    Heartbeat,
    ClientManage,
    ConsumerManage,
    EndTransaction,
    Admin,
}

impl RequestCategory {
    pub const ALL: [RequestCategory; 8] = [
        RequestCategory::Send,
        RequestCategory::Pull,
        RequestCategory::Query,
        RequestCategory::Heartbeat,
        RequestCategory::ClientManage,
        RequestCategory::ConsumerManage,
        RequestCategory::EndTransaction,
        RequestCategory::Admin,
    ];

    /// The category of the given request code, unknown codes are administrative.
    pub fn from_request_code(code: i32) -> Self {
        match code {
            request_code::SEND_MESSAGE | request_code::SEND_MESSAGE_V2 | request_code::SEND_BATCH_MESSAGE | request_code::CONSUMER_SEND_MSG_BACK => {
                RequestCategory::Send
            }
            request_code::PULL_MESSAGE => RequestCategory::Pull,
            request_code::QUERY_MESSAGE | request_code::VIEW_MESSAGE_BY_ID => RequestCategory::Query,
            request_code::HEART_BEAT => RequestCategory::Heartbeat,
            request_code::UNREGISTER_CLIENT | request_code::CHECK_CLIENT_CONFIG => RequestCategory::ClientManage,
            request_code::GET_CONSUMER_LIST_BY_GROUP | request_code::QUERY_CONSUMER_OFFSET | request_code::UPDATE_CONSUMER_OFFSET => {
                RequestCategory::ConsumerManage
            }
            request_code::END_TRANSACTION => RequestCategory::EndTransaction,
            _ => RequestCategory::Admin,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RequestCategory::Send => "send",
            RequestCategory::Pull => "pull",
            RequestCategory::Query => "query",
            RequestCategory::Heartbeat => "heartbeat",
            RequestCategory::ClientManage => "client_manage",
            RequestCategory::ConsumerManage => "consumer_manage",
            RequestCategory::EndTransaction => "end_transaction",
            RequestCategory::Admin => "admin",
        }
    }

    fn index(&self) -> usize {
        *self as usize
    }
}

/// The channel on which the response to a request is written back to its connection.
#[derive(Clone, Debug)]
pub struct ResponseChannel {
    tx: mpsc::Sender<RemotingCommand>,
    opaque: i32,
    oneway: bool,
}

impl ResponseChannel {
    pub fn new(tx: mpsc::Sender<RemotingCommand>, request: &RemotingCommand) -> Self {
        Self {
            tx,
            opaque: request.opaque,
            oneway: request.is_oneway(),
        }
    }

    /// Send the response, dropping it if the request was oneway or the connection is gone.
    pub async fn send(&self, mut response: RemotingCommand) {
        if self.oneway {
            return;
        }
        response.mark_response(self.opaque);
        if self.tx.send(response).await.is_err() {
            tracing::debug!(opaque = self.opaque, "connection closed before response could be written");
        }
    }

    /// Send the response without waiting for room on the connection's write queue.
    pub fn try_send(&self, mut response: RemotingCommand) {
        if self.oneway {
            return;
        }
        response.mark_response(self.opaque);
        if let Err(err) = self.tx.try_send(response) {
            tracing::warn!(error = %err, opaque = self.opaque, "could not write response to connection");
        }
    }

    /// Answer the request as system busy.
    pub fn try_send_busy(&self, remark: &str) {
        self.try_send(RemotingCommand::new_response(response_code::SYSTEM_BUSY, self.opaque, Some(remark.into())));
    }
}

/// A request waiting to be processed.
#[derive(Debug)]
pub struct RequestTask {
    pub command: RemotingCommand,
    pub peer: SocketAddr,
    pub channel: ResponseChannel,
    /// Whether the request may be held when there is nothing to answer it with yet.
    pub allow_suspend: bool,
    enqueued_at: Instant,
}

impl RequestTask {
    pub fn new(command: RemotingCommand, peer: SocketAddr, tx: mpsc::Sender<RemotingCommand>) -> Self {
        let channel = ResponseChannel::new(tx, &command);
        Self {
            command,
            peer,
            channel,
            allow_suspend: true,
            enqueued_at: Instant::now(),
        }
    }

    pub fn category(&self) -> RequestCategory {
        RequestCategory::from_request_code(self.command.code)
    }
}

/// An error from submitting a request, handing the request back to the caller.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// The category's queue is at capacity.
    #[error("the {} queue is full", .category.as_str())]
    Rejected { category: RequestCategory, task: Box<RequestTask> },
    /// The dispatch table is shutting down.
    #[error("the dispatch table is shutting down")]
    Shutdown { task: Box<RequestTask> },
}

impl DispatchError {
    pub fn into_task(self) -> RequestTask {
        match self {
            DispatchError::Rejected { task, .. } | DispatchError::Shutdown { task } => *task,
        }
    }

    /// Answer the handed back request as system busy.
    pub fn reply_busy(self) {
        let remark = self.to_string();
        self.into_task().channel.try_send_busy(&remark);
    }
}

/// The bounded queue of a single category.
struct CategoryQueue {
    category: RequestCategory,
    capacity: usize,
    threads: usize,
    tasks: Mutex<VecDeque<RequestTask>>,
    notify: Notify,
    closed: AtomicBool,
}

impl CategoryQueue {
    fn lock(&self) -> MutexGuard<'_, VecDeque<RequestTask>> {
        // Critical sections over the queue never panic, so a poisoned queue is still consistent.
        self.tasks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn pop(&self) -> Option<RequestTask> {
        self.lock().pop_front()
    }
}

/// The table of per-category request queues.
#[derive(Clone)]
pub struct DispatchTable {
    queues: Arc<Vec<Arc<CategoryQueue>>>,
    shutdown_tx: broadcast::Sender<()>,
}

impl DispatchTable {
    /// Create a new instance, sizing each category from config.
    pub fn new(config: &Config) -> Self {
        metrics::describe_gauge!(METRIC_QUEUE_SIZE, metrics::Unit::Count, "the number of requests queued per category");
        metrics::describe_gauge!(METRIC_HEAD_WAIT, metrics::Unit::Milliseconds, "the age of the oldest queued request per category");
        metrics::describe_counter!(METRIC_REJECTED, metrics::Unit::Count, "the number of requests rejected because a queue was full");
        let queues = RequestCategory::ALL
            .iter()
            .map(|category| {
                let (threads, capacity) = config.category_limits(*category);
                Arc::new(CategoryQueue {
                    category: *category,
                    capacity,
                    threads: threads.max(1),
                    tasks: Mutex::new(VecDeque::new()),
                    notify: Notify::new(),
                    closed: AtomicBool::new(false),
                })
            })
            .collect();
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            queues: Arc::new(queues),
            shutdown_tx,
        }
    }

    fn queue(&self, category: RequestCategory) -> &CategoryQueue {
        &self.queues[category.index()]
    }

    /// Register the processor of the given category, spawning its worker pool.
    pub fn register(&self, category: RequestCategory, processor: Arc<dyn RequestProcessor>) -> Vec<JoinHandle<Result<()>>> {
        let queue = self.queues[category.index()].clone();
        (0..queue.threads)
            .map(|id| {
                Worker {
                    id,
                    queue: queue.clone(),
                    processor: processor.clone(),
                    shutdown_rx: BroadcastStream::new(self.shutdown_tx.subscribe()),
                }
                .spawn()
            })
            .collect()
    }

    /// Submit a request to the queue of the given category.
    ///
    /// Fails immediately, handing the request back, when the queue is at capacity.
    pub fn submit(&self, category: RequestCategory, mut task: RequestTask) -> Result<(), DispatchError> {
        let queue = self.queue(category);
        {
            let mut tasks = queue.lock();
            if queue.closed.load(Ordering::Acquire) {
                return Err(DispatchError::Shutdown { task: Box::new(task) });
            }
            if tasks.len() >= queue.capacity {
                metrics::counter!(METRIC_REJECTED, "category" => category.as_str()).increment(1);
                return Err(DispatchError::Rejected {
                    category,
                    task: Box::new(task),
                });
            }
            task.enqueued_at = Instant::now();
            tasks.push_back(task);
        }
        queue.notify.notify_one();
        Ok(())
    }

    /// The age of the oldest request still queued in the given category.
    pub fn head_wait_time(&self, category: RequestCategory) -> Duration {
        self.queue(category)
            .lock()
            .front()
            .map(|task| task.enqueued_at.elapsed())
            .unwrap_or_default()
    }

    /// The number of requests queued in the given category.
    pub fn queue_size(&self, category: RequestCategory) -> usize {
        self.queue(category).lock().len()
    }

    /// Log and record the queue size and head wait time of every category.
    pub fn log_watermarks(&self) {
        for category in RequestCategory::ALL {
            let (size, head_wait) = (self.queue_size(category), self.head_wait_time(category));
            metrics::gauge!(METRIC_QUEUE_SIZE, "category" => category.as_str()).set(size as f64);
            metrics::gauge!(METRIC_HEAD_WAIT, "category" => category.as_str()).set(head_wait.as_millis() as f64);
            if size > 0 {
                tracing::info!(category = category.as_str(), size, head_wait_ms = head_wait.as_millis() as u64, "request queue watermark");
            }
        }
    }

    /// Stop all workers, answering every request still queued as system busy.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
        for queue in self.queues.iter() {
            let drained: Vec<RequestTask> = {
                let mut tasks = queue.lock();
                queue.closed.store(true, Ordering::Release);
                tasks.drain(..).collect()
            };
            for task in drained {
                task.channel.try_send_busy("broker is shutting down");
            }
        }
        tracing::debug!("dispatch table has shutdown");
    }
}

/// A worker of a category's pool.
struct Worker {
    id: usize,
    queue: Arc<CategoryQueue>,
    processor: Arc<dyn RequestProcessor>,
    shutdown_rx: BroadcastStream<()>,
}

impl Worker {
    fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        tracing::trace!(category = self.queue.category.as_str(), id = self.id, "dispatch worker has started");
        loop {
            // Register interest before popping so that submissions are never missed.
            let queue = self.queue.clone();
            let notified = queue.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(task) = self.queue.pop() {
                self.handle_task(task).await;
                continue;
            }
            tokio::select! {
                _ = &mut notified => continue,
                _ = self.shutdown_rx.next() => break,
            }
        }
        tracing::trace!(category = self.queue.category.as_str(), id = self.id, "dispatch worker has shutdown");
        Ok(())
    }

    #[tracing::instrument(level = "trace", skip(self, task), fields(code = task.command.code, opaque = task.command.opaque))]
    async fn handle_task(&mut self, task: RequestTask) {
        let channel = task.channel.clone();
        if let Some(response) = self.processor.process(task).await {
            channel.send(response).await;
        }
    }
}
