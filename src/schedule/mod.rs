//! Delayed message scheduling.
//!
//! Messages sent with a delay level are first written to that level's schedule topic. Each
//! level has a `DelayedDeliveryManager` which pulls from the level's topic, holds messages on a
//! timing wheel until they are due and then republishes them to their real destination. All
//! managers are owned by a single driver task which both advances the wheels and triggers
//! fetches, so each wheel is only ever touched by one task.

mod delivery;
mod levels;
mod producers;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures::stream::StreamExt;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_stream::wrappers::BroadcastStream;

use crate::config::Config;
use crate::error::AppError;
use crate::longpoll::ArrivalListener;
use crate::pubsub::PubSubClient;
use crate::utils;

pub use delivery::{reconstruct, DelayedDeliveryManager, TRANS_HALF_TOPIC};
pub use levels::{schedule_topic_name, DelayLevel, DelayLevelTable};
pub use producers::{CachedProducer, ProducerCache};

pub(crate) const METRIC_PENDING_TASKS: &str = "rop_schedule_pending_tasks";
pub(crate) const METRIC_DELIVERED: &str = "rop_schedule_delivered";
pub(crate) const METRIC_DELIVERY_FAILURES: &str = "rop_schedule_delivery_failures";

/// The delay before the first fetch after start.
const FIRST_FETCH_DELAY: Duration = Duration::from_millis(1000);

/// The delayed message scheduling service.
pub struct ScheduleService {
    config: Arc<Config>,
    client: Arc<dyn PubSubClient>,
    levels: Arc<DelayLevelTable>,
    listener: Option<Arc<dyn ArrivalListener>>,
    started: AtomicBool,
    /// The shutdown channel and join handle of the running driver.
    driver: Mutex<Option<(broadcast::Sender<()>, JoinHandle<Result<()>>)>>,
}

impl ScheduleService {
    /// Create a new instance.
    pub fn new(config: Arc<Config>, client: Arc<dyn PubSubClient>, listener: Option<Arc<dyn ArrivalListener>>) -> Self {
        metrics::describe_gauge!(METRIC_PENDING_TASKS, metrics::Unit::Count, "the number of delayed messages held on a level's timing wheel");
        metrics::describe_counter!(METRIC_DELIVERED, metrics::Unit::Count, "the number of delayed messages republished");
        metrics::describe_counter!(METRIC_DELIVERY_FAILURES, metrics::Unit::Count, "the number of delayed messages which failed to republish");
        Self {
            config,
            client,
            levels: Arc::new(DelayLevelTable::new()),
            listener,
            started: AtomicBool::new(false),
            driver: Mutex::new(None),
        }
    }

    /// The delay level table of this service.
    pub fn levels(&self) -> Arc<DelayLevelTable> {
        self.levels.clone()
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    /// Compute the timestamp at which a message of the given level stored at `store_timestamp`
    /// is due.
    pub fn compute_deliver_timestamp(&self, level: i32, store_timestamp: i64) -> i64 {
        self.levels.compute_deliver_timestamp(level, store_timestamp)
    }

    /// Start the service, returning `false` if it was already started.
    ///
    /// The configured delay levels must parse, else the service refuses to start.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn start(&self) -> Result<bool> {
        let mut driver = self.driver.lock().await;
        if self.started.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire).is_err() {
            return Ok(false);
        }
        match self.spawn_driver().await {
            Ok(handle) => {
                *driver = Some(handle);
                Ok(true)
            }
            Err(err) => {
                self.started.store(false, Ordering::Release);
                Err(err)
            }
        }
    }

    /// Shut down the service, returning `false` if it was not running.
    ///
    /// Pending messages are dropped unacknowledged and are redelivered after restart.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn shutdown(&self) -> Result<bool> {
        let mut driver = self.driver.lock().await;
        if self.started.compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire).is_err() {
            return Ok(false);
        }
        if let Some((shutdown_tx, handle)) = driver.take() {
            let _ = shutdown_tx.send(());
            handle.await.context("error joining schedule driver")??;
        }
        Ok(true)
    }

    async fn spawn_driver(&self) -> Result<(broadcast::Sender<()>, JoinHandle<Result<()>>)> {
        self.levels.parse(&self.config.message_delay_level)?;
        let mut managers = Vec::new();
        for (level, _) in self.levels.levels() {
            let manager = DelayedDeliveryManager::new(&self.config, level, self.levels.clone(), self.client.clone(), self.listener.clone()).await;
            match manager {
                Ok(manager) => managers.push(manager),
                Err(err) => {
                    for manager in managers {
                        manager.close().await;
                    }
                    return Err(AppError::Ise(err).into());
                }
            }
        }

        let (shutdown_tx, _) = broadcast::channel(1);
        let driver = ScheduleDriver {
            managers,
            fetch_interval: Duration::from_millis(self.config.schedule_fetch_interval_ms.max(1)),
            advance_interval: Duration::from_millis(self.config.schedule_advance_interval_ms.max(1)),
            first_fetch_delay: FIRST_FETCH_DELAY.min(Duration::from_millis(self.config.schedule_fetch_interval_ms)),
            shutdown_rx: BroadcastStream::new(shutdown_tx.subscribe()),
        };
        let handle = driver.spawn();
        tracing::info!(levels = self.levels.max_level(), "schedule service started");
        Ok((shutdown_tx, handle))
    }
}

/// The task owning every delivery manager.
struct ScheduleDriver {
    managers: Vec<DelayedDeliveryManager>,
    fetch_interval: Duration,
    advance_interval: Duration,
    first_fetch_delay: Duration,
    shutdown_rx: BroadcastStream<()>,
}

impl ScheduleDriver {
    fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        tracing::debug!(managers = self.managers.len(), "schedule driver has started");
        let mut fetch = tokio::time::interval_at(Instant::now() + self.first_fetch_delay, self.fetch_interval);
        fetch.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut advance = tokio::time::interval(self.advance_interval);
        advance.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = advance.tick() => self.handle_advance(),
                _ = fetch.tick() => {
                    self.handle_fetch().await;
                    // A level which ran out of fetch budget is fetched again right after an advance.
                    if self.managers.iter().any(|manager| manager.has_backlog()) {
                        self.handle_advance();
                        fetch.reset_immediately();
                    }
                }
                _ = self.shutdown_rx.next() => break,
            }
        }

        // Begin shutdown routine.
        for manager in self.managers.drain(..) {
            manager.close().await;
        }
        tracing::debug!("schedule driver has shutdown");
        Ok(())
    }

    /// Advance every wheel to the current wall-clock time.
    fn handle_advance(&mut self) {
        let now_ms = utils::now_millis();
        for manager in self.managers.iter_mut() {
            manager.advance_to(now_ms);
        }
    }

    #[tracing::instrument(level = "trace", skip(self))]
    async fn handle_fetch(&mut self) {
        futures::future::join_all(self.managers.iter_mut().map(|manager| manager.fetch())).await;
    }
}
