use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::codec::{self, property, MessageRecord};
use crate::config::Config;
use crate::longpoll::ArrivalListener;
use crate::pubsub::{ConsumedMessage, Consumer, InitialPosition, MessageId, PubSubClient, SubscribeOptions, SubscriptionKind, SubscriptionMode};
use crate::schedule::levels::{schedule_topic_name, DelayLevelTable};
use crate::schedule::producers::ProducerCache;
use crate::schedule::{METRIC_DELIVERED, METRIC_DELIVERY_FAILURES, METRIC_PENDING_TASKS};
use crate::timer::{TimerTask, TimingWheel};
use crate::utils;

/// The topic of half (prepared) transactional messages, which must never be scheduled.
pub const TRANS_HALF_TOPIC: &str = "RMQ_SYS_TRANS_HALF_TOPIC";
/// The suffix of producers used for republishing due messages.
const PRODUCER_NAME_SUFFIX: &str = "delayedMessageSender";
/// The max time to wait for in-flight deliveries when closing.
const CLOSE_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// The state shared by all deliveries of a manager.
struct DeliveryContext {
    level: i32,
    consumer: Arc<dyn Consumer>,
    producers: Arc<ProducerCache>,
    listener: Option<Arc<dyn ArrivalListener>>,
}

/// The delivery manager of a single delay level.
///
/// Pulls messages of its level's schedule topic, holds each on a private timing wheel until its
/// due time and then republishes it to its real destination.
pub struct DelayedDeliveryManager {
    level: i32,
    topic: String,
    wheel: TimingWheel,
    /// The wall-clock time in millis at which the wheel's logical clock was 0.
    epoch_ms: i64,
    levels: Arc<DelayLevelTable>,
    ctx: Arc<DeliveryContext>,
    runtime: Handle,
    batch_size: usize,
    receive_timeout: Duration,
    fetch_budget: Duration,
    /// Set when the last fetch ran out of budget before the topic was drained.
    backlog: bool,

    /// Cloned into every in-flight delivery, closing waits until all clones have been dropped.
    drain_tx: Option<mpsc::Sender<()>>,
    drain_rx: mpsc::Receiver<()>,
}

impl DelayedDeliveryManager {
    /// Create a new instance, subscribing to the schedule topic of the given level.
    pub async fn new(
        config: &Config, level: i32, levels: Arc<DelayLevelTable>, client: Arc<dyn PubSubClient>, listener: Option<Arc<dyn ArrivalListener>>,
    ) -> Result<Self> {
        let token = levels.token(level).with_context(|| format!("unknown delay level {}", level))?;
        let topic = schedule_topic_name(&config.schedule_topic_prefix, &token);
        let consumer = client
            .subscribe(SubscribeOptions {
                topic: topic.clone(),
                subscription: format!("{}_consumer", topic),
                mode: SubscriptionMode::Durable,
                kind: SubscriptionKind::Shared,
                initial_position: InitialPosition::Earliest,
            })
            .await
            .with_context(|| format!("error subscribing to schedule topic {}", topic))?;
        let producers = Arc::new(ProducerCache::new(
            client,
            PRODUCER_NAME_SUFFIX.into(),
            config.producer_cache_size,
            config.producer_cache_expiry(),
        ));
        let (drain_tx, drain_rx) = mpsc::channel(1);
        tracing::debug!(level, %topic, "delayed delivery manager created");
        Ok(Self {
            level,
            topic,
            wheel: TimingWheel::new(config.schedule_wheel_size),
            epoch_ms: utils::now_millis(),
            levels,
            ctx: Arc::new(DeliveryContext {
                level,
                consumer,
                producers,
                listener,
            }),
            runtime: Handle::current(),
            batch_size: config.schedule_batch_size.max(1),
            receive_timeout: config.schedule_receive_timeout(),
            fetch_budget: config.schedule_fetch_budget(),
            backlog: false,
            drain_tx: Some(drain_tx),
            drain_rx,
        })
    }

    pub fn level(&self) -> i32 {
        self.level
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// The number of messages waiting on this manager's wheel.
    pub fn pending(&self) -> usize {
        self.wheel.size()
    }

    /// Whether the last fetch stopped on its time budget with messages possibly remaining.
    pub fn has_backlog(&self) -> bool {
        self.backlog
    }

    /// The wall-clock time in millis the wheel's logical clock corresponds to.
    pub fn wheel_time_ms(&self) -> i64 {
        self.epoch_ms.saturating_add(self.wheel.current_time() as i64)
    }

    /// Fetch newly arrived messages, scheduling each on the wheel.
    ///
    /// Stops once no message arrives within the receive timeout, once the wheel holds a full
    /// batch of pending messages, or once the fetch budget is spent. Returns the number of
    /// messages fetched.
    #[tracing::instrument(level = "trace", skip(self), fields(level = self.level))]
    pub async fn fetch(&mut self) -> usize {
        let started = Instant::now();
        let mut fetched = 0;
        self.backlog = false;
        while self.wheel.size() < self.batch_size {
            if started.elapsed() >= self.fetch_budget {
                self.backlog = true;
                break;
            }
            let msg = match self.ctx.consumer.receive(self.receive_timeout).await {
                Ok(Some(msg)) => msg,
                Ok(None) => break,
                Err(err) => {
                    tracing::error!(error = ?err, level = self.level, "error receiving from schedule topic");
                    break;
                }
            };
            fetched += 1;
            self.schedule(msg).await;
        }
        self.record_pending();
        fetched
    }

    /// Advance this manager's wheel to the given wall-clock time, returning the number of
    /// deliveries started.
    ///
    /// A time at or behind the wheel's current time is a no-op.
    pub fn advance_to(&mut self, now_ms: i64) -> usize {
        let step_ms = now_ms.saturating_sub(self.wheel_time_ms());
        if step_ms <= 0 {
            return 0;
        }
        let fired = self.wheel.advance_clock(step_ms as u64);
        if fired > 0 {
            self.record_pending();
        }
        fired
    }

    /// Close this manager.
    ///
    /// Pending messages are dropped unacknowledged and will be redelivered to the next
    /// subscriber. In-flight deliveries are given a bounded time to finish.
    pub async fn close(mut self) {
        self.wheel.shutdown();
        self.drain_tx.take();
        if tokio::time::timeout(CLOSE_DRAIN_TIMEOUT, self.drain_rx.recv()).await.is_err() {
            tracing::warn!(level = self.level, "timeout waiting for in-flight deliveries to finish");
        }
        if let Err(err) = self.ctx.consumer.close().await {
            tracing::error!(error = ?err, level = self.level, "error closing schedule topic consumer");
        }
        self.ctx.producers.invalidate_all().await;
        self.record_pending();
        tracing::debug!(level = self.level, topic = %self.topic, "delayed delivery manager closed");
    }

    async fn schedule(&mut self, msg: ConsumedMessage) {
        let mut buf = msg.data.clone();
        let record = match codec::decode(&mut buf, Some(&msg.id.parts()), true) {
            Some(record) => record,
            None => {
                // Undecodable messages can never be delivered, drop them from the subscription.
                tracing::error!(level = self.level, message_id = ?msg.id, "error decoding scheduled message, dropping");
                if let Err(err) = self.ctx.consumer.acknowledge(&msg.id).await {
                    tracing::error!(error = ?err, "error acknowledging undecodable message");
                }
                return;
            }
        };

        // Delays are measured against the wheel's clock, which lags wall time between advances.
        self.advance_to(utils::now_millis());
        let deliver_at = self.levels.compute_deliver_timestamp(self.level, record.store_timestamp);
        let delay_ms = deliver_at.saturating_sub(self.wheel_time_ms()).max(0) as u64;
        let (ctx, runtime, drain) = (self.ctx.clone(), self.runtime.clone(), self.drain_tx.clone());
        let id = msg.id;
        let task = TimerTask::new(delay_ms, move || {
            runtime.spawn(async move {
                let _drain = drain;
                deliver(ctx, id, record).await;
            });
        });
        self.wheel.add(task);
    }

    fn record_pending(&self) {
        metrics::gauge!(METRIC_PENDING_TASKS, "level" => self.level.to_string()).set(self.wheel.size() as f64);
    }
}

/// Republish a due message to its real destination, acknowledging it on success and negatively
/// acknowledging it on failure.
#[tracing::instrument(level = "trace", skip(ctx, record), fields(level = ctx.level))]
async fn deliver(ctx: Arc<DeliveryContext>, id: MessageId, record: MessageRecord) {
    let inner = match reconstruct(&record) {
        Ok(inner) => inner,
        Err(err) => {
            tracing::error!(error = ?err, message_id = ?id, "error reconstructing due message");
            nack(&ctx, &id).await;
            return;
        }
    };
    if inner.topic == TRANS_HALF_TOPIC {
        tracing::error!(message_id = ?id, "[BUG] the real topic of a scheduled message is {}, discarding", TRANS_HALF_TOPIC);
        if let Err(err) = ctx.consumer.acknowledge(&id).await {
            tracing::error!(error = ?err, "error acknowledging discarded message");
        }
        return;
    }

    let queue = utils::partition_name(&inner.topic, inner.queue_id);
    let res = async {
        let producer = ctx.producers.get_or_create(&queue).await?;
        let data = codec::encode(&inner)?;
        producer.send(data).await
    }
    .await;
    match res {
        Ok(_) => {
            metrics::counter!(METRIC_DELIVERED).increment(1);
            if let Err(err) = ctx.consumer.acknowledge(&id).await {
                tracing::error!(error = ?err, message_id = ?id, "error acknowledging delivered message");
            }
            if let Some(listener) = &ctx.listener {
                listener.on_arrival(&inner.topic, inner.queue_id);
            }
        }
        Err(err) => {
            tracing::error!(error = ?err, %queue, "error republishing due message");
            nack(&ctx, &id).await;
        }
    }
}

async fn nack(ctx: &DeliveryContext, id: &MessageId) {
    metrics::counter!(METRIC_DELIVERY_FAILURES).increment(1);
    if let Err(err) = ctx.consumer.negative_acknowledge(id).await {
        tracing::error!(error = ?err, message_id = ?id, "error negatively acknowledging message");
    }
}

/// Rebuild a due message for its real destination.
///
/// The delay level is cleared and the topic and queue are restored from the reserved
/// properties. The rebuilt message is stamped with a fresh store timestamp.
pub fn reconstruct(record: &MessageRecord) -> Result<MessageRecord> {
    let mut inner = MessageRecord {
        body: record.body.clone(),
        flag: record.flag,
        properties: record.properties.clone(),
        sys_flag: record.sys_flag,
        born_timestamp: record.born_timestamp,
        born_host: record.born_host,
        store_timestamp: utils::now_millis(),
        store_host: record.store_host,
        reconsume_times: record.reconsume_times,
        ..Default::default()
    };
    inner.refresh_tags_code();
    inner.properties.remove(property::DELAY_TIME_LEVEL);
    inner.topic = inner
        .properties
        .get(property::REAL_TOPIC)
        .cloned()
        .context("scheduled message is missing its real topic")?;
    inner.queue_id = inner
        .properties
        .get(property::REAL_QUEUE_ID)
        .context("scheduled message is missing its real queue id")?
        .parse()
        .context("scheduled message has an invalid real queue id")?;
    Ok(inner)
}
