use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::codec::{property, MessageRecord};
use crate::dispatch::RequestTask;
use crate::longpoll::ArrivalListener;
use crate::pubsub::{Consumer, MessageId, Producer, ProducerOptions, PubSubClient, SubscribeOptions};
use crate::remoting::RemotingCommand;

/// Build a record for a message which was sent with the given delay level.
pub fn delayed_record(real_topic: &str, real_queue_id: i32, level: i32, store_timestamp: i64) -> Result<MessageRecord> {
    let mut properties = BTreeMap::new();
    properties.insert(property::REAL_TOPIC.to_string(), real_topic.to_string());
    properties.insert(property::REAL_QUEUE_ID.to_string(), real_queue_id.to_string());
    properties.insert(property::DELAY_TIME_LEVEL.to_string(), level.to_string());
    properties.insert(property::TAGS.to_string(), "TagA".to_string());
    let mut record = MessageRecord {
        topic: real_topic.to_string(),
        body: Bytes::from(format!("delayed body for {}", real_topic)),
        born_timestamp: store_timestamp - 10,
        born_host: "10.0.0.1:5000".parse::<SocketAddr>()?,
        store_timestamp,
        store_host: "10.0.0.2:10911".parse::<SocketAddr>()?,
        reconsume_times: 1,
        properties,
        ..Default::default()
    };
    record.refresh_tags_code();
    Ok(record)
}

/// The peer address used for test requests.
pub const TEST_PEER: &str = "10.0.0.9:45000";

/// Build a request task for the given command, along with the receiver of its responses.
pub fn request_task(cmd: RemotingCommand) -> Result<(RequestTask, mpsc::Receiver<RemotingCommand>)> {
    let (tx, rx) = mpsc::channel(16);
    Ok((RequestTask::new(cmd, TEST_PEER.parse()?, tx), rx))
}

/// A pub/sub client which records created producers, used for observing producer lifecycles.
#[derive(Default)]
pub struct RecordingClient {
    pub creations: AtomicUsize,
    /// The number of upcoming producer creations which will fail.
    pub failures_remaining: AtomicUsize,
    pub create_delay: Duration,
    pub send_delay: Duration,
    pub producers: Mutex<Vec<Arc<RecordingProducer>>>,
}

impl RecordingClient {
    pub fn new(create_delay: Duration, send_delay: Duration) -> Self {
        Self {
            create_delay,
            send_delay,
            ..Default::default()
        }
    }

    pub fn producers(&self) -> Vec<Arc<RecordingProducer>> {
        self.producers.lock().map(|producers| producers.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl PubSubClient for RecordingClient {
    async fn subscribe(&self, opts: SubscribeOptions) -> Result<Arc<dyn Consumer>> {
        bail!("recording client does not support subscriptions, got {}", opts.subscription)
    }

    async fn new_producer(&self, opts: ProducerOptions) -> Result<Arc<dyn Producer>> {
        tokio::time::sleep(self.create_delay).await;
        self.creations.fetch_add(1, Ordering::SeqCst);
        let remaining = self.failures_remaining.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures_remaining.store(remaining - 1, Ordering::SeqCst);
            bail!("injected producer creation failure");
        }
        let producer = Arc::new(RecordingProducer {
            topic: opts.topic,
            send_delay: self.send_delay,
            ..Default::default()
        });
        self.producers.lock().map_err(|_| anyhow!("lock poisoned"))?.push(producer.clone());
        Ok(producer)
    }
}

/// A producer which records sends and how it was closed.
#[derive(Default)]
pub struct RecordingProducer {
    pub topic: String,
    pub send_delay: Duration,
    pub sent: Mutex<Vec<Bytes>>,
    pub in_flight: AtomicUsize,
    pub closed: AtomicBool,
    /// Set if the producer was closed while a send was still in flight.
    pub closed_during_send: AtomicBool,
}

#[async_trait]
impl Producer for RecordingProducer {
    async fn send(&self, data: Bytes) -> Result<MessageId> {
        if self.closed.load(Ordering::SeqCst) {
            bail!("producer closed");
        }
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.send_delay).await;
        let entry_id = {
            let mut sent = self.sent.lock().map_err(|_| anyhow!("lock poisoned"))?;
            sent.push(data);
            sent.len() as i64 - 1
        };
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(MessageId { ledger_id: 0, entry_id, partition: 0 })
    }

    async fn close(&self) -> Result<()> {
        if self.in_flight.load(Ordering::SeqCst) > 0 {
            self.closed_during_send.store(true, Ordering::SeqCst);
        }
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn topic(&self) -> &str {
        &self.topic
    }
}

/// An arrival listener which records every notification.
#[derive(Default)]
pub struct RecordingListener {
    arrivals: Mutex<Vec<(String, i32)>>,
}

impl RecordingListener {
    pub fn arrivals(&self) -> Vec<(String, i32)> {
        self.arrivals.lock().map(|arrivals| arrivals.clone()).unwrap_or_default()
    }
}

impl ArrivalListener for RecordingListener {
    fn on_arrival(&self, topic: &str, queue_id: i32) {
        if let Ok(mut arrivals) = self.arrivals.lock() {
            arrivals.push((topic.to_string(), queue_id));
        }
    }
}
