use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};
use bytes::Bytes;
use tokio::sync::{OnceCell, RwLock};

use crate::pubsub::{MessageId, Producer, ProducerOptions, PubSubClient};

/// The send timeout applied to producers created by the cache.
pub const PRODUCER_SEND_TIMEOUT: Duration = Duration::from_secs(3);

pub(super) const METRIC_PRODUCERS_EVICTED: &str = "rop_schedule_producers_evicted";

/// A cached producer.
///
/// Sends hold the producer's gate for reading, closing takes it for writing. A producer evicted
/// while sends are in flight is therefore only closed once those sends have finished.
pub struct CachedProducer {
    producer: Arc<dyn Producer>,
    /// Set to `true` once the producer has been closed.
    gate: RwLock<bool>,
}

impl CachedProducer {
    fn new(producer: Arc<dyn Producer>) -> Self {
        Self {
            producer,
            gate: RwLock::new(false),
        }
    }

    /// Send the given data, failing if the producer has been closed or the send times out.
    pub async fn send(&self, data: Bytes) -> Result<MessageId> {
        let closed = self.gate.read().await;
        if *closed {
            bail!("producer for topic {} has been closed", self.producer.topic());
        }
        tokio::time::timeout(PRODUCER_SEND_TIMEOUT, self.producer.send(data))
            .await
            .map_err(|_| anyhow!("timeout sending to topic {}", self.producer.topic()))?
    }

    /// Close the producer once all in-flight sends have finished.
    pub async fn close(&self) {
        let mut closed = self.gate.write().await;
        if *closed {
            return;
        }
        *closed = true;
        if let Err(err) = self.producer.close().await {
            tracing::warn!(error = ?err, topic = self.producer.topic(), "error closing producer");
        }
    }

    pub async fn is_closed(&self) -> bool {
        *self.gate.read().await
    }
}

/// The slot of a single cached topic.
///
/// Once evicted a slot is closed for good: a creation which has not yet started fails, and a
/// producer created before the eviction is closed as soon as its creation finishes.
pub(super) struct ProducerSlot {
    cell: OnceCell<Arc<CachedProducer>>,
    evicted: AtomicBool,
}

impl ProducerSlot {
    fn new() -> Self {
        Self {
            cell: OnceCell::new(),
            evicted: AtomicBool::new(false),
        }
    }

    pub(super) fn is_evicted(&self) -> bool {
        self.evicted.load(Ordering::SeqCst)
    }

    /// Mark this slot evicted and close its producer, if one was created.
    async fn close(&self) {
        self.evicted.store(true, Ordering::SeqCst);
        // Waits out any in-progress creation.
        let res = self.cell.get_or_try_init(|| async { Err::<Arc<CachedProducer>, ()>(()) }).await;
        if let Ok(producer) = res {
            producer.close().await;
        }
    }
}

struct CacheEntry {
    slot: Arc<ProducerSlot>,
    last_access: Instant,
}

/// A bounded cache of producers keyed by destination topic.
///
/// Creation is single-flight per key: concurrent requests for an uncached topic share one
/// creation, and a failed creation leaves nothing cached. Entries are evicted once idle for
/// longer than the configured expiry, or least recently used first once over capacity.
pub struct ProducerCache {
    client: Arc<dyn PubSubClient>,
    /// The suffix of the name given to created producers.
    name_suffix: String,
    capacity: usize,
    expiry: Duration,
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl ProducerCache {
    pub fn new(client: Arc<dyn PubSubClient>, name_suffix: String, capacity: usize, expiry: Duration) -> Self {
        Self {
            client,
            name_suffix,
            capacity: capacity.max(1),
            expiry,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Get the producer for the given topic, creating it if needed.
    #[tracing::instrument(level = "trace", skip(self))]
    pub async fn get_or_create(&self, topic: &str) -> Result<Arc<CachedProducer>> {
        let slot = self.slot(topic)?;
        self.init(topic, &slot).await
    }

    /// Look up the slot of the given topic, inserting a new one if needed.
    ///
    /// Expired and over-capacity slots are evicted and closed in the background.
    pub(super) fn slot(&self, topic: &str) -> Result<Arc<ProducerSlot>> {
        let (slot, evicted) = {
            let mut entries = self.entries.lock().map_err(|_| anyhow!("producer cache lock poisoned"))?;
            let now = Instant::now();
            let mut evicted = self.take_expired(&mut entries, now, topic);
            let slot = match entries.get_mut(topic) {
                Some(entry) => {
                    entry.last_access = now;
                    entry.slot.clone()
                }
                None => {
                    if entries.len() >= self.capacity {
                        evicted.extend(self.take_lru(&mut entries));
                    }
                    let slot = Arc::new(ProducerSlot::new());
                    entries.insert(
                        topic.to_string(),
                        CacheEntry {
                            slot: slot.clone(),
                            last_access: now,
                        },
                    );
                    slot
                }
            };
            (slot, evicted)
        };
        for slot in evicted {
            spawn_close(slot);
        }
        Ok(slot)
    }

    /// Get the producer of the given slot, creating it if needed.
    pub(super) async fn init(&self, topic: &str, slot: &ProducerSlot) -> Result<Arc<CachedProducer>> {
        let producer = slot
            .cell
            .get_or_try_init(|| async {
                if slot.is_evicted() {
                    bail!("producer for topic {} was evicted before creation", topic);
                }
                let opts = ProducerOptions {
                    topic: topic.to_string(),
                    name: format!("{}{}", topic, self.name_suffix),
                    send_timeout: PRODUCER_SEND_TIMEOUT,
                };
                let producer = self.client.new_producer(opts).await.context("error creating producer")?;
                tracing::debug!(topic, "created producer");
                Ok::<_, anyhow::Error>(Arc::new(CachedProducer::new(producer)))
            })
            .await?;
        Ok(producer.clone())
    }

    /// The number of cached entries.
    pub fn len(&self) -> usize {
        self.entries.lock().map(|entries| entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Evict and close every cached producer.
    pub async fn invalidate_all(&self) {
        let slots: Vec<_> = match self.entries.lock() {
            Ok(mut entries) => entries.drain().map(|(_, entry)| entry.slot).collect(),
            Err(_) => {
                tracing::error!("producer cache lock poisoned, unable to invalidate");
                return;
            }
        };
        for slot in slots {
            slot.close().await;
        }
    }

    fn take_expired(&self, entries: &mut HashMap<String, CacheEntry>, now: Instant, keep: &str) -> Vec<Arc<ProducerSlot>> {
        let expired: Vec<String> = entries
            .iter()
            .filter(|(key, entry)| key.as_str() != keep && now.saturating_duration_since(entry.last_access) >= self.expiry)
            .map(|(key, _)| key.clone())
            .collect();
        expired.into_iter().filter_map(|key| entries.remove(&key)).map(|entry| entry.slot).collect()
    }

    fn take_lru(&self, entries: &mut HashMap<String, CacheEntry>) -> Option<Arc<ProducerSlot>> {
        let key = entries.iter().min_by_key(|(_, entry)| entry.last_access).map(|(key, _)| key.clone())?;
        entries.remove(&key).map(|entry| entry.slot)
    }
}

/// Close an evicted producer in the background.
fn spawn_close(slot: Arc<ProducerSlot>) {
    metrics::counter!(METRIC_PRODUCERS_EVICTED).increment(1);
    tokio::spawn(async move { slot.close().await });
}
