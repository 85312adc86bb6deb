//! An embedded pub/sub log backed by sled.
//!
//! Each topic is stored in its own tree. Entries are keyed by `PREFIX_ENTRY` + offset and
//! durable subscription cursors by `PREFIX_CURSOR` + subscription name. A cursor always points
//! at the lowest offset of the subscription which has not been acknowledged.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use sled::{Config as SledConfig, Db, IVec, Tree};
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::codec::{peek_tags_code, stamp_queue_offset};
use crate::config::Config;
use crate::error::{ShutdownError, ShutdownResult, ERR_DB_FLUSH, ERR_ITER_FAILURE};
use crate::filter::TagFilter;
use crate::pubsub::{
    ConsumedMessage, Consumer, GetMessageResult, GetMessageStatus, InitialPosition, MessageId, MessageStore, Producer, ProducerOptions, PubSubClient,
    SubscribeOptions, SubscriptionMode,
};
use crate::utils;

/// The key prefix used for storing topic entries.
///
/// NOTE: in order to preserve lexicographical ordering of keys, it is important to always use
/// the `utils::encode_byte_prefix*` methods.
pub const PREFIX_ENTRY: &[u8; 1] = b"e";
/// The key prefix used for storing durable subscription cursors.
pub const PREFIX_CURSOR: &[u8; 1] = b"c";
/// The DB tree prefix used for topics.
const TREE_TOPIC_PREFIX: &str = "topics";
/// The delay before a negatively acknowledged message is redelivered.
pub const DEFAULT_REDELIVERY_DELAY: Duration = Duration::from_secs(1);
/// The max number of entries scanned by a single store read.
const MAX_SCAN_ENTRIES: usize = 16_000;

/// An embedded log implementing the pub/sub and message store abstractions.
#[derive(Clone)]
pub struct LocalLog {
    inner: Arc<LocalLogInner>,
}

struct LocalLogInner {
    db: Db,
    topics: Mutex<HashMap<String, Arc<TopicLog>>>,
    redelivery_delay: Duration,
}

impl LocalLog {
    /// Open the log under the configured storage path.
    pub async fn new(config: Arc<Config>) -> Result<Self> {
        let dbpath = PathBuf::from(&config.storage_data_path).join("log");
        tokio::fs::create_dir_all(&dbpath).await.context("error creating dir for local log")?;
        Self::open(dbpath, DEFAULT_REDELIVERY_DELAY).await
    }

    /// Open the log at the given path with the given nack redelivery delay.
    pub async fn open(dbpath: PathBuf, redelivery_delay: Duration) -> Result<Self> {
        spawn_blocking(move || -> Result<Self> {
            let db = SledConfig::new().path(dbpath).mode(sled::Mode::HighThroughput).open()?;
            let inner = Arc::new(LocalLogInner {
                db,
                topics: Mutex::new(HashMap::new()),
                redelivery_delay,
            });
            Ok(Self { inner })
        })
        .await?
    }

    /// Flush all pending writes to disk.
    pub async fn flush(&self) -> Result<()> {
        self.inner.db.flush_async().await.context(ERR_DB_FLUSH)?;
        Ok(())
    }

    /// Get a handle to the given topic, opening its tree if needed.
    async fn topic(&self, name: &str) -> ShutdownResult<Arc<TopicLog>> {
        if let Some(topic) = self.lock_topics()?.get(name) {
            return Ok(topic.clone());
        }

        let tree_name = format!("{}/{}", TREE_TOPIC_PREFIX, name);
        let (db, ivname) = (self.inner.db.clone(), IVec::from(tree_name.as_str()));
        let tree = spawn_blocking(move || -> Result<Tree> { Ok(db.open_tree(ivname)?) })
            .await
            .and_then(|res| res.map_err(|err| ShutdownError(anyhow!("could not open DB tree {} {}", &tree_name, err))))?;
        let next_offset = recover_next_offset(&tree).map_err(ShutdownError)?;

        let mut topics = self.lock_topics()?;
        let topic = topics
            .entry(name.to_string())
            .or_insert_with(|| {
                Arc::new(TopicLog {
                    name: name.to_string(),
                    partition: parse_partition(name),
                    tree,
                    state: Mutex::new(TopicState {
                        next_offset,
                        subscriptions: HashMap::new(),
                    }),
                    notify: Notify::new(),
                })
            })
            .clone();
        Ok(topic)
    }

    fn lock_topics(&self) -> ShutdownResult<std::sync::MutexGuard<'_, HashMap<String, Arc<TopicLog>>>> {
        self.inner.topics.lock().map_err(|_| ShutdownError(anyhow!("local log topics lock poisoned")))
    }
}

/// Spawn a blocking database-related function, returning a ShutdownError if anything goes
/// wrong related to spawning & joining.
#[tracing::instrument(level = "trace", skip(f), err)]
async fn spawn_blocking<F, R>(f: F) -> ShutdownResult<R>
where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|err| ShutdownError::from(anyhow::Error::from(err)))
}

/// Find the next offset to be written to the given tree.
fn recover_next_offset(tree: &Tree) -> Result<u64> {
    match tree.scan_prefix(PREFIX_ENTRY).next_back() {
        Some(kv_res) => {
            let (key, _) = kv_res.context(ERR_ITER_FAILURE)?;
            Ok(utils::decode_u64(&key[1..])? + 1)
        }
        None => Ok(0),
    }
}

/// Parse the partition of a topic named `{topic}-partition-{n}`, else -1.
fn parse_partition(name: &str) -> i32 {
    name.rsplit_once("-partition-")
        .and_then(|(_, partition)| partition.parse().ok())
        .unwrap_or(-1)
}

struct TopicLog {
    name: String,
    partition: i32,
    tree: Tree,
    state: Mutex<TopicState>,
    /// Notified whenever entries are appended or redeliveries are scheduled.
    notify: Notify,
}

struct TopicState {
    next_offset: u64,
    subscriptions: HashMap<String, Arc<Subscription>>,
}

impl TopicLog {
    fn lock_state(&self) -> Result<std::sync::MutexGuard<'_, TopicState>> {
        self.state.lock().map_err(|_| anyhow!("topic {} state lock poisoned", self.name))
    }

    fn message_id(&self, offset: u64) -> MessageId {
        MessageId {
            ledger_id: 0,
            entry_id: offset as i64,
            partition: self.partition,
        }
    }

    /// Append the given data, returning its offset.
    ///
    /// Records have their queue offset stamped with the offset they are written at.
    fn append(&self, data: &[u8]) -> Result<u64> {
        let offset = {
            let mut state = self.lock_state()?;
            let offset = state.next_offset;
            let mut entry = data.to_vec();
            stamp_queue_offset(&mut entry, offset as i64);
            self.tree
                .insert(utils::encode_byte_prefix(PREFIX_ENTRY, offset), entry)
                .context("error appending entry to topic")?;
            state.next_offset += 1;
            offset
        };
        self.notify.notify_waiters();
        Ok(offset)
    }

    fn read(&self, offset: u64) -> Result<Option<Bytes>> {
        let entry = self
            .tree
            .get(utils::encode_byte_prefix(PREFIX_ENTRY, offset))
            .context("error reading entry from topic")?;
        Ok(entry.map(|ivec| Bytes::copy_from_slice(&ivec)))
    }

    fn first_offset(&self) -> Result<Option<u64>> {
        match self.tree.scan_prefix(PREFIX_ENTRY).next() {
            Some(kv_res) => {
                let (key, _) = kv_res.context(ERR_ITER_FAILURE)?;
                Ok(Some(utils::decode_u64(&key[1..])?))
            }
            None => Ok(None),
        }
    }

    fn cursor_key(subscription: &str) -> IVec {
        utils::ivec_from_iter(PREFIX_CURSOR.iter().copied().chain(subscription.as_bytes().iter().copied()))
    }

    /// Get or create the named subscription.
    fn subscription(&self, opts: &SubscribeOptions) -> Result<Arc<Subscription>> {
        let mut state = self.lock_state()?;
        if let Some(sub) = state.subscriptions.get(&opts.subscription) {
            return Ok(sub.clone());
        }

        let durable = opts.mode == SubscriptionMode::Durable;
        let stored_cursor = if durable {
            match self.tree.get(Self::cursor_key(&opts.subscription)).context("error reading subscription cursor")? {
                Some(raw) => Some(utils::decode_u64(&raw)?),
                None => None,
            }
        } else {
            None
        };
        let start = match (stored_cursor, opts.initial_position) {
            (Some(cursor), _) => cursor,
            (None, InitialPosition::Earliest) => self.first_offset()?.unwrap_or(state.next_offset),
            (None, InitialPosition::Latest) => state.next_offset,
        };
        let sub = Arc::new(Subscription {
            name: opts.subscription.clone(),
            durable,
            cursor: Mutex::new(Cursor {
                read_position: start,
                unacked: BTreeSet::new(),
                redeliver: BTreeMap::new(),
                persisted: stored_cursor,
            }),
        });
        state.subscriptions.insert(opts.subscription.clone(), sub.clone());
        Ok(sub)
    }
}

struct Subscription {
    name: String,
    durable: bool,
    cursor: Mutex<Cursor>,
}

struct Cursor {
    /// The next never-delivered offset.
    read_position: u64,
    /// Delivered offsets awaiting acknowledgement.
    unacked: BTreeSet<u64>,
    /// Offsets scheduled for redelivery, mapped to the instant they become available.
    redeliver: BTreeMap<u64, Instant>,
    persisted: Option<u64>,
}

impl Cursor {
    /// The lowest offset of the subscription not yet acknowledged.
    fn mark_delete_position(&self) -> u64 {
        let unacked = self.unacked.iter().next().copied();
        let redeliver = self.redeliver.keys().next().copied();
        [Some(self.read_position), unacked, redeliver].into_iter().flatten().min().unwrap_or(self.read_position)
    }
}

/// The next action a receiver should take.
enum Next {
    Deliver(u64),
    /// Nothing is deliverable, optionally a redelivery becomes available at the given instant.
    Wait(Option<Instant>),
}

impl Subscription {
    fn lock_cursor(&self) -> Result<std::sync::MutexGuard<'_, Cursor>> {
        self.cursor.lock().map_err(|_| anyhow!("subscription {} cursor lock poisoned", self.name))
    }

    fn next(&self, next_offset: u64) -> Result<Next> {
        let mut cursor = self.lock_cursor()?;
        let now = Instant::now();
        let ready = cursor.redeliver.iter().find(|(_, at)| **at <= now).map(|(offset, _)| *offset);
        if let Some(offset) = ready {
            cursor.redeliver.remove(&offset);
            cursor.unacked.insert(offset);
            return Ok(Next::Deliver(offset));
        }
        if cursor.read_position < next_offset {
            let offset = cursor.read_position;
            cursor.read_position += 1;
            cursor.unacked.insert(offset);
            return Ok(Next::Deliver(offset));
        }
        Ok(Next::Wait(cursor.redeliver.values().min().copied()))
    }

    /// Persist the cursor if it moved, returning nothing for non-durable subscriptions.
    fn persist(&self, tree: &Tree, cursor: &mut Cursor) -> Result<()> {
        if !self.durable {
            return Ok(());
        }
        let position = cursor.mark_delete_position();
        if cursor.persisted == Some(position) {
            return Ok(());
        }
        tree.insert(TopicLog::cursor_key(&self.name), &utils::encode_u64(position))
            .context("error persisting subscription cursor")?;
        cursor.persisted = Some(position);
        Ok(())
    }
}

/// A consumer of a local log subscription.
pub struct LocalConsumer {
    topic: Arc<TopicLog>,
    sub: Arc<Subscription>,
    /// Offsets delivered to this consumer and not yet acknowledged.
    outstanding: Mutex<HashSet<u64>>,
    closed: AtomicBool,
    redelivery_delay: Duration,
}

impl LocalConsumer {
    fn lock_outstanding(&self) -> Result<std::sync::MutexGuard<'_, HashSet<u64>>> {
        self.outstanding.lock().map_err(|_| anyhow!("consumer outstanding lock poisoned"))
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            bail!("consumer of subscription {} on topic {} is closed", self.sub.name, self.topic.name);
        }
        Ok(())
    }

    fn next_offset(&self) -> Result<u64> {
        Ok(self.topic.lock_state()?.next_offset)
    }
}

#[async_trait]
impl Consumer for LocalConsumer {
    #[tracing::instrument(level = "trace", skip(self))]
    async fn receive(&self, timeout: Duration) -> Result<Option<ConsumedMessage>> {
        let deadline = Instant::now() + timeout;
        loop {
            self.ensure_open()?;
            // Register interest before checking state so that appends are never missed.
            let notified = self.topic.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let retry_at = match self.sub.next(self.next_offset()?)? {
                Next::Deliver(offset) => match self.topic.read(offset)? {
                    Some(data) => {
                        self.lock_outstanding()?.insert(offset);
                        return Ok(Some(ConsumedMessage {
                            id: self.topic.message_id(offset),
                            data,
                        }));
                    }
                    // The entry is gone, drop it from the subscription and move on.
                    None => {
                        let mut cursor = self.sub.lock_cursor()?;
                        cursor.unacked.remove(&offset);
                        continue;
                    }
                },
                Next::Wait(retry_at) => retry_at,
            };

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let wake_at = retry_at.map(|at| at.min(deadline)).unwrap_or(deadline);
            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(wake_at) => {}
            }
        }
    }

    async fn acknowledge(&self, id: &MessageId) -> Result<()> {
        let offset = id.entry_id as u64;
        self.lock_outstanding()?.remove(&offset);
        let mut cursor = self.sub.lock_cursor()?;
        cursor.unacked.remove(&offset);
        cursor.redeliver.remove(&offset);
        self.sub.persist(&self.topic.tree, &mut cursor)
    }

    async fn negative_acknowledge(&self, id: &MessageId) -> Result<()> {
        let offset = id.entry_id as u64;
        self.lock_outstanding()?.remove(&offset);
        {
            let mut cursor = self.sub.lock_cursor()?;
            if cursor.unacked.remove(&offset) {
                cursor.redeliver.insert(offset, Instant::now() + self.redelivery_delay);
            }
        }
        self.topic.notify.notify_waiters();
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let outstanding: Vec<u64> = self.lock_outstanding()?.drain().collect();
        {
            let now = Instant::now();
            let mut cursor = self.sub.lock_cursor()?;
            for offset in outstanding {
                if cursor.unacked.remove(&offset) {
                    cursor.redeliver.insert(offset, now);
                }
            }
        }
        self.topic.notify.notify_waiters();
        Ok(())
    }
}

/// A producer appending to a local log topic.
pub struct LocalProducer {
    topic: Arc<TopicLog>,
    name: String,
    closed: AtomicBool,
}

#[async_trait]
impl Producer for LocalProducer {
    async fn send(&self, data: Bytes) -> Result<MessageId> {
        if self.closed.load(Ordering::Acquire) {
            bail!("producer {} on topic {} is closed", self.name, self.topic.name);
        }
        let offset = self.topic.append(&data)?;
        Ok(self.topic.message_id(offset))
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }

    fn topic(&self) -> &str {
        &self.topic.name
    }
}

#[async_trait]
impl PubSubClient for LocalLog {
    #[tracing::instrument(level = "debug", skip(self), fields(topic = %opts.topic, subscription = %opts.subscription))]
    async fn subscribe(&self, opts: SubscribeOptions) -> Result<Arc<dyn Consumer>> {
        let topic = self.topic(&opts.topic).await?;
        let sub = topic.subscription(&opts)?;
        Ok(Arc::new(LocalConsumer {
            topic,
            sub,
            outstanding: Mutex::new(HashSet::new()),
            closed: AtomicBool::new(false),
            redelivery_delay: self.inner.redelivery_delay,
        }))
    }

    async fn new_producer(&self, opts: ProducerOptions) -> Result<Arc<dyn Producer>> {
        let topic = self.topic(&opts.topic).await?;
        Ok(Arc::new(LocalProducer {
            topic,
            name: opts.name,
            closed: AtomicBool::new(false),
        }))
    }
}

#[async_trait]
impl MessageStore for LocalLog {
    async fn put_message(&self, queue: &str, data: Bytes) -> Result<MessageId> {
        let topic = self.topic(queue).await?;
        let offset = topic.append(&data)?;
        Ok(topic.message_id(offset))
    }

    #[tracing::instrument(level = "trace", skip(self, filter))]
    async fn get_messages(&self, queue: &str, offset: i64, max_msgs: usize, filter: &TagFilter) -> Result<GetMessageResult> {
        let topic = self.topic(queue).await?;
        let (min_offset, max_offset) = topic_offsets(&topic)?;
        let mut result = GetMessageResult {
            status: GetMessageStatus::NoMessageInQueue,
            messages: vec![],
            next_begin_offset: offset,
            min_offset,
            max_offset,
        };

        if max_offset == 0 {
            result.next_begin_offset = 0;
        } else if offset < min_offset {
            result.status = GetMessageStatus::OffsetTooSmall;
            result.next_begin_offset = min_offset;
        } else if offset == max_offset {
            result.status = GetMessageStatus::OffsetOverflowOne;
        } else if offset > max_offset {
            result.status = GetMessageStatus::OffsetOverflowBadly;
            result.next_begin_offset = if min_offset == 0 { min_offset } else { max_offset };
        } else {
            let start = utils::encode_byte_prefix(PREFIX_ENTRY, offset as u64);
            let stop = utils::encode_byte_prefix(PREFIX_ENTRY, max_offset as u64);
            let mut next_begin = offset;
            for kv_res in topic.tree.range(start..stop).take(MAX_SCAN_ENTRIES) {
                if result.messages.len() >= max_msgs {
                    break;
                }
                let (key, val) = kv_res.context(ERR_ITER_FAILURE)?;
                next_begin = utils::decode_u64(&key[1..])? as i64 + 1;
                let tags_code = peek_tags_code(&val).unwrap_or(0);
                if filter.is_matched(tags_code) {
                    result.messages.push(Bytes::copy_from_slice(&val));
                }
            }
            result.next_begin_offset = next_begin;
            result.status = if result.messages.is_empty() {
                GetMessageStatus::NoMatchedMessage
            } else {
                GetMessageStatus::Found
            };
        }
        Ok(result)
    }

    async fn offsets(&self, queue: &str) -> Result<(i64, i64)> {
        let topic = self.topic(queue).await?;
        topic_offsets(&topic)
    }
}

fn topic_offsets(topic: &TopicLog) -> Result<(i64, i64)> {
    let max_offset = topic.lock_state()?.next_offset;
    let min_offset = topic.first_offset()?.unwrap_or(max_offset);
    Ok((min_offset as i64, max_offset as i64))
}
