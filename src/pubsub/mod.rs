//! Pub/sub client abstractions.
//!
//! The broker treats the underlying log as a black box, interacting with it only through the
//! traits in this module. `local::LocalLog` is an embedded implementation backed by sled.

pub mod local;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;

use crate::codec::MessageIdParts;
use crate::filter::TagFilter;

/// The position of a message in the underlying log.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct MessageId {
    pub ledger_id: i64,
    pub entry_id: i64,
    /// The partition of the message's topic, or -1 for non-partitioned topics.
    pub partition: i32,
}

impl MessageId {
    /// The message id parts of this id, as used for building wire message ids.
    pub fn parts(&self) -> MessageIdParts {
        MessageIdParts {
            ledger_id: self.ledger_id,
            entry_id: self.entry_id,
            partition: self.partition as i64,
            batch_index: -1,
        }
    }
}

/// The durability of a subscription's cursor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubscriptionMode {
    Durable,
    NonDurable,
}

/// How messages of a subscription are distributed over its consumers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubscriptionKind {
    Exclusive,
    Shared,
}

/// Where a new subscription begins.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InitialPosition {
    Earliest,
    Latest,
}

/// Options for subscribing to a topic.
#[derive(Clone, Debug)]
pub struct SubscribeOptions {
    pub topic: String,
    pub subscription: String,
    pub mode: SubscriptionMode,
    pub kind: SubscriptionKind,
    pub initial_position: InitialPosition,
}

/// Options for creating a producer.
#[derive(Clone, Debug)]
pub struct ProducerOptions {
    pub topic: String,
    pub name: String,
    pub send_timeout: Duration,
}

/// A message received from a subscription.
#[derive(Clone, Debug)]
pub struct ConsumedMessage {
    pub id: MessageId,
    pub data: Bytes,
}

/// A consumer of a subscription.
#[async_trait]
pub trait Consumer: Send + Sync {
    /// Receive the next message, waiting at most `timeout`.
    async fn receive(&self, timeout: Duration) -> Result<Option<ConsumedMessage>>;

    /// Acknowledge the given message, it will not be delivered again.
    async fn acknowledge(&self, id: &MessageId) -> Result<()>;

    /// Negatively acknowledge the given message, scheduling it for redelivery.
    async fn negative_acknowledge(&self, id: &MessageId) -> Result<()>;

    /// Close this consumer, outstanding messages become available for redelivery.
    async fn close(&self) -> Result<()>;
}

/// A producer bound to a single topic.
#[async_trait]
pub trait Producer: Send + Sync {
    async fn send(&self, data: Bytes) -> Result<MessageId>;

    async fn close(&self) -> Result<()>;

    fn topic(&self) -> &str;
}

/// A client of the underlying pub/sub system.
#[async_trait]
pub trait PubSubClient: Send + Sync {
    async fn subscribe(&self, opts: SubscribeOptions) -> Result<Arc<dyn Consumer>>;

    async fn new_producer(&self, opts: ProducerOptions) -> Result<Arc<dyn Producer>>;
}

/// The outcome of reading from a queue of the message store.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GetMessageStatus {
    Found,
    NoMatchedMessage,
    NoMessageInQueue,
    OffsetOverflowOne,
    OffsetOverflowBadly,
    OffsetTooSmall,
}

/// The result of reading from a queue of the message store.
#[derive(Clone, Debug)]
pub struct GetMessageResult {
    pub status: GetMessageStatus,
    /// The stored records found, each still carrying its tags code prefix.
    pub messages: Vec<Bytes>,
    pub next_begin_offset: i64,
    pub min_offset: i64,
    pub max_offset: i64,
}

/// Offset addressed access to queues of the underlying log.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Append a stored record to the given queue, returning its position.
    async fn put_message(&self, queue: &str, data: Bytes) -> Result<MessageId>;

    /// Read up to `max_msgs` records matching `filter`, starting at `offset`.
    async fn get_messages(&self, queue: &str, offset: i64, max_msgs: usize, filter: &TagFilter) -> Result<GetMessageResult>;

    /// The min and max offsets of the given queue, max being the next offset to be written.
    async fn offsets(&self, queue: &str) -> Result<(i64, i64)>;
}
