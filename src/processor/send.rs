use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use rand::Rng;

use crate::codec::{self, property, string_to_properties, sys_flag, MessageRecord};
use crate::config::Config;
use crate::dispatch::RequestTask;
use crate::error::AppError;
use crate::longpoll::ArrivalListener;
use crate::processor::RequestProcessor;
use crate::pubsub::MessageStore;
use crate::remoting::{request_code, response_code, RemotingCommand};
use crate::schedule::{schedule_topic_name, DelayLevelTable};
use crate::utils;

/// The parsed header of a send request.
#[derive(Debug)]
struct SendMessageHeader {
    producer_group: String,
    topic: String,
    default_topic_queue_nums: i32,
    queue_id: i32,
    sys_flag: i32,
    born_timestamp: i64,
    flag: i32,
    properties: Option<String>,
    reconsume_times: i32,
}

impl SendMessageHeader {
    /// Parse the header of the given command.
    ///
    /// Version 2 requests carry the same fields under single letter names.
    fn from_command(cmd: &RemotingCommand) -> Result<Self, AppError> {
        let v2 = cmd.code == request_code::SEND_MESSAGE_V2;
        let key = |long: &'static str, short: &'static str| if v2 { short } else { long };
        Ok(Self {
            producer_group: cmd.ext_required(key("producerGroup", "a"))?,
            topic: cmd.ext_required(key("topic", "b"))?,
            default_topic_queue_nums: cmd.ext_or(key("defaultTopicQueueNums", "d"), 4)?,
            queue_id: cmd.ext_required(key("queueId", "e"))?,
            sys_flag: cmd.ext_or(key("sysFlag", "f"), 0)?,
            born_timestamp: cmd.ext_or(key("bornTimestamp", "g"), 0)?,
            flag: cmd.ext_or(key("flag", "h"), 0)?,
            properties: cmd.ext(key("properties", "i")).map(String::from),
            reconsume_times: cmd.ext_or(key("reconsumeTimes", "j"), 0)?,
        })
    }
}

/// The processor of send requests.
///
/// Messages sent with a delay level are redirected to that level's schedule topic, carrying
/// their real destination in reserved properties.
pub struct SendMessageProcessor {
    config: Arc<Config>,
    store: Arc<dyn MessageStore>,
    levels: Arc<DelayLevelTable>,
    listener: Arc<dyn ArrivalListener>,
    store_host: SocketAddr,
}

impl SendMessageProcessor {
    /// Create a new instance.
    pub fn new(config: Arc<Config>, store: Arc<dyn MessageStore>, levels: Arc<DelayLevelTable>, listener: Arc<dyn ArrivalListener>) -> anyhow::Result<Self> {
        let store_host = format!("{}:{}", config.broker_host, config.listen_port)
            .parse()
            .with_context(|| format!("invalid broker host {}", config.broker_host))?;
        Ok(Self {
            config,
            store,
            levels,
            listener,
            store_host,
        })
    }

    #[tracing::instrument(level = "trace", skip(self, task), fields(peer = %task.peer))]
    async fn send(&self, task: &RequestTask) -> Result<RemotingCommand, AppError> {
        let cmd = &task.command;
        if cmd.code != request_code::SEND_MESSAGE && cmd.code != request_code::SEND_MESSAGE_V2 {
            return Err(AppError::NotSupported(cmd.code));
        }
        let header = SendMessageHeader::from_command(cmd)?;
        if header.topic.is_empty() {
            return Err(AppError::InvalidInput("the topic of a message may not be empty".into()));
        }
        let queue_id = if header.queue_id < 0 {
            rand::thread_rng().gen_range(0..header.default_topic_queue_nums.max(1))
        } else {
            header.queue_id
        };

        let mut record = MessageRecord {
            topic: header.topic,
            queue_id,
            flag: header.flag,
            sys_flag: header.sys_flag,
            born_timestamp: header.born_timestamp,
            born_host: task.peer,
            store_timestamp: utils::now_millis(),
            store_host: self.store_host,
            reconsume_times: header.reconsume_times,
            body: cmd.inline_body(),
            properties: header.properties.as_deref().map(string_to_properties).unwrap_or_default(),
            ..Default::default()
        };
        record.refresh_tags_code();
        let delayed = self.apply_delay_level(&mut record);

        let queue = if delayed {
            record.topic.clone()
        } else {
            utils::partition_name(&record.topic, record.queue_id)
        };
        let data = codec::encode(&record)?;
        let id = self.store.put_message(&queue, data).await.map_err(AppError::Ise)?;
        tracing::trace!(producer_group = %header.producer_group, %queue, offset = id.entry_id, delayed, "message stored");
        if !delayed {
            self.listener.on_arrival(&record.topic, record.queue_id);
        }

        let msg_id = codec::create_message_id(id.ledger_id, id.entry_id, record.queue_id as i64, -1);
        Ok(RemotingCommand::new_response(response_code::SUCCESS, cmd.opaque, None)
            .with_ext("msgId", msg_id)
            .with_ext("queueId", record.queue_id)
            .with_ext("queueOffset", id.entry_id))
    }

    /// Redirect the record to the schedule topic of its delay level, if it has one.
    ///
    /// Levels beyond the highest configured level are clamped to it. Returns whether the
    /// record was redirected.
    fn apply_delay_level(&self, record: &mut MessageRecord) -> bool {
        let tran_type = record.sys_flag & sys_flag::TRANSACTION_ROLLBACK_TYPE;
        if tran_type != sys_flag::TRANSACTION_NOT_TYPE && tran_type != sys_flag::TRANSACTION_COMMIT_TYPE {
            return false;
        }
        let Some(requested) = record.delay_level() else {
            return false;
        };
        let level = requested.min(self.levels.max_level());
        let Some(token) = self.levels.token(level) else {
            tracing::warn!(level = requested, topic = %record.topic, "no delay levels registered, delivering immediately");
            return false;
        };

        record.properties.insert(property::DELAY_TIME_LEVEL.into(), level.to_string());
        record.properties.insert(property::REAL_TOPIC.into(), record.topic.clone());
        record.properties.insert(property::REAL_QUEUE_ID.into(), record.queue_id.to_string());
        record.topic = schedule_topic_name(&self.config.schedule_topic_prefix, &token);
        record.queue_id = 0;
        true
    }
}

#[async_trait]
impl RequestProcessor for SendMessageProcessor {
    async fn process(&self, task: RequestTask) -> Option<RemotingCommand> {
        match self.send(&task).await {
            Ok(response) => Some(response),
            Err(err) => {
                tracing::error!(error = ?err, code = task.command.code, peer = %task.peer, "error processing send request");
                Some(err.into_response(task.command.opaque))
            }
        }
    }
}
