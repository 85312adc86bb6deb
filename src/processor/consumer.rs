use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use serde::Serialize;

use crate::dispatch::RequestTask;
use crate::error::AppError;
use crate::processor::RequestProcessor;
use crate::remoting::{request_code, response_code, Payload, RemotingCommand};

/// The committed offsets of consumer groups, keyed by `{topic}@{group}` and then queue id.
///
/// Offsets are only held in memory.
#[derive(Default)]
pub struct ConsumerOffsetTable {
    offsets: Mutex<HashMap<String, HashMap<i32, i64>>>,
}

impl ConsumerOffsetTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn build_key(group: &str, topic: &str) -> String {
        format!("{}@{}", topic, group)
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, HashMap<i32, i64>>> {
        self.offsets.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Commit the offset of the given group on the given queue.
    pub fn commit(&self, group: &str, topic: &str, queue_id: i32, offset: i64) {
        self.lock().entry(Self::build_key(group, topic)).or_default().insert(queue_id, offset);
    }

    /// The committed offset of the given group on the given queue.
    pub fn query(&self, group: &str, topic: &str, queue_id: i32) -> Option<i64> {
        self.lock()
            .get(&Self::build_key(group, topic))
            .and_then(|queues| queues.get(&queue_id).copied())
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ConsumerListBody {
    consumer_id_list: Vec<String>,
}

/// The processor of consumer offset and membership requests.
pub struct ConsumerManageProcessor {
    offsets: Arc<ConsumerOffsetTable>,
}

impl ConsumerManageProcessor {
    pub fn new(offsets: Arc<ConsumerOffsetTable>) -> Self {
        Self { offsets }
    }

    fn handle(&self, cmd: &RemotingCommand) -> Result<RemotingCommand, AppError> {
        match cmd.code {
            request_code::QUERY_CONSUMER_OFFSET => {
                let (group, topic): (String, String) = (cmd.ext_required("consumerGroup")?, cmd.ext_required("topic")?);
                let queue_id: i32 = cmd.ext_required("queueId")?;
                match self.offsets.query(&group, &topic, queue_id) {
                    Some(offset) => Ok(RemotingCommand::new_response(response_code::SUCCESS, cmd.opaque, None).with_ext("offset", offset)),
                    None => Ok(RemotingCommand::new_response(
                        response_code::QUERY_NOT_FOUND,
                        cmd.opaque,
                        Some("no committed offset for this group".into()),
                    )),
                }
            }
            request_code::UPDATE_CONSUMER_OFFSET => {
                let (group, topic): (String, String) = (cmd.ext_required("consumerGroup")?, cmd.ext_required("topic")?);
                let queue_id: i32 = cmd.ext_required("queueId")?;
                let offset: i64 = cmd.ext_required("commitOffset")?;
                self.offsets.commit(&group, &topic, queue_id, offset);
                Ok(RemotingCommand::new_response(response_code::SUCCESS, cmd.opaque, None))
            }
            request_code::GET_CONSUMER_LIST_BY_GROUP => {
                let body = serde_json::to_vec(&ConsumerListBody { consumer_id_list: vec![] })
                    .map_err(|err| AppError::Ise(err.into()))?;
                Ok(RemotingCommand::new_response(response_code::SUCCESS, cmd.opaque, None).with_body(Payload::Inline(body.into())))
            }
            code => Err(AppError::NotSupported(code)),
        }
    }
}

#[async_trait]
impl RequestProcessor for ConsumerManageProcessor {
    async fn process(&self, task: RequestTask) -> Option<RemotingCommand> {
        match self.handle(&task.command) {
            Ok(response) => Some(response),
            Err(err) => {
                tracing::error!(error = ?err, code = task.command.code, peer = %task.peer, "error processing consumer manage request");
                Some(err.into_response(task.command.opaque))
            }
        }
    }
}
