use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use crate::codec::strip_tags_code;
use crate::config::Config;
use crate::dispatch::RequestTask;
use crate::error::AppError;
use crate::filter::TagFilter;
use crate::longpoll::{HeldPullRequest, PullRequestHoldService};
use crate::processor::{ConsumerOffsetTable, RequestProcessor};
use crate::pubsub::{GetMessageStatus, MessageStore};
use crate::remoting::{response_code, Payload, RemotingCommand};
use crate::utils;

/// Pull request system flags.
pub mod pull_sys_flag {
    pub const COMMIT_OFFSET: i32 = 0x1;
    pub const SUSPEND: i32 = 0x1 << 1;
    pub const SUBSCRIPTION: i32 = 0x1 << 2;
    pub const CLASS_FILTER: i32 = 0x1 << 3;
}

/// The id of the master broker, which every pull is pointed back at.
const MASTER_ID: i64 = 0;

/// The parsed header of a pull request.
#[derive(Debug)]
struct PullMessageHeader {
    consumer_group: String,
    topic: String,
    queue_id: i32,
    queue_offset: i64,
    max_msg_nums: i32,
    sys_flag: i32,
    commit_offset: i64,
    suspend_timeout_millis: u64,
    subscription: Option<String>,
}

impl PullMessageHeader {
    fn from_command(cmd: &RemotingCommand) -> Result<Self, AppError> {
        Ok(Self {
            consumer_group: cmd.ext_required("consumerGroup")?,
            topic: cmd.ext_required("topic")?,
            queue_id: cmd.ext_required("queueId")?,
            queue_offset: cmd.ext_required("queueOffset")?,
            max_msg_nums: cmd.ext_required("maxMsgNums")?,
            sys_flag: cmd.ext_required("sysFlag")?,
            commit_offset: cmd.ext_or("commitOffset", 0)?,
            suspend_timeout_millis: cmd.ext_or("suspendTimeoutMillis", 0)?,
            subscription: cmd.ext("subscription").map(String::from),
        })
    }

    fn has(&self, flag: i32) -> bool {
        self.sys_flag & flag != 0
    }
}

/// Map the status of a store read onto a pull response code.
pub fn map_get_message_status(status: GetMessageStatus, request_offset: i64) -> i32 {
    match status {
        GetMessageStatus::Found => response_code::SUCCESS,
        GetMessageStatus::NoMessageInQueue if request_offset != 0 => response_code::PULL_OFFSET_MOVED,
        GetMessageStatus::NoMessageInQueue => response_code::PULL_NOT_FOUND,
        GetMessageStatus::OffsetOverflowOne => response_code::PULL_NOT_FOUND,
        GetMessageStatus::OffsetOverflowBadly | GetMessageStatus::OffsetTooSmall => response_code::PULL_OFFSET_MOVED,
        GetMessageStatus::NoMatchedMessage => response_code::PULL_RETRY_IMMEDIATELY,
    }
}

/// The processor of pull requests.
///
/// Pulls finding no messages are held by the hold service when the client permits it, and are
/// answered once they are resumed.
pub struct PullMessageProcessor {
    config: Arc<Config>,
    store: Arc<dyn MessageStore>,
    hold: Arc<PullRequestHoldService>,
    offsets: Arc<ConsumerOffsetTable>,
}

impl PullMessageProcessor {
    /// Create a new instance.
    pub fn new(config: Arc<Config>, store: Arc<dyn MessageStore>, hold: Arc<PullRequestHoldService>, offsets: Arc<ConsumerOffsetTable>) -> Self {
        Self {
            config,
            store,
            hold,
            offsets,
        }
    }

    #[tracing::instrument(level = "trace", skip(self, task), fields(peer = %task.peer, allow_suspend = task.allow_suspend))]
    async fn pull(&self, task: RequestTask) -> Result<Option<RemotingCommand>, AppError> {
        let header = PullMessageHeader::from_command(&task.command)?;
        if header.queue_id < 0 {
            return Err(AppError::InvalidInput(format!("queue id {} is illegal, topic {}", header.queue_id, header.topic)));
        }
        let filter = if header.has(pull_sys_flag::SUBSCRIPTION) {
            TagFilter::from_expression(header.subscription.as_deref())
        } else {
            TagFilter::all()
        };

        let queue = utils::partition_name(&header.topic, header.queue_id);
        let result = self
            .store
            .get_messages(&queue, header.queue_offset, header.max_msg_nums.max(0) as usize, &filter)
            .await
            .map_err(AppError::Ise)?;

        let code = map_get_message_status(result.status, header.queue_offset);
        let mut response = RemotingCommand::new_response(code, task.command.opaque, Some(format!("{:?}", result.status)))
            .with_ext("nextBeginOffset", result.next_begin_offset)
            .with_ext("minOffset", result.min_offset)
            .with_ext("maxOffset", result.max_offset)
            .with_ext("suggestWhichBrokerId", MASTER_ID);

        if task.allow_suspend && header.has(pull_sys_flag::COMMIT_OFFSET) {
            self.offsets
                .commit(&header.consumer_group, &header.topic, header.queue_id, header.commit_offset);
        }

        match code {
            response_code::SUCCESS => {
                response.body = Payload::Records(result.messages.iter().map(strip_tags_code).collect());
            }
            response_code::PULL_NOT_FOUND if task.allow_suspend && header.has(pull_sys_flag::SUSPEND) => {
                let hold = if self.config.long_polling_enable {
                    Duration::from_millis(header.suspend_timeout_millis)
                } else {
                    self.config.short_polling_time()
                };
                let request = HeldPullRequest::new(task, header.queue_offset, hold);
                let id = request.id;
                self.hold.suspend(&header.topic, header.queue_id, request);
                // An arrival between the read above and the suspension would otherwise go unnoticed.
                self.recheck_held(&header, &queue, id).await;
                return Ok(None);
            }
            response_code::PULL_OFFSET_MOVED => {
                tracing::warn!(
                    topic = %header.topic,
                    group = %header.consumer_group,
                    request_offset = header.queue_offset,
                    next_begin_offset = result.next_begin_offset,
                    "pull offset moved, asking consumer to retry"
                );
                response.code = response_code::PULL_RETRY_IMMEDIATELY;
            }
            _ => (),
        }
        Ok(Some(response))
    }

    /// Resume the given held request if its queue has grown past the offset it pulls from.
    async fn recheck_held(&self, header: &PullMessageHeader, queue: &str, id: Uuid) {
        match self.store.offsets(queue).await {
            Ok((_, max_offset)) if max_offset > header.queue_offset => {
                if self.hold.resume(&header.topic, header.queue_id, id) {
                    tracing::trace!(%id, topic = %header.topic, queue_id = header.queue_id, max_offset, "messages arrived while suspending pull");
                }
            }
            Ok(_) => (),
            Err(err) => tracing::error!(error = ?err, %queue, "error reading queue offsets for held pull"),
        }
    }
}

#[async_trait]
impl RequestProcessor for PullMessageProcessor {
    async fn process(&self, task: RequestTask) -> Option<RemotingCommand> {
        let (code, opaque, peer) = (task.command.code, task.command.opaque, task.peer);
        match self.pull(task).await {
            Ok(response) => response,
            Err(err) => {
                tracing::error!(error = ?err, code, %peer, "error processing pull request");
                Some(err.into_response(opaque))
            }
        }
    }
}
