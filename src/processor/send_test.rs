use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use bytes::Bytes;

use crate::codec::{self, decode_message_id, property, properties_to_string, sys_flag, MessageRecord};
use crate::config::Config;
use crate::filter::TagFilter;
use crate::fixtures::{request_task, RecordingListener, TEST_PEER};
use crate::processor::{RequestProcessor, SendMessageProcessor};
use crate::pubsub::local::LocalLog;
use crate::pubsub::MessageStore;
use crate::remoting::{request_code, response_code, Payload, RemotingCommand};
use crate::schedule::DelayLevelTable;

struct Harness {
    log: Arc<LocalLog>,
    listener: Arc<RecordingListener>,
    processor: SendMessageProcessor,
    _tmpdir: tempfile::TempDir,
}

async fn new_harness(levels: &str) -> Result<Harness> {
    let (config, tmpdir) = Config::new_test()?;
    let log = Arc::new(LocalLog::new(config.clone()).await?);
    let table = Arc::new(DelayLevelTable::new());
    if !levels.is_empty() {
        table.parse(levels)?;
    }
    let listener = Arc::new(RecordingListener::default());
    let processor = SendMessageProcessor::new(config, log.clone(), table, listener.clone())?;
    Ok(Harness {
        log,
        listener,
        processor,
        _tmpdir: tmpdir,
    })
}

fn send_request(topic: &str, queue_id: i32, properties: &[(&str, &str)]) -> RemotingCommand {
    let properties: BTreeMap<String, String> = properties.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
    RemotingCommand::new_request(request_code::SEND_MESSAGE)
        .with_ext("producerGroup", "billing-producers")
        .with_ext("topic", topic)
        .with_ext("defaultTopic", "TBW102")
        .with_ext("defaultTopicQueueNums", 4)
        .with_ext("queueId", queue_id)
        .with_ext("sysFlag", 0)
        .with_ext("bornTimestamp", 1_700_000_000_000i64)
        .with_ext("flag", 0)
        .with_ext("properties", properties_to_string(&properties))
        .with_ext("reconsumeTimes", 0)
        .with_body(Payload::Inline(Bytes::from_static(b"invoice-created")))
}

async fn read_stored(log: &LocalLog, queue: &str) -> Result<Vec<MessageRecord>> {
    let result = log.get_messages(queue, 0, 32, &TagFilter::all()).await?;
    result
        .messages
        .into_iter()
        .map(|mut stored| codec::decode(&mut stored, None, true).context("stored record did not decode"))
        .collect()
}

#[tokio::test]
async fn send_stores_message_on_its_queue() -> Result<()> {
    let harness = new_harness("").await?;
    let (task, _rx) = request_task(send_request("invoices", 2, &[(property::TAGS, "created")]))?;
    let opaque = task.command.opaque;

    let response = harness.processor.process(task).await.context("expected a response")?;
    assert_eq!(response.code, response_code::SUCCESS, "expected success, got {} {:?}", response.code, response.remark);
    assert_eq!(response.opaque, opaque, "expected opaque {} got {}", opaque, response.opaque);
    assert_eq!(response.ext("queueId"), Some("2"), "expected queue id 2 got {:?}", response.ext("queueId"));
    assert_eq!(response.ext("queueOffset"), Some("0"), "expected queue offset 0 got {:?}", response.ext("queueOffset"));
    let msg_id = response.ext("msgId").context("expected a msgId")?;
    let parts = decode_message_id(msg_id)?;
    assert_eq!(parts.partition, 2, "expected msg id partition 2 got {}", parts.partition);

    let stored = read_stored(&harness.log, "invoices-partition-2").await?;
    assert_eq!(stored.len(), 1, "expected 1 stored record got {}", stored.len());
    let record = &stored[0];
    assert_eq!(record.topic, "invoices", "unexpected topic {}", record.topic);
    assert_eq!(record.body.as_ref(), b"invoice-created", "unexpected body {:?}", record.body);
    assert_eq!(record.born_host.to_string(), TEST_PEER, "unexpected born host {}", record.born_host);
    assert_eq!(record.store_host.to_string(), "127.0.0.1:9876", "unexpected store host {}", record.store_host);
    assert_eq!(
        record.tags_code,
        codec::tags_string_to_tags_code("created"),
        "expected the tags code to be computed from the TAGS property"
    );

    let arrivals = harness.listener.arrivals();
    assert_eq!(arrivals, vec![("invoices".to_string(), 2)], "unexpected arrivals {:?}", arrivals);
    Ok(())
}

#[tokio::test]
async fn send_v2_reads_short_header_names() -> Result<()> {
    let harness = new_harness("").await?;
    let cmd = RemotingCommand::new_request(request_code::SEND_MESSAGE_V2)
        .with_ext("a", "billing-producers")
        .with_ext("b", "invoices")
        .with_ext("d", 4)
        .with_ext("e", 1)
        .with_ext("f", 0)
        .with_ext("g", 1_700_000_000_000i64)
        .with_ext("h", 7)
        .with_ext("j", 3)
        .with_body(Payload::Inline(Bytes::from_static(b"v2")));
    let (task, _rx) = request_task(cmd)?;

    let response = harness.processor.process(task).await.context("expected a response")?;
    assert_eq!(response.code, response_code::SUCCESS, "expected success, got {} {:?}", response.code, response.remark);

    let stored = read_stored(&harness.log, "invoices-partition-1").await?;
    assert_eq!(stored.len(), 1, "expected 1 stored record got {}", stored.len());
    assert_eq!(stored[0].flag, 7, "expected flag 7 got {}", stored[0].flag);
    assert_eq!(stored[0].reconsume_times, 3, "expected reconsume times 3 got {}", stored[0].reconsume_times);
    assert_eq!(stored[0].born_timestamp, 1_700_000_000_000, "unexpected born timestamp {}", stored[0].born_timestamp);
    Ok(())
}

#[tokio::test]
async fn delayed_send_is_redirected_to_schedule_topic() -> Result<()> {
    let harness = new_harness("1s 5s").await?;
    // Level 9 is beyond the highest configured level and is clamped to 2.
    let (task, _rx) = request_task(send_request("invoices", 3, &[(property::DELAY_TIME_LEVEL, "9")]))?;

    let response = harness.processor.process(task).await.context("expected a response")?;
    assert_eq!(response.code, response_code::SUCCESS, "expected success, got {} {:?}", response.code, response.remark);

    let direct = harness.log.offsets("invoices-partition-3").await?;
    assert_eq!(direct, (0, 0), "expected nothing on the real queue, got offsets {:?}", direct);
    let stored = read_stored(&harness.log, "SCHEDULE_TOPIC_XXXX_5s").await?;
    assert_eq!(stored.len(), 1, "expected 1 scheduled record got {}", stored.len());
    let record = &stored[0];
    assert_eq!(record.topic, "SCHEDULE_TOPIC_XXXX_5s", "unexpected topic {}", record.topic);
    assert_eq!(record.queue_id, 0, "expected schedule queue 0 got {}", record.queue_id);
    assert_eq!(record.delay_level(), Some(2), "expected clamped level 2 got {:?}", record.delay_level());
    assert_eq!(record.properties.get(property::REAL_TOPIC).map(String::as_str), Some("invoices"));
    assert_eq!(record.properties.get(property::REAL_QUEUE_ID).map(String::as_str), Some("3"));

    assert!(harness.listener.arrivals().is_empty(), "expected no arrival notification for a delayed send");
    Ok(())
}

#[tokio::test]
async fn prepared_transaction_is_never_delayed() -> Result<()> {
    let harness = new_harness("1s").await?;
    let cmd = send_request("invoices", 0, &[(property::DELAY_TIME_LEVEL, "1")]).with_ext("sysFlag", sys_flag::TRANSACTION_PREPARED_TYPE);
    let (task, _rx) = request_task(cmd)?;

    let response = harness.processor.process(task).await.context("expected a response")?;
    assert_eq!(response.code, response_code::SUCCESS, "expected success, got {}", response.code);
    let stored = read_stored(&harness.log, "invoices-partition-0").await?;
    assert_eq!(stored.len(), 1, "expected the prepared message on its real queue, got {}", stored.len());
    Ok(())
}

#[tokio::test]
async fn delay_without_levels_delivers_immediately() -> Result<()> {
    let harness = new_harness("").await?;
    let (task, _rx) = request_task(send_request("invoices", 0, &[(property::DELAY_TIME_LEVEL, "3")]))?;

    let response = harness.processor.process(task).await.context("expected a response")?;
    assert_eq!(response.code, response_code::SUCCESS, "expected success, got {}", response.code);
    let stored = read_stored(&harness.log, "invoices-partition-0").await?;
    assert_eq!(stored.len(), 1, "expected the message on its real queue, got {}", stored.len());
    Ok(())
}

#[tokio::test]
async fn negative_queue_id_selects_a_queue() -> Result<()> {
    let harness = new_harness("").await?;
    let (task, _rx) = request_task(send_request("invoices", -1, &[]))?;

    let response = harness.processor.process(task).await.context("expected a response")?;
    let queue_id: i32 = response.ext("queueId").context("expected a queue id")?.parse()?;
    assert!((0..4).contains(&queue_id), "expected a queue id within 0..4 got {}", queue_id);
    Ok(())
}

#[tokio::test]
async fn send_errors_are_answered() -> Result<()> {
    let harness = new_harness("").await?;

    let (task, _rx) = request_task(RemotingCommand::new_request(request_code::SEND_MESSAGE).with_ext("topic", "invoices"))?;
    let response = harness.processor.process(task).await.context("expected a response")?;
    assert_eq!(response.code, response_code::SYSTEM_ERROR, "expected system error for a missing header, got {}", response.code);

    let (task, _rx) = request_task(RemotingCommand::new_request(request_code::CONSUMER_SEND_MSG_BACK))?;
    let response = harness.processor.process(task).await.context("expected a response")?;
    assert_eq!(
        response.code,
        response_code::REQUEST_CODE_NOT_SUPPORTED,
        "expected request code not supported, got {}",
        response.code
    );
    Ok(())
}
