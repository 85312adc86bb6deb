use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::sync::mpsc;

use super::*;
use crate::config::Config;
use crate::remoting::{request_code, response_code, RemotingCommand, FLAG_ONEWAY};

/// A processor answering every request with success, counting requests processed.
#[derive(Default)]
struct CountingProcessor {
    processed: AtomicUsize,
}

#[async_trait]
impl RequestProcessor for CountingProcessor {
    async fn process(&self, task: RequestTask) -> Option<RemotingCommand> {
        self.processed.fetch_add(1, Ordering::SeqCst);
        Some(RemotingCommand::new_response(response_code::SUCCESS, task.command.opaque, None))
    }
}

fn test_config(capacity: usize) -> Result<(Config, tempfile::TempDir)> {
    let (config, tmpdir) = Config::new_test()?;
    let mut config = Config::clone(&config);
    config.pull_queue_capacity = capacity;
    config.pull_threads = 2;
    Ok((config, tmpdir))
}

fn pull_task(tx: &mpsc::Sender<RemotingCommand>) -> Result<RequestTask> {
    let peer: SocketAddr = "127.0.0.1:40000".parse()?;
    Ok(RequestTask::new(RemotingCommand::new_request(request_code::PULL_MESSAGE), peer, tx.clone()))
}

#[test]
fn request_codes_map_to_categories() {
    let cases = [
        (request_code::SEND_MESSAGE, RequestCategory::Send),
        (request_code::SEND_MESSAGE_V2, RequestCategory::Send),
        (request_code::CONSUMER_SEND_MSG_BACK, RequestCategory::Send),
        (request_code::PULL_MESSAGE, RequestCategory::Pull),
        (request_code::QUERY_MESSAGE, RequestCategory::Query),
        (request_code::VIEW_MESSAGE_BY_ID, RequestCategory::Query),
        (request_code::HEART_BEAT, RequestCategory::Heartbeat),
        (request_code::UNREGISTER_CLIENT, RequestCategory::ClientManage),
        (request_code::CHECK_CLIENT_CONFIG, RequestCategory::ClientManage),
        (request_code::QUERY_CONSUMER_OFFSET, RequestCategory::ConsumerManage),
        (request_code::UPDATE_CONSUMER_OFFSET, RequestCategory::ConsumerManage),
        (request_code::GET_CONSUMER_LIST_BY_GROUP, RequestCategory::ConsumerManage),
        (request_code::END_TRANSACTION, RequestCategory::EndTransaction),
        (17, RequestCategory::Admin),
        (9999, RequestCategory::Admin),
    ];
    for (code, expected) in cases {
        let category = RequestCategory::from_request_code(code);
        assert_eq!(category, expected, "expected code {} to map to {:?}, got {:?}", code, expected, category);
    }
}

#[tokio::test]
async fn submissions_beyond_capacity_are_rejected() -> Result<()> {
    let (config, _tmpdir) = test_config(3)?;
    let table = DispatchTable::new(&config);
    let (tx, mut rx) = mpsc::channel(16);

    for _ in 0..3 {
        table.submit(RequestCategory::Pull, pull_task(&tx)?).map_err(|err| anyhow::anyhow!("{}", err))?;
    }
    let res = table.submit(RequestCategory::Pull, pull_task(&tx)?);
    assert!(
        matches!(res, Err(DispatchError::Rejected { category: RequestCategory::Pull, .. })),
        "expected the submission beyond capacity to be rejected, got {:?}",
        res.as_ref().map_err(|err| err.to_string())
    );
    assert_eq!(table.queue_size(RequestCategory::Pull), 3, "expected 3 queued, got {}", table.queue_size(RequestCategory::Pull));

    // Other categories are unaffected by a full pull queue.
    let send = RequestTask::new(RemotingCommand::new_request(request_code::SEND_MESSAGE), "127.0.0.1:40000".parse()?, tx.clone());
    assert!(table.submit(RequestCategory::Send, send).is_ok(), "expected the send queue to accept");

    let processor = Arc::new(CountingProcessor::default());
    let handles = table.register(RequestCategory::Pull, processor.clone());
    for _ in 0..3 {
        let response = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .context("timeout waiting for response")?
            .context("response channel closed")?;
        assert_eq!(response.code, response_code::SUCCESS, "expected success, got {}", response.code);
        assert!(response.is_response(), "expected the response flag to be set");
    }
    let processed = processor.processed.load(Ordering::SeqCst);
    assert_eq!(processed, 3, "expected all accepted requests to be executed, got {}", processed);

    table.shutdown();
    for handle in handles {
        handle.await.context("error joining worker")??;
    }
    Ok(())
}

#[tokio::test]
async fn rejected_request_is_answered_busy() -> Result<()> {
    let (config, _tmpdir) = test_config(0)?;
    let table = DispatchTable::new(&config);
    let (tx, mut rx) = mpsc::channel(16);
    let task = pull_task(&tx)?;
    let opaque = task.command.opaque;

    let err = match table.submit(RequestCategory::Pull, task) {
        Ok(_) => anyhow::bail!("expected a zero capacity queue to reject"),
        Err(err) => err,
    };
    err.reply_busy();
    let response = rx.recv().await.context("expected a busy response")?;
    assert_eq!(response.code, response_code::SYSTEM_BUSY, "expected system busy, got {}", response.code);
    assert_eq!(response.opaque, opaque, "expected opaque {}, got {}", opaque, response.opaque);
    Ok(())
}

#[tokio::test]
async fn head_wait_time_tracks_oldest_request() -> Result<()> {
    let (config, _tmpdir) = test_config(10)?;
    let table = DispatchTable::new(&config);
    let (tx, _rx) = mpsc::channel(16);

    assert_eq!(table.head_wait_time(RequestCategory::Pull), Duration::ZERO, "expected zero head wait for an empty queue");
    table.submit(RequestCategory::Pull, pull_task(&tx)?).map_err(|err| anyhow::anyhow!("{}", err))?;
    tokio::time::sleep(Duration::from_millis(30)).await;
    table.submit(RequestCategory::Pull, pull_task(&tx)?).map_err(|err| anyhow::anyhow!("{}", err))?;

    let head_wait = table.head_wait_time(RequestCategory::Pull);
    assert!(head_wait >= Duration::from_millis(30), "expected head wait of at least 30ms, got {:?}", head_wait);
    table.log_watermarks();
    Ok(())
}

#[tokio::test]
async fn shutdown_answers_queued_requests_busy() -> Result<()> {
    let (config, _tmpdir) = test_config(10)?;
    let table = DispatchTable::new(&config);
    let (tx, mut rx) = mpsc::channel(16);
    table.submit(RequestCategory::Pull, pull_task(&tx)?).map_err(|err| anyhow::anyhow!("{}", err))?;
    table.submit(RequestCategory::Pull, pull_task(&tx)?).map_err(|err| anyhow::anyhow!("{}", err))?;

    table.shutdown();
    for _ in 0..2 {
        let response = rx.recv().await.context("expected a busy response")?;
        assert_eq!(response.code, response_code::SYSTEM_BUSY, "expected system busy, got {}", response.code);
    }
    let res = table.submit(RequestCategory::Pull, pull_task(&tx)?);
    assert!(matches!(res, Err(DispatchError::Shutdown { .. })), "expected submissions after shutdown to fail");
    Ok(())
}

#[tokio::test]
async fn oneway_requests_are_not_answered() -> Result<()> {
    let (config, _tmpdir) = test_config(10)?;
    let table = DispatchTable::new(&config);
    let (tx, mut rx) = mpsc::channel(16);
    let processor = Arc::new(CountingProcessor::default());
    let handles = table.register(RequestCategory::Pull, processor.clone());

    let mut cmd = RemotingCommand::new_request(request_code::PULL_MESSAGE);
    cmd.flag |= FLAG_ONEWAY;
    let task = RequestTask::new(cmd, "127.0.0.1:40000".parse()?, tx.clone());
    table.submit(RequestCategory::Pull, task).map_err(|err| anyhow::anyhow!("{}", err))?;

    let res = tokio::time::timeout(Duration::from_millis(100), rx.recv()).await;
    assert!(res.is_err(), "expected no response to a oneway request");
    assert_eq!(processor.processed.load(Ordering::SeqCst), 1, "expected the oneway request to be processed");

    table.shutdown();
    for handle in handles {
        handle.await.context("error joining worker")??;
    }
    Ok(())
}
