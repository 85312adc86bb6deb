//! Request processors.
//!
//! Each request category is bound to a single processor at startup. A processor either
//! answers a request right away or, for pulls, takes ownership of it until it can be answered.

mod client;
mod consumer;
mod pull;
mod send;
#[cfg(test)]
mod send_test;

use async_trait::async_trait;

use crate::dispatch::RequestTask;
use crate::error::AppError;
use crate::remoting::RemotingCommand;

pub use client::ClientManageProcessor;
pub use consumer::{ConsumerManageProcessor, ConsumerOffsetTable};
pub use pull::{map_get_message_status, pull_sys_flag, PullMessageProcessor};
pub use send::SendMessageProcessor;

/// A processor of requests.
#[async_trait]
pub trait RequestProcessor: Send + Sync {
    /// Process the given request, returning its response.
    ///
    /// `None` is returned when the request needs no response now, either because it is oneway
    /// or because it has been held to be answered later.
    async fn process(&self, task: RequestTask) -> Option<RemotingCommand>;
}

/// The processor of every request code this broker does not serve.
pub struct DefaultProcessor;

#[async_trait]
impl RequestProcessor for DefaultProcessor {
    async fn process(&self, task: RequestTask) -> Option<RemotingCommand> {
        tracing::debug!(code = task.command.code, peer = %task.peer, "request code not supported");
        Some(AppError::NotSupported(task.command.code).into_response(task.command.opaque))
    }
}
