use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use serde::Deserialize;
use tokio::time::Instant;

use crate::dispatch::RequestTask;
use crate::error::AppError;
use crate::processor::RequestProcessor;
use crate::remoting::{request_code, response_code, RemotingCommand};

/// The subset of a heartbeat body this broker reads.
#[derive(Debug, Default, Deserialize)]
struct HeartbeatData {
    #[serde(rename = "clientID", default)]
    client_id: String,
}

/// The processor of heartbeats and client registration requests.
///
/// Clients are tracked by id for observability only, they do not influence routing.
#[derive(Default)]
pub struct ClientManageProcessor {
    clients: Mutex<HashMap<String, Instant>>,
}

impl ClientManageProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    /// The number of clients which have sent a heartbeat and not unregistered.
    pub fn client_count(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Instant>> {
        self.clients.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn handle(&self, cmd: &RemotingCommand) -> Result<RemotingCommand, AppError> {
        match cmd.code {
            request_code::HEART_BEAT => {
                // Heartbeats are always accepted, an unreadable body only skips client tracking.
                match serde_json::from_slice::<HeartbeatData>(&cmd.inline_body()) {
                    Ok(data) if !data.client_id.is_empty() => {
                        self.lock().insert(data.client_id, Instant::now());
                    }
                    Ok(_) => (),
                    Err(err) => tracing::debug!(error = %err, "could not read heartbeat body"),
                }
            }
            request_code::UNREGISTER_CLIENT => {
                if let Some(client_id) = cmd.ext("clientID") {
                    self.lock().remove(client_id);
                }
            }
            request_code::CHECK_CLIENT_CONFIG => (),
            code => return Err(AppError::NotSupported(code)),
        }
        Ok(RemotingCommand::new_response(response_code::SUCCESS, cmd.opaque, None))
    }
}

#[async_trait]
impl RequestProcessor for ClientManageProcessor {
    async fn process(&self, task: RequestTask) -> Option<RemotingCommand> {
        match self.handle(&task.command) {
            Ok(response) => Some(response),
            Err(err) => {
                tracing::error!(error = ?err, code = task.command.code, peer = %task.peer, "error processing client manage request");
                Some(err.into_response(task.command.opaque))
            }
        }
    }
}
