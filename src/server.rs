//! The client facing TCP server.
//!
//! Each connection is split into a reader, which decodes request frames and submits them to the
//! dispatch table by category, and a writer, which drains the connection's response channel.
//! Responses are written in the order processors produce them, which is not necessarily the
//! order requests arrived in. Clients correlate them by opaque.

mod prom;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use futures::stream::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::codec::FramedRead;

use crate::config::Config;
use crate::dispatch::{DispatchTable, RequestTask};
use crate::remoting::{RemotingCodec, RemotingCommand};

pub use prom::spawn_prom_server;

const METRIC_CONNECTIONS: &str = "rop_server_connections_total";
/// The number of responses which may be waiting to be written to a single connection.
const RESPONSE_BUFFER: usize = 1024;

/// Application server.
pub struct BrokerServer {
    /// The application's runtime config.
    config: Arc<Config>,
    /// The table requests are dispatched through.
    dispatch: DispatchTable,
    listener: TcpListener,

    /// A channel used for triggering graceful shutdown.
    shutdown_tx: broadcast::Sender<()>,
    /// A channel used for triggering graceful shutdown.
    shutdown_rx: broadcast::Receiver<()>,
}

impl BrokerServer {
    /// Create a new instance, binding the client listener.
    pub async fn new(config: Arc<Config>, dispatch: DispatchTable, shutdown_tx: broadcast::Sender<()>) -> Result<Self> {
        metrics::describe_counter!(METRIC_CONNECTIONS, metrics::Unit::Count, "the number of client connections accepted");
        let listener = TcpListener::bind(("0.0.0.0", config.listen_port))
            .await
            .context("error binding socket address for client server")?;
        Ok(Self {
            config,
            dispatch,
            listener,
            shutdown_rx: shutdown_tx.subscribe(),
            shutdown_tx,
        })
    }

    /// The address the client listener is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener.local_addr().context("error reading client server address")
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        tracing::info!(port = self.config.listen_port, "client server is listening");
        loop {
            tokio::select! {
                sock_res = self.listener.accept() => {
                    let (stream, peer) = match sock_res {
                        Ok((stream, peer)) => (stream, peer),
                        Err(err) => {
                            tracing::error!(error = ?err, "error accepting client socket connection");
                            let _res = self.shutdown_tx.send(());
                            break;
                        }
                    };
                    metrics::counter!(METRIC_CONNECTIONS).increment(1);
                    let connection = Connection {
                        peer,
                        dispatch: self.dispatch.clone(),
                        shutdown_rx: self.shutdown_tx.subscribe(),
                    };
                    tokio::spawn(connection.run(stream));
                }
                _ = self.shutdown_rx.recv() => break,
            }
        }
        tracing::debug!("client server has shutdown");
        Ok(())
    }
}

/// A single client connection.
struct Connection {
    peer: SocketAddr,
    dispatch: DispatchTable,
    shutdown_rx: broadcast::Receiver<()>,
}

impl Connection {
    #[tracing::instrument(level = "debug", skip(self, stream), fields(peer = %self.peer))]
    async fn run(mut self, stream: TcpStream) {
        tracing::debug!("client connected");
        let (read_half, write_half) = stream.into_split();
        let mut frames = FramedRead::new(read_half, RemotingCodec);
        let (tx, rx) = mpsc::channel(RESPONSE_BUFFER);
        let peer = self.peer;
        tokio::spawn(async move {
            if let Err(err) = write_responses(write_half, rx).await {
                tracing::debug!(error = ?err, %peer, "error writing to client connection");
            }
        });

        loop {
            tokio::select! {
                frame = frames.next() => match frame {
                    Some(Ok(cmd)) => self.handle_command(cmd, &tx),
                    Some(Err(err)) => {
                        tracing::warn!(error = ?err, "closing client connection after invalid frame");
                        break;
                    }
                    None => break,
                },
                _ = self.shutdown_rx.recv() => break,
            }
        }
        tracing::debug!("client disconnected");
    }

    fn handle_command(&self, cmd: RemotingCommand, tx: &mpsc::Sender<RemotingCommand>) {
        if cmd.is_response() {
            tracing::debug!(opaque = cmd.opaque, code = cmd.code, "ignoring unsolicited response from client");
            return;
        }
        let task = RequestTask::new(cmd, self.peer, tx.clone());
        let category = task.category();
        if let Err(err) = self.dispatch.submit(category, task) {
            tracing::warn!(error = %err, category = category.as_str(), "request rejected");
            err.reply_busy();
        }
    }
}

/// Write every response sent on the given channel, until all senders are gone.
///
/// The frame prefix and each body chunk are written separately, so pulled records reach the
/// socket without being copied into a single buffer.
async fn write_responses(mut writer: OwnedWriteHalf, mut rx: mpsc::Receiver<RemotingCommand>) -> Result<()> {
    while let Some(cmd) = rx.recv().await {
        let prefix = RemotingCodec::encode_header(&cmd)?;
        writer.write_all(&prefix).await.context("error writing response header")?;
        for chunk in cmd.body.chunks() {
            writer.write_all(&chunk).await.context("error writing response body")?;
        }
    }
    writer.shutdown().await.context("error shutting down connection writer")
}
