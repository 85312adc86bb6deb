use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures::stream::StreamExt;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_stream::wrappers::{BroadcastStream, SignalStream};
use tokio_stream::StreamMap;

use crate::config::Config;
use crate::dispatch::{DispatchTable, RequestCategory};
use crate::longpoll::{ArrivalListener, PullRequestHoldService};
use crate::processor::{
    ClientManageProcessor, ConsumerManageProcessor, ConsumerOffsetTable, DefaultProcessor, PullMessageProcessor, RequestProcessor, SendMessageProcessor,
};
use crate::pubsub::local::LocalLog;
use crate::schedule::ScheduleService;
use crate::server::{spawn_prom_server, BrokerServer};

/// The interval at which request queue watermarks are logged.
const WATERMARK_INTERVAL: Duration = Duration::from_secs(1);

/// The application object for when the broker is running as a server.
pub struct App {
    /// The application's runtime config.
    _config: Arc<Config>,
    /// The application's embedded log.
    log: LocalLog,
    /// The table every request is dispatched through.
    dispatch: DispatchTable,
    /// The service holding suspended pull requests.
    hold: Arc<PullRequestHoldService>,
    /// The delayed message scheduling service.
    schedule: Arc<ScheduleService>,

    /// A channel used for triggering graceful shutdown.
    shutdown_tx: broadcast::Sender<()>,
    /// A channel used for triggering graceful shutdown.
    shutdown_rx: BroadcastStream<()>,

    /// The join handles of every category's worker pool.
    workers: Vec<JoinHandle<Result<()>>>,
    /// The join handle of the held pull reaper.
    reaper: JoinHandle<Result<()>>,
    /// The join handle of the client server.
    client_server: JoinHandle<Result<()>>,
    /// The join handle of the metrics server.
    metrics_server: JoinHandle<Result<()>>,
}

impl App {
    /// Create a new instance.
    pub async fn new(config: Arc<Config>, metrics: PrometheusHandle) -> Result<Self> {
        let (shutdown_tx, _) = broadcast::channel(1);

        // Initialize this node's storage.
        let log = LocalLog::new(config.clone()).await.context("error opening local log")?;
        let store = Arc::new(log.clone());

        let dispatch = DispatchTable::new(&config);
        let hold = Arc::new(PullRequestHoldService::new(&config, dispatch.clone()));
        let reaper = hold.spawn_reaper(BroadcastStream::new(shutdown_tx.subscribe()));
        let listener: Arc<dyn ArrivalListener> = hold.clone();

        // The schedule service parses the delay levels, which the send processor depends upon.
        let schedule = Arc::new(ScheduleService::new(config.clone(), store.clone(), Some(listener.clone())));
        schedule.start().await.context("error starting schedule service")?;

        let offsets = Arc::new(ConsumerOffsetTable::new());
        let send = Arc::new(SendMessageProcessor::new(config.clone(), store.clone(), schedule.levels(), listener)?);
        let pull = Arc::new(PullMessageProcessor::new(config.clone(), store, hold.clone(), offsets.clone()));
        let client_manage: Arc<dyn RequestProcessor> = Arc::new(ClientManageProcessor::new());
        let consumer_manage = Arc::new(ConsumerManageProcessor::new(offsets));
        let default: Arc<dyn RequestProcessor> = Arc::new(DefaultProcessor);

        let mut workers = vec![];
        workers.extend(dispatch.register(RequestCategory::Send, send));
        workers.extend(dispatch.register(RequestCategory::Pull, pull));
        workers.extend(dispatch.register(RequestCategory::Heartbeat, client_manage.clone()));
        workers.extend(dispatch.register(RequestCategory::ClientManage, client_manage));
        workers.extend(dispatch.register(RequestCategory::ConsumerManage, consumer_manage));
        for category in [RequestCategory::Query, RequestCategory::EndTransaction, RequestCategory::Admin] {
            workers.extend(dispatch.register(category, default.clone()));
        }

        let client_server = BrokerServer::new(config.clone(), dispatch.clone(), shutdown_tx.clone())
            .await
            .context("error setting up client server")?
            .spawn();
        let metrics_server = spawn_prom_server(&config, metrics, shutdown_tx.subscribe());

        Ok(Self {
            _config: config,
            log,
            dispatch,
            hold,
            schedule,
            shutdown_rx: BroadcastStream::new(shutdown_tx.subscribe()),
            shutdown_tx,
            workers,
            reaper,
            client_server,
            metrics_server,
        })
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        let mut signals = StreamMap::new();
        signals.insert("sigterm", SignalStream::new(signal(SignalKind::terminate()).context("error building signal stream")?));
        signals.insert("sigint", SignalStream::new(signal(SignalKind::interrupt()).context("error building signal stream")?));
        let mut watermarks = tokio::time::interval(WATERMARK_INTERVAL);
        watermarks.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                Some((_, sig)) = signals.next() => {
                    tracing::debug!(signal = ?sig, "signal received, beginning graceful shutdown");
                    let _ = self.shutdown_tx.send(());
                    break;
                }
                _ = watermarks.tick() => self.dispatch.log_watermarks(),
                _ = self.shutdown_rx.next() => break,
            }
        }

        // Begin shutdown routine.
        tracing::debug!("broker is shutting down");
        if let Err(err) = self.client_server.await.context("error joining client server handle").and_then(|res| res) {
            tracing::error!(error = ?err, "error shutting down client server");
        }
        if let Err(err) = self.schedule.shutdown().await {
            tracing::error!(error = ?err, "error shutting down schedule service");
        }
        if let Err(err) = self.reaper.await.context("error joining pull hold reaper handle").and_then(|res| res) {
            tracing::error!(error = ?err, "error shutting down pull hold reaper");
        }
        self.hold.shutdown();
        self.dispatch.shutdown();
        for handle in self.workers {
            if let Err(err) = handle.await.context("error joining request worker handle").and_then(|res| res) {
                tracing::error!(error = ?err, "error shutting down request worker");
            }
        }
        if let Err(err) = self.metrics_server.await.context("error joining metrics server handle").and_then(|res| res) {
            tracing::error!(error = ?err, "error shutting down metrics server");
        }
        if let Err(err) = self.log.flush().await {
            tracing::error!(error = ?err, "error flushing local log");
        }

        tracing::debug!("broker shutdown complete");
        Ok(())
    }
}
