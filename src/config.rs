//! Runtime configuration.

use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::dispatch::RequestCategory;

/// The default path to use for data storage.
pub const DEFAULT_DATA_PATH: &str = "/usr/local/rop/data";
/// The default delay level table, levels are 1-based in the order given.
pub const DEFAULT_MESSAGE_DELAY_LEVEL: &str = "1s 5s 10s 30s 1m 2m 3m 4m 5m 6m 7m 8m 9m 10m 20m 30m 1h 2h";
/// The default prefix of the per-level schedule topics.
pub const DEFAULT_SCHEDULE_TOPIC_PREFIX: &str = "SCHEDULE_TOPIC_XXXX";

/// Runtime configuration data.
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    /// The server's logging config, which uses Rust's `env_logger` directives.
    pub rust_log: String,
    /// The port which client network traffic is to use.
    #[serde(default = "Config::default_listen_port")]
    pub listen_port: u16,
    /// The port on which the metrics endpoint is served.
    #[serde(default = "Config::default_metrics_port")]
    pub metrics_port: u16,
    /// The address stamped as the store host of messages written through this broker.
    #[serde(default = "Config::default_broker_host")]
    pub broker_host: String,
    /// The path to the database on disk.
    #[serde(default = "Config::default_data_path")]
    pub storage_data_path: String,

    /// Whitespace separated delay level tokens, e.g. `1s 5s 10m 1h`.
    #[serde(default = "Config::default_message_delay_level")]
    pub message_delay_level: String,
    /// The prefix of the per-level schedule topics, `{prefix}_{token}`.
    #[serde(default = "Config::default_schedule_topic_prefix")]
    pub schedule_topic_prefix: String,
    /// The max number of pending timer tasks a delay level will fetch up to per tick.
    #[serde(default = "Config::default_schedule_batch_size")]
    pub schedule_batch_size: usize,
    /// The receive timeout used for each individual message fetched per tick.
    #[serde(default = "Config::default_schedule_receive_timeout_ms")]
    pub schedule_receive_timeout_ms: u64,
    /// The interval at which each delay level fetches new messages.
    #[serde(default = "Config::default_schedule_fetch_interval_ms")]
    pub schedule_fetch_interval_ms: u64,
    /// The max wall time a single fetch may spend receiving before the wheels are advanced.
    #[serde(default = "Config::default_schedule_fetch_budget_ms")]
    pub schedule_fetch_budget_ms: u64,
    /// The interval at which the timing wheels are advanced.
    #[serde(default = "Config::default_schedule_advance_interval_ms")]
    pub schedule_advance_interval_ms: u64,
    /// The number of buckets per timing wheel level.
    #[serde(default = "Config::default_schedule_wheel_size")]
    pub schedule_wheel_size: usize,
    /// The max number of cached producers per delay level.
    #[serde(default = "Config::default_producer_cache_size")]
    pub producer_cache_size: usize,
    /// The duration after last access at which a cached producer is evicted.
    #[serde(default = "Config::default_producer_cache_expiry_ms")]
    pub producer_cache_expiry_ms: u64,

    #[serde(default = "Config::default_send_threads")]
    pub send_threads: usize,
    #[serde(default = "Config::default_send_queue_capacity")]
    pub send_queue_capacity: usize,
    #[serde(default = "Config::default_pull_threads")]
    pub pull_threads: usize,
    #[serde(default = "Config::default_pull_queue_capacity")]
    pub pull_queue_capacity: usize,
    #[serde(default = "Config::default_query_threads")]
    pub query_threads: usize,
    #[serde(default = "Config::default_query_queue_capacity")]
    pub query_queue_capacity: usize,
    #[serde(default = "Config::default_heartbeat_threads")]
    pub heartbeat_threads: usize,
    #[serde(default = "Config::default_heartbeat_queue_capacity")]
    pub heartbeat_queue_capacity: usize,
    #[serde(default = "Config::default_manage_threads")]
    pub client_manage_threads: usize,
    #[serde(default = "Config::default_manage_queue_capacity")]
    pub client_manage_queue_capacity: usize,
    #[serde(default = "Config::default_manage_threads")]
    pub consumer_manage_threads: usize,
    #[serde(default = "Config::default_manage_queue_capacity")]
    pub consumer_manage_queue_capacity: usize,
    #[serde(default = "Config::default_end_transaction_threads")]
    pub end_transaction_threads: usize,
    #[serde(default = "Config::default_end_transaction_queue_capacity")]
    pub end_transaction_queue_capacity: usize,
    #[serde(default = "Config::default_admin_threads")]
    pub admin_threads: usize,
    #[serde(default = "Config::default_admin_queue_capacity")]
    pub admin_queue_capacity: usize,

    /// When disabled, suspended pulls are held for the short polling time instead of the
    /// client's requested suspend timeout.
    #[serde(default = "Config::default_long_polling_enable")]
    pub long_polling_enable: bool,
    #[serde(default = "Config::default_short_polling_time_ms")]
    pub short_polling_time_ms: u64,
    /// The interval at which held pull requests are checked for expiry.
    #[serde(default = "Config::default_pull_hold_check_interval_ms")]
    pub pull_hold_check_interval_ms: u64,
}

impl Config {
    /// Create a new config instance.
    ///
    /// Currently this routine just parses the runtime environment and builds the application
    /// config from that.
    #[allow(clippy::new_without_default)]
    pub fn new() -> Result<Self> {
        let config: Config = envy::from_env().context("error building config from env")?;
        Ok(config)
    }

    /// Create a config for use in tests, along with the temp dir backing its storage path.
    #[cfg(test)]
    pub fn new_test() -> Result<(std::sync::Arc<Self>, tempfile::TempDir)> {
        let tmpdir = tempfile::tempdir_in("/tmp").context("error creating tmp dir in /tmp")?;
        let mut config: Config = envy::from_iter(vec![("RUST_LOG".to_string(), "error".to_string())]).context("error building test config")?;
        config.storage_data_path = tmpdir.path().to_string_lossy().to_string();
        config.schedule_advance_interval_ms = 5;
        config.schedule_fetch_interval_ms = 20;
        config.schedule_receive_timeout_ms = 10;
        config.schedule_fetch_budget_ms = 200;
        config.pull_hold_check_interval_ms = 20;
        Ok((std::sync::Arc::new(config), tmpdir))
    }

    /// The worker count and queue capacity of the given request category.
    pub fn category_limits(&self, category: RequestCategory) -> (usize, usize) {
        match category {
            RequestCategory::Send => (self.send_threads, self.send_queue_capacity),
            RequestCategory::Pull => (self.pull_threads, self.pull_queue_capacity),
            RequestCategory::Query => (self.query_threads, self.query_queue_capacity),
            RequestCategory::Heartbeat => (self.heartbeat_threads, self.heartbeat_queue_capacity),
            RequestCategory::ClientManage => (self.client_manage_threads, self.client_manage_queue_capacity),
            RequestCategory::ConsumerManage => (self.consumer_manage_threads, self.consumer_manage_queue_capacity),
            RequestCategory::EndTransaction => (self.end_transaction_threads, self.end_transaction_queue_capacity),
            RequestCategory::Admin => (self.admin_threads, self.admin_queue_capacity),
        }
    }

    pub fn schedule_receive_timeout(&self) -> Duration {
        Duration::from_millis(self.schedule_receive_timeout_ms)
    }

    pub fn schedule_fetch_budget(&self) -> Duration {
        Duration::from_millis(self.schedule_fetch_budget_ms.max(1))
    }

    pub fn producer_cache_expiry(&self) -> Duration {
        Duration::from_millis(self.producer_cache_expiry_ms)
    }

    pub fn short_polling_time(&self) -> Duration {
        Duration::from_millis(self.short_polling_time_ms)
    }

    fn default_listen_port() -> u16 {
        9876
    }
    fn default_metrics_port() -> u16 {
        9090
    }
    fn default_broker_host() -> String {
        "127.0.0.1".into()
    }
    fn default_data_path() -> String {
        DEFAULT_DATA_PATH.into()
    }
    fn default_message_delay_level() -> String {
        DEFAULT_MESSAGE_DELAY_LEVEL.into()
    }
    fn default_schedule_topic_prefix() -> String {
        DEFAULT_SCHEDULE_TOPIC_PREFIX.into()
    }
    fn default_schedule_batch_size() -> usize {
        2000
    }
    fn default_schedule_receive_timeout_ms() -> u64 {
        100
    }
    fn default_schedule_fetch_interval_ms() -> u64 {
        1000
    }
    fn default_schedule_fetch_budget_ms() -> u64 {
        100
    }
    fn default_schedule_advance_interval_ms() -> u64 {
        10
    }
    fn default_schedule_wheel_size() -> usize {
        20
    }
    fn default_producer_cache_size() -> usize {
        200
    }
    fn default_producer_cache_expiry_ms() -> u64 {
        5 * 60 * 1000
    }
    fn default_send_threads() -> usize {
        1
    }
    fn default_send_queue_capacity() -> usize {
        10_000
    }
    fn default_pull_threads() -> usize {
        16
    }
    fn default_pull_queue_capacity() -> usize {
        100_000
    }
    fn default_query_threads() -> usize {
        8
    }
    fn default_query_queue_capacity() -> usize {
        20_000
    }
    fn default_heartbeat_threads() -> usize {
        2
    }
    fn default_heartbeat_queue_capacity() -> usize {
        50_000
    }
    fn default_manage_threads() -> usize {
        8
    }
    fn default_manage_queue_capacity() -> usize {
        1_000_000
    }
    fn default_end_transaction_threads() -> usize {
        4
    }
    fn default_end_transaction_queue_capacity() -> usize {
        100_000
    }
    fn default_admin_threads() -> usize {
        4
    }
    fn default_admin_queue_capacity() -> usize {
        10_000
    }
    fn default_long_polling_enable() -> bool {
        true
    }
    fn default_short_polling_time_ms() -> u64 {
        1000
    }
    fn default_pull_hold_check_interval_ms() -> u64 {
        1000
    }
}
