use crate::rpc::client::ClientConfig;
use crate::runtime::telemetry;
use anyhow::{bail, Result};
use std::time::Duration;

const DEFAULT_HEARTBEAT_INTERVAL_SECS: u64 = 30;
const DEFAULT_HEARTBEAT_TIMEOUT_SECS: u64 = 300;
const DEFAULT_CHECKPOINT_INTERVAL_SECS: u64 = 5;
const DEFAULT_READ_MAX_BYTES: usize = 4 * 1024 * 1024;
const DEFAULT_READ_MAX_ROUNDS: usize = 1;
const DEFAULT_READ_CONCURRENCY: usize = 32;
const DEFAULT_PROCESS_CONCURRENCY: usize = 32;
const DEFAULT_BACKOFF_MIN_MS: u64 = 100;
const DEFAULT_BACKOFF_MAX_MS: u64 = 2_000;
const DEFAULT_READ_RETRY_ATTEMPTS: usize = 3;
const DEFAULT_CONNECT_RETRY_MAX_DELAY_MS: u64 = 3_000;
const DEFAULT_CLOSING_CHANNEL_MAX_ROUNDS: usize = 60;
const DEFAULT_SHUTDOWN_GRACE_SECS: u64 = 10;
const DEFAULT_CLIENT_TAG: &str = "tunnel-worker";

/// Runtime configuration for a [`crate::TunnelWorker`].
///
/// Instances are only obtainable through [`TunnelWorkerConfig::builder`] or
/// [`TunnelWorkerConfig::new`], both of which validate every field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelWorkerConfig {
    heartbeat_interval: Duration,
    heartbeat_timeout: Duration,
    checkpoint_interval: Duration,
    read_max_bytes: usize,
    read_max_rounds: usize,
    max_channel_parallel: Option<usize>,
    read_concurrency: usize,
    process_concurrency: usize,
    backoff_min: Duration,
    backoff_max: Duration,
    read_retry_attempts: usize,
    connect_retry_max_delay: Duration,
    closing_channel_max_rounds: Option<usize>,
    metrics_interval: Duration,
    shutdown_grace: Duration,
    client_tag: String,
}

pub struct TunnelWorkerConfigParams {
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub checkpoint_interval: Duration,
    pub read_max_bytes: usize,
    pub read_max_rounds: usize,
    pub max_channel_parallel: Option<usize>,
    pub read_concurrency: usize,
    pub process_concurrency: usize,
    pub backoff_min: Duration,
    pub backoff_max: Duration,
    pub read_retry_attempts: usize,
    pub connect_retry_max_delay: Duration,
    pub closing_channel_max_rounds: Option<usize>,
    pub metrics_interval: Duration,
    pub shutdown_grace: Duration,
    pub client_tag: String,
}

impl Default for TunnelWorkerConfigParams {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(DEFAULT_HEARTBEAT_INTERVAL_SECS),
            heartbeat_timeout: Duration::from_secs(DEFAULT_HEARTBEAT_TIMEOUT_SECS),
            checkpoint_interval: Duration::from_secs(DEFAULT_CHECKPOINT_INTERVAL_SECS),
            read_max_bytes: DEFAULT_READ_MAX_BYTES,
            read_max_rounds: DEFAULT_READ_MAX_ROUNDS,
            max_channel_parallel: None,
            read_concurrency: DEFAULT_READ_CONCURRENCY,
            process_concurrency: DEFAULT_PROCESS_CONCURRENCY,
            backoff_min: Duration::from_millis(DEFAULT_BACKOFF_MIN_MS),
            backoff_max: Duration::from_millis(DEFAULT_BACKOFF_MAX_MS),
            read_retry_attempts: DEFAULT_READ_RETRY_ATTEMPTS,
            connect_retry_max_delay: Duration::from_millis(DEFAULT_CONNECT_RETRY_MAX_DELAY_MS),
            closing_channel_max_rounds: Some(DEFAULT_CLOSING_CHANNEL_MAX_ROUNDS),
            metrics_interval: telemetry::DEFAULT_METRICS_INTERVAL,
            shutdown_grace: Duration::from_secs(DEFAULT_SHUTDOWN_GRACE_SECS),
            client_tag: DEFAULT_CLIENT_TAG.to_string(),
        }
    }
}

impl TunnelWorkerConfig {
    pub fn builder() -> TunnelWorkerConfigBuilder {
        TunnelWorkerConfigBuilder::default()
    }

    /// Builds a configuration from fully specified parameters and validates it.
    pub fn new(params: TunnelWorkerConfigParams) -> Result<Self> {
        let TunnelWorkerConfigParams {
            heartbeat_interval,
            heartbeat_timeout,
            checkpoint_interval,
            read_max_bytes,
            read_max_rounds,
            max_channel_parallel,
            read_concurrency,
            process_concurrency,
            backoff_min,
            backoff_max,
            read_retry_attempts,
            connect_retry_max_delay,
            closing_channel_max_rounds,
            metrics_interval,
            shutdown_grace,
            client_tag,
        } = params;

        let config = Self {
            heartbeat_interval,
            heartbeat_timeout,
            checkpoint_interval,
            read_max_bytes,
            read_max_rounds,
            max_channel_parallel,
            read_concurrency,
            process_concurrency,
            backoff_min,
            backoff_max,
            read_retry_attempts,
            connect_retry_max_delay,
            closing_channel_max_rounds,
            metrics_interval,
            shutdown_grace,
            client_tag: client_tag.trim().to_owned(),
        };

        config.validate()?;
        Ok(config)
    }

    /// Period of the heartbeat task.
    pub fn heartbeat_interval(&self) -> Duration {
        self.heartbeat_interval
    }

    /// Maximum time without a successful heartbeat before the worker soft-shuts down.
    pub fn heartbeat_timeout(&self) -> Duration {
        self.heartbeat_timeout
    }

    /// Minimum spacing between two progress checkpoints of one channel.
    pub fn checkpoint_interval(&self) -> Duration {
        self.checkpoint_interval
    }

    pub fn read_max_bytes(&self) -> usize {
        self.read_max_bytes
    }

    pub fn read_max_rounds(&self) -> usize {
        self.read_max_rounds
    }

    /// Cap on channels inside a read/process cycle at the same time; `None` is unbounded.
    pub fn max_channel_parallel(&self) -> Option<usize> {
        self.max_channel_parallel
    }

    pub fn read_concurrency(&self) -> usize {
        self.read_concurrency
    }

    pub fn process_concurrency(&self) -> usize {
        self.process_concurrency
    }

    /// First delay after an empty read on a stream channel.
    pub fn backoff_min(&self) -> Duration {
        self.backoff_min
    }

    pub fn backoff_max(&self) -> Duration {
        self.backoff_max
    }

    /// Consecutive transient read failures tolerated before a channel gives up.
    pub fn read_retry_attempts(&self) -> usize {
        self.read_retry_attempts
    }

    /// Upper bound of the randomized delay between session connect attempts.
    pub fn connect_retry_max_delay(&self) -> Duration {
        self.connect_retry_max_delay
    }

    /// Reconciliation rounds a channel may stay CLOSING before it is force-closed.
    pub fn closing_channel_max_rounds(&self) -> Option<usize> {
        self.closing_channel_max_rounds
    }

    pub fn metrics_interval(&self) -> Duration {
        self.metrics_interval
    }

    /// How long shutdown waits for channel pipelines to observe cancellation.
    pub fn shutdown_grace(&self) -> Duration {
        self.shutdown_grace
    }

    pub fn client_tag(&self) -> &str {
        &self.client_tag
    }

    pub(crate) fn client_config(&self) -> ClientConfig {
        ClientConfig {
            client_tag: self.client_tag.clone(),
            heartbeat_timeout_secs: self.heartbeat_timeout.as_secs(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.heartbeat_interval.is_zero() {
            bail!("heartbeat_interval must be greater than 0");
        }

        if self.heartbeat_interval >= self.heartbeat_timeout {
            bail!(
                "heartbeat_interval ({:?}) must be below heartbeat_timeout ({:?})",
                self.heartbeat_interval,
                self.heartbeat_timeout
            );
        }

        if self.checkpoint_interval.is_zero() {
            bail!("checkpoint_interval must be greater than 0");
        }

        if self.read_max_bytes == 0 {
            bail!("read_max_bytes must be greater than 0");
        }

        if self.read_max_rounds == 0 {
            bail!("read_max_rounds must be greater than 0");
        }

        if self.max_channel_parallel == Some(0) {
            bail!("max_channel_parallel must be greater than 0 when set");
        }

        if self.read_concurrency == 0 {
            bail!("read_concurrency must be greater than 0");
        }

        if self.process_concurrency == 0 {
            bail!("process_concurrency must be greater than 0");
        }

        if self.backoff_min.is_zero() {
            bail!("backoff_min must be greater than 0");
        }

        if self.backoff_max < self.backoff_min {
            bail!("backoff_max must not be smaller than backoff_min");
        }

        if self.closing_channel_max_rounds == Some(0) {
            bail!("closing_channel_max_rounds must be greater than 0 when set");
        }

        if self.metrics_interval.is_zero() {
            bail!("metrics_interval must be greater than 0");
        }

        if self.client_tag.is_empty() {
            bail!("client_tag cannot be empty");
        }

        Ok(())
    }
}

#[derive(Debug, Default, Clone)]
pub struct TunnelWorkerConfigBuilder {
    heartbeat_interval: Option<Duration>,
    heartbeat_timeout: Option<Duration>,
    checkpoint_interval: Option<Duration>,
    read_max_bytes: Option<usize>,
    read_max_rounds: Option<usize>,
    max_channel_parallel: Option<usize>,
    read_concurrency: Option<usize>,
    process_concurrency: Option<usize>,
    backoff_min: Option<Duration>,
    backoff_max: Option<Duration>,
    read_retry_attempts: Option<usize>,
    connect_retry_max_delay: Option<Duration>,
    closing_channel_max_rounds: Option<Option<usize>>,
    metrics_interval: Option<Duration>,
    shutdown_grace: Option<Duration>,
    client_tag: Option<String>,
}

impl TunnelWorkerConfigBuilder {
    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = Some(interval);
        self
    }

    pub fn heartbeat_timeout(mut self, timeout: Duration) -> Self {
        self.heartbeat_timeout = Some(timeout);
        self
    }

    pub fn checkpoint_interval(mut self, interval: Duration) -> Self {
        self.checkpoint_interval = Some(interval);
        self
    }

    pub fn read_max_bytes(mut self, bytes: usize) -> Self {
        self.read_max_bytes = Some(bytes);
        self
    }

    pub fn read_max_rounds(mut self, rounds: usize) -> Self {
        self.read_max_rounds = Some(rounds);
        self
    }

    pub fn max_channel_parallel(mut self, channels: usize) -> Self {
        self.max_channel_parallel = Some(channels);
        self
    }

    pub fn read_concurrency(mut self, permits: usize) -> Self {
        self.read_concurrency = Some(permits);
        self
    }

    pub fn process_concurrency(mut self, permits: usize) -> Self {
        self.process_concurrency = Some(permits);
        self
    }

    pub fn backoff(mut self, min: Duration, max: Duration) -> Self {
        self.backoff_min = Some(min);
        self.backoff_max = Some(max);
        self
    }

    pub fn read_retry_attempts(mut self, attempts: usize) -> Self {
        self.read_retry_attempts = Some(attempts);
        self
    }

    pub fn connect_retry_max_delay(mut self, delay: Duration) -> Self {
        self.connect_retry_max_delay = Some(delay);
        self
    }

    /// `None` disables the hung-CLOSING detector.
    pub fn closing_channel_max_rounds(mut self, rounds: Option<usize>) -> Self {
        self.closing_channel_max_rounds = Some(rounds);
        self
    }

    pub fn metrics_interval(mut self, interval: Duration) -> Self {
        self.metrics_interval = Some(interval);
        self
    }

    pub fn shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = Some(grace);
        self
    }

    pub fn client_tag(mut self, tag: impl Into<String>) -> Self {
        self.client_tag = Some(tag.into());
        self
    }

    pub fn build(self) -> Result<TunnelWorkerConfig> {
        let defaults = TunnelWorkerConfigParams::default();
        let params = TunnelWorkerConfigParams {
            heartbeat_interval: self
                .heartbeat_interval
                .unwrap_or(defaults.heartbeat_interval),
            heartbeat_timeout: self.heartbeat_timeout.unwrap_or(defaults.heartbeat_timeout),
            checkpoint_interval: self
                .checkpoint_interval
                .unwrap_or(defaults.checkpoint_interval),
            read_max_bytes: self.read_max_bytes.unwrap_or(defaults.read_max_bytes),
            read_max_rounds: self.read_max_rounds.unwrap_or(defaults.read_max_rounds),
            max_channel_parallel: self.max_channel_parallel.or(defaults.max_channel_parallel),
            read_concurrency: self.read_concurrency.unwrap_or(defaults.read_concurrency),
            process_concurrency: self
                .process_concurrency
                .unwrap_or(defaults.process_concurrency),
            backoff_min: self.backoff_min.unwrap_or(defaults.backoff_min),
            backoff_max: self.backoff_max.unwrap_or(defaults.backoff_max),
            read_retry_attempts: self
                .read_retry_attempts
                .unwrap_or(defaults.read_retry_attempts),
            connect_retry_max_delay: self
                .connect_retry_max_delay
                .unwrap_or(defaults.connect_retry_max_delay),
            closing_channel_max_rounds: self
                .closing_channel_max_rounds
                .unwrap_or(defaults.closing_channel_max_rounds),
            metrics_interval: self.metrics_interval.unwrap_or(defaults.metrics_interval),
            shutdown_grace: self.shutdown_grace.unwrap_or(defaults.shutdown_grace),
            client_tag: self.client_tag.unwrap_or(defaults.client_tag),
        };

        TunnelWorkerConfig::new(params)
    }
}
