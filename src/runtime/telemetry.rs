use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio::{select, time};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// Default interval used by the metrics reporter task.
pub const DEFAULT_METRICS_INTERVAL: Duration = Duration::from_secs(30);

static TRACING_INIT: OnceLock<()> = OnceLock::new();

/// Installs a basic tracing subscriber (if one is not already active).
///
/// The subscriber honours `RUST_LOG` if it is present, otherwise it falls back to `info`.
/// Calling this function multiple times is harmless.
pub fn init_tracing() {
    if TRACING_INIT.get().is_some() {
        return;
    }

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .try_init();

    let _ = TRACING_INIT.set(());
}

/// Rolling counters shared by the heartbeat loop, the state machine and
/// every channel pipeline of a worker.
#[derive(Default, Debug)]
pub struct Telemetry {
    records_processed: AtomicU64,
    reads: AtomicU64,
    empty_reads: AtomicU64,
    read_errors: AtomicU64,
    checkpoints: AtomicU64,
    checkpoint_failures: AtomicU64,
    heartbeats: AtomicU64,
    heartbeat_failures: AtomicU64,
    channels_dialed: AtomicU64,
    failed_dials: AtomicU64,
    active_channels: AtomicUsize,
}

impl Telemetry {
    pub fn record_read(&self, records: usize) {
        self.reads.fetch_add(1, Ordering::Relaxed);
        if records == 0 {
            self.empty_reads.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_read_error(&self) {
        self.read_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_processed(&self, count: usize) {
        if count == 0 {
            return;
        }
        self.records_processed
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn record_checkpoint(&self, success: bool) {
        if success {
            self.checkpoints.fetch_add(1, Ordering::Relaxed);
        } else {
            self.checkpoint_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_heartbeat(&self, success: bool) {
        if success {
            self.heartbeats.fetch_add(1, Ordering::Relaxed);
        } else {
            self.heartbeat_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_dial(&self, success: bool) {
        if success {
            self.channels_dialed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed_dials.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn set_active_channels(&self, channels: usize) {
        self.active_channels.store(channels, Ordering::Relaxed);
    }

    pub fn active_channels(&self) -> usize {
        self.active_channels.load(Ordering::Relaxed)
    }

    pub fn records_processed(&self) -> u64 {
        self.records_processed.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        TelemetrySnapshot {
            records_processed: self.records_processed.load(Ordering::Relaxed),
            reads: self.reads.load(Ordering::Relaxed),
            empty_reads: self.empty_reads.load(Ordering::Relaxed),
            read_errors: self.read_errors.load(Ordering::Relaxed),
            checkpoints: self.checkpoints.load(Ordering::Relaxed),
            checkpoint_failures: self.checkpoint_failures.load(Ordering::Relaxed),
            heartbeats: self.heartbeats.load(Ordering::Relaxed),
            heartbeat_failures: self.heartbeat_failures.load(Ordering::Relaxed),
            channels_dialed: self.channels_dialed.load(Ordering::Relaxed),
            failed_dials: self.failed_dials.load(Ordering::Relaxed),
            active_channels: self.active_channels.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct TelemetrySnapshot {
    pub records_processed: u64,
    pub reads: u64,
    pub empty_reads: u64,
    pub read_errors: u64,
    pub checkpoints: u64,
    pub checkpoint_failures: u64,
    pub heartbeats: u64,
    pub heartbeat_failures: u64,
    pub channels_dialed: u64,
    pub failed_dials: u64,
    pub active_channels: usize,
}

/// Spawns a background task that periodically logs record throughput, channel counts, and failures.
pub fn spawn_metrics_reporter(
    telemetry: Arc<Telemetry>,
    shutdown: CancellationToken,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut last_snapshot = telemetry.snapshot();
        let mut last_tick = Instant::now();

        loop {
            select! {
                _ = shutdown.cancelled() => {
                    tracing::info!(
                        target: "tunnel_worker::metrics",
                        "metrics reporter shutting down"
                    );
                    break;
                }
                _ = ticker.tick() => {
                    let current_snapshot = telemetry.snapshot();
                    let processed_delta = current_snapshot
                        .records_processed
                        .saturating_sub(last_snapshot.records_processed);
                    let elapsed = last_tick.elapsed().as_secs_f64();
                    let throughput = if elapsed <= f64::EPSILON {
                        0.0
                    } else {
                        processed_delta as f64 / elapsed
                    };

                    tracing::info!(
                        target: "tunnel_worker::metrics",
                        throughput = format!("{throughput:.2}"),
                        processed = current_snapshot.records_processed,
                        active_channels = current_snapshot.active_channels,
                        reads = current_snapshot.reads,
                        empty_reads = current_snapshot.empty_reads,
                        read_errors = current_snapshot.read_errors,
                        checkpoints = current_snapshot.checkpoints,
                        checkpoint_failures = current_snapshot.checkpoint_failures,
                        heartbeat_failures = current_snapshot.heartbeat_failures,
                        failed_dials = current_snapshot.failed_dials,
                        "runtime metrics snapshot"
                    );

                    last_snapshot = current_snapshot;
                    last_tick = Instant::now();
                }
            }
        }
    })
}
