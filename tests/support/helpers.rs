use std::{
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use anyhow::{bail, Result};
use once_cell::sync::Lazy;
use tokio::time::sleep;
use tracing_subscriber::EnvFilter;
use tunnel_worker::{
    ChannelContext, ChannelProcessor, ChannelProcessorFactory, ProcessRecordsInput,
    ProcessorFuture, TunnelWorkerConfig,
};

static TRACING_SUBSCRIBER: Lazy<()> = Lazy::new(|| {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
});

pub fn init_tracing() {
    Lazy::force(&TRACING_SUBSCRIBER);
}

/// Worker settings scaled down so scenarios settle in well under a second.
pub fn fast_config() -> TunnelWorkerConfig {
    TunnelWorkerConfig::builder()
        .heartbeat_interval(Duration::from_millis(20))
        .heartbeat_timeout(Duration::from_millis(400))
        .checkpoint_interval(Duration::from_secs(3600))
        .backoff(Duration::from_millis(5), Duration::from_millis(20))
        .connect_retry_max_delay(Duration::from_millis(10))
        .shutdown_grace(Duration::from_secs(1))
        .build()
        .expect("fast config must be valid")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessedBatch {
    pub client_id: String,
    pub channel_id: String,
    pub records: usize,
    pub next_token: Option<String>,
}

/// Factory whose processors append every batch and shutdown to a shared log.
#[derive(Clone, Default)]
pub struct RecordingFactory {
    batches: Arc<Mutex<Vec<ProcessedBatch>>>,
    shutdowns: Arc<Mutex<Vec<(String, String)>>>,
}

impl RecordingFactory {
    pub fn batches_for(&self, channel_id: &str) -> Vec<ProcessedBatch> {
        self.batches
            .lock()
            .expect("batch log poisoned")
            .iter()
            .filter(|batch| batch.channel_id == channel_id)
            .cloned()
            .collect()
    }

    pub fn records_for(&self, channel_id: &str) -> usize {
        self.batches_for(channel_id)
            .iter()
            .map(|batch| batch.records)
            .sum()
    }

    /// Shutdowns seen for `channel_id`, by client id.
    pub fn shutdowns_for(&self, channel_id: &str) -> Vec<String> {
        self.shutdowns
            .lock()
            .expect("shutdown log poisoned")
            .iter()
            .filter(|(_, channel)| channel == channel_id)
            .map(|(client, _)| client.clone())
            .collect()
    }
}

struct RecordingProcessor {
    context: ChannelContext,
    factory: RecordingFactory,
}

impl ChannelProcessor for RecordingProcessor {
    fn process<'a>(&'a mut self, input: ProcessRecordsInput) -> ProcessorFuture<'a> {
        Box::pin(async move {
            self.factory
                .batches
                .lock()
                .expect("batch log poisoned")
                .push(ProcessedBatch {
                    client_id: self.context.client_id.clone(),
                    channel_id: input.channel_id,
                    records: input.records.len(),
                    next_token: input.next_token,
                });
            Ok(())
        })
    }

    fn shutdown<'a>(&'a mut self) -> ProcessorFuture<'a> {
        Box::pin(async move {
            self.factory
                .shutdowns
                .lock()
                .expect("shutdown log poisoned")
                .push((self.context.client_id.clone(), self.context.channel_id.clone()));
            Ok(())
        })
    }
}

impl ChannelProcessorFactory for RecordingFactory {
    fn create(&self, context: &ChannelContext) -> Result<Box<dyn ChannelProcessor>> {
        Ok(Box::new(RecordingProcessor {
            context: context.clone(),
            factory: self.clone(),
        }))
    }
}

/// Polls `condition` until it holds, failing with `what` after `timeout`.
pub async fn wait_until<F>(what: &str, timeout: Duration, mut condition: F) -> Result<()>
where
    F: FnMut() -> bool,
{
    let start = Instant::now();
    loop {
        if condition() {
            return Ok(());
        }
        if start.elapsed() > timeout {
            bail!("timed out waiting for {what}");
        }
        sleep(Duration::from_millis(10)).await;
    }
}
