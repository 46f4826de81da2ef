use std::sync::Arc;
use std::time::Duration;

use crate::support::{
    fake_tunnel::{FakeTunnel, TUNNEL_ID},
    helpers::{fast_config, init_tracing, wait_until, RecordingFactory},
};
use anyhow::Result;
use tunnel_worker::{ChannelStatus, ChannelType, Checkpoint, TunnelWorker, FINISH_TAG};

const CHANNEL: &str = "snapshot-1";

fn terminated(tunnel: &FakeTunnel) -> bool {
    tunnel
        .channel(CHANNEL)
        .map(|view| view.state.status == ChannelStatus::Terminated)
        .unwrap_or(false)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn snapshot_channel_runs_to_termination() -> Result<()> {
    init_tracing();
    let tunnel = FakeTunnel::new();
    tunnel.add_channel(CHANNEL, ChannelType::BaseData, vec![100, 100, 100]);
    let factory = RecordingFactory::default();
    let worker = TunnelWorker::new(
        TUNNEL_ID,
        Arc::new(tunnel.clone()),
        factory.clone(),
        fast_config(),
    );

    worker.connect_and_working().await?;
    wait_until("snapshot termination", Duration::from_secs(5), || terminated(&tunnel)).await?;

    // A terminated channel must never come back.
    let seen = tunnel.heartbeats();
    wait_until("more heartbeats", Duration::from_secs(5), || {
        tunnel.heartbeats() >= seen + 5
    })
    .await?;
    wait_until("processor shutdown", Duration::from_secs(5), || {
        !factory.shutdowns_for(CHANNEL).is_empty()
    })
    .await?;

    let batches = factory.batches_for(CHANNEL);
    let sizes: Vec<usize> = batches.iter().map(|batch| batch.records).collect();
    assert_eq!(sizes, vec![100, 100, 100, 0]);
    assert_eq!(
        batches.last().and_then(|batch| batch.next_token.as_deref()),
        Some(FINISH_TAG)
    );

    let checkpoints = tunnel.checkpoints_for(CHANNEL);
    assert_eq!(checkpoints.len(), 1, "only the finished sentinel is written");
    assert_eq!(checkpoints[0].token, FINISH_TAG);
    assert_eq!(checkpoints[0].sequence_number, 1);

    let view = tunnel.channel(CHANNEL).expect("channel exists");
    assert_eq!(view.opened, 1);
    assert_eq!(view.reports.len(), 1);
    assert_eq!(view.reports[0].status, ChannelStatus::Terminated);
    assert_eq!(view.reports[0].version, 3);
    assert_eq!(factory.shutdowns_for(CHANNEL), vec!["client-1".to_string()]);
    assert!(worker.channels().is_empty());
    assert_eq!(worker.telemetry().snapshot().records_processed, 300);

    worker.shutdown(true).await;
    worker.wait().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn snapshot_resumes_after_stored_checkpoint() -> Result<()> {
    init_tracing();
    let tunnel = FakeTunnel::new();
    tunnel.add_channel(CHANNEL, ChannelType::BaseData, vec![100, 100, 100]);
    tunnel.set_checkpoint(CHANNEL, Checkpoint::new("2", 7));
    let factory = RecordingFactory::default();
    let worker = TunnelWorker::new(
        TUNNEL_ID,
        Arc::new(tunnel.clone()),
        factory.clone(),
        fast_config(),
    );

    worker.connect_and_working().await?;
    wait_until("snapshot termination", Duration::from_secs(5), || terminated(&tunnel)).await?;

    let tokens: Vec<String> = tunnel
        .reads_for(CHANNEL)
        .into_iter()
        .map(|request| request.token)
        .collect();
    assert_eq!(tokens, vec!["2".to_string(), "3".to_string()]);
    assert_eq!(factory.records_for(CHANNEL), 100);

    let view = tunnel.channel(CHANNEL).expect("channel exists");
    assert_eq!(view.checkpoint, Checkpoint::new(FINISH_TAG, 8));

    worker.shutdown(true).await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn finished_checkpoint_terminates_without_reading() -> Result<()> {
    init_tracing();
    let tunnel = FakeTunnel::new();
    tunnel.add_channel(CHANNEL, ChannelType::BaseData, vec![100]);
    tunnel.set_checkpoint(CHANNEL, Checkpoint::new(FINISH_TAG, 4));
    let factory = RecordingFactory::default();
    let worker = TunnelWorker::new(
        TUNNEL_ID,
        Arc::new(tunnel.clone()),
        factory.clone(),
        fast_config(),
    );

    worker.connect_and_working().await?;
    wait_until("snapshot termination", Duration::from_secs(5), || terminated(&tunnel)).await?;

    assert!(tunnel.reads_for(CHANNEL).is_empty());
    assert!(tunnel.checkpoints_for(CHANNEL).is_empty());
    assert!(factory.batches_for(CHANNEL).is_empty());

    worker.shutdown(true).await;
    Ok(())
}
