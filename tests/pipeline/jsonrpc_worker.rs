use std::sync::Arc;
use std::time::Duration;

use crate::support::{
    fake_tunnel::{FakeTunnel, TUNNEL_ID},
    helpers::{fast_config, init_tracing, wait_until, RecordingFactory},
    mock_server::MockTunnelServer,
};
use anyhow::Result;
use tunnel_worker::{
    ChannelStatus, ChannelType, Checkpoint, CheckpointRequest, ClientConfig, JsonRpcClientOptions,
    JsonRpcTunnelClient, ReadRecordsRequest, TunnelClient, TunnelWorker, FINISH_TAG,
};

fn fast_options() -> JsonRpcClientOptions {
    JsonRpcClientOptions {
        request_timeout: Duration::from_secs(2),
        max_attempts: 3,
        initial_backoff: Duration::from_millis(5),
        max_backoff: Duration::from_millis(20),
        ..JsonRpcClientOptions::default()
    }
}

fn client_config() -> ClientConfig {
    ClientConfig {
        client_tag: "integration".into(),
        heartbeat_timeout_secs: 30,
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn client_speaks_tunnel_protocol() -> Result<()> {
    init_tracing();
    let tunnel = FakeTunnel::new();
    tunnel.add_channel("ch-1", ChannelType::BaseData, vec![3]);
    let server = MockTunnelServer::start(tunnel.clone()).await?;
    let client = JsonRpcTunnelClient::with_options(server.url(), fast_options())?;

    server.fail_next_calls(1);
    let client_id = client.connect_session(TUNNEL_ID, &client_config()).await?;
    assert_eq!(client_id, "client-1");
    assert_eq!(server.calls(), 2, "unavailable answer must be retried");
    assert_eq!(tunnel.client_configs(), vec![client_config()]);

    let assigned = client.heartbeat(TUNNEL_ID, &client_id, &[]).await?;
    assert_eq!(assigned.len(), 1);
    assert_eq!(assigned[0].status, ChannelStatus::Open);
    assert_eq!(assigned[0].channel_type, ChannelType::BaseData);

    let checkpoint = client.get_checkpoint(TUNNEL_ID, &client_id, "ch-1").await?;
    assert_eq!(checkpoint, Checkpoint::new("0", 0));

    let read = client
        .read_records(&ReadRecordsRequest {
            tunnel_id: TUNNEL_ID.into(),
            client_id: client_id.clone(),
            channel_id: "ch-1".into(),
            token: checkpoint.token,
            max_bytes: 1024,
            max_rounds: 1,
        })
        .await?;
    assert_eq!(read.records.len(), 3);
    assert_eq!(read.next_token.as_deref(), Some("1"));

    let stale = client
        .checkpoint(&CheckpointRequest {
            tunnel_id: TUNNEL_ID.into(),
            client_id: client_id.clone(),
            channel_id: "ch-1".into(),
            token: "1".into(),
            sequence_number: 5,
        })
        .await
        .unwrap_err();
    assert!(stale.is_sequence_mismatch());

    client
        .checkpoint(&CheckpointRequest {
            tunnel_id: TUNNEL_ID.into(),
            client_id: client_id.clone(),
            channel_id: "ch-1".into(),
            token: "1".into(),
            sequence_number: 1,
        })
        .await?;
    assert_eq!(
        client.get_checkpoint(TUNNEL_ID, &client_id, "ch-1").await?,
        Checkpoint::new("1", 1)
    );

    client.close_session(TUNNEL_ID, &client_id).await?;
    assert_eq!(tunnel.closed_sessions(), vec![client_id.clone()]);

    tunnel.set_expired(true);
    let expired = client.heartbeat(TUNNEL_ID, &client_id, &[]).await.unwrap_err();
    assert!(expired.is_fatal());
    assert!(client.metrics().requests >= 8);

    server.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn worker_consumes_over_json_rpc() -> Result<()> {
    init_tracing();
    let tunnel = FakeTunnel::new();
    tunnel.add_channel("snapshot", ChannelType::BaseData, vec![50, 25]);
    tunnel.add_channel("stream", ChannelType::Stream, vec![10]);
    let server = MockTunnelServer::start(tunnel.clone()).await?;
    let client = JsonRpcTunnelClient::with_options(server.url(), fast_options())?;
    let factory = RecordingFactory::default();
    let worker = TunnelWorker::new(TUNNEL_ID, Arc::new(client), factory.clone(), fast_config());

    worker.connect_and_working().await?;
    wait_until("both channels to drain", Duration::from_secs(10), || {
        let snapshot_done = tunnel
            .channel("snapshot")
            .map(|view| view.state.status == ChannelStatus::Terminated)
            .unwrap_or(false);
        snapshot_done && factory.records_for("stream") == 10
    })
    .await?;

    assert_eq!(factory.records_for("snapshot"), 75);
    assert_eq!(
        tunnel.channel("snapshot").map(|view| view.checkpoint),
        Some(Checkpoint::new(FINISH_TAG, 1))
    );
    assert_eq!(tunnel.owned_by("client-1"), vec!["stream".to_string()]);

    worker.shutdown(true).await;
    worker.wait().await?;
    assert_eq!(tunnel.closed_sessions(), vec!["client-1".to_string()]);
    server.shutdown().await;
    Ok(())
}
