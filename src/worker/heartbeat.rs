use crate::rpc::client::TunnelError;
use crate::worker::status::TunnelWorkerStatus;
use crate::worker::tunnel_worker::WorkerInner;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};

/// Spawns the periodic heartbeat of a worker. The task runs until the
/// worker halts.
pub(crate) fn spawn_heartbeat(inner: Arc<WorkerInner>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = time::interval(inner.config.heartbeat_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = inner.halt.cancelled() => {
                    tracing::info!(tunnel_id = %inner.tunnel_id, "heartbeat loop stopped");
                    break;
                }
                _ = ticker.tick() => {
                    heartbeat_tick(&inner).await;
                }
            }
        }
    })
}

pub(crate) async fn heartbeat_tick(inner: &WorkerInner) {
    match inner.status.load() {
        TunnelWorkerStatus::Ended => {
            if !inner
                .status
                .transition(TunnelWorkerStatus::Ended, TunnelWorkerStatus::Ready)
            {
                return;
            }
            tracing::info!(tunnel_id = %inner.tunnel_id, "reconnecting ended tunnel worker");
            if !inner
                .status
                .transition(TunnelWorkerStatus::Ready, TunnelWorkerStatus::Started)
            {
                return;
            }
            if let Err(err) = inner.establish_session().await {
                tracing::warn!(tunnel_id = %inner.tunnel_id, error = %err, "reconnect failed");
                return;
            }
        }
        TunnelWorkerStatus::Started => {}
        TunnelWorkerStatus::Ready | TunnelWorkerStatus::Halt => return,
    }

    let since_last = inner.last_heartbeat.lock().elapsed();
    if since_last > inner.config.heartbeat_timeout() {
        tracing::warn!(
            tunnel_id = %inner.tunnel_id,
            elapsed_ms = since_last.as_millis() as u64,
            timeout_ms = inner.config.heartbeat_timeout().as_millis() as u64,
            "heartbeat timeout exceeded; ending session"
        );
        inner.shutdown(false).await;
        return;
    }

    let Some(session) = inner.current_session() else {
        return;
    };

    let channels = session.state_machine.channels();
    let heartbeat = time::timeout(
        inner.config.heartbeat_timeout(),
        inner
            .client
            .heartbeat(&inner.tunnel_id, &session.client_id, &channels),
    )
    .await
    .unwrap_or(Err(TunnelError::Timeout {
        method: "tunnel_heartbeat",
    }));
    match heartbeat {
        Ok(assigned) => {
            inner.touch_heartbeat();
            inner.telemetry.record_heartbeat(true);
            tracing::debug!(
                tunnel_id = %inner.tunnel_id,
                client_id = %session.client_id,
                reported = channels.len(),
                assigned = assigned.len(),
                "heartbeat acknowledged"
            );
            session.state_machine.batch_update_channels(assigned).await;
        }
        Err(err) if err.is_fatal() => {
            inner.telemetry.record_heartbeat(false);
            inner.fatal.trigger("heartbeat", err.into());
            inner.shutdown(true).await;
        }
        Err(err) => {
            inner.telemetry.record_heartbeat(false);
            log_heartbeat_failure(inner, &session.client_id, &err);
        }
    }
}

fn log_heartbeat_failure(inner: &WorkerInner, client_id: &str, err: &TunnelError) {
    tracing::warn!(
        tunnel_id = %inner.tunnel_id,
        client_id,
        error = %err,
        "heartbeat failed; retrying on next tick"
    );
}
