use crate::channel::connect::ChannelConnect;
use crate::model::checkpoint::is_finish_token;
use crate::model::ProcessRecordsInput;
use crate::rpc::client::{ReadRecordsRequest, ReadRecordsResponse};
use crate::runtime::backoff::{sleep_with_cancellation, StreamBackoff};
use crate::runtime::config::TunnelWorkerConfig;
use anyhow::Result;
use futures::FutureExt;
use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

/// Read limits and retry policy applied by every pipeline of a worker.
#[derive(Debug, Clone)]
pub(crate) struct PipelineSettings {
    pub read_max_bytes: usize,
    pub read_max_rounds: usize,
    pub backoff_min: Duration,
    pub backoff_max: Duration,
    pub read_retry_attempts: usize,
}

impl PipelineSettings {
    pub(crate) fn from_config(config: &TunnelWorkerConfig) -> Self {
        Self {
            read_max_bytes: config.read_max_bytes(),
            read_max_rounds: config.read_max_rounds(),
            backoff_min: config.backoff_min(),
            backoff_max: config.backoff_max(),
            read_retry_attempts: config.read_retry_attempts(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PipelineExit {
    /// The channel returned its finished token and the final batch was processed.
    Finished,
    /// The connect left RUNNING or was cancelled.
    Stopped,
}

/// Runs the read/process cycle of `connect` until it finishes, fails, or is
/// told to stop, then closes the connect and reports the outcome upstream.
#[tracing::instrument(
    name = "channel_pipeline",
    skip_all,
    fields(channel_id = %connect.channel_id(), client_id = %connect.client_id())
)]
pub(crate) async fn run_pipeline(connect: Arc<ChannelConnect>) {
    let result = std::panic::AssertUnwindSafe(drive(&connect))
        .catch_unwind()
        .await;

    match result {
        Ok(Ok(PipelineExit::Finished)) => {
            tracing::info!("channel finished");
            connect.close(true);
        }
        Ok(Ok(PipelineExit::Stopped)) => {
            tracing::debug!(status = %connect.status(), "pipeline stopped");
            connect.close(false);
        }
        Ok(Err(err)) => {
            tracing::warn!(error = %err, "pipeline exited with error; releasing channel");
            connect.close(false);
        }
        Err(panic_payload) => {
            let panic_msg = panic_message(panic_payload.as_ref());
            tracing::error!(panic = %panic_msg, "pipeline panicked; releasing channel");
            connect.close(false);
        }
    }

    connect.check_and_update_channel_status();
}

fn should_stop(connect: &ChannelConnect) -> bool {
    !connect.is_running() || connect.cancellation().is_cancelled()
}

async fn drive(connect: &ChannelConnect) -> Result<PipelineExit> {
    let runtime = connect.runtime();
    let settings = &runtime.settings;
    let cancel = connect.cancellation();
    let mut backoff = StreamBackoff::new(settings.backoff_min, settings.backoff_max);
    let mut token = connect.start_token().to_string();
    let mut read_failures = 0usize;

    loop {
        if should_stop(connect) {
            return Ok(PipelineExit::Stopped);
        }

        let Ok(cycle_permit) = runtime.executor.acquire_channel(cancel).await else {
            return Ok(PipelineExit::Stopped);
        };

        let request = ReadRecordsRequest {
            tunnel_id: connect.tunnel_id().to_string(),
            client_id: connect.client_id().to_string(),
            channel_id: connect.channel_id().to_string(),
            token: token.clone(),
            max_bytes: settings.read_max_bytes,
            max_rounds: settings.read_max_rounds,
        };

        let read = {
            let Ok(_read_permit) = runtime.executor.acquire_read(cancel).await else {
                return Ok(PipelineExit::Stopped);
            };
            runtime.client.read_records(&request).await
        };

        let ReadRecordsResponse {
            records,
            next_token,
        } = match read {
            Ok(response) => {
                read_failures = 0;
                response
            }
            Err(err) => {
                runtime.telemetry.record_read_error();
                drop(cycle_permit);

                if !err.is_transient() || read_failures >= settings.read_retry_attempts {
                    return Err(anyhow::Error::new(err)
                        .context(format!("read_records failed (retries: {read_failures})")));
                }

                read_failures += 1;
                let delay = backoff.next_delay();
                tracing::debug!(
                    attempt = read_failures,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "transient read failure; retrying"
                );
                if sleep_with_cancellation(delay, Some(cancel)).await.is_err() {
                    return Ok(PipelineExit::Stopped);
                }
                continue;
            }
        };

        runtime.telemetry.record_read(records.len());
        let finished = is_finish_token(next_token.as_deref());

        if records.is_empty() && !finished {
            drop(cycle_permit);
            if let Some(next) = next_token {
                token = next;
            }
            if connect.is_stream() {
                let delay = backoff.next_delay();
                tracing::trace!(delay_ms = delay.as_millis() as u64, "empty read; backing off");
                if sleep_with_cancellation(delay, Some(cancel)).await.is_err() {
                    return Ok(PipelineExit::Stopped);
                }
            } else {
                tokio::task::yield_now().await;
            }
            continue;
        }

        backoff.reset();

        {
            let Ok(_process_permit) = runtime.executor.acquire_process(cancel).await else {
                return Ok(PipelineExit::Stopped);
            };
            let input = ProcessRecordsInput {
                channel_id: connect.channel_id().to_string(),
                records,
                next_token: next_token.clone(),
            };
            connect
                .processor()
                .lock()
                .await
                .process(input)
                .await
                .map_err(anyhow::Error::new)?;
        }
        drop(cycle_permit);

        if finished {
            return Ok(PipelineExit::Finished);
        }

        if let Some(next) = next_token {
            token = next;
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
