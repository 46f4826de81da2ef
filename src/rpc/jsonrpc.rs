//! `TunnelClient` implementation speaking JSON-RPC 2.0 over HTTP.
//!
//! Every call goes through [`JsonRpcTunnelClient::call`], which gates on the
//! shared circuit breaker, retries transient failures (timeouts, transport
//! errors, server unavailable) with exponential backoff, and records metrics.
//! Errors the service answers with (expired tunnel, sequence mismatch, ...)
//! are returned immediately so the engine can apply its own policy.

use crate::model::{Channel, Checkpoint};
use crate::rpc::circuit_breaker::{CircuitBreakerError, RpcCircuitBreaker};
use crate::rpc::client::{
    CheckpointRequest, ClientConfig, ReadRecordsRequest, ReadRecordsResponse, TunnelClient,
    TunnelError, TunnelFuture,
};
use crate::rpc::metrics::{RpcMetrics, RpcMetricsSnapshot};
use crate::rpc::options::JsonRpcClientOptions;
use crate::rpc::retry::{
    RetryContext, CHECKPOINT_RETRY, CONNECT_RETRY, GET_CHECKPOINT_RETRY, HEARTBEAT_RETRY,
    READ_RECORDS_RETRY, SHUTDOWN_RETRY,
};
use anyhow::{anyhow, Result};
use jsonrpsee::core::client::{ClientT, Error as JsonRpcError};
use jsonrpsee::core::params::ArrayParams;
use jsonrpsee::http_client::{HttpClient, HttpClientBuilder};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout, Instant};

/// Application error codes carried in JSON-RPC error objects.
pub mod error_codes {
    pub const TUNNEL_EXPIRED: i32 = -32010;
    pub const PARAMETER_INVALID: i32 = -32011;
    pub const SEQUENCE_NUMBER_NOT_MATCH: i32 = -32012;
    pub const RESOURCE_GONE: i32 = -32013;
    pub const SERVER_UNAVAILABLE: i32 = -32014;
}

#[derive(Serialize)]
struct ConnectParams<'a> {
    tunnel_id: &'a str,
    client_config: &'a ClientConfig,
}

#[derive(Deserialize)]
struct ConnectResult {
    client_id: String,
}

#[derive(Serialize)]
struct HeartbeatParams<'a> {
    tunnel_id: &'a str,
    client_id: &'a str,
    channels: &'a [Channel],
}

#[derive(Deserialize)]
struct HeartbeatResult {
    channels: Vec<Channel>,
}

#[derive(Serialize)]
struct SessionParams<'a> {
    tunnel_id: &'a str,
    client_id: &'a str,
}

#[derive(Serialize)]
struct GetCheckpointParams<'a> {
    tunnel_id: &'a str,
    client_id: &'a str,
    channel_id: &'a str,
}

#[derive(Debug, Clone)]
pub struct JsonRpcTunnelClient {
    endpoint: Arc<String>,
    client: HttpClient,
    options: JsonRpcClientOptions,
    metrics: Arc<RpcMetrics>,
    breaker: Arc<RpcCircuitBreaker>,
}

impl JsonRpcTunnelClient {
    pub fn new(endpoint: impl Into<String>) -> Result<Self> {
        Self::with_options(endpoint, JsonRpcClientOptions::default())
    }

    pub fn with_options(
        endpoint: impl Into<String>,
        options: JsonRpcClientOptions,
    ) -> Result<Self> {
        Self::with_options_and_breaker(endpoint, options, Arc::new(RpcCircuitBreaker::default()))
    }

    pub fn with_options_and_breaker(
        endpoint: impl Into<String>,
        options: JsonRpcClientOptions,
        breaker: Arc<RpcCircuitBreaker>,
    ) -> Result<Self> {
        options.validate()?;
        let endpoint = endpoint.into();

        let client = HttpClientBuilder::default()
            .request_timeout(options.request_timeout)
            .max_concurrent_requests(options.max_concurrent_requests)
            .build(&endpoint)
            .map_err(|err| anyhow!("failed to build tunnel RPC client: {err}"))?;

        Ok(Self {
            endpoint: Arc::new(endpoint),
            client,
            options,
            metrics: Arc::new(RpcMetrics::default()),
            breaker,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn metrics(&self) -> RpcMetricsSnapshot {
        self.metrics.snapshot(self.breaker.snapshot().state)
    }

    async fn call<T, F, Fut>(
        &self,
        context: RetryContext<'_>,
        mut operation: F,
    ) -> Result<T, TunnelError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, TunnelError>>,
    {
        let mut attempt = 0;

        loop {
            match self.breaker.before_request() {
                Ok(state) => context.log_permit(state),
                Err(CircuitBreakerError::CircuitOpen) => {
                    context.log_circuit_open();
                    return Err(TunnelError::CircuitOpen);
                }
            }

            attempt += 1;
            let start = Instant::now();

            let err = match operation().await {
                Ok(value) => {
                    self.metrics.record_success(start.elapsed());
                    self.breaker.record_success();
                    return Ok(value);
                }
                Err(err) => err,
            };

            let elapsed = start.elapsed();
            if !err.is_transient() {
                // The service answered; the endpoint itself is healthy.
                self.metrics.record_rejection(elapsed);
                self.breaker.record_success();
                return Err(err);
            }

            if matches!(err, TunnelError::Timeout { .. }) {
                self.metrics.record_timeout(elapsed);
            } else {
                self.metrics.record_failure(elapsed);
            }
            self.breaker.record_failure();

            if attempt >= self.options.max_attempts {
                context.log_exhausted(attempt, &err);
                return Err(err);
            }

            let backoff = self.backoff_delay(attempt);
            context.log_retry(attempt, backoff, &err);
            sleep(backoff).await;
        }
    }

    async fn invoke<R, P>(&self, method: &'static str, params: P) -> Result<R, TunnelError>
    where
        R: DeserializeOwned,
        P: Serialize + Send,
    {
        let mut rpc_params = ArrayParams::new();
        rpc_params.insert(params).map_err(|err| {
            TunnelError::Transport(format!("failed to encode {method} params: {err}"))
        })?;

        timeout(
            self.options.request_timeout,
            self.client.request::<R, _>(method, rpc_params),
        )
        .await
        .map_err(|_| TunnelError::Timeout { method })?
        .map_err(|err| map_rpc_error(method, err))
    }

    fn backoff_delay(&self, attempt: usize) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16) as u32;
        self.options
            .initial_backoff
            .saturating_mul(1u32 << exponent)
            .min(self.options.max_backoff)
    }
}

impl TunnelClient for JsonRpcTunnelClient {
    fn connect_session<'a>(
        &'a self,
        tunnel_id: &'a str,
        config: &'a ClientConfig,
    ) -> TunnelFuture<'a, String> {
        Box::pin(async move {
            let params = ConnectParams {
                tunnel_id,
                client_config: config,
            };
            let result: ConnectResult = self
                .call(RetryContext::new(&CONNECT_RETRY), || {
                    self.invoke(CONNECT_RETRY.method, &params)
                })
                .await?;
            Ok(result.client_id)
        })
    }

    fn heartbeat<'a>(
        &'a self,
        tunnel_id: &'a str,
        client_id: &'a str,
        channels: &'a [Channel],
    ) -> TunnelFuture<'a, Vec<Channel>> {
        Box::pin(async move {
            let params = HeartbeatParams {
                tunnel_id,
                client_id,
                channels,
            };
            let result: HeartbeatResult = self
                .call(RetryContext::new(&HEARTBEAT_RETRY), || {
                    self.invoke(HEARTBEAT_RETRY.method, &params)
                })
                .await?;
            Ok(result.channels)
        })
    }

    fn read_records<'a>(
        &'a self,
        request: &'a ReadRecordsRequest,
    ) -> TunnelFuture<'a, ReadRecordsResponse> {
        Box::pin(async move {
            let context = RetryContext::for_channel(&READ_RECORDS_RETRY, &request.channel_id);
            let response: ReadRecordsResponse = self
                .call(context, || self.invoke(context.method(), request))
                .await?;
            Ok(response)
        })
    }

    fn checkpoint<'a>(&'a self, request: &'a CheckpointRequest) -> TunnelFuture<'a, ()> {
        Box::pin(async move {
            let context = RetryContext::for_channel(&CHECKPOINT_RETRY, &request.channel_id);
            let _: serde_json::Value = self
                .call(context, || self.invoke(context.method(), request))
                .await?;
            Ok(())
        })
    }

    fn get_checkpoint<'a>(
        &'a self,
        tunnel_id: &'a str,
        client_id: &'a str,
        channel_id: &'a str,
    ) -> TunnelFuture<'a, Checkpoint> {
        Box::pin(async move {
            let params = GetCheckpointParams {
                tunnel_id,
                client_id,
                channel_id,
            };
            let context = RetryContext::for_channel(&GET_CHECKPOINT_RETRY, channel_id);
            let checkpoint: Checkpoint = self
                .call(context, || self.invoke(context.method(), &params))
                .await?;
            Ok(checkpoint)
        })
    }

    fn close_session<'a>(&'a self, tunnel_id: &'a str, client_id: &'a str) -> TunnelFuture<'a, ()> {
        Box::pin(async move {
            let params = SessionParams {
                tunnel_id,
                client_id,
            };
            let _: serde_json::Value = self
                .call(RetryContext::new(&SHUTDOWN_RETRY), || {
                    self.invoke(SHUTDOWN_RETRY.method, &params)
                })
                .await?;
            Ok(())
        })
    }
}

fn map_rpc_error(method: &'static str, err: JsonRpcError) -> TunnelError {
    match err {
        JsonRpcError::Call(object) => error_from_code(object.code(), object.message()),
        JsonRpcError::RequestTimeout => TunnelError::Timeout { method },
        other => TunnelError::Transport(format!("{method}: {other}")),
    }
}

fn error_from_code(code: i32, message: &str) -> TunnelError {
    let message = message.to_string();
    match code {
        error_codes::TUNNEL_EXPIRED => TunnelError::TunnelExpired { message },
        error_codes::PARAMETER_INVALID => TunnelError::ParameterInvalid { message },
        error_codes::SEQUENCE_NUMBER_NOT_MATCH => TunnelError::SequenceNumberNotMatch { message },
        error_codes::RESOURCE_GONE => TunnelError::ResourceGone { message },
        error_codes::SERVER_UNAVAILABLE => TunnelError::ServerUnavailable { message },
        code => TunnelError::Server { code, message },
    }
}
