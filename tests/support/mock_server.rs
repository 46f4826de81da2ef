use std::{
    convert::Infallible,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use anyhow::{Context, Result};
use hyper::service::{make_service_fn, service_fn};
use hyper::{body, Body, Method, Request, Response, Server, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tunnel_worker::rpc::jsonrpc::error_codes;
use tunnel_worker::{Channel, CheckpointRequest, ClientConfig, ReadRecordsRequest, TunnelError};

use crate::support::fake_tunnel::FakeTunnel;

/// Serves a [`FakeTunnel`] over JSON-RPC 2.0, the way the real service is reached.
pub struct MockTunnelServer {
    url: String,
    state: ServerState,
    shutdown: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

#[derive(Clone)]
struct ServerState {
    tunnel: FakeTunnel,
    /// Number of upcoming calls answered with a server-unavailable error.
    unavailable_calls: Arc<AtomicUsize>,
    calls: Arc<AtomicUsize>,
}

impl MockTunnelServer {
    pub async fn start(tunnel: FakeTunnel) -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .context("failed to bind mock tunnel listener")?;
        let addr = listener
            .local_addr()
            .context("failed to read mock listener address")?;
        let std_listener = listener
            .into_std()
            .context("failed to convert mock listener")?;
        std_listener
            .set_nonblocking(true)
            .context("failed to set mock listener non-blocking")?;

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let state = ServerState {
            tunnel,
            unavailable_calls: Arc::new(AtomicUsize::new(0)),
            calls: Arc::new(AtomicUsize::new(0)),
        };

        let service_state = state.clone();
        let make_service = make_service_fn(move |_| {
            let state = service_state.clone();
            async move {
                Ok::<_, Infallible>(service_fn(move |req| serve_request(state.clone(), req)))
            }
        });

        let server = Server::from_tcp(std_listener)
            .context("failed to build mock HTTP server")?
            .serve(make_service);
        let graceful = server.with_graceful_shutdown(async {
            let _ = shutdown_rx.await;
        });

        let handle = tokio::spawn(async move {
            if let Err(err) = graceful.await {
                eprintln!("mock tunnel server stopped: {err}");
            }
        });

        Ok(Self {
            url: format!("http://{}", addr),
            state,
            shutdown: Some(shutdown_tx),
            handle: Some(handle),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Answers the next `calls` requests with a server-unavailable error.
    pub fn fail_next_calls(&self, calls: usize) {
        self.state.unavailable_calls.store(calls, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.state.calls.load(Ordering::SeqCst)
    }

    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

async fn serve_request(
    state: ServerState,
    req: Request<Body>,
) -> Result<Response<Body>, Infallible> {
    if req.method() != Method::POST {
        let mut response = Response::new(Body::from("Unsupported method"));
        *response.status_mut() = StatusCode::METHOD_NOT_ALLOWED;
        return Ok(response);
    }

    let bytes = match body::to_bytes(req.into_body()).await {
        Ok(bytes) => bytes,
        Err(err) => {
            let mut response = Response::new(Body::from(format!("failed to read body: {err}")));
            *response.status_mut() = StatusCode::BAD_REQUEST;
            return Ok(response);
        }
    };

    let payload: Value = match serde_json::from_slice(&bytes) {
        Ok(value) => value,
        Err(err) => {
            let mut response = Response::new(Body::from(format!("invalid JSON payload: {err}")));
            *response.status_mut() = StatusCode::BAD_REQUEST;
            return Ok(response);
        }
    };

    let response_value = if payload.is_array() {
        Value::Array(
            payload
                .as_array()
                .cloned()
                .unwrap_or_default()
                .into_iter()
                .map(|call| handle_call(&state, call))
                .collect(),
        )
    } else {
        handle_call(&state, payload)
    };

    let mut response = Response::new(Body::from(response_value.to_string()));
    response.headers_mut().insert(
        hyper::header::CONTENT_TYPE,
        hyper::header::HeaderValue::from_static("application/json"),
    );
    Ok(response)
}

#[derive(Deserialize)]
struct ConnectParams {
    tunnel_id: String,
    client_config: ClientConfig,
}

#[derive(Deserialize)]
struct HeartbeatParams {
    tunnel_id: String,
    client_id: String,
    channels: Vec<Channel>,
}

#[derive(Deserialize)]
struct SessionParams {
    tunnel_id: String,
    client_id: String,
}

#[derive(Deserialize)]
struct GetCheckpointParams {
    tunnel_id: String,
    channel_id: String,
}

fn handle_call(state: &ServerState, call: Value) -> Value {
    state.calls.fetch_add(1, Ordering::SeqCst);
    let id = call.get("id").cloned().unwrap_or(Value::Null);
    let method = call
        .get("method")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let params = call
        .get("params")
        .and_then(Value::as_array)
        .and_then(|arr| arr.first())
        .cloned()
        .unwrap_or(Value::Null);

    let pending = state.unavailable_calls.load(Ordering::SeqCst);
    if pending > 0 {
        state.unavailable_calls.store(pending - 1, Ordering::SeqCst);
        return error(id, error_codes::SERVER_UNAVAILABLE, "try again later");
    }

    let tunnel = &state.tunnel;
    let result = match method.as_str() {
        "tunnel_connect" => parse::<ConnectParams>(params).and_then(|p| {
            tunnel
                .open_session(&p.tunnel_id, &p.client_config)
                .map(|client_id| json!({ "client_id": client_id }))
        }),
        "tunnel_heartbeat" => parse::<HeartbeatParams>(params).and_then(|p| {
            tunnel
                .heartbeat_channels(&p.tunnel_id, &p.client_id, &p.channels)
                .map(|channels| json!({ "channels": channels }))
        }),
        "tunnel_readRecords" => parse::<ReadRecordsRequest>(params)
            .and_then(|request| tunnel.read(&request))
            .map(|response| json!(response)),
        "tunnel_checkpoint" => parse::<CheckpointRequest>(params)
            .and_then(|request| tunnel.commit(&request))
            .map(|()| json!({})),
        "tunnel_getCheckpoint" => parse::<GetCheckpointParams>(params)
            .and_then(|p| tunnel.load_checkpoint(&p.tunnel_id, &p.channel_id))
            .map(|checkpoint| json!(checkpoint)),
        "tunnel_shutdown" => parse::<SessionParams>(params)
            .and_then(|p| tunnel.end_session(&p.tunnel_id, &p.client_id))
            .map(|()| json!({})),
        _ => return error(id, -32601, format!("unknown method {method}")),
    };

    match result {
        Ok(value) => success(id, value),
        Err(err) => error(id, code_for(&err), err.to_string()),
    }
}

fn parse<T: DeserializeOwned>(params: Value) -> Result<T, TunnelError> {
    serde_json::from_value(params).map_err(|err| TunnelError::ParameterInvalid {
        message: err.to_string(),
    })
}

fn code_for(err: &TunnelError) -> i32 {
    match err {
        TunnelError::TunnelExpired { .. } => error_codes::TUNNEL_EXPIRED,
        TunnelError::ParameterInvalid { .. } => error_codes::PARAMETER_INVALID,
        TunnelError::SequenceNumberNotMatch { .. } => error_codes::SEQUENCE_NUMBER_NOT_MATCH,
        TunnelError::ResourceGone { .. } => error_codes::RESOURCE_GONE,
        TunnelError::ServerUnavailable { .. } => error_codes::SERVER_UNAVAILABLE,
        _ => -32000,
    }
}

fn success(id: Value, result: Value) -> Value {
    json!({
        "jsonrpc": "2.0",
        "result": result,
        "id": id,
    })
}

fn error(id: Value, code: i32, message: impl Into<String>) -> Value {
    json!({
        "jsonrpc": "2.0",
        "error": {
            "code": code,
            "message": message.into(),
        },
        "id": id,
    })
}
