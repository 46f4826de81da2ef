//! The abstract RPC surface the consumption engine depends on, its request
//! and response shapes, and the error taxonomy used to decide between halting,
//! retrying, and self-healing.

use crate::model::{Channel, Checkpoint, StreamRecord};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

pub type TunnelFuture<'a, T> = BoxFuture<'a, Result<T, TunnelError>>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TunnelError {
    /// The tunnel was deleted or its session can no longer be used.
    #[error("tunnel expired: {message}")]
    TunnelExpired { message: String },
    #[error("tunnel request rejected as invalid: {message}")]
    ParameterInvalid { message: String },
    #[error("checkpoint sequence number mismatch: {message}")]
    SequenceNumberNotMatch { message: String },
    #[error("channel resource gone: {message}")]
    ResourceGone { message: String },
    #[error("tunnel server unavailable: {message}")]
    ServerUnavailable { message: String },
    #[error("rpc method {method} timed out")]
    Timeout { method: &'static str },
    #[error("rpc circuit breaker is open")]
    CircuitOpen,
    #[error("rpc transport error: {0}")]
    Transport(String),
    #[error("tunnel server error (code={code}): {message}")]
    Server { code: i32, message: String },
}

impl TunnelError {
    /// Errors after which no retry can succeed; the worker halts.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            TunnelError::TunnelExpired { .. } | TunnelError::ParameterInvalid { .. }
        )
    }

    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            TunnelError::ServerUnavailable { .. }
                | TunnelError::Timeout { .. }
                | TunnelError::CircuitOpen
                | TunnelError::Transport(_)
        )
    }

    pub fn is_sequence_mismatch(&self) -> bool {
        matches!(self, TunnelError::SequenceNumberNotMatch { .. })
    }
}

/// Client description sent when a session is opened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientConfig {
    pub client_tag: String,
    pub heartbeat_timeout_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadRecordsRequest {
    pub tunnel_id: String,
    pub client_id: String,
    pub channel_id: String,
    pub token: String,
    pub max_bytes: usize,
    pub max_rounds: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReadRecordsResponse {
    #[serde(default)]
    pub records: Vec<StreamRecord>,
    #[serde(default)]
    pub next_token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointRequest {
    pub tunnel_id: String,
    pub client_id: String,
    pub channel_id: String,
    pub token: String,
    pub sequence_number: i64,
}

/// Remote Tunnel service operations used by the worker.
///
/// Implementations must be cheap to share: the engine holds one instance behind
/// an `Arc` and calls it concurrently from the heartbeat task and every channel
/// pipeline.
pub trait TunnelClient: Send + Sync {
    /// Opens a logical session and returns the server-assigned client id.
    fn connect_session<'a>(
        &'a self,
        tunnel_id: &'a str,
        config: &'a ClientConfig,
    ) -> TunnelFuture<'a, String>;

    /// Reports the locally known channels and returns the authoritative assignment.
    fn heartbeat<'a>(
        &'a self,
        tunnel_id: &'a str,
        client_id: &'a str,
        channels: &'a [Channel],
    ) -> TunnelFuture<'a, Vec<Channel>>;

    fn read_records<'a>(
        &'a self,
        request: &'a ReadRecordsRequest,
    ) -> TunnelFuture<'a, ReadRecordsResponse>;

    fn checkpoint<'a>(&'a self, request: &'a CheckpointRequest) -> TunnelFuture<'a, ()>;

    fn get_checkpoint<'a>(
        &'a self,
        tunnel_id: &'a str,
        client_id: &'a str,
        channel_id: &'a str,
    ) -> TunnelFuture<'a, Checkpoint>;

    fn close_session<'a>(&'a self, tunnel_id: &'a str, client_id: &'a str) -> TunnelFuture<'a, ()>;
}
