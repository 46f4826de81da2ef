//! Collaborator surface of the Tunnel service: the `TunnelClient` trait the
//! engine is written against, plus a JSON-RPC adapter with circuit breaker,
//! retry policy, and request metrics.

pub mod circuit_breaker;
pub mod client;
pub mod jsonrpc;
pub mod metrics;
pub mod options;
pub mod retry;

#[cfg(test)]
pub(crate) mod mock;

pub use circuit_breaker::{
    CircuitBreakerError, CircuitBreakerSnapshot, CircuitState, RpcCircuitBreaker,
};
pub use client::{
    CheckpointRequest, ClientConfig, ReadRecordsRequest, ReadRecordsResponse, TunnelClient,
    TunnelError, TunnelFuture,
};
pub use jsonrpc::JsonRpcTunnelClient;
pub use metrics::RpcMetricsSnapshot;
pub use options::JsonRpcClientOptions;
