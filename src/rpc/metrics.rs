//! Request counters kept by the JSON-RPC adapter.

use crate::rpc::circuit_breaker::CircuitState;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

#[derive(Debug, Default)]
pub(crate) struct RpcMetrics {
    requests: AtomicU64,
    errors: AtomicU64,
    timeouts: AtomicU64,
    server_rejections: AtomicU64,
    latency_ns: AtomicU64,
}

impl RpcMetrics {
    fn record_latency(&self, latency: Duration) {
        let nanos = latency.as_nanos().min(u128::from(u64::MAX)) as u64;
        self.requests.fetch_add(1, Ordering::Relaxed);
        self.latency_ns.fetch_add(nanos, Ordering::Relaxed);
    }

    pub(crate) fn record_success(&self, latency: Duration) {
        self.record_latency(latency);
    }

    pub(crate) fn record_failure(&self, latency: Duration) {
        self.record_latency(latency);
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_timeout(&self, latency: Duration) {
        self.record_failure(latency);
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    /// The service answered, but with an error code (sequence mismatch, expired tunnel...).
    pub(crate) fn record_rejection(&self, latency: Duration) {
        self.record_latency(latency);
        self.server_rejections.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self, breaker_state: CircuitState) -> RpcMetricsSnapshot {
        let requests = self.requests.load(Ordering::Relaxed);
        let errors = self.errors.load(Ordering::Relaxed);
        let latency_ns = self.latency_ns.load(Ordering::Relaxed);
        let average_latency_ms = if requests == 0 {
            0.0
        } else {
            latency_ns as f64 / requests as f64 / 1_000_000.0
        };

        RpcMetricsSnapshot {
            requests,
            errors,
            timeouts: self.timeouts.load(Ordering::Relaxed),
            server_rejections: self.server_rejections.load(Ordering::Relaxed),
            average_latency_ms,
            breaker_state,
        }
    }
}

#[derive(Debug, Copy, Clone)]
pub struct RpcMetricsSnapshot {
    pub requests: u64,
    pub errors: u64,
    pub timeouts: u64,
    pub server_rejections: u64,
    pub average_latency_ms: f64,
    pub breaker_state: CircuitState,
}
