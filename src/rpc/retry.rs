//! Per-method log labels and retry context for the JSON-RPC adapter, so every
//! Tunnel call reports breaker rejections, retries, and exhaustion the same way.

use std::time::Duration;

use crate::rpc::circuit_breaker::CircuitState;
use crate::rpc::client::TunnelError;

macro_rules! log_with_channel {
    ($level:ident, $ctx:expr, $($rest:tt)*) => {{
        if let Some(channel_id) = $ctx.channel_id {
            tracing::$level!(method = $ctx.messages.method, channel_id, $($rest)*);
        } else {
            tracing::$level!(method = $ctx.messages.method, $($rest)*);
        }
    }};
}

#[derive(Clone, Copy)]
pub(crate) struct RetryMessages {
    pub(crate) method: &'static str,
    pub(crate) circuit_open: &'static str,
    pub(crate) retry: &'static str,
    pub(crate) exhausted: &'static str,
}

#[derive(Clone, Copy)]
pub(crate) struct RetryContext<'a> {
    channel_id: Option<&'a str>,
    pub(crate) messages: &'static RetryMessages,
}

impl<'a> RetryContext<'a> {
    pub(crate) fn new(messages: &'static RetryMessages) -> Self {
        Self {
            channel_id: None,
            messages,
        }
    }

    pub(crate) fn for_channel(messages: &'static RetryMessages, channel_id: &'a str) -> Self {
        Self {
            channel_id: Some(channel_id),
            messages,
        }
    }

    pub(crate) fn method(&self) -> &'static str {
        self.messages.method
    }

    pub(crate) fn log_permit(&self, state: CircuitState) {
        log_with_channel!(trace, self, breaker_state = ?state, "circuit breaker permit acquired");
    }

    pub(crate) fn log_circuit_open(&self) {
        log_with_channel!(warn, self, "{}", self.messages.circuit_open);
    }

    pub(crate) fn log_retry(&self, attempt: usize, backoff: Duration, err: &TunnelError) {
        let backoff_ms = backoff.as_millis().min(u128::from(u64::MAX)) as u64;
        log_with_channel!(
            warn,
            self,
            attempt,
            backoff_ms,
            error = %err,
            "{}",
            self.messages.retry
        );
    }

    pub(crate) fn log_exhausted(&self, attempt: usize, err: &TunnelError) {
        log_with_channel!(error, self, attempt, error = %err, "{}", self.messages.exhausted);
    }
}

pub(crate) const CONNECT_RETRY: RetryMessages = RetryMessages {
    method: "tunnel_connect",
    circuit_open: "circuit breaker open; rejecting session connect",
    retry: "session connect failed; retrying",
    exhausted: "session connect exhausted retries",
};

pub(crate) const HEARTBEAT_RETRY: RetryMessages = RetryMessages {
    method: "tunnel_heartbeat",
    circuit_open: "circuit breaker open; rejecting heartbeat",
    retry: "heartbeat failed; retrying",
    exhausted: "heartbeat exhausted retries",
};

pub(crate) const READ_RECORDS_RETRY: RetryMessages = RetryMessages {
    method: "tunnel_readRecords",
    circuit_open: "circuit breaker open; rejecting readRecords",
    retry: "readRecords failed; retrying",
    exhausted: "readRecords exhausted retries",
};

pub(crate) const CHECKPOINT_RETRY: RetryMessages = RetryMessages {
    method: "tunnel_checkpoint",
    circuit_open: "circuit breaker open; rejecting checkpoint",
    retry: "checkpoint failed; retrying",
    exhausted: "checkpoint exhausted retries",
};

pub(crate) const GET_CHECKPOINT_RETRY: RetryMessages = RetryMessages {
    method: "tunnel_getCheckpoint",
    circuit_open: "circuit breaker open; rejecting getCheckpoint",
    retry: "getCheckpoint failed; retrying",
    exhausted: "getCheckpoint exhausted retries",
};

pub(crate) const SHUTDOWN_RETRY: RetryMessages = RetryMessages {
    method: "tunnel_shutdown",
    circuit_open: "circuit breaker open; rejecting session shutdown",
    retry: "session shutdown failed; retrying",
    exhausted: "session shutdown exhausted retries",
};
