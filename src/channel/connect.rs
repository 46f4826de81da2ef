use crate::channel::executor::ChannelExecutor;
use crate::channel::pipeline::{self, PipelineSettings};
use crate::checkpoint::{Checkpointer, DefaultChannelProcessor};
use crate::model::{Channel, ChannelStatus};
use crate::rpc::client::TunnelClient;
use crate::runtime::telemetry::Telemetry;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

/// Local lifecycle of a [`ChannelConnect`]. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ChannelConnectStatus {
    Wait = 0,
    Running = 1,
    Closing = 2,
    Closed = 3,
}

impl ChannelConnectStatus {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ChannelConnectStatus::Wait,
            1 => ChannelConnectStatus::Running,
            2 => ChannelConnectStatus::Closing,
            _ => ChannelConnectStatus::Closed,
        }
    }
}

impl fmt::Display for ChannelConnectStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChannelConnectStatus::Wait => "WAIT",
            ChannelConnectStatus::Running => "RUNNING",
            ChannelConnectStatus::Closing => "CLOSING",
            ChannelConnectStatus::Closed => "CLOSED",
        };
        f.write_str(name)
    }
}

/// Receives the CLOSE/TERMINATED reports a connect produces for its own
/// channel so the next heartbeat carries them.
pub trait ChannelStatusSink: Send + Sync {
    fn update_status(&self, channel: Channel);
}

/// Everything a pipeline needs besides its connect; shared by all connects
/// of one dialer.
pub(crate) struct ConnectRuntime {
    pub client: Arc<dyn TunnelClient>,
    pub executor: Arc<ChannelExecutor>,
    pub telemetry: Arc<Telemetry>,
    pub settings: PipelineSettings,
}

/// In-process handle and state machine of one assigned channel.
///
/// Server notifications arrive through [`notify_status`](Self::notify_status);
/// the pipeline task owned by the connect reports back through
/// [`check_and_update_channel_status`](Self::check_and_update_channel_status).
/// Every transition is a compare-and-swap on an atomic and never blocks.
pub struct ChannelConnect {
    tunnel_id: String,
    client_id: String,
    channel_id: String,
    channel: Mutex<Option<Channel>>,
    status: AtomicU8,
    finished: AtomicBool,
    is_stream: bool,
    start_token: String,
    checkpointer: Arc<Checkpointer>,
    processor: Arc<tokio::sync::Mutex<DefaultChannelProcessor>>,
    shutdown_started: AtomicBool,
    cancel: CancellationToken,
    runtime: Arc<ConnectRuntime>,
    sink: Weak<dyn ChannelStatusSink>,
    pipeline_task: Mutex<Option<JoinHandle<()>>>,
    shutdown_task: Mutex<Option<JoinHandle<()>>>,
}

pub(crate) struct ConnectParts {
    pub tunnel_id: String,
    pub client_id: String,
    pub channel_id: String,
    pub is_stream: bool,
    pub finished: bool,
    pub start_token: String,
    pub checkpointer: Arc<Checkpointer>,
    pub processor: DefaultChannelProcessor,
    pub cancel: CancellationToken,
    pub runtime: Arc<ConnectRuntime>,
    pub sink: Weak<dyn ChannelStatusSink>,
}

impl ChannelConnect {
    pub(crate) fn new(parts: ConnectParts) -> Arc<Self> {
        Arc::new(Self {
            tunnel_id: parts.tunnel_id,
            client_id: parts.client_id,
            channel_id: parts.channel_id,
            channel: Mutex::new(None),
            status: AtomicU8::new(ChannelConnectStatus::Wait as u8),
            finished: AtomicBool::new(parts.finished),
            is_stream: parts.is_stream,
            start_token: parts.start_token,
            checkpointer: parts.checkpointer,
            processor: Arc::new(tokio::sync::Mutex::new(parts.processor)),
            shutdown_started: AtomicBool::new(false),
            cancel: parts.cancel,
            runtime: parts.runtime,
            sink: parts.sink,
            pipeline_task: Mutex::new(None),
            shutdown_task: Mutex::new(None),
        })
    }

    pub fn tunnel_id(&self) -> &str {
        &self.tunnel_id
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn channel_id(&self) -> &str {
        &self.channel_id
    }

    pub fn status(&self) -> ChannelConnectStatus {
        ChannelConnectStatus::from_u8(self.status.load(Ordering::SeqCst))
    }

    pub fn is_running(&self) -> bool {
        self.status() == ChannelConnectStatus::Running
    }

    pub fn is_closed(&self) -> bool {
        self.status() == ChannelConnectStatus::Closed
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }

    pub fn is_stream(&self) -> bool {
        self.is_stream
    }

    /// Last channel snapshot this connect accepted or reported.
    pub fn channel(&self) -> Option<Channel> {
        self.channel.lock().clone()
    }

    pub fn checkpointer(&self) -> &Arc<Checkpointer> {
        &self.checkpointer
    }

    pub(crate) fn processor(&self) -> &Arc<tokio::sync::Mutex<DefaultChannelProcessor>> {
        &self.processor
    }

    pub(crate) fn runtime(&self) -> &ConnectRuntime {
        &self.runtime
    }

    pub(crate) fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub(crate) fn start_token(&self) -> &str {
        &self.start_token
    }

    fn transition(&self, from: ChannelConnectStatus, to: ChannelConnectStatus) -> bool {
        self.status
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Applies a server-side view of the channel. Snapshots whose version is
    /// not newer than the held one are ignored.
    pub fn notify_status(self: &Arc<Self>, channel: Channel) {
        {
            let mut held = self.channel.lock();
            if let Some(current) = held.as_ref() {
                if channel.version <= current.version {
                    tracing::trace!(
                        channel_id = %self.channel_id,
                        held = current.version,
                        offered = channel.version,
                        "ignoring stale channel notification"
                    );
                    return;
                }
            }
            *held = Some(channel.clone());
        }

        tracing::debug!(
            channel_id = %self.channel_id,
            version = channel.version,
            status = %channel.status,
            local = %self.status(),
            "channel notification"
        );

        match channel.status {
            ChannelStatus::Wait => {}
            ChannelStatus::Open => {
                if self.is_finished() {
                    self.close(true);
                    self.check_and_update_channel_status();
                } else if self
                    .transition(ChannelConnectStatus::Wait, ChannelConnectStatus::Running)
                {
                    self.start_pipeline();
                } else {
                    self.check_and_update_channel_status();
                }
            }
            ChannelStatus::Closing => {
                if self.transition(ChannelConnectStatus::Wait, ChannelConnectStatus::Closed) {
                    self.close(false);
                } else {
                    self.transition(ChannelConnectStatus::Running, ChannelConnectStatus::Closing);
                }
                self.check_and_update_channel_status();
            }
            ChannelStatus::Close => {
                self.close(false);
            }
            ChannelStatus::Terminated => {
                self.close(true);
            }
        }
    }

    fn start_pipeline(self: &Arc<Self>) {
        let handle = tokio::spawn(pipeline::run_pipeline(self.clone()));
        *self.pipeline_task.lock() = Some(handle);
    }

    /// Reports a locally reached CLOSED state upstream, once, as CLOSE or
    /// TERMINATED at the next channel version.
    pub fn check_and_update_channel_status(&self) {
        if !self.is_closed() {
            return;
        }

        let report = {
            let mut held = self.channel.lock();
            let Some(channel) = held.as_mut() else {
                return;
            };
            if channel.status.is_terminal() {
                return;
            }
            channel.version += 1;
            channel.status = if self.is_finished() {
                ChannelStatus::Terminated
            } else {
                ChannelStatus::Close
            };
            channel.clone()
        };

        tracing::info!(
            tunnel_id = %self.tunnel_id,
            channel_id = %self.channel_id,
            version = report.version,
            status = %report.status,
            "reporting channel release"
        );

        if let Some(sink) = self.sink.upgrade() {
            sink.update_status(report);
        }
    }

    /// Moves to CLOSED and releases the user processor. Repeated calls only
    /// latch `finish`; the processor shutdown runs once.
    pub fn close(&self, finish: bool) {
        if finish {
            self.finished.store(true, Ordering::SeqCst);
        }

        let previous = ChannelConnectStatus::from_u8(
            self.status
                .swap(ChannelConnectStatus::Closed as u8, Ordering::SeqCst),
        );
        self.cancel.cancel();

        if self.shutdown_started.swap(true, Ordering::SeqCst) {
            return;
        }

        tracing::info!(
            channel_id = %self.channel_id,
            previous = %previous,
            finished = self.is_finished(),
            "closing channel connect"
        );

        let processor = self.processor.clone();
        let channel_id = self.channel_id.clone();
        let handle = tokio::spawn(async move {
            if let Err(err) = processor.lock().await.shutdown().await {
                tracing::warn!(channel_id = %channel_id, error = %err, "processor shutdown failed");
            }
        });
        *self.shutdown_task.lock() = Some(handle);
    }

    /// Waits up to `grace` for the pipeline and processor shutdown tasks.
    pub async fn join(&self, grace: Duration) {
        let handles: Vec<JoinHandle<()>> = [
            self.pipeline_task.lock().take(),
            self.shutdown_task.lock().take(),
        ]
        .into_iter()
        .flatten()
        .collect();

        for handle in handles {
            match timeout(grace, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    tracing::warn!(
                        channel_id = %self.channel_id,
                        error = %err,
                        "channel task panicked"
                    );
                }
                Err(_) => {
                    tracing::warn!(
                        channel_id = %self.channel_id,
                        grace_ms = grace.as_millis() as u64,
                        "channel task did not stop in time"
                    );
                }
            }
        }
    }
}

impl fmt::Debug for ChannelConnect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelConnect")
            .field("channel_id", &self.channel_id)
            .field("status", &self.status())
            .field("finished", &self.is_finished())
            .field("channel", &self.channel())
            .finish()
    }
}

/// Stand-in registered when dialing a channel failed.
///
/// It never reads; any non-terminal notification is answered with CLOSE at
/// the next version so the service can hand the channel to another client.
pub struct FailedChannelConnect {
    channel_id: String,
    reason: String,
    channel: Mutex<Option<Channel>>,
    sink: Weak<dyn ChannelStatusSink>,
}

impl FailedChannelConnect {
    pub(crate) fn new(
        channel_id: impl Into<String>,
        reason: impl Into<String>,
        sink: Weak<dyn ChannelStatusSink>,
    ) -> Self {
        Self {
            channel_id: channel_id.into(),
            reason: reason.into(),
            channel: Mutex::new(None),
            sink,
        }
    }

    pub fn channel_id(&self) -> &str {
        &self.channel_id
    }

    pub fn channel(&self) -> Option<Channel> {
        self.channel.lock().clone()
    }

    pub fn notify_status(&self, channel: Channel) {
        let report = {
            let mut held = self.channel.lock();
            if let Some(current) = held.as_ref() {
                if channel.version <= current.version {
                    return;
                }
            }
            if channel.status.is_terminal() {
                *held = Some(channel);
                return;
            }
            let report = Channel {
                version: channel.version + 1,
                status: ChannelStatus::Close,
                ..channel
            };
            *held = Some(report.clone());
            report
        };

        tracing::warn!(
            channel_id = %self.channel_id,
            version = report.version,
            reason = %self.reason,
            "releasing channel that failed to dial"
        );

        if let Some(sink) = self.sink.upgrade() {
            sink.update_status(report);
        }
    }
}

/// Entry of the connect map: a live connect or a failed-dial stand-in.
#[derive(Clone)]
pub enum ChannelConnection {
    Active(Arc<ChannelConnect>),
    Failed(Arc<FailedChannelConnect>),
}

impl ChannelConnection {
    pub fn channel_id(&self) -> &str {
        match self {
            ChannelConnection::Active(connect) => connect.channel_id(),
            ChannelConnection::Failed(failed) => failed.channel_id(),
        }
    }

    pub fn notify_status(&self, channel: Channel) {
        match self {
            ChannelConnection::Active(connect) => connect.notify_status(channel),
            ChannelConnection::Failed(failed) => failed.notify_status(channel),
        }
    }

    pub fn close(&self) {
        if let ChannelConnection::Active(connect) = self {
            connect.close(false);
        }
    }

    pub fn is_closed(&self) -> bool {
        match self {
            ChannelConnection::Active(connect) => connect.is_closed(),
            ChannelConnection::Failed(_) => true,
        }
    }

    pub fn channel(&self) -> Option<Channel> {
        match self {
            ChannelConnection::Active(connect) => connect.channel(),
            ChannelConnection::Failed(failed) => failed.channel(),
        }
    }

    /// True when this entry is spent and the service offers its channel again
    /// at a newer version, so a fresh dial must take its place.
    pub(crate) fn should_redial(&self, offered: &Channel) -> bool {
        if !self.is_closed() {
            return false;
        }
        if !matches!(offered.status, ChannelStatus::Wait | ChannelStatus::Open) {
            return false;
        }
        match self.channel() {
            Some(held) => offered.version > held.version,
            None => false,
        }
    }

    pub async fn join(&self, grace: Duration) {
        if let ChannelConnection::Active(connect) = self {
            connect.join(grace).await;
        }
    }
}

impl fmt::Debug for ChannelConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelConnection::Active(connect) => f.debug_tuple("Active").field(connect).finish(),
            ChannelConnection::Failed(failed) => f
                .debug_struct("Failed")
                .field("channel_id", &failed.channel_id)
                .field("reason", &failed.reason)
                .finish(),
        }
    }
}
