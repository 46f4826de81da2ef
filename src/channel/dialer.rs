use crate::channel::connect::{ChannelConnect, ChannelStatusSink, ConnectParts, ConnectRuntime};
use crate::channel::executor::ChannelExecutor;
use crate::channel::pipeline::PipelineSettings;
use crate::checkpoint::{ChannelProcessFactory, Checkpointer};
use crate::model::Channel;
use crate::rpc::client::TunnelClient;
use crate::runtime::config::TunnelWorkerConfig;
use crate::runtime::processor::ChannelContext;
use crate::runtime::telemetry::Telemetry;
use anyhow::{bail, Context, Result};
use std::sync::{Arc, Weak};
use tokio_util::sync::CancellationToken;

/// Builds a [`ChannelConnect`] for a newly assigned channel of one session.
///
/// All connects of a dialer share its executor and hang off its root
/// cancellation token, so [`shutdown`](Self::shutdown) stops every pipeline.
pub struct ChannelDialer {
    tunnel_id: String,
    client_id: String,
    client: Arc<dyn TunnelClient>,
    process_factory: ChannelProcessFactory,
    runtime: Arc<ConnectRuntime>,
    root: CancellationToken,
}

impl ChannelDialer {
    pub fn new(
        tunnel_id: impl Into<String>,
        client_id: impl Into<String>,
        client: Arc<dyn TunnelClient>,
        process_factory: ChannelProcessFactory,
        config: &TunnelWorkerConfig,
        telemetry: Arc<Telemetry>,
    ) -> Self {
        let executor = Arc::new(ChannelExecutor::new(
            config.max_channel_parallel(),
            config.read_concurrency(),
            config.process_concurrency(),
        ));

        Self {
            tunnel_id: tunnel_id.into(),
            client_id: client_id.into(),
            client: client.clone(),
            process_factory,
            runtime: Arc::new(ConnectRuntime {
                client,
                executor,
                telemetry,
                settings: PipelineSettings::from_config(config),
            }),
            root: CancellationToken::new(),
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn executor(&self) -> &Arc<ChannelExecutor> {
        &self.runtime.executor
    }

    pub fn is_shut_down(&self) -> bool {
        self.root.is_cancelled()
    }

    /// Fetches the channel's checkpoint and wires a connect around a fresh
    /// processor. The connect starts in WAIT; nothing runs until it is
    /// notified OPEN.
    pub async fn dial(
        &self,
        channel: &Channel,
        sink: Weak<dyn ChannelStatusSink>,
    ) -> Result<Arc<ChannelConnect>> {
        if self.is_shut_down() {
            bail!("dialer for client {} is shut down", self.client_id);
        }

        let checkpoint = self
            .client
            .get_checkpoint(&self.tunnel_id, &self.client_id, &channel.channel_id)
            .await
            .with_context(|| format!("get_checkpoint for channel {}", channel.channel_id))?;

        let checkpointer = Arc::new(Checkpointer::new(
            self.client.clone(),
            self.tunnel_id.clone(),
            self.client_id.clone(),
            channel.channel_id.clone(),
            checkpoint.sequence_number + 1,
        ));

        let context = ChannelContext {
            tunnel_id: self.tunnel_id.clone(),
            client_id: self.client_id.clone(),
            channel_id: channel.channel_id.clone(),
            channel_type: channel.channel_type,
        };
        let processor = self
            .process_factory
            .create_processor(context, checkpointer.clone())
            .with_context(|| format!("create processor for channel {}", channel.channel_id))?;

        let finished = checkpoint.is_finished();
        tracing::info!(
            tunnel_id = %self.tunnel_id,
            client_id = %self.client_id,
            channel_id = %channel.channel_id,
            version = channel.version,
            sequence_number = checkpoint.sequence_number,
            finished,
            "dialed channel"
        );

        Ok(ChannelConnect::new(ConnectParts {
            tunnel_id: self.tunnel_id.clone(),
            client_id: self.client_id.clone(),
            channel_id: channel.channel_id.clone(),
            is_stream: channel.is_stream(),
            finished,
            start_token: checkpoint.token,
            checkpointer,
            processor,
            cancel: self.root.child_token(),
            runtime: self.runtime.clone(),
            sink,
        }))
    }

    /// Cancels every pipeline of this dialer and closes the executor.
    pub fn shutdown(&self) {
        if self.root.is_cancelled() {
            return;
        }
        tracing::info!(client_id = %self.client_id, "shutting down channel dialer");
        self.root.cancel();
        self.runtime.executor.close();
    }
}
