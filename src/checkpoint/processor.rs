use crate::checkpoint::checkpointer::Checkpointer;
use crate::model::{ProcessRecordsInput, FINISH_TAG};
use crate::runtime::processor::{
    ChannelContext, ChannelProcessor, ChannelProcessorFactory, ProcessorError, ProcessorStage,
};
use crate::runtime::telemetry::Telemetry;
use anyhow::anyhow;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Wraps a user [`ChannelProcessor`] and checkpoints its progress.
///
/// The finished sentinel is written as soon as a batch closes the channel;
/// intermediate tokens are written at most once per `checkpoint_interval`.
pub struct DefaultChannelProcessor {
    context: ChannelContext,
    inner: Box<dyn ChannelProcessor>,
    checkpointer: Arc<Checkpointer>,
    checkpoint_interval: Duration,
    last_checkpoint: Instant,
    telemetry: Arc<Telemetry>,
    shut_down: bool,
}

impl DefaultChannelProcessor {
    pub fn new(
        context: ChannelContext,
        inner: Box<dyn ChannelProcessor>,
        checkpointer: Arc<Checkpointer>,
        checkpoint_interval: Duration,
        telemetry: Arc<Telemetry>,
    ) -> Self {
        Self {
            context,
            inner,
            checkpointer,
            checkpoint_interval,
            last_checkpoint: Instant::now(),
            telemetry,
            shut_down: false,
        }
    }

    pub fn context(&self) -> &ChannelContext {
        &self.context
    }

    pub async fn process(&mut self, input: ProcessRecordsInput) -> Result<(), ProcessorError> {
        if self.shut_down {
            return Err(ProcessorError::new(
                ProcessorStage::Process,
                anyhow!("processor for channel {} is shut down", self.context.channel_id),
            ));
        }

        let records = input.records.len();
        let finished = input.is_finished();
        let next_token = input.next_token.clone();

        self.inner
            .process(input)
            .await
            .map_err(|err| ProcessorError::new(ProcessorStage::Process, err))?;
        self.telemetry.record_processed(records);

        if finished {
            self.checkpoint(FINISH_TAG).await;
        } else if self.last_checkpoint.elapsed() >= self.checkpoint_interval {
            if let Some(token) = next_token {
                self.checkpoint(&token).await;
            }
        }

        Ok(())
    }

    /// Releases the user processor. Only the first call reaches it.
    pub async fn shutdown(&mut self) -> Result<(), ProcessorError> {
        if self.shut_down {
            return Ok(());
        }
        self.shut_down = true;

        self.inner
            .shutdown()
            .await
            .map_err(|err| ProcessorError::new(ProcessorStage::Shutdown, err))
    }

    async fn checkpoint(&mut self, token: &str) {
        let result = self.checkpointer.checkpoint(token).await;
        self.last_checkpoint = Instant::now();
        self.telemetry.record_checkpoint(result.is_ok());

        if let Err(err) = result {
            let err = ProcessorError::new(ProcessorStage::Checkpoint, err.into());
            tracing::warn!(
                channel_id = %self.context.channel_id,
                token,
                error = %err,
                "checkpoint dropped; progress will be recorded by a later batch"
            );
        }
    }
}

/// Builds a [`DefaultChannelProcessor`] around a fresh user processor for
/// every dialed channel.
#[derive(Clone)]
pub struct ChannelProcessFactory {
    factory: Arc<dyn ChannelProcessorFactory>,
    checkpoint_interval: Duration,
    telemetry: Arc<Telemetry>,
}

impl ChannelProcessFactory {
    pub fn new(
        factory: Arc<dyn ChannelProcessorFactory>,
        checkpoint_interval: Duration,
        telemetry: Arc<Telemetry>,
    ) -> Self {
        Self {
            factory,
            checkpoint_interval,
            telemetry,
        }
    }

    pub fn create_processor(
        &self,
        context: ChannelContext,
        checkpointer: Arc<Checkpointer>,
    ) -> Result<DefaultChannelProcessor, ProcessorError> {
        let inner = self
            .factory
            .create(&context)
            .map_err(|err| ProcessorError::new(ProcessorStage::Create, err))?;

        Ok(DefaultChannelProcessor::new(
            context,
            inner,
            checkpointer,
            self.checkpoint_interval,
            self.telemetry.clone(),
        ))
    }
}
