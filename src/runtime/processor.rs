//! Extension point implemented by applications consuming tunnel records.

use crate::model::{ChannelType, ProcessRecordsInput};
use anyhow::{Error as AnyError, Result};
use core::future::Future;
use core::pin::Pin;

pub type ProcessorFuture<'a> = Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

/// Identifies the channel a processor instance is bound to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelContext {
    pub tunnel_id: String,
    pub client_id: String,
    pub channel_id: String,
    pub channel_type: ChannelType,
}

/// Consumes the record batches of a single channel.
///
/// One instance is created per dialed channel and is never shared; calls to
/// `process` on the same instance are strictly sequential.
pub trait ChannelProcessor: Send + 'static {
    /// Handles one batch. An error stops the channel without checkpointing
    /// the batch, so the records are redelivered to the next owner.
    fn process<'a>(&'a mut self, input: ProcessRecordsInput) -> ProcessorFuture<'a>;

    /// Called once when the channel connect closes.
    fn shutdown<'a>(&'a mut self) -> ProcessorFuture<'a> {
        Box::pin(async { Ok(()) })
    }
}

/// Builds a fresh [`ChannelProcessor`] for every channel the worker dials.
pub trait ChannelProcessorFactory: Send + Sync + 'static {
    fn create(&self, context: &ChannelContext) -> Result<Box<dyn ChannelProcessor>>;
}

impl<F, P> ChannelProcessorFactory for F
where
    F: Fn(&ChannelContext) -> P + Send + Sync + 'static,
    P: ChannelProcessor,
{
    fn create(&self, context: &ChannelContext) -> Result<Box<dyn ChannelProcessor>> {
        Ok(Box::new(self(context)))
    }
}

/// Stages of the processor lifecycle an error can originate from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessorStage {
    Create,
    Process,
    Checkpoint,
    Shutdown,
}

/// Error surfaced by a channel processor, tagged with the failing stage.
#[derive(Debug)]
pub struct ProcessorError {
    stage: ProcessorStage,
    source: AnyError,
}

impl ProcessorError {
    pub fn new(stage: ProcessorStage, source: AnyError) -> Self {
        Self { stage, source }
    }

    pub fn stage(&self) -> ProcessorStage {
        self.stage
    }

    pub fn into_source(self) -> AnyError {
        self.source
    }
}

impl core::fmt::Display for ProcessorError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{:?} processor error: {}", self.stage, self.source)
    }
}

impl std::error::Error for ProcessorError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.source.as_ref())
    }
}
