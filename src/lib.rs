pub mod channel;
pub mod checkpoint;
pub mod model;
pub mod rpc;
pub mod runtime;
pub mod worker;

pub use channel::{
    ChannelConnect, ChannelConnectStatus, ChannelConnection, ChannelDialer, ChannelExecutor,
    ChannelStatusSink, FailedChannelConnect,
};
pub use checkpoint::{ChannelProcessFactory, Checkpointer, DefaultChannelProcessor};
pub use model::{
    Channel, ChannelStatus, ChannelType, Checkpoint, ProcessRecordsInput, RecordAction,
    StreamRecord, FINISH_TAG,
};
pub use rpc::circuit_breaker::{CircuitBreakerSnapshot, CircuitState, RpcCircuitBreaker};
pub use rpc::{
    CheckpointRequest, ClientConfig, JsonRpcClientOptions, JsonRpcTunnelClient,
    ReadRecordsRequest, ReadRecordsResponse, TunnelClient, TunnelError, TunnelFuture,
};
pub use runtime::config::{
    TunnelWorkerConfig, TunnelWorkerConfigBuilder, TunnelWorkerConfigParams,
};
pub use runtime::fatal::FatalErrorHandler;
pub use runtime::processor::{
    ChannelContext, ChannelProcessor, ChannelProcessorFactory, ProcessorError, ProcessorFuture,
    ProcessorStage,
};
pub use runtime::telemetry::{init_tracing, Telemetry, TelemetrySnapshot};
pub use worker::{TunnelStateMachine, TunnelWorker, TunnelWorkerStatus};
