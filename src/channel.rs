//! Per-channel consumption: the [`ChannelConnect`] state machine, the
//! dialer that builds it, the read/process pipeline it drives, and the
//! shared executor bounding their parallelism.

pub mod connect;
pub mod dialer;
pub mod executor;
pub(crate) mod pipeline;

pub use connect::{
    ChannelConnect, ChannelConnectStatus, ChannelConnection, ChannelStatusSink,
    FailedChannelConnect,
};
pub use dialer::ChannelDialer;
pub use executor::ChannelExecutor;
