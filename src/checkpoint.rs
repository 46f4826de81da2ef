//! Progress recording: the conflict-aware [`Checkpointer`] and the
//! [`DefaultChannelProcessor`] decorator that drives it from the user's
//! processing callback.

pub mod checkpointer;
pub mod processor;

pub use checkpointer::Checkpointer;
pub use processor::{ChannelProcessFactory, DefaultChannelProcessor};
