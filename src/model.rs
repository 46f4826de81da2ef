//! Wire-neutral data model shared by the collaborator client, the channel
//! state machines, and user processors.

pub mod channel;
pub mod checkpoint;
pub mod record;

pub use channel::{Channel, ChannelStatus, ChannelType};
pub use checkpoint::{Checkpoint, FINISH_TAG};
pub use record::{ProcessRecordsInput, RecordAction, StreamRecord};
