use serde::{Deserialize, Serialize};
use std::fmt;

/// Server-side lifecycle of a channel (partition) assignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChannelStatus {
    Wait,
    Open,
    Closing,
    Close,
    Terminated,
}

impl ChannelStatus {
    /// `Close` and `Terminated` mean the channel is no longer consumed by this client.
    pub fn is_terminal(self) -> bool {
        matches!(self, ChannelStatus::Close | ChannelStatus::Terminated)
    }
}

impl fmt::Display for ChannelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ChannelStatus::Wait => "WAIT",
            ChannelStatus::Open => "OPEN",
            ChannelStatus::Closing => "CLOSING",
            ChannelStatus::Close => "CLOSE",
            ChannelStatus::Terminated => "TERMINATED",
        };
        f.write_str(label)
    }
}

/// Snapshot channels reach end-of-data; stream channels never do.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChannelType {
    BaseData,
    #[default]
    Stream,
}

/// Remote-authoritative partition descriptor exchanged on every heartbeat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Channel {
    pub channel_id: String,
    pub version: i64,
    pub status: ChannelStatus,
    #[serde(default)]
    pub channel_type: ChannelType,
}

impl Channel {
    pub fn new(channel_id: impl Into<String>, version: i64, status: ChannelStatus) -> Self {
        Self {
            channel_id: channel_id.into(),
            version,
            status,
            channel_type: ChannelType::default(),
        }
    }

    pub fn with_type(mut self, channel_type: ChannelType) -> Self {
        self.channel_type = channel_type;
        self
    }

    pub fn is_stream(&self) -> bool {
        self.channel_type == ChannelType::Stream
    }

    /// Returns the copy with the highest version; `self` wins ties.
    pub fn merge(self, other: Channel) -> Channel {
        if other.version > self.version {
            other
        } else {
            self
        }
    }
}
