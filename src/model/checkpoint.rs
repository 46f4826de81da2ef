use serde::{Deserialize, Serialize};

/// Reserved token marking a snapshot channel as fully consumed.
pub const FINISH_TAG: &str = "finished";

/// Durable progress marker held by the service for one channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub token: String,
    pub sequence_number: i64,
}

impl Checkpoint {
    pub fn new(token: impl Into<String>, sequence_number: i64) -> Self {
        Self {
            token: token.into(),
            sequence_number,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.token == FINISH_TAG
    }
}

/// `None` is treated the same as the finished sentinel.
pub(crate) fn is_finish_token(token: Option<&str>) -> bool {
    match token {
        None => true,
        Some(token) => token == FINISH_TAG,
    }
}
