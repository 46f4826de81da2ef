use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecordAction {
    Put,
    Update,
    Delete,
}

/// A single row-level change read from a channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamRecord {
    pub action: RecordAction,
    pub primary_key: Value,
    #[serde(default)]
    pub columns: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence: Option<u64>,
}

impl StreamRecord {
    pub fn new(action: RecordAction, primary_key: Value, columns: Value) -> Self {
        Self {
            action,
            primary_key,
            columns,
            timestamp: None,
            sequence: None,
        }
    }
}

/// Batch handed to a user processor.
///
/// `next_token` is the cursor the channel resumes from once this batch is
/// processed; `None` or [`crate::FINISH_TAG`] means the channel has no more data.
#[derive(Debug, Clone)]
pub struct ProcessRecordsInput {
    pub channel_id: String,
    pub records: Vec<StreamRecord>,
    pub next_token: Option<String>,
}

impl ProcessRecordsInput {
    pub fn is_finished(&self) -> bool {
        crate::model::checkpoint::is_finish_token(self.next_token.as_deref())
    }
}
