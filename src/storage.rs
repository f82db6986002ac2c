use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

fn unknown_user() -> String {
    "unknown".to_string()
}

/// A command submitted from chat, stored as `commands/cmd_<id>.json`.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct CommandRequest {
    pub command: String, // Raw command text
    #[serde(default)]
    pub user_id: String,
    #[serde(default = "unknown_user")]
    pub user_name: String,
    #[serde(default)]
    pub timestamp: String, // Mailbox id at creation
    #[serde(default)]
    pub channel_id: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum PendingStatus {
    #[default]
    Waiting,
    Resolved,
}

/// A dangerous command waiting for a human decision, stored as `pending/pending_<id>.json`.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct PendingApproval {
    pub command: String,
    pub message: String, // Prompt shown to approvers
    #[serde(default)]
    pub timestamp: String,
    #[serde(default)]
    pub status: PendingStatus,
    pub original_file: String, // File name of the originating request
    #[serde(default = "unknown_user")]
    pub user_name: String,
    #[serde(default)]
    pub correlation_id: Option<String>, // Id of the originating request
    #[serde(default)]
    pub command_hash: Option<String>, // SHA256 of the normalized command
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A human decision on a pending approval, stored as `responses/approval_<pending file>`.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ApprovalSignal {
    #[serde(default)]
    pub approval: bool,
    #[serde(default)]
    pub user_id: String,
    #[serde(default = "unknown_user")]
    pub user_name: String,
    #[serde(default)]
    pub timestamp: String,
    #[serde(default)]
    pub correlation_id: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ResponseStatus {
    Success,
    Error,
    Cancelled,
}

impl ResponseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResponseStatus::Success => "success",
            ResponseStatus::Error => "error",
            ResponseStatus::Cancelled => "cancelled",
        }
    }
}

/// A message for the chat adapter, stored as `responses/res_<id>.json`.
///
/// Fields the executor does not know about (`command`, `returncode`, `error`, ...)
/// travel in `extra` and are written back out unchanged.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct CommandResponse {
    pub message: String,
    pub status: ResponseStatus,
    #[serde(default)]
    pub timestamp: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl CommandResponse {
    pub fn new(message: String, status: ResponseStatus) -> Self {
        Self {
            message,
            status,
            timestamp: String::new(),
            extra: Map::new(),
        }
    }

    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.extra.insert(key.to_string(), value.into());
        self
    }
}
