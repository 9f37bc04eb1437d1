//! Messages exchanged between the supervisor and the managed process.
//!
//! Newline-delimited JSON: the supervisor writes `CommandRequest`s to the
//! child's stdin and reads `CommandReply`s from its stdout. End of the child's
//! stdout means the process went away.

use serde::{Deserialize, Serialize};

/// Commands the supervisor can send
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Command {
    /// Liveness probe
    Ping,
    /// Ask whether a restart into a new version is acceptable right now
    CanUpdate,
    /// Ask the process to shut down
    Exit,
}

impl Command {
    pub fn as_str(&self) -> &'static str {
        match self {
            Command::Ping => "ping",
            Command::CanUpdate => "can_update",
            Command::Exit => "exit",
        }
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandRequest {
    pub id: String,
    pub command: Command,
}

impl CommandRequest {
    pub fn new(command: Command) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            command,
        }
    }

    /// Encode as one line, without the trailing newline
    pub fn to_line(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Reply to a command: either a result or the error the handler raised
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandReply {
    pub id: String,
    pub command: Command,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CommandReply {
    pub fn success(request: &CommandRequest, result: serde_json::Value) -> Self {
        Self {
            id: request.id.clone(),
            command: request.command,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(request: &CommandRequest, message: impl Into<String>) -> Self {
        Self {
            id: request.id.clone(),
            command: request.command,
            result: None,
            error: Some(message.into()),
        }
    }

    pub fn parse_line(line: &str) -> serde_json::Result<Self> {
        serde_json::from_str(line.trim())
    }

    pub fn to_line(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// True only for an explicit boolean `true` result
    pub fn is_affirmative(&self) -> bool {
        self.error.is_none() && self.result.as_ref().and_then(|v| v.as_bool()) == Some(true)
    }
}
