use std::collections::HashMap;

use serde_derive::{Deserialize, Serialize};

/// Outbound message on the broadcast bus and to websocket clients.
///
/// Standard types: `nickname`, `stream announce`, `stream close`,
/// `stream sub`, `stream unsub`, `stream status`, `source announce`,
/// `show frame`, `show close`, `system status`, `run list`, `run meta`,
/// `player failure`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Msg {
    #[serde(rename = "Type")]
    pub kind: String,
    #[serde(rename = "Metadata", default)]
    pub metadata: HashMap<String, String>,
    #[serde(rename = "Payload", default, skip_serializing_if = "Vec::is_empty")]
    pub payload: Vec<u8>,
}

impl Msg {
    pub fn new(kind: &str) -> Self {
        Msg {
            kind: kind.to_string(),
            ..Msg::default()
        }
    }

    pub fn with(mut self, key: &str, value: impl Into<String>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }
}

/// Inbound command, from clients or republished onto stream command topics.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Cmd {
    #[serde(rename = "Command")]
    pub command: String,
    #[serde(rename = "Metadata", default)]
    pub metadata: HashMap<String, String>,
}

impl Cmd {
    pub fn new(command: &str) -> Self {
        Cmd {
            command: command.to_string(),
            ..Cmd::default()
        }
    }

    pub fn with(mut self, key: &str, value: impl Into<String>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    pub fn meta(&self, key: &str) -> &str {
        self.metadata.get(key).map(String::as_str).unwrap_or("")
    }
}
