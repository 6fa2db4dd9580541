use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Commands that flow through the Raft replicated log.
///
/// Applying the same sequence of commands to the same starting mapping
/// always yields the same mapping, on every node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum Command {
    Set { key: String, value: String },
    Delete { key: String },
}

impl Command {
    pub fn encode(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|err| Error::MalformedCommand(err.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|err| Error::MalformedCommand(err.to_string()))
    }

    pub fn key(&self) -> &str {
        match self {
            Command::Set { key, .. } | Command::Delete { key } => key,
        }
    }
}
