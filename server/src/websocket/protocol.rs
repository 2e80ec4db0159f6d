//! WebSocket message protocol definitions.
//!
//! Messages are JSON objects tagged by a snake_case `type`.

use ferry_engine::{MigrationConflict, SessionId};
use serde::{Deserialize, Serialize};

use crate::monitor::SessionStatus;

/// Messages sent from client to server.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Latest status of every session.
    Sessions {
        #[serde(default)]
        request_id: Option<String>,
    },

    /// Unresolved conflicts, optionally of one session.
    Conflicts {
        #[serde(default)]
        session_id: Option<SessionId>,
        #[serde(default)]
        request_id: Option<String>,
    },

    /// Keep-alive ping.
    Ping,
}

/// Messages sent from server to client.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Sessions {
        sessions: Vec<SessionStatus>,
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },

    /// Pushed whenever a session publishes a report.
    SessionUpdate { status: SessionStatus },

    Conflicts {
        conflicts: Vec<MigrationConflict>,
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },

    /// Response to ping.
    Pong,

    Error {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },
}

impl ServerMessage {
    /// Create an error message.
    pub fn error(message: impl Into<String>, request_id: Option<String>) -> Self {
        ServerMessage::Error {
            message: message.into(),
            request_id,
        }
    }
}
