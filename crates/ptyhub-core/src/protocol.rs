//! Protocol types for client-daemon communication.
//!
//! Every line on the socket is one JSON document. Clients send [`Request`]s;
//! the daemon answers with [`ServerMessage::Response`] and pushes terminal
//! output as [`ServerMessage::Event`] on connections registered via
//! `set_client`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::ApiError;

/// A request from a client to the daemon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    pub id: String,
    pub command: Command,
}

/// Launch configuration captured when a session is created.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TerminalOptions {
    /// Shell binary; the platform default shell when absent.
    pub shell: Option<String>,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub cwd: Option<String>,
}

/// Operations the daemon can execute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Command {
    /// Spawn a PTY for `session_id` (`"<clientId>|<suffix>"`).
    Create {
        session_id: String,
        rows: u16,
        cols: u16,
        #[serde(default)]
        options: TerminalOptions,
    },
    /// Write input to a session.
    OnMessage {
        session_id: String,
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
    },
    /// Resize a session.
    Resize {
        session_id: String,
        rows: u16,
        cols: u16,
    },
    GetShellName {
        session_id: String,
    },
    GetProcessId {
        session_id: String,
    },
    /// Kill one session.
    DisposeById {
        session_id: String,
    },
    /// Make this connection the callback sink for `client_id`.
    SetClient {
        client_id: String,
    },
    /// Cancel a pending disposal and report whether the client has sessions.
    EnsureClientTerminal {
        client_id: String,
        #[serde(default)]
        session_ids: Vec<String>,
    },
    /// Arm the grace-period disposal timer for a client.
    CloseClient {
        client_id: String,
    },
    /// Immediately tear down every session of a client.
    DisposeClient {
        client_id: String,
    },
    ListSessions,
    /// Release every registered client callback sink.
    Dispose,
    /// Kill all sessions and stop the daemon.
    Shutdown,
}

/// A response from the daemon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    pub id: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<ResponseData>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ApiError>,
}

impl Response {
    pub fn success(id: impl Into<String>, data: ResponseData) -> Self {
        Self {
            id: id.into(),
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(id: impl Into<String>, error: ApiError) -> Self {
        Self {
            id: id.into(),
            success: false,
            data: None,
            error: Some(error),
        }
    }

    pub fn ok(id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::success(
            id,
            ResponseData::Ok {
                message: message.into(),
            },
        )
    }
}

/// Response payload variants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResponseData {
    SessionCreated {
        session_id: String,
        pid: Option<u32>,
        shell: String,
    },
    /// Empty when the session does not exist.
    ShellName { name: String },
    /// `-1` when the session does not exist.
    ProcessId { pid: i64 },
    ClientTerminal { alive: bool },
    Sessions { sessions: Vec<SessionInfo> },
    Disposed { count: usize },
    Ok { message: String },
}

/// Information about a live session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub id: String,
    pub client_id: String,
    pub pid: Option<u32>,
    pub shell: String,
    pub rows: u16,
    pub cols: u16,
    pub created_at: String,
}

/// Events pushed from the daemon to a registered client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEvent {
    /// Output produced by a session's process.
    ClientMessage {
        session_id: String,
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
    },
    /// A session's process exited.
    CloseClient { session_id: String },
    /// The daemon released this client's callback sink.
    Dispose,
}

/// Any line the daemon writes to a connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ServerMessage {
    Response { response: Response },
    Event { event: ClientEvent },
}

/// Byte payloads travel as base64 so raw PTY output survives JSON.
mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
