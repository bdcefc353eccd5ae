//! API error types with actionable suggestions.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Error codes for protocol responses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    SessionNotFound,
    SpawnFailed,
    KillFailed,
    InvalidInput,
    InternalError,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCode::SessionNotFound => write!(f, "SESSION_NOT_FOUND"),
            ErrorCode::SpawnFailed => write!(f, "SPAWN_FAILED"),
            ErrorCode::KillFailed => write!(f, "KILL_FAILED"),
            ErrorCode::InvalidInput => write!(f, "INVALID_INPUT"),
            ErrorCode::InternalError => write!(f, "INTERNAL_ERROR"),
        }
    }
}

/// An error response returned over the RPC boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiError {
    pub code: ErrorCode,
    pub message: String,
    pub suggestion: Option<String>,
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)?;
        if let Some(suggestion) = &self.suggestion {
            write!(f, " (hint: {})", suggestion)?;
        }
        Ok(())
    }
}

impl std::error::Error for ApiError {}

impl ApiError {
    pub fn session_not_found(session_id: &str) -> Self {
        Self {
            code: ErrorCode::SessionNotFound,
            message: format!("Session '{}' not found", session_id),
            suggestion: Some("Run 'ptyhub list-sessions' to see live sessions".into()),
        }
    }

    /// Create a spawn failed error naming the shell that could not start.
    pub fn spawn_failed(shell: &str, error: &str) -> Self {
        let shell = if shell.is_empty() {
            "(default shell)"
        } else {
            shell
        };
        Self {
            code: ErrorCode::SpawnFailed,
            message: format!("Failed to spawn '{}': {}", shell, error),
            suggestion: Some(format!(
                "Verify '{}' exists and is executable, or omit the shell to use the default",
                shell
            )),
        }
    }

    pub fn kill_failed(session_id: &str, error: &str) -> Self {
        Self {
            code: ErrorCode::KillFailed,
            message: format!("Failed to kill session '{}': {}", session_id, error),
            suggestion: Some(
                "The process may belong to another user or be stuck in uninterruptible I/O".into(),
            ),
        }
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self {
            code: ErrorCode::InvalidInput,
            message: message.into(),
            suggestion: Some("Check the request fields and try again".into()),
        }
    }

    /// Create an invalid input error with a custom suggestion.
    pub fn invalid_input_with_suggestion(
        message: impl Into<String>,
        suggestion: impl Into<String>,
    ) -> Self {
        Self {
            code: ErrorCode::InvalidInput,
            message: message.into(),
            suggestion: Some(suggestion.into()),
        }
    }

    pub fn invalid_client_id(client_id: &str) -> Self {
        Self {
            code: ErrorCode::InvalidInput,
            message: format!("Invalid client id '{}'", client_id),
            suggestion: Some("Client ids must be non-empty and must not contain '|'".into()),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            code: ErrorCode::InternalError,
            message: message.into(),
            suggestion: Some("This is an internal error. Please report it if it persists.".into()),
        }
    }

    /// The daemon's terminal service has stopped accepting requests.
    pub fn service_stopped() -> Self {
        Self {
            code: ErrorCode::InternalError,
            message: "Terminal service is shutting down".to_string(),
            suggestion: Some("Restart the daemon with 'ptyhub daemon' and retry".into()),
        }
    }
}
