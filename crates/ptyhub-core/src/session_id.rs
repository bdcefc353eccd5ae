//! Client-prefixed session identifiers.
//!
//! A session id has the wire form `"<clientId>|<suffix>"`. Everything before
//! the first `|` names the owning client; the suffix is opaque.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Reserved separator between the client id and the session suffix.
pub const CLIENT_DELIMITER: char = '|';

/// Unique identifier for a terminal session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Build an id for `suffix` owned by `client_id`.
    pub fn new(client_id: &str, suffix: &str) -> Self {
        Self(format!("{}{}{}", client_id, CLIENT_DELIMITER, suffix))
    }

    /// The owning client: the substring before the first `|`.
    ///
    /// An id without a delimiter belongs to a client named after the whole id.
    pub fn client_id(&self) -> &str {
        self.0
            .split_once(CLIENT_DELIMITER)
            .map_or(self.0.as_str(), |(client, _)| client)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for SessionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Whether `client_id` can be used as a session-id prefix.
pub fn is_valid_client_id(client_id: &str) -> bool {
    !client_id.is_empty() && !client_id.contains(CLIENT_DELIMITER)
}
