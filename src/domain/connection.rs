use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle of the transport connection.
///
/// Owned by the connection manager; every other component only observes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    /// Explicitly disconnected. Automatic triggers are ignored until a new
    /// connect cycle is requested.
    Cancelled,
}

impl ConnectionState {
    pub fn is_connected(self) -> bool {
        self == ConnectionState::Connected
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}
