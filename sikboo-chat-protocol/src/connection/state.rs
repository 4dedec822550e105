//! Connection State
//!
//! Lifecycle of the live connection as observed by views.

use std::fmt;

/// Connection lifecycle
///
/// `Disconnected → Connecting → Connected`, with `Connected → Disconnected`
/// on `disconnect()` or a clean close by the server. Handshake failures,
/// broker `ERROR` frames and transport errors land in `Error`, which behaves
/// like `Disconnected`: nothing is written and `connect()` may be called again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Error,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    /// Whether a session is being established or is up
    pub fn is_active(&self) -> bool {
        matches!(self, ConnectionState::Connecting | ConnectionState::Connected)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Error => "error",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
