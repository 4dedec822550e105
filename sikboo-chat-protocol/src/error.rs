//! Error handling for the chat synchronization core
//!
//! This module provides a single error type for every operation in the crate.
//! Errors are automatically converted from underlying library errors using `thiserror`.
//!
//! ## Error Handling Patterns
//!
//! ### Error Propagation
//!
//! Use `?` operator for automatic error propagation:
//!
//! ```rust
//! use sikboo_chat_protocol::{MessagePage, Result};
//!
//! fn parse_page(data: &str) -> Result<MessagePage> {
//!     // JSON errors auto-converted
//!     let page: MessagePage = serde_json::from_str(data)?;
//!     Ok(page)
//! }
//! ```
//!
//! ### Error Matching
//!
//! ```rust
//! use sikboo_chat_protocol::ProtocolError;
//!
//! fn describe(error: &ProtocolError) -> String {
//!     match error {
//!         ProtocolError::NotConnected => "offline".to_string(),
//!         ProtocolError::HttpStatus { status, .. } => format!("server said {}", status),
//!         other => other.user_message(),
//!     }
//! }
//! ```
//!
//! ## Error Categories
//!
//! - Connection errors: handshake failure, abrupt close, broker `ERROR` frames.
//!   Surfaced through the connection state as well as returned values.
//! - Fetch errors: HTTP failures on history, count or the fallback send.
//!   Local to the failed call, existing cache state is untouched.
//! - Invalid input: rejected before any network call.

use crate::message::ConversationId;
use thiserror::Error;

/// Result type for chat core operations
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Errors that can occur in the chat synchronization core
///
/// # Examples
///
/// ```rust
/// use sikboo_chat_protocol::ProtocolError;
///
/// let error = ProtocolError::NotConnected;
/// assert_eq!(error.to_string(), "Not connected");
///
/// let error = ProtocolError::InvalidFrame("missing command".to_string());
/// assert_eq!(error.to_string(), "Invalid frame: missing command");
/// ```
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP client error (connect, timeout, body decoding)
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// WebSocket error from the live transport
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Server answered with a non-success status
    #[error("HTTP status {status}: {body}")]
    HttpStatus {
        /// Status code
        status: u16,
        /// Response body (may be empty)
        body: String,
    },

    /// Operation requires a Connected transport
    #[error("Not connected")]
    NotConnected,

    /// The peer closed the connection
    #[error("Connection closed: {0}")]
    ConnectionClosed(String),

    /// Operation timed out
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Transport layer error
    #[error("Transport error: {0}")]
    Transport(String),

    /// Malformed STOMP frame
    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    /// The broker sent an ERROR frame
    #[error("Broker error: {0}")]
    BrokerError(String),

    /// Caller supplied input that was rejected before any network call
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Invalid state for the requested operation
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The conversation view was torn down while the operation was in flight
    #[error("Conversation {0} is closed")]
    ConversationClosed(ConversationId),
}

impl ProtocolError {
    /// Create error from I/O error with context
    ///
    /// Classifies network-flavoured I/O failures so that callers can decide
    /// on a retry without matching on `std::io::ErrorKind` themselves.
    pub fn from_io_error(error: std::io::Error, context: &str) -> Self {
        use std::io::ErrorKind;

        match error.kind() {
            ErrorKind::TimedOut => ProtocolError::Timeout(format!("{}: {}", context, error)),
            ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
            | ErrorKind::UnexpectedEof => ProtocolError::ConnectionClosed(format!(
                "{}: connection interrupted ({})",
                context, error
            )),
            ErrorKind::ConnectionRefused => {
                ProtocolError::Transport(format!("{}: connection refused ({})", context, error))
            }
            _ => ProtocolError::Io(error),
        }
    }

    /// Check if a user-initiated retry is likely to succeed
    pub fn is_recoverable(&self) -> bool {
        match self {
            ProtocolError::Timeout(_)
            | ProtocolError::ConnectionClosed(_)
            | ProtocolError::Transport(_)
            | ProtocolError::NotConnected
            | ProtocolError::WebSocket(_)
            | ProtocolError::Io(_) => true,
            ProtocolError::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            ProtocolError::HttpStatus { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }

    /// Check if the error needs the user to change something before retrying
    pub fn requires_user_action(&self) -> bool {
        match self {
            ProtocolError::Configuration(_) | ProtocolError::InvalidInput(_) => true,
            ProtocolError::HttpStatus { status, .. } => {
                (400..500).contains(status) && *status != 429
            }
            _ => false,
        }
    }

    /// Get user-friendly error message
    pub fn user_message(&self) -> String {
        match self {
            ProtocolError::NotConnected => {
                "Not connected to the chat server. Reconnect and try again.".to_string()
            }
            ProtocolError::ConnectionClosed(_) => {
                "Connection to the chat server was lost.".to_string()
            }
            ProtocolError::Timeout(msg) => {
                format!("Request timed out: {}. Check your network connection.", msg)
            }
            ProtocolError::HttpStatus { status: 401, .. } => {
                "Your session has expired. Please log in again.".to_string()
            }
            ProtocolError::HttpStatus { status: 404, .. } => {
                "This group purchase no longer exists.".to_string()
            }
            ProtocolError::HttpStatus { status, .. } => {
                format!("The server returned an error ({}). Try again later.", status)
            }
            ProtocolError::Http(e) => format!("Network error: {}.", e),
            ProtocolError::WebSocket(e) => format!("Live connection error: {}.", e),
            ProtocolError::BrokerError(msg) => {
                format!("Chat server rejected the request: {}.", msg)
            }
            ProtocolError::InvalidInput(msg) => format!("{}.", msg),
            ProtocolError::InvalidFrame(msg) => format!("Invalid data received: {}.", msg),
            ProtocolError::Transport(msg) => format!("Transport error: {}.", msg),
            ProtocolError::Configuration(msg) => {
                format!("Configuration error: {}. Check your settings.", msg)
            }
            ProtocolError::ConversationClosed(id) => {
                format!("Chat room {} was closed.", id)
            }
            ProtocolError::InvalidState(msg) => format!("Invalid state: {}.", msg),
            ProtocolError::Io(e) => format!("I/O error: {}.", e),
            ProtocolError::Json(e) => format!("Data format error: {}.", e),
        }
    }

    pub fn invalid_state(msg: impl Into<String>) -> Self {
        ProtocolError::InvalidState(msg.into())
    }

    pub fn invalid_input(msg: impl Into<String>) -> Self {
        ProtocolError::InvalidInput(msg.into())
    }
}
