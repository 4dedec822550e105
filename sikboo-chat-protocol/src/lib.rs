//! Sikboo Chat Synchronization Core
//!
//! This library keeps the chat of a group purchase consistent: it merges
//! paginated message history fetched over HTTP with messages pushed over a
//! STOMP-over-WebSocket connection into one ordered, duplicate free view.

pub mod cache;
pub mod connection;
pub mod history;
pub mod message;
pub mod room;
pub mod stomp;
pub mod transport;

mod error;

pub use cache::{
    ApplyOutcome, CacheConfig, CacheUpdate, Lease, MergedView, MessageCache, Pagination,
};
pub use connection::{ConnectionConfig, ConnectionState, StompClient, Subscription};
pub use error::{ProtocolError, Result};
pub use history::{HistoryConfig, HistoryLoader, HistorySource, HttpHistoryClient, LoadOutcome};
pub use message::{
    ChatMessage, ConversationId, Cursor, MessageCount, MessageKey, MessagePage, SendRequest,
    SEND_DESTINATION, TOPIC_PREFIX,
};
pub use room::{ChatRoom, RoomConfig};
pub use stomp::{Command, Frame};
pub use transport::{Transport, TransportFactory, WebSocketTransportFactory};

/// STOMP protocol version we speak
pub const STOMP_VERSION: &str = "1.2";
