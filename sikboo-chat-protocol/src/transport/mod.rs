//! Live Transport Layer
//!
//! This module provides the persistent connection the STOMP session runs on.
//!
//! The connection adapter only talks to the [`Transport`] trait, so the
//! WebSocket implementation used in production and the in-memory loopback
//! used in tests are interchangeable.

mod r#trait;
pub mod memory;
pub mod websocket;

pub use memory::{
    memory_transport, MemoryBroker, MemoryPeer, MemoryTransport, MemoryTransportFactory,
};
pub use r#trait::{Transport, TransportFactory};
pub use websocket::{WebSocketTransport, WebSocketTransportFactory};
