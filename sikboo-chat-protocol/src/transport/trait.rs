//! Transport Trait Abstraction
//!
//! Defines a common interface for persistent connections that carry STOMP frames.

use crate::connection::ConnectionConfig;
use crate::stomp::Frame;
use crate::Result;
use async_trait::async_trait;
use std::fmt::Debug;

/// Common transport interface for the live feed
#[async_trait]
pub trait Transport: Send + Sync + Debug {
    /// Get remote address (URL or test label)
    fn remote_address(&self) -> String;

    /// Send a frame
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying connection rejects the write.
    async fn send_frame(&mut self, frame: &Frame) -> Result<()>;

    /// Send a heart-beat (a bare end-of-line)
    async fn send_heartbeat(&mut self) -> Result<()>;

    /// Receive the next frame
    ///
    /// Heart-beats are consumed silently. Must be cancel safe: dropping the
    /// future before it completes must not lose a frame.
    ///
    /// # Errors
    ///
    /// Returns `ProtocolError::ConnectionClosed` when the peer closes the
    /// connection, or another error if reception fails or the frame is malformed.
    async fn receive_frame(&mut self) -> Result<Frame>;

    /// Close the connection gracefully
    async fn close(self: Box<Self>) -> Result<()>;

    /// Check if the transport is still connected
    fn is_connected(&self) -> bool {
        true // Default implementation - override if transport has connection state
    }
}

/// Factory trait for opening transport connections
#[async_trait]
pub trait TransportFactory: Send + Sync + Debug {
    /// Open a connection to the endpoint described by `config`
    async fn connect(&self, config: &ConnectionConfig) -> Result<Box<dyn Transport>>;
}
