//! In-memory loopback transport
//!
//! Pairs a [`MemoryTransportFactory`] handed to the connection adapter with a
//! [`MemoryBroker`] that plays the server side. Every `connect` call yields a
//! fresh [`MemoryPeer`] on the broker, so reconnects can be driven frame by frame.
//!
//! ```
//! use sikboo_chat_protocol::transport::{memory_transport, TransportFactory};
//! use sikboo_chat_protocol::connection::ConnectionConfig;
//! use sikboo_chat_protocol::stomp::Frame;
//!
//! # tokio_test::block_on(async {
//! let (factory, mut broker) = memory_transport();
//! let mut transport = factory.connect(&ConnectionConfig::default()).await.unwrap();
//! let mut peer = broker.accept().await.unwrap();
//!
//! transport.send_frame(&Frame::disconnect()).await.unwrap();
//! let frame = peer.recv().await.unwrap();
//! assert!(frame.is_command(sikboo_chat_protocol::stomp::Command::Disconnect));
//! # });
//! ```

use super::r#trait::{Transport, TransportFactory};
use crate::connection::ConnectionConfig;
use crate::stomp::{Command, Frame};
use crate::{ProtocolError, Result};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

#[derive(Debug)]
struct Shared {
    peers: mpsc::UnboundedSender<MemoryPeer>,
    refuse: AtomicBool,
    connections: AtomicUsize,
}

/// Create a connected factory/broker pair
pub fn memory_transport() -> (MemoryTransportFactory, MemoryBroker) {
    let (peers_tx, peers_rx) = mpsc::unbounded_channel();
    let shared = Arc::new(Shared {
        peers: peers_tx,
        refuse: AtomicBool::new(false),
        connections: AtomicUsize::new(0),
    });

    (
        MemoryTransportFactory {
            shared: shared.clone(),
        },
        MemoryBroker {
            peers: peers_rx,
            shared,
        },
    )
}

/// Client side of the loopback
#[derive(Debug, Clone)]
pub struct MemoryTransportFactory {
    shared: Arc<Shared>,
}

#[async_trait]
impl TransportFactory for MemoryTransportFactory {
    async fn connect(&self, config: &ConnectionConfig) -> Result<Box<dyn Transport>> {
        if self.shared.refuse.load(Ordering::SeqCst) {
            return Err(ProtocolError::Transport(
                "connection refused by memory broker".to_string(),
            ));
        }

        let (client_tx, client_rx) = mpsc::unbounded_channel();
        let (server_tx, server_rx) = mpsc::unbounded_channel();
        let heartbeats = Arc::new(AtomicUsize::new(0));
        let number = self.shared.connections.fetch_add(1, Ordering::SeqCst);

        let peer = MemoryPeer {
            from_client: client_rx,
            to_client: Some(server_tx),
            heartbeats: heartbeats.clone(),
            next_message_id: AtomicU64::new(1),
        };
        self.shared
            .peers
            .send(peer)
            .map_err(|_| ProtocolError::Transport("memory broker is gone".to_string()))?;

        let label = format!("memory://{}#{}", config.base_url, number);
        debug!("Opened {}", label);

        Ok(Box::new(MemoryTransport {
            outbound: client_tx,
            inbound: server_rx,
            label,
            connected: true,
            heartbeats,
        }))
    }
}

/// Client end of one loopback connection
#[derive(Debug)]
pub struct MemoryTransport {
    outbound: mpsc::UnboundedSender<Frame>,
    inbound: mpsc::UnboundedReceiver<Frame>,
    label: String,
    connected: bool,
    heartbeats: Arc<AtomicUsize>,
}

#[async_trait]
impl Transport for MemoryTransport {
    fn remote_address(&self) -> String {
        self.label.clone()
    }

    async fn send_frame(&mut self, frame: &Frame) -> Result<()> {
        if self.outbound.send(frame.clone()).is_err() {
            self.connected = false;
            return Err(ProtocolError::ConnectionClosed(
                "memory peer dropped".to_string(),
            ));
        }
        Ok(())
    }

    async fn send_heartbeat(&mut self) -> Result<()> {
        if self.outbound.is_closed() {
            self.connected = false;
            return Err(ProtocolError::ConnectionClosed(
                "memory peer dropped".to_string(),
            ));
        }
        self.heartbeats.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn receive_frame(&mut self) -> Result<Frame> {
        match self.inbound.recv().await {
            Some(frame) => Ok(frame),
            None => {
                self.connected = false;
                Err(ProtocolError::ConnectionClosed(
                    "memory peer closed the connection".to_string(),
                ))
            }
        }
    }

    async fn close(self: Box<Self>) -> Result<()> {
        debug!("Closing {}", self.label);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected && !self.outbound.is_closed()
    }
}

/// Server side of the loopback
#[derive(Debug)]
pub struct MemoryBroker {
    peers: mpsc::UnboundedReceiver<MemoryPeer>,
    shared: Arc<Shared>,
}

impl MemoryBroker {
    /// Wait for the next client connection
    pub async fn accept(&mut self) -> Option<MemoryPeer> {
        self.peers.recv().await
    }

    /// Take a pending client connection without waiting
    pub fn try_accept(&mut self) -> Option<MemoryPeer> {
        self.peers.try_recv().ok()
    }

    /// Make subsequent `connect` calls fail
    pub fn refuse_connections(&self, refuse: bool) {
        self.shared.refuse.store(refuse, Ordering::SeqCst);
    }

    /// Number of connections opened so far
    pub fn connection_count(&self) -> usize {
        self.shared.connections.load(Ordering::SeqCst)
    }
}

/// Server end of one loopback connection
#[derive(Debug)]
pub struct MemoryPeer {
    from_client: mpsc::UnboundedReceiver<Frame>,
    to_client: Option<mpsc::UnboundedSender<Frame>>,
    heartbeats: Arc<AtomicUsize>,
    next_message_id: AtomicU64,
}

impl MemoryPeer {
    /// Next frame written by the client, `None` once the client side is gone
    pub async fn recv(&mut self) -> Option<Frame> {
        self.from_client.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Frame> {
        self.from_client.try_recv().ok()
    }

    /// Receive a frame and check its command
    pub async fn expect(&mut self, command: Command) -> Result<Frame> {
        let frame = self.recv().await.ok_or_else(|| {
            ProtocolError::ConnectionClosed(format!("client closed while expecting {}", command))
        })?;
        if !frame.is_command(command) {
            return Err(ProtocolError::InvalidFrame(format!(
                "expected {}, got {}",
                command, frame.command
            )));
        }
        Ok(frame)
    }

    /// Answer the client's CONNECT with CONNECTED and return the CONNECT frame
    pub async fn accept_handshake(&mut self) -> Result<Frame> {
        let connect = self.expect(Command::Connect).await?;
        let connected = Frame::new(Command::Connected)
            .with_header("version", "1.2")
            .with_header("heart-beat", "0,0");
        if !self.send(connected) {
            return Err(ProtocolError::ConnectionClosed(
                "client closed during handshake".to_string(),
            ));
        }
        Ok(connect)
    }

    /// Write a frame to the client
    pub fn send(&self, frame: Frame) -> bool {
        match &self.to_client {
            Some(tx) => tx.send(frame).is_ok(),
            None => false,
        }
    }

    /// Deliver a MESSAGE for `subscription` on `destination`
    pub fn publish(&self, subscription: &str, destination: &str, body: impl Into<String>) -> bool {
        let message_id = self.next_message_id.fetch_add(1, Ordering::SeqCst);
        self.send(
            Frame::new(Command::Message)
                .with_header("subscription", subscription)
                .with_header("message-id", message_id.to_string())
                .with_header("destination", destination)
                .with_header("content-type", "application/json")
                .with_body(body),
        )
    }

    /// Drop the server end; the client sees the connection close
    pub fn close(&mut self) {
        self.to_client = None;
    }

    /// Heart-beats the client has sent on this connection
    pub fn heartbeats(&self) -> usize {
        self.heartbeats.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frames_flow_both_ways() {
        let (factory, mut broker) = memory_transport();
        let mut transport = factory.connect(&ConnectionConfig::default()).await.unwrap();
        let mut peer = broker.accept().await.unwrap();

        transport
            .send_frame(&Frame::subscribe("sub-0", "/topic/groupbuying/1"))
            .await
            .unwrap();
        let frame = peer.expect(Command::Subscribe).await.unwrap();
        assert_eq!(frame.destination(), Some("/topic/groupbuying/1"));

        assert!(peer.publish("sub-0", "/topic/groupbuying/1", "{}"));
        let frame = transport.receive_frame().await.unwrap();
        assert_eq!(frame.subscription(), Some("sub-0"));
        assert_eq!(frame.header("message-id"), Some("1"));
    }

    #[tokio::test]
    async fn test_peer_close_is_reported() {
        let (factory, mut broker) = memory_transport();
        let mut transport = factory.connect(&ConnectionConfig::default()).await.unwrap();
        let mut peer = broker.accept().await.unwrap();

        peer.close();
        let result = transport.receive_frame().await;
        assert!(matches!(result, Err(ProtocolError::ConnectionClosed(_))));
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn test_refused_connections() {
        let (factory, broker) = memory_transport();
        broker.refuse_connections(true);

        let result = factory.connect(&ConnectionConfig::default()).await;
        assert!(matches!(result, Err(ProtocolError::Transport(_))));
        assert_eq!(broker.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_heartbeats_are_counted() {
        let (factory, mut broker) = memory_transport();
        let mut transport = factory.connect(&ConnectionConfig::default()).await.unwrap();
        let peer = broker.accept().await.unwrap();

        transport.send_heartbeat().await.unwrap();
        transport.send_heartbeat().await.unwrap();
        assert_eq!(peer.heartbeats(), 2);
    }
}
