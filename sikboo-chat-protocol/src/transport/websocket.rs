//! WebSocket Transport
//!
//! Carries STOMP frames as WebSocket text messages using `tokio-tungstenite`.
//!
//! ## Endpoint
//!
//! The endpoint is derived from the HTTP base URL of the backend:
//! `http://host:8080` becomes `ws://host:8080/ws`, `https://` becomes `wss://`.
//! A bearer token, when configured, is attached to the upgrade request.

use super::r#trait::{Transport, TransportFactory};
use crate::connection::ConnectionConfig;
use crate::stomp::Frame;
use crate::{ProtocolError, Result};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use std::collections::VecDeque;
use std::fmt;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header::AUTHORIZATION, HeaderValue};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// A STOMP-over-WebSocket connection
pub struct WebSocketTransport {
    stream: WsStream,
    url: String,
    /// Frames decoded from a message that carried more than one frame
    pending: VecDeque<Frame>,
    connected: bool,
}

impl fmt::Debug for WebSocketTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebSocketTransport")
            .field("url", &self.url)
            .field("pending", &self.pending.len())
            .field("connected", &self.connected)
            .finish()
    }
}

impl WebSocketTransport {
    fn new(stream: WsStream, url: String) -> Self {
        Self {
            stream,
            url,
            pending: VecDeque::new(),
            connected: true,
        }
    }

    fn closed(&mut self, reason: impl Into<String>) -> ProtocolError {
        self.connected = false;
        ProtocolError::ConnectionClosed(reason.into())
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    fn remote_address(&self) -> String {
        self.url.clone()
    }

    async fn send_frame(&mut self, frame: &Frame) -> Result<()> {
        debug!("Sending {} to {}", frame, self.url);
        if let Err(e) = self.stream.send(Message::Text(frame.encode().into())).await {
            self.connected = false;
            return Err(ws_error(e, "send"));
        }
        Ok(())
    }

    async fn send_heartbeat(&mut self) -> Result<()> {
        if let Err(e) = self.stream.send(Message::Text("\n".into())).await {
            self.connected = false;
            return Err(ws_error(e, "heart-beat"));
        }
        Ok(())
    }

    async fn receive_frame(&mut self) -> Result<Frame> {
        loop {
            if let Some(frame) = self.pending.pop_front() {
                return Ok(frame);
            }

            let message = match self.stream.next().await {
                Some(Ok(message)) => message,
                Some(Err(tungstenite::Error::ConnectionClosed)) | None => {
                    return Err(self.closed("stream ended"));
                }
                Some(Err(e)) => {
                    self.connected = false;
                    return Err(ws_error(e, "receive"));
                }
            };

            let frames = match message {
                Message::Text(text) => Frame::decode_all(text.as_str().as_bytes())?,
                Message::Binary(data) => Frame::decode_all(&data)?,
                Message::Close(close) => {
                    let reason = close
                        .map(|c| format!("{} {}", c.code, c.reason))
                        .unwrap_or_else(|| "closed by server".to_string());
                    return Err(self.closed(reason));
                }
                // Pings are answered by tungstenite itself
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
            };

            self.pending.extend(frames);
        }
    }

    async fn close(mut self: Box<Self>) -> Result<()> {
        self.connected = false;
        match self.stream.close(None).await {
            Ok(())
            | Err(tungstenite::Error::ConnectionClosed)
            | Err(tungstenite::Error::AlreadyClosed) => Ok(()),
            Err(e) => Err(ws_error(e, "close")),
        }
    }

    fn is_connected(&self) -> bool {
        self.connected
    }
}

/// Socket failures are classified like any other I/O error
fn ws_error(error: tungstenite::Error, context: &str) -> ProtocolError {
    match error {
        tungstenite::Error::Io(e) => ProtocolError::from_io_error(e, context),
        other => other.into(),
    }
}

/// Opens [`WebSocketTransport`] connections
#[derive(Debug, Default, Clone)]
pub struct WebSocketTransportFactory;

impl WebSocketTransportFactory {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl TransportFactory for WebSocketTransportFactory {
    async fn connect(&self, config: &ConnectionConfig) -> Result<Box<dyn Transport>> {
        let url = config.websocket_url()?;
        let mut request = url.as_str().into_client_request()?;

        if let Some(token) = &config.auth_token {
            let value = HeaderValue::from_str(&format!("Bearer {}", token)).map_err(|_| {
                ProtocolError::Configuration("auth token contains invalid characters".to_string())
            })?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }

        info!("Opening WebSocket connection to {}", url);

        let handshake = tokio_tungstenite::connect_async(request);
        let (stream, response) = match tokio::time::timeout(config.connect_timeout, handshake).await
        {
            Ok(Ok(connected)) => connected,
            Ok(Err(e)) => {
                warn!("WebSocket handshake with {} failed: {}", url, e);
                return Err(ws_error(e, "handshake"));
            }
            Err(_) => {
                return Err(ProtocolError::Timeout(format!(
                    "WebSocket handshake with {} took longer than {:?}",
                    url, config.connect_timeout
                )))
            }
        };

        debug!("WebSocket upgrade accepted with status {}", response.status());

        Ok(Box::new(WebSocketTransport::new(stream, url)))
    }
}
