//! Topic subscription handle

use super::ConnectionCommand;
use crate::stomp::Frame;
use crate::Result;
use futures::Stream;
use serde::de::DeserializeOwned;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tracing::debug;

/// A live subscription to one destination
///
/// Yields every MESSAGE frame the broker routes to it. The stream ends when
/// the connection goes away. Dropping the handle unsubscribes.
///
/// A subscription requested while the client is not connected is inert: it
/// has no id and its stream ends immediately.
#[derive(Debug)]
pub struct Subscription {
    id: Option<String>,
    destination: String,
    receiver: mpsc::UnboundedReceiver<Frame>,
    command_tx: Option<mpsc::UnboundedSender<ConnectionCommand>>,
}

impl Subscription {
    pub(crate) fn active(
        id: String,
        destination: String,
        receiver: mpsc::UnboundedReceiver<Frame>,
        command_tx: mpsc::UnboundedSender<ConnectionCommand>,
    ) -> Self {
        Self {
            id: Some(id),
            destination,
            receiver,
            command_tx: Some(command_tx),
        }
    }

    pub(crate) fn inert(destination: String) -> Self {
        let (_, receiver) = mpsc::unbounded_channel();
        Self {
            id: None,
            destination,
            receiver,
            command_tx: None,
        }
    }

    /// STOMP subscription id, `None` for an inert subscription
    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }

    /// Whether the subscription was registered with a live connection
    pub fn is_active(&self) -> bool {
        self.id.is_some()
    }

    /// Next MESSAGE frame, `None` once the connection is gone
    pub async fn recv(&mut self) -> Option<Frame> {
        self.receiver.recv().await
    }

    /// Next MESSAGE body decoded as JSON
    pub async fn recv_json<T: DeserializeOwned>(&mut self) -> Option<Result<T>> {
        let frame = self.recv().await?;
        Some(frame.json_body())
    }

    /// Stop delivery
    ///
    /// No further frames are yielded once this returns, even if the broker
    /// already had some in flight.
    pub fn unsubscribe(self) {}
}

impl Stream for Subscription {
    type Item = Frame;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Frame>> {
        self.get_mut().receiver.poll_recv(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let (Some(id), Some(command_tx)) = (self.id.take(), self.command_tx.take()) {
            debug!("Unsubscribing {} from {}", id, self.destination);
            let _ = command_tx.send(ConnectionCommand::Unsubscribe { id });
        }
    }
}
