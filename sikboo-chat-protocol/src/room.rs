//! Chat Room
//!
//! Joins the live feed, the history loader and the cache for one open
//! conversation view.
//!
//! A room keeps a cache lease for as long as it is open and runs a live pump
//! that subscribes to the conversation topic whenever the shared
//! [`StompClient`] is connected. Closing the room (or dropping it) stops the
//! pump, which unsubscribes, and releases the lease so pending history
//! fetches are discarded.

use crate::cache::{CacheUpdate, Lease, MergedView, MessageCache};
use crate::connection::{ConnectionState, StompClient};
use crate::history::{HistoryLoader, HistorySource, LoadOutcome, DEFAULT_PAGE_SIZE};
use crate::message::{ChatMessage, ConversationId, SendRequest, SEND_DESTINATION};
use crate::{ProtocolError, Result};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Room configuration
#[derive(Debug, Clone)]
pub struct RoomConfig {
    pub page_size: usize,
    pub send_destination: String,
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            send_destination: SEND_DESTINATION.to_string(),
        }
    }
}

/// An open conversation view
#[derive(Debug)]
pub struct ChatRoom {
    conversation: ConversationId,
    member_id: Option<i64>,
    client: Arc<StompClient>,
    history: Arc<dyn HistorySource>,
    cache: MessageCache,
    loader: HistoryLoader,
    lease: Option<Lease>,
    pump: Option<JoinHandle<()>>,
    config: RoomConfig,
}

impl ChatRoom {
    /// Open a view of `conversation`
    ///
    /// `member_id` is the current user; sends are refused without one.
    /// Starts connecting the shared client if it is not connected yet.
    pub async fn open(
        conversation: ConversationId,
        member_id: Option<i64>,
        client: Arc<StompClient>,
        history: Arc<dyn HistorySource>,
        cache: MessageCache,
        config: RoomConfig,
    ) -> Self {
        let lease = cache.open(conversation).await;
        let loader = HistoryLoader::new(
            lease.clone(),
            history.clone(),
            cache.clone(),
            config.page_size,
        );

        client.connect();
        let pump = tokio::spawn(run_live_pump(client.clone(), cache.clone(), conversation));

        info!("Opened chat room {}", conversation);

        Self {
            conversation,
            member_id: member_id.filter(|id| *id > 0),
            client,
            history,
            cache,
            loader,
            lease: Some(lease),
            pump: Some(pump),
            config,
        }
    }

    pub fn conversation(&self) -> ConversationId {
        self.conversation
    }

    pub fn member_id(&self) -> Option<i64> {
        self.member_id
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.client.state()
    }

    pub fn is_open(&self) -> bool {
        self.lease.is_some()
    }

    pub async fn load_initial(&self) -> Result<LoadOutcome> {
        self.loader.load_initial().await
    }

    pub async fn load_more(&self) -> Result<LoadOutcome> {
        self.loader.load_more().await
    }

    pub async fn has_more(&self) -> bool {
        self.loader.has_more().await
    }

    pub fn is_fetching(&self) -> bool {
        self.loader.is_fetching()
    }

    pub fn last_error(&self) -> Option<String> {
        self.loader.last_error()
    }

    /// Current merged view
    pub async fn messages(&self) -> MergedView {
        self.cache.merged_view(self.conversation).await
    }

    /// Cache notifications; filter on [`CacheUpdate::conversation`]
    pub fn updates(&self) -> broadcast::Receiver<CacheUpdate> {
        self.cache.updates()
    }

    pub async fn message_count(&self) -> Result<u64> {
        self.loader.fetch_count().await
    }

    fn outgoing(&self, text: &str) -> Result<SendRequest> {
        if !self.is_open() {
            return Err(ProtocolError::ConversationClosed(self.conversation));
        }
        let text = text.trim();
        if text.is_empty() {
            return Err(ProtocolError::invalid_input("Message is empty"));
        }
        let member_id = self
            .member_id
            .ok_or_else(|| ProtocolError::invalid_input("No signed-in member to send as"))?;
        Ok(SendRequest::new(self.conversation, member_id, text))
    }

    /// Publish a message over the live connection
    ///
    /// Returns `false` without any network write for empty text, a missing
    /// member id or a connection that is not `Connected`. The message shows
    /// up in the view once the server echoes it on the topic.
    pub fn send(&self, text: &str) -> bool {
        let request = match self.outgoing(text) {
            Ok(request) => request,
            Err(e) => {
                warn!("Not sending to room {}: {}", self.conversation, e);
                return false;
            }
        };
        self.client
            .send_message(&self.config.send_destination, &request)
    }

    /// Create a message over HTTP instead of the live connection
    ///
    /// The created message is returned but not inserted; it arrives through
    /// the live feed like any other.
    pub async fn send_via_http(&self, text: &str) -> Result<ChatMessage> {
        let request = self.outgoing(text)?;
        self.history.post_message(&request).await
    }

    /// Tear the view down
    ///
    /// Waits for the live pump to stop before releasing the lease, so no
    /// live message lands after `close` returns.
    pub async fn close(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
            let _ = pump.await;
        }
        if let Some(lease) = self.lease.take() {
            self.cache.release(lease).await;
            info!("Closed chat room {}", self.conversation);
        }
    }
}

impl Drop for ChatRoom {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
        if let Some(lease) = self.lease.take() {
            let cache = self.cache.clone();
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(async move { cache.release(lease).await });
                }
                Err(_) => error!(
                    "Chat room {} dropped outside a runtime, lease not released",
                    self.conversation
                ),
            }
        }
    }
}

/// Feed live messages of `conversation` into the cache
///
/// Subscribes whenever the client is connected and subscribes again after
/// every reconnect.
async fn run_live_pump(
    client: Arc<StompClient>,
    cache: MessageCache,
    conversation: ConversationId,
) {
    let topic = conversation.topic();
    let mut state_rx = client.watch_state();

    loop {
        let connected = state_rx
            .wait_for(|state| *state == ConnectionState::Connected)
            .await
            .is_ok();
        if !connected {
            break;
        }

        let generation = client.connection_generation();
        let mut subscription = client.subscribe(&topic);
        if subscription.is_active() {
            info!("Listening on {} for room {}", topic, conversation);

            while let Some(frame) = subscription.recv().await {
                match frame.json_body::<ChatMessage>() {
                    Ok(message) => {
                        cache.append_live(conversation, message).await;
                    }
                    Err(e) => warn!("Skipping undecodable message on {}: {}", topic, e),
                }
            }
            debug!("Live feed {} ended", topic);
        }
        drop(subscription);

        // Resubscribe right away if a new connection is already up
        if client.is_connected() && client.connection_generation() != generation {
            continue;
        }
        if state_rx.changed().await.is_err() {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionConfig;
    use crate::message::{Cursor, MessagePage};
    use crate::stomp::Command;
    use crate::transport::{memory_transport, MemoryBroker, MemoryPeer};
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::time::Duration;

    const ROOM: ConversationId = ConversationId::new(5);
    const WAIT: Duration = Duration::from_secs(2);

    #[derive(Debug, Default)]
    struct RecordingHistory {
        posted: Mutex<Vec<SendRequest>>,
    }

    #[async_trait]
    impl HistorySource for RecordingHistory {
        async fn fetch_page(
            &self,
            conversation: ConversationId,
            _cursor: Option<&Cursor>,
            _page_size: usize,
        ) -> Result<MessagePage> {
            Ok(MessagePage::new(
                vec![ChatMessage::with_id(1, conversation, 2, "hello")],
                false,
                None,
            ))
        }

        async fn fetch_count(&self, _conversation: ConversationId) -> Result<u64> {
            Ok(1)
        }

        async fn post_message(&self, request: &SendRequest) -> Result<ChatMessage> {
            self.posted.lock().unwrap().push(request.clone());
            Ok(ChatMessage::with_id(
                99,
                ConversationId::new(request.group_buying_id),
                request.member_id,
                request.message.clone(),
            ))
        }
    }

    async fn open_room(
        member_id: Option<i64>,
    ) -> (ChatRoom, Arc<RecordingHistory>, MemoryBroker, MemoryPeer) {
        let (factory, mut broker) = memory_transport();
        let client = Arc::new(StompClient::new(ConnectionConfig::default(), Arc::new(factory)));
        let history = Arc::new(RecordingHistory::default());
        let room = ChatRoom::open(
            ROOM,
            member_id,
            client.clone(),
            history.clone(),
            MessageCache::default(),
            RoomConfig::default(),
        )
        .await;

        let mut peer = broker.accept().await.unwrap();
        peer.accept_handshake().await.unwrap();
        client.wait_until_connected(WAIT).await.unwrap();

        (room, history, broker, peer)
    }

    #[tokio::test]
    async fn test_send_validation() {
        let (room, _history, _broker, mut peer) = open_room(None).await;
        peer.expect(Command::Subscribe).await.unwrap();

        assert!(!room.send("hello"));
        assert!(peer.try_recv().is_none());
        assert!(room.send_via_http("hello").await.is_err());

        let (room, _history, _broker, mut peer) = open_room(Some(0)).await;
        peer.expect(Command::Subscribe).await.unwrap();
        assert!(!room.send("hello"));
        assert!(!room.send("   "));
        assert!(peer.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_send_publishes_trimmed_request() {
        let (room, _history, _broker, mut peer) = open_room(Some(8)).await;
        peer.expect(Command::Subscribe).await.unwrap();

        assert!(room.send("  hi there \n"));
        let frame = peer.expect(Command::Send).await.unwrap();
        assert_eq!(frame.destination(), Some(SEND_DESTINATION));
        let request: SendRequest = frame.json_body().unwrap();
        assert_eq!(request, SendRequest::new(ROOM, 8, "hi there"));

        // No optimistic echo
        assert!(room.messages().await.is_empty());
    }

    #[tokio::test]
    async fn test_http_send_does_not_insert() {
        let (room, history, _broker, mut peer) = open_room(Some(8)).await;
        peer.expect(Command::Subscribe).await.unwrap();

        let created = room.send_via_http("fallback").await.unwrap();
        assert_eq!(created.message_id, Some(99));
        assert_eq!(history.posted.lock().unwrap().len(), 1);
        assert!(room.messages().await.is_empty());
    }

    #[tokio::test]
    async fn test_live_pump_feeds_cache() {
        let (room, _history, _broker, mut peer) = open_room(Some(8)).await;
        let subscribe = peer.expect(Command::Subscribe).await.unwrap();
        assert_eq!(subscribe.destination(), Some("/topic/groupbuying/5"));
        let id = subscribe.header("id").unwrap().to_string();

        let mut updates = room.updates();
        peer.publish(&id, "/topic/groupbuying/5", "not json");
        peer.publish(
            &id,
            "/topic/groupbuying/5",
            r#"{"messageId":3,"groupBuyingId":5,"memberId":2,"message":"live"}"#,
        );
        updates.recv().await.unwrap();

        let view = room.messages().await;
        assert_eq!(view.len(), 1);
        assert_eq!(view.first().map(|m| m.message.as_str()), Some("live"));
    }

    #[tokio::test]
    async fn test_pump_resubscribes_after_reconnect() {
        let (factory, mut broker) = memory_transport();
        let client = Arc::new(StompClient::new(ConnectionConfig::default(), Arc::new(factory)));
        let _room = ChatRoom::open(
            ROOM,
            Some(1),
            client.clone(),
            Arc::new(RecordingHistory::default()),
            MessageCache::default(),
            RoomConfig::default(),
        )
        .await;

        let mut peer = broker.accept().await.unwrap();
        peer.accept_handshake().await.unwrap();
        peer.expect(Command::Subscribe).await.unwrap();

        peer.close();
        let mut state_rx = client.watch_state();
        state_rx
            .wait_for(|state| *state == ConnectionState::Disconnected)
            .await
            .unwrap();

        client.connect();
        let mut peer = broker.accept().await.unwrap();
        peer.accept_handshake().await.unwrap();
        let subscribe = peer.expect(Command::Subscribe).await.unwrap();
        assert_eq!(subscribe.destination(), Some("/topic/groupbuying/5"));
    }

    #[tokio::test]
    async fn test_close_unsubscribes_and_releases() {
        let (mut room, _history, _broker, mut peer) = open_room(Some(8)).await;
        peer.expect(Command::Subscribe).await.unwrap();
        room.load_initial().await.unwrap();

        room.close().await;
        assert!(!room.is_open());
        peer.expect(Command::Unsubscribe).await.unwrap();
        assert_eq!(room.cache.observers(ROOM).await, 0);

        assert!(!room.send("after close"));
        assert!(matches!(
            room.load_more().await,
            Err(ProtocolError::ConversationClosed(_))
        ));
        // Cached messages stay until evicted
        assert_eq!(room.messages().await.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_no_live_append_after_close() {
        let (mut room, _history, _broker, mut peer) = open_room(Some(8)).await;
        let subscribe = peer.expect(Command::Subscribe).await.unwrap();
        let id = subscribe.header("id").unwrap().to_string();

        let mut updates = room.updates();
        for n in 1..=200 {
            peer.publish(
                &id,
                "/topic/groupbuying/5",
                format!(
                    r#"{{"messageId":{},"groupBuyingId":5,"memberId":2,"message":"m{}"}}"#,
                    n, n
                ),
            );
        }
        updates.recv().await.unwrap();

        room.close().await;
        let settled = room.messages().await.revision();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(room.messages().await.revision(), settled);
    }
}
