//! Paginated History
//!
//! Fetches older messages page by page over HTTP and feeds them into the
//! [`MessageCache`].
//!
//! ## Endpoints
//!
//! Relative to `{base_url}{api_prefix}`:
//!
//! - `GET /chat/groupbuying/{id}/messages/paginated?size={n}[&cursor={c}]`
//! - `GET /chat/groupbuying/{id}/count`
//! - `POST /chat/messages` (non-realtime send fallback)

use crate::cache::{ApplyOutcome, Lease, MessageCache};
use crate::message::{ChatMessage, ConversationId, Cursor, MessageCount, MessagePage, SendRequest};
use crate::{ProtocolError, Result};
use async_trait::async_trait;
use reqwest::header::ACCEPT;
use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use std::fmt::Debug;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Path prefix of the REST API
pub const DEFAULT_API_PREFIX: &str = "/api";

/// Messages requested per page
pub const DEFAULT_PAGE_SIZE: usize = 50;

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Source of message history
#[async_trait]
pub trait HistorySource: Send + Sync + Debug {
    /// Fetch one page; `cursor` is `None` for the newest page
    async fn fetch_page(
        &self,
        conversation: ConversationId,
        cursor: Option<&Cursor>,
        page_size: usize,
    ) -> Result<MessagePage>;

    /// Total number of messages in a conversation
    async fn fetch_count(&self, conversation: ConversationId) -> Result<u64>;

    /// Create a message without the live connection
    async fn post_message(&self, request: &SendRequest) -> Result<ChatMessage>;
}

/// HTTP client configuration
#[derive(Debug, Clone)]
pub struct HistoryConfig {
    pub base_url: String,
    pub api_prefix: String,
    pub auth_token: Option<String>,
    pub request_timeout: Duration,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080".to_string(),
            api_prefix: DEFAULT_API_PREFIX.to_string(),
            auth_token: None,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

impl HistoryConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Default::default()
        }
    }

    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    /// `{base_url}{api_prefix}` without a trailing slash
    pub fn api_base(&self) -> String {
        let prefix = self.api_prefix.trim_matches('/');
        let base = self.base_url.trim().trim_end_matches('/');
        if prefix.is_empty() {
            base.to_string()
        } else {
            format!("{}/{}", base, prefix)
        }
    }
}

/// [`HistorySource`] backed by the REST API
#[derive(Debug, Clone)]
pub struct HttpHistoryClient {
    client: Client,
    api_base: String,
    auth_token: Option<String>,
}

impl HttpHistoryClient {
    pub fn new(config: &HistoryConfig) -> Result<Self> {
        let api_base = config.api_base();
        reqwest::Url::parse(&api_base).map_err(|e| {
            ProtocolError::Configuration(format!("invalid API base URL '{}': {}", api_base, e))
        })?;

        let client = Client::builder().timeout(config.request_timeout).build()?;

        Ok(Self {
            client,
            api_base,
            auth_token: config.auth_token.clone(),
        })
    }

    pub fn api_base(&self) -> &str {
        &self.api_base
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.api_base, path)
    }

    async fn execute<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T> {
        let mut request = request.header(ACCEPT, "application/json");
        if let Some(token) = &self.auth_token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!("Request failed with status {}: {}", status, body);
            return Err(ProtocolError::HttpStatus {
                status: status.as_u16(),
                body,
            });
        }

        Ok(response.json::<T>().await?)
    }
}

#[async_trait]
impl HistorySource for HttpHistoryClient {
    async fn fetch_page(
        &self,
        conversation: ConversationId,
        cursor: Option<&Cursor>,
        page_size: usize,
    ) -> Result<MessagePage> {
        let url = self.url(&format!(
            "/chat/groupbuying/{}/messages/paginated",
            conversation
        ));
        let mut query = vec![("size", page_size.to_string())];
        if let Some(cursor) = cursor {
            query.push(("cursor", cursor.as_str().to_string()));
        }

        debug!("GET {} {:?}", url, query);
        self.execute(self.client.get(&url).query(&query)).await
    }

    async fn fetch_count(&self, conversation: ConversationId) -> Result<u64> {
        let url = self.url(&format!("/chat/groupbuying/{}/count", conversation));
        debug!("GET {}", url);
        let count: MessageCount = self.execute(self.client.get(&url)).await?;
        Ok(count.value())
    }

    async fn post_message(&self, request: &SendRequest) -> Result<ChatMessage> {
        let url = self.url("/chat/messages");
        debug!("POST {} for conversation {}", url, request.group_buying_id);
        self.execute(self.client.post(&url).json(request)).await
    }
}

/// What a load call did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    /// A page was applied
    Loaded { added: usize },
    /// The requested page is already in the cache
    AlreadyLoaded,
    /// There is no older history
    Exhausted,
    /// Another fetch of this loader is still running
    InFlight,
    /// The page arrived after the view was closed, or out of order
    Discarded,
}

impl From<ApplyOutcome> for LoadOutcome {
    fn from(outcome: ApplyOutcome) -> Self {
        match outcome {
            ApplyOutcome::Adopted { added } | ApplyOutcome::Appended { added } => {
                LoadOutcome::Loaded { added }
            }
            ApplyOutcome::Duplicate => LoadOutcome::AlreadyLoaded,
            ApplyOutcome::Stale => LoadOutcome::Discarded,
        }
    }
}

/// Clears the in-flight flag, also when the fetch future is dropped
struct FetchGuard<'a>(&'a AtomicBool);

impl Drop for FetchGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Loads the history of one conversation into the cache
///
/// Pagination state lives in the cache, so several loaders for the same
/// conversation agree on what has been fetched.
#[derive(Debug)]
pub struct HistoryLoader {
    lease: Lease,
    source: Arc<dyn HistorySource>,
    cache: MessageCache,
    page_size: usize,
    fetching: AtomicBool,
    last_error: Mutex<Option<String>>,
}

impl HistoryLoader {
    pub fn new(
        lease: Lease,
        source: Arc<dyn HistorySource>,
        cache: MessageCache,
        page_size: usize,
    ) -> Self {
        Self {
            lease,
            source,
            cache,
            page_size: page_size.max(1),
            fetching: AtomicBool::new(false),
            last_error: Mutex::new(None),
        }
    }

    pub fn conversation(&self) -> ConversationId {
        self.lease.conversation()
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Fetch the newest page unless it is already cached
    pub async fn load_initial(&self) -> Result<LoadOutcome> {
        self.ensure_open().await?;
        if self.cache.pagination(self.conversation()).await.history_loaded {
            return Ok(LoadOutcome::AlreadyLoaded);
        }
        self.fetch(None).await
    }

    /// Fetch the next older page
    ///
    /// Falls back to [`load_initial`](Self::load_initial) when nothing has
    /// been loaded yet, and does nothing once history is exhausted.
    pub async fn load_more(&self) -> Result<LoadOutcome> {
        self.ensure_open().await?;
        let pagination = self.cache.pagination(self.conversation()).await;
        if !pagination.history_loaded {
            return self.fetch(None).await;
        }
        match (pagination.has_more, pagination.next_cursor) {
            (true, Some(cursor)) => self.fetch(Some(cursor)).await,
            _ => {
                debug!("No older history for conversation {}", self.conversation());
                Ok(LoadOutcome::Exhausted)
            }
        }
    }

    pub async fn has_more(&self) -> bool {
        self.cache.pagination(self.conversation()).await.has_more
    }

    pub fn is_fetching(&self) -> bool {
        self.fetching.load(Ordering::SeqCst)
    }

    /// Error of the last failed fetch, cleared by the next success
    pub fn last_error(&self) -> Option<String> {
        self.last_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_last_error(&self, error: Option<String>) {
        *self.last_error.lock().unwrap_or_else(PoisonError::into_inner) = error;
    }

    pub async fn fetch_count(&self) -> Result<u64> {
        self.source.fetch_count(self.conversation()).await
    }

    async fn ensure_open(&self) -> Result<()> {
        if self.cache.is_current(&self.lease).await {
            Ok(())
        } else {
            Err(ProtocolError::ConversationClosed(self.conversation()))
        }
    }

    async fn fetch(&self, cursor: Option<Cursor>) -> Result<LoadOutcome> {
        let conversation = self.conversation();
        if self.fetching.swap(true, Ordering::SeqCst) {
            debug!("Fetch for conversation {} already in flight", conversation);
            return Ok(LoadOutcome::InFlight);
        }
        let _guard = FetchGuard(&self.fetching);

        debug!(
            "Fetching {} messages of conversation {} before {:?}",
            self.page_size, conversation, cursor
        );

        let page = match self
            .source
            .fetch_page(conversation, cursor.as_ref(), self.page_size)
            .await
        {
            Ok(page) => page,
            Err(e) => {
                warn!("Failed to fetch history of conversation {}: {}", conversation, e);
                self.set_last_error(Some(e.to_string()));
                return Err(e);
            }
        };
        self.set_last_error(None);

        let received = page.messages.len();
        let outcome = self
            .cache
            .apply_page(&self.lease, cursor.as_ref(), page)
            .await;
        info!(
            "Conversation {}: received {} messages, {:?}",
            conversation, received, outcome
        );

        Ok(outcome.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    const ROOM: ConversationId = ConversationId::new(11);

    fn msg(id: i64) -> ChatMessage {
        ChatMessage::with_id(id, ROOM, 3, format!("m{}", id))
    }

    #[derive(Debug, Default)]
    struct ScriptedSource {
        pages: Mutex<VecDeque<Result<MessagePage>>>,
        requests: Mutex<Vec<Option<Cursor>>>,
    }

    impl ScriptedSource {
        fn push(&self, page: Result<MessagePage>) {
            self.pages.lock().unwrap().push_back(page);
        }

        fn requests(&self) -> Vec<Option<Cursor>> {
            self.requests.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl HistorySource for ScriptedSource {
        async fn fetch_page(
            &self,
            _conversation: ConversationId,
            cursor: Option<&Cursor>,
            _page_size: usize,
        ) -> Result<MessagePage> {
            self.requests.lock().unwrap().push(cursor.cloned());
            self.pages
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(ProtocolError::invalid_state("no scripted page")))
        }

        async fn fetch_count(&self, _conversation: ConversationId) -> Result<u64> {
            Ok(4)
        }

        async fn post_message(&self, _request: &SendRequest) -> Result<ChatMessage> {
            Err(ProtocolError::invalid_state("not scripted"))
        }
    }

    async fn loader(source: Arc<ScriptedSource>) -> (HistoryLoader, MessageCache) {
        let cache = MessageCache::default();
        let lease = cache.open(ROOM).await;
        (
            HistoryLoader::new(lease, source, cache.clone(), DEFAULT_PAGE_SIZE),
            cache,
        )
    }

    #[test]
    fn test_api_base() {
        assert_eq!(
            HistoryConfig::new("http://localhost:8080/").api_base(),
            "http://localhost:8080/api"
        );

        let mut config = HistoryConfig::new("https://sikboo.kr");
        config.api_prefix = String::new();
        assert_eq!(config.api_base(), "https://sikboo.kr");

        assert!(HttpHistoryClient::new(&HistoryConfig::new("not a url")).is_err());
    }

    #[tokio::test]
    async fn test_loader_walks_pages_until_exhausted() {
        let source = Arc::new(ScriptedSource::default());
        source.push(Ok(MessagePage::new(
            vec![msg(3), msg(4)],
            true,
            Some(Cursor::from("c1")),
        )));
        source.push(Ok(MessagePage::new(vec![msg(1), msg(2)], false, None)));
        let (loader, cache) = loader(source.clone()).await;

        assert_eq!(
            loader.load_initial().await.unwrap(),
            LoadOutcome::Loaded { added: 2 }
        );
        assert!(loader.has_more().await);
        assert_eq!(loader.load_initial().await.unwrap(), LoadOutcome::AlreadyLoaded);

        assert_eq!(
            loader.load_more().await.unwrap(),
            LoadOutcome::Loaded { added: 2 }
        );
        assert!(!loader.has_more().await);
        assert_eq!(loader.load_more().await.unwrap(), LoadOutcome::Exhausted);

        // Exhausted and already-loaded calls never reach the source
        assert_eq!(source.requests(), vec![None, Some(Cursor::from("c1"))]);
        assert_eq!(cache.merged_view(ROOM).await.len(), 4);
        assert_eq!(loader.fetch_count().await.unwrap(), 4);
    }

    #[tokio::test]
    async fn test_failed_fetch_keeps_pages() {
        let source = Arc::new(ScriptedSource::default());
        source.push(Ok(MessagePage::new(
            vec![msg(5)],
            true,
            Some(Cursor::from("c1")),
        )));
        source.push(Err(ProtocolError::HttpStatus {
            status: 500,
            body: "boom".to_string(),
        }));
        let (loader, cache) = loader(source.clone()).await;

        loader.load_initial().await.unwrap();
        let result = loader.load_more().await;
        assert!(matches!(result, Err(ProtocolError::HttpStatus { status: 500, .. })));
        assert!(loader.last_error().unwrap().contains("500"));
        assert!(!loader.is_fetching());

        let view = cache.merged_view(ROOM).await;
        assert_eq!(view.to_vec(), vec![msg(5)]);
        assert_eq!(
            cache.pagination(ROOM).await.next_cursor,
            Some(Cursor::from("c1"))
        );
    }

    #[tokio::test]
    async fn test_closed_view_does_not_fetch() {
        let source = Arc::new(ScriptedSource::default());
        let cache = MessageCache::default();
        let lease = cache.open(ROOM).await;
        let loader = HistoryLoader::new(lease.clone(), source.clone(), cache.clone(), 10);

        cache.release(lease).await;
        let result = loader.load_initial().await;
        assert!(matches!(result, Err(ProtocolError::ConversationClosed(_))));
        assert!(source.requests().is_empty());
    }

    /// Serve one canned HTTP response and hand back the raw request
    async fn serve_once(status: &str, body: &str) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let response = format!(
            "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            status,
            body.len(),
            body
        );

        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 1024];
            while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                request.extend_from_slice(&buf[..n]);
            }
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.unwrap();
            String::from_utf8_lossy(&request).into_owned()
        });

        (format!("http://{}", addr), handle)
    }

    #[tokio::test]
    async fn test_http_fetch_page() {
        let body = r#"{"messages":[{"messageId":1,"groupBuyingId":11,"memberId":3,"message":"hi"}],"hasMore":true,"nextCursor":1,"size":1}"#;
        let (base_url, server) = serve_once("200 OK", body).await;
        let client =
            HttpHistoryClient::new(&HistoryConfig::new(base_url).with_auth_token("t0ken")).unwrap();

        let page = client
            .fetch_page(ROOM, Some(&Cursor::from("42")), 50)
            .await
            .unwrap();
        assert_eq!(page.messages.len(), 1);
        assert_eq!(page.continuation(), Some(&Cursor::from("1")));

        let request = server.await.unwrap();
        assert!(request.starts_with(
            "GET /api/chat/groupbuying/11/messages/paginated?size=50&cursor=42 HTTP/1.1"
        ));
        assert!(request.to_ascii_lowercase().contains("authorization: bearer t0ken"));
    }

    #[tokio::test]
    async fn test_http_error_status() {
        let (base_url, server) = serve_once("404 Not Found", r#"{"error":"gone"}"#).await;
        let client = HttpHistoryClient::new(&HistoryConfig::new(base_url)).unwrap();

        let result = client.fetch_count(ROOM).await;
        match result {
            Err(ProtocolError::HttpStatus { status, body }) => {
                assert_eq!(status, 404);
                assert!(body.contains("gone"));
            }
            other => panic!("expected HttpStatus, got {:?}", other),
        }
        assert!(server.await.unwrap().starts_with("GET /api/chat/groupbuying/11/count"));
    }
}
