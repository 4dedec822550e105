//! Reconciliation Cache
//!
//! Holds, per conversation, the ordered list of fetched history pages plus
//! the messages pushed live, and exposes them as one merged view.
//!
//! ## Layout
//!
//! Pages are stored newest first: index 0 is the newest page and also the
//! page live messages are appended to. Inside a page messages are oldest
//! first, so the merged view is the pages in reverse, flattened.
//!
//! ```text
//! pages[0] = [m3, m4, m5(live)]     merged = [m1, m2, m3, m4, m5]
//! pages[1] = [m1, m2]
//! ```
//!
//! ## Leases
//!
//! A view calls [`MessageCache::open`] to observe a conversation and gets a
//! [`Lease`] carrying the entry's epoch. Fetch results are applied with that
//! lease. Releasing the last lease gives the entry a new epoch, so a fetch
//! that resolves after its view went away is discarded.
//!
//! ## Adopting the newest page
//!
//! Live messages may arrive before the newest page does. The page's unseen
//! messages are merged into that live run by server id (or timestamp), so a
//! page holding messages newer than a live one still yields an ordered view.

use crate::message::{ChatMessage, ConversationId, Cursor, MessageKey, MessagePage};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info, warn};

/// Conversations kept before least recently used unobserved entries are dropped
pub const DEFAULT_MAX_CONVERSATIONS: usize = 32;

/// Time an unobserved entry survives before `evict_expired` drops it
pub const DEFAULT_IDLE_TTL: Duration = Duration::from_secs(300);

const UPDATE_CHANNEL_CAPACITY: usize = 256;

/// Cache configuration
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub max_conversations: usize,
    pub idle_ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_conversations: DEFAULT_MAX_CONVERSATIONS,
            idle_ttl: DEFAULT_IDLE_TTL,
        }
    }
}

/// Proof that a view observes a conversation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    conversation: ConversationId,
    epoch: u64,
}

impl Lease {
    pub fn conversation(&self) -> ConversationId {
        self.conversation
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }
}

/// Result of applying a fetched page
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Newest page became page 0
    Adopted { added: usize },
    /// Older page was appended after the existing ones
    Appended { added: usize },
    /// The page was already held
    Duplicate,
    /// The lease is outdated or the page is out of order; nothing changed
    Stale,
}

impl ApplyOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, ApplyOutcome::Adopted { .. } | ApplyOutcome::Appended { .. })
    }

    /// Messages the merged view gained
    pub fn added(&self) -> usize {
        match self {
            ApplyOutcome::Adopted { added } | ApplyOutcome::Appended { added } => *added,
            ApplyOutcome::Duplicate | ApplyOutcome::Stale => 0,
        }
    }
}

/// Pagination status of one conversation
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Pagination {
    /// The newest page has been fetched
    pub history_loaded: bool,
    /// Older history exists
    pub has_more: bool,
    /// Cursor for the next older page
    pub next_cursor: Option<Cursor>,
    pub pages: usize,
    pub messages: usize,
}

/// Emitted after every mutation of a conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheUpdate {
    pub conversation: ConversationId,
    pub revision: u64,
}

#[derive(Debug)]
struct CacheEntry {
    /// Newest first
    pages: Vec<Arc<Vec<ChatMessage>>>,
    seen: HashSet<MessageKey>,
    history_loaded: bool,
    has_more: bool,
    next_cursor: Option<Cursor>,
    fetched: HashSet<Cursor>,
    epoch: u64,
    observers: usize,
    revision: u64,
    last_access: Instant,
}

impl CacheEntry {
    fn new(epoch: u64, now: Instant) -> Self {
        Self {
            pages: Vec::new(),
            seen: HashSet::new(),
            history_loaded: false,
            has_more: false,
            next_cursor: None,
            fetched: HashSet::new(),
            epoch,
            observers: 0,
            revision: 0,
            last_access: now,
        }
    }

    fn message_count(&self) -> usize {
        self.pages.iter().map(|page| page.len()).sum()
    }

    fn pagination(&self) -> Pagination {
        Pagination {
            history_loaded: self.history_loaded,
            has_more: self.has_more,
            next_cursor: self.next_cursor.clone(),
            pages: self.pages.len(),
            messages: self.message_count(),
        }
    }

    fn bump(&mut self, now: Instant) -> u64 {
        self.revision += 1;
        self.last_access = now;
        self.revision
    }
}

#[derive(Debug, Default)]
struct CacheState {
    entries: HashMap<ConversationId, CacheEntry>,
    next_epoch: u64,
}

impl CacheState {
    fn fresh_epoch(&mut self) -> u64 {
        self.next_epoch += 1;
        self.next_epoch
    }

    fn entry_or_insert(
        &mut self,
        conversation: ConversationId,
        max_conversations: usize,
        now: Instant,
    ) -> &mut CacheEntry {
        if !self.entries.contains_key(&conversation) {
            self.make_room(max_conversations);
        }
        let next_epoch = &mut self.next_epoch;
        self.entries.entry(conversation).or_insert_with(|| {
            *next_epoch += 1;
            CacheEntry::new(*next_epoch, now)
        })
    }

    /// Drop least recently used unobserved entries until one more fits
    fn make_room(&mut self, max_conversations: usize) {
        while self.entries.len() >= max_conversations.max(1) {
            let victim = self
                .entries
                .iter()
                .filter(|(_, entry)| entry.observers == 0)
                .min_by_key(|(_, entry)| entry.last_access)
                .map(|(id, _)| *id);

            match victim {
                Some(id) => {
                    self.entries.remove(&id);
                    debug!("Evicted least recently used conversation {}", id);
                }
                None => {
                    debug!(
                        "All {} cached conversations are observed, growing past the limit",
                        self.entries.len()
                    );
                    break;
                }
            }
        }
    }
}

/// Per-conversation message cache shared by every view of the session
///
/// Cloning is cheap and every clone sees the same entries.
#[derive(Debug, Clone)]
pub struct MessageCache {
    state: Arc<RwLock<CacheState>>,
    updates: broadcast::Sender<CacheUpdate>,
    config: CacheConfig,
}

impl Default for MessageCache {
    fn default() -> Self {
        Self::new(CacheConfig::default())
    }
}

impl MessageCache {
    pub fn new(config: CacheConfig) -> Self {
        let (updates, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);
        Self {
            state: Arc::new(RwLock::new(CacheState::default())),
            updates,
            config,
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Receive a [`CacheUpdate`] after every change
    pub fn updates(&self) -> broadcast::Receiver<CacheUpdate> {
        self.updates.subscribe()
    }

    fn notify(&self, conversation: ConversationId, revision: u64) {
        // No receivers is fine
        let _ = self.updates.send(CacheUpdate {
            conversation,
            revision,
        });
    }

    /// Start observing `conversation`, creating its entry if needed
    pub async fn open(&self, conversation: ConversationId) -> Lease {
        let mut state = self.state.write().await;
        let entry =
            state.entry_or_insert(conversation, self.config.max_conversations, Instant::now());
        entry.observers += 1;
        entry.last_access = Instant::now();

        debug!(
            "Opened conversation {} (observers: {}, epoch: {})",
            conversation, entry.observers, entry.epoch
        );
        Lease {
            conversation,
            epoch: entry.epoch,
        }
    }

    /// Stop observing
    ///
    /// When the last observer leaves, fetches started under the old epoch
    /// are discarded when they resolve. Cached messages stay until evicted.
    pub async fn release(&self, lease: Lease) {
        let mut state = self.state.write().await;
        let fresh = state.fresh_epoch();

        let Some(entry) = state.entries.get_mut(&lease.conversation) else {
            return;
        };
        if entry.epoch != lease.epoch {
            debug!(
                "Ignoring release of outdated lease for conversation {}",
                lease.conversation
            );
            return;
        }

        entry.observers = entry.observers.saturating_sub(1);
        entry.last_access = Instant::now();
        if entry.observers == 0 {
            entry.epoch = fresh;
            debug!(
                "Conversation {} has no observers, pending fetches are discarded",
                lease.conversation
            );
        }
    }

    /// Whether fetch results under `lease` would still be applied
    pub async fn is_current(&self, lease: &Lease) -> bool {
        let state = self.state.read().await;
        state
            .entries
            .get(&lease.conversation)
            .map(|entry| entry.epoch == lease.epoch && entry.observers > 0)
            .unwrap_or(false)
    }

    /// Append a message pushed by the live feed
    ///
    /// Seeds an entry for a conversation that has none. Returns `false`
    /// for a message already held.
    pub async fn append_live(&self, conversation: ConversationId, message: ChatMessage) -> bool {
        if message.conversation() != conversation {
            warn!(
                "Dropping live message for conversation {} delivered on {}",
                message.conversation(),
                conversation
            );
            return false;
        }

        let now = Instant::now();
        let revision = {
            let mut state = self.state.write().await;
            let entry = state.entry_or_insert(conversation, self.config.max_conversations, now);

            if !entry.seen.insert(message.key()) {
                debug!("Live message already cached for conversation {}", conversation);
                return false;
            }

            match entry.pages.first_mut() {
                Some(newest) => Arc::make_mut(newest).push(message),
                None => entry.pages.push(Arc::new(vec![message])),
            }
            entry.bump(now)
        };

        self.notify(conversation, revision);
        true
    }

    /// Apply a fetched page
    ///
    /// `requested` is the cursor the page was fetched with, `None` for the
    /// newest page.
    pub async fn apply_page(
        &self,
        lease: &Lease,
        requested: Option<&Cursor>,
        page: MessagePage,
    ) -> ApplyOutcome {
        let conversation = lease.conversation;
        let now = Instant::now();

        let (outcome, revision) = {
            let mut state = self.state.write().await;
            let Some(entry) = state
                .entries
                .get_mut(&conversation)
                .filter(|entry| entry.epoch == lease.epoch)
            else {
                debug!(
                    "Discarding page for conversation {}: view was closed",
                    conversation
                );
                return ApplyOutcome::Stale;
            };

            let next_cursor = page.continuation().cloned();
            let has_more = page.has_more && next_cursor.is_some();

            let outcome = match requested {
                None => {
                    if entry.history_loaded {
                        return ApplyOutcome::Duplicate;
                    }

                    let live: Vec<ChatMessage> = entry
                        .pages
                        .iter()
                        .rev()
                        .flat_map(|page| page.iter().cloned())
                        .collect();
                    let unseen: Vec<ChatMessage> = page
                        .messages
                        .into_iter()
                        .filter(|message| entry.seen.insert(message.key()))
                        .collect();
                    let added = unseen.len();

                    entry.pages = vec![Arc::new(interleave(unseen, live))];
                    entry.history_loaded = true;
                    ApplyOutcome::Adopted { added }
                }
                Some(cursor) => {
                    if !entry.history_loaded {
                        warn!(
                            "Older page {} for conversation {} arrived before the newest page",
                            cursor, conversation
                        );
                        return ApplyOutcome::Stale;
                    }
                    if entry.fetched.contains(cursor) {
                        return ApplyOutcome::Duplicate;
                    }
                    if entry.next_cursor.as_ref() != Some(cursor) {
                        debug!(
                            "Page {} for conversation {} is out of order (expected {:?})",
                            cursor, conversation, entry.next_cursor
                        );
                        return ApplyOutcome::Stale;
                    }

                    let older: Vec<ChatMessage> = page
                        .messages
                        .into_iter()
                        .filter(|message| entry.seen.insert(message.key()))
                        .collect();
                    let added = older.len();

                    entry.pages.push(Arc::new(older));
                    entry.fetched.insert(cursor.clone());
                    ApplyOutcome::Appended { added }
                }
            };

            let repeated = next_cursor
                .as_ref()
                .is_some_and(|cursor| entry.fetched.contains(cursor));
            if repeated && has_more {
                warn!(
                    "Cursor {:?} repeated for conversation {}, history is exhausted",
                    next_cursor, conversation
                );
            }
            entry.has_more = has_more && !repeated;
            entry.next_cursor = next_cursor;
            (outcome, entry.bump(now))
        };

        self.notify(conversation, revision);
        outcome
    }

    /// Snapshot of the merged, chronologically ordered messages
    pub async fn merged_view(&self, conversation: ConversationId) -> MergedView {
        let state = self.state.read().await;
        match state.entries.get(&conversation) {
            Some(entry) => MergedView {
                pages: entry.pages.clone(),
                len: entry.message_count(),
                revision: entry.revision,
            },
            None => MergedView::default(),
        }
    }

    pub async fn pagination(&self, conversation: ConversationId) -> Pagination {
        let state = self.state.read().await;
        state
            .entries
            .get(&conversation)
            .map(CacheEntry::pagination)
            .unwrap_or_default()
    }

    pub async fn contains(&self, conversation: ConversationId) -> bool {
        self.state.read().await.entries.contains_key(&conversation)
    }

    pub async fn observers(&self, conversation: ConversationId) -> usize {
        let state = self.state.read().await;
        state
            .entries
            .get(&conversation)
            .map(|entry| entry.observers)
            .unwrap_or(0)
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.read().await.entries.is_empty()
    }

    /// Drop a conversation nobody observes
    ///
    /// Returns `false` when there is no entry or a view still holds a lease.
    pub async fn evict(&self, conversation: ConversationId) -> bool {
        let removed = {
            let mut state = self.state.write().await;
            match state.entries.get(&conversation) {
                Some(entry) if entry.observers > 0 => {
                    debug!(
                        "Not evicting conversation {}: {} views open",
                        conversation, entry.observers
                    );
                    return false;
                }
                _ => state.entries.remove(&conversation),
            }
        };
        match removed {
            Some(entry) => {
                info!("Evicted conversation {}", conversation);
                self.notify(conversation, entry.revision + 1);
                true
            }
            None => false,
        }
    }

    /// Drop unobserved entries idle for longer than the configured TTL
    pub async fn evict_expired(&self) -> usize {
        self.evict_expired_at(Instant::now()).await
    }

    pub async fn evict_expired_at(&self, now: Instant) -> usize {
        let ttl = self.config.idle_ttl;
        let mut state = self.state.write().await;
        let before = state.entries.len();

        state.entries.retain(|id, entry| {
            let expired =
                entry.observers == 0 && now.saturating_duration_since(entry.last_access) >= ttl;
            if expired {
                debug!("Conversation {} expired", id);
            }
            !expired
        });

        let evicted = before - state.entries.len();
        if evicted > 0 {
            info!("Evicted {} idle conversations", evicted);
        }
        evicted
    }

    pub async fn clear(&self) {
        self.state.write().await.entries.clear();
    }
}

/// Merge fetched history into the live run
///
/// Both inputs are oldest first. Each history message goes in front of the
/// first live message it sorts before, so live messages keep their order.
fn interleave(history: Vec<ChatMessage>, live: Vec<ChatMessage>) -> Vec<ChatMessage> {
    let mut merged = Vec::with_capacity(history.len() + live.len());
    let mut live = live.into_iter().peekable();

    for message in history {
        while let Some(next) = live.next_if(|next| !sorts_before(&message, next)) {
            merged.push(next);
        }
        merged.push(message);
    }
    merged.extend(live);
    merged
}

/// Server ids decide when both messages have one, timestamps otherwise.
/// Messages that can not be compared put history first.
fn sorts_before(history: &ChatMessage, live: &ChatMessage) -> bool {
    if let (Some(a), Some(b)) = (history.message_id, live.message_id) {
        return a < b;
    }
    match (history.sent_at(), live.sent_at()) {
        (Some(a), Some(b)) => a <= b,
        _ => true,
    }
}

/// Immutable snapshot of one conversation, oldest message first
///
/// Shares page storage with the cache, so taking one is cheap.
#[derive(Debug, Clone, Default)]
pub struct MergedView {
    pages: Vec<Arc<Vec<ChatMessage>>>,
    len: usize,
    revision: u64,
}

impl MergedView {
    pub fn iter(&self) -> MergedIter<'_> {
        MergedIter {
            pages: self.pages.iter().rev(),
            current: Default::default(),
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Cache revision the snapshot was taken at
    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn first(&self) -> Option<&ChatMessage> {
        self.iter().next()
    }

    /// Newest message
    pub fn last(&self) -> Option<&ChatMessage> {
        self.pages.iter().find_map(|page| page.last())
    }

    pub fn contains(&self, key: &MessageKey) -> bool {
        self.iter().any(|message| &message.key() == key)
    }

    pub fn to_vec(&self) -> Vec<ChatMessage> {
        self.iter().cloned().collect()
    }
}

impl<'a> IntoIterator for &'a MergedView {
    type Item = &'a ChatMessage;
    type IntoIter = MergedIter<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Iterator over a [`MergedView`]
#[derive(Debug, Clone)]
pub struct MergedIter<'a> {
    pages: std::iter::Rev<std::slice::Iter<'a, Arc<Vec<ChatMessage>>>>,
    current: std::slice::Iter<'a, ChatMessage>,
}

impl<'a> Iterator for MergedIter<'a> {
    type Item = &'a ChatMessage;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(message) = self.current.next() {
                return Some(message);
            }
            self.current = self.pages.next()?.iter();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ROOM: ConversationId = ConversationId::new(42);

    fn msg(id: i64) -> ChatMessage {
        ChatMessage::with_id(id, ROOM, 7, format!("m{}", id))
    }

    fn ids(view: &MergedView) -> Vec<i64> {
        view.iter().filter_map(|m| m.message_id).collect()
    }

    #[tokio::test]
    async fn test_pages_merge_oldest_first() {
        let cache = MessageCache::default();
        let lease = cache.open(ROOM).await;

        let newest = MessagePage::new(vec![msg(3), msg(4)], true, Some(Cursor::from("c1")));
        assert_eq!(
            cache.apply_page(&lease, None, newest).await,
            ApplyOutcome::Adopted { added: 2 }
        );

        let older = MessagePage::new(vec![msg(1), msg(2)], false, None);
        let outcome = cache
            .apply_page(&lease, Some(&Cursor::from("c1")), older)
            .await;
        assert_eq!(outcome, ApplyOutcome::Appended { added: 2 });

        let view = cache.merged_view(ROOM).await;
        assert_eq!(ids(&view), vec![1, 2, 3, 4]);
        assert_eq!(view.len(), 4);
        assert_eq!(view.last().and_then(|m| m.message_id), Some(4));

        let pagination = cache.pagination(ROOM).await;
        assert!(pagination.history_loaded);
        assert!(!pagination.has_more);
        assert_eq!(pagination.pages, 2);
    }

    #[tokio::test]
    async fn test_same_cursor_applied_twice_is_duplicate() {
        let cache = MessageCache::default();
        let lease = cache.open(ROOM).await;
        let cursor = Cursor::from("c1");

        let newest = MessagePage::new(vec![msg(3)], true, Some(cursor.clone()));
        cache.apply_page(&lease, None, newest.clone()).await;
        assert_eq!(
            cache.apply_page(&lease, None, newest).await,
            ApplyOutcome::Duplicate
        );

        let older = MessagePage::new(vec![msg(1)], true, Some(Cursor::from("c2")));
        cache
            .apply_page(&lease, Some(&cursor), older.clone())
            .await;
        assert_eq!(
            cache.apply_page(&lease, Some(&cursor), older).await,
            ApplyOutcome::Duplicate
        );
        assert_eq!(ids(&cache.merged_view(ROOM).await), vec![1, 3]);
    }

    #[tokio::test]
    async fn test_out_of_order_page_is_rejected() {
        let cache = MessageCache::default();
        let lease = cache.open(ROOM).await;

        let early = MessagePage::new(vec![msg(1)], false, None);
        assert_eq!(
            cache
                .apply_page(&lease, Some(&Cursor::from("c1")), early.clone())
                .await,
            ApplyOutcome::Stale
        );

        let newest = MessagePage::new(vec![msg(5)], true, Some(Cursor::from("c1")));
        cache.apply_page(&lease, None, newest).await;
        assert_eq!(
            cache
                .apply_page(&lease, Some(&Cursor::from("c9")), early)
                .await,
            ApplyOutcome::Stale
        );
        assert_eq!(ids(&cache.merged_view(ROOM).await), vec![5]);
    }

    #[tokio::test]
    async fn test_live_messages_survive_newest_page() {
        let cache = MessageCache::default();
        assert!(cache.append_live(ROOM, msg(3)).await);
        assert!(cache.append_live(ROOM, msg(4)).await);
        assert!(!cache.append_live(ROOM, msg(4)).await);

        let lease = cache.open(ROOM).await;
        let newest = MessagePage::new(vec![msg(2), msg(3), msg(4)], true, Some(Cursor::from(2)));
        let outcome = cache.apply_page(&lease, None, newest).await;

        assert_eq!(outcome, ApplyOutcome::Adopted { added: 1 });
        assert_eq!(ids(&cache.merged_view(ROOM).await), vec![2, 3, 4]);
    }

    #[tokio::test]
    async fn test_newest_page_newer_than_live_message() {
        let cache = MessageCache::default();
        let lease = cache.open(ROOM).await;
        assert!(cache.append_live(ROOM, msg(5)).await);

        let newest = MessagePage::new(vec![msg(4), msg(5), msg(6)], false, None);
        let outcome = cache.apply_page(&lease, None, newest).await;
        assert_eq!(outcome, ApplyOutcome::Adopted { added: 2 });

        // The broker delivers m6 after the server already returned it
        assert!(!cache.append_live(ROOM, msg(6)).await);
        assert_eq!(ids(&cache.merged_view(ROOM).await), vec![4, 5, 6]);
    }

    #[tokio::test]
    async fn test_history_interleaves_with_live_run() {
        let cache = MessageCache::default();
        let lease = cache.open(ROOM).await;
        cache.append_live(ROOM, msg(5)).await;
        cache.append_live(ROOM, msg(7)).await;

        let newest = MessagePage::new(vec![msg(3), msg(6), msg(8)], false, None);
        cache.apply_page(&lease, None, newest).await;
        assert_eq!(ids(&cache.merged_view(ROOM).await), vec![3, 5, 6, 7, 8]);
    }

    #[tokio::test]
    async fn test_history_without_ids_orders_by_timestamp() {
        let at = |member: i64, body: &str, time: &str| {
            let mut message = ChatMessage::with_id(0, ROOM, member, body);
            message.message_id = None;
            message.created_at = Some(time.to_string());
            message
        };
        let cache = MessageCache::default();
        let lease = cache.open(ROOM).await;
        cache
            .append_live(ROOM, at(1, "live", "2025-11-13T17:00:05"))
            .await;

        let newest = MessagePage::new(
            vec![
                at(2, "before", "2025-11-13T17:00:01"),
                at(3, "after", "2025-11-13T17:00:09"),
            ],
            false,
            None,
        );
        cache.apply_page(&lease, None, newest).await;

        let bodies: Vec<String> = cache
            .merged_view(ROOM)
            .await
            .iter()
            .map(|m| m.message.clone())
            .collect();
        assert_eq!(bodies, vec!["before", "live", "after"]);
    }

    #[tokio::test]
    async fn test_repeated_cursor_ends_history() {
        let cache = MessageCache::default();
        let lease = cache.open(ROOM).await;
        let cursor = Cursor::from("c1");

        let newest = MessagePage::new(vec![msg(3)], true, Some(cursor.clone()));
        cache.apply_page(&lease, None, newest).await;
        assert!(cache.pagination(ROOM).await.has_more);

        let older = MessagePage::new(vec![msg(2)], true, Some(cursor.clone()));
        assert_eq!(
            cache.apply_page(&lease, Some(&cursor), older).await,
            ApplyOutcome::Appended { added: 1 }
        );
        assert!(!cache.pagination(ROOM).await.has_more);
    }

    #[tokio::test]
    async fn test_evict_keeps_observed_entry() {
        let cache = MessageCache::default();
        let lease = cache.open(ROOM).await;

        assert!(!cache.evict(ROOM).await);
        cache.append_live(ROOM, msg(9)).await;

        assert!(cache.is_current(&lease).await);
        let page = MessagePage::new(vec![msg(8)], false, None);
        assert!(cache.apply_page(&lease, None, page).await.is_applied());
        assert_eq!(ids(&cache.merged_view(ROOM).await), vec![8, 9]);

        cache.release(lease).await;
        assert!(cache.evict(ROOM).await);
        assert!(!cache.contains(ROOM).await);
    }

    #[tokio::test]
    async fn test_live_message_seeds_empty_cache() {
        let cache = MessageCache::default();
        assert!(!cache.contains(ROOM).await);

        assert!(cache.append_live(ROOM, msg(9)).await);
        let view = cache.merged_view(ROOM).await;
        assert_eq!(view.to_vec(), vec![msg(9)]);
        assert!(!cache.pagination(ROOM).await.history_loaded);
    }

    #[tokio::test]
    async fn test_misrouted_live_message_is_dropped() {
        let cache = MessageCache::default();
        let other = ChatMessage::with_id(1, ConversationId::new(99), 7, "wrong room");

        assert!(!cache.append_live(ROOM, other).await);
        assert!(!cache.contains(ROOM).await);
    }

    #[tokio::test]
    async fn test_snapshot_is_not_affected_by_later_appends() {
        let cache = MessageCache::default();
        cache.append_live(ROOM, msg(1)).await;
        let before = cache.merged_view(ROOM).await;

        cache.append_live(ROOM, msg(2)).await;
        let after = cache.merged_view(ROOM).await;

        assert_eq!(ids(&before), vec![1]);
        assert_eq!(ids(&after), vec![1, 2]);
        assert!(after.revision() > before.revision());

        // Views can be walked more than once
        assert_eq!((&after).into_iter().count(), 2);
        assert_eq!(after.iter().count(), 2);
    }

    #[tokio::test]
    async fn test_release_discards_in_flight_fetch() {
        let cache = MessageCache::default();
        let lease = cache.open(ROOM).await;
        assert!(cache.is_current(&lease).await);

        cache.release(lease.clone()).await;
        assert!(!cache.is_current(&lease).await);

        let page = MessagePage::new(vec![msg(1)], false, None);
        assert_eq!(
            cache.apply_page(&lease, None, page.clone()).await,
            ApplyOutcome::Stale
        );
        assert!(cache.merged_view(ROOM).await.is_empty());

        // A new view gets a working lease
        let lease = cache.open(ROOM).await;
        assert!(cache.apply_page(&lease, None, page).await.is_applied());
    }

    #[tokio::test]
    async fn test_shared_observers_keep_epoch() {
        let cache = MessageCache::default();
        let first = cache.open(ROOM).await;
        let second = cache.open(ROOM).await;
        assert_eq!(first.epoch(), second.epoch());
        assert_eq!(cache.observers(ROOM).await, 2);

        cache.release(first).await;
        assert!(cache.is_current(&second).await);
        cache.release(second).await;
        assert_eq!(cache.observers(ROOM).await, 0);
    }

    #[tokio::test]
    async fn test_lru_eviction_skips_observed_entries() {
        let cache = MessageCache::new(CacheConfig {
            max_conversations: 2,
            idle_ttl: DEFAULT_IDLE_TTL,
        });
        let observed = ConversationId::new(1);
        let idle = ConversationId::new(2);

        let _lease = cache.open(observed).await;
        cache
            .append_live(idle, ChatMessage::with_id(1, idle, 7, "hi"))
            .await;
        let third = ConversationId::new(3);
        cache
            .append_live(third, ChatMessage::with_id(2, third, 7, "hi"))
            .await;

        assert!(cache.contains(observed).await);
        assert!(!cache.contains(idle).await);
        assert!(cache.contains(third).await);
        assert_eq!(cache.len().await, 2);
    }

    #[tokio::test]
    async fn test_idle_entries_expire() {
        let cache = MessageCache::default();
        let lease = cache.open(ROOM).await;
        let other = ConversationId::new(5);
        cache
            .append_live(other, ChatMessage::with_id(1, other, 7, "hi"))
            .await;

        let later = Instant::now() + DEFAULT_IDLE_TTL + Duration::from_secs(1);
        assert_eq!(cache.evict_expired_at(later).await, 1);
        assert!(cache.contains(ROOM).await);

        cache.release(lease).await;
        assert_eq!(cache.evict_expired_at(later).await, 1);
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn test_updates_are_broadcast() {
        let cache = MessageCache::default();
        let mut updates = cache.updates();

        cache.append_live(ROOM, msg(1)).await;
        let update = updates.recv().await.unwrap();
        assert_eq!(update.conversation, ROOM);
        assert_eq!(update.revision, 1);

        assert!(cache.evict(ROOM).await);
        assert_eq!(updates.recv().await.unwrap().revision, 2);
    }
}
