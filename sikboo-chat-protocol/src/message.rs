//! Chat Data Model
//!
//! Wire types shared by the live transport and the HTTP history endpoints.
//!
//! ## Message Shape
//!
//! ```json
//! {
//!     "messageId": 1024,
//!     "groupBuyingId": 42,
//!     "memberId": 7,
//!     "memberName": "Jiwoo",
//!     "message": "I can pick up the onions at 6",
//!     "createdAt": "2025-11-13T17:00:00"
//! }
//! ```
//!
//! Some payloads carry `senderId` instead of `memberId`, `id` instead of
//! `messageId`, or `timestamp` instead of `createdAt`; all are accepted.
//! Numeric ids may arrive as JSON strings.
//!
//! ## History Page Shape
//!
//! ```json
//! {
//!     "messages": [ ... oldest first ... ],
//!     "hasMore": true,
//!     "nextCursor": 981,
//!     "size": 50
//! }
//! ```

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// Topic prefix for per-conversation live feeds
pub const TOPIC_PREFIX: &str = "/topic/groupbuying/";

/// Destination for publishing chat messages over the live transport
pub const SEND_DESTINATION: &str = "/app/chat.send";

/// Identifier of a conversation (the group-buying id it belongs to)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationId(i64);

impl ConversationId {
    pub const fn new(id: i64) -> Self {
        Self(id)
    }

    pub const fn get(&self) -> i64 {
        self.0
    }

    /// Subscribe destination for this conversation's live feed
    pub fn topic(&self) -> String {
        format!("{}{}", TOPIC_PREFIX, self.0)
    }
}

impl From<i64> for ConversationId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ConversationId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse::<i64>().map(Self)
    }
}

/// A single chat message
///
/// Immutable once received. The server-assigned `message_id` doubles as the
/// ordering key inside a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    /// Server-assigned id (monotonic per backend)
    #[serde(
        default,
        alias = "id",
        deserialize_with = "deserialize_opt_id",
        skip_serializing_if = "Option::is_none"
    )]
    pub message_id: Option<i64>,

    /// Conversation this message belongs to
    #[serde(deserialize_with = "deserialize_id")]
    pub group_buying_id: i64,

    /// Sender
    #[serde(alias = "senderId", deserialize_with = "deserialize_id")]
    pub member_id: i64,

    /// Sender display name, denormalized by the server
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub member_name: Option<String>,

    /// Body text
    pub message: String,

    /// Server timestamp, kept verbatim
    #[serde(
        default,
        alias = "timestamp",
        deserialize_with = "deserialize_opt_timestamp",
        skip_serializing_if = "Option::is_none"
    )]
    pub created_at: Option<String>,
}

impl ChatMessage {
    /// Create a message with an explicit server id
    pub fn with_id(
        message_id: i64,
        conversation: ConversationId,
        member_id: i64,
        message: impl Into<String>,
    ) -> Self {
        Self {
            message_id: Some(message_id),
            group_buying_id: conversation.get(),
            member_id,
            member_name: None,
            message: message.into(),
            created_at: None,
        }
    }

    pub fn conversation(&self) -> ConversationId {
        ConversationId(self.group_buying_id)
    }

    /// Identity used to deduplicate messages seen through both history and the live feed
    pub fn key(&self) -> MessageKey {
        match self.message_id {
            Some(id) => MessageKey::Id(id),
            None => MessageKey::Content {
                member_id: self.member_id,
                created_at: self.created_at.clone(),
                body: self.message.clone(),
            },
        }
    }

    /// Parse `created_at` into a naive local timestamp
    ///
    /// Accepts RFC 3339 (`2025-11-13T17:00:00+09:00`), the server's naive
    /// `LocalDateTime` form (`2025-11-13T17:00:00.123`) and epoch milliseconds.
    pub fn sent_at(&self) -> Option<NaiveDateTime> {
        let raw = self.created_at.as_deref()?.trim();

        if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
            return Some(dt.naive_local());
        }
        if let Ok(dt) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f") {
            return Some(dt);
        }
        raw.parse::<i64>()
            .ok()
            .and_then(DateTime::<Utc>::from_timestamp_millis)
            .map(|dt| dt.naive_utc())
    }
}

/// Message identity
///
/// Server ids are authoritative. Messages without one fall back to a content
/// fingerprint, which cannot tell apart two identical bodies sent by the same
/// member with the same timestamp.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MessageKey {
    Id(i64),
    Content {
        member_id: i64,
        created_at: Option<String>,
        body: String,
    },
}

/// Opaque pagination token pointing at the next older page
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Cursor(String);

impl Cursor {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<i64> for Cursor {
    fn from(value: i64) -> Self {
        Self(value.to_string())
    }
}

impl From<&str> for Cursor {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl Serialize for Cursor {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for Cursor {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        use serde::de::Error;

        match Value::deserialize(deserializer)? {
            Value::String(s) => Ok(Cursor(s)),
            Value::Number(n) => Ok(Cursor(n.to_string())),
            _ => Err(Error::custom("cursor must be a number or string")),
        }
    }
}

/// One page of history as returned by the paginated endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePage {
    /// Messages in this page, oldest first
    #[serde(default)]
    pub messages: Vec<ChatMessage>,

    /// Whether older history exists
    #[serde(default)]
    pub has_more: bool,

    /// Cursor for the next older page
    #[serde(default)]
    pub next_cursor: Option<Cursor>,

    /// Number of messages the server put in this page
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<usize>,
}

impl MessagePage {
    pub fn new(messages: Vec<ChatMessage>, has_more: bool, next_cursor: Option<Cursor>) -> Self {
        let size = Some(messages.len());
        Self {
            messages,
            has_more,
            next_cursor,
            size,
        }
    }

    /// Cursor the loader should use next, `None` when history is exhausted
    pub fn continuation(&self) -> Option<&Cursor> {
        if self.has_more {
            self.next_cursor.as_ref()
        } else {
            None
        }
    }
}

/// Body for `/app/chat.send` and `POST /chat/messages`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendRequest {
    pub group_buying_id: i64,
    pub member_id: i64,
    pub message: String,
}

impl SendRequest {
    pub fn new(conversation: ConversationId, member_id: i64, message: impl Into<String>) -> Self {
        Self {
            group_buying_id: conversation.get(),
            member_id,
            message: message.into(),
        }
    }
}

/// Count endpoint response, either a bare number or `{ "count": n }`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum MessageCount {
    Bare(u64),
    Wrapped { count: u64 },
}

impl MessageCount {
    pub fn value(&self) -> u64 {
        match self {
            MessageCount::Bare(count) | MessageCount::Wrapped { count } => *count,
        }
    }
}

fn value_to_id<E: serde::de::Error>(value: Value) -> Result<i64, E> {
    match value {
        Value::Number(n) => n.as_i64().ok_or_else(|| E::custom("Invalid number for id")),
        Value::String(s) => s
            .trim()
            .parse::<i64>()
            .map_err(|_| E::custom("Invalid string for id")),
        _ => Err(E::custom("id must be a number or string")),
    }
}

/// Accepts ids sent either as numbers or numeric strings
fn deserialize_id<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    value_to_id(Value::deserialize(deserializer)?)
}

fn deserialize_opt_id<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::Null => Ok(None),
        other => value_to_id(other).map(Some),
    }
}

/// Timestamps are kept as text; epoch numbers are stringified
fn deserialize_opt_timestamp<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error;

    match Value::deserialize(deserializer)? {
        Value::Null => Ok(None),
        Value::String(s) => Ok(Some(s)),
        Value::Number(n) => Ok(Some(n.to_string())),
        _ => Err(Error::custom("timestamp must be a string or number")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_conversation_topic() {
        let id = ConversationId::new(42);
        assert_eq!(id.topic(), "/topic/groupbuying/42");
        assert_eq!(id.to_string(), "42");
        assert_eq!(" 42 ".parse::<ConversationId>().unwrap(), id);
    }

    #[test]
    fn test_message_deserialization() {
        let message: ChatMessage = serde_json::from_value(json!({
            "messageId": 7,
            "groupBuyingId": 42,
            "memberId": 3,
            "memberName": "Minji",
            "message": "hello",
            "createdAt": "2025-11-13T17:00:00"
        }))
        .unwrap();

        assert_eq!(message.message_id, Some(7));
        assert_eq!(message.conversation(), ConversationId::new(42));
        assert_eq!(message.member_name.as_deref(), Some("Minji"));
        assert_eq!(message.key(), MessageKey::Id(7));
    }

    #[test]
    fn test_message_aliases_and_string_ids() {
        let message: ChatMessage = serde_json::from_value(json!({
            "id": "11",
            "groupBuyingId": "42",
            "senderId": 9,
            "message": "on my way",
            "timestamp": 1763020800000i64
        }))
        .unwrap();

        assert_eq!(message.message_id, Some(11));
        assert_eq!(message.group_buying_id, 42);
        assert_eq!(message.member_id, 9);
        assert_eq!(message.created_at.as_deref(), Some("1763020800000"));
        assert!(message.sent_at().is_some());
    }

    #[test]
    fn test_message_without_id_uses_content_key() {
        let message: ChatMessage = serde_json::from_value(json!({
            "groupBuyingId": 42,
            "memberId": 3,
            "message": "hi"
        }))
        .unwrap();

        assert_eq!(message.message_id, None);
        assert_eq!(
            message.key(),
            MessageKey::Content {
                member_id: 3,
                created_at: None,
                body: "hi".to_string()
            }
        );
    }

    #[test]
    fn test_sent_at_formats() {
        let mut message = ChatMessage::with_id(1, ConversationId::new(1), 1, "x");

        message.created_at = Some("2025-11-13T17:00:00+09:00".to_string());
        let parsed = message.sent_at().unwrap();
        assert_eq!(parsed.to_string(), "2025-11-13 17:00:00");

        message.created_at = Some("2025-11-13T17:00:00.250".to_string());
        assert!(message.sent_at().is_some());

        message.created_at = Some("yesterday".to_string());
        assert!(message.sent_at().is_none());
    }

    #[test]
    fn test_page_deserialization() {
        let page: MessagePage = serde_json::from_value(json!({
            "messages": [
                { "messageId": 1, "groupBuyingId": 42, "memberId": 1, "message": "a" },
                { "messageId": 2, "groupBuyingId": 42, "memberId": 2, "message": "b" }
            ],
            "hasMore": true,
            "nextCursor": 1,
            "size": 2
        }))
        .unwrap();

        assert_eq!(page.messages.len(), 2);
        assert_eq!(page.next_cursor, Some(Cursor::from(1)));
        assert_eq!(page.continuation().map(Cursor::as_str), Some("1"));
    }

    #[test]
    fn test_last_page_has_no_continuation() {
        let page: MessagePage = serde_json::from_value(json!({
            "messages": [],
            "hasMore": false,
            "nextCursor": null
        }))
        .unwrap();

        assert!(page.continuation().is_none());
        assert_eq!(page.size, None);
    }

    #[test]
    fn test_send_request_wire_shape() {
        let request = SendRequest::new(ConversationId::new(42), 7, "see you");
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(
            value,
            json!({ "groupBuyingId": 42, "memberId": 7, "message": "see you" })
        );
    }

    #[test]
    fn test_message_count_shapes() {
        let bare: MessageCount = serde_json::from_str("12").unwrap();
        let wrapped: MessageCount = serde_json::from_str(r#"{"count": 12}"#).unwrap();
        assert_eq!(bare.value(), 12);
        assert_eq!(wrapped.value(), 12);
    }
}
