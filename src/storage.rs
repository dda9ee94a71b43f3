//! Persistence seam for message history, read-sets and room membership
//!
//! The engine talks to durable storage only through [`MessageStore`]; the
//! in-process [`MemoryStore`] implements the same contract for tests and
//! single-node deployments. Participant tracking lives here too, because
//! notifications and unread counts must cover users who are offline.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::current_timestamp;
use crate::error::{ChatError, Result};
use crate::protocol::events::MessageId;

/// A persisted chat message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredMessage {
    /// Identifier, monotonically increasing within the room
    pub id: MessageId,
    /// Room the message belongs to
    pub room: String,
    /// Sender username
    pub sender: String,
    /// Message text
    pub content: String,
    /// Creation timestamp (Unix ms), non-decreasing in id order
    pub timestamp: u64,
    /// Users who have read the message; always contains the sender
    pub read_by: HashSet<String>,
    /// Soft-delete flag; deleted messages stay in the log
    pub deleted: bool,
}

/// Durable append + query interface the engine relies on
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Append a message to a room, assigning the next identifier. The
    /// sender is recorded as having read their own message.
    async fn append_message(&self, room: &str, sender: &str, content: &str)
        -> Result<StoredMessage>;

    /// Add `user` to a message's read-set. Returns true if the user was
    /// newly added; re-marking is a no-op. Unknown ids are ignored.
    async fn mark_read(&self, room: &str, message_id: MessageId, user: &str) -> Result<bool>;

    /// Messages in the room with id greater than `since_id` (all of them
    /// when `None`), in id order. Soft-deleted messages are skipped.
    async fn query_history(
        &self,
        room: &str,
        since_id: Option<MessageId>,
    ) -> Result<Vec<StoredMessage>>;

    /// Ids of messages up to and including `up_to` that `user` has not
    /// read, excluding messages they sent themselves.
    async fn unread_ids(&self, room: &str, user: &str, up_to: MessageId) -> Result<Vec<MessageId>>;

    /// The read-set of a message, or `None` if the id is unknown
    async fn read_set(&self, room: &str, message_id: MessageId)
        -> Result<Option<HashSet<String>>>;

    /// Register `user` as a participant of the room; idempotent
    async fn join_room(&self, room: &str, user: &str) -> Result<()>;

    /// All registered participants of the room
    async fn participants(&self, room: &str) -> Result<Vec<String>>;

    /// Highest assigned message id in the room, 0 when empty
    async fn latest_id(&self, room: &str) -> Result<MessageId>;
}

#[derive(Default)]
struct MemoryInner {
    messages: HashMap<String, Vec<StoredMessage>>,
    participants: HashMap<String, Vec<String>>,
}

/// In-memory message store
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MemoryInner {
    fn message_mut(&mut self, room: &str, id: MessageId) -> Option<&mut StoredMessage> {
        if id == 0 {
            return None;
        }
        self.messages
            .get_mut(room)
            .and_then(|msgs| msgs.get_mut((id - 1) as usize))
            .filter(|m| m.id == id)
    }
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn append_message(
        &self,
        room: &str,
        sender: &str,
        content: &str,
    ) -> Result<StoredMessage> {
        if room.is_empty() {
            return Err(ChatError::persistence("empty room name"));
        }
        let mut inner = self.inner.write().await;
        let msgs = inner.messages.entry(room.to_string()).or_default();

        let id = msgs.len() as MessageId + 1;
        // Clamp so timestamps never decrease in id order even if the
        // system clock steps backwards.
        let timestamp = msgs
            .last()
            .map(|m| m.timestamp.max(current_timestamp()))
            .unwrap_or_else(current_timestamp);

        let mut read_by = HashSet::new();
        read_by.insert(sender.to_string());

        let msg = StoredMessage {
            id,
            room: room.to_string(),
            sender: sender.to_string(),
            content: content.to_string(),
            timestamp,
            read_by,
            deleted: false,
        };
        msgs.push(msg.clone());
        Ok(msg)
    }

    async fn mark_read(&self, room: &str, message_id: MessageId, user: &str) -> Result<bool> {
        let mut inner = self.inner.write().await;
        match inner.message_mut(room, message_id) {
            Some(msg) => Ok(msg.read_by.insert(user.to_string())),
            None => Ok(false),
        }
    }

    async fn query_history(
        &self,
        room: &str,
        since_id: Option<MessageId>,
    ) -> Result<Vec<StoredMessage>> {
        let inner = self.inner.read().await;
        let since = since_id.unwrap_or(0);
        Ok(inner
            .messages
            .get(room)
            .map(|msgs| {
                msgs.iter()
                    .filter(|m| m.id > since && !m.deleted)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn unread_ids(&self, room: &str, user: &str, up_to: MessageId) -> Result<Vec<MessageId>> {
        let inner = self.inner.read().await;
        Ok(inner
            .messages
            .get(room)
            .map(|msgs| {
                msgs.iter()
                    .filter(|m| {
                        m.id <= up_to && !m.deleted && m.sender != user && !m.read_by.contains(user)
                    })
                    .map(|m| m.id)
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn read_set(
        &self,
        room: &str,
        message_id: MessageId,
    ) -> Result<Option<HashSet<String>>> {
        let inner = self.inner.read().await;
        if message_id == 0 {
            return Ok(None);
        }
        Ok(inner
            .messages
            .get(room)
            .and_then(|msgs| msgs.get((message_id - 1) as usize))
            .filter(|m| m.id == message_id)
            .map(|m| m.read_by.clone()))
    }

    async fn join_room(&self, room: &str, user: &str) -> Result<()> {
        let mut inner = self.inner.write().await;
        let members = inner.participants.entry(room.to_string()).or_default();
        if !members.iter().any(|m| m == user) {
            members.push(user.to_string());
        }
        Ok(())
    }

    async fn participants(&self, room: &str) -> Result<Vec<String>> {
        let inner = self.inner.read().await;
        Ok(inner.participants.get(room).cloned().unwrap_or_default())
    }

    async fn latest_id(&self, room: &str) -> Result<MessageId> {
        let inner = self.inner.read().await;
        Ok(inner
            .messages
            .get(room)
            .and_then(|msgs| msgs.last())
            .map(|m| m.id)
            .unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_append_assigns_monotonic_ids() {
        let store = MemoryStore::new();

        let first = store.append_message("general", "alice", "one").await.unwrap();
        let second = store.append_message("general", "bob", "two").await.unwrap();
        let other = store.append_message("random", "alice", "hi").await.unwrap();

        assert_eq!(first.id, 1);
        assert_eq!(second.id, 2);
        assert_eq!(other.id, 1); // ids are per-room
        assert!(second.timestamp >= first.timestamp);
        assert_eq!(store.latest_id("general").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_sender_in_read_set() {
        let store = MemoryStore::new();
        let msg = store.append_message("general", "alice", "hi").await.unwrap();
        assert!(msg.read_by.contains("alice"));
        assert_eq!(msg.read_by.len(), 1);
    }

    #[tokio::test]
    async fn test_mark_read_idempotent() {
        let store = MemoryStore::new();
        let msg = store.append_message("general", "alice", "hi").await.unwrap();

        assert!(store.mark_read("general", msg.id, "bob").await.unwrap());
        assert!(!store.mark_read("general", msg.id, "bob").await.unwrap());

        // Sender was already in the read-set
        assert!(!store.mark_read("general", msg.id, "alice").await.unwrap());

        // Unknown ids are ignored
        assert!(!store.mark_read("general", 999, "bob").await.unwrap());
    }

    #[tokio::test]
    async fn test_query_history_since() {
        let store = MemoryStore::new();
        for text in ["one", "two", "three"] {
            store.append_message("general", "alice", text).await.unwrap();
        }

        let all = store.query_history("general", None).await.unwrap();
        assert_eq!(all.len(), 3);

        let tail = store.query_history("general", Some(2)).await.unwrap();
        assert_eq!(tail.len(), 1);
        assert_eq!(tail[0].content, "three");

        let empty = store.query_history("missing", None).await.unwrap();
        assert!(empty.is_empty());
    }

    #[tokio::test]
    async fn test_unread_ids_excludes_own_messages() {
        let store = MemoryStore::new();
        store.append_message("general", "alice", "one").await.unwrap();
        store.append_message("general", "bob", "two").await.unwrap();
        store.append_message("general", "alice", "three").await.unwrap();

        // Bob has not read alice's two messages
        assert_eq!(store.unread_ids("general", "bob", 3).await.unwrap(), vec![1, 3]);

        // The watermark bounds the scan
        assert_eq!(store.unread_ids("general", "bob", 1).await.unwrap(), vec![1]);

        store.mark_read("general", 1, "bob").await.unwrap();
        assert_eq!(store.unread_ids("general", "bob", 3).await.unwrap(), vec![3]);
    }

    #[tokio::test]
    async fn test_participants_idempotent() {
        let store = MemoryStore::new();
        store.join_room("general", "alice").await.unwrap();
        store.join_room("general", "alice").await.unwrap();
        store.join_room("general", "bob").await.unwrap();

        let members = store.participants("general").await.unwrap();
        assert_eq!(members, vec!["alice", "bob"]);
    }
}
