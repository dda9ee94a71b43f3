//! Read-state reconciliation across viewers of a room
//!
//! Read-sets in the store are the authoritative data; the per-(user, room)
//! unread counters kept here are an incrementally maintained cache over
//! them and can always be recomputed from the store to correct drift.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::error::Result;
use crate::protocol::events::MessageId;
use crate::storage::MessageStore;

/// Delivery indicator derived from a message's read-set
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickState {
    /// Only the sender has the message in their read-set (single tick)
    Sent,
    /// At least one recipient has read it (double tick)
    Seen,
}

/// Tracks per-message read status and per-user unread counts
pub struct ReadStateReconciler {
    store: Arc<dyn MessageStore>,
    /// (user, room) -> unread message count
    unread: RwLock<HashMap<(String, String), u64>>,
}

impl ReadStateReconciler {
    pub fn new(store: Arc<dyn MessageStore>) -> Self {
        Self {
            store,
            unread: RwLock::new(HashMap::new()),
        }
    }

    /// Add `user` to a message's read-set. Returns true only when the
    /// message was newly read; re-marking is a no-op and must not cause
    /// another fan-out.
    pub async fn mark_read(&self, user: &str, room: &str, message_id: MessageId) -> Result<bool> {
        let newly = self.store.mark_read(room, message_id, user).await?;
        if newly {
            self.decrement(user, room, 1).await;
        }
        Ok(newly)
    }

    /// Catch `user` up on everything in the room up to and including
    /// `up_to`. Returns the ids newly marked read; the caller emits one
    /// `bulk_read` covering the whole delta instead of per-message
    /// receipts. The user's own messages are never part of the delta.
    pub async fn mark_all_read_up_to(
        &self,
        user: &str,
        room: &str,
        up_to: MessageId,
    ) -> Result<Vec<MessageId>> {
        let candidates = self.store.unread_ids(room, user, up_to).await?;
        let mut newly = Vec::with_capacity(candidates.len());
        for id in candidates {
            if self.store.mark_read(room, id, user).await? {
                newly.push(id);
            }
        }
        if !newly.is_empty() {
            self.decrement(user, room, newly.len() as u64).await;
        }
        Ok(newly)
    }

    /// Current unread count from the incremental cache
    pub async fn unread_count(&self, user: &str, room: &str) -> u64 {
        let unread = self.unread.read().await;
        unread
            .get(&(user.to_string(), room.to_string()))
            .copied()
            .unwrap_or(0)
    }

    /// Recompute the unread count from the store's read-sets and repair
    /// the cache with the result.
    pub async fn recompute_unread(&self, user: &str, room: &str) -> Result<u64> {
        let latest = self.store.latest_id(room).await?;
        let count = self.store.unread_ids(room, user, latest).await?.len() as u64;
        let mut unread = self.unread.write().await;
        unread.insert((user.to_string(), room.to_string()), count);
        Ok(count)
    }

    /// Bump unread counters after a message lands: one for every
    /// participant except the sender.
    pub async fn note_published(&self, room: &str, sender: &str, participants: &[String]) {
        let mut unread = self.unread.write().await;
        for user in participants {
            if user == sender {
                continue;
            }
            *unread
                .entry((user.clone(), room.to_string()))
                .or_insert(0) += 1;
        }
    }

    /// Delivery-indicator state for a message, or `None` for unknown ids.
    /// The sender reads their own message at send time, so a read-set of
    /// size one means nobody else has seen it yet; the double tick
    /// requires size two or more.
    pub async fn tick_state(&self, room: &str, message_id: MessageId) -> Result<Option<TickState>> {
        let read_set = self.store.read_set(room, message_id).await?;
        Ok(read_set.map(|set| {
            if set.len() >= 2 {
                TickState::Seen
            } else {
                TickState::Sent
            }
        }))
    }

    async fn decrement(&self, user: &str, room: &str, by: u64) {
        let mut unread = self.unread.write().await;
        if let Some(count) = unread.get_mut(&(user.to_string(), room.to_string())) {
            *count = count.saturating_sub(by);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;

    fn reconciler() -> (ReadStateReconciler, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        (ReadStateReconciler::new(store.clone()), store)
    }

    #[tokio::test]
    async fn test_mark_read_idempotent() {
        let (reconciler, store) = reconciler();
        let msg = store.append_message("general", "alice", "hi").await.unwrap();
        reconciler
            .note_published("general", "alice", &["alice".into(), "bob".into()])
            .await;
        assert_eq!(reconciler.unread_count("bob", "general").await, 1);

        assert!(reconciler.mark_read("bob", "general", msg.id).await.unwrap());
        assert_eq!(reconciler.unread_count("bob", "general").await, 0);

        // Re-marking reports nothing new and cannot drive the count negative
        assert!(!reconciler.mark_read("bob", "general", msg.id).await.unwrap());
        assert_eq!(reconciler.unread_count("bob", "general").await, 0);
    }

    #[tokio::test]
    async fn test_sender_read_is_not_new() {
        let (reconciler, store) = reconciler();
        let msg = store.append_message("general", "alice", "hi").await.unwrap();

        // The sender was added to the read-set at append time
        assert!(!reconciler.mark_read("alice", "general", msg.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_mark_all_read_up_to_watermark() {
        let (reconciler, store) = reconciler();
        for text in ["one", "two", "three"] {
            store.append_message("general", "alice", text).await.unwrap();
        }
        reconciler
            .note_published("general", "alice", &["bob".into()])
            .await;
        reconciler
            .note_published("general", "alice", &["bob".into()])
            .await;
        reconciler
            .note_published("general", "alice", &["bob".into()])
            .await;

        let newly = reconciler
            .mark_all_read_up_to("bob", "general", 2)
            .await
            .unwrap();
        assert_eq!(newly, vec![1, 2]);

        // Everything at or below the watermark is read, above is untouched
        assert_eq!(reconciler.unread_count("bob", "general").await, 1);
        assert_eq!(
            store.unread_ids("general", "bob", 3).await.unwrap(),
            vec![3]
        );

        // Catching up again finds nothing new
        let again = reconciler
            .mark_all_read_up_to("bob", "general", 2)
            .await
            .unwrap();
        assert!(again.is_empty());
    }

    #[tokio::test]
    async fn test_tick_state_threshold() {
        let (reconciler, store) = reconciler();
        let msg = store.append_message("general", "alice", "hi").await.unwrap();

        // Read-set of one (the sender alone) is a single tick
        assert_eq!(
            reconciler.tick_state("general", msg.id).await.unwrap(),
            Some(TickState::Sent)
        );

        reconciler.mark_read("bob", "general", msg.id).await.unwrap();
        assert_eq!(
            reconciler.tick_state("general", msg.id).await.unwrap(),
            Some(TickState::Seen)
        );

        assert_eq!(reconciler.tick_state("general", 99).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_recompute_repairs_drift() {
        let (reconciler, store) = reconciler();
        store.append_message("general", "alice", "one").await.unwrap();
        store.append_message("general", "alice", "two").await.unwrap();

        // Counter was never incremented (e.g. messages predate this
        // process); the cache starts out wrong.
        assert_eq!(reconciler.unread_count("bob", "general").await, 0);

        assert_eq!(reconciler.recompute_unread("bob", "general").await.unwrap(), 2);
        assert_eq!(reconciler.unread_count("bob", "general").await, 2);
    }
}
