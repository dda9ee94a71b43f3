//! Presence registry: who is connected, and which rooms they are viewing
//!
//! The single source of truth for online status. Every live (user, room)
//! view is one entry; a user with two tabs on the same room holds two
//! entries. Mutated only on connect/disconnect.

use std::collections::{HashMap, HashSet};

use tokio::sync::RwLock;
use uuid::Uuid;

/// Handle identifying one live (user, room) view
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionHandle {
    /// Connection identifier
    pub conn_id: Uuid,
    /// Owning user
    pub user: String,
    /// Subscribed room
    pub room: String,
}

/// Which presence edges a connect crossed
#[derive(Debug, Clone, Copy)]
pub struct Arrival {
    /// First live view of this room by this user
    pub first_view: bool,
    /// The user had no live connections at all before this one
    pub came_online: bool,
}

/// Which presence edges a disconnect crossed
#[derive(Debug, Clone, Copy)]
pub struct Departure {
    /// The handle matched a live entry and was removed; false on a
    /// redundant disconnect
    pub removed: bool,
    /// No remaining views of the room by this user
    pub last_view: bool,
    /// No remaining connections at all for this user
    pub went_offline: bool,
}

#[derive(Default)]
struct PresenceInner {
    /// Connection id -> (user, room)
    conns: HashMap<Uuid, (String, String)>,
    /// User -> room -> live view count
    views: HashMap<String, HashMap<String, usize>>,
}

/// Registry of live connections
#[derive(Default)]
pub struct PresenceRegistry {
    inner: RwLock<PresenceInner>,
}

impl PresenceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a live view. Concurrent connects from the same user to
    /// different rooms are independent and both succeed.
    pub async fn connect(&self, user: &str, room: &str) -> (ConnectionHandle, Arrival) {
        let mut inner = self.inner.write().await;

        let came_online = !inner.views.contains_key(user);
        let rooms = inner.views.entry(user.to_string()).or_default();
        let count = rooms.entry(room.to_string()).or_insert(0);
        let first_view = *count == 0;
        *count += 1;

        let handle = ConnectionHandle {
            conn_id: Uuid::new_v4(),
            user: user.to_string(),
            room: room.to_string(),
        };
        inner
            .conns
            .insert(handle.conn_id, (user.to_string(), room.to_string()));

        (
            handle,
            Arrival {
                first_view,
                came_online,
            },
        )
    }

    /// Remove the entry matching the handle. Idempotent: disconnecting an
    /// already-removed handle reports `removed: false` and changes
    /// nothing, so racing teardown paths are safe.
    pub async fn disconnect(&self, handle: &ConnectionHandle) -> Departure {
        let mut inner = self.inner.write().await;

        let Some((user, room)) = inner.conns.remove(&handle.conn_id) else {
            return Departure {
                removed: false,
                last_view: false,
                went_offline: false,
            };
        };

        let mut last_view = false;
        let mut went_offline = false;
        if let Some(rooms) = inner.views.get_mut(&user) {
            if let Some(count) = rooms.get_mut(&room) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    rooms.remove(&room);
                    last_view = true;
                }
            }
            if rooms.is_empty() {
                inner.views.remove(&user);
                went_offline = true;
            }
        }

        Departure {
            removed: true,
            last_view,
            went_offline,
        }
    }

    /// Whether the user currently has a live view of the room
    pub async fn is_viewing(&self, user: &str, room: &str) -> bool {
        let inner = self.inner.read().await;
        inner
            .views
            .get(user)
            .map(|rooms| rooms.contains_key(room))
            .unwrap_or(false)
    }

    /// All users with at least one live connection
    pub async fn online_users(&self) -> HashSet<String> {
        let inner = self.inner.read().await;
        inner.views.keys().cloned().collect()
    }

    /// Number of live connections
    pub async fn connection_count(&self) -> usize {
        let inner = self.inner.read().await;
        inner.conns.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_disconnect() {
        let registry = PresenceRegistry::new();

        let (handle, arrival) = registry.connect("alice", "general").await;
        assert!(arrival.first_view);
        assert!(arrival.came_online);
        assert!(registry.is_viewing("alice", "general").await);
        assert!(registry.online_users().await.contains("alice"));

        let departure = registry.disconnect(&handle).await;
        assert!(departure.removed);
        assert!(departure.last_view);
        assert!(departure.went_offline);
        assert!(!registry.is_viewing("alice", "general").await);
        assert!(registry.online_users().await.is_empty());
    }

    #[tokio::test]
    async fn test_disconnect_idempotent() {
        let registry = PresenceRegistry::new();
        let (handle, _) = registry.connect("alice", "general").await;

        assert!(registry.disconnect(&handle).await.removed);

        let again = registry.disconnect(&handle).await;
        assert!(!again.removed);
        assert!(!again.last_view);
        assert!(!again.went_offline);
    }

    #[tokio::test]
    async fn test_two_tabs_same_room() {
        let registry = PresenceRegistry::new();

        let (first, a1) = registry.connect("alice", "general").await;
        let (second, a2) = registry.connect("alice", "general").await;
        assert!(a1.first_view);
        assert!(!a2.first_view);
        assert!(!a2.came_online);
        assert_eq!(registry.connection_count().await, 2);

        // Closing one tab keeps the user viewing the room
        let departure = registry.disconnect(&first).await;
        assert!(departure.removed);
        assert!(!departure.last_view);
        assert!(registry.is_viewing("alice", "general").await);

        let departure = registry.disconnect(&second).await;
        assert!(departure.last_view);
        assert!(departure.went_offline);
    }

    #[tokio::test]
    async fn test_multiple_rooms_independent() {
        let registry = PresenceRegistry::new();

        let (general, _) = registry.connect("alice", "general").await;
        let (_lobby, arrival) = registry.connect("alice", "lobby").await;
        assert!(arrival.first_view);
        assert!(!arrival.came_online);

        let departure = registry.disconnect(&general).await;
        assert!(departure.last_view);
        assert!(!departure.went_offline);
        assert!(!registry.is_viewing("alice", "general").await);
        assert!(registry.is_viewing("alice", "lobby").await);
    }
}
