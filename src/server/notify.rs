//! Lobby notifications for users not currently viewing a room
//!
//! Turns a published message into unread-badge updates. A notification
//! carries who sent it and which conversation it belongs to, never the
//! message content.

use std::sync::Arc;

use tracing::debug;

use crate::protocol::events::{room_kind, RoomKind, ServerEvent, LOBBY_ROOM};
use crate::server::presence::PresenceRegistry;
use crate::server::router::{Delivery, RoomRouter};

/// Dispatches lobby badge updates when messages are published
pub struct NotificationDispatcher {
    presence: Arc<PresenceRegistry>,
    router: Arc<RoomRouter>,
}

impl NotificationDispatcher {
    pub fn new(presence: Arc<PresenceRegistry>, router: Arc<RoomRouter>) -> Self {
        Self { presence, router }
    }

    /// Notify everyone who should see an unread badge for this message:
    /// the room's participants, minus the sender, minus anyone currently
    /// viewing the room. Each eligible user is addressed on their own
    /// lobby subscriptions only; users without a live lobby view simply
    /// accrue unread state.
    pub async fn on_message_published(
        &self,
        room: &str,
        sender: &str,
        participants: &[String],
    ) -> Delivery {
        let kind = room_kind(room);
        let mut total = Delivery::default();
        if kind == RoomKind::Lobby {
            return total;
        }

        for user in participants {
            if user == sender {
                continue;
            }
            if self.presence.is_viewing(user, room).await {
                continue;
            }
            let event = match kind {
                RoomKind::Private => ServerEvent::Notification {
                    sender: sender.to_string(),
                    target_user: Some(user.clone()),
                    room_name: None,
                    room_type: RoomKind::Private.as_str().to_string(),
                },
                _ => ServerEvent::Notification {
                    sender: sender.to_string(),
                    target_user: None,
                    room_name: Some(room.to_string()),
                    room_type: RoomKind::Group.as_str().to_string(),
                },
            };
            let delivery = self.router.publish_to_user(LOBBY_ROOM, user, event).await;
            total.delivered += delivery.delivered;
            total.dropped.extend(delivery.dropped);
        }
        debug!(
            "notified {} lobby connections about a message in {}",
            total.delivered, room
        );
        total
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::events::private_room_name;
    use crate::server::router::Subscriber;
    use tokio::sync::{mpsc, watch};
    use uuid::Uuid;

    use crate::server::presence::ConnectionHandle;

    async fn lobby_subscriber(
        router: &RoomRouter,
        user: &str,
    ) -> mpsc::Receiver<ServerEvent> {
        let (tx, rx) = mpsc::channel(8);
        let (kill, _) = watch::channel(false);
        router
            .subscribe(Subscriber {
                handle: ConnectionHandle {
                    conn_id: Uuid::new_v4(),
                    user: user.to_string(),
                    room: LOBBY_ROOM.to_string(),
                },
                tx,
                kill: Arc::new(kill),
            })
            .await;
        rx
    }

    #[tokio::test]
    async fn test_group_notification_carries_room_name() {
        let presence = Arc::new(PresenceRegistry::new());
        let router = Arc::new(RoomRouter::new());
        let dispatcher = NotificationDispatcher::new(presence.clone(), router.clone());

        let mut job_lobby = lobby_subscriber(&router, "job").await;
        let participants = vec!["charlie".to_string(), "job".to_string()];

        let delivery = dispatcher
            .on_message_published("general", "charlie", &participants)
            .await;
        assert_eq!(delivery.delivered, 1);

        match job_lobby.try_recv().unwrap() {
            ServerEvent::Notification {
                sender,
                target_user,
                room_name,
                room_type,
            } => {
                assert_eq!(sender, "charlie");
                assert_eq!(target_user, None);
                assert_eq!(room_name.as_deref(), Some("general"));
                assert_eq!(room_type, "group");
            }
            other => panic!("expected notification, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_private_notification_carries_target_user() {
        let presence = Arc::new(PresenceRegistry::new());
        let router = Arc::new(RoomRouter::new());
        let dispatcher = NotificationDispatcher::new(presence.clone(), router.clone());

        let room = private_room_name("ava", "bea");
        let mut bea_lobby = lobby_subscriber(&router, "bea").await;
        let participants = vec!["ava".to_string(), "bea".to_string()];

        dispatcher.on_message_published(&room, "ava", &participants).await;

        match bea_lobby.try_recv().unwrap() {
            ServerEvent::Notification {
                target_user,
                room_name,
                room_type,
                ..
            } => {
                assert_eq!(target_user.as_deref(), Some("bea"));
                assert_eq!(room_name, None);
                assert_eq!(room_type, "private");
            }
            other => panic!("expected notification, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_viewers_and_sender_not_notified() {
        let presence = Arc::new(PresenceRegistry::new());
        let router = Arc::new(RoomRouter::new());
        let dispatcher = NotificationDispatcher::new(presence.clone(), router.clone());

        let mut charlie_lobby = lobby_subscriber(&router, "charlie").await;
        let mut job_lobby = lobby_subscriber(&router, "job").await;

        // Job is looking at the room right now
        presence.connect("job", "general").await;

        let participants = vec!["charlie".to_string(), "job".to_string()];
        let delivery = dispatcher
            .on_message_published("general", "charlie", &participants)
            .await;

        assert_eq!(delivery.delivered, 0);
        assert!(charlie_lobby.try_recv().is_err());
        assert!(job_lobby.try_recv().is_err());
    }
}
