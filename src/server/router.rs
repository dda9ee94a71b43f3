//! Room router: maps each room to its live subscriber connections
//!
//! Fan-out is best-effort and isolated per recipient: every subscriber has
//! a bounded outbound queue and delivery uses `try_send`, so one
//! backpressured client can never stall the room. A full queue drops that
//! subscriber (and only that subscriber); the caller finishes its teardown.
//!
//! Each room owns a channel object whose subscriber map doubles as the
//! room's ordering point: publishes to the same room are serialized by its
//! lock while unrelated rooms proceed independently. The lock is only ever
//! held across non-suspending `try_send` calls. Channels are created
//! lazily on first subscribe and discarded when the last subscriber
//! leaves.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::protocol::events::ServerEvent;
use crate::server::presence::ConnectionHandle;

/// One live subscription to a room
#[derive(Clone)]
pub struct Subscriber {
    /// Presence handle of the owning connection
    pub handle: ConnectionHandle,
    /// Bounded outbound queue drained by the connection's writer task
    pub tx: mpsc::Sender<ServerEvent>,
    /// Fired when the subscriber is dropped so its tasks shut down
    pub kill: Arc<watch::Sender<bool>>,
}

/// Outcome of a publish call
#[derive(Default)]
pub struct Delivery {
    /// Connections the event was queued for
    pub delivered: usize,
    /// Subscribers removed because their queue was full or their
    /// receiving task was gone; presence teardown is the caller's job
    pub dropped: Vec<Subscriber>,
}

struct RoomChannel {
    subscribers: Mutex<HashMap<Uuid, Subscriber>>,
}

impl RoomChannel {
    fn new() -> Self {
        Self {
            subscribers: Mutex::new(HashMap::new()),
        }
    }
}

/// Routes published events to the live subscribers of a room
#[derive(Default)]
pub struct RoomRouter {
    rooms: RwLock<HashMap<String, Arc<RoomChannel>>>,
}

impl RoomRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscription. Identity is per-connection: a user with
    /// two connections to the room holds two subscriptions and receives
    /// every event twice.
    pub async fn subscribe(&self, sub: Subscriber) {
        let mut rooms = self.rooms.write().await;
        let channel = rooms
            .entry(sub.handle.room.clone())
            .or_insert_with(|| Arc::new(RoomChannel::new()))
            .clone();
        channel.subscribers.lock().await.insert(sub.handle.conn_id, sub);
    }

    /// Remove a subscription. Idempotent: removing an absent connection
    /// is a no-op returning false.
    pub async fn unsubscribe(&self, room: &str, conn_id: Uuid) -> bool {
        let removed = {
            let Some(channel) = self.channel(room).await else {
                return false;
            };
            let removed = channel.subscribers.lock().await.remove(&conn_id).is_some();
            removed
        };
        if removed {
            self.discard_if_empty(room).await;
        }
        removed
    }

    /// Fan an event out to every current subscriber of the room.
    /// Publishing to a room with no subscribers delivers to zero
    /// connections and is a legal no-op.
    pub async fn publish(&self, room: &str, event: ServerEvent) -> Delivery {
        self.fan_out(room, event, None).await
    }

    /// Deliver an event only to the given user's subscriptions in the room
    pub async fn publish_to_user(&self, room: &str, user: &str, event: ServerEvent) -> Delivery {
        self.fan_out(room, event, Some(user)).await
    }

    /// Number of live subscriptions in the room
    pub async fn subscriber_count(&self, room: &str) -> usize {
        match self.channel(room).await {
            Some(channel) => channel.subscribers.lock().await.len(),
            None => 0,
        }
    }

    /// Number of rooms with at least one subscriber
    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    async fn channel(&self, room: &str) -> Option<Arc<RoomChannel>> {
        self.rooms.read().await.get(room).cloned()
    }

    async fn fan_out(&self, room: &str, event: ServerEvent, only_user: Option<&str>) -> Delivery {
        let mut delivery = Delivery::default();
        let Some(channel) = self.channel(room).await else {
            return delivery;
        };

        let mut subscribers = channel.subscribers.lock().await;
        let mut stale = Vec::new();
        for (conn_id, sub) in subscribers.iter() {
            if let Some(user) = only_user {
                if sub.handle.user != user {
                    continue;
                }
            }
            match sub.tx.try_send(event.clone()) {
                Ok(()) => delivery.delivered += 1,
                Err(TrySendError::Full(_)) => {
                    warn!(
                        "outbound queue full for {} in {}, dropping connection",
                        sub.handle.user, room
                    );
                    stale.push(*conn_id);
                }
                Err(TrySendError::Closed(_)) => {
                    debug!("subscriber {} in {} already gone", sub.handle.user, room);
                    stale.push(*conn_id);
                }
            }
        }
        for conn_id in stale {
            if let Some(sub) = subscribers.remove(&conn_id) {
                let _ = sub.kill.send(true);
                delivery.dropped.push(sub);
            }
        }
        let emptied = subscribers.is_empty();
        drop(subscribers);

        if emptied && !delivery.dropped.is_empty() {
            self.discard_if_empty(room).await;
        }
        delivery
    }

    async fn discard_if_empty(&self, room: &str) {
        let mut rooms = self.rooms.write().await;
        if let Some(channel) = rooms.get(room) {
            if channel.subscribers.lock().await.is_empty() {
                rooms.remove(room);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::events::ServerEvent;

    fn subscriber(
        user: &str,
        room: &str,
        capacity: usize,
    ) -> (Subscriber, mpsc::Receiver<ServerEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        let (kill, _) = watch::channel(false);
        let sub = Subscriber {
            handle: ConnectionHandle {
                conn_id: Uuid::new_v4(),
                user: user.to_string(),
                room: room.to_string(),
            },
            tx,
            kill: Arc::new(kill),
        };
        (sub, rx)
    }

    fn typing(user: &str) -> ServerEvent {
        ServerEvent::Typing {
            username: user.to_string(),
            is_typing: true,
        }
    }

    #[tokio::test]
    async fn test_publish_without_subscribers() {
        let router = RoomRouter::new();
        let delivery = router.publish("empty", typing("alice")).await;
        assert_eq!(delivery.delivered, 0);
        assert!(delivery.dropped.is_empty());
    }

    #[tokio::test]
    async fn test_fan_out_exactly_once_per_subscriber() {
        let router = RoomRouter::new();
        let (a, mut rx_a) = subscriber("alice", "general", 8);
        let (b, mut rx_b) = subscriber("bob", "general", 8);
        let (c, mut rx_c) = subscriber("carol", "other", 8);
        router.subscribe(a).await;
        router.subscribe(b).await;
        router.subscribe(c).await;

        let delivery = router.publish("general", typing("alice")).await;
        assert_eq!(delivery.delivered, 2);

        assert!(rx_a.try_recv().is_ok());
        assert!(rx_a.try_recv().is_err());
        assert!(rx_b.try_recv().is_ok());
        assert!(rx_b.try_recv().is_err());
        assert!(rx_c.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_same_user_two_connections_receives_twice() {
        let router = RoomRouter::new();
        let (first, mut rx1) = subscriber("alice", "general", 8);
        let (second, mut rx2) = subscriber("alice", "general", 8);
        router.subscribe(first).await;
        router.subscribe(second).await;

        let delivery = router.publish("general", typing("bob")).await;
        assert_eq!(delivery.delivered, 2);
        assert!(rx1.try_recv().is_ok());
        assert!(rx2.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_publish_to_user_filters() {
        let router = RoomRouter::new();
        let (a, mut rx_a) = subscriber("alice", "lobby", 8);
        let (b, mut rx_b) = subscriber("bob", "lobby", 8);
        router.subscribe(a).await;
        router.subscribe(b).await;

        let delivery = router.publish_to_user("lobby", "bob", typing("x")).await;
        assert_eq!(delivery.delivered, 1);
        assert!(rx_a.try_recv().is_err());
        assert!(rx_b.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_full_queue_drops_only_that_subscriber() {
        let router = RoomRouter::new();
        let (slow, _rx_slow) = subscriber("slow", "general", 1);
        let (fast, mut rx_fast) = subscriber("fast", "general", 8);
        let slow_kill = slow.kill.subscribe();
        router.subscribe(slow).await;
        router.subscribe(fast).await;

        // First publish fills slow's queue, second overflows it
        let delivery = router.publish("general", typing("a")).await;
        assert_eq!(delivery.delivered, 2);
        let delivery = router.publish("general", typing("b")).await;
        assert_eq!(delivery.delivered, 1);
        assert_eq!(delivery.dropped.len(), 1);
        assert_eq!(delivery.dropped[0].handle.user, "slow");
        assert!(*slow_kill.borrow());

        // The fast subscriber is unaffected and still registered
        assert_eq!(router.subscriber_count("general").await, 1);
        assert!(rx_fast.try_recv().is_ok());
        assert!(rx_fast.try_recv().is_ok());

        let delivery = router.publish("general", typing("c")).await;
        assert_eq!(delivery.delivered, 1);
    }

    #[tokio::test]
    async fn test_unsubscribe_idempotent_and_rooms_discarded() {
        let router = RoomRouter::new();
        let (sub, _rx) = subscriber("alice", "general", 8);
        let conn_id = sub.handle.conn_id;
        router.subscribe(sub).await;
        assert_eq!(router.room_count().await, 1);

        assert!(router.unsubscribe("general", conn_id).await);
        assert!(!router.unsubscribe("general", conn_id).await);

        // Empty room channel is discarded, publish is a no-op again
        assert_eq!(router.room_count().await, 0);
        let delivery = router.publish("general", typing("alice")).await;
        assert_eq!(delivery.delivered, 0);
    }
}
