//! Core engine wiring presence, routing, read-state and notifications
//!
//! The engine owns every shared component explicitly and is injected into
//! each connection's pipeline; nothing here is process-global. All
//! operations take an [`Attachment`] that proves the connection completed
//! its handshake and names its user and room.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{ChatError, Result};
use crate::protocol::events::{
    private_peers, room_kind, MessageId, RoomKind, ServerEvent, LOBBY_ROOM,
};
use crate::server::notify::NotificationDispatcher;
use crate::server::presence::{Arrival, ConnectionHandle, PresenceRegistry};
use crate::server::read_state::ReadStateReconciler;
use crate::server::router::{RoomRouter, Subscriber};
use crate::storage::MessageStore;
use crate::ChatConfig;

/// A connection's registration with the engine
#[derive(Debug)]
pub struct Attachment {
    handle: ConnectionHandle,
    tx: mpsc::Sender<ServerEvent>,
    kill: Arc<watch::Sender<bool>>,
}

impl Attachment {
    pub fn user(&self) -> &str {
        &self.handle.user
    }

    pub fn room(&self) -> &str {
        &self.handle.room
    }

    pub fn conn_id(&self) -> Uuid {
        self.handle.conn_id
    }

    /// A receiver that resolves when the engine drops this connection
    pub fn kill_signal(&self) -> watch::Receiver<bool> {
        self.kill.subscribe()
    }

    /// Queue an event for this connection only. A full queue is a
    /// capacity error; the caller decides whether that tears the
    /// connection down.
    fn try_send(&self, event: ServerEvent) -> Result<()> {
        self.tx.try_send(event).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                ChatError::capacity(format!("outbound queue full for {}", self.handle.user))
            }
            mpsc::error::TrySendError::Closed(_) => {
                ChatError::connection("outbound queue closed")
            }
        })
    }

    /// Best-effort direct send, used for failure signals where losing the
    /// event is no worse than the drop that would follow anyway.
    pub(crate) fn send_best_effort(&self, event: ServerEvent) {
        let _ = self.tx.try_send(event);
    }
}

/// The chat engine: validates, persists, fans out and reconciles
pub struct ChatEngine {
    config: ChatConfig,
    store: Arc<dyn MessageStore>,
    presence: Arc<PresenceRegistry>,
    router: Arc<RoomRouter>,
    reconciler: Arc<ReadStateReconciler>,
    notifier: NotificationDispatcher,
}

impl ChatEngine {
    pub fn new(config: ChatConfig, store: Arc<dyn MessageStore>) -> Arc<Self> {
        let presence = Arc::new(PresenceRegistry::new());
        let router = Arc::new(RoomRouter::new());
        let reconciler = Arc::new(ReadStateReconciler::new(Arc::clone(&store)));
        let notifier = NotificationDispatcher::new(Arc::clone(&presence), Arc::clone(&router));
        Arc::new(Self {
            config,
            store,
            presence,
            router,
            reconciler,
            notifier,
        })
    }

    pub fn config(&self) -> &ChatConfig {
        &self.config
    }

    pub fn presence(&self) -> &PresenceRegistry {
        &self.presence
    }

    pub fn router(&self) -> &RoomRouter {
        &self.router
    }

    pub fn reconciler(&self) -> &ReadStateReconciler {
        &self.reconciler
    }

    /// Register a connection: validate identity and membership, mark
    /// presence, subscribe to the room, acknowledge the join, replay
    /// history and run the connect-time catch-up.
    ///
    /// Returns the attachment plus the receiving end of the connection's
    /// outbound queue, which the transport's writer task drains.
    pub async fn attach(
        &self,
        username: &str,
        room: &str,
        since_id: Option<MessageId>,
    ) -> Result<(Attachment, mpsc::Receiver<ServerEvent>)> {
        let username = validate_username(username)?;
        validate_room(room)?;

        match room_kind(room) {
            RoomKind::Private => {
                let (a, b) = private_peers(room).ok_or_else(|| {
                    ChatError::membership(format!("malformed private room name: {}", room))
                })?;
                if username != a && username != b {
                    return Err(ChatError::membership(format!(
                        "{} is not a participant of {}",
                        username, room
                    )));
                }
                // Register both peers so unread and notification state
                // accrues for the other side even while they are offline.
                self.store.join_room(room, a).await?;
                self.store.join_room(room, b).await?;
            }
            _ => {
                self.store.join_room(room, username).await?;
            }
        }

        let (handle, arrival) = self.presence.connect(username, room).await;
        let (tx, rx) = mpsc::channel(self.config.outbound_queue_len);
        let (kill, _) = watch::channel(false);
        let kill = Arc::new(kill);

        self.router
            .subscribe(Subscriber {
                handle: handle.clone(),
                tx: tx.clone(),
                kill: Arc::clone(&kill),
            })
            .await;

        let attachment = Attachment { handle, tx, kill };
        match self.finish_attach(&attachment, since_id, arrival).await {
            Ok(()) => {
                info!("{} attached to {}", username, room);
                Ok((attachment, rx))
            }
            Err(e) => {
                self.detach(attachment).await;
                Err(e)
            }
        }
    }

    async fn finish_attach(
        &self,
        att: &Attachment,
        since_id: Option<MessageId>,
        arrival: Arrival,
    ) -> Result<()> {
        let room = att.room().to_string();
        let user = att.user().to_string();

        let latest = self.store.latest_id(&room).await?;
        att.try_send(ServerEvent::Joined {
            room: room.clone(),
            room_type: room_kind(&room).as_str().to_string(),
            last_message_id: latest,
        })?;

        // Gap replay straight from durable history; the server keeps no
        // per-session buffer of missed events.
        for msg in self.store.query_history(&room, since_id).await? {
            att.try_send(ServerEvent::ChatMessage {
                message: msg.content,
                username: msg.sender,
                id: msg.id,
            })?;
        }

        if arrival.first_view {
            let delivery = self
                .router
                .publish(
                    &room,
                    ServerEvent::Presence {
                        username: user.clone(),
                        online: true,
                    },
                )
                .await;
            self.reap(delivery.dropped).await;
        }
        if arrival.came_online && room != LOBBY_ROOM {
            let delivery = self
                .router
                .publish(
                    LOBBY_ROOM,
                    ServerEvent::Presence {
                        username: user.clone(),
                        online: true,
                    },
                )
                .await;
            self.reap(delivery.dropped).await;
        }

        // Opening the room catches the reader up on everything in it; a
        // single bulk_read covers the whole delta.
        let newly = self
            .reconciler
            .mark_all_read_up_to(&user, &room, latest)
            .await?;
        if !newly.is_empty() {
            let delivery = self
                .router
                .publish(
                    &room,
                    ServerEvent::BulkRead {
                        message_ids: newly,
                        username: user,
                    },
                )
                .await;
            self.reap(delivery.dropped).await;
        }
        Ok(())
    }

    /// Tear a connection down. Safe to race with other teardown paths:
    /// only the call that actually removes the presence entry publishes
    /// offline events.
    pub async fn detach(&self, att: Attachment) {
        let _ = att.kill.send(true);
        self.router
            .unsubscribe(att.room(), att.handle.conn_id)
            .await;
        self.retire(&att.handle).await;
        debug!("{} detached from {}", att.user(), att.room());
    }

    /// Persist a message, then fan it out and notify lobby viewers. A
    /// persistence failure reaches only the sender; nothing is fanned out
    /// for a message that is not in history.
    pub async fn publish_chat(&self, att: &Attachment, text: &str) -> Result<()> {
        let room = att.room();
        let sender = att.user();

        let stored = match self.store.append_message(room, sender, text).await {
            Ok(msg) => msg,
            Err(e) => {
                warn!("failed to persist message from {} in {}: {}", sender, room, e);
                att.send_best_effort(ServerEvent::SendFailed {
                    message: text.to_string(),
                    reason: e.to_string(),
                });
                return Ok(());
            }
        };

        let participants = self.store.participants(room).await?;
        self.reconciler
            .note_published(room, sender, &participants)
            .await;

        let delivery = self
            .router
            .publish(
                room,
                ServerEvent::ChatMessage {
                    message: stored.content,
                    username: stored.sender,
                    id: stored.id,
                },
            )
            .await;
        debug!(
            "message {} in {} delivered to {} connections",
            stored.id, room, delivery.delivered
        );
        self.reap(delivery.dropped).await;

        let delivery = self
            .notifier
            .on_message_published(room, sender, &participants)
            .await;
        self.reap(delivery.dropped).await;
        Ok(())
    }

    /// Fan a typing indicator out to the room; never persisted
    pub async fn publish_typing(&self, att: &Attachment, is_typing: bool) -> Result<()> {
        let delivery = self
            .router
            .publish(
                att.room(),
                ServerEvent::Typing {
                    username: att.user().to_string(),
                    is_typing,
                },
            )
            .await;
        self.reap(delivery.dropped).await;
        Ok(())
    }

    /// Mark one message read by the connection's user. Fans a receipt out
    /// only when the read-set actually grew, so re-reads and the sender's
    /// implicit self-read stay silent.
    pub async fn apply_read_receipt(&self, att: &Attachment, message_id: MessageId) -> Result<()> {
        let newly = self
            .reconciler
            .mark_read(att.user(), att.room(), message_id)
            .await?;
        if newly {
            let delivery = self
                .router
                .publish(
                    att.room(),
                    ServerEvent::ReadReceipt {
                        message_id,
                        username: att.user().to_string(),
                    },
                )
                .await;
            self.reap(delivery.dropped).await;
        }
        Ok(())
    }

    /// Window-focus catch-up: mark everything up to the watermark read
    /// and fan out one bulk acknowledgment for the delta.
    pub async fn catch_up(&self, att: &Attachment, up_to: MessageId) -> Result<()> {
        let newly = self
            .reconciler
            .mark_all_read_up_to(att.user(), att.room(), up_to)
            .await?;
        if !newly.is_empty() {
            let delivery = self
                .router
                .publish(
                    att.room(),
                    ServerEvent::BulkRead {
                        message_ids: newly,
                        username: att.user().to_string(),
                    },
                )
                .await;
            self.reap(delivery.dropped).await;
        }
        Ok(())
    }

    /// Finish presence teardown for connections the router dropped, and
    /// publish the resulting offline events. Those publishes can drop
    /// further subscribers, so this drains a worklist.
    async fn reap(&self, mut dropped: Vec<Subscriber>) {
        while let Some(sub) = dropped.pop() {
            self.router
                .unsubscribe(&sub.handle.room, sub.handle.conn_id)
                .await;
            let departure = self.presence.disconnect(&sub.handle).await;
            if !departure.removed {
                continue;
            }
            if departure.last_view {
                let delivery = self
                    .router
                    .publish(
                        &sub.handle.room,
                        ServerEvent::Presence {
                            username: sub.handle.user.clone(),
                            online: false,
                        },
                    )
                    .await;
                dropped.extend(delivery.dropped);
            }
            if departure.went_offline && sub.handle.room != LOBBY_ROOM {
                let delivery = self
                    .router
                    .publish(
                        LOBBY_ROOM,
                        ServerEvent::Presence {
                            username: sub.handle.user.clone(),
                            online: false,
                        },
                    )
                    .await;
                dropped.extend(delivery.dropped);
            }
        }
    }

    async fn retire(&self, handle: &ConnectionHandle) {
        let departure = self.presence.disconnect(handle).await;
        if !departure.removed {
            return;
        }
        let mut dropped = Vec::new();
        if departure.last_view {
            let delivery = self
                .router
                .publish(
                    &handle.room,
                    ServerEvent::Presence {
                        username: handle.user.clone(),
                        online: false,
                    },
                )
                .await;
            dropped.extend(delivery.dropped);
        }
        if departure.went_offline && handle.room != LOBBY_ROOM {
            let delivery = self
                .router
                .publish(
                    LOBBY_ROOM,
                    ServerEvent::Presence {
                        username: handle.user.clone(),
                        online: false,
                    },
                )
                .await;
            dropped.extend(delivery.dropped);
        }
        self.reap(dropped).await;
    }
}

/// Validate an asserted username. Identity is otherwise opaque here; the
/// `_` restriction keeps private room identifiers parseable.
fn validate_username(username: &str) -> Result<&str> {
    let username = username.trim();
    if username.is_empty() || username.len() > 50 {
        return Err(ChatError::auth("invalid username"));
    }
    if username.contains('_') {
        return Err(ChatError::auth("usernames may not contain '_'"));
    }
    Ok(username)
}

fn validate_room(room: &str) -> Result<()> {
    if room.is_empty() || room.len() > 128 {
        return Err(ChatError::protocol("invalid room name"));
    }
    if room.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(ChatError::protocol("room names may not contain whitespace"));
    }
    Ok(())
}
