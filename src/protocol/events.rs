//! Typed wire events for the chat protocol
//!
//! Every record on the wire is a flat JSON object with a `type`
//! discriminator, one record per line. Unknown `type` values fail to
//! decode and are rejected per-connection.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Server-assigned message identifier, monotonically increasing per room
pub type MessageId = u64;

/// The fixed room that lobby views subscribe to
pub const LOBBY_ROOM: &str = "lobby";

/// Prefix of derived private room names
const PRIVATE_PREFIX: &str = "private_";

/// Room classification, derived from the room name
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomKind {
    /// Open membership, any number of participants
    Group,
    /// Exactly two participants, name derived from the pair
    Private,
    /// The lobby pseudo-room carrying notifications and presence
    Lobby,
}

impl RoomKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RoomKind::Group => "group",
            RoomKind::Private => "private",
            RoomKind::Lobby => "lobby",
        }
    }
}

/// Classify a room by its name
pub fn room_kind(room: &str) -> RoomKind {
    if room == LOBBY_ROOM {
        RoomKind::Lobby
    } else if room.starts_with(PRIVATE_PREFIX) {
        RoomKind::Private
    } else {
        RoomKind::Group
    }
}

/// Derive the identifier of the private room between two users.
///
/// The pair is sorted first, so both orderings resolve to the same room
/// no matter which participant initiates.
pub fn private_room_name(a: &str, b: &str) -> String {
    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
    format!("{}{}_{}", PRIVATE_PREFIX, lo, hi)
}

/// Recover the participant pair encoded in a private room name.
///
/// Returns `None` for names that are not well-formed private room
/// identifiers. Usernames never contain `_`, which keeps this parse
/// unambiguous.
pub fn private_peers(room: &str) -> Option<(&str, &str)> {
    let rest = room.strip_prefix(PRIVATE_PREFIX)?;
    let mut parts = rest.split('_');
    let a = parts.next()?;
    let b = parts.next()?;
    if parts.next().is_some() || a.is_empty() || b.is_empty() {
        return None;
    }
    Some((a, b))
}

/// Records accepted from clients
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEvent {
    /// Handshake record; must be the first record on every connection.
    /// `since_id` requests replay of history newer than that id.
    Join {
        username: String,
        room: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        since_id: Option<MessageId>,
    },
    /// Publish a message to the connection's room
    ChatMessage { message: String, username: String },
    /// Typing indicator, fanned out but never persisted
    Typing { is_typing: bool, username: String },
    /// Mark a single message as read by the sender of this record
    ReadReceipt {
        message_id: MessageId,
        username: String,
    },
    /// Window-focus catch-up: mark everything up to `message_id` read
    CatchUp {
        message_id: MessageId,
        username: String,
    },
}

/// Records emitted to clients
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    /// Handshake acknowledgment, sent before history replay
    Joined {
        room: String,
        room_type: String,
        last_message_id: MessageId,
    },
    /// A message published to the room (also used for history replay)
    ChatMessage {
        message: String,
        username: String,
        id: MessageId,
    },
    Typing {
        username: String,
        is_typing: bool,
    },
    ReadReceipt {
        message_id: MessageId,
        username: String,
    },
    /// Batched acknowledgment covering many messages read at once
    BulkRead {
        message_ids: Vec<MessageId>,
        username: String,
    },
    /// Lobby-only unread-badge update. Private rooms carry `target_user`,
    /// group rooms carry `room_name`; no message content is included.
    Notification {
        sender: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target_user: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        room_name: Option<String>,
        room_type: String,
    },
    /// A user's live view of a room opened or closed
    Presence {
        username: String,
        online: bool,
    },
    /// Explicit not-delivered signal: the message was not persisted and
    /// was not fanned out; the client may retry.
    SendFailed {
        message: String,
        reason: String,
    },
    /// Protocol or membership error, delivered to the offender only
    Error {
        code: u32,
        message: String,
    },
}

fn to_line<T: Serialize>(value: &T) -> serde_json::Result<Bytes> {
    let mut buf = serde_json::to_vec(value)?;
    buf.push(b'\n');
    Ok(Bytes::from(buf))
}

impl ClientEvent {
    /// Decode one record from a raw line (without the trailing newline)
    pub fn decode(raw: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(raw)
    }

    /// Encode as a single wire line, newline included
    pub fn encode_line(&self) -> serde_json::Result<Bytes> {
        to_line(self)
    }
}

impl ServerEvent {
    /// Decode one record from a raw line (without the trailing newline)
    pub fn decode(raw: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(raw)
    }

    /// Encode as a single wire line, newline included
    pub fn encode_line(&self) -> serde_json::Result<Bytes> {
        to_line(self)
    }
}
