//! Server-side chat engine
//!
//! The components cooperate like this:
//!
//! - **Presence registry**: who is connected, and to which rooms
//! - **Room router**: fan-out to each room's live subscriber connections
//! - **Delivery pipeline** (one per connection): raw records in, validated
//!   engine operations out
//! - **Read-state reconciler**: per-message read-sets and unread counters
//! - **Notification dispatcher**: lobby badge updates for non-viewers
//! - **Engine**: owns and wires the above; **listener**: TCP glue

pub mod engine;
pub mod listener;
pub mod notify;
pub mod pipeline;
pub mod presence;
pub mod read_state;
pub mod router;

pub use engine::{Attachment, ChatEngine};
pub use listener::ChatServer;
pub use notify::NotificationDispatcher;
pub use pipeline::{ConnState, DeliveryPipeline, Progress};
pub use presence::{Arrival, ConnectionHandle, Departure, PresenceRegistry};
pub use read_state::{ReadStateReconciler, TickState};
pub use router::{Delivery, RoomRouter, Subscriber};
