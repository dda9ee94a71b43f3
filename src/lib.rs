//! Multi-room chat backend with JSON line protocol
//!
//! This library provides the core of a real-time chat system: connections
//! join a room over a newline-delimited JSON protocol, messages are
//! persisted and fanned out to live subscribers, read state is reconciled
//! across viewers, and lobby connections receive unread-badge notifications
//! for rooms they are not currently watching.

pub mod client;
pub mod error;
pub mod protocol;
pub mod server;
pub mod storage;

pub use client::{ChatClient, ChatClientConfig};
pub use error::{ChatError, Result};
pub use server::{ChatEngine, ChatServer};
pub use storage::{MemoryStore, MessageStore, StoredMessage};

use std::time::{SystemTime, UNIX_EPOCH};

/// Get current timestamp in milliseconds since UNIX epoch
pub fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Chat server configuration
#[derive(Clone, Debug)]
pub struct ChatConfig {
    /// Server listen address
    pub bind_addr: std::net::SocketAddr,
    /// Maximum number of concurrent connections
    pub max_connections: usize,
    /// Connection idle timeout in seconds
    pub idle_timeout_secs: u64,
    /// Maximum size of a single wire record in bytes
    pub max_event_size: usize,
    /// Capacity of each connection's outbound event queue
    pub outbound_queue_len: usize,
    /// Protocol errors tolerated per connection before it is closed
    pub protocol_error_limit: u32,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:7878".parse().unwrap(),
            max_connections: 1000,
            idle_timeout_secs: 300,
            max_event_size: 64 * 1024,
            outbound_queue_len: 256,
            protocol_error_limit: 8,
        }
    }
}
