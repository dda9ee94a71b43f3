//! Error handling for the chat server

use std::fmt;

/// Result type alias for chat operations
pub type Result<T> = std::result::Result<T, ChatError>;

/// Chat server error types
#[derive(Debug, Clone)]
pub enum ChatError {
    /// Network-related errors
    Network(String),
    /// Serialization/deserialization errors
    Serialization(String),
    /// Identity assertion errors (invalid username)
    Auth(String),
    /// Malformed or unexpected wire records
    Protocol(String),
    /// Connection state errors
    Connection(String),
    /// Event targets a room the user is not a participant of
    Membership(String),
    /// Durable storage unavailable or a write failed
    Persistence(String),
    /// A connection's outbound queue overflowed
    Capacity(String),
    /// Configuration error
    Config(String),
    /// Timeout error
    Timeout(String),
    /// Server internal error
    Internal(String),
}

impl ChatError {
    /// Get error code for this error type
    pub fn code(&self) -> u32 {
        match self {
            ChatError::Network(_) => 1000,
            ChatError::Serialization(_) => 1001,
            ChatError::Auth(_) => 1002,
            ChatError::Protocol(_) => 1003,
            ChatError::Connection(_) => 1004,
            ChatError::Membership(_) => 1005,
            ChatError::Persistence(_) => 1006,
            ChatError::Capacity(_) => 1007,
            ChatError::Config(_) => 1008,
            ChatError::Timeout(_) => 1009,
            ChatError::Internal(_) => 1010,
        }
    }

    /// Get human-readable error message
    pub fn message(&self) -> &str {
        match self {
            ChatError::Network(msg) => msg,
            ChatError::Serialization(msg) => msg,
            ChatError::Auth(msg) => msg,
            ChatError::Protocol(msg) => msg,
            ChatError::Connection(msg) => msg,
            ChatError::Membership(msg) => msg,
            ChatError::Persistence(msg) => msg,
            ChatError::Capacity(msg) => msg,
            ChatError::Config(msg) => msg,
            ChatError::Timeout(msg) => msg,
            ChatError::Internal(msg) => msg,
        }
    }

    /// Create a network error
    pub fn network<T: Into<String>>(msg: T) -> Self {
        ChatError::Network(msg.into())
    }

    /// Create a serialization error
    pub fn serialization<T: Into<String>>(msg: T) -> Self {
        ChatError::Serialization(msg.into())
    }

    /// Create an identity error
    pub fn auth<T: Into<String>>(msg: T) -> Self {
        ChatError::Auth(msg.into())
    }

    /// Create a protocol error
    pub fn protocol<T: Into<String>>(msg: T) -> Self {
        ChatError::Protocol(msg.into())
    }

    /// Create a connection error
    pub fn connection<T: Into<String>>(msg: T) -> Self {
        ChatError::Connection(msg.into())
    }

    /// Create a membership error
    pub fn membership<T: Into<String>>(msg: T) -> Self {
        ChatError::Membership(msg.into())
    }

    /// Create a persistence error
    pub fn persistence<T: Into<String>>(msg: T) -> Self {
        ChatError::Persistence(msg.into())
    }

    /// Create a capacity error
    pub fn capacity<T: Into<String>>(msg: T) -> Self {
        ChatError::Capacity(msg.into())
    }

    /// Create a configuration error
    pub fn config<T: Into<String>>(msg: T) -> Self {
        ChatError::Config(msg.into())
    }

    /// Create a timeout error
    pub fn timeout<T: Into<String>>(msg: T) -> Self {
        ChatError::Timeout(msg.into())
    }

    /// Create an internal error
    pub fn internal<T: Into<String>>(msg: T) -> Self {
        ChatError::Internal(msg.into())
    }
}

impl fmt::Display for ChatError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChatError::Network(msg) => write!(f, "Network error: {}", msg),
            ChatError::Serialization(msg) => write!(f, "Serialization error: {}", msg),
            ChatError::Auth(msg) => write!(f, "Identity error: {}", msg),
            ChatError::Protocol(msg) => write!(f, "Protocol error: {}", msg),
            ChatError::Connection(msg) => write!(f, "Connection error: {}", msg),
            ChatError::Membership(msg) => write!(f, "Membership error: {}", msg),
            ChatError::Persistence(msg) => write!(f, "Persistence error: {}", msg),
            ChatError::Capacity(msg) => write!(f, "Capacity exceeded: {}", msg),
            ChatError::Config(msg) => write!(f, "Configuration error: {}", msg),
            ChatError::Timeout(msg) => write!(f, "Timeout: {}", msg),
            ChatError::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl std::error::Error for ChatError {}

impl From<std::io::Error> for ChatError {
    fn from(err: std::io::Error) -> Self {
        ChatError::Network(format!("IO error: {}", err))
    }
}

impl From<serde_json::Error> for ChatError {
    fn from(err: serde_json::Error) -> Self {
        ChatError::Serialization(format!("JSON error: {}", err))
    }
}

impl From<anyhow::Error> for ChatError {
    fn from(err: anyhow::Error) -> Self {
        ChatError::Internal(format!("{}", err))
    }
}
