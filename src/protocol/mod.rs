//! Wire protocol for the chat system
//!
//! This module provides:
//! - Newline-delimited record framing
//! - Typed client/server event definitions
//! - Room name helpers (kinds, private pair derivation)

pub mod codec;
pub mod events;

// Re-export commonly used types
pub use codec::{LineCodec, MAX_LINE_SIZE};
pub use events::*;
