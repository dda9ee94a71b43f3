//! Per-connection event pipeline
//!
//! A small state machine that turns raw inbound lines into validated
//! engine operations. Records are handled strictly in arrival order; the
//! transport must await each `handle_line` before reading the next line,
//! which is what keeps persistence and read receipts from the same sender
//! causally ordered.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::{ChatError, Result};
use crate::protocol::events::{ClientEvent, ServerEvent};
use crate::server::engine::{Attachment, ChatEngine};

/// Connection lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Waiting for the join handshake record
    Connecting,
    /// Joined; all event kinds accepted
    Open,
    /// Tearing down; no further records accepted
    Closing,
    /// Terminal
    Closed,
}

/// What a handled record produced for the transport layer
pub enum Progress {
    /// The record was consumed; nothing for the transport to do
    Handled,
    /// The connection joined a room. Drive the returned outbound queue
    /// with a writer task.
    Attached(mpsc::Receiver<ServerEvent>),
    /// A reply the transport must write directly; used before the
    /// connection has an outbound queue.
    Reply(ServerEvent),
}

/// State machine for one connection
pub struct DeliveryPipeline {
    engine: Arc<ChatEngine>,
    state: ConnState,
    attachment: Option<Attachment>,
    protocol_errors: u32,
}

impl DeliveryPipeline {
    pub fn new(engine: Arc<ChatEngine>) -> Self {
        Self {
            engine,
            state: ConnState::Connecting,
            attachment: None,
            protocol_errors: 0,
        }
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    pub fn attachment(&self) -> Option<&Attachment> {
        self.attachment.as_ref()
    }

    /// Apply one inbound record
    pub async fn handle_line(&mut self, raw: &[u8]) -> Result<Progress> {
        if matches!(self.state, ConnState::Closing | ConnState::Closed) {
            return Err(ChatError::connection("connection is closed"));
        }

        let event = match ClientEvent::decode(raw) {
            Ok(event) => event,
            Err(e) => {
                return self
                    .protocol_error(ChatError::protocol(format!("invalid record: {}", e)))
                    .await;
            }
        };

        match (self.state, event) {
            (
                ConnState::Connecting,
                ClientEvent::Join {
                    username,
                    room,
                    since_id,
                },
            ) => match self.engine.attach(&username, &room, since_id).await {
                Ok((attachment, rx)) => {
                    self.attachment = Some(attachment);
                    self.state = ConnState::Open;
                    Ok(Progress::Attached(rx))
                }
                Err(e) => {
                    self.state = ConnState::Closing;
                    Err(e)
                }
            },
            (ConnState::Connecting, _) => {
                self.state = ConnState::Closing;
                Err(ChatError::protocol("first record must be a join"))
            }
            (ConnState::Open, ClientEvent::Join { .. }) => {
                self.protocol_error(ChatError::protocol(
                    "already joined; switching rooms requires a new connection",
                ))
                .await
            }
            (ConnState::Open, ClientEvent::ChatMessage { message, username }) => {
                if let Err(e) = self.verify_sender(&username) {
                    return self.protocol_error(e).await;
                }
                let att = self.attached()?;
                self.engine.publish_chat(att, &message).await?;
                Ok(Progress::Handled)
            }
            (ConnState::Open, ClientEvent::Typing { is_typing, username }) => {
                if let Err(e) = self.verify_sender(&username) {
                    return self.protocol_error(e).await;
                }
                let att = self.attached()?;
                self.engine.publish_typing(att, is_typing).await?;
                Ok(Progress::Handled)
            }
            (
                ConnState::Open,
                ClientEvent::ReadReceipt {
                    message_id,
                    username,
                },
            ) => {
                if let Err(e) = self.verify_sender(&username) {
                    return self.protocol_error(e).await;
                }
                let att = self.attached()?;
                self.engine.apply_read_receipt(att, message_id).await?;
                Ok(Progress::Handled)
            }
            (
                ConnState::Open,
                ClientEvent::CatchUp {
                    message_id,
                    username,
                },
            ) => {
                if let Err(e) = self.verify_sender(&username) {
                    return self.protocol_error(e).await;
                }
                let att = self.attached()?;
                self.engine.catch_up(att, message_id).await?;
                Ok(Progress::Handled)
            }
            (state, event) => {
                debug!("unexpected record {:?} in state {:?}", event, state);
                self.protocol_error(ChatError::protocol("unexpected record")).await
            }
        }
    }

    /// Tear the connection down. Idempotent: repeated calls (transport
    /// error racing an explicit close) take effect exactly once.
    pub async fn close(&mut self) {
        if self.state == ConnState::Closed {
            return;
        }
        self.state = ConnState::Closing;
        if let Some(attachment) = self.attachment.take() {
            self.engine.detach(attachment).await;
        }
        self.state = ConnState::Closed;
    }

    /// Record a connection-local protocol violation. The offender gets an
    /// error record; nothing is fanned out. Crossing the configured
    /// threshold closes the connection.
    async fn protocol_error(&mut self, err: ChatError) -> Result<Progress> {
        self.protocol_errors += 1;
        warn!(
            "protocol error #{}: {}",
            self.protocol_errors,
            err.message()
        );

        if self.protocol_errors >= self.engine.config().protocol_error_limit {
            self.state = ConnState::Closing;
            return Err(ChatError::protocol("too many protocol errors"));
        }

        let reply = ServerEvent::Error {
            code: err.code(),
            message: err.message().to_string(),
        };
        match &self.attachment {
            Some(att) => {
                att.send_best_effort(reply);
                Ok(Progress::Handled)
            }
            None => Ok(Progress::Reply(reply)),
        }
    }

    /// Events must carry the username the connection joined with; a
    /// mismatch is a connection-local protocol violation.
    fn verify_sender(&self, username: &str) -> Result<()> {
        let att = self
            .attachment
            .as_ref()
            .ok_or_else(|| ChatError::connection("not attached"))?;
        if att.user() != username {
            return Err(ChatError::protocol(format!(
                "record username {} does not match connection identity {}",
                username,
                att.user()
            )));
        }
        Ok(())
    }

    fn attached(&self) -> Result<&Attachment> {
        self.attachment
            .as_ref()
            .ok_or_else(|| ChatError::connection("not attached"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use crate::ChatConfig;

    fn pipeline() -> DeliveryPipeline {
        pipeline_with_limit(8)
    }

    fn pipeline_with_limit(protocol_error_limit: u32) -> DeliveryPipeline {
        let config = ChatConfig {
            protocol_error_limit,
            ..ChatConfig::default()
        };
        let engine = ChatEngine::new(config, Arc::new(MemoryStore::new()));
        DeliveryPipeline::new(engine)
    }

    fn line(event: &ClientEvent) -> Vec<u8> {
        serde_json::to_vec(event).unwrap()
    }

    #[tokio::test]
    async fn test_join_moves_connecting_to_open() {
        let mut pipeline = pipeline();
        assert_eq!(pipeline.state(), ConnState::Connecting);

        let join = line(&ClientEvent::Join {
            username: "charlie".into(),
            room: "general".into(),
            since_id: None,
        });
        let progress = pipeline.handle_line(&join).await.unwrap();
        assert!(matches!(progress, Progress::Attached(_)));
        assert_eq!(pipeline.state(), ConnState::Open);
        assert_eq!(pipeline.attachment().unwrap().user(), "charlie");
    }

    #[tokio::test]
    async fn test_non_join_first_record_closes() {
        let mut pipeline = pipeline();
        let chat = line(&ClientEvent::ChatMessage {
            message: "hi".into(),
            username: "charlie".into(),
        });
        assert!(pipeline.handle_line(&chat).await.is_err());
        assert_eq!(pipeline.state(), ConnState::Closing);
    }

    #[tokio::test]
    async fn test_malformed_record_replies_without_closing() {
        let mut pipeline = pipeline();
        let progress = pipeline.handle_line(b"not json").await.unwrap();
        assert!(matches!(progress, Progress::Reply(ServerEvent::Error { .. })));
        assert_eq!(pipeline.state(), ConnState::Connecting);

        // The connection still works after the rejected record
        let join = line(&ClientEvent::Join {
            username: "charlie".into(),
            room: "general".into(),
            since_id: None,
        });
        assert!(pipeline.handle_line(&join).await.is_ok());
        assert_eq!(pipeline.state(), ConnState::Open);
    }

    #[tokio::test]
    async fn test_protocol_error_threshold_closes() {
        let mut pipeline = pipeline_with_limit(2);
        assert!(pipeline.handle_line(b"garbage").await.is_ok());
        assert!(pipeline.handle_line(b"garbage").await.is_err());
        assert_eq!(pipeline.state(), ConnState::Closing);

        // Closed connections accept nothing
        assert!(pipeline.handle_line(b"{}").await.is_err());
    }

    #[tokio::test]
    async fn test_username_mismatch_rejected() {
        let mut pipeline = pipeline();
        let join = line(&ClientEvent::Join {
            username: "charlie".into(),
            room: "general".into(),
            since_id: None,
        });
        pipeline.handle_line(&join).await.unwrap();

        let spoofed = line(&ClientEvent::ChatMessage {
            message: "hi".into(),
            username: "mallory".into(),
        });
        let progress = pipeline.handle_line(&spoofed).await.unwrap();
        assert!(matches!(progress, Progress::Handled));
        assert_eq!(pipeline.state(), ConnState::Open);
    }

    #[tokio::test]
    async fn test_close_idempotent() {
        let mut pipeline = pipeline();
        let join = line(&ClientEvent::Join {
            username: "charlie".into(),
            room: "general".into(),
            since_id: None,
        });
        pipeline.handle_line(&join).await.unwrap();

        pipeline.close().await;
        assert_eq!(pipeline.state(), ConnState::Closed);
        pipeline.close().await;
        assert_eq!(pipeline.state(), ConnState::Closed);
    }

    #[tokio::test]
    async fn test_second_join_is_protocol_error() {
        let mut pipeline = pipeline();
        let join = line(&ClientEvent::Join {
            username: "charlie".into(),
            room: "general".into(),
            since_id: None,
        });
        pipeline.handle_line(&join).await.unwrap();

        let progress = pipeline.handle_line(&join).await.unwrap();
        assert!(matches!(progress, Progress::Handled));
        assert_eq!(pipeline.state(), ConnState::Open);
    }
}
