//! Chat client implementation
//!
//! A small client for the line protocol: connect, join a room, send
//! events and receive real-time updates. Used by the integration tests
//! and handy for driving a server from other tooling.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use crate::error::{ChatError, Result};
use crate::protocol::codec::LineCodec;
use crate::protocol::events::{ClientEvent, MessageId, ServerEvent};

/// Chat client configuration
#[derive(Clone, Debug)]
pub struct ChatClientConfig {
    /// Server address to connect to
    pub server_addr: SocketAddr,
    /// Connection timeout in seconds
    pub connect_timeout_secs: u64,
    /// Maximum size of a single wire record in bytes
    pub max_event_size: usize,
}

impl Default for ChatClientConfig {
    fn default() -> Self {
        Self {
            server_addr: "127.0.0.1:7878".parse().unwrap(),
            connect_timeout_secs: 10,
            max_event_size: 64 * 1024,
        }
    }
}

/// Line-protocol chat client
pub struct ChatClient {
    reader: OwnedReadHalf,
    writer: OwnedWriteHalf,
    codec: LineCodec,
    buf: Vec<u8>,
    username: Option<String>,
}

impl ChatClient {
    /// Connect to the chat server
    pub async fn connect(config: ChatClientConfig) -> Result<Self> {
        let connecting = TcpStream::connect(config.server_addr);
        let stream = timeout(Duration::from_secs(config.connect_timeout_secs), connecting)
            .await
            .map_err(|_| ChatError::timeout("connect timed out"))?
            .map_err(|e| ChatError::network(format!("connect failed: {}", e)))?;
        stream
            .set_nodelay(true)
            .map_err(|e| ChatError::network(format!("set_nodelay failed: {}", e)))?;

        let (reader, writer) = stream.into_split();
        debug!("connected to {}", config.server_addr);
        Ok(Self {
            reader,
            writer,
            codec: LineCodec::with_max_line(config.max_event_size),
            buf: vec![0u8; 4096],
            username: None,
        })
    }

    /// Connect to a specific address with default settings
    pub async fn connect_to(addr: SocketAddr) -> Result<Self> {
        Self::connect(ChatClientConfig {
            server_addr: addr,
            ..ChatClientConfig::default()
        })
        .await
    }

    /// Join a room and wait for the server's first reply, normally the
    /// `joined` acknowledgment. Pass `since_id` after a reconnect to
    /// replay only the gap.
    pub async fn join(
        &mut self,
        username: &str,
        room: &str,
        since_id: Option<MessageId>,
    ) -> Result<ServerEvent> {
        self.username = Some(username.to_string());
        self.send(&ClientEvent::Join {
            username: username.to_string(),
            room: room.to_string(),
            since_id,
        })
        .await?;
        self.next_event().await
    }

    /// Send one event record
    pub async fn send(&mut self, event: &ClientEvent) -> Result<()> {
        let line = event.encode_line()?;
        self.writer.write_all(&line).await?;
        Ok(())
    }

    /// Send a raw line, newline appended; useful for protocol testing
    pub async fn send_raw(&mut self, raw: &[u8]) -> Result<()> {
        self.writer.write_all(raw).await?;
        self.writer.write_all(b"\n").await?;
        Ok(())
    }

    /// Publish a message to the joined room
    pub async fn send_chat(&mut self, message: &str) -> Result<()> {
        let username = self.identity()?;
        self.send(&ClientEvent::ChatMessage {
            message: message.to_string(),
            username,
        })
        .await
    }

    /// Send a typing indicator
    pub async fn send_typing(&mut self, is_typing: bool) -> Result<()> {
        let username = self.identity()?;
        self.send(&ClientEvent::Typing {
            is_typing,
            username,
        })
        .await
    }

    /// Acknowledge reading one message
    pub async fn send_read_receipt(&mut self, message_id: MessageId) -> Result<()> {
        let username = self.identity()?;
        self.send(&ClientEvent::ReadReceipt {
            message_id,
            username,
        })
        .await
    }

    /// Report a window-focus catch-up for everything up to `message_id`
    pub async fn send_catch_up(&mut self, message_id: MessageId) -> Result<()> {
        let username = self.identity()?;
        self.send(&ClientEvent::CatchUp {
            message_id,
            username,
        })
        .await
    }

    /// Receive the next event, waiting as long as it takes
    pub async fn next_event(&mut self) -> Result<ServerEvent> {
        loop {
            if let Some(line) = self.codec.decode_next()? {
                if line.is_empty() {
                    continue;
                }
                return Ok(ServerEvent::decode(&line)?);
            }
            let n = self.reader.read(&mut self.buf).await?;
            if n == 0 {
                return Err(ChatError::connection("server closed the connection"));
            }
            self.codec.feed(&self.buf[..n]);
        }
    }

    /// Receive the next event, or `None` if the wait times out
    pub async fn next_event_timeout(&mut self, wait: Duration) -> Result<Option<ServerEvent>> {
        match timeout(wait, self.next_event()).await {
            Ok(event) => event.map(Some),
            Err(_) => Ok(None),
        }
    }

    /// Receive events until one matches the predicate, bounded by a
    /// per-event timeout
    pub async fn next_matching<F>(&mut self, wait: Duration, mut pred: F) -> Result<ServerEvent>
    where
        F: FnMut(&ServerEvent) -> bool,
    {
        loop {
            match self.next_event_timeout(wait).await? {
                Some(event) if pred(&event) => return Ok(event),
                Some(_) => continue,
                None => return Err(ChatError::timeout("no matching event arrived")),
            }
        }
    }

    fn identity(&self) -> Result<String> {
        self.username
            .clone()
            .ok_or_else(|| ChatError::connection("join a room before sending events"))
    }
}
