//! TCP front end
//!
//! Accepts connections and drives one [`DeliveryPipeline`] per socket: a
//! reader task feeds the line codec and applies records in order, a writer
//! task drains the connection's outbound queue. The transport owns the
//! socket exclusively; the engine only ever sees attachments.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::error::{ChatError, Result};
use crate::protocol::codec::LineCodec;
use crate::protocol::events::ServerEvent;
use crate::server::engine::ChatEngine;
use crate::server::pipeline::{DeliveryPipeline, Progress};
use crate::storage::MessageStore;
use crate::ChatConfig;

/// TCP chat server
pub struct ChatServer {
    config: ChatConfig,
    engine: Arc<ChatEngine>,
    listener: TcpListener,
    active: Arc<AtomicUsize>,
}

impl ChatServer {
    /// Bind the listen socket and build the engine
    pub async fn bind(config: ChatConfig, store: Arc<dyn MessageStore>) -> Result<Self> {
        let listener = TcpListener::bind(config.bind_addr)
            .await
            .map_err(|e| ChatError::network(format!("failed to bind {}: {}", config.bind_addr, e)))?;
        let engine = ChatEngine::new(config.clone(), store);
        Ok(Self {
            config,
            engine,
            listener,
            active: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// The bound address, useful when binding to port 0
    pub fn local_addr(&self) -> Result<std::net::SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn engine(&self) -> Arc<ChatEngine> {
        Arc::clone(&self.engine)
    }

    /// Accept connections until the listener fails
    pub async fn run(self) -> Result<()> {
        info!("listening on {}", self.listener.local_addr()?);

        loop {
            let (socket, addr) = match self.listener.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    error!("accept failed: {}", e);
                    continue;
                }
            };

            if self.active.load(Ordering::Acquire) >= self.config.max_connections {
                warn!("connection limit reached, rejecting {}", addr);
                drop(socket);
                continue;
            }
            self.active.fetch_add(1, Ordering::AcqRel);

            let engine = Arc::clone(&self.engine);
            let config = self.config.clone();
            let active = Arc::clone(&self.active);
            tokio::spawn(async move {
                handle_socket(engine, config, socket, addr).await;
                active.fetch_sub(1, Ordering::AcqRel);
            });
        }
    }
}

async fn handle_socket(
    engine: Arc<ChatEngine>,
    config: ChatConfig,
    socket: TcpStream,
    addr: std::net::SocketAddr,
) {
    debug!("connection from {}", addr);

    let (mut reader, write_half) = socket.into_split();
    let writer = Arc::new(Mutex::new(write_half));
    let idle = Duration::from_secs(config.idle_timeout_secs);

    let mut codec = LineCodec::with_max_line(config.max_event_size);
    let mut pipeline = DeliveryPipeline::new(engine);
    let mut kill: Option<watch::Receiver<bool>> = None;
    let mut buf = vec![0u8; 4096];

    'conn: loop {
        let read = async { timeout(idle, reader.read(&mut buf)).await };
        let n = if let Some(signal) = kill.as_mut() {
            tokio::select! {
                result = read => result,
                _ = signal.changed() => {
                    debug!("connection {} dropped by server", addr);
                    break 'conn;
                }
            }
        } else {
            read.await
        };

        let n = match n {
            Err(_) => {
                debug!("connection {} idle timeout", addr);
                break 'conn;
            }
            Ok(Ok(0)) => break 'conn,
            Ok(Ok(n)) => n,
            Ok(Err(e)) => {
                debug!("read error from {}: {}", addr, e);
                break 'conn;
            }
        };

        codec.feed(&buf[..n]);
        loop {
            match codec.decode_next() {
                Ok(Some(line)) => {
                    if line.is_empty() {
                        continue;
                    }
                    match pipeline.handle_line(&line).await {
                        Ok(Progress::Handled) => {}
                        Ok(Progress::Attached(rx)) => {
                            // Joined: the writer task takes over the
                            // outbound queue; the kill signal lets the
                            // server drop the whole connection.
                            if let Some(att) = pipeline.attachment() {
                                let signal = att.kill_signal();
                                kill = Some(signal.clone());
                                tokio::spawn(writer_loop(rx, Arc::clone(&writer), signal));
                            }
                        }
                        Ok(Progress::Reply(event)) => {
                            if write_event(&writer, &event).await.is_err() {
                                break 'conn;
                            }
                        }
                        Err(e) => {
                            warn!("closing {}: {}", addr, e);
                            let reply = ServerEvent::Error {
                                code: e.code(),
                                message: e.message().to_string(),
                            };
                            let _ = write_event(&writer, &reply).await;
                            break 'conn;
                        }
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    // Framing is broken; the stream cannot be resynced
                    let err = ChatError::protocol(e.to_string());
                    warn!("closing {}: {}", addr, err);
                    let reply = ServerEvent::Error {
                        code: err.code(),
                        message: err.message().to_string(),
                    };
                    let _ = write_event(&writer, &reply).await;
                    break 'conn;
                }
            }
        }
    }

    pipeline.close().await;
    debug!("connection from {} closed", addr);
}

/// Drain the outbound queue onto the socket until the queue closes, the
/// kill signal fires, or a write fails.
async fn writer_loop(
    mut rx: mpsc::Receiver<ServerEvent>,
    writer: Arc<Mutex<OwnedWriteHalf>>,
    mut kill: watch::Receiver<bool>,
) {
    loop {
        let event = tokio::select! {
            event = rx.recv() => match event {
                Some(event) => event,
                None => break,
            },
            _ = kill.changed() => break,
        };
        if write_event(&writer, &event).await.is_err() {
            break;
        }
    }
}

async fn write_event(
    writer: &Arc<Mutex<OwnedWriteHalf>>,
    event: &ServerEvent,
) -> std::io::Result<()> {
    let line = event
        .encode_line()
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    let mut writer = writer.lock().await;
    writer.write_all(&line).await
}
