//! Daemon Server Implementation
//!
//! The core server loop for the relay daemon:
//! - Accepts TCP connections and upgrades them to WebSocket
//! - Runs one [`ConnectionManager`] per client, with a dedicated writer task
//!   draining its outbound queue
//! - Tracks active connections and enforces a connection cap
//! - Cancels in-flight queries on shutdown
//!
//! ```text
//!                     RelayServer
//!                          │
//!          ┌───────────────┼───────────────┐
//!          │               │               │
//!      Web client     Web client      Web client
//!       (conn-1)       (conn-2)        (conn-3)
//!          │               │               │
//!  ConnectionManager  ConnectionManager  ConnectionManager
//!          └───────────────┴───────────────┘
//!                          │
//!              StreamRelay + PersistenceCoordinator
//! ```

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn, Instrument};

use relay_core::{ConnectionId, ConnectionManager, RelayContext, ServerMessage};

/// Connection state tracking
struct ConnectionState {
    /// When the connection was established
    connected_at: Instant,
    /// Remote address
    peer: SocketAddr,
    /// Handle to abort the connection task
    abort_handle: tokio::task::AbortHandle,
}

/// Configuration for the daemon server
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Listen address
    pub bind_address: String,
    /// Maximum number of concurrent connections
    pub max_connections: usize,
    /// Largest accepted client message in bytes
    pub max_message_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1:8765".to_string(),
            max_connections: 100,
            max_message_size: 64 * 1024,
        }
    }
}

/// The WebSocket server
pub struct RelayServer {
    /// Server configuration
    config: ServerConfig,
    /// Services shared by every connection
    context: RelayContext,
    /// Active connection state
    connection_states: Arc<DashMap<ConnectionId, ConnectionState>>,
}

impl RelayServer {
    /// Create a new server
    pub fn new(config: ServerConfig, context: RelayContext) -> Self {
        Self {
            config,
            context,
            connection_states: Arc::new(DashMap::new()),
        }
    }

    /// Bind the listening socket
    pub async fn bind(&self) -> Result<TcpListener> {
        let listener = TcpListener::bind(&self.config.bind_address)
            .await
            .with_context(|| format!("Failed to bind to {}", self.config.bind_address))?;
        info!(addr = %listener.local_addr()?, "Listening for connections");
        Ok(listener)
    }

    /// Accept connections until `shutdown` resolves
    pub async fn run<F>(&self, listener: TcpListener, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        loop {
            let (stream, peer) = tokio::select! {
                () = &mut shutdown => {
                    info!("Shutdown requested, stopping accept loop");
                    break;
                }
                accepted = listener.accept() => match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        error!(error = %e, "Accept failed");
                        continue;
                    }
                },
            };

            if self.connection_states.len() >= self.config.max_connections {
                warn!(%peer, "Connection limit reached, rejecting new connection");
                drop(stream);
                continue;
            }

            let (manager, outbound_rx) = ConnectionManager::new(self.context.clone());
            let conn_id = manager.id();

            info!(
                conn_id = %conn_id,
                %peer,
                active_connections = self.connection_states.len() + 1,
                "New connection accepted"
            );

            // The handler waits for its entry so a fast exit cannot leave one behind
            let (registered_tx, registered_rx) = oneshot::channel();
            let task_handle = tokio::spawn(
                Self::handle_connection(
                    manager,
                    stream,
                    outbound_rx,
                    registered_rx,
                    self.config.max_message_size,
                    Arc::clone(&self.connection_states),
                )
                .instrument(tracing::info_span!("connection", %conn_id)),
            );

            self.connection_states.insert(
                conn_id,
                ConnectionState {
                    connected_at: Instant::now(),
                    peer,
                    abort_handle: task_handle.abort_handle(),
                },
            );
            let _ = registered_tx.send(());
        }

        self.shutdown().await;
        Ok(())
    }

    /// Handle a single client connection
    ///
    /// The reader side feeds client messages to the manager; a writer task
    /// serializes the manager's outbound queue onto the socket.
    async fn handle_connection(
        manager: ConnectionManager,
        stream: TcpStream,
        mut outbound_rx: mpsc::Receiver<ServerMessage>,
        registered: oneshot::Receiver<()>,
        max_message_size: usize,
        connection_states: Arc<DashMap<ConnectionId, ConnectionState>>,
    ) {
        let conn_id = manager.id();
        if registered.await.is_err() {
            return;
        }
        let ws_config = WebSocketConfig {
            max_message_size: Some(max_message_size),
            max_frame_size: Some(max_message_size),
            ..WebSocketConfig::default()
        };

        let ws = match tokio_tungstenite::accept_async_with_config(stream, Some(ws_config)).await {
            Ok(ws) => ws,
            Err(e) => {
                warn!(error = %e, "WebSocket handshake failed");
                connection_states.remove(&conn_id);
                return;
            }
        };
        let (mut ws_sink, mut ws_source) = ws.split();

        let writer = tokio::spawn(
            async move {
                while let Some(message) = outbound_rx.recv().await {
                    let text = match message.to_json() {
                        Ok(text) => text,
                        Err(e) => {
                            warn!(error = %e, "Failed to encode message");
                            continue;
                        }
                    };
                    if let Err(e) = ws_sink.send(Message::Text(text)).await {
                        debug!(error = %e, "Write error");
                        break;
                    }
                }
                let _ = ws_sink.close().await;
            }
            .in_current_span(),
        );

        while let Some(message) = ws_source.next().await {
            match message {
                Ok(Message::Text(text)) => {
                    manager.handle_text(&text).await;
                }
                Ok(Message::Binary(data)) => {
                    manager.handle_text(&String::from_utf8_lossy(&data)).await;
                }
                Ok(Message::Close(_)) => {
                    info!("Client closed connection");
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    debug!(error = %e, "Read error");
                    break;
                }
            }
        }

        // Cancels any running query; its task reports ClientDisconnected
        manager.disconnect();
        drop(manager);
        writer.abort();

        connection_states.remove(&conn_id);
        info!(
            active_connections = connection_states.len(),
            "Connection handler finished"
        );
    }

    /// Abort every connection handler
    async fn shutdown(&self) {
        info!("Initiating graceful shutdown");

        let conn_ids: Vec<ConnectionId> = self.connection_states.iter().map(|r| *r.key()).collect();
        for conn_id in conn_ids {
            if let Some((_, state)) = self.connection_states.remove(&conn_id) {
                info!(
                    conn_id = %conn_id,
                    peer = %state.peer,
                    uptime_secs = state.connected_at.elapsed().as_secs(),
                    "Closing connection"
                );
                state.abort_handle.abort();
            }
        }

        // Give cancelled queries a moment to unwind
        tokio::time::sleep(Duration::from_millis(100)).await;
        info!("Shutdown complete");
    }
}
