//! WebSocket sync server: JSON text frames in, JSON text frames out.
//!
//! Architecture:
//! ```text
//! Client A ──┐                         ┌── SyncService ── Database
//!             ├── connection task ──► TransportBridge      │
//! Client B ──┘        ▲                └── CollaborationService
//!                     │                          │
//!                     └──── ConnectionHub ◄──────┘
//!                          (bounded outbound queue per connection)
//! ```
//!
//! Each connection task:
//! - registers with the hub and the pipeline
//! - writes a `connected` greeting
//! - pumps inbound frames into the bridge and hub frames to the socket
//! - unregisters everywhere on close
//!
//! Two background tasks run beside the accept loop: heartbeat expiry of
//! silent connections and the presence reaper.
//!
//! Connection URL: `ws://host:port/?user_id=<user>&session_id=<session>`.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::bridge::TransportBridge;
use crate::database::{Database, MemoryDatabase};
use crate::error::SyncError;
use crate::hub::{ConnectionHub, HubStats};
use crate::presence::{CollaborationService, PresenceConfig};
use crate::protocol::WireMessage;
use crate::pipeline::SyncService;
use crate::pubsub::{MemoryPubSub, PubSub};
use crate::types::ConnectionInfo;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Outbound queue length per connection
    pub outbound_capacity: usize,
    /// How often silent connections are checked for, in seconds
    pub heartbeat_interval_secs: u64,
    /// Silence after which a connection is dropped, in seconds
    pub heartbeat_timeout_secs: u64,
    /// Largest accepted inbound text frame, in bytes
    pub max_message_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            outbound_capacity: 256,
            heartbeat_interval_secs: 30,
            heartbeat_timeout_secs: 60,
            max_message_bytes: 1024 * 1024,
        }
    }
}

impl ServerConfig {
    /// Defaults overlaid with `TABULA_SYNC_BIND_ADDR` and
    /// `TABULA_SYNC_HEARTBEAT_SECS`.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(addr) = std::env::var("TABULA_SYNC_BIND_ADDR") {
            config.bind_addr = addr;
        }
        if let Ok(secs) = std::env::var("TABULA_SYNC_HEARTBEAT_SECS") {
            match secs.parse::<u64>() {
                Ok(secs) if secs > 0 => config.heartbeat_interval_secs = secs,
                _ => log::warn!("Ignoring invalid TABULA_SYNC_HEARTBEAT_SECS={secs:?}"),
            }
        }
        config
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub rejected_messages: u64,
    pub hub: HubStats,
}

#[derive(Default)]
struct AtomicServerStats {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    total_messages: AtomicU64,
    total_bytes: AtomicU64,
    rejected_messages: AtomicU64,
}

/// Everything a connection task needs.
#[derive(Clone)]
struct Shared {
    config: ServerConfig,
    service: Arc<SyncService>,
    hub: Arc<ConnectionHub>,
    bridge: Arc<TransportBridge>,
    collaboration: Arc<CollaborationService>,
    stats: Arc<AtomicServerStats>,
}

/// The sync server.
pub struct SyncServer {
    shared: Shared,
    shutdown: watch::Sender<bool>,
}

/// `user_id` / `session_id` from a request query string.
fn connection_params(query: Option<&str>) -> HashMap<String, String> {
    query
        .unwrap_or_default()
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .filter(|(k, v)| !k.is_empty() && !v.is_empty())
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

impl SyncServer {
    pub fn new(config: ServerConfig, db: Arc<dyn Database>, pubsub: Arc<dyn PubSub>) -> Self {
        Self::with_presence(config, PresenceConfig::default(), db, pubsub)
    }

    pub fn with_presence(
        config: ServerConfig,
        presence: PresenceConfig,
        db: Arc<dyn Database>,
        pubsub: Arc<dyn PubSub>,
    ) -> Self {
        let service = Arc::new(SyncService::new(db, pubsub));
        let hub = Arc::new(ConnectionHub::new(config.outbound_capacity));
        let collaboration = Arc::new(CollaborationService::new(hub.clone(), presence));
        let bridge = Arc::new(TransportBridge::new(
            service.clone(),
            hub.clone(),
            collaboration.clone(),
        ));
        let (shutdown, _) = watch::channel(false);
        Self {
            shared: Shared {
                config,
                service,
                hub,
                bridge,
                collaboration,
                stats: Arc::new(AtomicServerStats::default()),
            },
            shutdown,
        }
    }

    /// In-memory database and pub/sub.
    pub fn in_memory(config: ServerConfig) -> Self {
        Self::new(
            config,
            Arc::new(MemoryDatabase::new()),
            Arc::new(MemoryPubSub::new()),
        )
    }

    pub fn with_defaults() -> Self {
        Self::in_memory(ServerConfig::default())
    }

    /// Start listening for WebSocket connections.
    ///
    /// Runs until [`SyncServer::shutdown`] is called, then closes the
    /// sync service.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind(&self.shared.config.bind_addr).await?;
        log::info!("Sync server listening on {}", self.shared.config.bind_addr);

        let mut shutdown = self.shutdown.subscribe();
        let heartbeat = tokio::spawn(Self::expire_silent_connections(
            self.shared.hub.clone(),
            self.shared.config.clone(),
            self.shutdown.subscribe(),
        ));
        let reaper = tokio::spawn(
            self.shared
                .collaboration
                .clone()
                .run_presence_cleanup(self.shutdown.subscribe()),
        );

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, addr) = accepted?;
                    log::debug!("New TCP connection from {addr}");
                    let shared = self.shared.clone();
                    tokio::spawn(async move {
                        if let Err(e) = Self::handle_connection(stream, addr, shared).await {
                            log::error!("Connection error from {addr}: {e}");
                        }
                    });
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        let _ = heartbeat.await;
        let _ = reaper.await;
        self.shared.service.close().await?;
        log::info!("Sync server on {} stopped", self.shared.config.bind_addr);
        Ok(())
    }

    /// Stop the accept loop and background tasks.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    async fn expire_silent_connections(
        hub: Arc<ConnectionHub>,
        config: ServerConfig,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let timeout = Duration::from_secs(config.heartbeat_timeout_secs);
        let mut ticker =
            tokio::time::interval(Duration::from_secs(config.heartbeat_interval_secs.max(1)));
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let expired = hub.expire_stale(timeout);
                    if !expired.is_empty() {
                        log::info!("Heartbeat expired {} connections", expired.len());
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        shared: Shared,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let mut query: Option<String> = None;
        let capture_query = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
            query = req.uri().query().map(str::to_string);
            Ok(resp)
        };
        let ws_stream = tokio_tungstenite::accept_hdr_async(stream, capture_query).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        let mut params = connection_params(query.as_deref());
        let user_id = params.remove("user_id").unwrap_or_else(|| "anonymous".to_string());
        let session_id = params
            .remove("session_id")
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let conn = ConnectionInfo::new(user_id, session_id);

        shared.service.register_connection(conn.clone())?;
        let mut outbound = shared.hub.register(conn.clone());
        shared.stats.total_connections.fetch_add(1, Ordering::Relaxed);
        shared.stats.active_connections.fetch_add(1, Ordering::Relaxed);
        log::info!("WebSocket connection {} established from {addr}", conn.id);

        let result = async {
            let greeting = TransportBridge::connected_message(&conn).encode()?;
            ws_sender.send(Message::text(greeting)).await?;

            loop {
                tokio::select! {
                    msg = ws_receiver.next() => {
                        match msg {
                            Some(Ok(Message::Text(text))) => {
                                shared.hub.touch(&conn.id);
                                shared.stats.total_messages.fetch_add(1, Ordering::Relaxed);
                                shared.stats.total_bytes.fetch_add(text.len() as u64, Ordering::Relaxed);

                                let reply = if text.len() > shared.config.max_message_bytes {
                                    shared.stats.rejected_messages.fetch_add(1, Ordering::Relaxed);
                                    Some(WireMessage::from_error(&SyncError::Protocol(format!(
                                        "message of {} bytes exceeds limit of {}",
                                        text.len(),
                                        shared.config.max_message_bytes
                                    ))))
                                } else {
                                    shared.bridge.handle_text(&conn, text.as_str()).await
                                };
                                if let Some(reply) = reply {
                                    ws_sender.send(Message::text(reply.encode()?)).await?;
                                }
                            }

                            Some(Ok(Message::Binary(_))) => {
                                shared.stats.rejected_messages.fetch_add(1, Ordering::Relaxed);
                                let reply = WireMessage::from_error(&SyncError::Protocol(
                                    "binary frames are not supported".into(),
                                ));
                                ws_sender.send(Message::text(reply.encode()?)).await?;
                            }

                            Some(Ok(Message::Ping(data))) => {
                                shared.hub.touch(&conn.id);
                                ws_sender.send(Message::Pong(data)).await?;
                            }

                            Some(Ok(Message::Pong(_))) => shared.hub.touch(&conn.id),

                            Some(Ok(Message::Close(_))) | None => {
                                log::info!("Connection {} closed from {addr}", conn.id);
                                break;
                            }

                            Some(Err(e)) => {
                                log::error!("WebSocket error from {addr}: {e}");
                                break;
                            }

                            _ => {}
                        }
                    }

                    frame = outbound.recv() => {
                        match frame {
                            Some(frame) => ws_sender.send(Message::text(frame.to_string())).await?,
                            None => {
                                log::info!("Connection {} dropped by hub", conn.id);
                                break;
                            }
                        }
                    }
                }
            }
            let _ = ws_sender.close().await;
            Ok::<(), Box<dyn std::error::Error + Send + Sync>>(())
        }
        .await;

        shared.hub.unregister(&conn.id);
        shared.service.remove_connection(&conn.id);
        shared.collaboration.remove_session(&conn.user_id, &conn.session_id);
        shared.stats.active_connections.fetch_sub(1, Ordering::Relaxed);
        result
    }

    /// Get server statistics.
    pub fn stats(&self) -> ServerStats {
        let s = &self.shared.stats;
        ServerStats {
            total_connections: s.total_connections.load(Ordering::Relaxed),
            active_connections: s.active_connections.load(Ordering::Relaxed),
            total_messages: s.total_messages.load(Ordering::Relaxed),
            total_bytes: s.total_bytes.load(Ordering::Relaxed),
            rejected_messages: s.rejected_messages.load(Ordering::Relaxed),
            hub: self.shared.hub.stats(),
        }
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.shared.config.bind_addr
    }

    pub fn service(&self) -> &Arc<SyncService> {
        &self.shared.service
    }

    pub fn hub(&self) -> &Arc<ConnectionHub> {
        &self.shared.hub
    }

    pub fn bridge(&self) -> &Arc<TransportBridge> {
        &self.shared.bridge
    }

    pub fn collaboration(&self) -> &Arc<CollaborationService> {
        &self.shared.collaboration
    }
}
