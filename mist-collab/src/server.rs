//! WebSocket relay host built on a shared [`SessionHub`].
//!
//! Architecture:
//! ```text
//! Client A ──┐                          ┌── ChannelPeer A ── writer task A
//!             ├── ingest ── SessionHub ──┤
//! Client B ──┘      │                   └── ChannelPeer B ── writer task B
//!                   │
//!                   └── broadcast_except(origin)
//! ```
//!
//! Each connection is one peer. Its outgoing frames arrive on an mpsc
//! channel fed by the hub's broadcaster, so the hub never awaits a socket.
//! Inbound frames are ingested under the hub lock, then relayed to every
//! other peer.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, RwLock};
use tokio_tungstenite::tungstenite::Message;

use crate::broadcast::{ChannelPeer, PeerId};
use crate::hub::{HubConfig, IngestOutcome, SessionHub};
use crate::session::SessionId;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Maximum concurrent peers
    pub max_peers: usize,
    /// WebSocket ping interval in seconds
    pub heartbeat_interval_secs: u64,
    /// Settings for the hub created by [`SyncServer::new`]
    pub hub: HubConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            max_peers: 100,
            heartbeat_interval_secs: 30,
            hub: HubConfig::default(),
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub rejected_connections: u64,
    pub total_frames: u64,
    pub total_bytes: u64,
    pub rejected_frames: u64,
    pub relayed_frames: u64,
}

/// The relay host.
pub struct SyncServer {
    config: ServerConfig,
    hub: Arc<Mutex<SessionHub>>,
    stats: Arc<RwLock<ServerStats>>,
}

impl SyncServer {
    /// Create a server with a fresh hub built from `config.hub`.
    pub fn new(config: ServerConfig) -> Self {
        let hub = SessionHub::new(config.hub.clone());
        Self::with_hub(config, hub)
    }

    /// Create a server around a preconfigured hub (signer, handlers, policy).
    pub fn with_hub(config: ServerConfig, hub: SessionHub) -> Self {
        Self {
            config,
            hub: Arc::new(Mutex::new(hub)),
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    /// Bind and serve until the listener fails.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Session host listening on {}", self.config.bind_addr);
        self.serve(listener).await
    }

    /// Accept connections on an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let hub = self.hub.clone();
            let stats = self.stats.clone();
            let config = self.config.clone();

            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, hub, stats, config).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        hub: Arc<Mutex<SessionHub>>,
        stats: Arc<RwLock<ServerStats>>,
        config: ServerConfig,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        let peer_id = PeerId::new();
        let (sink, mut outgoing) = ChannelPeer::new();
        {
            let mut hub = hub.lock().await;
            if hub.broadcaster().peer_count() >= config.max_peers {
                drop(hub);
                log::warn!("Rejecting {addr}: peer limit {} reached", config.max_peers);
                stats.write().await.rejected_connections += 1;
                ws_sender.send(Message::Close(None)).await?;
                return Ok(());
            }
            hub.add_peer(peer_id, Box::new(sink));
        }

        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }
        log::info!("Peer {peer_id} connected from {addr}");

        let mut joined: Option<SessionId> = None;
        let mut heartbeat = tokio::time::interval(Duration::from_secs(config.heartbeat_interval_secs.max(1)));
        heartbeat.tick().await;

        loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Binary(data))) => {
                            let bytes: Vec<u8> = data.into();
                            {
                                let mut s = stats.write().await;
                                s.total_frames += 1;
                                s.total_bytes += bytes.len() as u64;
                            }

                            let (result, relayed) = {
                                let mut hub = hub.lock().await;
                                match hub.ingest(Some(peer_id), &bytes) {
                                    Ok(outcome) => {
                                        let relayed = if outcome.should_relay() {
                                            hub.broadcaster_mut()
                                                .broadcast_except(&peer_id, Arc::new(bytes))
                                        } else {
                                            0
                                        };
                                        (Ok(outcome), relayed)
                                    }
                                    Err(e) => (Err(e), 0),
                                }
                            };

                            match result {
                                Ok(IngestOutcome::Joined(id)) => {
                                    log::info!("Peer {peer_id} is session {id}");
                                    joined = Some(id);
                                }
                                Ok(IngestOutcome::Left(id)) => {
                                    if joined.as_ref() == Some(&id) {
                                        joined = None;
                                    }
                                }
                                Ok(IngestOutcome::Throttled(id)) => {
                                    log::debug!("Dropped frame from throttled session {id}");
                                }
                                Ok(_) => {}
                                Err(e) => {
                                    log::warn!("Rejected frame from {addr}: {e}");
                                    stats.write().await.rejected_frames += 1;
                                }
                            }
                            if relayed > 0 {
                                stats.write().await.relayed_frames += 1;
                            }
                        }

                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("Connection closed from {addr}");
                            break;
                        }

                        Some(Ok(Message::Ping(data))) => {
                            if let Err(e) = ws_sender.send(Message::Pong(data)).await {
                                log::warn!("Failed to answer ping from {addr}: {e}");
                                break;
                            }
                        }

                        Some(Err(e)) => {
                            log::error!("WebSocket error from {addr}: {e}");
                            break;
                        }

                        _ => {}
                    }
                }

                frame = outgoing.recv() => {
                    match frame {
                        Some(data) => {
                            if let Err(e) = ws_sender.send(Message::Binary(data.to_vec().into())).await {
                                log::warn!("Failed to forward frame to {addr}: {e}");
                                break;
                            }
                        }
                        // Pruned by the broadcaster.
                        None => break,
                    }
                }

                _ = heartbeat.tick() => {
                    if let Err(e) = ws_sender.send(Message::Ping(Vec::new().into())).await {
                        log::warn!("Heartbeat to {addr} failed: {e}");
                        break;
                    }
                }
            }
        }

        // Cleanup runs on every exit from the loop: drop the peer, then
        // announce the session's departure.
        {
            let mut hub = hub.lock().await;
            hub.remove_peer(&peer_id);
            if let Some(id) = joined {
                if let Err(e) = hub.leave(&id) {
                    log::warn!("Failed to announce departure of {id}: {e}");
                }
            }
        }

        stats.write().await.active_connections -= 1;
        log::info!("Peer {peer_id} disconnected");
        Ok(())
    }

    /// Shared handle to the hub, for wiring handlers or inspecting sessions.
    pub fn hub(&self) -> Arc<Mutex<SessionHub>> {
        self.hub.clone()
    }

    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }
}
