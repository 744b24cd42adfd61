//! WebSocket sync server with room-based document routing.
//!
//! Architecture:
//! ```text
//! Client A ──┐
//!            ├── /room-name ── Room ── Yrs Doc + Awareness
//! Client B ──┘                  │
//!                               ├── Persistence (RocksDB, optional)
//!                               ├── Change callback (HTTP, optional)
//!                     ┌─────────┼─────────┐
//!                     ▼         ▼         ▼
//!                  Client A  Client B  Client C
//! ```
//!
//! Each connection:
//! - is bound to the room named by its request path (leading `/` and query
//!   stripped)
//! - may be refused during the handshake by an [`Authorize`] hook (HTTP 401)
//! - is pinged every `ping_interval` and closed if the previous ping went
//!   unanswered

use futures_util::{SinkExt, StreamExt};
use std::fs::File;
use std::io::BufReader;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_rustls::TlsAcceptor;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message;

use crate::callback::CallbackHook;
use crate::config::{ServerConfig, TlsConfig};
use crate::persistence::{PersistenceError, RocksPersistence};
use crate::room::{RoomError, RoomRegistry};
use crate::transport::ReadyState;

/// Shortest ping period a connection task will run with.
const MIN_PING_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),
    #[error("no private key found in {0}")]
    MissingPrivateKey(PathBuf),
    #[error("failed to open persistence: {0}")]
    Persistence(#[from] PersistenceError),
    #[error("failed to build callback client: {0}")]
    Callback(#[from] reqwest::Error),
}

/// Decides during the handshake whether a connection may join a room.
pub trait Authorize: Send + Sync {
    fn authorize(&self, room: &str, request: &Request) -> bool;
}

impl<F> Authorize for F
where
    F: Fn(&str, &Request) -> bool + Send + Sync,
{
    fn authorize(&self, room: &str, request: &Request) -> bool {
        self(room, request)
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub rejected_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub active_rooms: usize,
}

#[derive(Default)]
struct Counters {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    rejected_connections: AtomicU64,
    total_messages: AtomicU64,
    total_bytes: AtomicU64,
}

/// Everything a connection task needs.
#[derive(Clone)]
struct ConnectionContext {
    registry: Arc<RoomRegistry>,
    counters: Arc<Counters>,
    authorize: Option<Arc<dyn Authorize>>,
    ping_interval: Duration,
}

/// The sync server.
pub struct SyncServer {
    config: ServerConfig,
    context: ConnectionContext,
    tls: Option<TlsAcceptor>,
}

impl SyncServer {
    /// Build the server described by `config`: opens persistence, prepares the
    /// change callback and loads TLS material.
    pub fn new(config: ServerConfig) -> Result<Self, ServerError> {
        let mut registry = RoomRegistry::new(config.gc);
        if let Some(dir) = &config.persistence_dir {
            log::info!("Persisting rooms to {}", dir.display());
            registry = registry.with_persistence(Arc::new(RocksPersistence::open(dir.clone())?));
        }
        if let Some(callback) = &config.callback {
            log::info!("Change callback enabled: {}", callback.url);
            registry = registry.with_callback(Arc::new(CallbackHook::new(callback.clone())?));
        }
        Self::with_registry(config, Arc::new(registry))
    }

    /// Build around an existing registry; persistence and callback settings
    /// in `config` are ignored.
    pub fn with_registry(config: ServerConfig, registry: Arc<RoomRegistry>) -> Result<Self, ServerError> {
        let tls = config.tls.as_ref().map(load_tls).transpose()?;
        let context = ConnectionContext {
            registry,
            counters: Arc::new(Counters::default()),
            authorize: None,
            ping_interval: config.ping_interval.max(MIN_PING_INTERVAL),
        };
        Ok(Self { config, context, tls })
    }

    /// Consult `authorize` for every handshake.
    pub fn with_authorize(mut self, authorize: impl Authorize + 'static) -> Self {
        self.context.authorize = Some(Arc::new(authorize));
        self
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<RoomRegistry> {
        &self.context.registry
    }

    pub async fn stats(&self) -> ServerStats {
        let c = &self.context.counters;
        ServerStats {
            total_connections: c.total_connections.load(Ordering::Relaxed),
            active_connections: c.active_connections.load(Ordering::Relaxed),
            rejected_connections: c.rejected_connections.load(Ordering::Relaxed),
            total_messages: c.total_messages.load(Ordering::Relaxed),
            total_bytes: c.total_bytes.load(Ordering::Relaxed),
            active_rooms: self.context.registry.room_count().await,
        }
    }

    /// Bind the configured address.
    pub async fn bind(&self) -> Result<TcpListener, ServerError> {
        Ok(TcpListener::bind(self.config.bind_addr()).await?)
    }

    /// Bind and serve until the task is cancelled.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = self.bind().await?;
        self.serve(listener).await
    }

    /// Accept connections on `listener` until the task is cancelled.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        let scheme = if self.tls.is_some() { "wss" } else { "ws" };
        log::info!("Sync server listening on {scheme}://{}", listener.local_addr()?);

        loop {
            let (stream, addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    log::warn!("Failed to accept connection: {e}");
                    continue;
                }
            };
            log::debug!("New TCP connection from {addr}");

            let context = self.context.clone();
            let tls = self.tls.clone();
            tokio::spawn(async move {
                match tls {
                    Some(acceptor) => match acceptor.accept(stream).await {
                        Ok(stream) => handle_connection(stream, addr, context).await,
                        Err(e) => log::warn!("TLS handshake with {addr} failed: {e}"),
                    },
                    None => handle_connection(stream, addr, context).await,
                }
            });
        }
    }

    /// Write every room's state.
    pub async fn flush(&self) {
        self.context.registry.flush().await;
    }
}

/// Room name for a request path: leading `/` removed.
pub fn room_from_path(path: &str) -> &str {
    let path = path.split('?').next().unwrap_or_default();
    path.strip_prefix('/').unwrap_or(path)
}

async fn handle_connection<S>(stream: S, addr: SocketAddr, context: ConnectionContext)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let ConnectionContext {
        registry,
        counters,
        authorize,
        ping_interval,
    } = context;

    let mut room_name = None;
    let handshake = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        let name = room_from_path(request.uri().path()).to_string();
        if let Some(authorize) = &authorize {
            if !authorize.authorize(&name, request) {
                let mut denied = ErrorResponse::new(Some("Unauthorized".to_string()));
                *denied.status_mut() = StatusCode::UNAUTHORIZED;
                return Err(denied);
            }
        }
        room_name = Some(name);
        Ok(response)
    };
    let ws_stream = match tokio_tungstenite::accept_hdr_async(stream, handshake).await {
        Ok(ws_stream) => ws_stream,
        Err(e) => {
            counters.rejected_connections.fetch_add(1, Ordering::Relaxed);
            log::info!("Handshake with {addr} refused: {e}");
            return;
        }
    };
    let Some(room_name) = room_name else {
        return;
    };

    counters.total_connections.fetch_add(1, Ordering::Relaxed);
    counters.active_connections.fetch_add(1, Ordering::Relaxed);

    let ready_state = Arc::new(AtomicU8::new(ReadyState::Open as u8));
    let (outbound, mut outbound_rx) = mpsc::unbounded_channel();
    let (room, id) = registry.join(&room_name, outbound, ready_state.clone()).await;
    log::info!("Connection {id} from {addr} joined room {room_name}");

    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    let mut ping = tokio::time::interval_at(Instant::now() + ping_interval, ping_interval);
    let mut pong_received = true;

    loop {
        tokio::select! {
            frame = outbound_rx.recv() => match frame {
                Some(frame) => {
                    if let Err(e) = ws_sender.send(Message::Binary(frame)).await {
                        log::debug!("Send to connection {id} failed: {e}");
                        break;
                    }
                }
                // the room dropped this connection
                None => break,
            },
            message = ws_receiver.next() => match message {
                Some(Ok(Message::Binary(data))) => {
                    counters.total_messages.fetch_add(1, Ordering::Relaxed);
                    counters.total_bytes.fetch_add(data.len() as u64, Ordering::Relaxed);
                    match room.handle_frame(id, &data) {
                        Ok(()) => {}
                        Err(RoomError::Protocol(e)) => {
                            log::warn!("Dropping frame from connection {id}: {e}");
                        }
                        Err(e @ RoomError::UnknownConnection(_)) => {
                            log::debug!("{e}");
                            break;
                        }
                    }
                }
                Some(Ok(Message::Pong(_))) => pong_received = true,
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    log::debug!("WebSocket error on connection {id}: {e}");
                    break;
                }
            },
            _ = ping.tick() => {
                if !pong_received {
                    log::warn!("Connection {id} in room {room_name} missed a ping, closing");
                    break;
                }
                pong_received = false;
                if ws_sender.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
            }
        }
    }

    ready_state.store(ReadyState::Closing as u8, Ordering::SeqCst);
    let _ = ws_sender.close().await;
    registry.leave(&room, id).await;
    counters.active_connections.fetch_sub(1, Ordering::Relaxed);
    log::info!("Connection {id} left room {room_name}");
}

fn load_tls(tls: &TlsConfig) -> Result<TlsAcceptor, ServerError> {
    let certs = rustls_pemfile::certs(&mut BufReader::new(File::open(&tls.cert)?))
        .collect::<Result<Vec<_>, _>>()?;
    let key = rustls_pemfile::private_key(&mut BufReader::new(File::open(&tls.key)?))?
        .ok_or_else(|| ServerError::MissingPrivateKey(tls.key.clone()))?;

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = rustls::ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_single_cert(certs, key)?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_room_from_path() {
        assert_eq!(room_from_path("/my-room"), "my-room");
        assert_eq!(room_from_path("/my-room?token=abc"), "my-room");
        assert_eq!(room_from_path("/nested/room"), "nested/room");
        assert_eq!(room_from_path("/"), "");
    }

    #[tokio::test]
    async fn test_server_creation() {
        let server = SyncServer::new(ServerConfig::default()).unwrap();
        assert_eq!(server.config().bind_addr(), "localhost:1234");
        assert!(!server.registry().has_persistence());
        assert_eq!(server.stats().await, ServerStats::default());
    }

    #[tokio::test]
    async fn test_server_with_persistence() {
        let dir = tempfile::tempdir().unwrap();
        let config = ServerConfig {
            persistence_dir: Some(dir.path().join("db")),
            ..ServerConfig::default()
        };
        let server = SyncServer::new(config).unwrap();
        assert!(server.registry().has_persistence());
    }

    #[tokio::test]
    async fn test_zero_ping_interval_is_clamped() {
        let config = ServerConfig {
            ping_interval: Duration::ZERO,
            ..ServerConfig::default()
        };
        let server = SyncServer::new(config).unwrap();
        assert_eq!(server.context.ping_interval, MIN_PING_INTERVAL);
    }

    #[test]
    fn test_missing_tls_files() {
        let config = ServerConfig {
            tls: Some(TlsConfig {
                cert: "/nonexistent/cert.pem".into(),
                key: "/nonexistent/key.pem".into(),
            }),
            ..ServerConfig::default()
        };
        assert!(matches!(SyncServer::new(config), Err(ServerError::Io(_))));
    }

    #[test]
    fn test_tls_key_file_without_key() {
        let dir = tempfile::tempdir().unwrap();
        let cert = dir.path().join("cert.pem");
        let key = dir.path().join("key.pem");
        File::create(&cert).unwrap();
        File::create(&key)
            .unwrap()
            .write_all(b"not a pem file\n")
            .unwrap();

        let config = ServerConfig {
            tls: Some(TlsConfig { cert, key }),
            ..ServerConfig::default()
        };
        assert!(matches!(
            SyncServer::new(config),
            Err(ServerError::MissingPrivateKey(_))
        ));
    }
}
