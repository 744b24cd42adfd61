//! Integration tests for end-to-end WebSocket synchronization.
//!
//! These tests start a real server and connect real providers,
//! verifying the full sync pipeline.

use futures_util::{SinkExt, StreamExt};
use logos_sync::dispatch;
use logos_sync::{
    ConnectionStatus, ProviderEvent, ProviderOptions, Room, ServerConfig, ServerStats, SyncServer,
    WebsocketProvider,
};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::time::{timeout, Duration, Instant};
use tokio_tungstenite::tungstenite::handshake::server::Request;
use tokio_tungstenite::tungstenite::Message;
use yrs::{Doc, GetString, ReadTxn, StateVector, Text, Transact, WriteTxn};

const WAIT: Duration = Duration::from_secs(5);

/// Start a server on an ephemeral port; returns it with its `ws://` address.
async fn start_test_server(config: ServerConfig) -> (Arc<SyncServer>, String) {
    let server = Arc::new(SyncServer::new(config).unwrap());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    let running = server.clone();
    tokio::spawn(async move {
        let _ = running.serve(listener).await;
    });
    (server, url)
}

fn insert(doc: &Doc, text: &str) {
    let mut txn = doc.transact_mut();
    let t = txn.get_or_insert_text("content");
    let len = t.len(&txn);
    t.insert(&mut txn, len, text);
}

fn text_of(doc: &Doc) -> String {
    let txn = doc.transact();
    txn.get_text("content")
        .map(|t| t.get_string(&txn))
        .unwrap_or_default()
}

async fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

async fn wait_for_room(server: &SyncServer, name: &str) -> Arc<Room> {
    let deadline = Instant::now() + WAIT;
    loop {
        if let Some(room) = server.registry().get(name).await {
            return room;
        }
        assert!(Instant::now() < deadline, "room {name} never created");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn wait_for_stats(server: &SyncServer, condition: impl Fn(&ServerStats) -> bool) -> ServerStats {
    let deadline = Instant::now() + WAIT;
    loop {
        let stats = server.stats().await;
        if condition(&stats) || Instant::now() >= deadline {
            return stats;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn wait_for(events: &mut broadcast::Receiver<ProviderEvent>, expected: ProviderEvent) {
    let deadline = Instant::now() + WAIT;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match timeout(remaining, events.recv()).await {
            Ok(Ok(event)) if event == expected => return,
            Ok(Ok(_)) => {}
            other => panic!("expected {expected:?}, got {other:?}"),
        }
    }
}

#[tokio::test]
async fn test_server_accepts_connections() {
    let (server, url) = start_test_server(ServerConfig::default()).await;

    let (mut ws, _) = tokio_tungstenite::connect_async(format!("{url}/raw"))
        .await
        .expect("Should connect to server");

    // first frame is the server's sync step 1
    let first = timeout(WAIT, ws.next()).await.unwrap().unwrap().unwrap();
    assert_eq!(&first.into_data()[..2], &[0, 0]);
    assert_eq!(server.stats().await.active_rooms, 1);
}

#[tokio::test]
async fn test_local_edit_reaches_server() {
    let (server, url) = start_test_server(ServerConfig::default()).await;
    let doc = Doc::new();
    let provider = WebsocketProvider::new(&url, "a", doc.clone(), ProviderOptions::default());
    let mut events = provider.subscribe();

    wait_for(&mut events, ProviderEvent::Synced(true)).await;
    insert(&doc, "hi");

    let room = wait_for_room(&server, "a").await;
    assert!(wait_until(|| text_of(room.doc()) == "hi").await);
    assert!(provider.is_connected());
    assert_eq!(provider.unsynced_changes(), 0);
}

#[tokio::test]
async fn test_offline_edits_sync_on_connect() {
    let (server, url) = start_test_server(ServerConfig::default()).await;
    let doc = Doc::new();
    let options = ProviderOptions {
        connect: false,
        ..ProviderOptions::default()
    };
    let provider = WebsocketProvider::new(&url, "offline", doc.clone(), options);
    insert(&doc, "written offline");
    assert!(wait_until(|| provider.unsynced_changes() == 1).await);

    provider.connect();
    assert!(wait_until(|| provider.is_synced()).await);
    let room = server.registry().get("offline").await.unwrap();
    assert!(wait_until(|| text_of(room.doc()) == "written offline").await);
    assert_eq!(provider.unsynced_changes(), 0);
}

#[tokio::test]
async fn test_two_providers_converge() {
    let (_server, url) = start_test_server(ServerConfig::default()).await;
    let doc1 = Doc::new();
    let doc2 = Doc::new();
    let p1 = WebsocketProvider::new(&url, "shared", doc1.clone(), ProviderOptions::default());
    let p2 = WebsocketProvider::new(&url, "shared", doc2.clone(), ProviderOptions::default());
    assert!(wait_until(|| p1.is_synced() && p2.is_synced()).await);

    insert(&doc1, "hello");
    assert!(wait_until(|| text_of(&doc2) == "hello").await);
    insert(&doc2, " world");
    assert!(wait_until(|| text_of(&doc1) == "hello world").await);
}

#[tokio::test]
async fn test_rooms_are_isolated() {
    let (_server, url) = start_test_server(ServerConfig::default()).await;
    let doc1 = Doc::new();
    let doc2 = Doc::new();
    let p1 = WebsocketProvider::new(&url, "room-1", doc1.clone(), ProviderOptions::default());
    let p2 = WebsocketProvider::new(&url, "room-2", doc2.clone(), ProviderOptions::default());
    assert!(wait_until(|| p1.is_synced() && p2.is_synced()).await);

    insert(&doc1, "only in room 1");
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(text_of(&doc2), "");
}

#[tokio::test]
async fn test_synced_emitted_once_with_resync() {
    let (_server, url) = start_test_server(ServerConfig::default()).await;
    let options = ProviderOptions {
        resync_interval: Some(Duration::from_millis(50)),
        ..ProviderOptions::default()
    };
    let provider = WebsocketProvider::new(&url, "resync", Doc::new(), options);
    let mut events = provider.subscribe();
    wait_for(&mut events, ProviderEvent::Synced(true)).await;
    wait_for(&mut events, ProviderEvent::Sync(true)).await;

    tokio::time::sleep(Duration::from_millis(400)).await;
    let mut repeated = 0;
    while let Ok(event) = events.try_recv() {
        if matches!(event, ProviderEvent::Synced(_) | ProviderEvent::Sync(_)) {
            repeated += 1;
        }
    }
    assert_eq!(repeated, 0, "synced must fire once per connection");
    assert!(provider.is_synced());
}

#[tokio::test]
async fn test_reconnect_after_dropped_connection() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    let server = Arc::new(SyncServer::new(ServerConfig::default()).unwrap());

    let doc = Doc::new();
    let provider = WebsocketProvider::new(&url, "flaky", doc, ProviderOptions::default());
    let mut events = provider.subscribe();

    // complete the first handshake, then drop the socket
    let (stream, _) = listener.accept().await.unwrap();
    let ws = tokio_tungstenite::accept_async(stream).await.unwrap();
    wait_for(&mut events, ProviderEvent::Status(ConnectionStatus::Connected)).await;
    drop(ws);
    wait_for(&mut events, ProviderEvent::Status(ConnectionStatus::Disconnected)).await;

    let running = server.clone();
    tokio::spawn(async move {
        let _ = running.serve(listener).await;
    });
    wait_for(&mut events, ProviderEvent::Status(ConnectionStatus::Connected)).await;
    assert_eq!(provider.unsuccessful_reconnects(), 0);
    assert!(wait_until(|| provider.is_synced()).await);
}

#[tokio::test]
async fn test_synced_resets_when_connection_drops() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    let server = Arc::new(SyncServer::new(ServerConfig::default()).unwrap());

    let provider = WebsocketProvider::new(&url, "reset", Doc::new(), ProviderOptions::default());
    let mut events = provider.subscribe();

    // a bare server that completes the sync, then vanishes
    let (stream, _) = listener.accept().await.unwrap();
    let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
    let step2 = dispatch::sync_step2_frame(&Doc::new(), &StateVector::default());
    ws.send(Message::Binary(step2.into())).await.unwrap();
    wait_for(&mut events, ProviderEvent::Synced(true)).await;
    assert!(provider.is_synced());

    drop(ws);
    wait_for(&mut events, ProviderEvent::Synced(false)).await;
    wait_for(&mut events, ProviderEvent::Status(ConnectionStatus::Disconnected)).await;
    assert!(!provider.is_synced());

    let running = server.clone();
    tokio::spawn(async move {
        let _ = running.serve(listener).await;
    });
    wait_for(&mut events, ProviderEvent::Synced(true)).await;

    tokio::time::sleep(Duration::from_millis(300)).await;
    let mut repeated = 0;
    while let Ok(event) = events.try_recv() {
        if matches!(event, ProviderEvent::Synced(_)) {
            repeated += 1;
        }
    }
    assert_eq!(repeated, 0, "synced must fire once after reconnecting");
    assert!(provider.is_synced());
}

#[tokio::test]
async fn test_unreachable_server_backs_off() {
    // nothing listens on the port once the listener is dropped
    let port = TcpListener::bind("127.0.0.1:0")
        .await
        .unwrap()
        .local_addr()
        .unwrap()
        .port();
    let options = ProviderOptions {
        backoff_base: Duration::from_millis(10),
        max_backoff_time: Duration::from_millis(40),
        ..ProviderOptions::default()
    };
    let provider = WebsocketProvider::new(&format!("ws://127.0.0.1:{port}"), "nowhere", Doc::new(), options);

    assert!(wait_until(|| provider.unsuccessful_reconnects() >= 3).await);
    assert!(!provider.is_connected());

    provider.disconnect();
    tokio::time::sleep(Duration::from_millis(100)).await;
    let attempts = provider.unsuccessful_reconnects();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(provider.unsuccessful_reconnects(), attempts, "no attempts after disconnect");
}

#[tokio::test]
async fn test_watchdog_reconnects_quiet_connection() {
    let (_server, url) = start_test_server(ServerConfig::default()).await;
    let options = ProviderOptions {
        message_reconnect_timeout: Duration::from_millis(300),
        ..ProviderOptions::default()
    };
    let provider = WebsocketProvider::new(&url, "quiet", Doc::new(), options);
    let mut events = provider.subscribe();

    wait_for(&mut events, ProviderEvent::Status(ConnectionStatus::Connected)).await;
    wait_for(&mut events, ProviderEvent::Status(ConnectionStatus::Disconnected)).await;
    wait_for(&mut events, ProviderEvent::Status(ConnectionStatus::Connected)).await;
}

#[tokio::test]
async fn test_authorize_rejects_handshake() {
    let server = SyncServer::new(ServerConfig::default())
        .unwrap()
        .with_authorize(|room: &str, _request: &Request| room != "secret");
    let server = Arc::new(server);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    let running = server.clone();
    tokio::spawn(async move {
        let _ = running.serve(listener).await;
    });

    assert!(tokio_tungstenite::connect_async(format!("{url}/secret"))
        .await
        .is_err());
    assert!(tokio_tungstenite::connect_async(format!("{url}/public"))
        .await
        .is_ok());

    let stats = wait_for_stats(&server, |s| s.rejected_connections == 1).await;
    assert_eq!(stats.rejected_connections, 1);
    assert_eq!(stats.total_connections, 1);
    assert!(server.registry().get("secret").await.is_none());
}

#[tokio::test]
async fn test_server_closes_connection_without_pong() {
    let config = ServerConfig {
        ping_interval: Duration::from_millis(100),
        ..ServerConfig::default()
    };
    let (server, url) = start_test_server(config).await;

    // never polled, so pings are never answered
    let (_silent, _) = tokio_tungstenite::connect_async(format!("{url}/ping")).await.unwrap();
    let room = wait_for_room(&server, "ping").await;
    assert_eq!(room.connection_count(), 1);

    assert!(wait_until(|| room.connection_count() == 0).await);
    let stats = wait_for_stats(&server, |s| s.active_connections == 0).await;
    assert_eq!(stats.active_connections, 0);
    assert_eq!(stats.total_connections, 1);
}

#[tokio::test]
async fn test_provider_answers_pings() {
    let config = ServerConfig {
        ping_interval: Duration::from_millis(100),
        ..ServerConfig::default()
    };
    let (server, url) = start_test_server(config).await;
    let provider = WebsocketProvider::new(&url, "alive", Doc::new(), ProviderOptions::default());
    assert!(wait_until(|| provider.is_synced()).await);

    tokio::time::sleep(Duration::from_millis(500)).await;
    let room = server.registry().get("alive").await.unwrap();
    assert_eq!(room.connection_count(), 1);
    assert!(provider.is_connected());
}
