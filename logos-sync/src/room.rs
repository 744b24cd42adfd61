//! Server-side rooms and the room registry.
//!
//! ```text
//!  connection 1 ──┐                     ┌──► connection 1
//!  connection 2 ──┼─► Room::handle_frame│
//!  connection 3 ──┘     │               ├──► connection 2
//!                       ▼               │
//!              Yrs Doc / Awareness ─────┴──► connection 3
//!                 (observers broadcast)
//! ```
//!
//! Each room maintains:
//! - A Yrs `Doc`, the authoritative state served to new joiners
//! - An `Awareness` registry shared by every connection
//! - The connection set, in registration order, with the presence ids each
//!   connection controls
//!
//! Broadcasts are driven by the document and registry observers, never by
//! the frame handler.

use bytes::Bytes;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use yrs::{Doc, Options, Origin};

use crate::awareness::{Awareness, AwarenessSubscription, ClientId, OUTDATED_TIMEOUT};
use crate::callback::CallbackHook;
use crate::dispatch;
use crate::lock;
use crate::persistence::Persistence;
use crate::protocol::ProtocolError;
use crate::transport::ReadyState;

/// Identifies one connection within the registry.
pub type ConnectionId = u64;

/// Outbound half handed to a room for one connection.
pub type Outbound = mpsc::UnboundedSender<Bytes>;

#[derive(Debug, Error)]
pub enum RoomError {
    #[error("connection {0} is not registered in this room")]
    UnknownConnection(ConnectionId),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

struct ConnectionHandle {
    outbound: Outbound,
    ready_state: Arc<AtomicU8>,
    /// Presence participants announced through this connection
    controlled: HashSet<ClientId>,
}

impl ConnectionHandle {
    fn send(&self, frame: Bytes) -> bool {
        ReadyState::from(self.ready_state.load(Ordering::SeqCst)) == ReadyState::Open
            && self.outbound.send(frame).is_ok()
    }
}

/// One shared document and everyone connected to it.
pub struct Room {
    name: String,
    doc: Doc,
    awareness: Arc<Awareness>,
    connections: Mutex<BTreeMap<ConnectionId, ConnectionHandle>>,
    destroyed: AtomicBool,
    doc_subscription: Mutex<Option<yrs::Subscription>>,
    awareness_subscription: Mutex<Option<AwarenessSubscription>>,
    /// Listeners registered by persistence and the change callback
    extra_subscriptions: Mutex<Vec<yrs::Subscription>>,
}

impl Room {
    /// Create a room. `gc = false` keeps deleted content (`skip_gc`).
    pub fn new(name: &str, gc: bool) -> Arc<Self> {
        let doc = Doc::with_options(Options {
            skip_gc: !gc,
            ..Options::default()
        });
        let awareness = Arc::new(Awareness::with_client_id(doc.client_id()));
        // the server itself is not a participant
        awareness.set_local_state(None);

        Arc::new_cyclic(|weak: &Weak<Room>| {
            let doc_subscription = {
                let weak = weak.clone();
                doc.observe_update_v1(move |_, event| {
                    if let Some(room) = weak.upgrade() {
                        room.broadcast(dispatch::update_frame(&event.update));
                    }
                })
                .map_err(|_| log::error!("Could not observe updates of room {name}"))
                .ok()
            };

            let awareness_subscription = {
                let weak = weak.clone();
                awareness.on_update(move |awareness, changes, _| {
                    if let Some(room) = weak.upgrade() {
                        let update = awareness.encode_update(&changes.all());
                        room.broadcast(dispatch::awareness_frame(&update));
                    }
                })
            };

            Room {
                name: name.to_string(),
                doc,
                awareness,
                connections: Mutex::new(BTreeMap::new()),
                destroyed: AtomicBool::new(false),
                doc_subscription: Mutex::new(doc_subscription),
                awareness_subscription: Mutex::new(Some(awareness_subscription)),
                extra_subscriptions: Mutex::new(Vec::new()),
            }
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn doc(&self) -> &Doc {
        &self.doc
    }

    pub fn awareness(&self) -> &Arc<Awareness> {
        &self.awareness
    }

    pub fn connection_count(&self) -> usize {
        lock(&self.connections).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.connections).is_empty()
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    /// Presence ids currently controlled by `id`.
    pub fn controlled_ids(&self, id: ConnectionId) -> Vec<ClientId> {
        let connections = lock(&self.connections);
        let mut ids: Vec<ClientId> = connections
            .get(&id)
            .map(|conn| conn.controlled.iter().copied().collect())
            .unwrap_or_default();
        ids.sort_unstable();
        ids
    }

    /// Call `f` with every document update (v1 encoded) until the room is
    /// destroyed.
    pub fn observe_updates<F>(&self, f: F)
    where
        F: Fn(&[u8]) + Send + Sync + 'static,
    {
        match self.doc.observe_update_v1(move |_, event| f(&event.update)) {
            Ok(subscription) => lock(&self.extra_subscriptions).push(subscription),
            Err(_) => log::error!("Could not observe updates of room {}", self.name),
        }
    }

    /// Register a connection and greet it with sync step 1 and, if anyone
    /// is present, the full presence snapshot.
    pub fn add_connection(&self, id: ConnectionId, outbound: Outbound, ready_state: Arc<AtomicU8>) {
        lock(&self.connections).insert(
            id,
            ConnectionHandle {
                outbound,
                ready_state,
                controlled: HashSet::new(),
            },
        );
        log::debug!("Connection {id} joined room {}", self.name);

        self.send_to(id, dispatch::sync_step1_frame(&self.doc));
        if !self.awareness.is_empty() {
            self.send_to(id, dispatch::awareness_frame(&self.awareness.encode_full_update()));
        }
    }

    /// Handle one inbound frame from connection `id`. Replies go to `id` only.
    pub fn handle_frame(&self, id: ConnectionId, frame: &[u8]) -> Result<(), RoomError> {
        if !lock(&self.connections).contains_key(&id) {
            return Err(RoomError::UnknownConnection(id));
        }
        let origin = connection_origin(id);
        let outcome = dispatch::dispatch(frame, &self.doc, &self.awareness, &origin)?;

        if let Some(changes) = &outcome.awareness_changes {
            let mut connections = lock(&self.connections);
            if let Some(conn) = connections.get_mut(&id) {
                conn.controlled.extend(changes.added.iter().copied());
                for removed in &changes.removed {
                    conn.controlled.remove(removed);
                }
            }
        }
        if let Some(reply) = outcome.reply {
            self.send_to(id, reply);
        }
        Ok(())
    }

    /// Unregister a connection and drop the presence entries it controlled,
    /// broadcasting their removal. Returns false if it was not registered.
    pub fn remove_connection(&self, id: ConnectionId) -> bool {
        let Some(conn) = lock(&self.connections).remove(&id) else {
            return false;
        };
        conn.ready_state
            .store(ReadyState::Closed as u8, Ordering::SeqCst);
        let controlled: Vec<ClientId> = conn.controlled.into_iter().collect();
        if !controlled.is_empty() {
            self.awareness.remove_states(&controlled, None);
        }
        log::debug!("Connection {id} left room {}", self.name);
        true
    }

    /// Send `frame` to every connection in registration order; connections
    /// that cannot take it are removed.
    pub fn broadcast(&self, frame: Vec<u8>) {
        let frame = Bytes::from(frame);
        let failed: Vec<ConnectionId> = lock(&self.connections)
            .iter()
            .filter(|(_, conn)| !conn.send(frame.clone()))
            .map(|(id, _)| *id)
            .collect();
        for id in failed {
            self.remove_connection(id);
        }
    }

    fn send_to(&self, id: ConnectionId, frame: Vec<u8>) {
        let delivered = lock(&self.connections)
            .get(&id)
            .is_some_and(|conn| conn.send(Bytes::from(frame)));
        if !delivered {
            self.remove_connection(id);
        }
    }

    /// Drop all listeners and connections. The room must not be used after.
    pub fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        lock(&self.doc_subscription).take();
        lock(&self.awareness_subscription).take();
        lock(&self.extra_subscriptions).clear();
        let connections = std::mem::take(&mut *lock(&self.connections));
        for conn in connections.values() {
            conn.ready_state
                .store(ReadyState::Closed as u8, Ordering::SeqCst);
        }
        log::info!("Room {} destroyed", self.name);
    }
}

/// Origin tag for changes applied on behalf of a connection.
pub fn connection_origin(id: ConnectionId) -> Origin {
    Origin::from(format!("conn-{id}").as_str())
}

/// Expire stale presence entries until the room goes away.
fn spawn_presence_expiry(room: &Arc<Room>) {
    let weak = Arc::downgrade(room);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(OUTDATED_TIMEOUT / 10);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            match weak.upgrade() {
                Some(room) if !room.is_destroyed() => {
                    room.awareness.check_outdated();
                }
                _ => break,
            }
        }
    });
}

// ───────────────────────────────────────────────────────────────────
// Registry
// ───────────────────────────────────────────────────────────────────

/// All live rooms, keyed by name.
///
/// Lookup-or-create and connection registration happen under one lock, so
/// there is never more than one room per name.
pub struct RoomRegistry {
    rooms: tokio::sync::Mutex<HashMap<String, Arc<Room>>>,
    gc: bool,
    persistence: Option<Arc<dyn Persistence>>,
    callback: Option<Arc<CallbackHook>>,
    next_connection: AtomicU64,
}

impl Default for RoomRegistry {
    fn default() -> Self {
        Self::new(true)
    }
}

impl RoomRegistry {
    pub fn new(gc: bool) -> Self {
        Self {
            rooms: tokio::sync::Mutex::new(HashMap::new()),
            gc,
            persistence: None,
            callback: None,
            next_connection: AtomicU64::new(1),
        }
    }

    pub fn with_persistence(mut self, persistence: Arc<dyn Persistence>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    pub fn with_callback(mut self, callback: Arc<CallbackHook>) -> Self {
        self.callback = Some(callback);
        self
    }

    pub fn has_persistence(&self) -> bool {
        self.persistence.is_some()
    }

    /// Join `name`, creating (and hydrating) the room on first use, and
    /// register the connection.
    pub async fn join(
        &self,
        name: &str,
        outbound: Outbound,
        ready_state: Arc<AtomicU8>,
    ) -> (Arc<Room>, ConnectionId) {
        let mut rooms = self.rooms.lock().await;
        let room = match rooms.get(name) {
            Some(room) => room.clone(),
            None => {
                let room = Room::new(name, self.gc);
                if let Some(persistence) = &self.persistence {
                    if let Err(e) = persistence.bind_state(name, &room).await {
                        log::error!("Failed to load room {name}, starting empty: {e}");
                    }
                }
                if let Some(callback) = &self.callback {
                    callback.attach(&room);
                }
                spawn_presence_expiry(&room);
                rooms.insert(name.to_string(), room.clone());
                log::info!("Room {name} created ({} active)", rooms.len());
                room
            }
        };
        let id = self.next_connection.fetch_add(1, Ordering::SeqCst);
        room.add_connection(id, outbound, ready_state);
        (room, id)
    }

    /// Remove connection `id` from `room`. If that leaves the room empty and
    /// persistence is configured, its state is written and the room is
    /// discarded. Without persistence empty rooms stay resident.
    pub async fn leave(&self, room: &Arc<Room>, id: ConnectionId) {
        room.remove_connection(id);
        let Some(persistence) = &self.persistence else {
            return;
        };

        let mut rooms = self.rooms.lock().await;
        let current = rooms
            .get(room.name())
            .is_some_and(|registered| Arc::ptr_eq(registered, room));
        if !current || !room.is_empty() {
            return;
        }
        if let Err(e) = persistence.write_state(room.name(), room).await {
            log::error!("Failed to persist room {}: {e}", room.name());
        }
        rooms.remove(room.name());
        room.destroy();
    }

    pub async fn get(&self, name: &str) -> Option<Arc<Room>> {
        self.rooms.lock().await.get(name).cloned()
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.lock().await.len()
    }

    pub async fn room_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.rooms.lock().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Write every room's state (on shutdown). Rooms stay registered.
    pub async fn flush(&self) {
        let Some(persistence) = &self.persistence else {
            return;
        };
        let rooms: Vec<Arc<Room>> = self.rooms.lock().await.values().cloned().collect();
        for room in rooms {
            if let Err(e) = persistence.write_state(room.name(), &room).await {
                log::error!("Failed to persist room {}: {e}", room.name());
            }
        }
    }
}
