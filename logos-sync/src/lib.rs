//! # logos-sync — CRDT document synchronization over WebSocket
//!
//! Relays Yrs update packets and presence ("awareness") state between
//! everyone editing the same room, and fans them out to same-process
//! listeners through a cross-tab bus.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────┐   WebSocket    ┌───────────────────┐
//! │ WebsocketProvider │ ◄────────────► │ SyncServer        │
//! │ (per room)        │  envelope v0   │ (all rooms)       │
//! └────┬─────────┬────┘                └─────────┬─────────┘
//!      │         │ CrossTabBus                   │
//!      │         ▼                               ▼
//!      │   other providers              ┌─────────────────┐
//!      ▼   in this process              │ RoomRegistry    │
//! ┌──────────┐                          │  Room: Doc,     │
//! │ Yrs Doc  │                          │  Awareness,     │
//! │ Awareness│                          │  connections    │
//! └──────────┘                          └────────┬────────┘
//!                                                │ bind/write state
//!                                       ┌────────┴────────┐
//!                                       │ RocksPersistence│
//!                                       └─────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — outer message envelope (type tag + payload)
//! - [`sync`] — sync step 1/2, update and auth sub-messages
//! - [`awareness`] — clocked presence registry
//! - [`dispatch`] — message dispatch table and frame builders
//! - [`crosstab`] — in-process pub/sub between providers
//! - [`transport`] — pluggable connection backends, fragmentation
//! - [`provider`] — client synchronization session
//! - [`room`] — server rooms and the room registry
//! - [`server`] — WebSocket listener, liveness probing, TLS
//! - [`persistence`] — persistence contract and RocksDB backend
//! - [`callback`] — debounced HTTP change notifications
//! - [`config`] — environment configuration
//! - [`storage`] — RocksDB document store

use std::sync::{Mutex, MutexGuard, PoisonError};

pub mod protocol;
pub mod sync;
pub mod awareness;
pub mod dispatch;
pub mod crosstab;
pub mod transport;
pub mod provider;
pub mod room;
pub mod server;
pub mod persistence;
pub mod callback;
pub mod config;
pub mod storage;

// Re-exports for convenience
pub use awareness::{Awareness, AwarenessChanges, AwarenessError, ClientId};
pub use crosstab::{CrossTabBus, CrossTabMessage};
pub use config::{ConfigError, ServerConfig};
pub use persistence::{Persistence, PersistenceError, RocksPersistence};
pub use protocol::{MessageType, ProtocolError};
pub use provider::{ConnectionStatus, ProviderEvent, ProviderOptions, WebsocketProvider};
pub use room::{ConnectionId, Room, RoomRegistry};
pub use server::{Authorize, ServerError, ServerStats, SyncServer};
pub use storage::{DocumentMetadata, DocumentStore, StoreConfig, StoreError};
pub use transport::{Connector, FragmentingConnector, ReadyState, TransportError, WebSocketConnector};

/// Lock a std mutex, recovering the data if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
