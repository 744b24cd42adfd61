//! Room persistence.
//!
//! A [`Persistence`] backend is consulted twice per room lifetime:
//! `bind_state` right after the room is created (hydrate it, then start
//! recording its updates) and `write_state` once its last connection has
//! gone, before the room is discarded.

use futures_util::future::BoxFuture;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use yrs::updates::decoder::Decode;
use yrs::{Origin, ReadTxn, StateVector, Transact, Update};

use crate::room::Room;
use crate::storage::{DocumentStore, StoreConfig, StoreError};

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("invalid stored update: {0}")]
    InvalidUpdate(String),
}

/// Durable storage for room documents.
pub trait Persistence: Send + Sync {
    /// Load the stored state of `name` into `room` and keep recording its
    /// updates.
    fn bind_state<'a>(
        &'a self,
        name: &'a str,
        room: &'a Arc<Room>,
    ) -> BoxFuture<'a, Result<(), PersistenceError>>;

    /// Write the full state of `room`.
    fn write_state<'a>(
        &'a self,
        name: &'a str,
        room: &'a Arc<Room>,
    ) -> BoxFuture<'a, Result<(), PersistenceError>>;
}

/// [`Persistence`] over a RocksDB [`DocumentStore`]: a compressed snapshot
/// per room plus every update since that snapshot.
pub struct RocksPersistence {
    store: Arc<DocumentStore>,
}

impl RocksPersistence {
    pub fn new(store: Arc<DocumentStore>) -> Self {
        Self { store }
    }

    /// Open (or create) a store at `path`.
    pub fn open(path: impl Into<std::path::PathBuf>) -> Result<Self, PersistenceError> {
        let store = DocumentStore::open(StoreConfig::at(path))?;
        Ok(Self::new(Arc::new(store)))
    }

    pub fn store(&self) -> &Arc<DocumentStore> {
        &self.store
    }

    fn hydrate(&self, name: &str, room: &Room) -> Result<u64, PersistenceError> {
        let snapshot = match self.store.load_snapshot(name) {
            Ok(snapshot) => Some(snapshot),
            Err(StoreError::NotFound(_)) => None,
            Err(e) => return Err(e.into()),
        };
        let updates = self.store.load_all_updates(name)?;
        let next_version = match self.store.load_metadata(name) {
            Ok(meta) => meta.version + 1,
            Err(StoreError::NotFound(_)) => 0,
            Err(e) => return Err(e.into()),
        };
        if snapshot.is_none() && updates.is_empty() {
            return Ok(next_version);
        }

        let origin = Origin::from("persistence");
        let mut txn = room.doc().transact_mut_with(origin);
        for bytes in snapshot.iter().chain(updates.iter().map(|(_, u)| u)) {
            let update =
                Update::decode_v1(bytes).map_err(|e| PersistenceError::InvalidUpdate(e.to_string()))?;
            txn.apply_update(update)
                .map_err(|e| PersistenceError::InvalidUpdate(e.to_string()))?;
        }
        log::info!(
            "Loaded room {name} from storage ({} incremental updates)",
            updates.len()
        );
        Ok(next_version)
    }
}

impl Persistence for RocksPersistence {
    fn bind_state<'a>(
        &'a self,
        name: &'a str,
        room: &'a Arc<Room>,
    ) -> BoxFuture<'a, Result<(), PersistenceError>> {
        Box::pin(async move {
            let next_version = self.hydrate(name, room)?;

            let store = self.store.clone();
            let version = AtomicU64::new(next_version);
            let room_name = name.to_string();
            room.observe_updates(move |update| {
                let v = version.fetch_add(1, Ordering::SeqCst);
                if let Err(e) = store.store_update(&room_name, v, update) {
                    log::error!("Failed to persist update {v} of room {room_name}: {e}");
                }
            });
            Ok(())
        })
    }

    fn write_state<'a>(
        &'a self,
        name: &'a str,
        room: &'a Arc<Room>,
    ) -> BoxFuture<'a, Result<(), PersistenceError>> {
        Box::pin(async move {
            // updates are recorded while their write transaction commits, so
            // none can land between the snapshot and the compaction below
            let txn = room.doc().transact();
            let snapshot = txn.encode_state_as_update_v1(&StateVector::default());
            let meta = self.store.save_snapshot(name, &snapshot)?;
            let compacted = self.store.compact_updates(name, meta.version)?;
            drop(txn);
            log::info!(
                "Persisted room {name} ({} bytes, {compacted} updates compacted)",
                meta.snapshot_size
            );
            Ok(())
        })
    }
}
