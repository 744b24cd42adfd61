//! Persistent storage layer for room documents.
//!
//! ```text
//! ┌──────────────────┐  snapshots, updates  ┌──────────────┐
//! │ RocksPersistence │ ───────────────────► │ DocumentStore│
//! └────────┬─────────┘                      │ (RocksDB)    │
//!          │ bind_state                     └──────┬───────┘
//!          ▼                                       │ column families
//! ┌──────────────┐     ┌──────────────────────────────────────┐
//! │ Room Yrs Doc │     │ CF "documents" — snapshots (LZ4)     │
//! │ (hydrated)   │     │ CF "updates"   — incremental (LZ4)   │
//! └──────────────┘     │ CF "metadata"  — per-room (bincode)  │
//!                      └──────────────────────────────────────┘
//! ```

pub mod rocks;

pub use rocks::{DocumentMetadata, DocumentStore, StoreConfig, StoreError};
