//! Presence registry ("awareness"): who is here and what are they doing.
//!
//! Each participant owns one JSON state blob (cursor, name, colour, ...)
//! stamped with a logical clock. Updates carrying a higher clock replace the
//! stored state; a `null` state marks the participant as gone.
//!
//! ```text
//! set_local_state() ──► clock+1 ──► on_update observers ──► broadcast
//!                                                     ▲
//! apply_update(bytes, origin) ──► merge by clock ─────┘
//!
//! check_outdated() ── renews local state every OUTDATED_TIMEOUT/2
//!                  └─ drops remote states silent for OUTDATED_TIMEOUT
//! ```
//!
//! Update wire format:
//! ```text
//! varuint count │ { varuint client_id │ varuint clock │ varString json }*
//! ```

use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};
use uuid::Uuid;
use yrs::encoding::read::{self, Cursor, Read};
use yrs::encoding::write::Write;
use yrs::Origin;

use crate::lock;

/// Identifier of a presence participant.
pub type ClientId = u64;

/// Remote states not refreshed within this window are dropped.
pub const OUTDATED_TIMEOUT: Duration = Duration::from_secs(30);

/// Participant ids touched by one registry mutation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AwarenessChanges {
    pub added: Vec<ClientId>,
    pub updated: Vec<ClientId>,
    pub removed: Vec<ClientId>,
}

impl AwarenessChanges {
    /// All touched ids, in added/updated/removed order.
    pub fn all(&self) -> Vec<ClientId> {
        self.added
            .iter()
            .chain(&self.updated)
            .chain(&self.removed)
            .copied()
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AwarenessError {
    #[error("malformed awareness update: {0}")]
    Decode(#[from] read::Error),
    #[error("invalid awareness state: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy)]
struct MetaClientState {
    clock: u32,
    last_updated: Instant,
}

#[derive(Default)]
struct Registry {
    states: HashMap<ClientId, Value>,
    meta: HashMap<ClientId, MetaClientState>,
}

type UpdateCallback = dyn Fn(&Awareness, &AwarenessChanges, Option<&Origin>) + Send + Sync;

#[derive(Default)]
struct Observers {
    next_id: u64,
    callbacks: BTreeMap<u64, Arc<UpdateCallback>>,
}

/// Handle returned by [`Awareness::on_update`]; dropping it unregisters
/// the callback.
pub struct AwarenessSubscription {
    id: u64,
    observers: Weak<Mutex<Observers>>,
}

impl Drop for AwarenessSubscription {
    fn drop(&mut self) {
        if let Some(observers) = self.observers.upgrade() {
            lock(&observers).callbacks.remove(&self.id);
        }
    }
}

/// Clocked map of participant id → state blob.
///
/// Observers are invoked synchronously from the mutating call, after the
/// internal lock has been released, so they may read the registry freely.
pub struct Awareness {
    client_id: ClientId,
    registry: Mutex<Registry>,
    observers: Arc<Mutex<Observers>>,
}

impl Awareness {
    /// Registry with a random local client id.
    pub fn new() -> Self {
        Self::with_client_id(Uuid::new_v4().as_u128() as u32 as ClientId)
    }

    /// Registry for a given local client id. The local state starts as `{}`.
    pub fn with_client_id(client_id: ClientId) -> Self {
        let mut registry = Registry::default();
        registry.states.insert(client_id, Value::Object(Default::default()));
        registry.meta.insert(
            client_id,
            MetaClientState {
                clock: 0,
                last_updated: Instant::now(),
            },
        );
        Self {
            client_id,
            registry: Mutex::new(registry),
            observers: Arc::new(Mutex::new(Observers::default())),
        }
    }

    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    // ─── Observers ────────────────────────────────────────────────────

    /// Register a callback fired after every mutation that touched at
    /// least one participant.
    pub fn on_update<F>(&self, callback: F) -> AwarenessSubscription
    where
        F: Fn(&Awareness, &AwarenessChanges, Option<&Origin>) + Send + Sync + 'static,
    {
        let mut observers = lock(&self.observers);
        let id = observers.next_id;
        observers.next_id += 1;
        observers.callbacks.insert(id, Arc::new(callback));
        AwarenessSubscription {
            id,
            observers: Arc::downgrade(&self.observers),
        }
    }

    fn emit(&self, changes: &AwarenessChanges, origin: Option<&Origin>) {
        if changes.is_empty() {
            return;
        }
        let callbacks: Vec<Arc<UpdateCallback>> =
            lock(&self.observers).callbacks.values().cloned().collect();
        for callback in callbacks {
            callback(self, changes, origin);
        }
    }

    // ─── Local state ──────────────────────────────────────────────────

    pub fn local_state(&self) -> Option<Value> {
        lock(&self.registry).states.get(&self.client_id).cloned()
    }

    /// Replace the local state; `None` announces that this client left.
    pub fn set_local_state(&self, state: Option<Value>) {
        let changes = {
            let mut registry = lock(&self.registry);
            let clock = registry
                .meta
                .get(&self.client_id)
                .map_or(0, |m| m.clock.wrapping_add(1));
            let previous = match state.clone() {
                Some(value) => registry.states.insert(self.client_id, value),
                None => registry.states.remove(&self.client_id),
            };
            registry.meta.insert(
                self.client_id,
                MetaClientState {
                    clock,
                    last_updated: Instant::now(),
                },
            );

            let mut changes = AwarenessChanges::default();
            match (state, previous) {
                (None, Some(_)) => changes.removed.push(self.client_id),
                (None, None) => {}
                (Some(_), None) => changes.added.push(self.client_id),
                (Some(_), Some(_)) => changes.updated.push(self.client_id),
            }
            changes
        };
        self.emit(&changes, None);
    }

    /// Serialize `state` and make it the local state.
    pub fn set_local_state_as<S: Serialize>(&self, state: &S) -> Result<(), AwarenessError> {
        let value = serde_json::to_value(state)?;
        self.set_local_state(Some(value));
        Ok(())
    }

    /// Set one field of the local state object.
    pub fn set_local_field(&self, key: &str, value: Value) {
        let mut state = match self.local_state() {
            Some(Value::Object(map)) => map,
            _ => Default::default(),
        };
        state.insert(key.to_string(), value);
        self.set_local_state(Some(Value::Object(state)));
    }

    // ─── Queries ──────────────────────────────────────────────────────

    pub fn state(&self, client_id: ClientId) -> Option<Value> {
        lock(&self.registry).states.get(&client_id).cloned()
    }

    pub fn states(&self) -> HashMap<ClientId, Value> {
        lock(&self.registry).states.clone()
    }

    pub fn clock(&self, client_id: ClientId) -> Option<u32> {
        lock(&self.registry).meta.get(&client_id).map(|m| m.clock)
    }

    /// Number of participants with a live state.
    pub fn len(&self) -> usize {
        lock(&self.registry).states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // ─── Removal ──────────────────────────────────────────────────────

    /// Drop the given participants. Removing the local client bumps its clock
    /// so the removal wins against the last broadcast state.
    pub fn remove_states(&self, ids: &[ClientId], origin: Option<&Origin>) -> AwarenessChanges {
        let changes = {
            let mut registry = lock(&self.registry);
            let mut changes = AwarenessChanges::default();
            for &id in ids {
                if registry.states.remove(&id).is_none() {
                    continue;
                }
                if id == self.client_id {
                    if let Some(meta) = registry.meta.get_mut(&id) {
                        meta.clock = meta.clock.wrapping_add(1);
                        meta.last_updated = Instant::now();
                    }
                }
                changes.removed.push(id);
            }
            changes
        };
        self.emit(&changes, origin);
        changes
    }

    /// Drop every participant except the local one.
    pub fn remove_remote_states(&self, origin: Option<&Origin>) -> AwarenessChanges {
        let remote: Vec<ClientId> = lock(&self.registry)
            .states
            .keys()
            .copied()
            .filter(|id| *id != self.client_id)
            .collect();
        self.remove_states(&remote, origin)
    }

    // ─── Encoding ─────────────────────────────────────────────────────

    /// Encode the current state of `ids`; absent participants encode as
    /// `null` at their current clock. Unknown ids are skipped.
    pub fn encode_update(&self, ids: &[ClientId]) -> Vec<u8> {
        let registry = lock(&self.registry);
        let entries: Vec<(ClientId, u32, String)> = ids
            .iter()
            .filter_map(|id| {
                let meta = registry.meta.get(id)?;
                let json = registry
                    .states
                    .get(id)
                    .map_or_else(|| "null".to_string(), |v| v.to_string());
                Some((*id, meta.clock, json))
            })
            .collect();
        drop(registry);
        write_entries(&entries)
    }

    /// Encode `ids` as removed without touching the registry.
    pub fn encode_removal(&self, ids: &[ClientId]) -> Vec<u8> {
        let registry = lock(&self.registry);
        let entries: Vec<(ClientId, u32, String)> = ids
            .iter()
            .filter_map(|id| {
                registry
                    .meta
                    .get(id)
                    .map(|meta| (*id, meta.clock, "null".to_string()))
            })
            .collect();
        drop(registry);
        write_entries(&entries)
    }

    /// Encode every participant with a live state.
    pub fn encode_full_update(&self) -> Vec<u8> {
        let ids: Vec<ClientId> = lock(&self.registry).states.keys().copied().collect();
        self.encode_update(&ids)
    }

    // ─── Merging ──────────────────────────────────────────────────────

    /// Merge an encoded update received from a peer.
    ///
    /// The whole update is decoded before anything is applied, so a
    /// malformed update leaves the registry untouched.
    pub fn apply_update(
        &self,
        update: &[u8],
        origin: Option<&Origin>,
    ) -> Result<AwarenessChanges, AwarenessError> {
        let mut cursor = Cursor::new(update);
        let count: u32 = cursor.read_var()?;
        let mut entries = Vec::with_capacity(count.min(1024) as usize);
        for _ in 0..count {
            let client_id: ClientId = cursor.read_var()?;
            let clock: u32 = cursor.read_var()?;
            let state: Value = serde_json::from_str(cursor.read_string()?)?;
            entries.push((client_id, clock, state));
        }

        let changes = {
            let mut registry = lock(&self.registry);
            let now = Instant::now();
            let mut changes = AwarenessChanges::default();
            for (client_id, mut clock, state) in entries {
                let current = registry.meta.get(&client_id).map(|m| m.clock);
                let known = registry.states.contains_key(&client_id);
                let current_clock = current.unwrap_or(0);
                let newer = current_clock < clock;
                let equal_removal = current_clock == clock && state.is_null() && known;
                if !(newer || equal_removal) {
                    continue;
                }

                if state.is_null() {
                    if client_id == self.client_id && known {
                        // a peer cannot remove us; answer with a fresher clock
                        clock = clock.wrapping_add(1);
                        changes.updated.push(client_id);
                    } else if registry.states.remove(&client_id).is_some() {
                        changes.removed.push(client_id);
                    }
                } else {
                    let previous = registry.states.insert(client_id, state);
                    if previous.is_some() {
                        changes.updated.push(client_id);
                    } else {
                        changes.added.push(client_id);
                    }
                }
                registry.meta.insert(
                    client_id,
                    MetaClientState {
                        clock,
                        last_updated: now,
                    },
                );
            }
            changes
        };
        self.emit(&changes, origin);
        Ok(changes)
    }

    // ─── Liveness ─────────────────────────────────────────────────────

    /// Renew a stale local state and expire silent remote ones.
    pub fn check_outdated(&self) -> AwarenessChanges {
        self.check_outdated_at(Instant::now())
    }

    pub fn check_outdated_at(&self, now: Instant) -> AwarenessChanges {
        let (renew, expired) = {
            let registry = lock(&self.registry);
            let age = |meta: &MetaClientState| now.saturating_duration_since(meta.last_updated);
            let renew = match (
                registry.states.get(&self.client_id),
                registry.meta.get(&self.client_id),
            ) {
                (Some(state), Some(meta)) if age(meta) >= OUTDATED_TIMEOUT / 2 => {
                    Some(state.clone())
                }
                _ => None,
            };
            let expired: Vec<ClientId> = registry
                .meta
                .iter()
                .filter(|&(id, meta)| {
                    *id != self.client_id
                        && age(meta) >= OUTDATED_TIMEOUT
                        && registry.states.contains_key(id)
                })
                .map(|(id, _)| *id)
                .collect();
            (renew, expired)
        };

        if let Some(state) = renew {
            self.set_local_state(Some(state));
        }
        if expired.is_empty() {
            return AwarenessChanges::default();
        }
        log::debug!("Expiring {} silent awareness states", expired.len());
        self.remove_states(&expired, None)
    }
}

impl Default for Awareness {
    fn default() -> Self {
        Self::new()
    }
}

fn write_entries(entries: &[(ClientId, u32, String)]) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.write_var(entries.len() as u32);
    for (client_id, clock, json) in entries {
        buf.write_var(*client_id);
        buf.write_var(*clock);
        buf.write_string(json);
    }
    buf
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_local_state_starts_empty_object() {
        let awareness = Awareness::with_client_id(1);
        assert_eq!(awareness.local_state(), Some(json!({})));
        assert_eq!(awareness.clock(1), Some(0));
        assert_eq!(awareness.len(), 1);
    }

    #[test]
    fn test_set_local_state_bumps_clock() {
        let awareness = Awareness::with_client_id(1);
        awareness.set_local_field("cursor", json!(5));
        assert_eq!(awareness.clock(1), Some(1));
        assert_eq!(awareness.local_state(), Some(json!({"cursor": 5})));

        awareness.set_local_state(None);
        assert_eq!(awareness.clock(1), Some(2));
        assert!(awareness.local_state().is_none());
    }

    #[test]
    fn test_set_local_state_from_struct() {
        #[derive(Serialize)]
        struct User<'a> {
            name: &'a str,
            color: &'a str,
        }

        let awareness = Awareness::with_client_id(1);
        awareness
            .set_local_state_as(&User { name: "ada", color: "#30bced" })
            .unwrap();
        assert_eq!(awareness.clock(1), Some(1));
        assert_eq!(
            awareness.local_state(),
            Some(json!({"name": "ada", "color": "#30bced"}))
        );

        let remote = Awareness::with_client_id(2);
        remote.apply_update(&awareness.encode_update(&[1]), None).unwrap();
        assert_eq!(remote.state(1), awareness.local_state());

        // JSON objects need string keys
        let mut cells = BTreeMap::new();
        cells.insert((0u32, 1u32), 1u32);
        assert!(awareness.set_local_state_as(&cells).is_err());
        assert_eq!(awareness.clock(1), Some(1));
    }

    #[test]
    fn test_update_propagates_between_registries() {
        let a = Awareness::with_client_id(1);
        let b = Awareness::with_client_id(2);
        a.set_local_field("cursor", json!(5));

        let changes = b.apply_update(&a.encode_update(&[1]), None).unwrap();
        assert_eq!(changes.added, vec![1]);
        assert_eq!(b.state(1), Some(json!({"cursor": 5})));

        // same clock again is ignored
        let changes = b.apply_update(&a.encode_update(&[1]), None).unwrap();
        assert!(changes.is_empty());
    }

    #[test]
    fn test_removal_at_equal_clock() {
        let a = Awareness::with_client_id(1);
        let b = Awareness::with_client_id(2);
        b.apply_update(&a.encode_update(&[1]), None).unwrap();
        assert!(b.state(1).is_some());

        let changes = b.apply_update(&a.encode_removal(&[1]), None).unwrap();
        assert_eq!(changes.removed, vec![1]);
        assert!(b.state(1).is_none());
    }

    #[test]
    fn test_stale_update_ignored() {
        let a = Awareness::with_client_id(1);
        let b = Awareness::with_client_id(2);
        let old = a.encode_update(&[1]);
        a.set_local_field("name", json!("alice"));
        b.apply_update(&a.encode_update(&[1]), None).unwrap();

        let changes = b.apply_update(&old, None).unwrap();
        assert!(changes.is_empty());
        assert_eq!(b.state(1), Some(json!({"name": "alice"})));
    }

    #[test]
    fn test_remote_cannot_remove_local_state() {
        let a = Awareness::with_client_id(1);
        let b = Awareness::with_client_id(2);
        b.apply_update(&a.encode_update(&[1]), None).unwrap();

        let changes = a.apply_update(&b.encode_removal(&[1]), None).unwrap();
        assert_eq!(changes.updated, vec![1]);
        assert_eq!(a.local_state(), Some(json!({})));
        assert_eq!(a.clock(1), Some(1));
    }

    #[test]
    fn test_observer_receives_origin_and_unsubscribes() {
        let awareness = Awareness::with_client_id(1);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let sub = awareness.on_update(move |_, changes, origin| {
            assert_eq!(changes.updated, vec![1]);
            assert!(origin.is_none());
            counter.fetch_add(1, Ordering::SeqCst);
        });

        awareness.set_local_field("x", json!(1));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        drop(sub);
        awareness.set_local_field("x", json!(2));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_observer_may_read_registry() {
        let awareness = Arc::new(Awareness::with_client_id(1));
        let seen = Arc::new(Mutex::new(None));
        let sink = seen.clone();
        let _sub = awareness.on_update(move |registry, _, _| {
            *sink.lock().unwrap() = registry.local_state();
        });
        awareness.set_local_field("cursor", json!(3));
        assert_eq!(*seen.lock().unwrap(), Some(json!({"cursor": 3})));
    }

    #[test]
    fn test_remove_remote_states_keeps_local() {
        let a = Awareness::with_client_id(1);
        let b = Awareness::with_client_id(2);
        let c = Awareness::with_client_id(3);
        a.apply_update(&b.encode_update(&[2]), None).unwrap();
        a.apply_update(&c.encode_update(&[3]), None).unwrap();
        assert_eq!(a.len(), 3);

        let mut changes = a.remove_remote_states(None);
        changes.removed.sort();
        assert_eq!(changes.removed, vec![2, 3]);
        assert_eq!(a.len(), 1);
        assert!(a.local_state().is_some());
    }

    #[test]
    fn test_check_outdated_expires_remote_and_renews_local() {
        let a = Awareness::with_client_id(1);
        let b = Awareness::with_client_id(2);
        a.apply_update(&b.encode_update(&[2]), None).unwrap();

        let later = Instant::now() + OUTDATED_TIMEOUT + Duration::from_secs(1);
        let changes = a.check_outdated_at(later);
        assert_eq!(changes.removed, vec![2]);
        assert_eq!(a.clock(1), Some(1));
        assert!(a.state(2).is_none());
    }

    #[test]
    fn test_full_update_and_malformed_input() {
        let a = Awareness::with_client_id(1);
        let b = Awareness::with_client_id(2);
        b.apply_update(&a.encode_full_update(), None).unwrap();
        assert_eq!(b.len(), 2);

        assert!(matches!(
            b.apply_update(&[0x05], None),
            Err(AwarenessError::Decode(_))
        ));

        let mut bad_json = Vec::new();
        bad_json.write_var(1u32);
        bad_json.write_var(9u64);
        bad_json.write_var(1u32);
        bad_json.write_string("{not json");
        assert!(matches!(
            b.apply_update(&bad_json, None),
            Err(AwarenessError::Json(_))
        ));
        assert_eq!(b.len(), 2);
    }
}
