//! Authoritative in-memory map of registered game servers.
//!
//! The store owns every [`ServerEntry`]. Callers receive clones, never
//! references into the map, so a snapshot can't observe a half-applied write
//! and can't outlive a deletion.
//!
//! Writes are serialized per entry by the shard lock of the underlying
//! [`DashMap`]: a registration, a heartbeat and a sweeper transition for the
//! same id can't interleave. Writes to different ids proceed in parallel.
//!
//! The store stores what it was told. Read-time interpretation of staleness
//! (offline after the soft timeout, absent after the hard timeout) is applied
//! by readers through [`StalenessPolicy`]; the store only uses the policy to
//! decide that a write against an expired entry starts from scratch.

use crate::clock::{HeartbeatClock, StalenessPolicy};
use crate::error::{RegistryError, RegistryResult};
use crate::types::{Capacity, HeartbeatPatch, Registration, ServerEntry, ServerStatus, Timestamp};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::debug;

/// Concurrent map of server entries, keyed by id.
///
/// Shared by the façade, admission and the sweeper through an `Arc`.
#[derive(Debug)]
pub struct RegistryStore {
    entries: DashMap<String, ServerEntry>,
    clock: Arc<dyn HeartbeatClock>,
    policy: StalenessPolicy,
}

impl RegistryStore {
    /// Creates an empty store that reads time from `clock` and judges
    /// expiry with `policy`.
    pub fn new(clock: Arc<dyn HeartbeatClock>, policy: StalenessPolicy) -> Self {
        Self {
            entries: DashMap::new(),
            clock,
            policy,
        }
    }

    pub fn clock(&self) -> &Arc<dyn HeartbeatClock> {
        &self.clock
    }

    pub fn policy(&self) -> &StalenessPolicy {
        &self.policy
    }

    pub fn now(&self) -> Timestamp {
        self.clock.now_millis()
    }

    /// Inserts or fully replaces the entry for `registration.id`.
    ///
    /// Re-registration keeps the first `registered_at` and never moves
    /// `last_heartbeat_at` backward. If the existing entry is already past the
    /// hard timeout it is discarded and the registration creates a fresh
    /// entry instead of merging with stale state.
    pub fn upsert(&self, registration: Registration) -> ServerEntry {
        let now = self.now();
        let heartbeat_at = registration.last_heartbeat_at.unwrap_or(now);
        let mut entry = ServerEntry {
            id: registration.id,
            address: registration.address,
            capacity: Capacity::new(0, registration.max_capacity),
            status: ServerStatus::Online,
            metadata: registration.metadata,
            performance: None,
            last_heartbeat_at: heartbeat_at,
            registered_at: now,
        };

        match self.entries.entry(entry.id.clone()) {
            Entry::Occupied(mut slot) => {
                let existing = slot.get();
                if existing.is_expired(&self.policy, now) {
                    debug!(server_id = %entry.id, "Replacing expired entry with fresh registration");
                } else {
                    entry.registered_at = existing.registered_at;
                    entry.last_heartbeat_at = heartbeat_at.max(existing.last_heartbeat_at);
                }
                slot.insert(entry.clone());
            }
            Entry::Vacant(slot) => {
                slot.insert(entry.clone());
            }
        }

        entry
    }

    /// Merges a heartbeat into an existing entry and refreshes its timestamp.
    ///
    /// Never creates an entry. An entry past the hard timeout is treated as
    /// gone: it is removed and the heartbeat fails with `NotRegistered`.
    pub fn apply_heartbeat(&self, id: &str, patch: HeartbeatPatch) -> RegistryResult<ServerEntry> {
        let now = self.now();

        {
            let mut slot = self
                .entries
                .get_mut(id)
                .ok_or_else(|| RegistryError::NotRegistered(id.to_string()))?;

            if !slot.is_expired(&self.policy, now) {
                let entry = slot.value_mut();
                entry.capacity.current = patch.current_players;
                if let Some(max) = patch.max_capacity {
                    entry.capacity.max = max;
                }
                entry.status = patch.status.unwrap_or(ServerStatus::Online);
                if let Some(performance) = patch.performance {
                    entry.performance = Some(performance);
                }
                if let Some(metadata) = patch.metadata {
                    entry.metadata.merge(metadata);
                }
                entry.last_heartbeat_at = entry.last_heartbeat_at.max(now);
                return Ok(entry.clone());
            }
        }

        // The shard guard is released above; removing while holding it would deadlock.
        self.entries
            .remove_if(id, |_, entry| entry.is_expired(&self.policy, now));
        Err(RegistryError::NotRegistered(id.to_string()))
    }

    /// Removes an entry. Returns whether a live entry existed.
    ///
    /// Removing an entry that is already past the hard timeout still deletes
    /// it but reports `false`, as readers already treat it as absent.
    pub fn remove(&self, id: &str) -> bool {
        let now = self.now();
        match self.entries.remove(id) {
            Some((_, entry)) => !entry.is_expired(&self.policy, now),
            None => false,
        }
    }

    /// Snapshot of a single entry, exactly as stored.
    pub fn get(&self, id: &str) -> Option<ServerEntry> {
        self.entries.get(id).map(|e| e.value().clone())
    }

    /// Snapshot of every stored entry.
    pub fn list(&self) -> Vec<ServerEntry> {
        self.entries.iter().map(|e| e.value().clone()).collect()
    }

    /// Direct status transition that leaves `last_heartbeat_at` untouched.
    pub fn mark_status(&self, id: &str, status: ServerStatus) -> bool {
        match self.entries.get_mut(id) {
            Some(mut slot) => {
                slot.status = status;
                true
            }
            None => false,
        }
    }

    /// Like [`mark_status`](Self::mark_status), but only if no heartbeat has
    /// landed since the caller observed `seen_heartbeat_at`.
    pub fn mark_status_if_unchanged(
        &self,
        id: &str,
        status: ServerStatus,
        seen_heartbeat_at: Timestamp,
    ) -> bool {
        match self.entries.get_mut(id) {
            Some(mut slot) if slot.last_heartbeat_at == seen_heartbeat_at => {
                slot.status = status;
                true
            }
            _ => false,
        }
    }

    /// Removes the entry only if no heartbeat has landed since the caller
    /// observed `seen_heartbeat_at`.
    pub fn remove_if_unchanged(&self, id: &str, seen_heartbeat_at: Timestamp) -> bool {
        self.entries
            .remove_if(id, |_, entry| entry.last_heartbeat_at == seen_heartbeat_at)
            .is_some()
    }

    /// Inserts a previously persisted entry verbatim unless the id is taken.
    pub fn restore(&self, entry: ServerEntry) -> bool {
        match self.entries.entry(entry.id.clone()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(entry);
                true
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
