//! Attribute table implementation.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use super::key::validate_key;
use crate::domain::errors::AttributeError;
use crate::domain::value_objects::Timestamp;

/// Table shared between the node and application handles.
pub type SharedTable = Arc<Mutex<AttributeTable>>;

/// Replicated attribute entry. `value: None` is a tombstone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeEntry {
    pub key: String,
    pub version: u64,
    pub value: Option<Vec<u8>>,
}

/// Outstanding request for a newer table version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingRequest {
    /// Version we expect to reach.
    pub version: u64,
    /// Peer the request was sent to; `None` for a push request to all neighbors.
    pub target: Option<String>,
    /// When the request was issued.
    pub since: Timestamp,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct VersionedValue {
    version: u64,
    value: Option<Vec<u8>>,
}

/// Versioned key/value map of one node.
#[derive(Debug, Clone, Default)]
pub struct AttributeTable {
    version: u64,
    version_sent: u64,
    pending: Option<PendingRequest>,
    entries: BTreeMap<String, VersionedValue>,
    notify_needed: bool,
}

impl AttributeTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fresh table behind a shared lock.
    pub fn shared() -> SharedTable {
        Arc::new(Mutex::new(Self::new()))
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn version_sent(&self) -> u64 {
        self.version_sent
    }

    /// Every local version has been announced.
    pub fn is_up_to_date(&self) -> bool {
        self.version == self.version_sent
    }

    pub fn pending(&self) -> Option<&PendingRequest> {
        self.pending.as_ref()
    }

    // =========================================================================
    // LOCAL MUTATIONS (owner only)
    // =========================================================================

    /// Set `key` to `value`, returning the previous live value.
    ///
    /// Writing the current value again does not bump the version.
    pub fn set(&mut self, key: &str, value: Vec<u8>) -> Result<Option<Vec<u8>>, AttributeError> {
        let key = validate_key(key)?;
        let previous = self.get(key).map(<[u8]>::to_vec);
        if previous.as_deref() == Some(value.as_slice()) {
            return Ok(previous);
        }
        self.write(key, Some(value));
        Ok(previous)
    }

    /// Remove `key`, leaving a tombstone. Returns the removed value.
    pub fn remove(&mut self, key: &str) -> Result<Option<Vec<u8>>, AttributeError> {
        let key = validate_key(key)?;
        let previous = self.get(key).map(<[u8]>::to_vec);
        if previous.is_some() {
            self.write(key, None);
        }
        Ok(previous)
    }

    /// Tombstone every live entry. Returns how many were removed.
    pub fn clear(&mut self) -> usize {
        let live: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, v)| v.value.is_some())
            .map(|(k, _)| k.clone())
            .collect();
        for key in &live {
            self.write(key, None);
        }
        live.len()
    }

    fn write(&mut self, key: &str, value: Option<Vec<u8>>) {
        self.version += 1;
        self.entries.insert(
            key.to_string(),
            VersionedValue {
                version: self.version,
                value,
            },
        );
        self.notify_needed = true;
    }

    // =========================================================================
    // READS
    // =========================================================================

    /// Live value of `key`.
    pub fn get(&self, key: &str) -> Option<&[u8]> {
        self.entries
            .get(key.trim())
            .and_then(|v| v.value.as_deref())
    }

    /// Live keys in order.
    pub fn keys(&self) -> Vec<String> {
        self.entries
            .iter()
            .filter(|(_, v)| v.value.is_some())
            .map(|(k, _)| k.clone())
            .collect()
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.entries.values().filter(|v| v.value.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Live entries as a plain map.
    pub fn snapshot(&self) -> BTreeMap<String, Vec<u8>> {
        self.entries
            .iter()
            .filter_map(|(k, v)| v.value.clone().map(|value| (k.clone(), value)))
            .collect()
    }

    // =========================================================================
    // REPLICATION
    // =========================================================================

    /// Entries (tombstones included) newer than `version`, ordered by key.
    pub fn delta_since(&self, version: u64) -> Vec<AttributeEntry> {
        self.entries
            .iter()
            .filter(|(_, v)| v.version > version)
            .map(|(k, v)| AttributeEntry {
                key: k.clone(),
                version: v.version,
                value: v.value.clone(),
            })
            .collect()
    }

    /// Merge a replicated delta.
    ///
    /// An entry replaces the local one only when strictly newer, and the table
    /// version becomes `max(local, table_version)`, so merging is idempotent
    /// and monotone. Returns whether any entry changed.
    pub fn merge(&mut self, table_version: u64, entries: &[AttributeEntry]) -> bool {
        let mut changed = false;
        for entry in entries {
            let newer = self
                .entries
                .get(&entry.key)
                .map_or(true, |local| entry.version > local.version);
            if newer {
                self.entries.insert(
                    entry.key.clone(),
                    VersionedValue {
                        version: entry.version,
                        value: entry.value.clone(),
                    },
                );
                changed = true;
            }
        }
        let max_entry = entries.iter().map(|e| e.version).max().unwrap_or(0);
        self.version = self.version.max(table_version).max(max_entry);
        if changed {
            self.notify_needed = true;
        }
        changed
    }

    /// Record that `version` was announced to neighbors.
    pub fn mark_version_sent(&mut self, version: u64) {
        self.version_sent = self.version_sent.max(version.min(self.version));
    }

    /// Forget every announcement so the next digest carries this table.
    pub fn reannounce(&mut self) {
        self.version_sent = 0;
    }

    // =========================================================================
    // PENDING REQUESTS
    // =========================================================================

    /// Record an outstanding request.
    pub fn mark_pending(&mut self, version: u64, target: Option<String>, now: Timestamp) {
        self.pending = Some(PendingRequest {
            version,
            target,
            since: now,
        });
    }

    pub fn clear_pending(&mut self) {
        self.pending = None;
    }

    /// Clear the pending request if it targets `target`.
    pub fn clear_pending_from(&mut self, target: &str) -> bool {
        let targeted = self
            .pending
            .as_ref()
            .is_some_and(|p| p.target.as_deref() == Some(target));
        if targeted {
            self.pending = None;
        }
        targeted
    }

    /// Whether a live request for `version` or newer is outstanding.
    pub fn pending_covers(&self, version: u64, now: Timestamp, timeout: Duration) -> bool {
        self.pending
            .as_ref()
            .is_some_and(|p| p.version >= version && !now.has_elapsed(p.since, timeout))
    }

    /// Version of an outstanding request that outlived `timeout`.
    pub fn expired_pending(&self, now: Timestamp, timeout: Duration) -> Option<u64> {
        self.pending
            .as_ref()
            .filter(|p| now.has_elapsed(p.since, timeout))
            .map(|p| p.version)
    }

    // =========================================================================
    // NOTIFICATION
    // =========================================================================

    pub fn notify_needed(&self) -> bool {
        self.notify_needed
    }

    /// Test and clear the notify flag.
    pub fn take_notify(&mut self) -> bool {
        std::mem::take(&mut self.notify_needed)
    }
}
