//! Retained history of departed nodes.

use std::collections::BTreeMap;
use std::time::Duration;

use crate::domain::attribute_table::SharedTable;
use crate::domain::entities::{NodeRef, NodeVersion};
use crate::domain::value_objects::Timestamp;

/// Why a node left the view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryStatus {
    /// Reported unreachable.
    Suspect,
    /// Left gracefully.
    Leave,
    /// Retained state explicitly cleared.
    Remove,
    /// Another process claims the same name.
    SuspectDuplicate,
}

/// A departed node.
#[derive(Debug, Clone)]
pub struct HistoryEntry {
    pub node: NodeRef,
    pub version: NodeVersion,
    /// Retained attribute table, never present for `Remove`.
    pub table: Option<SharedTable>,
    pub status: HistoryStatus,
    pub since: Timestamp,
}

/// Departed nodes keyed by name.
#[derive(Debug, Default)]
pub struct NodeHistoryMap {
    entries: BTreeMap<String, HistoryEntry>,
}

impl NodeHistoryMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, entry: HistoryEntry) -> Option<HistoryEntry> {
        self.entries.insert(entry.node.name().to_string(), entry)
    }

    pub fn remove(&mut self, name: &str) -> Option<HistoryEntry> {
        self.entries.remove(name)
    }

    pub fn get(&self, name: &str) -> Option<&HistoryEntry> {
        self.entries.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut HistoryEntry> {
        self.entries.get_mut(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &HistoryEntry> {
        self.entries.values()
    }

    /// Names whose retention has elapsed at `now`.
    pub fn expired(&self, now: Timestamp, retention: Duration) -> Vec<String> {
        self.entries
            .iter()
            .filter(|(_, entry)| now.has_elapsed(entry.since, retention))
            .map(|(name, _)| name.clone())
            .collect()
    }
}
