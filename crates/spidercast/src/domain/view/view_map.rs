//! Live membership view.

use std::collections::BTreeMap;
use std::ops::Bound;

use crate::domain::attribute_table::SharedTable;
use crate::domain::entities::{NodeRecord, NodeRef, NodeVersion};

/// Status of a view entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeStatus {
    Alive,
}

/// A live node.
#[derive(Debug, Clone)]
pub struct ViewEntry {
    pub node: NodeRef,
    pub version: NodeVersion,
    pub table: SharedTable,
    pub status: NodeStatus,
}

impl ViewEntry {
    pub fn new(node: NodeRef, version: NodeVersion, table: SharedTable) -> Self {
        Self {
            node,
            version,
            table,
            status: NodeStatus::Alive,
        }
    }

    /// Wire record of this entry.
    pub fn record(&self) -> NodeRecord {
        NodeRecord::new(&self.node, self.version)
    }
}

/// Name-ordered map of live nodes.
#[derive(Debug, Default)]
pub struct MembershipViewMap {
    entries: BTreeMap<String, ViewEntry>,
}

impl MembershipViewMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, entry: ViewEntry) -> Option<ViewEntry> {
        self.entries.insert(entry.node.name().to_string(), entry)
    }

    pub fn remove(&mut self, name: &str) -> Option<ViewEntry> {
        self.entries.remove(name)
    }

    pub fn get(&self, name: &str) -> Option<&ViewEntry> {
        self.entries.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut ViewEntry> {
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

    /// Entries in name order.
    pub fn iter(&self) -> impl Iterator<Item = &ViewEntry> {
        self.entries.values()
    }

    /// Names in order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Wire records of every entry.
    pub fn records(&self) -> Vec<NodeRecord> {
        self.entries.values().map(ViewEntry::record).collect()
    }

    /// Ring successor of `local`: the smallest name greater than it, wrapping
    /// to the smallest name. `None` when `local` is alone.
    pub fn successor_of(&self, local: &str) -> Option<&ViewEntry> {
        self.entries
            .range::<str, _>((Bound::Excluded(local), Bound::Unbounded))
            .map(|(_, entry)| entry)
            .next()
            .or_else(|| {
                self.entries
                    .values()
                    .find(|entry| entry.node.name() != local)
            })
    }
}
