//! Deduplicating identity cache.
//!
//! Every component refers to nodes through the `NodeRef` handed out here, so
//! one name maps to one shared allocation. The membership service keeps the
//! cache's key set equal to the union of the view and history keys.

use std::collections::HashMap;
use std::sync::Arc;

use super::entities::{NodeId, NodeRef};

/// Name-keyed cache of shared node identities.
#[derive(Debug, Default)]
pub struct NodeIdCache {
    nodes: HashMap<String, NodeRef>,
}

impl NodeIdCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the shared handle for `node`, inserting it if unknown.
    ///
    /// A known name with different endpoints is replaced by the newer identity;
    /// handles already given out keep the old endpoints.
    pub fn intern(&mut self, node: NodeId) -> NodeRef {
        if let Some(existing) = self.nodes.get(node.name()) {
            if existing.endpoints() == node.endpoints() || node.endpoints().is_empty() {
                return Arc::clone(existing);
            }
        }
        let handle = Arc::new(node);
        self.nodes
            .insert(handle.name().to_string(), Arc::clone(&handle));
        handle
    }

    /// Look up the handle for `name`.
    pub fn get(&self, name: &str) -> Option<NodeRef> {
        self.nodes.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.nodes.contains_key(name)
    }

    /// Drop `name` from the cache.
    pub fn evict(&mut self, name: &str) -> Option<NodeRef> {
        self.nodes.remove(name)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Cached names in unspecified order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.nodes.keys().map(String::as_str)
    }
}
