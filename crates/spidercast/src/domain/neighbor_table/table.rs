//! Neighbor table implementation.

use std::collections::BTreeMap;

use crate::domain::entities::NodeRef;
use crate::domain::value_objects::{ConnectionId, LinkType, Timestamp};

/// One overlay link.
#[derive(Debug, Clone)]
pub struct Neighbor {
    pub node: NodeRef,
    pub connection: ConnectionId,
    /// Both sides completed the handshake.
    pub routable: bool,
    /// Local stream identifier for traffic received from this neighbor.
    pub receiver_stream_id: u64,
    /// Last vacancy (target degree minus degree) the neighbor reported.
    pub vacancy: i32,
    pub since: Timestamp,
}

impl Neighbor {
    pub fn new(
        node: NodeRef,
        connection: ConnectionId,
        receiver_stream_id: u64,
        now: Timestamp,
    ) -> Self {
        Self {
            node,
            connection,
            routable: false,
            receiver_stream_id,
            vacancy: 0,
            since: now,
        }
    }

    #[must_use]
    pub fn routable(mut self) -> Self {
        self.routable = true;
        self
    }

    #[must_use]
    pub fn with_vacancy(mut self, vacancy: i32) -> Self {
        self.vacancy = vacancy;
        self
    }

    pub fn name(&self) -> &str {
        self.node.name()
    }
}

/// Links of one kind keyed by neighbor name.
#[derive(Debug)]
pub struct NeighborTable {
    link_type: LinkType,
    neighbors: BTreeMap<String, Neighbor>,
}

impl NeighborTable {
    pub fn new(link_type: LinkType) -> Self {
        Self {
            link_type,
            neighbors: BTreeMap::new(),
        }
    }

    pub fn link_type(&self) -> LinkType {
        self.link_type
    }

    pub fn insert(&mut self, neighbor: Neighbor) -> Option<Neighbor> {
        self.neighbors.insert(neighbor.name().to_string(), neighbor)
    }

    pub fn remove(&mut self, name: &str) -> Option<Neighbor> {
        self.neighbors.remove(name)
    }

    pub fn get(&self, name: &str) -> Option<&Neighbor> {
        self.neighbors.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.neighbors.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.neighbors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.neighbors.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Neighbor> {
        self.neighbors.values()
    }

    pub fn names(&self) -> Vec<String> {
        self.neighbors.keys().cloned().collect()
    }

    pub fn routable_count(&self) -> usize {
        self.neighbors.values().filter(|n| n.routable).count()
    }

    /// Mark a link routable. Returns false if the neighbor is unknown.
    pub fn mark_routable(&mut self, name: &str) -> bool {
        match self.neighbors.get_mut(name) {
            Some(neighbor) => {
                neighbor.routable = true;
                true
            }
            None => false,
        }
    }

    /// Record a neighbor's reported vacancy. Returns false if unknown.
    pub fn set_vacancy(&mut self, name: &str, vacancy: i32) -> bool {
        match self.neighbors.get_mut(name) {
            Some(neighbor) => {
                neighbor.vacancy = vacancy;
                true
            }
            None => false,
        }
    }

    /// Whether any link rides on `connection`.
    pub fn uses_connection(&self, connection: ConnectionId) -> bool {
        self.neighbors.values().any(|n| n.connection == connection)
    }

    /// Remove and return every link riding on `connection`.
    pub fn remove_by_connection(&mut self, connection: ConnectionId) -> Vec<Neighbor> {
        let names: Vec<String> = self
            .neighbors
            .iter()
            .filter(|(_, n)| n.connection == connection)
            .map(|(name, _)| name.clone())
            .collect();
        names
            .iter()
            .filter_map(|name| self.neighbors.remove(name))
            .collect()
    }

    /// Remove every link.
    pub fn drain(&mut self) -> Vec<Neighbor> {
        std::mem::take(&mut self.neighbors).into_values().collect()
    }

    /// Neighbor with the highest vacancy, skipping `exclude`.
    pub fn highest_vacancy(&self, exclude: &str) -> Option<&Neighbor> {
        self.neighbors
            .values()
            .filter(|n| n.name() != exclude)
            .max_by_key(|n| n.vacancy)
    }

    /// Disconnect candidate: the lowest-vacancy neighbor whose name sorts
    /// above `local`, else the lowest-vacancy neighbor overall. Neighbors in
    /// `skip` and neighbors that still need links (positive vacancy) are never
    /// chosen.
    pub fn disconnect_candidate(&self, local: &str, skip: &[String]) -> Option<&Neighbor> {
        let eligible = || {
            self.neighbors
                .values()
                .filter(move |n| n.vacancy <= 0 && !skip.iter().any(|s| s == n.name()))
        };
        eligible()
            .filter(|n| n.name() > local)
            .min_by_key(|n| n.vacancy)
            .or_else(|| eligible().min_by_key(|n| n.vacancy))
    }
}
