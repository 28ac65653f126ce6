use std::collections::HashMap;

use super::table::{Neighbor, NeighborTable};
use crate::domain::value_objects::{ConnectionId, LinkType};

/// Outgoing structured links plus the degree each neighbor reported.
#[derive(Debug)]
pub struct OutgoingStructuredNeighborTable {
    table: NeighborTable,
    degrees: HashMap<String, u32>,
}

impl Default for OutgoingStructuredNeighborTable {
    fn default() -> Self {
        Self::new()
    }
}

impl OutgoingStructuredNeighborTable {
    pub fn new() -> Self {
        Self {
            table: NeighborTable::new(LinkType::Structured),
            degrees: HashMap::new(),
        }
    }

    pub fn insert(&mut self, neighbor: Neighbor, degree: u32) -> Option<Neighbor> {
        self.degrees.insert(neighbor.name().to_string(), degree);
        self.table.insert(neighbor)
    }

    pub fn remove(&mut self, name: &str) -> Option<Neighbor> {
        self.degrees.remove(name);
        self.table.remove(name)
    }

    pub fn remove_by_connection(&mut self, connection: ConnectionId) -> Vec<Neighbor> {
        let removed = self.table.remove_by_connection(connection);
        for neighbor in &removed {
            self.degrees.remove(neighbor.name());
        }
        removed
    }

    pub fn drain(&mut self) -> Vec<Neighbor> {
        self.degrees.clear();
        self.table.drain()
    }

    /// Degree last reported by `name`.
    pub fn degree_of(&self, name: &str) -> Option<u32> {
        self.degrees.get(name).copied()
    }

    pub fn set_degree(&mut self, name: &str, degree: u32) -> bool {
        if !self.table.contains(name) {
            return false;
        }
        self.degrees.insert(name.to_string(), degree);
        true
    }

    /// Underlying link table.
    pub fn table(&self) -> &NeighborTable {
        &self.table
    }

    pub fn contains(&self, name: &str) -> bool {
        self.table.contains(name)
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}
