//! Node identity and versioning.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::SocketAddr;
use std::sync::Arc;

/// Shared, deduplicated node identity handed out by the `NodeIdCache`.
pub type NodeRef = Arc<NodeId>;

/// Immutable node identity.
///
/// Equality, hashing and ordering use the name only; the endpoints are
/// contact information that may change across restarts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeId {
    name: String,
    endpoints: Vec<SocketAddr>,
}

impl NodeId {
    /// Create a node identity.
    pub fn new(name: impl Into<String>, endpoints: Vec<SocketAddr>) -> Self {
        Self {
            name: name.into(),
            endpoints,
        }
    }

    /// Unique node name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Advertised endpoints, most preferred first.
    pub fn endpoints(&self) -> &[SocketAddr] {
        &self.endpoints
    }

    /// Endpoint used when dialing this node.
    pub fn primary_endpoint(&self) -> Option<SocketAddr> {
        self.endpoints.first().copied()
    }
}

impl PartialEq for NodeId {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Eq for NodeId {}

impl Hash for NodeId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name.hash(state);
    }
}

impl PartialOrd for NodeId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for NodeId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.name.cmp(&other.name)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Version of a node's membership record.
///
/// The incarnation is fixed at process start and grows across restarts; the
/// minor counter is bumped to refute suspicion within one incarnation.
/// Ordering is lexicographic: incarnation first, then minor.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct NodeVersion {
    pub incarnation: i64,
    pub minor: u64,
}

impl NodeVersion {
    /// Create a version.
    pub const fn new(incarnation: i64, minor: u64) -> Self {
        Self { incarnation, minor }
    }

    /// Same incarnation, next minor version.
    #[must_use]
    pub fn bump_minor(&self) -> Self {
        Self {
            incarnation: self.incarnation,
            minor: self.minor.saturating_add(1),
        }
    }
}

impl fmt::Display for NodeVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.incarnation, self.minor)
    }
}

/// Membership record as carried on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub name: String,
    pub endpoints: Vec<SocketAddr>,
    pub version: NodeVersion,
}

impl NodeRecord {
    /// Build a record from an identity and its version.
    pub fn new(node: &NodeId, version: NodeVersion) -> Self {
        Self {
            name: node.name().to_string(),
            endpoints: node.endpoints().to_vec(),
            version,
        }
    }

    /// Identity described by this record.
    pub fn node_id(&self) -> NodeId {
        NodeId::new(self.name.clone(), self.endpoints.clone())
    }
}
