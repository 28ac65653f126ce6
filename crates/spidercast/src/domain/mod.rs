//! # Domain Layer
//!
//! Pure overlay state: identities, versions, attribute tables, the membership
//! view and history, neighbor tables and the wire vocabulary. Nothing in here
//! performs I/O or reads the clock.

pub mod attribute_table;
pub mod config;
pub mod entities;
pub mod errors;
pub mod events;
pub mod messages;
pub mod neighbor_table;
pub mod node_cache;
pub mod value_objects;
pub mod view;

pub use attribute_table::{
    validate_key, AttributeEntry, AttributeTable, PendingRequest, SharedTable,
};
pub use config::{DiscoveryTransports, SpiderCastConfig};
pub use entities::{NodeId, NodeRecord, NodeRef, NodeVersion};
pub use errors::{AttributeError, ConfigError, FatalError, FatalErrorCode, ProtocolError};
pub use neighbor_table::{Neighbor, NeighborTable, OutgoingStructuredNeighborTable};
pub use node_cache::NodeIdCache;
pub use value_objects::{ConnectionId, LinkType, Timestamp};
pub use view::{
    HistoryEntry, HistoryStatus, Located, MembershipViewMap, NodeHistoryMap, NodeStatus,
    ViewEntry,
};
