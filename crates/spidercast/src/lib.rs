//! # SpiderCast Overlay
//!
//! Peer-to-peer membership and gossip dissemination engine. A SpiderCast node
//! keeps an eventually-convergent view of live nodes, replicates per-node
//! key/value attributes with version-vector anti-entropy and continuously
//! repairs its overlay links (a ring, a random mesh and an optional
//! structured graph) under churn.
//!
//! ## Architecture
//!
//! The crate follows Hexagonal Architecture with:
//! - **Domain Layer:** identities, versions, attribute tables, view/history
//!   maps, neighbor tables and the wire messages
//! - **Ports Layer:** traits for the transport, clock, event sink and routing
//!   listener
//! - **Service Layer:** the single-owner node, its task scheduler and the
//!   membership, attribute and topology components
//! - **Adapters Layer:** wire codec, configuration providers, system clock and
//!   the tokio driver (feature-gated)
//!
//! ## Features
//!
//! - `network` - tokio driver (`spawn_node`) and `TomlConfigProvider`
//! - `test-utils` - `ManualClock`, `RecordingSink` and the in-memory `SimNetwork`
//!
//! ## Example
//!
//! ```rust
//! use spidercast::{AttributeTable, AttributeError};
//!
//! let table = AttributeTable::shared();
//! table.lock().set("role", b"broker".to_vec()).unwrap();
//! assert_eq!(table.lock().version(), 1);
//! assert!(matches!(
//!     table.lock().set("  ", vec![]),
//!     Err(AttributeError::InvalidKey(_))
//! ));
//! ```

// =============================================================================
// CORE MODULES
// =============================================================================

pub mod adapters;
pub mod domain;
pub mod ports;
pub mod service;

// =============================================================================
// FEATURE-GATED MODULES
// =============================================================================

/// Test doubles and the deterministic multi-node simulator.
/// Requires feature: `test-utils`
#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

// =============================================================================
// RE-EXPORTS
// =============================================================================

pub use domain::{
    validate_key, AttributeEntry, AttributeError, AttributeTable, ConfigError,
    ConnectionId, DiscoveryTransports, FatalError, FatalErrorCode, HistoryStatus, LinkType,
    NodeId, NodeIdCache, NodeRecord, NodeRef, NodeStatus, NodeVersion, ProtocolError,
    SharedTable, SpiderCastConfig, Timestamp,
};

pub use domain::events::{
    ConnectivityEvent, DuplicateNodeEvent, EventKind, FatalErrorEvent, NodeSnapshot,
    SpiderCastEvent, ViewNotification, WarningEvent, WarningKind,
};

pub use domain::messages::{
    DepartureKind, DepartureRecord, DigestItem, DiscoveryTransport, Envelope, MembershipMessage,
    Message, MetadataMessage, ReplyItem, TableDelta, TopologyMessage,
};

pub use ports::{
    ConfigProvider, EventSink, MessageSource, NoOpRoutingListener, RoutingListener,
    SpiderCastApi, TimeSource, Transport, TransportError, TransportEvent,
};

pub use service::{AttributeHandle, NodePorts, NodeState, SpiderCast, TaskKind, TaskState};

pub use adapters::{StaticConfigProvider, SystemTimeSource, WireCodec};

#[cfg(feature = "network")]
pub use adapters::{spawn_node, NodeHandle, NodeInput, TomlConfigProvider};
