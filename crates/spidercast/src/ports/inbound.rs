//! # Driving Ports (Inbound API)
//!
//! The node is driven by transport events, by the passage of time (`poll`)
//! and by the application through `SpiderCastApi`.

use std::net::SocketAddr;

use crate::domain::events::{ConnectivityEvent, NodeSnapshot};
use crate::domain::messages::Envelope;
use crate::domain::{ConnectionId, NodeRef, NodeVersion, Timestamp};
use crate::service::{AttributeHandle, NodeState};

/// Where a received message came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageSource {
    Connection(ConnectionId),
    Datagram(SocketAddr),
    Multicast(SocketAddr),
}

impl MessageSource {
    pub fn connection(&self) -> Option<ConnectionId> {
        match self {
            MessageSource::Connection(connection) => Some(*connection),
            _ => None,
        }
    }
}

/// Input produced by the transport.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    ConnectSucceeded {
        connection: ConnectionId,
    },
    ConnectFailed {
        connection: ConnectionId,
        reason: String,
    },
    ConnectionBroken {
        connection: ConnectionId,
    },
    Received {
        source: MessageSource,
        envelope: Envelope,
    },
    /// Bytes arrived that could not be decoded.
    Malformed {
        source: MessageSource,
        detail: String,
    },
}

/// Application-facing API of a node.
///
/// # Example
///
/// ```rust,ignore
/// fn publish_role<T: SpiderCastApi>(node: &T) {
///     node.attributes().set("role", b"broker".to_vec()).unwrap();
/// }
/// ```
pub trait SpiderCastApi {
    /// Enter discovery and schedule the periodic tasks.
    fn start(&mut self);

    /// Close the node. A soft close announces the departure first.
    fn close(&mut self, soft: bool);

    /// Feed one transport event.
    fn handle_event(&mut self, event: TransportEvent);

    /// Run due tasks; returns the next deadline.
    fn poll(&mut self) -> Option<Timestamp>;

    fn state(&self) -> NodeState;

    fn local_node(&self) -> &NodeRef;

    fn local_version(&self) -> NodeVersion;

    /// Handle for reading and writing the local attribute table.
    fn attributes(&self) -> AttributeHandle;

    /// Live value of `key` in `node`'s table.
    fn attribute_of(&self, node: &str, key: &str) -> Option<Vec<u8>>;

    /// Every live node with its attributes.
    fn view_snapshot(&self) -> Vec<NodeSnapshot>;

    fn connectivity(&self) -> ConnectivityEvent;

    /// Make the next view notification a full one.
    fn request_full_view(&mut self);

    /// Drop the retained attributes of a departed node.
    fn clear_retained(&mut self, node: &str) -> bool;
}
