//! # Driven Ports (Outbound SPI)
//!
//! Interfaces the host application implements for the node.

use std::net::SocketAddr;

use crate::domain::events::SpiderCastEvent;
use crate::domain::messages::Envelope;
use crate::domain::{ConnectionId, LinkType, NodeRef, SpiderCastConfig, Timestamp};

/// Message-level transport.
///
/// `connect` returns immediately with a handle; the outcome arrives later as
/// `TransportEvent::ConnectSucceeded` or `ConnectFailed`. Messages received on
/// any connection or datagram socket arrive as `TransportEvent::Received`.
///
/// # Thread Safety
///
/// Implementations must be `Send + Sync`; the node calls them from its single
/// worker but the host usually shares them with I/O tasks.
///
/// # Example Implementation
///
/// ```rust,ignore
/// struct TcpTransport {
///     outbound: tokio::sync::mpsc::UnboundedSender<Command>,
/// }
///
/// impl Transport for TcpTransport {
///     fn send(
///         &self,
///         connection: ConnectionId,
///         envelope: &Envelope,
///     ) -> Result<(), TransportError> {
///         let frame = self
///             .codec
///             .encode(envelope)
///             .map_err(|_| TransportError::MessageTooLarge)?;
///         self.outbound
///             .send(Command::Write(connection, frame))
///             .map_err(|_| TransportError::Closed)
///     }
///     // ...
/// }
/// ```
pub trait Transport: Send + Sync {
    /// Start connecting to `endpoint`.
    fn connect(&self, endpoint: SocketAddr) -> Result<ConnectionId, TransportError>;

    /// Close a connection. The peer observes `ConnectionBroken`.
    fn disconnect(&self, connection: ConnectionId);

    /// Send on an established connection.
    fn send(&self, connection: ConnectionId, envelope: &Envelope) -> Result<(), TransportError>;

    /// Send a datagram.
    fn send_to(&self, endpoint: SocketAddr, envelope: &Envelope) -> Result<(), TransportError>;

    /// Send a datagram to the discovery multicast group.
    fn send_to_multicast_group(&self, envelope: &Envelope) -> Result<(), TransportError>;
}

/// Errors from transport operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Connection unknown or already closed
    NotConnected,
    /// Endpoint cannot be reached
    Unreachable,
    /// Encoded message exceeds the frame limit
    MessageTooLarge,
    /// Transport has shut down
    Closed,
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportError::NotConnected => write!(f, "connection is not established"),
            TransportError::Unreachable => write!(f, "endpoint unreachable"),
            TransportError::MessageTooLarge => write!(f, "message exceeds maximum frame size"),
            TransportError::Closed => write!(f, "transport closed"),
        }
    }
}

impl std::error::Error for TransportError {}

/// Abstract interface for time.
///
/// Allows deterministic testing by injecting a controllable clock.
pub trait TimeSource: Send + Sync {
    /// Current time in milliseconds.
    fn now(&self) -> Timestamp;
}

/// Receiver of application events.
pub trait EventSink: Send + Sync {
    fn publish(&self, event: SpiderCastEvent);
}

/// Routing layer interested in routable links.
pub trait RoutingListener: Send + Sync {
    fn add_routing_neighbor(&self, node: &NodeRef, link: LinkType);
    fn remove_routing_neighbor(&self, node: &NodeRef, link: LinkType);
}

/// Routing listener for hosts without a routing layer.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpRoutingListener;

impl RoutingListener for NoOpRoutingListener {
    fn add_routing_neighbor(&self, _node: &NodeRef, _link: LinkType) {}
    fn remove_routing_neighbor(&self, _node: &NodeRef, _link: LinkType) {}
}

/// Source of node configuration.
pub trait ConfigProvider: Send + Sync {
    fn get_config(&self) -> SpiderCastConfig;
}
