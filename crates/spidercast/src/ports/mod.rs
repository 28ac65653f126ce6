//! # Ports Layer - Hexagonal Architecture Boundaries
//!
//! - **Driving Ports (Inbound):** the node API and the transport events that
//!   drive it
//! - **Driven Ports (Outbound):** transport, clock, event sink, routing
//!   listener and configuration provided by the host

pub mod inbound;
pub mod outbound;

pub use inbound::{MessageSource, SpiderCastApi, TransportEvent};
pub use outbound::{
    ConfigProvider, EventSink, NoOpRoutingListener, RoutingListener, TimeSource, Transport,
    TransportError,
};
