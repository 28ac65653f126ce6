//! # Service Layer
//!
//! The node and the protocol components it drives.
//!
//! - `SpiderCast`: owns every component; routes transport input, due tasks
//!   and cross-component effects
//! - `membership`: live view and departure history
//! - `attributes`: attribute anti-entropy and view notifications
//! - `topology`: discovery and overlay links
//! - `scheduler`: per-kind task state and deadlines

pub mod attributes;
pub(crate) mod context;
pub mod membership;
mod node;
pub mod scheduler;
pub mod topology;

pub use attributes::{AttributeHandle, AttributeManager};
pub use context::NodePorts;
pub use membership::MembershipService;
pub use node::{NodeState, SpiderCast};
pub use scheduler::{TaskKind, TaskState};
pub use topology::{TopologyManager, TopologyState};
