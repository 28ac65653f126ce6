//! # Topology
//!
//! Discovers peers and keeps three overlays connected:
//!
//! - **Ring**: one outgoing link to the successor chosen by membership;
//!   incoming ring links are tracked as predecessors
//! - **Random mesh**: degree kept within `[D, D+M]`
//! - **Structured**: optional outgoing links refreshed as the view churns
//!
//! ## Link Handshake
//!
//! ```text
//! Idle ─▶ Connecting ─▶ RequestSent ─┬─▶ Accepted ─▶ Routable
//!                                    ├─▶ Rejected(redirect)
//!                                    └─▶ Failed (timeout, broken, refused)
//! ```
//!
//! Connections are owned by the dialing side, which closes them once no link
//! or pending exchange references them.

mod discovery;
mod handshake;
mod manager;
mod mesh;
mod ring;

pub(crate) use manager::Inbound;
pub use manager::{TopologyManager, TopologyState};
