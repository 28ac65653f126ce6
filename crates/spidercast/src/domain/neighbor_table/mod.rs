//! # Neighbor Tables
//!
//! Bookkeeping for overlay links of one kind. Each entry records the
//! connection carrying the link, whether the handshake completed (routable)
//! and the neighbor's last reported vacancy.

mod structured;
mod table;

pub use structured::OutgoingStructuredNeighborTable;
pub use table::{Neighbor, NeighborTable};
