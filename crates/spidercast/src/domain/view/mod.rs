//! # Membership View and History
//!
//! - **View**: live nodes, the local node included, each with its attribute table
//! - **History**: departed or suspected nodes, retained for `history_retention`
//!
//! A name is in at most one of the two maps; the membership service enforces
//! it together with the identity cache.

mod history;
mod view_map;

pub use history::{HistoryEntry, HistoryStatus, NodeHistoryMap};
pub use view_map::{MembershipViewMap, NodeStatus, ViewEntry};

/// Where a cached name currently lives.
#[derive(Debug)]
pub enum Located<'a> {
    View(&'a ViewEntry),
    History(&'a HistoryEntry),
}
