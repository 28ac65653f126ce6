//! # Membership
//!
//! Maintains the live view and the departure history.
//!
//! ## Protocol
//!
//! - Records `(node, version)` join or refresh the view when newer than
//!   anything known locally, view or history
//! - Departures `(name, version, leave|suspect)` retire a view entry whose
//!   version is not newer
//! - Applied changes are flooded to every routable neighbor; records that
//!   change nothing are dropped, so floods terminate
//! - Suspicion about the local node is refuted by bumping the minor version
//! - The ring successor is the next name in the view, wrapping around

mod manager;

pub use manager::MembershipService;
pub(crate) use manager::Peers;
