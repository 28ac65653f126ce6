//! # Attribute Tables
//!
//! Per-node versioned key/value maps replicated by anti-entropy.
//!
//! ## Versioning
//!
//! - Every local mutation bumps the table version and stamps the entry with it
//! - Removals leave a tombstone (`value: None`) so they replicate
//! - `version_sent` records the highest version announced to neighbors
//! - `pending` records an outstanding request for a newer version
//!
//! Tables are shared between the node and application handles through a
//! table-scoped `parking_lot::Mutex`.

// Semantic submodules
mod key;
mod table;

// Re-export public API
pub use key::validate_key;
pub use table::{AttributeEntry, AttributeTable, PendingRequest, SharedTable};
