//! # Attribute Anti-Entropy
//!
//! Replicates every node's attribute table over routable links.
//!
//! ## Exchange
//!
//! ```text
//! owner ── Update{(name, version, table_version)...} ──▶ neighbor
//! owner ◀── Request{(name, version, local_table_version)...} ── neighbor
//! owner ── Reply{(name, version, table_version, delta | invalidated)...} ──▶ neighbor
//! ```
//!
//! Any node relays digests of tables it holds, so updates spread beyond the
//! owner's direct neighbors. Incarnations fence the exchange: stale ones are
//! ignored and a peer ahead of a locally live node is a fatal inconsistency.

mod handle;
mod manager;

pub use handle::AttributeHandle;
pub use manager::AttributeManager;

#[cfg(test)]
mod tests;
