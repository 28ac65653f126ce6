//! # SpiderCast Test Suite
//!
//! Multi-node scenarios run on the deterministic `SimNetwork`, protocol
//! exchanges driven message by message, and the tokio driver on a real clock.
//!
//! ## Structure
//!
//! ```text
//! tests/src/
//! ├── support.rs          # Cluster builders and overlay assertions
//! └── integration/
//!     ├── attributes.rs   # Anti-entropy exchanges and convergence
//!     ├── membership.rs   # Ring, leave, crash repair, rejoin
//!     ├── topology.rs     # Degree bounds, tie-break, link symmetry
//!     └── runtime.rs      # Nodes on tokio tasks
//! ```
//!
//! ## Running Tests
//!
//! ```bash
//! # All tests
//! cargo test -p spidercast-tests
//!
//! # By category
//! cargo test -p spidercast-tests integration::membership::
//!
//! # Benchmarks
//! cargo bench -p spidercast-tests
//! ```
//!
//! Set `RUST_LOG=spidercast=debug` to see node logs in failing tests.

pub mod integration;
pub mod support;
