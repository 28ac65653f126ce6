//! # Adapters Layer
//!
//! - `codec`: length-prefixed bincode framing of envelopes
//! - `config`: static and TOML configuration providers
//! - `time`: system clock
//! - `runtime`: tokio task driving a node (requires "network" feature)

pub mod codec;
pub mod config;
#[cfg(feature = "network")]
pub mod runtime;
pub mod time;

pub use codec::WireCodec;
pub use config::StaticConfigProvider;
pub use time::SystemTimeSource;

#[cfg(feature = "network")]
pub use config::TomlConfigProvider;
#[cfg(feature = "network")]
pub use runtime::{spawn_node, NodeHandle, NodeInput};
