//! # Integration Scenarios
//!
//! Each module drives whole nodes through their public API only.

pub mod attributes;
pub mod membership;
pub mod runtime;
pub mod topology;
