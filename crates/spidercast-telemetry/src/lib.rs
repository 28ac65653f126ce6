//! # SpiderCast Telemetry
//!
//! Log subscriber setup for processes hosting SpiderCast nodes. The overlay
//! crate only emits `tracing` records; this crate decides where they go.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use spidercast_telemetry::{init_telemetry, TelemetryConfig};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     init_telemetry(&TelemetryConfig::for_node("node1"))?;
//!     // Records from the node now reach stdout.
//!     Ok(())
//! }
//! ```
//!
//! ## Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `SPIDERCAST_SERVICE_NAME` | `spidercast` | Service name |
//! | `SPIDERCAST_NODE` | unset | Node name |
//! | `SPIDERCAST_LOG_LEVEL` | `info` | `EnvFilter` directive |
//! | `SPIDERCAST_CONSOLE_OUTPUT` | `true` | Console output |
//! | `SPIDERCAST_JSON_LOGS` | `false` | JSON records |

mod config;
mod tracing_setup;

pub use config::TelemetryConfig;
pub use tracing_setup::{init_test_tracing, init_tracing};

use thiserror::Error;

/// Telemetry initialization errors
#[derive(Error, Debug)]
pub enum TelemetryError {
    #[error("invalid log filter {0}")]
    Filter(String),

    #[error("a global subscriber is already installed: {0}")]
    AlreadyInstalled(String),
}

/// Install logging for a host process.
pub fn init_telemetry(config: &TelemetryConfig) -> Result<(), TelemetryError> {
    init_tracing(config)
}

/// Span scoping records to one node, for hosts running several.
///
/// # Example
///
/// ```rust,ignore
/// use spidercast_telemetry::node_span;
///
/// let _guard = node_span!("node1", incarnation = 42).entered();
/// node.poll();
/// ```
#[macro_export]
macro_rules! node_span {
    ($node:expr) => {
        tracing::info_span!("spidercast", node = %$node)
    };
    ($node:expr, $($field:tt)*) => {
        tracing::info_span!("spidercast", node = %$node, $($field)*)
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errors_render_cause() {
        let err = TelemetryError::Filter("x=loudest: invalid".to_string());
        assert_eq!(err.to_string(), "invalid log filter x=loudest: invalid");
    }

    #[test]
    fn test_node_span_accepts_fields() {
        init_test_tracing("trace");
        let span = node_span!("node1", incarnation = 42);
        let _guard = span.enter();
        let _plain = node_span!("node2");
    }
}
