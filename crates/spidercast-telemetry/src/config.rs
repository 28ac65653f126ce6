//! Telemetry configuration from environment variables.

use std::env;

/// Configuration of the log subscriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryConfig {
    /// Service name attached to the startup record
    pub service_name: String,

    /// Node name, when the host runs a single node
    pub node_name: Option<String>,

    /// Log level filter (trace, debug, info, warn, error) or a full
    /// `EnvFilter` directive
    pub log_level: String,

    /// Whether to enable console output
    pub console_output: bool,

    /// Whether to format records as JSON
    pub json_logs: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: "spidercast".to_string(),
            node_name: None,
            log_level: "info".to_string(),
            console_output: true,
            json_logs: false,
        }
    }
}

fn flag(value: Option<String>, default: bool) -> bool {
    match value.map(|v| v.trim().to_lowercase()) {
        Some(v) if v == "true" || v == "1" => true,
        Some(v) if v == "false" || v == "0" => false,
        _ => default,
    }
}

impl TelemetryConfig {
    /// Create configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `SPIDERCAST_SERVICE_NAME`: Service name (default: spidercast)
    /// - `SPIDERCAST_NODE`: Node name (default: unset)
    /// - `SPIDERCAST_LOG_LEVEL` or `RUST_LOG`: Log filter (default: info)
    /// - `SPIDERCAST_CONSOLE_OUTPUT`: Enable console output (default: true)
    /// - `SPIDERCAST_JSON_LOGS`: JSON records (default: true in containers)
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Same as `from_env` with an explicit variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let is_container =
            lookup("KUBERNETES_SERVICE_HOST").is_some() || lookup("DOCKER_CONTAINER").is_some();

        Self {
            service_name: lookup("SPIDERCAST_SERVICE_NAME").unwrap_or(defaults.service_name),

            node_name: lookup("SPIDERCAST_NODE").filter(|n| !n.trim().is_empty()),

            log_level: lookup("SPIDERCAST_LOG_LEVEL")
                .or_else(|| lookup("RUST_LOG"))
                .unwrap_or(defaults.log_level),

            console_output: flag(lookup("SPIDERCAST_CONSOLE_OUTPUT"), defaults.console_output),

            json_logs: flag(lookup("SPIDERCAST_JSON_LOGS"), is_container),
        }
    }

    /// Configuration for a host running the node `node_name`.
    pub fn for_node(node_name: &str) -> Self {
        let mut config = Self::from_env();
        config.node_name = Some(node_name.to_string());
        config
    }

    /// Service name qualified by the node name.
    pub fn full_service_name(&self) -> String {
        match &self.node_name {
            Some(node) => format!("{}-{}", self.service_name, node),
            None => self.service_name.clone(),
        }
    }
}
