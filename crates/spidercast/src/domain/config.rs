//! Overlay configuration.

use std::net::SocketAddr;
use std::time::Duration;

use super::errors::ConfigError;

/// Discovery transports, each enabled independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiscoveryTransports {
    /// Connect to bootstrap endpoints and exchange views over a connection.
    pub tcp: bool,
    /// Exchange views with bootstrap endpoints as datagrams.
    pub udp: bool,
    /// Send discovery requests to the multicast group.
    pub multicast: bool,
}

impl Default for DiscoveryTransports {
    fn default() -> Self {
        Self {
            tcp: true,
            udp: false,
            multicast: false,
        }
    }
}

/// Configuration of a SpiderCast node.
#[derive(Debug, Clone)]
pub struct SpiderCastConfig {
    /// Overlay name; envelopes from other buses are rejected.
    pub bus_name: String,

    /// Target random degree (D).
    pub random_degree: usize,
    /// Tolerated random degree above target (M).
    pub random_margin: usize,
    /// Consecutive rejections before a connect request is sent as urgent.
    pub random_max_rejections: u32,

    /// Outgoing structured links; zero disables the structured overlay.
    pub structured_degree: usize,
    /// Incoming structured links accepted above `structured_degree`.
    pub structured_margin: usize,
    /// View churn, as a fraction of view size, that triggers a refresh.
    pub structured_refresh_ratio: f64,
    /// Period of the structured refresh check.
    pub structured_refresh_interval: Duration,

    /// Enabled discovery transports.
    pub discovery: DiscoveryTransports,
    /// Bootstrap endpoints contacted by discovery.
    pub bootstrap: Vec<SocketAddr>,
    /// Discovery period during the warm-up window.
    pub frequent_discovery_interval: Duration,
    /// Length of the warm-up window.
    pub frequent_discovery_duration: Duration,
    /// Discovery period after warm-up.
    pub discovery_interval: Duration,
    /// Records carried by a discovery request.
    pub discovery_view_limit: usize,
    /// Records per discovery reply part.
    pub discovery_view_chunk: usize,

    /// Connect attempts and pending discovery expire after this.
    pub connect_timeout: Duration,
    /// Delay before retrying a failed or rejected connect.
    pub connect_retry_delay: Duration,
    /// Failed connects to one candidate before it is reported as suspect.
    pub connect_max_failures: u32,
    /// Failed successor connects before the candidate is reported as suspect.
    pub successor_max_failures: u32,
    /// Period of degree repair checks.
    pub degree_check_interval: Duration,

    /// Period of the attribute digest task.
    pub attribute_update_interval: Duration,
    /// Pending attribute requests older than this no longer block new ones.
    pub attribute_request_timeout: Duration,

    /// How long departed nodes stay in history.
    pub history_retention: Duration,
    /// Period of the history purge task.
    pub history_purge_interval: Duration,
    /// Keep attribute tables of departed nodes in history.
    pub retain_attributes: bool,

    /// Seed for candidate selection; `None` seeds from entropy.
    pub rng_seed: Option<u64>,
}

impl Default for SpiderCastConfig {
    fn default() -> Self {
        Self {
            bus_name: "spidercast".to_string(),
            random_degree: 3,
            random_margin: 2,
            random_max_rejections: 3,
            structured_degree: 0,
            structured_margin: 2,
            structured_refresh_ratio: 0.5,
            structured_refresh_interval: Duration::from_secs(10),
            discovery: DiscoveryTransports::default(),
            bootstrap: Vec::new(),
            frequent_discovery_interval: Duration::from_millis(500),
            frequent_discovery_duration: Duration::from_secs(10),
            discovery_interval: Duration::from_secs(15),
            discovery_view_limit: 32,
            discovery_view_chunk: 64,
            connect_timeout: Duration::from_secs(5),
            connect_retry_delay: Duration::from_secs(1),
            connect_max_failures: 3,
            successor_max_failures: 3,
            degree_check_interval: Duration::from_secs(2),
            attribute_update_interval: Duration::from_millis(200),
            attribute_request_timeout: Duration::from_secs(10),
            history_retention: Duration::from_secs(300),
            history_purge_interval: Duration::from_secs(30),
            retain_attributes: true,
            rng_seed: None,
        }
    }
}

impl SpiderCastConfig {
    /// Small, fast, deterministic settings for simulations.
    pub fn for_testing() -> Self {
        Self {
            bus_name: "test-bus".to_string(),
            random_degree: 2,
            random_margin: 1,
            random_max_rejections: 2,
            structured_degree: 0,
            structured_margin: 1,
            structured_refresh_ratio: 0.5,
            structured_refresh_interval: Duration::from_millis(500),
            discovery: DiscoveryTransports::default(),
            bootstrap: Vec::new(),
            frequent_discovery_interval: Duration::from_millis(50),
            frequent_discovery_duration: Duration::from_millis(500),
            discovery_interval: Duration::from_millis(500),
            discovery_view_limit: 8,
            discovery_view_chunk: 4,
            connect_timeout: Duration::from_millis(200),
            connect_retry_delay: Duration::from_millis(50),
            connect_max_failures: 2,
            successor_max_failures: 2,
            degree_check_interval: Duration::from_millis(100),
            attribute_update_interval: Duration::from_millis(20),
            attribute_request_timeout: Duration::from_millis(500),
            history_retention: Duration::from_secs(5),
            history_purge_interval: Duration::from_millis(500),
            retain_attributes: true,
            rng_seed: Some(7),
        }
    }

    /// Upper bound of the random degree (D + M).
    pub fn random_upper_bound(&self) -> usize {
        self.random_degree + self.random_margin
    }

    /// Whether the structured overlay is enabled.
    pub fn structured_enabled(&self) -> bool {
        self.structured_degree > 0
    }

    /// Reject settings the protocol cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bus_name.trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "bus_name",
                reason: "must not be empty".to_string(),
            });
        }
        if self.random_degree == 0 {
            return Err(ConfigError::Invalid {
                field: "random_degree",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.discovery_view_chunk == 0 {
            return Err(ConfigError::Invalid {
                field: "discovery_view_chunk",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.structured_refresh_ratio.is_nan() || self.structured_refresh_ratio <= 0.0 {
            return Err(ConfigError::Invalid {
                field: "structured_refresh_ratio",
                reason: "must be positive".to_string(),
            });
        }
        // Periodic tasks reschedule themselves by these.
        let intervals = [
            ("frequent_discovery_interval", self.frequent_discovery_interval),
            ("discovery_interval", self.discovery_interval),
            ("structured_refresh_interval", self.structured_refresh_interval),
            ("connect_timeout", self.connect_timeout),
            ("degree_check_interval", self.degree_check_interval),
            ("attribute_update_interval", self.attribute_update_interval),
            ("attribute_request_timeout", self.attribute_request_timeout),
            ("history_purge_interval", self.history_purge_interval),
        ];
        if let Some(&(field, _)) = intervals.iter().find(|(_, interval)| interval.is_zero()) {
            return Err(ConfigError::Invalid {
                field,
                reason: "must be positive".to_string(),
            });
        }
        Ok(())
    }
}
