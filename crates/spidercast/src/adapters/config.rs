//! Configuration providers.

use crate::domain::SpiderCastConfig;
use crate::ports::ConfigProvider;

// ============================================================================
// StaticConfigProvider
// ============================================================================

/// Provider returning a configuration built in code.
#[derive(Debug, Clone, Default)]
pub struct StaticConfigProvider {
    config: SpiderCastConfig,
}

impl StaticConfigProvider {
    #[must_use]
    pub fn new(config: SpiderCastConfig) -> Self {
        Self { config }
    }
}

impl ConfigProvider for StaticConfigProvider {
    fn get_config(&self) -> SpiderCastConfig {
        self.config.clone()
    }
}

// ============================================================================
// TomlConfigProvider (requires "network" feature)
// ============================================================================

#[cfg(feature = "network")]
mod toml_config {
    use serde::Deserialize;
    use std::fs;
    use std::net::SocketAddr;
    use std::path::Path;
    use std::time::Duration;

    use crate::domain::{ConfigError, DiscoveryTransports, SpiderCastConfig};
    use crate::ports::ConfigProvider;

    #[derive(Debug, Deserialize, Default)]
    #[serde(deny_unknown_fields)]
    struct ConfigFile {
        bus_name: Option<String>,
        #[serde(default)]
        random: RandomSection,
        #[serde(default)]
        structured: StructuredSection,
        #[serde(default)]
        discovery: DiscoverySection,
        #[serde(default)]
        connect: ConnectSection,
        #[serde(default)]
        attributes: AttributeSection,
        #[serde(default)]
        history: HistorySection,
    }

    #[derive(Debug, Deserialize, Default)]
    #[serde(deny_unknown_fields)]
    struct RandomSection {
        degree: Option<usize>,
        margin: Option<usize>,
        max_rejections: Option<u32>,
    }

    #[derive(Debug, Deserialize, Default)]
    #[serde(deny_unknown_fields)]
    struct StructuredSection {
        degree: Option<usize>,
        margin: Option<usize>,
        refresh_ratio: Option<f64>,
        refresh_interval_ms: Option<u64>,
    }

    #[derive(Debug, Deserialize, Default)]
    #[serde(deny_unknown_fields)]
    struct DiscoverySection {
        tcp: Option<bool>,
        udp: Option<bool>,
        multicast: Option<bool>,
        #[serde(default)]
        bootstrap: Vec<String>,
        frequent_interval_ms: Option<u64>,
        frequent_duration_ms: Option<u64>,
        interval_ms: Option<u64>,
        view_limit: Option<usize>,
        view_chunk: Option<usize>,
    }

    #[derive(Debug, Deserialize, Default)]
    #[serde(deny_unknown_fields)]
    struct ConnectSection {
        timeout_ms: Option<u64>,
        retry_delay_ms: Option<u64>,
        max_failures: Option<u32>,
        successor_max_failures: Option<u32>,
        degree_check_interval_ms: Option<u64>,
    }

    #[derive(Debug, Deserialize, Default)]
    #[serde(deny_unknown_fields)]
    struct AttributeSection {
        update_interval_ms: Option<u64>,
        request_timeout_ms: Option<u64>,
    }

    #[derive(Debug, Deserialize, Default)]
    #[serde(deny_unknown_fields)]
    struct HistorySection {
        retention_ms: Option<u64>,
        purge_interval_ms: Option<u64>,
        retain_attributes: Option<bool>,
    }

    fn millis(value: Option<u64>, default: Duration) -> Duration {
        value.map_or(default, Duration::from_millis)
    }

    /// TOML-based configuration provider. Missing keys keep their defaults.
    ///
    /// # Config File Format
    ///
    /// ```toml
    /// bus_name = "prod-overlay"
    ///
    /// [random]
    /// degree = 3
    /// margin = 2
    ///
    /// [structured]
    /// degree = 2
    ///
    /// [discovery]
    /// udp = true
    /// bootstrap = ["10.0.0.1:7400", "10.0.0.2:7400"]
    /// interval_ms = 15000
    ///
    /// [connect]
    /// timeout_ms = 5000
    ///
    /// [history]
    /// retention_ms = 300000
    /// ```
    #[derive(Debug, Clone)]
    pub struct TomlConfigProvider {
        config: SpiderCastConfig,
    }

    impl TomlConfigProvider {
        /// Load configuration from a TOML file.
        ///
        /// # Errors
        ///
        /// Returns error if the file cannot be read, parsed or validated.
        pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
            let content = fs::read_to_string(path.as_ref())?;
            Self::parse(&content)
        }

        /// Parse configuration from a TOML string.
        pub fn parse(content: &str) -> Result<Self, ConfigError> {
            let file: ConfigFile =
                toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
            let defaults = SpiderCastConfig::default();

            let bootstrap = file
                .discovery
                .bootstrap
                .iter()
                .map(|s| {
                    s.parse::<SocketAddr>().map_err(|e| ConfigError::Invalid {
                        field: "discovery.bootstrap",
                        reason: format!("{s}: {e}"),
                    })
                })
                .collect::<Result<Vec<_>, _>>()?;

            let d = file.discovery;
            let c = file.connect;
            let config = SpiderCastConfig {
                bus_name: file.bus_name.unwrap_or(defaults.bus_name),
                random_degree: file.random.degree.unwrap_or(defaults.random_degree),
                random_margin: file.random.margin.unwrap_or(defaults.random_margin),
                random_max_rejections: file
                    .random
                    .max_rejections
                    .unwrap_or(defaults.random_max_rejections),
                structured_degree: file.structured.degree.unwrap_or(defaults.structured_degree),
                structured_margin: file.structured.margin.unwrap_or(defaults.structured_margin),
                structured_refresh_ratio: file
                    .structured
                    .refresh_ratio
                    .unwrap_or(defaults.structured_refresh_ratio),
                structured_refresh_interval: millis(
                    file.structured.refresh_interval_ms,
                    defaults.structured_refresh_interval,
                ),
                discovery: DiscoveryTransports {
                    tcp: d.tcp.unwrap_or(defaults.discovery.tcp),
                    udp: d.udp.unwrap_or(defaults.discovery.udp),
                    multicast: d.multicast.unwrap_or(defaults.discovery.multicast),
                },
                bootstrap,
                frequent_discovery_interval: millis(
                    d.frequent_interval_ms,
                    defaults.frequent_discovery_interval,
                ),
                frequent_discovery_duration: millis(
                    d.frequent_duration_ms,
                    defaults.frequent_discovery_duration,
                ),
                discovery_interval: millis(d.interval_ms, defaults.discovery_interval),
                discovery_view_limit: d.view_limit.unwrap_or(defaults.discovery_view_limit),
                discovery_view_chunk: d.view_chunk.unwrap_or(defaults.discovery_view_chunk),
                connect_timeout: millis(c.timeout_ms, defaults.connect_timeout),
                connect_retry_delay: millis(c.retry_delay_ms, defaults.connect_retry_delay),
                connect_max_failures: c.max_failures.unwrap_or(defaults.connect_max_failures),
                successor_max_failures: c
                    .successor_max_failures
                    .unwrap_or(defaults.successor_max_failures),
                degree_check_interval: millis(
                    c.degree_check_interval_ms,
                    defaults.degree_check_interval,
                ),
                attribute_update_interval: millis(
                    file.attributes.update_interval_ms,
                    defaults.attribute_update_interval,
                ),
                attribute_request_timeout: millis(
                    file.attributes.request_timeout_ms,
                    defaults.attribute_request_timeout,
                ),
                history_retention: millis(file.history.retention_ms, defaults.history_retention),
                history_purge_interval: millis(
                    file.history.purge_interval_ms,
                    defaults.history_purge_interval,
                ),
                retain_attributes: file
                    .history
                    .retain_attributes
                    .unwrap_or(defaults.retain_attributes),
                rng_seed: None,
            };
            config.validate()?;
            Ok(Self { config })
        }
    }

    impl ConfigProvider for TomlConfigProvider {
        fn get_config(&self) -> SpiderCastConfig {
            self.config.clone()
        }
    }
}

#[cfg(feature = "network")]
pub use toml_config::TomlConfigProvider;
