//! Configuration for a PLC mirror
//!
//! Layering (lowest to highest): serde defaults, config file (YAML, TOML or JSON by
//! extension), then `PLCSYNC_` environment variables with `__` as the nesting
//! separator, e.g. `PLCSYNC_CONNECTION__FAILURE_THRESHOLD=5`.
//!
//! `word_order` has no default and must be provided by one of the layers.

use std::path::Path;
use std::time::Duration;

use figment::{
    providers::{Env, Format, Json, Toml, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::address::{Area, WordOrder};
use crate::error::{PlcError, Result};
use crate::logging::LogConfig;

/// Environment variable prefix
pub const ENV_PREFIX: &str = "PLCSYNC_";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlcConfig {
    /// Order of the two words inside every double word
    pub word_order: WordOrder,
    #[serde(default)]
    pub regions: RegionSizes,
    #[serde(default)]
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub polling: PollingConfig,
    #[serde(default)]
    pub logging: LogConfig,
}

/// Size of each memory area in bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegionSizes {
    pub input: usize,
    pub output: usize,
    pub memory: usize,
}

impl Default for RegionSizes {
    fn default() -> Self {
        Self {
            input: 128,
            output: 128,
            memory: 4096,
        }
    }
}

impl RegionSizes {
    pub fn size(&self, area: Area) -> usize {
        match area {
            Area::Input => self.input,
            Area::Output => self.output,
            Area::Memory => self.memory,
        }
    }
}

/// Connection guard and retry policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Attempts made by `connect()` when no explicit count is given
    pub connect_retries: u32,
    pub retry_delay_ms: u64,
    /// Extra attempts for a failed read or write
    pub operation_retries: u32,
    /// Consecutive failures before the guard drops to Disconnected
    pub failure_threshold: u32,
    /// Age after which `alive()` schedules a background probe
    pub probe_ttl_ms: u64,
    pub probe_timeout_ms: u64,
    pub max_retry_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub jitter: bool,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_retries: 3,
            retry_delay_ms: 200,
            operation_retries: 2,
            failure_threshold: 3,
            probe_ttl_ms: 250,
            probe_timeout_ms: 1000,
            max_retry_delay_ms: 2000,
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl ConnectionConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn probe_ttl(&self) -> Duration {
        Duration::from_millis(self.probe_ttl_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollingConfig {
    /// Interval used when a group is added with `interval_ms = 0`
    pub default_interval_ms: u64,
    /// Extra time granted to a stopping group before its task is aborted
    pub stop_grace_ms: u64,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            default_interval_ms: 500,
            stop_grace_ms: 1000,
        }
    }
}

impl PlcConfig {
    /// Defaults for everything except the word order
    pub fn new(word_order: WordOrder) -> Self {
        Self {
            word_order,
            regions: RegionSizes::default(),
            connection: ConnectionConfig::default(),
            polling: PollingConfig::default(),
            logging: LogConfig::default(),
        }
    }

    /// Load from a file plus `PLCSYNC_` environment overrides
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let extension = path
            .extension()
            .and_then(|s| s.to_str())
            .ok_or_else(|| PlcError::config("Config file must have an extension"))?;

        let figment = match extension {
            "yaml" | "yml" => Figment::new().merge(Yaml::file(path)),
            "toml" => Figment::new().merge(Toml::file(path)),
            "json" => Figment::new().merge(Json::file(path)),
            _ => {
                return Err(PlcError::config(format!(
                    "Unsupported config file format: {}",
                    extension
                )))
            },
        };
        if !path.exists() {
            return Err(PlcError::config(format!(
                "Config file not found: {}",
                path.display()
            )));
        }

        Self::extract(figment.merge(Env::prefixed(ENV_PREFIX).split("__")))
    }

    /// Parse a YAML document without environment overrides
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        Self::extract(Figment::new().merge(Yaml::string(yaml)))
    }

    fn extract(figment: Figment) -> Result<Self> {
        let config: Self = figment
            .extract()
            .map_err(|e| PlcError::config(format!("Failed to load configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        for area in Area::ALL {
            let size = self.regions.size(area);
            if size == 0 {
                return Err(PlcError::config(format!("region %{} has size 0", area)));
            }
            // the device is addressed in whole 16-bit registers
            if size % 2 != 0 {
                return Err(PlcError::config(format!(
                    "region %{} size {} is not a whole number of registers",
                    area, size
                )));
            }
        }
        if self.connection.failure_threshold == 0 {
            return Err(PlcError::config("connection.failure_threshold must be > 0"));
        }
        if self.connection.connect_retries == 0 {
            return Err(PlcError::config("connection.connect_retries must be > 0"));
        }
        if self.connection.probe_ttl_ms == 0 {
            return Err(PlcError::config("connection.probe_ttl_ms must be > 0"));
        }
        if self.connection.backoff_multiplier < 1.0 {
            return Err(PlcError::config(
                "connection.backoff_multiplier must be >= 1.0",
            ));
        }
        if self.polling.default_interval_ms == 0 {
            return Err(PlcError::config("polling.default_interval_ms must be > 0"));
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_word_order_is_required() {
        let err = PlcConfig::from_yaml_str("regions:\n  memory: 64\n").unwrap_err();
        assert!(matches!(err, PlcError::Config(_)));
    }

    #[test]
    fn test_defaults_fill_missing_sections() {
        let config = PlcConfig::from_yaml_str("word_order: big\n").unwrap();
        assert_eq!(config.word_order, WordOrder::HighWordFirst);
        assert_eq!(config.regions, RegionSizes::default());
        assert_eq!(config.connection.failure_threshold, 3);
        assert_eq!(config.polling.default_interval_ms, 500);
    }

    #[test]
    fn test_partial_section_override() {
        let yaml = "word_order: low_word_first\n\
                    connection:\n  failure_threshold: 5\n\
                    regions:\n  input: 16\n";
        let config = PlcConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.connection.failure_threshold, 5);
        assert_eq!(config.connection.retry_delay_ms, 200);
        assert_eq!(config.regions.input, 16);
        assert_eq!(config.regions.memory, 4096);
    }

    #[test]
    fn test_validate_rejects_zero_values() {
        let mut config = PlcConfig::new(WordOrder::LowWordFirst);
        assert!(config.validate().is_ok());
        config.regions.output = 0;
        assert!(config.validate().is_err());

        let mut config = PlcConfig::new(WordOrder::LowWordFirst);
        config.connection.failure_threshold = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_odd_region_sizes() {
        let yaml = "word_order: big\nregions:\n  memory: 63\n";
        let err = PlcConfig::from_yaml_str(yaml).unwrap_err();
        assert!(matches!(err, PlcError::Config(ref msg) if msg.contains("%M")));

        let mut config = PlcConfig::new(WordOrder::LowWordFirst);
        config.regions.input = 7;
        assert!(config.validate().is_err());
        config.regions.input = 8;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(file, "word_order: little").unwrap();
        writeln!(file, "polling:").unwrap();
        writeln!(file, "  stop_grace_ms: 50").unwrap();

        let config = PlcConfig::load(file.path()).unwrap();
        assert_eq!(config.word_order, WordOrder::LowWordFirst);
        assert_eq!(config.polling.stop_grace_ms, 50);
    }

    #[test]
    fn test_load_rejects_unknown_extension() {
        assert!(PlcConfig::load("plc.ini").is_err());
        assert!(PlcConfig::load("/nonexistent/plc.yaml").is_err());
    }
}
