//! Broker configuration.
//!
//! Loaded from an optional YAML file plus `DOMO_`-prefixed environment
//! variables.

use serde::Deserialize;

use crate::transport::TcpConfig;

/// Worker-selection policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DispatchMode {
    /// Least-loaded worker first.
    #[default]
    Load,
    /// Uniformly random eligible worker.
    Rand,
}

/// Core broker tunables.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Heartbeat tick period in ms.
    pub heartbeat: u64,
    /// Default worker-selection mode.
    pub dmode: DispatchMode,
    /// Retry ceiling after rejects.
    pub rattempts: u32,
    /// Enable the response cache and request fingerprinting.
    pub cache: bool,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            heartbeat: 2500,
            dmode: DispatchMode::Load,
            rattempts: 5,
            cache: false,
        }
    }
}

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Broker configuration.
    pub broker: BrokerConfig,
    /// TCP listener configuration.
    pub transport: TcpConfig,
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Sources in order of priority (later overrides earlier):
    /// 1. `domo.yaml` in the current directory (if present)
    /// 2. File named by the `DOMO_CONFIG` environment variable (if set)
    /// 3. Environment variables with the `DOMO_` prefix
    pub fn load() -> Result<Self, Box<dyn std::error::Error>> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new("domo", FileFormat::Yaml).required(false))
            .add_source(File::new("domo.yaml", FileFormat::Yaml).required(false));

        if let Ok(path) = std::env::var("DOMO_CONFIG") {
            builder = builder.add_source(File::new(&path, FileFormat::Yaml).required(true));
        }

        let config = builder
            .add_source(
                Environment::with_prefix("DOMO")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(config.try_deserialize()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_broker_config_defaults() {
        let config = BrokerConfig::default();
        assert_eq!(config.heartbeat, 2500);
        assert_eq!(config.dmode, DispatchMode::Load);
        assert_eq!(config.rattempts, 5);
        assert!(!config.cache);
    }

    #[test]
    fn test_dispatch_mode_deserializes_lowercase() {
        let config: BrokerConfig = serde_json::from_str(r#"{"dmode": "rand"}"#).unwrap();
        assert_eq!(config.dmode, DispatchMode::Rand);
    }

    #[test]
    fn test_config_default_transport() {
        let config = Config::default();
        assert_eq!(config.transport.port, 7400);
    }
}
