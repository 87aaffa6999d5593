//! Configuration management for the driver.
//!
//! Sources, lowest precedence first: built-in defaults, a YAML file,
//! `PVE__`-prefixed environment variables (`PVE__RESOURCE__ADDRESS`,
//! `PVE__POLICIES__TASK__MAX_ATTEMPTS`, ...), then CLI flags.

use anyhow::{anyhow, Context, Result};
use ::config::{Config as Layers, ConfigBuilder, Environment, File};
use ::config::builder::DefaultState;
use pve_common::LogFormat;
use pve_engine::deploy::VariantTable;
use pve_engine::{EnginePolicies, ResourceConfig};
use serde::Deserialize;
use std::path::Path;

use crate::cli::Args;

/// Default location of the configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/pve-provider/driver.yaml";

const ENV_PREFIX: &str = "PVE";
const ENV_SEPARATOR: &str = "__";

/// Main configuration structure.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    /// Cluster connection and provider settings
    pub resource: ResourceConfig,
    /// Retry and polling budgets
    pub policies: EnginePolicies,
    /// Clone policy per deploy variant
    pub variants: VariantTable,
    pub logging: LoggingConfig,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

impl DriverConfig {
    /// Load configuration from `path` (required to exist) or from the
    /// default location (optional), layered under the environment.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let file = match path {
            Some(path) => {
                if !Path::new(path).exists() {
                    return Err(anyhow!("Config file not found: {}", path));
                }
                File::from(Path::new(path)).required(true)
            }
            None => File::from(Path::new(DEFAULT_CONFIG_PATH)).required(false),
        };

        Self::build(Layers::builder().add_source(file))
            .with_context(|| format!("Failed to load configuration from {}", path.unwrap_or(DEFAULT_CONFIG_PATH)))
    }

    /// Add the environment layer and deserialize.
    fn build(builder: ConfigBuilder<DefaultState>) -> Result<Self> {
        let layers = builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator(ENV_SEPARATOR)
                    .separator(ENV_SEPARATOR),
            )
            .build()
            .context("Failed to read configuration sources")?;

        layers
            .try_deserialize()
            .context("Failed to parse configuration")
    }

    /// Apply CLI argument overrides to the configuration.
    pub fn with_cli_overrides(mut self, args: &Args) -> Result<Self> {
        if let Some(ref address) = args.address {
            self.resource.address = address.clone();
        }

        if let Some(ref user) = args.user {
            self.resource.user = user.clone();
        }

        if let Some(ref password) = args.password {
            self.resource.password = password.clone();
        }

        if let Some(ref level) = args.log_level {
            self.logging.level = level.clone();
        }

        if let Some(ref format) = args.log_format {
            self.logging.format = format.parse()?;
        }

        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ::config::FileFormat;
    use pve_engine::ShutdownMethod;

    const YAML: &str = r#"
resource:
  address: pve.lab
  user: root@pam
  password: secret
  default_bridge: vmbr0
  shared_storage: ceph
  reserved_networks: ["99", "100"]
  shutdown_method: hard

policies:
  task:
    max_attempts: 10
    interval_secs: 2
  clone_attempts: 3

logging:
  level: debug
  format: json
"#;

    #[test]
    fn test_yaml_layer() {
        let config =
            DriverConfig::build(Layers::builder().add_source(File::from_str(YAML, FileFormat::Yaml)))
                .unwrap();

        assert_eq!(config.resource.address, "pve.lab");
        assert_eq!(config.resource.port, 8006);
        assert_eq!(config.resource.shutdown_method, ShutdownMethod::Hard);
        assert!(config.resource.is_reserved_network("99"));
        assert_eq!(config.policies.task.max_attempts, 10);
        assert_eq!(config.policies.clone_attempts, 3);
        // Unlisted budgets keep their defaults.
        assert_eq!(config.policies.stop_attempts, 5);
        assert_eq!(config.policies.deploy_task.max_attempts, 60);
        assert_eq!(config.logging.format, LogFormat::Json);
        assert!(config.resource.validate().is_ok());
    }

    #[test]
    fn test_defaults_without_sources() {
        let config = DriverConfig::default();
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.resource.scheme, "https");
        assert!(config.resource.validate().is_err());
    }

    #[test]
    fn test_missing_explicit_file_is_an_error() {
        assert!(DriverConfig::load(Some("/nonexistent/driver.yaml")).is_err());
    }
}
