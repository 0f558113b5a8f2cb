//! Configuration loading using Figment
//!
//! Configuration is loaded from:
//! 1. `config/icepap.toml` (or an explicit path)
//! 2. Environment variables prefixed with `ICEPAP_`, nested keys separated
//!    by `__` (e.g. `ICEPAP_APPLICATION__LOG_LEVEL=debug`,
//!    `ICEPAP_CONTROLLERS__ICE1__HOST=iceid001:5001`)
//!
//! # Example
//! ```toml
//! [application]
//! log_level = "info"
//! log_format = "compact"
//!
//! [defaults]
//! port = 5000
//! timeout_ms = 1000
//!
//! [controllers.ice1]
//! host = "iceid001"
//! mode = "icepap"
//!
//! [[axes]]
//! name = "th"
//! controller = "ice1"
//! address = 1
//!
//! [[groups]]
//! name = "diffractometer"
//! axes = ["th"]
//! flags = "mode=exclusive"
//! ```

use crate::axis::AxisFlags;
use crate::error::{IcepapError, Result};
use crate::logging::OutputFormat;
use crate::protocol::{ProtocolMode, ProtocolSettings};
use crate::transport::Endpoint;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::time::Duration;

/// Default configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "config/icepap.toml";
/// Environment variable prefix.
pub const ENV_PREFIX: &str = "ICEPAP_";

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IcepapConfig {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Values applied to every controller unless overridden
    #[serde(default)]
    pub defaults: DefaultsConfig,
    /// Controllers by name
    #[serde(default)]
    pub controllers: BTreeMap<String, ControllerConfig>,
    /// Axis definitions
    #[serde(default)]
    pub axes: Vec<AxisConfig>,
    /// Group definitions
    #[serde(default)]
    pub groups: Vec<GroupConfig>,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log output format
    #[serde(default)]
    pub log_format: OutputFormat,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: OutputFormat::default(),
        }
    }
}

/// Controller defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultsConfig {
    /// TCP port used when a host has none
    #[serde(default = "default_port")]
    pub port: u16,
    /// Reply timeout in milliseconds
    #[serde(default = "default_timeout")]
    pub timeout_ms: u64,
    /// Timeout for acknowledged binary downloads in milliseconds
    #[serde(default = "default_long_timeout")]
    pub long_timeout_ms: u64,
    /// Quiet window ending a drain of stale input, in milliseconds
    #[serde(default = "default_drain_quiet")]
    pub drain_quiet_ms: u64,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            timeout_ms: default_timeout(),
            long_timeout_ms: default_long_timeout(),
            drain_quiet_ms: default_drain_quiet(),
        }
    }
}

/// One controller
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// `host[:port]`
    pub host: String,
    /// Reply timeout override in milliseconds
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// Wire dialect
    #[serde(default)]
    pub mode: ProtocolMode,
}

/// One axis
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AxisConfig {
    /// Unique axis name
    pub name: String,
    /// Controller name
    pub controller: String,
    /// Address on the controller
    pub address: u16,
    /// Option text, e.g. `"mode=readonly"`
    #[serde(default)]
    pub flags: String,
}

/// One group
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupConfig {
    /// Unique group name
    pub name: String,
    /// Member axis names
    pub axes: Vec<String>,
    /// Option text, e.g. `"mode=exclusive"`
    #[serde(default)]
    pub flags: String,
}

// Default value functions
fn default_log_level() -> String {
    "info".to_string()
}

fn default_port() -> u16 {
    Endpoint::DEFAULT_PORT
}

fn default_timeout() -> u64 {
    1000
}

fn default_long_timeout() -> u64 {
    20_000
}

fn default_drain_quiet() -> u64 {
    50
}

/// Resolves a controller name to the endpoint to dial.
///
/// This is the only coupling between the motion core and the surrounding
/// configuration service; implementations must be pure lookups.
pub trait ControllerResolver {
    /// Endpoint of controller `name`.
    fn resolve(&self, name: &str) -> Result<Endpoint>;
}

impl IcepapConfig {
    /// Load configuration from [`DEFAULT_CONFIG_PATH`] and environment variables.
    pub fn load() -> Result<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self> {
        let config: IcepapConfig = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;
        Ok(config)
    }

    /// Parse configuration from TOML text, without the environment.
    pub fn from_toml(text: &str) -> Result<Self> {
        let config: IcepapConfig = Figment::new().merge(Toml::string(text)).extract()?;
        Ok(config)
    }

    /// Render as TOML.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string(self).map_err(|e| IcepapError::Config(e.to_string()))
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(IcepapError::Config(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        for (name, controller) in &self.controllers {
            if controller.host.trim().is_empty() {
                return Err(IcepapError::Config(format!("controller '{}' has no host", name)));
            }
            self.resolve(name)?;
        }

        let mut names = HashSet::new();
        let mut addresses = HashSet::new();
        for axis in &self.axes {
            if !names.insert(axis.name.as_str()) {
                return Err(IcepapError::Config(format!("Duplicate axis name: {}", axis.name)));
            }
            if !self.controllers.contains_key(&axis.controller) {
                return Err(IcepapError::Config(format!(
                    "axis '{}' uses unknown controller '{}'",
                    axis.name, axis.controller
                )));
            }
            if !addresses.insert((axis.controller.as_str(), axis.address)) {
                return Err(IcepapError::Config(format!(
                    "axis '{}': address {} already used on controller '{}'",
                    axis.name, axis.address, axis.controller
                )));
            }
            let flags = AxisFlags::parse(&axis.flags)
                .map_err(|e| IcepapError::Config(format!("axis '{}': {}", axis.name, e)))?;
            if flags.exclusive {
                return Err(IcepapError::Config(format!(
                    "axis '{}': mode=exclusive is only valid on groups",
                    axis.name
                )));
            }
        }

        let mut groups = HashSet::new();
        for group in &self.groups {
            if !groups.insert(group.name.as_str()) {
                return Err(IcepapError::Config(format!("Duplicate group name: {}", group.name)));
            }
            AxisFlags::parse(&group.flags)
                .map_err(|e| IcepapError::Config(format!("group '{}': {}", group.name, e)))?;
            if let Some(unknown) = group.axes.iter().find(|a| !names.contains(a.as_str())) {
                return Err(IcepapError::Config(format!(
                    "group '{}' uses unknown axis '{}'",
                    group.name, unknown
                )));
            }
        }

        Ok(())
    }

    fn controller(&self, name: &str) -> Result<&ControllerConfig> {
        self.controllers.get(name).ok_or_else(|| IcepapError::UnknownName {
            kind: "controller",
            name: name.to_string(),
        })
    }

    /// Protocol settings of controller `name`.
    pub fn settings_for(&self, name: &str) -> Result<ProtocolSettings> {
        let controller = self.controller(name)?;
        Ok(ProtocolSettings {
            mode: controller.mode,
            timeout: Duration::from_millis(controller.timeout_ms.unwrap_or(self.defaults.timeout_ms)),
            long_timeout: Duration::from_millis(self.defaults.long_timeout_ms),
            drain_quiet: Duration::from_millis(self.defaults.drain_quiet_ms),
        })
    }
}

impl ControllerResolver for IcepapConfig {
    fn resolve(&self, name: &str) -> Result<Endpoint> {
        let controller = self.controller(name)?;
        let timeout = Duration::from_millis(controller.timeout_ms.unwrap_or(self.defaults.timeout_ms));
        Endpoint::parse(&controller.host, self.defaults.port, timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        [application]
        log_level = "debug"
        log_format = "json"

        [defaults]
        timeout_ms = 500

        [controllers.ice1]
        host = "iceid001"

        [controllers.ice2]
        host = "iceid002:5010"
        timeout_ms = 2000
        mode = "deep"

        [[axes]]
        name = "th"
        controller = "ice1"
        address = 1

        [[axes]]
        name = "tth"
        controller = "ice2"
        address = 2
        flags = "mode=dontmove"

        [[groups]]
        name = "diff"
        axes = ["th", "tth"]
        flags = "mode=exclusive"
    "#;

    #[test]
    fn test_parse_and_validate() {
        let config = IcepapConfig::from_toml(SAMPLE).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.application.log_format, OutputFormat::Json);
        assert_eq!(config.defaults.port, 5000);
        assert_eq!(config.axes.len(), 2);
        assert_eq!(config.groups[0].axes, vec!["th", "tth"]);
    }

    #[test]
    fn test_resolver() {
        let config = IcepapConfig::from_toml(SAMPLE).unwrap();
        let ice1 = config.resolve("ice1").unwrap();
        assert_eq!(ice1.host, "iceid001");
        assert_eq!(ice1.port, 5000);
        assert_eq!(ice1.timeout, Duration::from_millis(500));

        let ice2 = config.resolve("ice2").unwrap();
        assert_eq!(ice2.port, 5010);
        assert_eq!(ice2.timeout, Duration::from_secs(2));
        assert_eq!(config.settings_for("ice2").unwrap().mode, ProtocolMode::Deep);
        assert_eq!(config.settings_for("ice1").unwrap().mode, ProtocolMode::IcePap);

        assert!(matches!(
            config.resolve("ice9"),
            Err(IcepapError::UnknownName { kind: "controller", .. })
        ));
    }

    #[test]
    fn test_invalid_log_level() {
        let mut config = IcepapConfig::from_toml(SAMPLE).unwrap();
        config.application.log_level = "invalid".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unknown_references() {
        let mut config = IcepapConfig::from_toml(SAMPLE).unwrap();
        config.axes[0].controller = "nowhere".to_string();
        assert!(config.validate().is_err());

        let mut config = IcepapConfig::from_toml(SAMPLE).unwrap();
        config.groups[0].axes.push("chi".to_string());
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("chi"));
    }

    #[test]
    fn test_duplicate_axis_names() {
        let mut config = IcepapConfig::from_toml(SAMPLE).unwrap();
        config.axes[1].name = "th".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_exclusive_axis_rejected() {
        let mut config = IcepapConfig::from_toml(SAMPLE).unwrap();
        config.axes[0].flags = "mode=exclusive".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_defaults_without_file_content() {
        let config = IcepapConfig::from_toml("").unwrap();
        assert_eq!(config.application.log_level, "info");
        assert_eq!(config.defaults.long_timeout_ms, 20_000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_toml_round_trip() {
        let config = IcepapConfig::from_toml(SAMPLE).unwrap();
        let text = config.to_toml().unwrap();
        let again = IcepapConfig::from_toml(&text).unwrap();
        assert_eq!(again.axes[1].flags, "mode=dontmove");
        assert_eq!(again.controllers["ice2"].mode, ProtocolMode::Deep);
    }
}
