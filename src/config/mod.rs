use log::{debug, info};
use serde::{Deserialize, Serialize};
use serde_yml;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::metering_62056::structs::MeterSettings;
use crate::mqtt::topic_trie::validate_topic;
use crate::mqtt::BrokerOptions;

/// Places searched for the configuration when no path is given.
pub const CONFIG_PATHS: [&str; 2] = ["config/energylink.yaml", "energylink.yaml"];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("No configuration found, tried {0}")]
    NotFound(String),
    #[error("Unable to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Unable to parse {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yml::Error,
    },
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

fn bridge_base_topic_default() -> String { return "energylink".to_string() }
fn bridge_interval_default() -> u64 { return 60 }
fn bridge_qos_default() -> u8 { return 1 }
fn bridge_retain_default() -> bool { return false }

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct BridgeConfig {
    #[serde(default="bridge_base_topic_default")]
    pub base_topic: String,
    #[serde(default="bridge_interval_default")]
    pub interval_secs: u64,
    #[serde(default="bridge_qos_default")]
    pub qos: u8,
    #[serde(default="bridge_retain_default")]
    pub retain: bool,
}

fn bridge_default() -> BridgeConfig {
    return BridgeConfig {
        base_topic: bridge_base_topic_default(),
        interval_secs: bridge_interval_default(),
        qos: bridge_qos_default(),
        retain: bridge_retain_default(),
    };
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Config {
    pub meter: MeterSettings,
    pub mqtt: BrokerOptions,
    #[serde(default="bridge_default")]
    pub bridge: BridgeConfig,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let display = path.display().to_string();
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Io { path: display.clone(), source })?;
        let config: Config = serde_yml::from_str(&contents).map_err(|source| ConfigError::Parse { path: display.clone(), source })?;
        config.validate()?;
        info!("Configuration loaded from {display}");
        return Ok(config);
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.bridge.interval_secs == 0 {
            return Err(ConfigError::Invalid("bridge.interval_secs must be at least 1".to_string()));
        }
        if self.bridge.qos > 2 {
            return Err(ConfigError::Invalid(format!("bridge.qos {} is not 0, 1 or 2", self.bridge.qos)));
        }
        if self.mqtt.outbound_cap == 0 {
            return Err(ConfigError::Invalid("mqtt.outbound_cap must be at least 1".to_string()));
        }
        if let Err(e) = validate_topic(&self.bridge.base_topic) {
            return Err(ConfigError::Invalid(e.to_string()));
        }
        Ok(())
    }
}

/// Picks the configuration file: the explicit path if given, otherwise
/// the first of `CONFIG_PATHS` below `base` that exists.
pub fn locate(base: &Path, explicit: Option<&str>) -> Result<PathBuf, ConfigError> {
    if let Some(path) = explicit {
        return Ok(PathBuf::from(path));
    }

    for candidate in CONFIG_PATHS {
        let path = base.join(candidate);
        debug!("Looking for configuration at {}", path.display());
        if path.is_file() {
            return Ok(path);
        }
    }
    Err(ConfigError::NotFound(CONFIG_PATHS.join(" or ")))
}
