pub mod binder;

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Duration;

use crate::error::ConfigError;

pub use binder::{bind, BoundConfig, FieldKind, FieldSpec};

/// Flat key/section store; the engine never reads raw files itself
pub trait ConfigSource: Send + Sync {
    fn contains(&self, section: &str, key: &str) -> bool;
    fn raw(&self, section: &str, key: &str) -> Option<&serde_json::Value>;
    /// Section exists and is not switched off with `enabled = false`
    fn is_enabled(&self, section: &str) -> bool;
    fn sections(&self) -> Vec<String>;
}

/// Typed access on top of [`ConfigSource::raw`]
pub trait ConfigSourceExt: ConfigSource {
    fn get<T: DeserializeOwned>(&self, section: &str, key: &str) -> Result<Option<T>, ConfigError> {
        self.raw(section, key)
            .map(|raw| {
                serde_json::from_value(raw.clone()).map_err(|e| ConfigError::InvalidField {
                    section: section.to_string(),
                    key: key.to_string(),
                    reason: e.to_string(),
                })
            })
            .transpose()
    }
}

impl<T: ConfigSource + ?Sized> ConfigSourceExt for T {}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub manager: ManagerConfig,
    /// One flat section per component id
    #[serde(default)]
    pub components: BTreeMap<String, BTreeMap<String, serde_json::Value>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ManagerConfig {
    #[serde(default = "default_cycle_interval_ms")]
    pub cycle_interval_ms: u64,
    #[serde(default = "default_write_timeout_ms")]
    pub write_timeout_ms: u64,
    #[serde(default = "default_validation_interval_ms")]
    pub validation_interval_ms: u64,
}

fn default_cycle_interval_ms() -> u64 {
    10_000
}

fn default_write_timeout_ms() -> u64 {
    5_000
}

fn default_validation_interval_ms() -> u64 {
    60_000
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            cycle_interval_ms: default_cycle_interval_ms(),
            write_timeout_ms: default_write_timeout_ms(),
            validation_interval_ms: default_validation_interval_ms(),
        }
    }
}

impl ManagerConfig {
    pub fn cycle_interval(&self) -> Duration {
        Duration::from_millis(self.cycle_interval_ms.max(1))
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms.max(1))
    }
}

impl Config {
    pub fn load() -> Result<Self, ConfigError> {
        let figment = Figment::new()
            .merge(Toml::file("config/default.toml"))
            .merge(Env::prefixed("EMS__").split("__"));
        Ok(figment.extract()?)
    }

    pub fn from_toml_str(toml: &str) -> Result<Self, ConfigError> {
        Ok(Figment::from(Toml::string(toml)).extract()?)
    }
}

impl ConfigSource for Config {
    fn contains(&self, section: &str, key: &str) -> bool {
        self.raw(section, key).is_some()
    }

    fn raw(&self, section: &str, key: &str) -> Option<&serde_json::Value> {
        self.components.get(section).and_then(|s| s.get(key))
    }

    fn is_enabled(&self, section: &str) -> bool {
        match self.components.get(section) {
            Some(s) => s.get("enabled").and_then(|v| v.as_bool()).unwrap_or(true),
            None => false,
        }
    }

    fn sections(&self) -> Vec<String> {
        self.components.keys().cloned().collect()
    }
}
