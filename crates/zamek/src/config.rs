//! Static configuration loaded from TOML files.
//!
//! Files are read in order and merged key by key, so a site-local file can
//! override a shared one:
//!
//! ```toml
//! [serial]
//! port = "/dev/ttyUSB0"
//! speed = 9600
//!
//! [mqtt]
//! host = "localhost"
//! port = 1883
//! ```

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::health::PING_TIMEOUT_THRESHOLD;
use crate::link::LinkTimings;

pub const DEFAULT_CONFIG_FILES: [&str; 2] = ["config.toml", "localconfig.toml"];

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", path.display())]
    Read { path: PathBuf, source: io::Error },

    #[error("failed to parse {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("no configuration file found (tried {0})")]
    NotFound(String),

    #[error("missing [{0}] section")]
    MissingSection(&'static str),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Only the driver talks to the IO board.
    #[serde(default)]
    pub serial: Option<SerialConfig>,
    pub mqtt: MqttConfig,
    #[serde(default)]
    pub link: LinkConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SerialConfig {
    pub port: String,
    pub speed: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,
}

fn default_keep_alive_secs() -> u64 {
    30
}

impl MqttConfig {
    /// Configured client id, or `zamek-` plus a random suffix.
    pub fn client_id(&self) -> String {
        match &self.client_id {
            Some(id) => id.clone(),
            None => {
                let suffix = uuid::Uuid::new_v4().simple().to_string();
                format!("zamek-{}", &suffix[..8])
            }
        }
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    pub read_timeout_ms: u64,
    pub health_check_timeout_ms: u64,
    pub ping_timeout_threshold: u32,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            read_timeout_ms: 5_000,
            health_check_timeout_ms: 1_000,
            ping_timeout_threshold: PING_TIMEOUT_THRESHOLD,
        }
    }
}

impl LinkConfig {
    pub fn timings(&self) -> LinkTimings {
        LinkTimings {
            read_timeout: Duration::from_millis(self.read_timeout_ms),
            health_check_timeout: Duration::from_millis(self.health_check_timeout_ms),
            ping_timeout_threshold: self.ping_timeout_threshold,
        }
    }
}

impl Config {
    /// Load and merge the given files; missing files are skipped.
    pub fn load<P: AsRef<Path>>(paths: &[P]) -> Result<Self, ConfigError> {
        let mut merged = toml::Table::new();
        let mut found = false;

        for path in paths {
            let path = path.as_ref();
            let content = match std::fs::read_to_string(path) {
                Ok(content) => content,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    tracing::debug!(path = %path.display(), "Config file not found, skipping");
                    continue;
                }
                Err(source) => {
                    return Err(ConfigError::Read {
                        path: path.to_path_buf(),
                        source,
                    });
                }
            };

            let table: toml::Table = content.parse().map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
            tracing::debug!(path = %path.display(), "Loaded config file");
            merge_tables(&mut merged, table);
            found = true;
        }

        if !found {
            let tried = paths
                .iter()
                .map(|p| p.as_ref().display().to_string())
                .collect::<Vec<_>>()
                .join(", ");
            return Err(ConfigError::NotFound(tried));
        }

        Self::from_table(merged)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let table: toml::Table = content
            .parse()
            .map_err(|e: toml::de::Error| ConfigError::Invalid(e.to_string()))?;
        Self::from_table(table)
    }

    fn from_table(table: toml::Table) -> Result<Self, ConfigError> {
        let config = toml::Value::Table(table)
            .try_into::<Config>()
            .map_err(|e: toml::de::Error| ConfigError::Invalid(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(serial) = &self.serial {
            if serial.port.trim().is_empty() {
                return Err(ConfigError::Invalid("serial.port is empty".into()));
            }
            if serial.speed == 0 {
                return Err(ConfigError::Invalid("serial.speed must be positive".into()));
            }
        }
        if self.mqtt.host.trim().is_empty() {
            return Err(ConfigError::Invalid("mqtt.host is empty".into()));
        }
        if self.mqtt.port == 0 {
            return Err(ConfigError::Invalid("mqtt.port must be positive".into()));
        }
        if self.mqtt.keep_alive_secs < 5 {
            return Err(ConfigError::Invalid(
                "mqtt.keep_alive_secs must be at least 5".into(),
            ));
        }
        if self.link.read_timeout_ms == 0 || self.link.health_check_timeout_ms == 0 {
            return Err(ConfigError::Invalid("link timeouts must be positive".into()));
        }
        Ok(())
    }

    pub fn serial(&self) -> Result<&SerialConfig, ConfigError> {
        self.serial
            .as_ref()
            .ok_or(ConfigError::MissingSection("serial"))
    }
}

fn merge_tables(base: &mut toml::Table, overlay: toml::Table) {
    for (key, value) in overlay {
        match value {
            toml::Value::Table(nested) => match base.get_mut(&key) {
                Some(toml::Value::Table(existing)) => merge_tables(existing, nested),
                _ => {
                    base.insert(key, toml::Value::Table(nested));
                }
            },
            value => {
                base.insert(key, value);
            }
        }
    }
}
