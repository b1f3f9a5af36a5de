//! Configuration file.
//!
//! ```toml
//! [stream]
//! frontend = 0
//! demux = 0
//! pmt_timeout_ms = 5000
//!
//! [logging]
//! log_dir = "logs"
//! retention_days = 7
//! level = "info"
//!
//! [[plugin]]
//! name = "soft0"
//! ca_system_ids = [0x0500, 0x1810]
//! ```

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::plugin::{CaOptions, TableTiming, TsParams};

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "caman.toml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Deserialize, Default, Clone, PartialEq, Eq)]
pub struct Config {
    #[serde(default)]
    pub stream: StreamSection,
    #[serde(default)]
    pub logging: LoggingSection,
    #[serde(default, rename = "plugin")]
    pub plugins: Vec<PluginSection>,
}

#[derive(Debug, Deserialize, Default, Clone, PartialEq, Eq)]
pub struct StreamSection {
    pub frontend: Option<u32>,
    pub demux: Option<u32>,
    pub pat_timeout_ms: Option<u64>,
    pub pat_poll_ms: Option<u64>,
    pub pmt_timeout_ms: Option<u64>,
    pub pmt_poll_ms: Option<u64>,
    pub cat_timeout_ms: Option<u64>,
    pub cat_poll_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default, Clone, PartialEq, Eq)]
pub struct LoggingSection {
    pub log_dir: Option<String>,
    pub retention_days: Option<u64>,
    pub level: Option<String>,
}

/// A software CA plug-in to register at start-up.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct PluginSection {
    pub name: String,
    #[serde(default)]
    pub ca_system_ids: Vec<u16>,
    #[serde(default = "default_true")]
    pub auto_match: bool,
    #[serde(default)]
    pub strip_ca_descriptors: bool,
    #[serde(default = "default_true")]
    pub open: bool,
}

fn default_true() -> bool {
    true
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&contents)
    }

    pub fn parse(contents: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        for (i, plugin) in self.plugins.iter().enumerate() {
            if plugin.name.is_empty() {
                return Err(ConfigError::Invalid(format!("plugin #{} has an empty name", i + 1)));
            }
            if self.plugins[..i].iter().any(|p| p.name == plugin.name) {
                return Err(ConfigError::Invalid(format!(
                    "plugin name {} is used twice",
                    plugin.name
                )));
            }
        }
        Ok(())
    }
}

impl StreamSection {
    pub fn ts_params(&self) -> TsParams {
        let defaults = TableTiming::default();
        let timing = |timeout: Option<u64>, poll: Option<u64>| {
            TableTiming::from_millis(
                timeout.unwrap_or(defaults.timeout.as_millis() as u64),
                poll.unwrap_or(defaults.poll.as_millis() as u64),
            )
        };

        TsParams {
            frontend: self.frontend.unwrap_or(0),
            demux: self.demux.unwrap_or(0),
            pat: timing(self.pat_timeout_ms, self.pat_poll_ms),
            pmt: timing(self.pmt_timeout_ms, self.pmt_poll_ms),
            cat: timing(self.cat_timeout_ms, self.cat_poll_ms),
        }
    }
}

impl PluginSection {
    pub fn options(&self) -> CaOptions {
        CaOptions {
            auto_match: self.auto_match,
        }
    }
}
