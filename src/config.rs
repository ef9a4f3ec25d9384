use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::controller::dispatcher::DEFAULT_MAC;
use crate::controller::SessionSettings;

pub const DEFAULT_DEVICE: &str = "/dev/hidg0";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("Invalid MAC address {0:?}, expected six hex octets like 00:00:5e:00:53:5e")]
    InvalidMac(String),

    #[error("Interval must be at least 1 ms: {0}")]
    InvalidInterval(&'static str),
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct Config {
    /// HID gadget device node
    pub device: PathBuf,
    pub counter_interval_ms: u64,
    pub input_report_interval_ms: u64,
    pub log_input_reports: bool,
    pub mac_address: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            device: PathBuf::from(DEFAULT_DEVICE),
            counter_interval_ms: 5,
            input_report_interval_ms: 30,
            log_input_reports: false,
            mac_address: format_mac(&DEFAULT_MAC),
        }
    }
}

impl Config {
    /// `<config dir>/procon/config.toml`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("procon").join("config.toml"))
    }

    pub fn from_toml(contents: &str, path: &Path) -> Result<Self, ConfigError> {
        toml::from_str(contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        info!("Loading config from {}", path.display());
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&contents, path)
    }

    /// Loads `path` if given; otherwise the default location, falling back to
    /// built-in defaults when that file does not exist.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = path {
            return Self::load(path);
        }

        match Self::default_path() {
            Some(path) if path.exists() => Self::load(&path),
            _ => {
                debug!("No config file, using defaults");
                Ok(Self::default())
            }
        }
    }

    pub fn session_settings(&self) -> Result<SessionSettings, ConfigError> {
        if self.counter_interval_ms == 0 {
            return Err(ConfigError::InvalidInterval("counter_interval_ms"));
        }
        if self.input_report_interval_ms == 0 {
            return Err(ConfigError::InvalidInterval("input_report_interval_ms"));
        }

        Ok(SessionSettings {
            counter_interval_ms: self.counter_interval_ms,
            input_report_interval_ms: self.input_report_interval_ms,
            log_input_reports: self.log_input_reports,
            mac_address: parse_mac(&self.mac_address)?,
        })
    }
}

pub fn parse_mac(text: &str) -> Result<[u8; 6], ConfigError> {
    let invalid = || ConfigError::InvalidMac(text.to_string());

    let octets: Vec<&str> = text.split(':').collect();
    if octets.len() != 6 {
        return Err(invalid());
    }

    let mut mac = [0u8; 6];
    for (slot, octet) in mac.iter_mut().zip(octets) {
        if octet.len() != 2 || !octet.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(invalid());
        }
        *slot = u8::from_str_radix(octet, 16).map_err(|_| invalid())?;
    }
    Ok(mac)
}

pub fn format_mac(mac: &[u8; 6]) -> String {
    mac.iter()
        .map(|octet| format!("{:02x}", octet))
        .collect::<Vec<_>>()
        .join(":")
}
