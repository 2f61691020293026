//! Configuration management

use crate::usb::session::TransferTimeouts;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub device: DeviceMatch,
    #[serde(default)]
    pub transfer: TransferSettings,
    #[serde(default)]
    pub log: LogSettings,
}

/// Vendor/product pair the bus manager attaches to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DeviceMatch {
    #[serde(default = "DeviceMatch::default_vendor_id")]
    pub vendor_id: u16,
    #[serde(default = "DeviceMatch::default_product_id")]
    pub product_id: u16,
}

impl DeviceMatch {
    // Apple Xserve front panel
    fn default_vendor_id() -> u16 {
        0x05ac
    }

    fn default_product_id() -> u16 {
        0x821b
    }
}

impl Default for DeviceMatch {
    fn default() -> Self {
        Self {
            vendor_id: Self::default_vendor_id(),
            product_id: Self::default_product_id(),
        }
    }
}

/// Gateway timeouts and the event-loop poll interval, in milliseconds.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TransferSettings {
    /// Window for blocking bulk transfers
    #[serde(default = "TransferSettings::default_bulk_timeout_ms")]
    pub bulk_timeout_ms: u64,
    /// Window for vendor control exchanges
    #[serde(default = "TransferSettings::default_control_timeout_ms")]
    pub control_timeout_ms: u64,
    /// How long one event-loop receive cycle waits before re-arming empty
    #[serde(default = "TransferSettings::default_event_poll_ms")]
    pub event_poll_ms: u64,
}

impl TransferSettings {
    fn default_bulk_timeout_ms() -> u64 {
        5000
    }

    fn default_control_timeout_ms() -> u64 {
        1000
    }

    fn default_event_poll_ms() -> u64 {
        250
    }

    pub fn timeouts(&self) -> TransferTimeouts {
        TransferTimeouts {
            bulk: Duration::from_millis(self.bulk_timeout_ms),
            control: Duration::from_millis(self.control_timeout_ms),
        }
    }

    pub fn event_poll(&self) -> Duration {
        Duration::from_millis(self.event_poll_ms)
    }
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            bulk_timeout_ms: Self::default_bulk_timeout_ms(),
            control_timeout_ms: Self::default_control_timeout_ms(),
            event_poll_ms: Self::default_event_poll_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSettings {
    #[serde(default = "LogSettings::default_level")]
    pub level: String,
}

impl LogSettings {
    fn default_level() -> String {
        "info".to_string()
    }
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: Self::default_level(),
        }
    }
}

impl Config {
    /// Default configuration file location.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("xfp-usb")
            .join("config.toml")
    }

    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        toml::from_str(&contents)
            .with_context(|| format!("failed to parse config file: {}", path.display()))
    }

    /// Load from the default location, falling back to built-in defaults if
    /// no file exists there.
    pub fn load_or_default() -> Self {
        let path = Self::default_path();
        if path.exists() {
            match Self::load(&path) {
                Ok(config) => return config,
                Err(err) => {
                    eprintln!("Ignoring invalid config at {}: {:#}", path.display(), err);
                }
            }
        }
        Self::default()
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create config dir: {}", parent.display()))?;
        }
        let contents = toml::to_string_pretty(self).context("failed to serialize config")?;
        fs::write(path, contents)
            .with_context(|| format!("failed to write config file: {}", path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.device.vendor_id, 0x05ac);
        assert_eq!(config.device.product_id, 0x821b);
        assert_eq!(config.transfer.bulk_timeout_ms, 5000);
        assert_eq!(config.transfer.control_timeout_ms, 1000);
        assert_eq!(config.log.level, "info");
    }

    #[test]
    fn test_timeouts_conversion() {
        let settings = TransferSettings {
            bulk_timeout_ms: 250,
            control_timeout_ms: 50,
            event_poll_ms: 10,
        };
        let timeouts = settings.timeouts();
        assert_eq!(timeouts.bulk, Duration::from_millis(250));
        assert_eq!(timeouts.control, Duration::from_millis(50));
        assert_eq!(settings.event_poll(), Duration::from_millis(10));
    }

    #[test]
    fn test_partial_config_parses() {
        let config: Config = toml::from_str(
            r#"
            [transfer]
            bulk_timeout_ms = 2000
            "#,
        )
        .unwrap();
        assert_eq!(config.transfer.bulk_timeout_ms, 2000);
        assert_eq!(config.transfer.control_timeout_ms, 1000);
        assert_eq!(config.device.vendor_id, 0x05ac);
    }

    #[test]
    fn test_roundtrip() {
        let config = Config::default();
        let text = toml::to_string_pretty(&config).unwrap();
        let parsed: Config = toml::from_str(&text).unwrap();
        assert_eq!(parsed.device.vendor_id, config.device.vendor_id);
        assert_eq!(parsed.transfer.event_poll_ms, config.transfer.event_poll_ms);
    }
}
