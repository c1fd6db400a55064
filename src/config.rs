//! Device configuration, read once from a TOML file at startup.
//!
//! ```toml
//! row_positions = [1200, 2100, 3000, 3900, 4800, 5700, 6600, 7500]
//! led_intensities = [80, 80]
//! open_position = 14000
//!
//! [serial]
//! baud_rate = 9600
//! home_timeout_ms = 15000
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::warn;
use serde::Deserialize;
use thiserror::Error;

use crate::plate::ROWS;

/// File looked up in the working directory when no path is given.
pub const DEFAULT_CONFIG_PATH: &str = "./microplate-reader-config.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("malformed config: {0}")]
    Parse(#[from] toml::de::Error),
    /// A list setting that the device needs at least one value of.
    #[error("config field '{0}' must not be empty")]
    Empty(&'static str),
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SerialSettings {
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    #[serde(default = "default_home_timeout_ms")]
    pub home_timeout_ms: u64,
}

fn default_baud_rate() -> u32 {
    9600
}

fn default_home_timeout_ms() -> u64 {
    15_000
}

impl Default for SerialSettings {
    fn default() -> Self {
        Self {
            baud_rate: default_baud_rate(),
            home_timeout_ms: default_home_timeout_ms(),
        }
    }
}

impl SerialSettings {
    pub fn home_timeout(&self) -> Duration {
        Duration::from_millis(self.home_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DeviceConfig {
    /// Stepper position of each plate row, sent with `set_row_pos`.
    pub row_positions: Vec<i64>,
    /// LED power levels, sent with `set_led_pwr`.
    pub led_intensities: Vec<i64>,
    /// Stepper position with the tray ejected.
    pub open_position: i32,
    #[serde(default)]
    pub serial: SerialSettings,
}

impl DeviceConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let config: DeviceConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.row_positions.is_empty() {
            return Err(ConfigError::Empty("row_positions"));
        }
        if self.led_intensities.is_empty() {
            return Err(ConfigError::Empty("led_intensities"));
        }
        if self.row_positions.len() != ROWS {
            warn!(
                "row_positions has {} entries, the plate has {} rows",
                self.row_positions.len(),
                ROWS
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL: &str = r#"
        row_positions = [1200, 2100, 3000, 3900, 4800, 5700, 6600, 7500]
        led_intensities = [80, 75]
        open_position = -14000

        [serial]
        baud_rate = 115200
        home_timeout_ms = 500
    "#;

    #[test]
    fn parse_full_config() {
        let config = DeviceConfig::from_toml(FULL).unwrap();
        assert_eq!(config.row_positions.len(), 8);
        assert_eq!(config.row_positions[7], 7500);
        assert_eq!(config.led_intensities, vec![80, 75]);
        assert_eq!(config.open_position, -14000);
        assert_eq!(config.serial.baud_rate, 115200);
        assert_eq!(config.serial.home_timeout(), Duration::from_millis(500));
    }

    #[test]
    fn serial_section_defaults() {
        let config = DeviceConfig::from_toml(
            "row_positions = [1]\nled_intensities = [2]\nopen_position = 3\n",
        )
        .unwrap();
        assert_eq!(config.serial, SerialSettings::default());
        assert_eq!(config.serial.baud_rate, 9600);
        assert_eq!(config.serial.home_timeout(), Duration::from_secs(15));
    }

    #[test]
    fn reject_missing_open_position() {
        let result = DeviceConfig::from_toml("row_positions = [1]\nled_intensities = [2]\n");
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn reject_empty_lists() {
        let result = DeviceConfig::from_toml(
            "row_positions = []\nled_intensities = [2]\nopen_position = 3\n",
        );
        assert!(matches!(result, Err(ConfigError::Empty("row_positions"))));

        let result = DeviceConfig::from_toml(
            "row_positions = [1]\nled_intensities = []\nopen_position = 3\n",
        );
        assert!(matches!(result, Err(ConfigError::Empty("led_intensities"))));
    }

    #[test]
    fn reject_unknown_serial_keys() {
        let result = DeviceConfig::from_toml(
            "row_positions = [1]\nled_intensities = [2]\nopen_position = 3\n[serial]\nparity = 1\n",
        );
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn missing_file_reports_path() {
        let err = DeviceConfig::load("/nonexistent/microplate-reader-config.toml").unwrap_err();
        assert!(err.to_string().contains("/nonexistent/microplate-reader-config.toml"));
    }
}
