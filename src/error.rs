use thiserror::Error;

use crate::config::ConfigError;

/// Errors raised while driving the reader.
#[derive(Debug, Error)]
pub enum Error {
    /// A command was issued before any port was selected.
    #[error("comport not connected")]
    NotConnected,
    /// `home` was requested while the previous one is still pending.
    #[error("device is already homing")]
    HomeInProgress,
    #[error("serial I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("serial port error: {0}")]
    Serial(#[from] serialport::Error),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

pub type Result<T> = std::result::Result<T, Error>;
