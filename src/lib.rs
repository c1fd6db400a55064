//! # Microplate Reader Library
//!
//! This library contains the host-side logic for driving a microplate reader over
//! a serial link. It encodes the ASCII commands the firmware understands, decodes
//! the line-based replies it sends back, and keeps the intensity readings of every
//! well of the 8×12 plate.

pub mod config;
pub mod error;
pub mod link;
pub mod plate;
pub mod protocol;
pub mod session;

pub use config::{ConfigError, DeviceConfig, DEFAULT_CONFIG_PATH};
pub use error::{Error, Result};
pub use plate::{Plate, Well, WellError, COLUMNS, ROWS};
pub use protocol::{Command, LineFramer, Reply, ReplyError};
pub use session::{Event, Session};
