//! # Reader wire protocol
//!
//! Commands travel host → device as `/<body>\n`. The device answers with
//! newline-terminated ASCII lines; the ones the host acts on start with `@`:
//!
//! ```text
//! > /scan_well 4 2
//! < @scan_well 4 2 51234
//! > /home
//! < @home
//! ```
//!
//! Well coordinates are sent column first, then row, both 0-based.

use std::fmt;
use std::num::ParseIntError;

use log::warn;
use thiserror::Error;

use crate::plate::{Well, WellError};

/// Longest partial line kept while waiting for its newline.
pub const MAX_LINE_LEN: usize = 4096;

/// Commands understood by the reader firmware.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Home,
    ScanWell(Well),
    ScanAll,
    /// Move the carriage stepper to an absolute position.
    MoveAbs(i32),
    /// Stepper position of each plate row.
    SetRowPositions(Vec<i64>),
    SetLedPower(Vec<i64>),
}

impl Command {
    /// Full frame as written to the port.
    pub fn encode(&self) -> String {
        format!("/{}\n", self)
    }
}

fn join(values: &[i64]) -> String {
    values
        .iter()
        .map(i64::to_string)
        .collect::<Vec<_>>()
        .join(" ")
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Home => write!(f, "home"),
            Command::ScanWell(well) => write!(f, "scan_well {} {}", well.column(), well.row()),
            Command::ScanAll => write!(f, "scan_all"),
            Command::MoveAbs(position) => write!(f, "move_abs {}", position),
            Command::SetRowPositions(positions) => write!(f, "set_row_pos {}", join(positions)),
            Command::SetLedPower(levels) => write!(f, "set_led_pwr {}", join(levels)),
        }
    }
}

#[derive(Debug, PartialEq, Error)]
pub enum ReplyError {
    /// Line contains bytes outside ASCII.
    #[error("reply is not ASCII")]
    NotAscii,
    /// A `@scan_well` reply lacks one of its three numbers.
    #[error("scan reply is missing the {0} field")]
    MissingField(&'static str),
    #[error("scan reply field is not an integer: {0}")]
    InvalidNumber(#[from] ParseIntError),
    #[error("scan reply has a negative coordinate (column {column}, row {row})")]
    NegativeCoordinate { column: i64, row: i64 },
    #[error("scan reply names a well off the plate: {0}")]
    InvalidWell(#[from] WellError),
}

/// A decoded line from the device.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    ScanWell { well: Well, intensity: i64 },
    Home,
    /// Anything the host does not act on (firmware chatter, echoes).
    Other(String),
}

impl Reply {
    /// Decodes one line with its terminator already removed.
    pub fn parse(line: &str) -> Result<Reply, ReplyError> {
        let line = line.trim();
        if line.starts_with("@scan_well") {
            let mut fields = line.split_whitespace().skip(1);
            let mut next = |name: &'static str| -> Result<i64, ReplyError> {
                let field = fields.next().ok_or(ReplyError::MissingField(name))?;
                Ok(field.parse::<i64>()?)
            };
            let column = next("column")?;
            let row = next("row")?;
            let intensity = next("intensity")?;
            if column < 0 || row < 0 {
                return Err(ReplyError::NegativeCoordinate { column, row });
            }
            let well = Well::new(row as usize, column as usize)?;
            return Ok(Reply::ScanWell { well, intensity });
        }
        if line.starts_with("@home") {
            return Ok(Reply::Home);
        }
        Ok(Reply::Other(line.to_string()))
    }
}

/// Splits the raw byte stream from the port into complete lines.
#[derive(Debug, Default)]
pub struct LineFramer {
    buffer: Vec<u8>,
    /// Set after an overflow; bytes are dropped until the next newline.
    discarding: bool,
}

impl LineFramer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `bytes` and returns every line completed by them. Lines are
    /// trimmed; empty ones are dropped. A line that is not ASCII is returned
    /// as an error in its place.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<Result<String, ReplyError>> {
        let mut lines = Vec::new();
        for &byte in bytes {
            if byte == b'\n' {
                if self.discarding {
                    self.discarding = false;
                    continue;
                }
                let raw = std::mem::take(&mut self.buffer);
                if !raw.is_ascii() {
                    lines.push(Err(ReplyError::NotAscii));
                    continue;
                }
                // ASCII is valid UTF-8.
                let text = String::from_utf8_lossy(&raw);
                let text = text.trim();
                if !text.is_empty() {
                    lines.push(Ok(text.to_string()));
                }
                continue;
            }
            if self.discarding {
                continue;
            }
            if self.buffer.len() >= MAX_LINE_LEN {
                warn!("Discarding line longer than {} bytes", MAX_LINE_LEN);
                self.buffer.clear();
                self.discarding = true;
                continue;
            }
            self.buffer.push(byte);
        }
        lines
    }

    /// Bytes held back waiting for a newline.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}
