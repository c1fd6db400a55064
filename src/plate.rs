//! Well coordinates and the in-memory results grid of an 8×12 microplate.

use std::fmt;
use std::io::{self, Write};
use std::str::FromStr;

use thiserror::Error;

/// Number of plate rows (`A`..`H`).
pub const ROWS: usize = 8;
/// Number of plate columns (`1`..`12`).
pub const COLUMNS: usize = 12;

#[derive(Debug, PartialEq, Error)]
pub enum WellError {
    /// Row or column index lies outside the plate.
    #[error("well ({row}, {column}) is outside the 8x12 plate")]
    OutOfRange { row: usize, column: usize },
    /// Label is not of the form `A1`..`H12`.
    #[error("invalid well label '{0}'")]
    InvalidLabel(String),
}

/// A single well, addressed by 0-based row and column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Well {
    row: u8,
    column: u8,
}

impl Well {
    pub fn new(row: usize, column: usize) -> Result<Self, WellError> {
        if row >= ROWS || column >= COLUMNS {
            return Err(WellError::OutOfRange { row, column });
        }
        Ok(Self {
            row: row as u8,
            column: column as u8,
        })
    }

    pub fn row(&self) -> usize {
        self.row as usize
    }

    pub fn column(&self) -> usize {
        self.column as usize
    }

    /// Row-major iterator over every well on the plate.
    pub fn all() -> impl Iterator<Item = Well> {
        (0..ROWS).flat_map(|row| {
            (0..COLUMNS).map(move |column| Well {
                row: row as u8,
                column: column as u8,
            })
        })
    }

    fn index(&self) -> usize {
        self.row() * COLUMNS + self.column()
    }
}

impl fmt::Display for Well {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", (b'A' + self.row) as char, self.column + 1)
    }
}

impl FromStr for Well {
    type Err = WellError;

    fn from_str(label: &str) -> Result<Self, Self::Err> {
        let invalid = || WellError::InvalidLabel(label.to_string());
        let mut chars = label.trim().chars();
        let letter = chars.next().ok_or_else(invalid)?.to_ascii_uppercase();
        if !letter.is_ascii_uppercase() {
            return Err(invalid());
        }
        let digits = chars.as_str();
        if !digits.starts_with(|c: char| c.is_ascii_digit()) {
            return Err(invalid());
        }
        let number: usize = digits.parse().map_err(|_| invalid())?;
        if number == 0 {
            return Err(invalid());
        }
        Well::new((letter as u8 - b'A') as usize, number - 1).map_err(|_| invalid())
    }
}

/// Intensity samples collected for every well of the plate.
#[derive(Debug, Clone, PartialEq)]
pub struct Plate {
    wells: Vec<Vec<i64>>,
}

impl Default for Plate {
    fn default() -> Self {
        Self::new()
    }
}

impl Plate {
    pub fn new() -> Self {
        Self {
            wells: vec![Vec::new(); ROWS * COLUMNS],
        }
    }

    pub fn record(&mut self, well: Well, intensity: i64) {
        self.wells[well.index()].push(intensity);
    }

    pub fn samples(&self, well: Well) -> &[i64] {
        &self.wells[well.index()]
    }

    pub fn latest(&self, well: Well) -> Option<i64> {
        self.samples(well).last().copied()
    }

    pub fn mean(&self, well: Well) -> Option<f64> {
        let samples = self.samples(well);
        if samples.is_empty() {
            return None;
        }
        Some(samples.iter().map(|&s| s as f64).sum::<f64>() / samples.len() as f64)
    }

    /// Total number of samples across the plate.
    pub fn count(&self) -> usize {
        self.wells.iter().map(Vec::len).sum()
    }

    pub fn clear(&mut self) {
        self.wells.iter_mut().for_each(Vec::clear);
    }

    /// Writes the per-well means as 8 comma separated lines of 12 values.
    /// Wells without samples are written as `nan`. Values use the shortest
    /// decimal form (`12.5`), not the `%.18e` notation of numpy's `savetxt`.
    pub fn write_csv<W: Write>(&self, mut writer: W) -> io::Result<()> {
        for row in 0..ROWS {
            let line = (0..COLUMNS)
                .map(|column| {
                    let well = Well {
                        row: row as u8,
                        column: column as u8,
                    };
                    match self.mean(well) {
                        Some(mean) => mean.to_string(),
                        None => String::from("nan"),
                    }
                })
                .collect::<Vec<_>>()
                .join(",");
            writeln!(writer, "{}", line)?;
        }
        writer.flush()
    }
}
