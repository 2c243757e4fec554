// SPDX-License-Identifier: MIT
// Copyright (c) 2025 TREX contributors

// ABOUTME: Simulation error taxonomy: fatal integration errors, input validation, and I/O
// ABOUTME: Every fatal variant carries sim time, step length, and a dual cell/node location

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// Where in the domain a fatal error occurred. Channel locations report
/// both the link/node and the overland cell the node is bound to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Location {
    Cell { row: usize, col: usize },
    Node { link: usize, node: usize, row: usize, col: usize },
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Location::Cell { row, col } => write!(f, "row {} col {}", row, col),
            Location::Node {
                link,
                node,
                row,
                col,
            } => write!(f, "link {} node {} (row {} col {})", link, node, row, col),
        }
    }
}

/// Fatal and validation errors raised by the core.
///
/// Integration-loop variants abort the run immediately; the diagnostic is
/// echoed to the simulation error file before the process exits nonzero.
#[derive(Error, Debug)]
pub enum TrexError {
    #[error(
        "negative water depth {depth:.6e} m at {location} (time {time:.4} h, dt {dt:.4} s)"
    )]
    NegativeDepth {
        depth: f64,
        location: Location,
        time: f64,
        dt: f64,
    },

    #[error(
        "negative snow water equivalent {depth:.6e} m at {location} (time {time:.4} h, dt {dt:.4} s)"
    )]
    NegativeSwe {
        depth: f64,
        location: Location,
        time: f64,
        dt: f64,
    },

    #[error(
        "negative {kind} concentration {value:.6e} g/m3 for series {series} layer {layer} at {location} (time {time:.4} h, dt {dt:.4} s)"
    )]
    NegativeConcentration {
        /// "solids" or "chemical"
        kind: &'static str,
        series: usize,
        layer: usize,
        value: f64,
        location: Location,
        time: f64,
        dt: f64,
    },

    #[error(
        "channel bank height driven to {height:.6e} m at {location} (time {time:.4} h)"
    )]
    BankHeightExhausted {
        height: f64,
        location: Location,
        time: f64,
    },

    #[error(
        "{kind} stack full at {location}: {nstack} layers with no collapse option (time {time:.4} h)"
    )]
    StackFull {
        /// "soil" or "sediment"
        kind: &'static str,
        nstack: usize,
        location: Location,
        time: f64,
    },

    #[error("time step underflow: dt {dt:.6e} s below floor {floor:.6e} s at time {time:.4} h")]
    TimestepUnderflow { dt: f64, floor: f64, time: f64 },

    #[error(
        "grid dimension mismatch in {path}: {found_rows}x{found_cols} @ {found_cell_size} (master {rows}x{cols} @ {cell_size})"
    )]
    GridMismatch {
        path: PathBuf,
        found_rows: usize,
        found_cols: usize,
        found_cell_size: f64,
        rows: usize,
        cols: usize,
        cell_size: f64,
    },

    #[error("malformed grid file {path}: {reason}")]
    GridFormat { path: PathBuf, reason: String },

    #[error("malformed time series {path}: {reason}")]
    SeriesFormat { path: PathBuf, reason: String },

    #[error("input validation: {0}")]
    Validation(String),

    #[error("i/o error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("config error: {0}")]
    Config(String),
}

impl TrexError {
    /// Open or read a file, tagging the path into the error.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        TrexError::Io {
            path: path.into(),
            source,
        }
    }

    /// Integration-loop errors suppress final output; everything else is
    /// an initialization failure reported before the loop starts.
    pub fn is_integration_error(&self) -> bool {
        matches!(
            self,
            TrexError::NegativeDepth { .. }
                | TrexError::NegativeSwe { .. }
                | TrexError::NegativeConcentration { .. }
                | TrexError::BankHeightExhausted { .. }
                | TrexError::StackFull { .. }
                | TrexError::TimestepUnderflow { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, TrexError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_location_display() {
        let cell = Location::Cell { row: 3, col: 7 };
        assert_eq!(cell.to_string(), "row 3 col 7");
        let node = Location::Node {
            link: 1,
            node: 4,
            row: 3,
            col: 7,
        };
        assert_eq!(node.to_string(), "link 1 node 4 (row 3 col 7)");
    }

    #[test]
    fn test_integration_error_partition() {
        let fatal = TrexError::TimestepUnderflow {
            dt: 1.0e-7,
            floor: 1.0e-6,
            time: 2.0,
        };
        assert!(fatal.is_integration_error());
        let input = TrexError::Validation("nchems < 1".to_string());
        assert!(!input.is_integration_error());
    }
}
