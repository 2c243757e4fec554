// ABOUTME: Core domain model: raster grid, channel network, layer stacks, time functions
// ABOUTME: Shared foundations with no knowledge of the transport physics built on top

pub mod channel;
pub mod error;
pub mod grid;
pub mod stack;
pub mod timefunc;
pub mod units;

pub use channel::{ChannelNetwork, Connection, Link, NodeGeometry};
pub use error::{Location, Result, TrexError};
pub use grid::{CellMask, Grid, GridMap, Source, SOURCE_COUNT};
pub use stack::{Layer, MassTransfer, StackColumn};
pub use timefunc::{IntervalSchedule, TimeFunction};
