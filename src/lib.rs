// ABOUTME: Library interface for the TREX watershed transport simulation engine
// ABOUTME: Exposes clean public API for external use while keeping internal organization

pub mod engine;

// Re-export key engine components for library users
pub use engine::config::SimulationConfig;
pub use engine::core::error::{Result, TrexError};
pub use engine::output::{OutputConfig, OutputWriter};
pub use engine::{NullSink, RunSummary, Simulation, StepSink};
