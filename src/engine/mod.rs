// ABOUTME: Engine module organization - core domain model, physics stages, and the loop
// ABOUTME: Provides clean internal structure for the simulation subsystems

pub mod config;
pub mod core;
pub mod massbalance;
pub mod output;
pub mod physics;

// Main simulation struct - keep at engine level
pub mod sim;
pub use sim::{NullSink, RunSummary, Simulation, StepSink, TimestepController};
