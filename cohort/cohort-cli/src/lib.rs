//! Library behind the `cohort` binary.

pub mod commands;
pub mod logging;
pub mod output;
pub mod simulation;

pub use output::OutputFormat;
pub use simulation::{SimulationOptions, SimulationReport};
