//! Escrow CLI library
//!
//! Argument parsing, configuration loading and the in-process trade
//! simulation behind the `escrow` binary.

pub mod cli;
pub mod commands;
pub mod config;
pub mod error;
pub mod simulation;

pub use cli::{Cli, Commands};
pub use config::CliAppConfig;
pub use error::{CliError, Result};
pub use simulation::{Simulation, SimulationOptions, SimulationReport};
