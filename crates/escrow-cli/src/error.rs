//! Error handling for the escrow CLI

use std::time::Duration;

use thiserror::Error;

/// CLI-specific error types
#[derive(Error, Debug)]
pub enum CliError {
    #[error("Engine error: {0}")]
    Engine(#[from] escrow_core::EscrowError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Simulation failed at {step}: {reason}")]
    Simulation { step: String, reason: String },

    #[error("Timed out after {after:?} waiting for {step}")]
    Timeout { step: String, after: Duration },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("TOML parsing error: {0}")]
    TomlParsing(#[from] toml::de::Error),

    #[error("TOML encoding error: {0}")]
    TomlEncoding(#[from] toml::ser::Error),
}

/// Result type for CLI operations
pub type Result<T> = std::result::Result<T, CliError>;

impl CliError {
    pub fn simulation(step: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Simulation {
            step: step.into(),
            reason: reason.into(),
        }
    }
}
