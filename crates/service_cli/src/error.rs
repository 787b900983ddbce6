//! CLI error types.

use pricer_compute::{ComputeError, ConfigError};
use thiserror::Error;

/// Errors surfaced by CLI commands.
#[derive(Error, Debug)]
pub enum CliError {
    /// Configuration could not be resolved
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// The compute engine rejected a call
    #[error("Compute error: {0}")]
    Compute(#[from] ComputeError),

    /// Invalid command argument
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Report serialisation failed
    #[error("Output error: {0}")]
    Output(#[from] serde_json::Error),
}

/// Result alias for CLI commands.
pub type Result<T> = std::result::Result<T, CliError>;
