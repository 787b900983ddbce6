//! Engine configuration management
//!
//! Handles loading configuration from defaults, TOML files and environment
//! variables.

use serde::Deserialize;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tracing::level_filters::LevelFilter;
use tracing::Level;

use crate::settings::Settings;

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Zero connection attempts configured
    #[error("Invalid connection attempts: {0}. Must be at least 1")]
    InvalidAttempts(usize),

    /// Unrecognised log level
    #[error("Invalid log level: {0}. Must be one of: trace, debug, info, warn, error")]
    InvalidLogLevel(String),

    /// Config file could not be read or parsed
    #[error("Configuration file error: {0}")]
    FileError(String),

    /// Environment variable could not be parsed
    #[error("Environment variable error: {0}")]
    EnvError(String),
}

/// Verbosity of the `tracing` output, one variant per [`Level`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(try_from = "String")]
pub enum LogLevel {
    /// Generated kernel source and everything below
    Trace,
    /// Pool growth, slot creation, cache hits
    Debug,
    /// Engine initialisation and kernel builds
    #[default]
    Info,
    /// Connection retries
    Warn,
    /// Errors only
    Error,
}

impl LogLevel {
    const ALL: [LogLevel; 5] = [
        LogLevel::Trace,
        LogLevel::Debug,
        LogLevel::Info,
        LogLevel::Warn,
        LogLevel::Error,
    ];

    /// Matching `tracing` level.
    pub fn as_level(self) -> Level {
        match self {
            LogLevel::Trace => Level::TRACE,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Info => Level::INFO,
            LogLevel::Warn => Level::WARN,
            LogLevel::Error => Level::ERROR,
        }
    }
}

/// Accepts the names `tracing` accepts, in any case.
impl FromStr for LogLevel {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ConfigError::InvalidLogLevel(s.to_string());
        let level = Level::from_str(s.trim()).map_err(|_| invalid())?;
        Self::ALL
            .into_iter()
            .find(|candidate| candidate.as_level() == level)
            .ok_or_else(invalid)
    }
}

impl TryFrom<String> for LogLevel {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, <Self as TryFrom<String>>::Error> {
        value.parse()
    }
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        LevelFilter::from_level(level.as_level())
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.as_level().to_string().to_lowercase())
    }
}

/// Bounded retry with a fixed delay, used when acquiring a device connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Connection attempts before giving up (at least 1)
    pub attempts: usize,
    /// Pause between attempts
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: DEFAULT_CONNECT_ATTEMPTS,
            delay: Duration::from_millis(DEFAULT_CONNECT_DELAY_MS),
        }
    }
}

impl RetryPolicy {
    /// Single attempt, no delay.
    pub fn no_retry() -> Self {
        Self {
            attempts: 1,
            delay: Duration::ZERO,
        }
    }
}

const DEFAULT_CONNECT_ATTEMPTS: usize = 10;
const DEFAULT_CONNECT_DELAY_MS: u64 = 10_000;

/// Environment variable names
pub mod env {
    //! Names are shared by [`ComputeConfig::apply_env`](super::ComputeConfig::apply_env) and the CLI.

    /// Connection attempts
    pub const CONNECT_ATTEMPTS: &str = "PRICER_COMPUTE_CONNECT_ATTEMPTS";
    /// Delay between attempts (ms)
    pub const CONNECT_DELAY_MS: &str = "PRICER_COMPUTE_CONNECT_DELAY_MS";
    /// Host worker threads
    pub const HOST_THREADS: &str = "PRICER_COMPUTE_HOST_THREADS";
    /// Default generator seed
    pub const SEED: &str = "PRICER_COMPUTE_SEED";
    /// Default precision (`true` for double)
    pub const DOUBLE_PRECISION: &str = "PRICER_COMPUTE_DOUBLE_PRECISION";
    /// Default debug telemetry switch
    pub const DEBUG: &str = "PRICER_COMPUTE_DEBUG";
    /// Log level
    pub const LOG_LEVEL: &str = "PRICER_LOG_LEVEL";
}

/// Compute engine configuration structure
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ComputeConfig {
    /// Connection attempts per engine
    pub connect_attempts: usize,
    /// Delay between connection attempts in milliseconds
    pub connect_delay_ms: u64,
    /// Worker threads of the host backend (0 = one per logical CPU)
    pub host_threads: usize,
    /// Whether the host backend reports double precision support
    pub host_double_precision: bool,
    /// Settings used when the caller does not supply its own
    #[serde(rename = "settings")]
    pub default_settings: Settings,
    /// Log level
    pub log_level: LogLevel,
}

impl Default for ComputeConfig {
    fn default() -> Self {
        Self {
            connect_attempts: DEFAULT_CONNECT_ATTEMPTS,
            connect_delay_ms: DEFAULT_CONNECT_DELAY_MS,
            host_threads: num_cpus::get(),
            host_double_precision: true,
            default_settings: Settings::default(),
            log_level: LogLevel::Info,
        }
    }
}

impl ComputeConfig {
    /// Create a new ComputeConfig with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::FileError(format!("Failed to read config file: {}", e)))?;

        let config: ComputeConfig = toml::from_str(&content)
            .map_err(|e| ConfigError::FileError(format!("Failed to parse TOML: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Override fields with the variables `lookup` resolves.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup(env::CONNECT_ATTEMPTS) {
            self.connect_attempts = parse_var(env::CONNECT_ATTEMPTS, &value)?;
        }
        if let Some(value) = lookup(env::CONNECT_DELAY_MS) {
            self.connect_delay_ms = parse_var(env::CONNECT_DELAY_MS, &value)?;
        }
        if let Some(value) = lookup(env::HOST_THREADS) {
            self.host_threads = parse_var(env::HOST_THREADS, &value)?;
        }
        if let Some(value) = lookup(env::SEED) {
            self.default_settings.rng_seed = parse_var(env::SEED, &value)?;
        }
        if let Some(value) = lookup(env::DOUBLE_PRECISION) {
            self.default_settings.use_double_precision = parse_switch(env::DOUBLE_PRECISION, &value)?;
        }
        if let Some(value) = lookup(env::DEBUG) {
            self.default_settings.debug = parse_switch(env::DEBUG, &value)?;
        }
        if let Some(value) = lookup(env::LOG_LEVEL) {
            self.log_level = LogLevel::from_str(&value)?;
        }
        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.connect_attempts == 0 {
            return Err(ConfigError::InvalidAttempts(self.connect_attempts));
        }
        Ok(())
    }

    /// Connection retry policy
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.connect_attempts,
            delay: Duration::from_millis(self.connect_delay_ms),
        }
    }

    /// Host worker thread count, resolving 0 to the logical CPU count
    pub fn resolved_host_threads(&self) -> usize {
        if self.host_threads == 0 {
            num_cpus::get()
        } else {
            self.host_threads
        }
    }

    /// Merge with command-line overrides (overrides take precedence)
    pub fn merge_with_overrides(&mut self, overrides: &ConfigOverrides) -> Result<(), ConfigError> {
        if let Some(attempts) = overrides.connect_attempts {
            self.connect_attempts = attempts;
        }
        if let Some(threads) = overrides.host_threads {
            self.host_threads = threads;
        }
        if let Some(seed) = overrides.rng_seed {
            self.default_settings.rng_seed = seed;
        }
        if overrides.double_precision {
            self.default_settings.use_double_precision = true;
        }
        if overrides.debug {
            self.default_settings.debug = true;
        }
        if let Some(log_level) = &overrides.log_level {
            self.log_level = log_level.parse()?;
        }
        Ok(())
    }
}

/// `true`/`false`, also `1`/`0`, `yes`/`no` and `on`/`off`, in any case.
fn parse_switch(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::EnvError(format!(
            "{}: expected a boolean, got '{}'",
            key, value
        ))),
    }
}

fn parse_var<T: FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::EnvError(format!("{}: cannot parse '{}'", key, value)))
}

/// Command-line overrides
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    /// Config file path
    pub config_file: Option<std::path::PathBuf>,
    /// Connection attempts override
    pub connect_attempts: Option<usize>,
    /// Host thread count override
    pub host_threads: Option<usize>,
    /// Seed override
    pub rng_seed: Option<u64>,
    /// Force double precision
    pub double_precision: bool,
    /// Force debug telemetry
    pub debug: bool,
    /// Log level override
    pub log_level: Option<String>,
}

/// Build configuration from all sources
///
/// Priority (highest to lowest):
/// 1. Command-line overrides
/// 2. Environment variables
/// 3. Config file
/// 4. Default values
pub fn build_config(overrides: &ConfigOverrides) -> Result<ComputeConfig, ConfigError> {
    let mut config = match &overrides.config_file {
        Some(path) => ComputeConfig::from_file(path)?,
        None => ComputeConfig::default(),
    };

    config.apply_env(|key| std::env::var(key).ok())?;
    config.merge_with_overrides(overrides)?;
    config.validate()?;

    Ok(config)
}
