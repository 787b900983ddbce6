//! Neutryx Compute CLI - Command Line Operations for the Compute Engine
//!
//! Operational entry point for `pricer_compute`.
//!
//! # Commands
//!
//! - `neutryx-compute devices` - List compute devices and their properties
//! - `neutryx-compute demo` - Price a European call on a device, reusing the
//!   cached kernel across runs
//!
//! Settings are resolved from defaults, an optional TOML file, `PRICER_*`
//! environment variables and the flags below, in increasing priority.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use pricer_compute::{build_config, ConfigOverrides, HostBackend, LogLevel};
use tracing::info;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod commands;
mod error;

pub use error::{CliError, Result};

/// Neutryx device-offload compute engine CLI
#[derive(Parser, Debug)]
#[command(name = "neutryx-compute")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file path (TOML format)
    #[arg(short, long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Connection attempts per device
    #[arg(long, global = true)]
    connect_attempts: Option<usize>,

    /// Host backend worker threads (0 = one per logical CPU)
    #[arg(long, global = true)]
    host_threads: Option<usize>,

    /// Seed of the variates generator
    #[arg(long, global = true)]
    seed: Option<u64>,

    /// Evaluate in double precision
    #[arg(long, global = true)]
    double: bool,

    /// Collect operation counts and timings
    #[arg(long, global = true)]
    debug: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

impl From<&Cli> for ConfigOverrides {
    fn from(cli: &Cli) -> Self {
        ConfigOverrides {
            config_file: cli.config.clone(),
            connect_attempts: cli.connect_attempts,
            host_threads: cli.host_threads,
            rng_seed: cli.seed,
            double_precision: cli.double,
            debug: cli.debug,
            log_level: cli.log_level.clone(),
        }
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List compute devices and their properties
    Devices {
        /// Show a single device
        #[arg(short, long)]
        device: Option<String>,
    },

    /// Price a European call by Monte Carlo on a device
    Demo {
        /// Device name
        #[arg(short, long, default_value = HostBackend::DEVICE_NAME)]
        device: String,

        /// Number of Monte Carlo paths
        #[arg(short = 'n', long, default_value = "100000")]
        num_paths: usize,

        /// Time steps per path
        #[arg(short, long, default_value = "12")]
        steps: usize,

        /// Runs of the same calculation slot
        #[arg(short, long, default_value = "3")]
        runs: usize,

        /// Output format (table, json)
        #[arg(short, long, default_value = "table")]
        format: String,
    },
}

fn init_tracing(log_level: LogLevel) {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                tracing_subscriber::EnvFilter::default()
                    .add_directive(LevelFilter::from(log_level).into())
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = build_config(&ConfigOverrides::from(&cli))?;

    init_tracing(config.log_level);
    info!(
        connect_attempts = config.connect_attempts,
        host_threads = config.resolved_host_threads(),
        double_precision = config.default_settings.use_double_precision,
        debug = config.default_settings.debug,
        log_level = %config.log_level,
        "Configuration loaded"
    );

    match cli.command {
        Commands::Devices { device } => commands::devices::run(&config, device.as_deref()),
        Commands::Demo {
            device,
            num_paths,
            steps,
            runs,
            format,
        } => commands::demo::run(
            &config,
            &commands::demo::DemoArgs {
                device,
                num_paths,
                steps,
                runs,
                format,
            },
        ),
    }
}
