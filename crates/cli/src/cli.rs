//! CLI argument definitions using clap.

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// Sinkpipe - at-least-once event delivery from a partitioned log to a sink
#[derive(Parser, Debug)]
#[command(
    name = "sinkpipe",
    author,
    version,
    about = "Partitioned log to sink delivery pipeline",
    long_about = "Consumes batches from a partitioned log, writes them to a key-value, document,\n\
                  blob, HTTP or log sink, retries failed messages with backoff and commits\n\
                  only offsets whose messages are durably resolved."
)]
pub struct Cli {
    /// Increase logging verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true, env = "SINKPIPE_VERBOSE")]
    pub verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Log output format
    #[arg(
        long,
        value_enum,
        default_value = "pretty",
        global = true,
        env = "SINKPIPE_LOG_FORMAT"
    )]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the delivery pipeline
    Run(RunArgs),

    /// Validate configuration file without running
    Validate(ValidateArgs),

    /// Display configuration information
    Info(InfoArgs),
}

/// Arguments for the `run` command
#[derive(Parser, Debug, Clone)]
pub struct RunArgs {
    /// Path to configuration file (TOML or JSON)
    #[arg(
        short,
        long,
        default_value = "pipeline.toml",
        env = "SINKPIPE_CONFIG"
    )]
    pub config: PathBuf,

    /// Override worker parallelism from configuration
    #[arg(long, env = "SINKPIPE_PARALLELISM")]
    pub parallelism: Option<usize>,

    /// Override the JSON-lines input file (without one, records are read from stdin)
    #[arg(long, env = "SINKPIPE_INPUT")]
    pub input: Option<PathBuf>,

    /// Pipeline timeout in seconds (0 = no timeout)
    #[arg(long, default_value = "0", env = "SINKPIPE_TIMEOUT")]
    pub timeout: u64,

    /// Validate configuration and exit without running pipeline
    #[arg(long)]
    pub dry_run: bool,

    /// Metrics server port (0 = disabled)
    #[arg(long, default_value = "9000", env = "SINKPIPE_METRICS_PORT")]
    pub metrics_port: u16,
}

/// Arguments for the `validate` command
#[derive(Parser, Debug)]
pub struct ValidateArgs {
    /// Path to configuration file to validate
    #[arg(short, long, default_value = "pipeline.toml")]
    pub config: PathBuf,

    /// Output validation result as JSON
    #[arg(long)]
    pub json: bool,
}

/// Arguments for the `info` command
#[derive(Parser, Debug)]
pub struct InfoArgs {
    /// Path to configuration file
    #[arg(short, long, default_value = "pipeline.toml")]
    pub config: PathBuf,

    /// Output as JSON
    #[arg(long)]
    pub json: bool,

    /// Show sink and dead-letter parameters
    #[arg(long)]
    pub params: bool,

    /// Print the effective configuration (defaults filled in) as TOML
    #[arg(long, conflicts_with = "json")]
    pub effective: bool,
}

/// Log output format
#[derive(ValueEnum, Clone, Debug, Default)]
pub enum LogFormat {
    /// JSON structured logging
    Json,
    /// Human-readable pretty format
    #[default]
    Pretty,
    /// Compact single-line format
    Compact,
}
