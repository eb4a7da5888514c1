//! Command-line interface definitions.

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// A configuration-driven bootstrap framework with hot reload.
#[derive(Parser, Debug)]
#[command(name = "appboot", version, about, long_about = None)]
pub struct Cli {
    /// Path to the configuration file.
    #[arg(short, long, default_value = "config.yaml", env = "CONFIG_PATH", global = true)]
    pub config: PathBuf,

    /// Increase logging verbosity (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    /// Returns the log level based on verbosity flags.
    pub fn log_level(&self) -> &'static str {
        match self.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    }
}

/// Available subcommands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Boot the application and run until a termination signal.
    Run(RunArgs),

    /// Validate the configuration file without booting.
    #[command(name = "config-validate")]
    ConfigValidate,

    /// Display the merged configuration.
    #[command(name = "config-show")]
    ConfigShow,
}

/// Arguments for the run subcommand.
#[derive(Args, Debug)]
pub struct RunArgs {
    /// Remote configuration source to activate at boot (e.g. "redis").
    #[arg(long)]
    pub remote: Option<String>,

    /// Emit human-readable logs instead of JSON.
    #[arg(long, default_value = "false")]
    pub plain_logs: bool,
}
