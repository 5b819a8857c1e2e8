//! Command line argument parsing for the Quiver CLI using clap.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

pub const DEFAULT_HOST: &str = "localhost";
pub const DEFAULT_PORT: u16 = 8000;

/// Quiver - an embeddable vector-similarity engine
#[derive(Parser, Debug, Clone)]
#[command(name = "quiver")]
#[command(about = "An embeddable vector-similarity storage and query engine")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(long_about = None)]
pub struct QuiverArgs {
    /// Verbosity level (-v normal, -vv verbose, -vvv debug)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Quiet mode (overrides verbose)
    #[arg(short, long, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Command,
}

impl QuiverArgs {
    /// Get the effective verbosity level
    pub fn verbosity(&self) -> u8 {
        if self.quiet {
            0
        } else {
            match self.verbose {
                0 => 1, // Default to normal
                n => n,
            }
        }
    }
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Start the engine and serve the HTTP API until interrupted
    Start(StartArgs),
}

/// Arguments for starting the server
#[derive(Parser, Debug, Clone)]
pub struct StartArgs {
    /// Interface to listen on
    #[arg(long, env = "QUIVER_HOST", default_value = DEFAULT_HOST)]
    pub host: String,

    /// Port to listen on
    #[arg(short, long, env = "QUIVER_PORT", default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Data directory (overrides the configuration file)
    #[arg(long, env = "QUIVER_DATA_DIR", value_name = "DIR")]
    pub data_dir: Option<PathBuf>,

    /// Engine configuration file (JSON)
    #[arg(short, long, env = "QUIVER_CONFIG", value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Fall back to an in-memory engine when the data directory is unusable
    #[arg(long)]
    pub allow_ephemeral: bool,
}
