//! Command-line interface.

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::logging::Verbosity;

/// facecam - USB webcam streamer and face capture for the Raspberry Pi
#[derive(Debug, Parser)]
#[command(name = "facecam")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to custom configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Increase verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Only print errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Open the camera, serve the stream and capture faces
    Run(RunCommand),

    /// Send pending captures once and exit
    Sync(SyncCommand),

    /// Report on camera devices, permissions and environment
    Diagnose,

    /// Inspect configuration
    #[command(subcommand)]
    Config(ConfigCommand),
}

#[derive(Debug, Args)]
pub struct RunCommand {
    /// Do not start the HTTP server
    #[arg(long)]
    pub no_stream: bool,

    /// Do not detect or store faces
    #[arg(long)]
    pub no_faces: bool,

    /// Address for the HTTP server, overriding `stream.bind`
    #[arg(long, value_name = "ADDR")]
    pub bind: Option<SocketAddr>,
}

#[derive(Debug, Args)]
pub struct SyncCommand {
    /// Rows to send, overriding `sync.final_batch_size`
    #[arg(long, value_name = "N")]
    pub batch: Option<usize>,
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Print the effective configuration with secrets masked
    Show,
    /// Print the default configuration file path
    Path,
}

impl Cli {
    #[must_use]
    pub fn verbosity(&self) -> Verbosity {
        if self.quiet {
            Verbosity::Quiet
        } else {
            match self.verbose {
                0 => Verbosity::Normal,
                1 => Verbosity::Verbose,
                _ => Verbosity::Trace,
            }
        }
    }
}
