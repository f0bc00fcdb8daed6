//! Command-line surface of the light client.

use std::path::PathBuf;

use clap::Parser;

/// Fetch a file from a Streamspace swarm.
#[derive(Debug, Parser)]
#[command(name = "ss-light", author, version, about, long_about = None)]
pub struct Cli {
    /// Sharable link identifying the file and its serving swarm
    #[arg(long)]
    pub sharable: String,

    /// Destination directory for the downloaded file
    #[arg(long, default_value = ".")]
    pub dst: PathBuf,

    /// Overall fetch timeout (e.g. "45m", "90s")
    #[arg(long, default_value = "45m")]
    pub timeout: String,

    /// Only print the fetch metadata, do not download
    #[arg(long)]
    pub info: bool,

    /// Print SCP statistics and receipts after the download
    #[arg(long)]
    pub stat: bool,

    /// Show download progress
    #[arg(long)]
    pub progress: bool,

    /// Emit the result as a JSON envelope
    #[arg(long)]
    pub json: bool,

    /// Send logs to stderr
    #[arg(long = "logToStderr")]
    pub log_to_stderr: bool,
}
