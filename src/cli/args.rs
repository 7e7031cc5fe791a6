//! Command-line arguments

use clap::Parser;
use std::path::PathBuf;

/// CLI arguments for the transfer client
#[derive(Debug, Parser)]
#[command(name = "rust-multi-downloader")]
#[command(about = "Cooperative multi-connection BitTorrent client", long_about = None)]
pub struct CliArgs {
    /// Metainfo file to download
    #[arg(value_name = "TORRENT_FILE")]
    pub torrent_file: PathBuf,

    /// Peer address to connect to (host:port), may be repeated
    #[arg(long = "peer", value_name = "HOST:PORT")]
    pub peers: Vec<String>,

    /// JSON configuration file
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Where to write the downloaded content
    #[arg(short, long, value_name = "FILE")]
    pub output: Option<PathBuf>,

    /// Listening port for incoming peer connections
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Upload limit in KiB/s (0 = unlimited)
    #[arg(long, value_name = "KIB")]
    pub upload_limit: Option<u64>,

    /// Keep seeding after the download completes
    #[arg(long)]
    pub seed: bool,

    /// Log at debug level
    #[arg(short, long)]
    pub verbose: bool,

    /// Only log errors
    #[arg(short, long)]
    pub quiet: bool,
}

impl CliArgs {
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Verbose runs use the multi-line log format
    pub fn is_verbose(&self) -> bool {
        self.verbose
    }

    /// Maximum tracing level; `--verbose` wins over `--quiet`
    pub fn log_level(&self) -> tracing::Level {
        if self.verbose {
            tracing::Level::DEBUG
        } else if self.quiet {
            tracing::Level::ERROR
        } else {
            tracing::Level::INFO
        }
    }
}
