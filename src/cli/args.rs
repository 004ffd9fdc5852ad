//! CLI arguments module
//!
//! Defines command-line argument parsing using clap.

use crate::transport::{parse_dialable, Multiaddr};
use clap::Parser;

/// CLI arguments for the DHT bootstrap node
#[derive(Debug, Parser)]
#[command(name = "dht-bootstrap")]
#[command(about = "Join a Kademlia DHT and print the address this node is reachable on", long_about = None)]
pub struct CliArgs {
    /// Address to listen on
    #[arg(short, long, value_name = "MULTIADDR", default_value = "/ip4/0.0.0.0/tcp/0", value_parser = parse_dialable)]
    pub listen: Multiaddr,

    /// Seed node to bootstrap from (repeatable)
    #[arg(short, long = "seed", value_name = "MULTIADDR", value_parser = parse_dialable)]
    pub seeds: Vec<Multiaddr>,

    /// Externally reachable address to advertise
    #[arg(long, value_name = "MULTIADDR", value_parser = parse_dialable)]
    pub announce: Option<Multiaddr>,

    /// Bucket capacity and lookup result size
    #[arg(short, long, default_value_t = 20)]
    pub k: usize,

    /// Seeds dialled at once
    #[arg(short, long, default_value_t = 8)]
    pub concurrency: usize,

    /// Deadline for the whole bootstrap, in seconds
    #[arg(long, default_value_t = 30)]
    pub timeout_secs: u64,

    /// Extra attempts per seed
    #[arg(long, default_value_t = 2)]
    pub retries: u32,

    /// Liveness ping timeout before evicting a peer, in milliseconds
    #[arg(long, default_value_t = 2000)]
    pub ping_timeout_ms: u64,

    /// Timeout for a single request, in milliseconds
    #[arg(long, default_value_t = 5000)]
    pub request_timeout_ms: u64,

    /// Maximum rounds of the self lookup
    #[arg(long, default_value_t = 20)]
    pub max_rounds: usize,

    /// Print the result as JSON
    #[arg(long)]
    pub json: bool,

    /// Verbose output
    #[arg(short, long)]
    pub verbose: bool,

    /// Quiet mode (no output except errors)
    #[arg(short, long)]
    pub quiet: bool,
}

impl CliArgs {
    /// Parse CLI arguments from command line
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Check if verbose mode is enabled
    pub fn is_verbose(&self) -> bool {
        self.verbose
    }

    /// Get the log level based on verbosity settings
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
