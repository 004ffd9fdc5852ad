//! CLI configuration module
//!
//! Turns parsed arguments into node and bootstrap settings.

use crate::cli::args::CliArgs;
use crate::dht::bootstrap::{BootstrapConfig, DEFAULT_RETRY_BACKOFF};
use crate::dht::dht::DhtConfig;
use crate::dht::lookup::{LookupConfig, DEFAULT_ALPHA};
use crate::dht::node::ID_BITS;
use crate::dht::routing::RoutingConfig;
use crate::error::DhtError;
use crate::transport::{Multiaddr, MultiaddrExt};
use anyhow::Result;
use std::time::Duration;

/// Configuration for the DHT bootstrap node
#[derive(Debug, Clone)]
pub struct Config {
    /// Address to listen on
    pub listen: Multiaddr,
    /// Seed addresses
    pub seeds: Vec<Multiaddr>,
    /// Advertised address
    pub announce: Option<Multiaddr>,
    /// Bucket capacity
    pub k: usize,
    /// Seeds dialled at once
    pub concurrency: usize,
    /// Overall bootstrap deadline
    pub timeout: Duration,
    /// Extra attempts per seed
    pub retries: u32,
    pub ping_timeout: Duration,
    pub request_timeout: Duration,
    pub max_rounds: usize,
    /// JSON output
    pub json: bool,
    /// Verbose output
    pub verbose: bool,
    /// Quiet mode
    pub quiet: bool,
}

impl Config {
    /// Create configuration from CLI arguments
    pub fn from_args(args: &CliArgs) -> Self {
        Self {
            listen: args.listen.clone(),
            seeds: args.seeds.clone(),
            announce: args.announce.clone(),
            k: args.k,
            concurrency: args.concurrency,
            timeout: Duration::from_secs(args.timeout_secs),
            retries: args.retries,
            ping_timeout: Duration::from_millis(args.ping_timeout_ms),
            request_timeout: Duration::from_millis(args.request_timeout_ms),
            max_rounds: args.max_rounds,
            json: args.json,
            verbose: args.verbose,
            quiet: args.quiet,
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.k == 0 || self.k > ID_BITS {
            return Err(DhtError::config_error_with_field(format!("must be between 1 and {}", ID_BITS), "k").into());
        }

        if self.concurrency == 0 {
            return Err(DhtError::config_error_with_field("must be at least 1", "concurrency").into());
        }

        if self.timeout.is_zero() {
            return Err(DhtError::config_error_with_field("must be non-zero", "timeout").into());
        }

        if self.ping_timeout.is_zero() || self.request_timeout.is_zero() {
            return Err(DhtError::config_error("ping and request timeouts must be non-zero").into());
        }

        if self.max_rounds == 0 {
            return Err(DhtError::config_error_with_field("must be at least 1", "max_rounds").into());
        }

        if self.listen.ip_addr().is_none() {
            return Err(DhtError::config_error_with_field("must be an /ip4 or /ip6 address", "listen").into());
        }

        if self.verbose && self.quiet {
            return Err(DhtError::config_error("verbose and quiet are mutually exclusive").into());
        }

        Ok(())
    }

    /// Check if any seeds were given
    pub fn has_seeds(&self) -> bool {
        !self.seeds.is_empty()
    }

    fn lookup_config(&self) -> LookupConfig {
        LookupConfig {
            k: self.k,
            alpha: DEFAULT_ALPHA,
            request_timeout: self.request_timeout,
            max_rounds: self.max_rounds,
        }
    }

    /// Settings for the node service
    pub fn dht_config(&self) -> DhtConfig {
        DhtConfig {
            listen: self.listen.clone(),
            announce: self.announce.clone(),
            routing: RoutingConfig {
                k: self.k,
                ping_timeout: self.ping_timeout,
            },
            lookup: self.lookup_config(),
            connect_timeout: self.request_timeout,
            ..DhtConfig::default()
        }
    }

    /// Settings for the bootstrap coordinator
    pub fn bootstrap_config(&self) -> BootstrapConfig {
        BootstrapConfig {
            seeds: self.seeds.clone(),
            timeout: self.timeout,
            max_concurrency: self.concurrency,
            retries: self.retries,
            retry_backoff: DEFAULT_RETRY_BACKOFF,
            lookup: self.lookup_config(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    fn parse(args: &[&str]) -> Config {
        let mut argv = vec!["dht-bootstrap"];
        argv.extend_from_slice(args);
        Config::from_args(&CliArgs::try_parse_from(argv).unwrap())
    }

    #[test]
    fn test_config_from_args() {
        let config = parse(&[
            "--listen",
            "/ip4/127.0.0.1/tcp/4001",
            "--seed",
            "/ip4/10.0.0.1/tcp/4001",
            "--k",
            "16",
            "--timeout-secs",
            "10",
            "--request-timeout-ms",
            "1500",
            "--json",
        ]);

        assert_eq!(config.listen.tcp_port(), Some(4001));
        assert!(config.has_seeds());
        assert_eq!(config.k, 16);
        assert_eq!(config.timeout, Duration::from_secs(10));
        assert_eq!(config.request_timeout, Duration::from_millis(1500));
        assert!(config.json);
    }

    #[test]
    fn test_config_validate() {
        assert!(parse(&[]).validate().is_ok());
    }

    #[test]
    fn test_config_validate_invalid_values() {
        assert!(parse(&["--k", "0"]).validate().is_err());
        assert!(parse(&["--concurrency", "0"]).validate().is_err());
        assert!(parse(&["--timeout-secs", "0"]).validate().is_err());
        assert!(parse(&["--max-rounds", "0"]).validate().is_err());
        assert!(parse(&["--listen", "/dns4/localhost/tcp/1"]).validate().is_err());
        assert!(parse(&["-v", "-q"]).validate().is_err());
    }

    #[test]
    fn test_derived_configs() {
        let config = parse(&["--seed", "/ip4/10.0.0.1/tcp/4001", "--k", "8", "--retries", "5"]);

        let dht = config.dht_config();
        assert_eq!(dht.routing.k, 8);
        assert_eq!(dht.lookup.k, 8);
        assert_eq!(dht.listen, config.listen);

        let boot = config.bootstrap_config();
        assert_eq!(boot.seeds.len(), 1);
        assert_eq!(boot.retries, 5);
        assert_eq!(boot.max_concurrency, 8);
    }
}
