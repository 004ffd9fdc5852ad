//! dht-bootstrap - Main entry point
//!
//! Starts a DHT node, bootstraps it from the given seeds and prints the
//! address other peers can reach it on.

use anyhow::{Context, Result};
use dht_bootstrap::{BootstrapReport, CliArgs, Config, Dht, Multiaddr, MultiaddrExt};
use tracing::{debug, error, info, warn};

/// Set up panic handler for unexpected errors
fn setup_panic_handler() {
    std::panic::set_hook(Box::new(|panic_info| {
        let backtrace = std::backtrace::Backtrace::capture();

        if let Some(location) = panic_info.location() {
            error!(
                "PANIC occurred at {}:{}:{}",
                location.file(),
                location.line(),
                location.column()
            );
        }
        let payload = panic_info.payload();
        if let Some(s) = payload.downcast_ref::<&str>() {
            error!("Panic message: {}", s);
        } else if let Some(s) = payload.downcast_ref::<String>() {
            error!("Panic message: {}", s);
        } else {
            error!("Panic message: unknown");
        }
        error!("Backtrace:\n{:?}", backtrace);
    }));
}

#[tokio::main]
async fn main() -> Result<()> {
    // Set up panic handler
    setup_panic_handler();

    // Parse CLI arguments
    let args = CliArgs::parse_args();

    // Initialize logging
    init_logging(&args);
    info!("dht-bootstrap starting");
    debug!("CLI arguments: {:?}", args);

    // Create configuration
    let config = Config::from_args(&args);

    // Validate configuration
    config.validate().context("Invalid configuration")?;

    let node = Dht::tcp(config.dht_config());
    node.start().await.context("Failed to start DHT")?;
    let listen = node.ready().await.context("Failed to start listener")?;
    debug!("Listening on {}", listen);

    let result = run(&node, &config).await;
    node.shutdown().await;
    result?;

    info!("dht-bootstrap finished");
    Ok(())
}

/// Bootstrap, then report the reachable address
async fn run(node: &Dht, config: &Config) -> Result<()> {
    let report = if config.has_seeds() {
        let report = node
            .bootstrap(config.bootstrap_config())
            .await
            .map_err(|e| {
                error!("Failed to bootstrap DHT: {}", e);
                e
            })
            .context("Bootstrap failed")?;
        Some(report)
    } else {
        warn!("No seeds given, skipping bootstrap");
        None
    };

    let Some(addr) = node.reachable_addr().await else {
        error!(
            "No reachable address found (listening on {}); pass --announce or --seed",
            node.listen_addr().map(|a| a.to_string()).unwrap_or_default()
        );
        return Err(anyhow::anyhow!("no reachable address"));
    };

    if !addr.is_public() {
        warn!("Reporting non-public address {}", addr);
    }

    let table_size = node.routing_table().len().await;
    let observed = node.observed_addrs().await;
    let full = addr.with_node_id(node.local_id())?;
    print_result(node, &full, table_size, &observed, report.as_ref(), config.json)
}

/// Print the node's full address, or a JSON summary
fn print_result(
    node: &Dht,
    addr: &Multiaddr,
    table_size: usize,
    observed: &[Multiaddr],
    report: Option<&BootstrapReport>,
    json: bool,
) -> Result<()> {
    if !json {
        println!("{}", addr);
        return Ok(());
    }

    let peer_id = node.local_id().to_base58()?;
    let summary = serde_json::json!({
        "peer_id": peer_id,
        "address": addr.to_string(),
        "table_size": table_size,
        "observed": observed.iter().map(|a| a.to_string()).collect::<Vec<_>>(),
        "connected_seeds": report.map(|r| r.connected.len()).unwrap_or(0),
        "discovered": report.map(|r| r.discovered).unwrap_or(0),
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

/// Initialize logging based on verbosity settings
fn init_logging(args: &CliArgs) {
    let level = args.log_level();

    // Logs go to stderr; stdout carries the result.
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);

    if args.is_verbose() {
        subscriber.pretty().init();
    } else {
        subscriber.compact().init();
    }

    debug!("Logging initialized with level: {:?}", level);
}
