//! spyglass-agent entry point
//!
//! Wires the pipeline together: driver socket → dispatcher → trackers →
//! reporter → collector channel, plus the control stream for runtime
//! configuration and the startup self-check.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use log::{error, info, warn};
use tokio::signal;
use tokio::sync::{oneshot, watch};

use spyglass_agent::config::{ConfigHandle, RuntimeConfig};
use spyglass_agent::containers::ProcContainerLookup;
use spyglass_agent::conntrack::ConnectionTracker;
use spyglass_agent::control::CollectorClient;
use spyglass_agent::dispatch::SignalRegistry;
use spyglass_agent::driver::{EventSource, UnixSocketSource, MAX_BATCH_SIZE};
use spyglass_agent::endpoints::EndpointTracker;
use spyglass_agent::event::EventExtractor;
use spyglass_agent::handlers::{EndpointSignalHandler, NetworkSignalHandler, SelfCheckNetworkHandler};
use spyglass_agent::reporter::Reporter;
use spyglass_agent::scrape::ProcNetScraper;
use spyglass_agent::stats::PipelineStats;

/// Interval between driver socket polls when the buffer runs dry.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// How long startup waits for the collector to push its first config
/// before proceeding on defaults.
const CONFIG_WAIT: Duration = Duration::from_secs(5);

#[derive(Parser)]
#[command(name = "spyglass-agent")]
#[command(version)]
#[command(about = "Host agent shipping container network observations to a collector", long_about = None)]
struct Cli {
    /// Collector endpoint
    #[arg(long, default_value = "http://localhost:9090")]
    collector: String,

    /// Driver event socket path
    #[arg(long, default_value = "/var/run/spyglass/events.sock")]
    driver_socket: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .init();

    info!("spyglass-agent v{} starting...", spyglass_agent::VERSION);

    let stats = Arc::new(PipelineStats::new());
    let config = Arc::new(ConfigHandle::new(RuntimeConfig::default()));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Control channel first: it delivers the initial runtime config.
    let client = CollectorClient::new();
    let control_task = tokio::spawn(
        client
            .clone()
            .run(cli.collector.clone(), config.clone(), shutdown_rx.clone()),
    );

    if config.wait_until_initialized(CONFIG_WAIT).await {
        info!("runtime configuration received from collector");
    } else {
        warn!(
            "no runtime configuration within {:?}, proceeding with defaults",
            CONFIG_WAIT
        );
    }

    let containers = Arc::new(ProcContainerLookup::new());
    let initial = config.load();
    let conn_tracker = Arc::new(ConnectionTracker::new(initial.connection_table_cap));
    let endpoint_tracker = Arc::new(EndpointTracker::new(initial.endpoint_table_cap));

    // Self-check registers first so it sees its own events before the
    // network handler filters anything.
    let (verified_tx, verified_rx) = oneshot::channel();
    let mut registry = SignalRegistry::new();
    registry.register(Box::new(SelfCheckNetworkHandler::new(
        EventExtractor::new(containers.clone()),
        verified_tx,
    )));
    registry.register(Box::new(NetworkSignalHandler::new(
        EventExtractor::new(containers.clone()),
        conn_tracker.clone(),
        config.clone(),
        stats.clone(),
    )));
    registry.register(Box::new(EndpointSignalHandler::new(
        EventExtractor::new(containers.clone()),
        endpoint_tracker.clone(),
        config.clone(),
        stats.clone(),
    )));
    registry
        .validate()
        .context("signal registry mis-initialized")?;

    tokio::spawn(async move {
        match tokio::time::timeout(Duration::from_secs(5), verified_rx).await {
            Ok(Ok(())) => info!("driver self-check passed"),
            _ => warn!("driver self-check timed out; events may not be flowing"),
        }
    });

    let mut source = UnixSocketSource::bind(&cli.driver_socket, stats.clone())
        .with_context(|| format!("binding driver socket {}", cli.driver_socket.display()))?;
    info!("listening for driver events on {}", cli.driver_socket.display());

    let host_id = host_id();
    let scraper = Arc::new(ProcNetScraper::new(containers.clone()));
    let reporter = Reporter::new(
        conn_tracker,
        endpoint_tracker,
        Some(scraper),
        client,
        config.clone(),
        stats.clone(),
        host_id.clone(),
    );
    let reporter_task = {
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move { reporter.run(shutdown).await })
    };

    info!("spyglass-agent running as {}. Press Ctrl+C to exit.", host_id);

    // Ingestion loop: drain the driver socket, dispatch synchronously.
    loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                info!("shutdown signal received");
                break;
            }
            _ = tokio::time::sleep(POLL_INTERVAL) => {
                match source.poll(MAX_BATCH_SIZE) {
                    Ok(events) => {
                        for event in &events {
                            registry.dispatch(event);
                        }
                    }
                    Err(err) => {
                        // Driver handle lost: fatal, no in-process recovery.
                        error!("driver event source failed: {}", err);
                        break;
                    }
                }
            }
        }
    }

    registry.stop_all();
    let _ = shutdown_tx.send(true);

    // The reporter flushes one final diff on its way out.
    if let Err(err) = reporter_task.await {
        warn!("reporter task aborted: {}", err);
    }
    control_task.abort();

    info!("spyglass-agent stopped. {}", stats.snapshot());
    Ok(())
}

fn host_id() -> String {
    std::env::var("NODE_NAME")
        .or_else(|_| hostname::get().map(|h| h.to_string_lossy().to_string()))
        .unwrap_or_else(|_| "unknown".to_string())
}
