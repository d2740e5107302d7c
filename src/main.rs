mod collector;
mod config;
mod error;
mod export;
mod http;
mod metrics;
mod rocketmq;
mod target;

use crate::config::Config;
use crate::export::prometheus::PrometheusExporter;
use crate::http::server::HttpServer;
use crate::metrics::registry::MetricsRegistry;
use crate::target::TargetManager;
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Targets older than this many poll intervals are hidden from `/metrics`
const STALENESS_INTERVALS: u32 = 3;
const MIN_STALENESS_THRESHOLD: Duration = Duration::from_secs(90);

#[derive(Parser, Debug)]
#[command(name = "rocketmq-exporter")]
#[command(about = "RocketMQ consumer lag, latency and throughput exporter")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(&args.log_level);

    info!("Starting rocketmq-exporter");

    let config = Config::load(Some(&args.config))?;
    info!(
        targets = config.targets.len(),
        poll_interval = ?config.exporter.poll_interval,
        "Configuration loaded"
    );

    let staleness_threshold =
        (config.exporter.poll_interval * STALENESS_INTERVALS).max(MIN_STALENESS_THRESHOLD);
    let registry = Arc::new(MetricsRegistry::with_staleness_threshold(
        staleness_threshold,
    ));

    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let mut handles = Vec::new();
    for target_config in config.targets.clone() {
        let registry = Arc::clone(&registry);
        let shutdown_rx = shutdown_tx.subscribe();
        let exporter_config = config.exporter.clone();

        let handle = tokio::spawn(async move {
            let manager = match TargetManager::new(&target_config, registry, &exporter_config) {
                Ok(m) => m,
                Err(e) => {
                    error!(
                        target = target_config.name,
                        error = %e,
                        "Failed to create target manager"
                    );
                    return;
                }
            };

            manager.run(shutdown_rx).await;
        });

        handles.push(handle);
    }

    let prometheus_exporter = PrometheusExporter::new(Arc::clone(&registry));
    let http_server = HttpServer::new(
        &config.exporter.http_host,
        config.exporter.http_port,
        prometheus_exporter,
        Arc::clone(&registry),
    )?;

    let shutdown_rx = shutdown_tx.subscribe();
    let server_handle = tokio::spawn(async move {
        if let Err(e) = http_server.run(shutdown_rx).await {
            error!(error = %e, "HTTP server error");
        }
    });

    shutdown_signal().await;
    info!("Shutdown signal received, stopping...");

    let _ = shutdown_tx.send(());

    let _ = server_handle.await;

    let shutdown_timeout = tokio::time::timeout(
        Duration::from_secs(10),
        futures::future::join_all(handles),
    );

    match shutdown_timeout.await {
        Ok(_) => info!("All target managers stopped"),
        Err(_) => error!("Timeout waiting for target managers to stop"),
    }

    info!("rocketmq-exporter stopped");
    Ok(())
}

fn init_logging(level: &str) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}
