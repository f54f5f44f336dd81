//! Edge Pinger - ICMP reachability exporter for Prometheus.

use clap::Parser;
use edge_pinger::config::PingerConfig;
use edge_pinger::metrics::MetricSink;
use edge_pinger::probe::IcmpProber;
use edge_pinger::scheduler::Scheduler;
use edge_pinger::web::Server;

use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Edge Pinger - ping a list of hosts and export the results to Prometheus
#[derive(Parser, Debug)]
#[command(name = "edge-pinger", version, about, long_about = None)]
struct Cli {
    /// Path to edge pinger configuration file
    #[arg(short, long, env = "EDGE_PINGER_CONFIG")]
    config: String,

    /// Port to listen for Prometheus requests
    #[arg(short, long, default_value_t = 8080, env = "EDGE_PINGER_PORT")]
    port: u16,

    /// Log every reply and cycle summary
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let cli = Cli::parse();

    // Initialize logging
    let directive = if cli.debug {
        "edge_pinger=debug"
    } else {
        "edge_pinger=info"
    };
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env().add_directive(directive.parse()?))
        .init();

    // Load configuration
    tracing::info!("Loading configuration from {}", cli.config);
    let config = PingerConfig::load(&cli.config)?;
    config.check_addresses().await?;

    let sink = MetricSink::new(config.metrics.layout, &config.metrics.namespace)?;
    let scheduler = Scheduler::new(Arc::new(IcmpProber::new()), sink.clone(), cli.debug);
    scheduler.start(config.targets()).await?;

    let server = Server::new(cli.port, sink);
    server.start(shutdown_signal()).await?;

    scheduler.stop_all().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutting down");
}
