// hub: Connects to parameter-bus devices, mirrors their state, and serves
// the hub's own components over the same protocol.

use clap::Parser;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "hub", about = "Central hub for a parameter-bus device network")]
struct Cli {
    /// Device endpoints (IP or IP:PORT); overrides HUB_DEVICES and the
    /// config file.
    devices: Vec<String>,

    /// Path to the TOML config file.
    #[arg(long, default_value = hub::config::DEFAULT_CONFIG_PATH)]
    config: std::path::PathBuf,

    /// Override the protocol server port.
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let mut cfg = match hub::config::load_config(&cli.config, &cli.devices) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("FATAL: failed to load config: {e}");
            std::process::exit(1);
        }
    };
    if let Some(port) = cli.port {
        cfg.server_port = port;
    }

    // Structured logging to stdout; RUST_LOG wins over the config level.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(cfg.log_level.clone())),
        )
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        devices = cfg.devices.len(),
        "hub starting"
    );
    if cfg.devices.is_empty() {
        info!("no devices configured, running in hub-only mode");
    }

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let hub = hub::app::Hub::new(cfg);
    if let Err(e) = hub.start(shutdown_rx).await {
        eprintln!("FATAL: {e}");
        std::process::exit(1);
    }

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("shutdown signal received"),
        Err(e) => error!(error = %e, "failed to listen for shutdown signal"),
    }

    let _ = shutdown_tx.send(true);
    // Let the loops observe the flag and release their sockets.
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    info!("hub stopped");
}
