mod server;

use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use tracing::{info, warn};

use sitewatch_core::{logging, Config};
use sitewatch_relay::RelayHub;

use server::SitewatchServer;

#[derive(Parser, Debug)]
#[command(name = "sitewatch")]
#[command(about = "SiteWatch live camera relay", long_about = None)]
struct Args {
    /// Config file (YAML, TOML or JSON); missing files fall back to defaults
    #[arg(long, env = "SITEWATCH_CONFIG_PATH", default_value = "config.yaml")]
    config: String,

    /// Listen host, overriding server.host
    #[arg(long)]
    host: Option<String>,

    /// Listen port, overriding server.port
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // 1. Load configuration
    let mut config = Config::load(Some(args.config.as_str()))?;
    if let Some(host) = args.host {
        config.server.host = host;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }

    // 2. Validate configuration (fail fast on misconfigurations)
    config.ensure_valid()?;

    // 3. Initialize logging
    logging::init_logging(&config.logging)?;
    info!("SiteWatch relay starting...");
    info!("Listen address: {}", config.listen_address());
    if config.uses_default_token() {
        warn!("relay.token is the stock default secret; set SITEWATCH_RELAY__TOKEN for any shared deployment");
    }

    // 4. Build relay state and run
    let config = Arc::new(config);
    let hub = RelayHub::from_config(&config.relay);
    info!(
        liveness_timeout_secs = hub.settings().liveness_timeout.as_secs(),
        viewer_queue_capacity = hub.settings().viewer_queue_capacity,
        "Relay hub initialized"
    );

    SitewatchServer::new(config, hub).start().await
}
