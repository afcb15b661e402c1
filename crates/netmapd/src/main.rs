//! netmapd - network map synchronization daemon
//!
//! Keeps the node's view of network membership current and exits when the
//! network switches parameters (status 0 if the switch was accepted, 1 if not).

use clap::Parser;
use netmapd::config::Config;
use netmapd::server::Server;
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> ExitCode {
    // Parse configuration
    let config = Config::parse();

    // Initialize logging
    let level = if config.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("netmapd={level},netmap_net={level}"))
    });
    let json = config.log_format == "json";
    tracing_subscriber::registry()
        .with(json.then(|| fmt::layer().json()))
        .with((!json).then(|| fmt::layer()))
        .with(filter)
        .init();

    if let Err(e) = config.validate() {
        error!("Invalid configuration: {}", e);
        return ExitCode::FAILURE;
    }

    info!(
        "netmapd v{} - network map synchronization daemon",
        env!("CARGO_PKG_VERSION")
    );

    let server = match Server::new(config).await {
        Ok(server) => server,
        Err(e) => {
            error!("Failed to initialize server: {}", e);
            return ExitCode::FAILURE;
        }
    };

    match server.run().await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            error!("Server error: {}", e);
            ExitCode::FAILURE
        }
    }
}
