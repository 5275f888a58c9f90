//! Line acknowledgement server.
//!
//! Usage: `server <port> [options]`. Runs until interrupted with Ctrl-C.

use anyhow::Context;
use std::io::IsTerminal;
use line_ack::config::ServerConfig;
use line_ack::server::Server;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration
    let config = ServerConfig::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    // Plain text when piped or when NO_COLOR is set
    let ansi = std::io::stdout().is_terminal() && std::env::var_os("NO_COLOR").is_none();

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_ansi(ansi)
        .init();

    info!(
        listen = %config.listen_addr(),
        backlog = config.backlog,
        max_connections = ?config.max_connections,
        max_line_length = config.session.max_line_length,
        read_timeout = ?config.session.read_timeout,
        "Starting line-ack server"
    );

    let server = Server::bind(&config)
        .await
        .with_context(|| format!("ERROR on binding {}", config.listen_addr()))?;

    server
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "Failed to install Ctrl-C handler");
                std::future::pending::<()>().await;
            }
            info!("Shutdown requested");
        })
        .await?;

    Ok(())
}
