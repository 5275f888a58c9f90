//! Interactive line-ack client.
//!
//! Usage: `client <hostname> <port>`. Each line typed is sent to the server
//! and its reply printed. `EXIT` (or end of input) ends the session.

use anyhow::Context;
use clap::Parser;
use std::io::IsTerminal;
use line_ack::client::Client;
use line_ack::config::ClientArgs;
use tokio::io::BufReader;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let args = ClientArgs::parse();

    // Logs go to stderr to keep the exchange on stdout readable
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    let ansi = std::io::stderr().is_terminal() && std::env::var_os("NO_COLOR").is_none();

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_ansi(ansi)
        .with_writer(std::io::stderr)
        .init();

    let mut client = Client::connect(&args)
        .await
        .context("ERROR connecting")?;
    info!(host = %args.hostname, port = args.port, "Connected");

    let mut stdin = BufReader::new(tokio::io::stdin());
    let mut stdout = tokio::io::stdout();

    let replies = client.run_interactive(&mut stdin, &mut stdout).await?;
    info!(replies, "Session finished");

    Ok(())
}
