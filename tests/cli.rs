use std::process::Stdio;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdout, Command};
use tokio::time::timeout;

const SERVER_BIN: &str = env!("CARGO_BIN_EXE_server");
const CLIENT_BIN: &str = env!("CARGO_BIN_EXE_client");
const PROCESS_TIMEOUT: Duration = Duration::from_secs(5);

struct ServerProcess {
    child: Child,
    port: u16,
    // Held so the server never blocks on a full stdout pipe
    _logs: tokio::task::JoinHandle<()>,
}

impl ServerProcess {
    async fn spawn() -> Result<Self> {
        let mut child = Command::new(SERVER_BIN)
            .args(["0", "--host", "127.0.0.1", "--log-level", "info"])
            .env_remove("RUST_LOG")
            .env("NO_COLOR", "1")
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .context("failed to spawn server")?;

        let stdout = child.stdout.take().context("server stdout missing")?;
        let mut stdout = BufReader::new(stdout);
        let port = timeout(PROCESS_TIMEOUT, read_listen_port(&mut stdout))
            .await
            .map_err(|_| anyhow!("server did not report its address"))??;

        let logs = tokio::spawn(async move {
            let mut line = String::new();
            while matches!(stdout.read_line(&mut line).await, Ok(n) if n > 0) {
                line.clear();
            }
        });

        Ok(Self {
            child,
            port,
            _logs: logs,
        })
    }
}

/// Scan the server log for the `Server listening` line and pull out its port.
async fn read_listen_port(stdout: &mut BufReader<ChildStdout>) -> Result<u16> {
    let mut line = String::new();
    loop {
        line.clear();
        if stdout.read_line(&mut line).await? == 0 {
            return Err(anyhow!("server exited before listening"));
        }

        if !line.contains("Server listening") {
            continue;
        }
        anyhow::ensure!(!line.contains('\u{1b}'), "log line is colored: {line:?}");

        let addr = line
            .split_whitespace()
            .find_map(|field| field.strip_prefix("address="))
            .context("listening line has no address")?;
        let port = addr
            .rsplit(':')
            .next()
            .context("address has no port")?
            .parse()?;
        return Ok(port);
    }
}

async fn run_client(port: u16, input: &[u8]) -> Result<std::process::Output> {
    let mut child = Command::new(CLIENT_BIN)
        .args(["127.0.0.1", &port.to_string()])
        .env_remove("RUST_LOG")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .context("failed to spawn client")?;

    let mut stdin = child.stdin.take().context("client stdin missing")?;
    stdin.write_all(input).await?;
    drop(stdin);

    timeout(PROCESS_TIMEOUT, child.wait_with_output())
        .await
        .map_err(|_| anyhow!("client did not exit"))?
        .context("failed to wait for client")
}

#[tokio::test]
async fn client_and_server_exchange_lines() -> Result<()> {
    let mut server = ServerProcess::spawn().await?;

    let output = run_client(server.port, b"hello\nEXITFOO\nexit\nEXIT\nnot sent\n").await?;
    assert!(output.status.success(), "client failed: {output:?}");

    let stdout = String::from_utf8(output.stdout)?;
    assert_eq!(stdout.matches("I got your message").count(), 3);
    assert_eq!(stdout.matches("Please enter the message: ").count(), 4);

    // The server keeps serving new clients
    let output = run_client(server.port, b"again\n").await?;
    assert!(output.status.success(), "second client failed: {output:?}");
    let stdout = String::from_utf8(output.stdout)?;
    assert_eq!(stdout.matches("I got your message").count(), 1);

    server.child.kill().await?;
    Ok(())
}

#[tokio::test]
async fn client_reports_connection_failure() -> Result<()> {
    // Bind then drop to find a port with nothing listening
    let port = std::net::TcpListener::bind("127.0.0.1:0")?
        .local_addr()?
        .port();

    let output = run_client(port, b"hello\n").await?;
    assert!(!output.status.success());

    let stderr = String::from_utf8(output.stderr)?;
    assert!(stderr.contains("ERROR connecting"), "stderr: {stderr}");
    Ok(())
}

#[tokio::test]
async fn client_requires_host_and_port() -> Result<()> {
    let output = timeout(
        PROCESS_TIMEOUT,
        Command::new(CLIENT_BIN).arg("localhost").output(),
    )
    .await??;
    assert!(!output.status.success());

    let stderr = String::from_utf8(output.stderr)?;
    assert!(stderr.contains("Usage"), "stderr: {stderr}");
    Ok(())
}

#[tokio::test]
async fn server_requires_port() -> Result<()> {
    let output = timeout(PROCESS_TIMEOUT, Command::new(SERVER_BIN).output()).await??;
    assert!(!output.status.success());

    let stderr = String::from_utf8(output.stderr)?;
    assert!(stderr.contains("<PORT>"), "stderr: {stderr}");
    Ok(())
}

#[tokio::test]
async fn server_reports_bind_failure() -> Result<()> {
    let taken = std::net::TcpListener::bind("127.0.0.1:0")?;
    let port = taken.local_addr()?.port().to_string();

    let output = timeout(
        PROCESS_TIMEOUT,
        Command::new(SERVER_BIN)
            .args([port.as_str(), "--host", "127.0.0.1"])
            .output(),
    )
    .await??;
    assert!(!output.status.success());

    let stderr = String::from_utf8(output.stderr)?;
    assert!(stderr.contains("ERROR on binding"), "stderr: {stderr}");
    Ok(())
}
