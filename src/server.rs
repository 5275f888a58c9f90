//! TCP server: accepts connections and runs one session per connection.
//!
//! The dispatcher never waits on a session. Each accepted connection is
//! handed to its own task, which owns the stream outright. Session failures
//! are logged when the task is reaped and never reach the accept loop.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::config::{ServerConfig, SessionConfig};
use crate::protocol::{self, SessionError, SessionOutcome};
use crate::transport::{self, TransportError};

/// Pause after running out of file descriptors before accepting again
const RESOURCE_BACKOFF: Duration = Duration::from_millis(100);

/// Dispatcher errors
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error(transparent)]
    Setup(#[from] TransportError),
    #[error("accept failed: {0}")]
    Accept(#[source] io::Error),
}

/// Result of a single accept call
#[derive(Debug, thiserror::Error)]
pub enum AcceptError {
    /// The dispatcher was shut down while waiting.
    #[error("listener shut down")]
    Shutdown,
    /// Worth retrying: interrupted calls, aborted handshakes, fd exhaustion.
    #[error("transient accept failure: {0}")]
    Transient(#[source] io::Error),
    /// The listening socket is unusable.
    #[error("accept failed: {0}")]
    Fatal(#[source] io::Error),
}

/// Closes a running dispatcher. Cloneable; any clone can trigger it.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    /// Stop accepting and abort in-flight sessions.
    pub fn shutdown(&self) {
        self.tx.send_replace(true);
    }
}

/// Server instance
pub struct Server {
    listener: TcpListener,
    session: SessionConfig,
    connection_limit: Option<Arc<Semaphore>>,
    shutdown_tx: Arc<watch::Sender<bool>>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Server {
    /// Bind the listening socket described by `config`.
    pub async fn bind(config: &ServerConfig) -> Result<Self, ServerError> {
        let listener = transport::bind_listener(&config.listen_addr(), config.backlog).await?;
        Ok(Self::new(listener, config))
    }

    /// Create a server on an already bound listener.
    pub fn new(listener: TcpListener, config: &ServerConfig) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Server {
            listener,
            session: config.session,
            connection_limit: config
                .max_connections
                .map(|limit| Arc::new(Semaphore::new(limit))),
            shutdown_tx: Arc::new(shutdown_tx),
            shutdown_rx,
        }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            tx: Arc::clone(&self.shutdown_tx),
        }
    }

    /// Wait for the next connection.
    ///
    /// Returns `AcceptError::Shutdown` once the shutdown handle fires, even
    /// if a call is already blocked here.
    pub async fn accept(&mut self) -> Result<(TcpStream, SocketAddr), AcceptError> {
        if *self.shutdown_rx.borrow() {
            return Err(AcceptError::Shutdown);
        }

        tokio::select! {
            biased;
            _ = self.shutdown_rx.wait_for(|&stop| stop) => Err(AcceptError::Shutdown),
            accepted = self.listener.accept() => accepted.map_err(classify_accept_error),
        }
    }

    /// Accept connections until a fatal error or the shutdown handle fires.
    pub async fn run(mut self) -> Result<(), ServerError> {
        let mut sessions = JoinSet::new();
        let mut next_id: u64 = 0;

        info!(address = %self.local_addr().map_err(ServerError::Accept)?, "Server listening");

        let result = loop {
            // Wait for a connection slot
            let permit = match self.acquire_slot(&mut sessions).await {
                Some(permit) => permit,
                None => break Ok(()),
            };

            let accepted = tokio::select! {
                accepted = self.accept() => accepted,
                Some(finished) = sessions.join_next() => {
                    log_session_result(finished);
                    continue;
                }
            };

            match accepted {
                Ok((stream, peer)) => {
                    next_id += 1;
                    spawn_session(&mut sessions, next_id, stream, peer, self.session, permit);
                }
                Err(AcceptError::Shutdown) => break Ok(()),
                Err(AcceptError::Transient(e)) => {
                    warn!(error = %e, "Failed to accept connection");
                    if is_resource_exhaustion(&e) {
                        tokio::time::sleep(RESOURCE_BACKOFF).await;
                    }
                }
                Err(AcceptError::Fatal(e)) => {
                    error!(error = %e, "Listener failed");
                    break Err(ServerError::Accept(e));
                }
            }
        };

        if !sessions.is_empty() {
            info!(active = sessions.len(), "Closing active sessions");
        }
        sessions.shutdown().await;
        info!("Server stopped");

        result
    }

    /// Accept connections until `shutdown` resolves.
    pub async fn run_until<F>(self, shutdown: F) -> Result<(), ServerError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = self.shutdown_handle();
        let trigger = tokio::spawn(async move {
            shutdown.await;
            handle.shutdown();
        });

        let result = self.run().await;
        trigger.abort();
        result
    }

    /// Take a connection permit when a limit is configured, reaping finished
    /// sessions while waiting. `None` means shutdown was requested.
    async fn acquire_slot(
        &mut self,
        sessions: &mut JoinSet<Result<SessionOutcome, SessionError>>,
    ) -> Option<Option<OwnedSemaphorePermit>> {
        let Some(limit) = self.connection_limit.clone() else {
            return Some(None);
        };

        loop {
            tokio::select! {
                permit = Arc::clone(&limit).acquire_owned() => return permit.ok().map(Some),
                _ = self.shutdown_rx.wait_for(|&stop| stop) => return None,
                Some(finished) = sessions.join_next() => log_session_result(finished),
            }
        }
    }
}

fn spawn_session(
    sessions: &mut JoinSet<Result<SessionOutcome, SessionError>>,
    id: u64,
    stream: TcpStream,
    peer: SocketAddr,
    config: SessionConfig,
    permit: Option<OwnedSemaphorePermit>,
) {
    let span = info_span!("session", id, peer = %peer);

    sessions.spawn(
        async move {
            info!("Session opened");
            let result = protocol::handle_connection(stream, config).await;
            drop(permit);
            match &result {
                Ok(outcome) => info!(end = ?outcome.end, lines = outcome.lines, "Session closed"),
                Err(e) => warn!(error = %e, "Session failed"),
            }
            result
        }
        .instrument(span),
    );
}

fn log_session_result(finished: Result<Result<SessionOutcome, SessionError>, JoinError>) {
    // Outcomes are already logged inside the session span
    if let Err(e) = finished {
        if e.is_panic() {
            error!(error = %e, "Session task panicked");
        } else {
            debug!(error = %e, "Session task cancelled");
        }
    }
}

/// Sort accept failures into ones the loop should retry and ones that mean
/// the listener is gone.
fn classify_accept_error(e: io::Error) -> AcceptError {
    use io::ErrorKind::*;

    match e.kind() {
        Interrupted | WouldBlock | ConnectionAborted | ConnectionReset | ConnectionRefused
        | TimedOut => AcceptError::Transient(e),
        _ if is_resource_exhaustion(&e) || e.raw_os_error() == Some(libc::EPROTO) => {
            AcceptError::Transient(e)
        }
        _ => AcceptError::Fatal(e),
    }
}

fn is_resource_exhaustion(e: &io::Error) -> bool {
    matches!(
        e.raw_os_error(),
        Some(libc::EMFILE) | Some(libc::ENFILE) | Some(libc::ENOBUFS) | Some(libc::ENOMEM)
    )
}
