//! Socket setup: address resolution, listening and connecting.
//!
//! Failures here are setup errors. They are reported to the operator and end
//! the process; nothing in this module retries.

use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::SocketAddr;
use tokio::net::{lookup_host, TcpListener, TcpStream};
use tracing::debug;

/// Socket setup errors
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("no such host: {target} ({source})")]
    Resolve {
        target: String,
        #[source]
        source: io::Error,
    },
    #[error("no such host: {target}")]
    NoAddress { target: String },
    #[error("cannot bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("cannot connect to {target}: {source}")]
    Connect {
        target: String,
        #[source]
        source: io::Error,
    },
}

/// Resolve `target` (`host:port`) to its socket addresses.
async fn resolve(target: &str) -> Result<Vec<SocketAddr>, TransportError> {
    let addrs: Vec<SocketAddr> = lookup_host(target)
        .await
        .map_err(|source| TransportError::Resolve {
            target: target.to_string(),
            source,
        })?
        .collect();

    if addrs.is_empty() {
        return Err(TransportError::NoAddress {
            target: target.to_string(),
        });
    }

    Ok(addrs)
}

/// Bind a listening socket on the first address `target` resolves to.
pub async fn bind_listener(target: &str, backlog: u32) -> Result<TcpListener, TransportError> {
    let addr = resolve(target).await?[0];
    let listener =
        create_listener(addr, backlog).map_err(|source| TransportError::Bind { addr, source })?;

    debug!(addr = %addr, backlog, "Listener bound");
    Ok(listener)
}

/// Create a TCP listener with SO_REUSEADDR so restarts can rebind immediately.
fn create_listener(addr: SocketAddr, backlog: u32) -> io::Result<TcpListener> {
    let socket = Socket::new(
        match addr {
            SocketAddr::V4(_) => Domain::IPV4,
            SocketAddr::V6(_) => Domain::IPV6,
        },
        Type::STREAM,
        Some(Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog.min(i32::MAX as u32) as i32)?;

    TcpListener::from_std(socket.into())
}

/// Connect to `host:port`, trying each resolved address in turn.
pub async fn connect(host: &str, port: u16) -> Result<TcpStream, TransportError> {
    let target = if host.contains(':') && !host.starts_with('[') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    };

    let mut last_error = None;
    for addr in resolve(&target).await? {
        match TcpStream::connect(addr).await {
            Ok(stream) => {
                if let Err(e) = stream.set_nodelay(true) {
                    debug!(addr = %addr, error = %e, "Failed to set TCP_NODELAY");
                }
                debug!(addr = %addr, "Connected");
                return Ok(stream);
            }
            Err(e) => {
                debug!(addr = %addr, error = %e, "Connect attempt failed");
                last_error = Some(e);
            }
        }
    }

    Err(TransportError::Connect {
        target,
        source: last_error
            .unwrap_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no addresses")),
    })
}
