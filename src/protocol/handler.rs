//! Session handler: drives one connection to completion.
//!
//! ```text
//! AwaitLine ──line──▶ EchoReply ──ack sent──▶ AwaitLine
//!     │
//!     ├──EXIT──▶ Terminating ──▶ Closed
//!     └──EOF / error──────────▶ Closed
//! ```
//!
//! Each session owns its stream and its line buffer. Nothing here is shared
//! with other sessions, so a failure ends only the session it happened in.

use bytes::{Buf, BytesMut};
use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, trace};

use super::parser::{self, Command, ParseResult};
use super::DEFAULT_MAX_LINE_LENGTH;
use crate::config::SessionConfig;

/// Where a session is in its lifecycle. Transitions only move forward,
/// except the `AwaitLine`/`EchoReply` exchange cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Waiting for one complete line from the peer.
    AwaitLine,
    /// A non-sentinel line arrived; the acknowledgement is owed.
    EchoReply,
    /// The sentinel arrived; closing without a reply.
    Terminating,
    /// Connection released.
    Closed,
}

/// How a session that ended without error finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// The peer sent the exit sentinel.
    Exited,
    /// The peer closed its side of the connection.
    PeerClosed,
}

/// Summary of a completed session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionOutcome {
    pub end: SessionEnd,
    /// Number of lines acknowledged.
    pub lines: u64,
}

/// Errors that end a single session.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("connection I/O failed: {0}")]
    Io(#[from] io::Error),
    #[error("line exceeds {limit} bytes")]
    LineTooLong { limit: usize },
    #[error("no data received within {0:?}")]
    ReadTimeout(Duration),
}

/// Handle one accepted connection until the peer exits, disconnects, or fails.
pub async fn handle_connection<S>(
    stream: S,
    config: SessionConfig,
) -> Result<SessionOutcome, SessionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    Session::new(stream, config).run().await
}

/// Per-connection session state.
struct Session<S> {
    stream: S,
    /// Line buffer, exclusive to this session.
    buffer: BytesMut,
    state: SessionState,
    end: SessionEnd,
    lines: u64,
    config: SessionConfig,
}

impl<S> Session<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn new(stream: S, config: SessionConfig) -> Self {
        Self {
            stream,
            // Grows on demand up to the configured limit
            buffer: BytesMut::with_capacity(DEFAULT_MAX_LINE_LENGTH + 2),
            state: SessionState::AwaitLine,
            end: SessionEnd::PeerClosed,
            lines: 0,
            config,
        }
    }

    #[cfg(test)]
    fn state(&self) -> SessionState {
        self.state
    }

    async fn run(&mut self) -> Result<SessionOutcome, SessionError> {
        let result = self.drive().await;
        self.transition(SessionState::Closed);
        result.map(|()| SessionOutcome {
            end: self.end,
            lines: self.lines,
        })
    }

    async fn drive(&mut self) -> Result<(), SessionError> {
        while self.state != SessionState::Closed {
            match self.state {
                SessionState::AwaitLine => match self.next_line().await? {
                    Some(Command::Exit) => {
                        debug!("Exit sentinel received");
                        self.end = SessionEnd::Exited;
                        self.transition(SessionState::Terminating);
                    }
                    Some(Command::Message(line)) => {
                        info!(message = %String::from_utf8_lossy(&line), "Here is the message");
                        self.transition(SessionState::EchoReply);
                    }
                    None => {
                        debug!("Connection closed by peer");
                        self.transition(SessionState::Closed);
                    }
                },

                SessionState::EchoReply => {
                    self.stream.write_all(parser::ack()).await?;
                    self.stream.flush().await?;
                    self.lines += 1;
                    self.transition(SessionState::AwaitLine);
                }

                SessionState::Terminating => {
                    if let Err(e) = self.stream.shutdown().await {
                        debug!(error = %e, "Shutdown after exit failed");
                    }
                    self.transition(SessionState::Closed);
                }

                SessionState::Closed => {}
            }
        }

        Ok(())
    }

    /// Read until one complete line is buffered, or end of stream.
    async fn next_line(&mut self) -> Result<Option<Command>, SessionError> {
        let limit = self.config.max_line_length;

        loop {
            match parser::parse(&self.buffer, limit) {
                ParseResult::Complete(command, consumed) => {
                    self.buffer.advance(consumed);
                    return Ok(Some(command));
                }
                ParseResult::TooLong => return Err(SessionError::LineTooLong { limit }),
                ParseResult::Incomplete => {}
            }

            if self.read_more().await? == 0 {
                // A final line without terminator still counts
                return match parser::parse_final(&self.buffer, limit) {
                    Some(ParseResult::Complete(command, consumed)) => {
                        self.buffer.advance(consumed);
                        Ok(Some(command))
                    }
                    Some(ParseResult::TooLong) => Err(SessionError::LineTooLong { limit }),
                    Some(ParseResult::Incomplete) | None => Ok(None),
                };
            }
        }
    }

    async fn read_more(&mut self) -> Result<usize, SessionError> {
        let read = self.stream.read_buf(&mut self.buffer);

        match self.config.read_timeout {
            Some(limit) => match tokio::time::timeout(limit, read).await {
                Ok(result) => Ok(result?),
                Err(_) => Err(SessionError::ReadTimeout(limit)),
            },
            None => Ok(read.await?),
        }
    }

    fn transition(&mut self, next: SessionState) {
        if self.state != next {
            trace!(from = ?self.state, to = ?next, "Session state");
            self.state = next;
        }
    }
}
