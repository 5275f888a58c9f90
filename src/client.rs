//! Interactive client: one line out, one reply back.
//!
//! The client is strictly sequential. It never sends a second line before
//! the reply to the first has been read, and it sends `EXIT` without waiting
//! for any reply. Every connection failure is fatal to the client, since it
//! has exactly one connection.

use bytes::{Buf, Bytes, BytesMut};
use std::io;
use tokio::io::{
    AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt,
};
use tokio::net::TcpStream;
use tracing::{debug, trace};

use crate::config::ClientArgs;
use crate::protocol::parser::{self, Command, ParseResult};
use crate::protocol::{DEFAULT_MAX_LINE_LENGTH, EXIT_SENTINEL};
use crate::transport::{self, TransportError};

/// Shown before each line of operator input.
pub const PROMPT: &[u8] = b"Please enter the message: ";

/// Client errors
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("ERROR writing to socket: {0}")]
    Send(#[source] io::Error),
    #[error("ERROR reading from socket: {0}")]
    Receive(#[source] io::Error),
    #[error("server closed the connection")]
    ConnectionClosed,
    #[error("reply exceeds {limit} bytes")]
    ReplyTooLong { limit: usize },
    #[error("line exceeds {limit} bytes")]
    LineTooLong { limit: usize },
    #[error("line contains an embedded newline")]
    EmbeddedNewline,
    #[error("failed to read input: {0}")]
    Input(#[source] io::Error),
    #[error("failed to write output: {0}")]
    Output(#[source] io::Error),
}

/// Result of sending one line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Exchange {
    /// The server's reply, terminator removed.
    Reply(Bytes),
    /// The exit sentinel was sent; the connection is closed.
    Exited,
}

/// A client session over one connection.
pub struct Client<C> {
    conn: C,
    /// Staging buffer for replies
    buffer: BytesMut,
    max_line_length: usize,
    closed: bool,
}

impl Client<TcpStream> {
    /// Resolve and connect to the server named in `args`.
    pub async fn connect(args: &ClientArgs) -> Result<Self, ClientError> {
        let stream = transport::connect(&args.hostname, args.port).await?;
        Ok(Self::new(stream, args.max_line_length))
    }
}

impl<C> Client<C>
where
    C: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(conn: C, max_line_length: usize) -> Self {
        Self {
            conn,
            buffer: BytesMut::with_capacity(DEFAULT_MAX_LINE_LENGTH + 2),
            max_line_length,
            closed: false,
        }
    }

    /// Send one line and wait for its reply.
    ///
    /// `line` may carry its `\n` or `\r\n` terminator but no other newline,
    /// since each line sent must get exactly one reply. Sending the exit
    /// sentinel closes the connection and returns `Exchange::Exited` without
    /// reading anything.
    pub async fn exchange(&mut self, line: &[u8]) -> Result<Exchange, ClientError> {
        if self.closed {
            return Err(ClientError::ConnectionClosed);
        }

        let line = strip_terminator(line);
        if line.len() > self.max_line_length {
            return Err(ClientError::LineTooLong {
                limit: self.max_line_length,
            });
        }
        if line.contains(&b'\n') {
            return Err(ClientError::EmbeddedNewline);
        }

        if parser::is_exit(line) {
            self.send_exit().await;
            return Ok(Exchange::Exited);
        }

        trace!(len = line.len(), "Sending line");
        self.conn
            .write_all(&parser::encode_line(line))
            .await
            .map_err(ClientError::Send)?;
        self.conn.flush().await.map_err(ClientError::Send)?;

        self.read_reply().await.map(Exchange::Reply)
    }

    /// Prompt on `output`, read lines from `input`, and print each reply,
    /// until the operator types `EXIT` or input ends.
    ///
    /// Returns the number of replies received.
    pub async fn run_interactive<I, O>(
        &mut self,
        input: &mut I,
        output: &mut O,
    ) -> Result<u64, ClientError>
    where
        I: AsyncBufRead + Unpin,
        O: AsyncWrite + Unpin,
    {
        let mut line = Vec::with_capacity(DEFAULT_MAX_LINE_LENGTH + 1);
        let mut replies = 0;

        loop {
            write_output(output, PROMPT).await?;

            line.clear();
            let n = input
                .read_until(b'\n', &mut line)
                .await
                .map_err(ClientError::Input)?;

            if n == 0 {
                debug!("End of input, leaving session");
                write_output(output, b"\n").await?;
                self.send_exit().await;
                return Ok(replies);
            }

            match self.exchange(&line).await {
                Ok(Exchange::Reply(reply)) => {
                    replies += 1;
                    let mut shown = reply.to_vec();
                    shown.push(b'\n');
                    write_output(output, &shown).await?;
                }
                Ok(Exchange::Exited) => return Ok(replies),
                Err(ClientError::LineTooLong { limit }) => {
                    let notice = format!("Message longer than {limit} bytes, not sent\n");
                    write_output(output, notice.as_bytes()).await?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Send the sentinel and close. The peer answers by closing too, so a
    /// failure here changes nothing for the operator.
    async fn send_exit(&mut self) {
        let sentinel = parser::encode_line(EXIT_SENTINEL);
        if let Err(e) = self.conn.write_all(&sentinel).await {
            debug!(error = %e, "Failed to send exit sentinel");
        }
        if let Err(e) = self.conn.shutdown().await {
            debug!(error = %e, "Failed to shut down connection");
        }
        self.closed = true;
    }

    async fn read_reply(&mut self) -> Result<Bytes, ClientError> {
        let limit = self.max_line_length.max(DEFAULT_MAX_LINE_LENGTH);

        loop {
            match parser::parse(&self.buffer, limit) {
                ParseResult::Complete(command, consumed) => {
                    self.buffer.advance(consumed);
                    return Ok(reply_bytes(command));
                }
                ParseResult::TooLong => return Err(ClientError::ReplyTooLong { limit }),
                ParseResult::Incomplete => {}
            }

            let n = self
                .conn
                .read_buf(&mut self.buffer)
                .await
                .map_err(ClientError::Receive)?;

            if n == 0 {
                self.closed = true;
                return match parser::parse_final(&self.buffer, limit) {
                    Some(ParseResult::Complete(command, consumed)) => {
                        self.buffer.advance(consumed);
                        Ok(reply_bytes(command))
                    }
                    Some(ParseResult::TooLong) => Err(ClientError::ReplyTooLong { limit }),
                    Some(ParseResult::Incomplete) | None => Err(ClientError::ConnectionClosed),
                };
            }
        }
    }
}

/// Replies are shown verbatim, even one that happens to read `EXIT`.
fn reply_bytes(command: Command) -> Bytes {
    match command {
        Command::Message(reply) => reply,
        Command::Exit => Bytes::from_static(EXIT_SENTINEL),
    }
}

fn strip_terminator(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

async fn write_output<O>(output: &mut O, bytes: &[u8]) -> Result<(), ClientError>
where
    O: AsyncWrite + Unpin,
{
    output.write_all(bytes).await.map_err(ClientError::Output)?;
    output.flush().await.map_err(ClientError::Output)
}
