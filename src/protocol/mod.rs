//! Line acknowledgement protocol.
//!
//! A minimal request/response exchange over a byte stream:
//! - Client sends: `<text>\n`
//! - Server responds: `I got your message\n`
//! - Client sends `EXIT\n` to end the session; no reply is sent.
//!
//! ## Protocol Format
//!
//! ```text
//! Request:  hello\n
//! Response: I got your message\n
//!
//! Request:  EXIT\n
//! (connection closed)
//! ```
//!
//! `\r\n` terminators are accepted. The sentinel must be the entire line:
//! `EXITFOO`, `exit` and `EXIT ` are ordinary content and get acknowledged.
//! Lines longer than the configured maximum end the session with an error
//! rather than being truncated.

pub mod handler;
pub mod parser;

pub use handler::{handle_connection, SessionEnd, SessionError, SessionOutcome, SessionState};
pub use parser::{parse, parse_final, Command, ParseResult};

/// Largest line length a session can be configured with.
pub const MAX_LINE_LENGTH_LIMIT: usize = 65536;

/// Line content that ends a session.
pub const EXIT_SENTINEL: &[u8] = b"EXIT";

/// Reply sent after every non-sentinel line.
pub const ACK: &[u8] = b"I got your message\n";

/// Default maximum line length in bytes, excluding the terminator.
pub const DEFAULT_MAX_LINE_LENGTH: usize = 255;
