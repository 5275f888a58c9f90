//! Line protocol parser.

use bytes::{Bytes, BytesMut};

use super::{ACK, EXIT_SENTINEL};

/// Parsed line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Ordinary content, terminator removed.
    Message(Bytes),
    /// The exit sentinel.
    Exit,
}

/// Parse result.
#[derive(Debug)]
pub enum ParseResult {
    /// Successfully parsed line with bytes consumed (terminator included).
    Complete(Command, usize),
    /// Need more data.
    Incomplete,
    /// The pending line is longer than the allowed maximum.
    TooLong,
}

/// Parse one line from the front of the input buffer.
///
/// The line content excludes the `\n` terminator and one `\r` in front of it.
/// A line whose content exceeds `max_line_length` yields `TooLong` as soon as
/// that is known, whether or not its terminator has arrived.
pub fn parse(input: &[u8], max_line_length: usize) -> ParseResult {
    // Content plus "\r\n" is the furthest a valid terminator can be.
    let window = &input[..input.len().min(max_line_length.saturating_add(2))];

    let line_end = match find_lf(window) {
        Some(pos) => pos,
        None if exceeds_limit(input, max_line_length) => return ParseResult::TooLong,
        None => return ParseResult::Incomplete,
    };

    let line = strip_cr(&input[..line_end]);
    if line.len() > max_line_length {
        return ParseResult::TooLong;
    }

    ParseResult::Complete(classify(line), line_end + 1)
}

/// Parse an unterminated trailing line left in the buffer at end of stream.
///
/// Returns `None` for an empty remainder.
pub fn parse_final(input: &[u8], max_line_length: usize) -> Option<ParseResult> {
    if input.is_empty() {
        return None;
    }

    let line = strip_cr(input);
    if line.len() > max_line_length {
        return Some(ParseResult::TooLong);
    }

    Some(ParseResult::Complete(classify(line), input.len()))
}

/// The acknowledgement line sent for every non-sentinel message.
pub fn ack() -> &'static [u8] {
    ACK
}

/// Frame `content` as a single line on the wire.
pub fn encode_line(content: &[u8]) -> BytesMut {
    let mut line = BytesMut::with_capacity(content.len() + 1);
    line.extend_from_slice(content);
    line.extend_from_slice(b"\n");
    line
}

/// Check whether `line` is exactly the exit sentinel.
pub fn is_exit(line: &[u8]) -> bool {
    line == EXIT_SENTINEL
}

fn classify(line: &[u8]) -> Command {
    if is_exit(line) {
        Command::Exit
    } else {
        Command::Message(Bytes::copy_from_slice(line))
    }
}

/// An unterminated line is too long once its content alone passes the limit.
/// A trailing `\r` may still turn out to be half of the terminator.
fn exceeds_limit(input: &[u8], max_line_length: usize) -> bool {
    strip_cr(input).len() > max_line_length
}

fn strip_cr(line: &[u8]) -> &[u8] {
    line.strip_suffix(b"\r").unwrap_or(line)
}

/// Find \n in buffer, returning its position.
fn find_lf(buffer: &[u8]) -> Option<usize> {
    buffer.iter().position(|&b| b == b'\n')
}
