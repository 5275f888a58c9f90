//! line-ack: a line acknowledgement server and its interactive client.
//!
//! The server accepts any number of TCP connections and runs one independent
//! session per connection. Each session answers every received line with a
//! fixed acknowledgement, and closes when the peer sends `EXIT`.
//!
//! - [`config`] CLI and TOML configuration for both binaries
//! - [`transport`] address resolution and socket setup
//! - [`protocol`] the line parser and the per-connection session handler
//! - [`server`] the accept loop that dispatches sessions
//! - [`client`] the sequential prompt/send/reply loop

pub mod client;
pub mod config;
pub mod protocol;
pub mod server;
pub mod transport;
