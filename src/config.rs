//! Configuration for the server and client binaries.
//!
//! The server accepts command-line arguments and an optional TOML file.
//! CLI arguments take precedence over config file values, which take
//! precedence over built-in defaults. The client is configured from the
//! command line only.

use clap::builder::RangedU64ValueParser;
use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

use crate::protocol::{DEFAULT_MAX_LINE_LENGTH, MAX_LINE_LENGTH_LIMIT};

/// Command-line arguments for the server
#[derive(Parser, Debug)]
#[command(name = "server")]
#[command(version)]
#[command(about = "Acknowledge every line received, until the peer sends EXIT", long_about = None)]
pub struct ServerArgs {
    /// Port to listen on (0 picks an ephemeral port)
    pub port: u16,

    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to
    #[arg(long)]
    pub host: Option<String>,

    /// Listen backlog passed to listen(2)
    #[arg(long)]
    pub backlog: Option<u32>,

    /// Maximum number of concurrent sessions (unbounded if unset)
    #[arg(long)]
    pub max_connections: Option<usize>,

    /// Maximum line length in bytes, excluding the terminator
    #[arg(long, value_parser = line_length_parser())]
    pub max_line_length: Option<usize>,

    /// Close a session after this many seconds without data
    #[arg(long)]
    pub read_timeout: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,
}

/// Command-line arguments for the interactive client
#[derive(Parser, Debug, Clone)]
#[command(name = "client")]
#[command(version)]
#[command(about = "Send lines to the server and print each reply; type EXIT to quit", long_about = None)]
pub struct ClientArgs {
    /// Server host name or address
    pub hostname: String,

    /// Server port
    pub port: u16,

    /// Maximum line length in bytes, excluding the terminator
    #[arg(
        long,
        default_value_t = DEFAULT_MAX_LINE_LENGTH,
        value_parser = line_length_parser()
    )]
    pub max_line_length: usize,

    /// Log level (trace, debug, info, warn, error); logs go to stderr
    #[arg(long, default_value = "warn")]
    pub log_level: String,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub session: SessionSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

/// Listener-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerSection {
    /// Address to bind to
    #[serde(default = "default_host")]
    pub host: String,
    /// Listen backlog
    #[serde(default = "default_backlog")]
    pub backlog: u32,
    /// Maximum concurrent sessions
    pub max_connections: Option<usize>,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            backlog: default_backlog(),
            max_connections: None,
        }
    }
}

/// Per-session configuration
#[derive(Debug, Deserialize)]
pub struct SessionSection {
    #[serde(default = "default_max_line_length")]
    pub max_line_length: usize,
    /// Idle read timeout in seconds
    pub read_timeout_secs: Option<u64>,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            max_line_length: default_max_line_length(),
            read_timeout_secs: None,
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingSection {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn line_length_parser() -> RangedU64ValueParser<usize> {
    RangedU64ValueParser::new().range(1..=MAX_LINE_LENGTH_LIMIT as u64)
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_backlog() -> u32 {
    128
}

fn default_max_line_length() -> usize {
    DEFAULT_MAX_LINE_LENGTH
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Limits applied to every session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionConfig {
    pub max_line_length: usize,
    pub read_timeout: Option<Duration>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_line_length: DEFAULT_MAX_LINE_LENGTH,
            read_timeout: None,
        }
    }
}

/// Final resolved server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub backlog: u32,
    pub max_connections: Option<usize>,
    pub session: SessionConfig,
    pub log_level: String,
}

impl ServerConfig {
    /// Load configuration from the process arguments and optional TOML file.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_args(ServerArgs::parse())
    }

    /// Merge parsed CLI args with the TOML file they name, if any.
    pub fn from_args(cli: ServerArgs) -> Result<Self, ConfigError> {
        let toml_config = match cli.config {
            Some(ref config_path) => {
                let contents = std::fs::read_to_string(config_path)
                    .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
                toml::from_str(&contents)
                    .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
            }
            None => TomlConfig::default(),
        };

        Self::merge(cli, toml_config).validate()
    }

    /// Reject limits the command line would not have accepted.
    fn validate(self) -> Result<Self, ConfigError> {
        let max_line_length = self.session.max_line_length;
        if !(1..=MAX_LINE_LENGTH_LIMIT).contains(&max_line_length) {
            return Err(ConfigError::LineLength(max_line_length));
        }
        Ok(self)
    }

    fn merge(cli: ServerArgs, toml_config: TomlConfig) -> Self {
        let read_timeout = cli
            .read_timeout
            .or(toml_config.session.read_timeout_secs)
            .filter(|&secs| secs > 0)
            .map(Duration::from_secs);

        ServerConfig {
            host: cli.host.unwrap_or(toml_config.server.host),
            port: cli.port,
            backlog: cli.backlog.unwrap_or(toml_config.server.backlog),
            max_connections: cli.max_connections.or(toml_config.server.max_connections),
            session: SessionConfig {
                max_line_length: cli
                    .max_line_length
                    .unwrap_or(toml_config.session.max_line_length),
                read_timeout,
            },
            log_level: cli.log_level.unwrap_or(toml_config.logging.level),
        }
    }

    /// `host:port` string suitable for address resolution.
    pub fn listen_addr(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            // Bare IPv6 literal
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: 0,
            backlog: default_backlog(),
            max_connections: None,
            session: SessionConfig::default(),
            log_level: default_log_level(),
        }
    }
}

/// Configuration loading errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {}", .0.display(), .1)]
    FileRead(PathBuf, #[source] std::io::Error),
    #[error("Failed to parse config file '{}': {}", .0.display(), .1)]
    TomlParse(PathBuf, #[source] toml::de::Error),
    #[error("max_line_length {0} is outside 1..=65536")]
    LineLength(usize),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(argv: &[&str]) -> ServerArgs {
        ServerArgs::try_parse_from(argv.iter().copied()).unwrap()
    }

    #[test]
    fn test_default_config() {
        let config = TomlConfig::default();
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.server.backlog, 128);
        assert_eq!(config.server.max_connections, None);
        assert_eq!(config.session.max_line_length, 255);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [server]
            host = "127.0.0.1"
            backlog = 16
            max_connections = 64

            [session]
            max_line_length = 1024
            read_timeout_secs = 30

            [logging]
            level = "debug"
        "#;

        let config: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.backlog, 16);
        assert_eq!(config.server.max_connections, Some(64));
        assert_eq!(config.session.max_line_length, 1024);
        assert_eq!(config.session.read_timeout_secs, Some(30));
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_cli_overrides_toml() {
        let toml_config: TomlConfig = toml::from_str(
            r#"
            [server]
            host = "127.0.0.1"
            max_connections = 8

            [session]
            read_timeout_secs = 30
            "#,
        )
        .unwrap();

        let cli = args(&[
            "server",
            "7000",
            "--host",
            "::1",
            "--max-line-length",
            "80",
            "--read-timeout",
            "0",
            "--log-level",
            "warn",
        ]);
        let config = ServerConfig::merge(cli, toml_config);

        assert_eq!(config.port, 7000);
        assert_eq!(config.host, "::1");
        assert_eq!(config.max_connections, Some(8));
        assert_eq!(config.session.max_line_length, 80);
        assert_eq!(config.session.read_timeout, None);
        assert_eq!(config.log_level, "warn");
        assert_eq!(config.listen_addr(), "[::1]:7000");
    }

    #[test]
    fn test_defaults_without_file() {
        let config = ServerConfig::from_args(args(&["server", "5000"])).unwrap();
        assert_eq!(config.listen_addr(), "0.0.0.0:5000");
        assert_eq!(config.backlog, 128);
        assert_eq!(config.session, SessionConfig::default());
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn test_missing_port_is_rejected() {
        assert!(ServerArgs::try_parse_from(["server"]).is_err());
        assert!(ClientArgs::try_parse_from(["client", "localhost"]).is_err());
    }

    #[test]
    fn test_missing_config_file() {
        let cli = args(&["server", "5000", "--config", "/nonexistent/line-ack.toml"]);
        match ServerConfig::from_args(cli) {
            Err(ConfigError::FileRead(path, _)) => {
                assert_eq!(path, PathBuf::from("/nonexistent/line-ack.toml"));
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_line_length_is_bounded() {
        let huge = usize::MAX.to_string();
        for value in [huge.as_str(), "0", "65537"] {
            let argv = ["server", "5000", "--max-line-length", value];
            assert!(ServerArgs::try_parse_from(argv).is_err(), "accepted {value}");

            let argv = ["client", "localhost", "5000", "--max-line-length", value];
            assert!(ClientArgs::try_parse_from(argv).is_err(), "accepted {value}");
        }

        let cli = args(&["server", "5000", "--max-line-length", "65536"]);
        assert_eq!(cli.max_line_length, Some(MAX_LINE_LENGTH_LIMIT));

        // The config file goes through the same bound
        let toml_config: TomlConfig = toml::from_str(
            r#"
            [session]
            max_line_length = 1000000
            "#,
        )
        .unwrap();
        let merged = ServerConfig::merge(args(&["server", "5000"]), toml_config);
        assert!(matches!(merged.validate(), Err(ConfigError::LineLength(1_000_000))));
    }

    #[test]
    fn test_client_args() {
        let args = ClientArgs::try_parse_from(["client", "localhost", "5000"]).unwrap();
        assert_eq!(args.hostname, "localhost");
        assert_eq!(args.port, 5000);
        assert_eq!(args.max_line_length, 255);
        assert_eq!(args.log_level, "warn");
    }
}
