//! Configuration module for the frame-gate server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values. The resolved
//! configuration is immutable for the lifetime of the process.

use crate::error::ConfigError;
use crate::protocol::MIN_FRAME_LEN;
use clap::Parser;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Port the server listens on and clients dial by default.
pub const DEFAULT_PORT: u16 = 11000;

/// Command-line arguments for the server
#[derive(Parser, Debug, Default)]
#[command(name = "frame-gate")]
#[command(author = "frame-gate authors")]
#[command(version = "0.1.0")]
#[command(about = "A pooled TCP server for length-delimited binary frames", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 0.0.0.0:11000)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Number of worker threads (defaults to number of CPU cores)
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Maximum number of concurrently accepted connections
    #[arg(short = 'c', long)]
    pub max_connections: Option<usize>,

    /// Read segment size per connection in bytes
    #[arg(long)]
    pub read_size: Option<usize>,

    /// Write segment size per connection in bytes
    #[arg(long)]
    pub write_size: Option<usize>,

    /// Seconds of silence before a heartbeat is sent
    #[arg(long)]
    pub heartbeat_after: Option<u64>,

    /// Seconds of silence before the connection is closed
    #[arg(long)]
    pub idle_timeout: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub buffers: BufferConfig,
    #[serde(default)]
    pub liveness: LivenessConfig,
    #[serde(default)]
    pub protocol: ProtocolConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Maximum concurrently accepted connections
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Listen backlog
    #[serde(default = "default_backlog")]
    pub backlog: u32,
    /// Number of worker threads
    pub workers: Option<usize>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            max_connections: default_max_connections(),
            backlog: default_backlog(),
            workers: None,
        }
    }
}

/// Per-connection buffer segment sizes
#[derive(Debug, Deserialize)]
pub struct BufferConfig {
    #[serde(default = "default_segment_size")]
    pub read_size: usize,
    #[serde(default = "default_segment_size")]
    pub write_size: usize,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            read_size: default_segment_size(),
            write_size: default_segment_size(),
        }
    }
}

/// Idle detection thresholds, all in seconds
#[derive(Debug, Deserialize)]
pub struct LivenessConfig {
    /// Soft threshold: send a heartbeat
    #[serde(default = "default_heartbeat_after")]
    pub heartbeat_after_secs: u64,
    /// Hard threshold: close the connection
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
    /// Watchdog sweep period
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
    /// Upper bound on a single write
    #[serde(default = "default_write_timeout")]
    pub write_timeout_secs: u64,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            heartbeat_after_secs: default_heartbeat_after(),
            idle_timeout_secs: default_idle_timeout(),
            sweep_interval_secs: default_sweep_interval(),
            write_timeout_secs: default_write_timeout(),
        }
    }
}

/// Protocol policy
#[derive(Debug, Deserialize, Default)]
pub struct ProtocolConfig {
    /// Close a connection on the first checksum mismatch
    #[serde(default)]
    pub close_on_decode_error: bool,
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_listen() -> String {
    format!("0.0.0.0:{}", DEFAULT_PORT)
}

fn default_max_connections() -> usize {
    128
}

fn default_backlog() -> u32 {
    100
}

fn default_segment_size() -> usize {
    1024
}

fn default_heartbeat_after() -> u64 {
    4
}

fn default_idle_timeout() -> u64 {
    8
}

fn default_sweep_interval() -> u64 {
    2
}

fn default_write_timeout() -> u64 {
    10
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: SocketAddr,
    pub max_connections: usize,
    pub backlog: u32,
    pub workers: Option<usize>,
    pub read_size: usize,
    pub write_size: usize,
    pub heartbeat_after: Duration,
    pub idle_timeout: Duration,
    pub sweep_interval: Duration,
    pub write_timeout: Duration,
    pub close_on_decode_error: bool,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            max_connections: default_max_connections(),
            backlog: default_backlog(),
            workers: None,
            read_size: default_segment_size(),
            write_size: default_segment_size(),
            heartbeat_after: Duration::from_secs(default_heartbeat_after()),
            idle_timeout: Duration::from_secs(default_idle_timeout()),
            sweep_interval: Duration::from_secs(default_sweep_interval()),
            write_timeout: Duration::from_secs(default_write_timeout()),
            close_on_decode_error: false,
            log_level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_cli(CliArgs::parse())
    }

    /// Resolve an already-parsed set of CLI arguments.
    pub fn from_cli(cli: CliArgs) -> Result<Self, ConfigError> {
        // Load TOML config if specified
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        Self::merge(cli, toml_config)
    }

    fn merge(cli: CliArgs, toml_config: TomlConfig) -> Result<Self, ConfigError> {
        let listen = cli.listen.unwrap_or(toml_config.server.listen);
        let listen: SocketAddr = listen
            .parse()
            .map_err(|_| ConfigError::InvalidListen(listen.clone()))?;

        let liveness = toml_config.liveness;
        let config = Config {
            listen,
            max_connections: cli
                .max_connections
                .unwrap_or(toml_config.server.max_connections),
            backlog: toml_config.server.backlog,
            workers: cli.workers.or(toml_config.server.workers),
            read_size: cli.read_size.unwrap_or(toml_config.buffers.read_size),
            write_size: cli.write_size.unwrap_or(toml_config.buffers.write_size),
            heartbeat_after: Duration::from_secs(
                cli.heartbeat_after.unwrap_or(liveness.heartbeat_after_secs),
            ),
            idle_timeout: Duration::from_secs(
                cli.idle_timeout.unwrap_or(liveness.idle_timeout_secs),
            ),
            sweep_interval: Duration::from_secs(liveness.sweep_interval_secs),
            write_timeout: Duration::from_secs(liveness.write_timeout_secs),
            close_on_decode_error: toml_config.protocol.close_on_decode_error,
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the engine cannot honor.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_connections == 0 {
            return Err(ConfigError::Invalid("max_connections must be at least 1"));
        }
        if self.read_size == 0 {
            return Err(ConfigError::Invalid("read_size must be non-zero"));
        }
        if self.write_size < MIN_FRAME_LEN {
            return Err(ConfigError::Invalid(
                "write_size must hold at least one empty frame",
            ));
        }
        if self.heartbeat_after >= self.idle_timeout {
            return Err(ConfigError::Invalid(
                "heartbeat threshold must be below the idle timeout",
            ));
        }
        if self.sweep_interval.is_zero() {
            return Err(ConfigError::Invalid("sweep interval must be non-zero"));
        }
        if self.workers == Some(0) {
            return Err(ConfigError::Invalid("workers must be at least 1"));
        }
        if self.write_timeout.is_zero() {
            return Err(ConfigError::Invalid("write timeout must be non-zero"));
        }
        Ok(())
    }

    /// Total bytes the buffer arena reserves up front.
    pub fn arena_size(&self) -> usize {
        self.max_connections * (self.read_size + self.write_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cli() -> CliArgs {
        CliArgs {
            log_level: "info".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_default_config() {
        let config = TomlConfig::default();
        assert_eq!(config.server.listen, "0.0.0.0:11000");
        assert_eq!(config.server.max_connections, 128);
        assert_eq!(config.server.backlog, 100);
        assert_eq!(config.liveness.heartbeat_after_secs, 4);
        assert_eq!(config.liveness.idle_timeout_secs, 8);
        assert_eq!(config.liveness.sweep_interval_secs, 2);
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [server]
            listen = "127.0.0.1:12000"
            max_connections = 16
            workers = 2

            [buffers]
            read_size = 512
            write_size = 256

            [liveness]
            heartbeat_after_secs = 3
            idle_timeout_secs = 9

            [protocol]
            close_on_decode_error = true

            [logging]
            level = "debug"
        "#;

        let toml_config: TomlConfig = toml::from_str(toml_str).unwrap();
        let config = Config::merge(cli(), toml_config).unwrap();
        assert_eq!(config.listen, "127.0.0.1:12000".parse().unwrap());
        assert_eq!(config.max_connections, 16);
        assert_eq!(config.workers, Some(2));
        assert_eq!(config.read_size, 512);
        assert_eq!(config.write_size, 256);
        assert_eq!(config.heartbeat_after, Duration::from_secs(3));
        assert_eq!(config.idle_timeout, Duration::from_secs(9));
        assert_eq!(config.sweep_interval, Duration::from_secs(2));
        assert!(config.close_on_decode_error);
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.arena_size(), 16 * 768);
    }

    #[test]
    fn test_cli_overrides_toml() {
        let toml_config: TomlConfig = toml::from_str("[server]\nmax_connections = 16\n").unwrap();
        let args = CliArgs {
            max_connections: Some(4),
            listen: Some("127.0.0.1:0".to_string()),
            ..cli()
        };
        let config = Config::merge(args, toml_config).unwrap();
        assert_eq!(config.max_connections, 4);
        assert_eq!(config.listen.port(), 0);
    }

    #[test]
    fn test_rejects_inverted_thresholds() {
        let args = CliArgs {
            heartbeat_after: Some(8),
            idle_timeout: Some(4),
            ..cli()
        };
        assert!(matches!(
            Config::merge(args, TomlConfig::default()),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_rejects_bad_listen() {
        let args = CliArgs {
            listen: Some("not-an-address".to_string()),
            ..cli()
        };
        assert!(matches!(
            Config::merge(args, TomlConfig::default()),
            Err(ConfigError::InvalidListen(_))
        ));
    }

    #[test]
    fn test_rejects_tiny_write_segment() {
        let config = Config {
            write_size: MIN_FRAME_LEN - 1,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }
}
