//! Configuration module for ack-server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::{Parser, ValueEnum};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Reply protocol spoken on each connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolType {
    /// Reply to every read with a fixed acknowledgement
    #[default]
    Ack,
    /// Reply to every read with the bytes that were read
    Echo,
}

/// What happens to in-flight workers once shutdown is requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ShutdownPolicy {
    /// Let workers finish, bounded by the drain timeout
    #[default]
    Drain,
    /// Cancel workers immediately
    Abort,
}

/// Command-line arguments for the server
#[derive(Parser, Debug)]
#[command(name = "ack-server")]
#[command(author = "ack-server authors")]
#[command(version = "0.1.0")]
#[command(about = "A task-per-connection TCP acknowledgement server", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 0.0.0.0:4000)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Listen backlog (pending connections queued by the OS)
    #[arg(short = 'b', long)]
    pub backlog: Option<u32>,

    /// Maximum number of concurrent connection workers (unbounded if unset)
    #[arg(short = 'w', long)]
    pub max_workers: Option<usize>,

    /// Number of runtime threads (defaults to number of CPU cores)
    #[arg(short = 't', long)]
    pub threads: Option<usize>,

    /// Reply protocol
    #[arg(short = 'p', long, value_enum)]
    pub protocol: Option<ProtocolType>,

    /// Acknowledgement sent for every read in ack mode
    #[arg(long)]
    pub ack_message: Option<String>,

    /// Size of the per-connection read buffer in bytes
    #[arg(long)]
    pub buffer_size: Option<usize>,

    /// Close connections idle for this many seconds
    #[arg(long)]
    pub idle_timeout: Option<u64>,

    /// Policy for in-flight connections on shutdown
    #[arg(long, value_enum)]
    pub shutdown_policy: Option<ShutdownPolicy>,

    /// Seconds to wait for in-flight connections when draining (0 = forever)
    #[arg(long)]
    pub drain_timeout: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub handler: HandlerConfig,
    #[serde(default)]
    pub shutdown: ShutdownConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Listener-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Listen backlog
    #[serde(default = "default_backlog")]
    pub backlog: u32,
    /// Maximum concurrent workers
    pub max_workers: Option<usize>,
    /// Number of runtime threads
    pub threads: Option<usize>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            backlog: default_backlog(),
            max_workers: None,
            threads: None,
        }
    }
}

/// Per-connection handler configuration
#[derive(Debug, Deserialize)]
pub struct HandlerConfig {
    #[serde(default)]
    pub protocol: ProtocolType,
    #[serde(default = "default_ack_message")]
    pub ack_message: String,
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    /// Idle timeout in seconds
    pub idle_timeout: Option<u64>,
}

impl Default for HandlerConfig {
    fn default() -> Self {
        Self {
            protocol: ProtocolType::default(),
            ack_message: default_ack_message(),
            buffer_size: default_buffer_size(),
            idle_timeout: None,
        }
    }
}

/// Shutdown configuration
#[derive(Debug, Deserialize)]
pub struct ShutdownConfig {
    #[serde(default)]
    pub policy: ShutdownPolicy,
    /// Drain timeout in seconds, 0 waits forever
    #[serde(default = "default_drain_timeout")]
    pub drain_timeout: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            policy: ShutdownPolicy::default(),
            drain_timeout: default_drain_timeout(),
        }
    }
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
    "0.0.0.0:4000".to_string()
}

fn default_backlog() -> u32 {
    10
}

fn default_ack_message() -> String {
    "Message received.\n".to_string()
}

fn default_buffer_size() -> usize {
    1024
}

fn default_drain_timeout() -> u64 {
    30
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: SocketAddr,
    pub backlog: u32,
    pub max_workers: Option<usize>,
    pub threads: Option<usize>,
    pub protocol: ProtocolType,
    pub ack_message: String,
    pub buffer_size: usize,
    pub idle_timeout: Option<Duration>,
    pub shutdown_policy: ShutdownPolicy,
    /// `None` waits for in-flight workers indefinitely.
    pub drain_timeout: Option<Duration>,
    pub log_level: String,
}

#[cfg(test)]
impl Default for Config {
    fn default() -> Self {
        Self::resolve(CliArgs::parse_from(["ack-server"]), TomlConfig::default()).unwrap()
    }
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = CliArgs::parse();

        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        Self::resolve(cli, toml_config)
    }

    /// Merge CLI args over TOML values and validate the result.
    pub fn resolve(cli: CliArgs, toml_config: TomlConfig) -> Result<Self, ConfigError> {
        let listen = cli.listen.unwrap_or(toml_config.server.listen);
        let listen: SocketAddr = listen
            .parse()
            .map_err(|_| ConfigError::Invalid(format!("listen address '{listen}'")))?;

        let backlog = cli.backlog.unwrap_or(toml_config.server.backlog);
        if backlog == 0 {
            return Err(ConfigError::Invalid("backlog must be positive".into()));
        }

        let max_workers = cli.max_workers.or(toml_config.server.max_workers);
        if max_workers == Some(0) {
            return Err(ConfigError::Invalid("max_workers must be positive".into()));
        }

        let buffer_size = cli.buffer_size.unwrap_or(toml_config.handler.buffer_size);
        if buffer_size == 0 {
            return Err(ConfigError::Invalid("buffer_size must be positive".into()));
        }

        let threads = cli.threads.or(toml_config.server.threads);
        if threads == Some(0) {
            return Err(ConfigError::Invalid("threads must be positive".into()));
        }

        let drain_timeout = cli
            .drain_timeout
            .unwrap_or(toml_config.shutdown.drain_timeout);

        Ok(Config {
            listen,
            backlog,
            max_workers,
            threads,
            protocol: cli.protocol.unwrap_or(toml_config.handler.protocol),
            ack_message: cli.ack_message.unwrap_or(toml_config.handler.ack_message),
            buffer_size,
            idle_timeout: cli
                .idle_timeout
                .or(toml_config.handler.idle_timeout)
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs),
            shutdown_policy: cli.shutdown_policy.unwrap_or(toml_config.shutdown.policy),
            drain_timeout: (drain_timeout > 0).then(|| Duration::from_secs(drain_timeout)),
            log_level: cli.log_level.unwrap_or(toml_config.logging.level),
        })
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::FileRead(path, e) => {
                write!(f, "Failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::TomlParse(path, e) => {
                write!(f, "Failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::Invalid(what) => write!(f, "Invalid configuration: {what}"),
        }
    }
}

impl std::error::Error for ConfigError {}
