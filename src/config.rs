//! Configuration module for the switchboard server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Command-line arguments for the relay server
#[derive(Parser, Debug)]
#[command(name = "switchboard")]
#[command(author = "switchboard authors")]
#[command(version = "0.1.0")]
#[command(about = "A TCP relay for messaging and brokered remote calls", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 127.0.0.1:7070)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Number of worker threads (defaults to number of CPU cores)
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Store credentials in the SQLite database at this path
    #[arg(long)]
    pub database: Option<PathBuf>,

    /// Seconds a caller waits for a handler's reply
    #[arg(short = 't', long)]
    pub call_timeout: Option<u64>,

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
    pub broker: BrokerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Number of worker threads
    pub workers: Option<usize>,
    /// Upper bound on concurrently served connections
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Longest accepted frame, tag and terminator included
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,
    /// Frames buffered per connection before senders wait
    #[serde(default = "default_outbound_queue")]
    pub outbound_queue: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            workers: None,
            max_connections: default_max_connections(),
            max_frame_size: default_max_frame_size(),
            outbound_queue: default_outbound_queue(),
        }
    }
}

/// Call routing configuration
#[derive(Debug, Deserialize)]
pub struct BrokerConfig {
    /// Seconds a caller waits for a reply before the call fails
    #[serde(default = "default_call_timeout")]
    pub call_timeout: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            call_timeout: default_call_timeout(),
        }
    }
}

/// Where credentials live
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Memory,
    Sqlite,
}

/// Credential storage configuration
#[derive(Debug, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StoreBackend,
    /// Database file used by the sqlite backend
    #[serde(default = "default_database_path")]
    pub path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            path: default_database_path(),
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
    "127.0.0.1:7070".to_string()
}

fn default_max_connections() -> usize {
    10_000
}

fn default_max_frame_size() -> usize {
    1024 * 1024 // 1 MiB
}

fn default_outbound_queue() -> usize {
    256
}

fn default_call_timeout() -> u64 {
    30
}

fn default_database_path() -> PathBuf {
    PathBuf::from("./database/data.db")
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: String,
    pub workers: Option<usize>,
    pub max_connections: usize,
    pub max_frame_size: usize,
    pub outbound_queue: usize,
    pub call_timeout: Duration,
    pub store: StoreBackend,
    pub database: PathBuf,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Config::merge(CliArgs::default_args(), TomlConfig::default())
    }
}

impl CliArgs {
    fn default_args() -> Self {
        CliArgs {
            config: None,
            listen: None,
            workers: None,
            database: None,
            call_timeout: None,
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = CliArgs::parse();

        // Load TOML config if specified
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        let config = Config::merge(cli, toml_config);
        config.validate()?;
        Ok(config)
    }

    fn merge(cli: CliArgs, toml_config: TomlConfig) -> Self {
        // A --database flag implies the sqlite backend
        let (store, database) = match cli.database {
            Some(path) => (StoreBackend::Sqlite, path),
            None => (toml_config.storage.backend, toml_config.storage.path),
        };

        Config {
            listen: cli.listen.unwrap_or(toml_config.server.listen),
            workers: cli.workers.or(toml_config.server.workers),
            max_connections: toml_config.server.max_connections,
            max_frame_size: toml_config.server.max_frame_size,
            outbound_queue: toml_config.server.outbound_queue,
            call_timeout: Duration::from_secs(
                cli.call_timeout.unwrap_or(toml_config.broker.call_timeout),
            ),
            store,
            database,
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == Some(0) {
            return Err(ConfigError::Invalid("workers must be at least 1"));
        }
        if self.max_connections == 0 {
            return Err(ConfigError::Invalid("max_connections must be at least 1"));
        }
        if self.outbound_queue == 0 {
            return Err(ConfigError::Invalid("outbound_queue must be at least 1"));
        }
        if self.max_frame_size < 2 {
            return Err(ConfigError::Invalid("max_frame_size must be at least 2"));
        }
        if self.call_timeout.is_zero() {
            return Err(ConfigError::Invalid("call_timeout must be at least 1 second"));
        }
        Ok(())
    }
}

/// Configuration loading errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {}", .0.display(), .1)]
    FileRead(PathBuf, #[source] std::io::Error),
    #[error("Failed to parse config file '{}': {}", .0.display(), .1)]
    TomlParse(PathBuf, #[source] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}
