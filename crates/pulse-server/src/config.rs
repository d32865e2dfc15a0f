//! Server configuration loading from file and environment variables.

use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;
use thiserror::Error;

/// Top-level server configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Server network settings.
    #[serde(default)]
    pub server: ServerConfig,

    /// Database settings.
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Producer loop settings.
    #[serde(default)]
    pub producer: ProducerConfig,

    /// Live fan-out settings.
    #[serde(default)]
    pub broadcast: BroadcastConfig,
}

/// Network configuration for the HTTP server.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Host address to bind to.
    #[serde(default = "default_host")]
    pub host: IpAddr,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,
}

/// Database configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Path to the SQLite database file.
    #[serde(default = "default_db_path")]
    pub path: String,

    /// SQLite busy timeout in milliseconds.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,

    /// Maximum pooled connections.
    #[serde(default = "default_pool_max_size")]
    pub pool_max_size: u32,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (e.g., "info", "debug", "pulse_server=debug,info").
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Whether to output logs in JSON format.
    #[serde(default)]
    pub json: bool,
}

/// Producer loop configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ProducerConfig {
    /// Whether the built-in producer loop runs at all. External producers
    /// can still ingest through the HTTP API when this is off.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Seconds between ticks.
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,

    /// Subjects that get one snapshot per tick.
    #[serde(default = "default_subjects")]
    pub subjects: Vec<i64>,
}

/// Live fan-out configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct BroadcastConfig {
    /// Per-observer outbound queue capacity, in frames. An observer whose
    /// queue is full when an event is published is disconnected.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,

    /// Upper bound on a single socket write, in milliseconds.
    #[serde(default = "default_write_timeout_ms")]
    pub write_timeout_ms: u64,
}

impl ProducerConfig {
    /// The tick interval; zero is coerced to one second.
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }
}

impl BroadcastConfig {
    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }
}

fn default_host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1))
}

fn default_port() -> u16 {
    3000
}

fn default_db_path() -> String {
    "pulse.db".to_string()
}

fn default_busy_timeout_ms() -> u64 {
    5_000
}

fn default_pool_max_size() -> u32 {
    8
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

fn default_interval_secs() -> u64 {
    5
}

fn default_subjects() -> Vec<i64> {
    vec![1]
}

fn default_channel_capacity() -> usize {
    256
}

fn default_write_timeout_ms() -> u64 {
    5_000
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            busy_timeout_ms: default_busy_timeout_ms(),
            pool_max_size: default_pool_max_size(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_interval_secs(),
            subjects: default_subjects(),
        }
    }
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            channel_capacity: default_channel_capacity(),
            write_timeout_ms: default_write_timeout_ms(),
        }
    }
}

/// Errors that can occur when loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),

    /// Failed to parse the configuration file.
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    /// The configuration parsed but is unusable.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Loads configuration from a TOML file, falling back to defaults.
///
/// Environment variable overrides:
/// - `PULSE_HOST` overrides `server.host`
/// - `PULSE_PORT` overrides `server.port`
/// - `PULSE_DB_PATH` overrides `database.path`
/// - `PULSE_LOG_LEVEL` overrides `logging.level`
/// - `PULSE_LOG_JSON` overrides `logging.json` (set to "true" to enable)
/// - `PULSE_PRODUCER_ENABLED` overrides `producer.enabled`
/// - `PULSE_PRODUCER_INTERVAL_SECS` overrides `producer.interval_secs`
///
/// # Errors
///
/// Returns `ConfigError` if the file exists but cannot be read or parsed,
/// or if the resulting configuration fails validation.
pub fn load_config(path: Option<&str>) -> Result<Config, ConfigError> {
    let mut config = match path {
        Some(p) => match std::fs::read_to_string(p) {
            Ok(contents) => parse_config(&contents)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = p, "config file not found, using defaults");
                Config::default()
            }
            Err(e) => return Err(ConfigError::FileRead(e)),
        },
        None => Config::default(),
    };

    apply_env_overrides(&mut config);
    validate(&config)?;
    Ok(config)
}

/// Parses a TOML document into a [`Config`] without applying overrides.
pub fn parse_config(contents: &str) -> Result<Config, ConfigError> {
    Ok(toml::from_str(contents)?)
}

fn apply_env_overrides(config: &mut Config) {
    if let Ok(host) = std::env::var("PULSE_HOST") {
        if let Ok(parsed) = host.parse() {
            config.server.host = parsed;
        }
    }
    if let Ok(port) = std::env::var("PULSE_PORT") {
        if let Ok(parsed) = port.parse() {
            config.server.port = parsed;
        }
    }
    if let Ok(db_path) = std::env::var("PULSE_DB_PATH") {
        config.database.path = db_path;
    }
    if let Ok(level) = std::env::var("PULSE_LOG_LEVEL") {
        config.logging.level = level;
    }
    if let Ok(json) = std::env::var("PULSE_LOG_JSON") {
        config.logging.json = json == "true" || json == "1";
    }
    if let Ok(enabled) = std::env::var("PULSE_PRODUCER_ENABLED") {
        config.producer.enabled = enabled == "true" || enabled == "1";
    }
    if let Ok(secs) = std::env::var("PULSE_PRODUCER_INTERVAL_SECS") {
        if let Ok(parsed) = secs.parse() {
            config.producer.interval_secs = parsed;
        }
    }
}

fn validate(config: &Config) -> Result<(), ConfigError> {
    if config.broadcast.channel_capacity == 0 {
        return Err(ConfigError::Invalid(
            "broadcast.channel_capacity must be at least 1".to_string(),
        ));
    }
    if config.broadcast.write_timeout_ms == 0 {
        return Err(ConfigError::Invalid(
            "broadcast.write_timeout_ms must be at least 1".to_string(),
        ));
    }
    if let Some(bad) = config.producer.subjects.iter().find(|id| **id <= 0) {
        return Err(ConfigError::Invalid(format!(
            "producer.subjects must be positive, got {bad}"
        )));
    }
    Ok(())
}
