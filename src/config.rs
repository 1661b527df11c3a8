//! Configuration: command-line arguments plus an optional TOML file.
//!
//! CLI arguments take precedence over config file values.

use clap::{Parser, ValueEnum};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// I/O multiplexer backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IoType {
    /// `select(2)`; portable, capped at 1024 descriptors.
    Select,
    /// `poll(2)`.
    Poll,
    /// Level-triggered `epoll(7)` (Linux).
    #[default]
    Epoll,
}

/// Command-line arguments.
#[derive(Parser, Debug)]
#[command(name = "wirehub")]
#[command(version = "0.1.0")]
#[command(about = "TCP/WebSocket application server", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Bind address (e.g. 127.0.0.1)
    #[arg(long)]
    pub ip: Option<String>,

    /// Bind port
    #[arg(short, long)]
    pub port: Option<u16>,

    /// I/O multiplexer backend
    #[arg(long, value_enum)]
    pub io_type: Option<IoType>,

    /// Number of worker threads
    #[arg(short = 'w', long)]
    pub worker_threads: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,
}

/// TOML configuration file structure.
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub threading: ThreadingConfig,
    #[serde(default)]
    pub websocket: WebSocketConfig,
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize)]
pub struct NetworkConfig {
    #[serde(default = "default_ip")]
    pub ip: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub io_type: IoType,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            ip: default_ip(),
            port: default_port(),
            io_type: IoType::default(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ThreadingConfig {
    #[serde(default = "default_worker_threads")]
    pub worker_threads: usize,
}

impl Default for ThreadingConfig {
    fn default() -> Self {
        Self {
            worker_threads: default_worker_threads(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct WebSocketConfig {
    #[serde(default = "default_true")]
    pub enable_ping: bool,
    /// PING cadence in seconds.
    #[serde(default = "default_ping_interval")]
    pub ping_interval: u64,
    /// Per-frame payload cap in bytes; the 10 MiB hard cap still applies.
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            enable_ping: true,
            ping_interval: default_ping_interval(),
            max_frame_size: default_max_frame_size(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct HeartbeatConfig {
    /// Raw-byte heartbeat marker on non-WebSocket connections.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Scan cadence in seconds.
    #[serde(default = "default_heartbeat_interval")]
    pub interval: u64,
    /// Idle threshold in seconds before a connection is closed.
    #[serde(default = "default_heartbeat_timeout")]
    pub timeout: u64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: default_heartbeat_interval(),
            timeout: default_heartbeat_timeout(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
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

fn default_ip() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8888
}

fn default_worker_threads() -> usize {
    10
}

fn default_true() -> bool {
    true
}

fn default_ping_interval() -> u64 {
    30
}

fn default_max_frame_size() -> usize {
    65536
}

fn default_heartbeat_interval() -> u64 {
    10
}

fn default_heartbeat_timeout() -> u64 {
    60
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub ip: String,
    pub port: u16,
    pub io_type: IoType,
    pub worker_threads: usize,
    pub ws_enable_ping: bool,
    pub ws_ping_interval: Duration,
    pub ws_max_frame_size: usize,
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    /// Raw-byte heartbeat marker on non-WebSocket connections.
    pub heartbeat_enabled: bool,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Config::resolve(TomlConfig::default())
    }
}

impl Config {
    /// Load from CLI args and the optional TOML file they point at.
    pub fn load() -> Result<Config, ConfigError> {
        let cli = CliArgs::parse();
        Config::from_cli(cli)
    }

    fn from_cli(cli: CliArgs) -> Result<Config, ConfigError> {
        let toml_config = if let Some(ref path) = cli.config {
            let contents = std::fs::read_to_string(path)
                .map_err(|e| ConfigError::FileRead(path.clone(), e))?;
            toml::from_str(&contents).map_err(|e| ConfigError::TomlParse(path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        let mut config = Config::resolve(toml_config);
        if let Some(ip) = cli.ip {
            config.ip = ip;
        }
        if let Some(port) = cli.port {
            config.port = port;
        }
        if let Some(io_type) = cli.io_type {
            config.io_type = io_type;
        }
        if let Some(workers) = cli.worker_threads {
            config.worker_threads = workers;
        }
        if let Some(level) = cli.log_level {
            config.log_level = level;
        }
        Ok(config)
    }

    fn resolve(toml: TomlConfig) -> Config {
        Config {
            ip: toml.network.ip,
            port: toml.network.port,
            io_type: toml.network.io_type,
            worker_threads: toml.threading.worker_threads,
            ws_enable_ping: toml.websocket.enable_ping,
            ws_ping_interval: Duration::from_secs(toml.websocket.ping_interval),
            ws_max_frame_size: toml.websocket.max_frame_size,
            heartbeat_interval: Duration::from_secs(toml.heartbeat.interval),
            heartbeat_timeout: Duration::from_secs(toml.heartbeat.timeout),
            heartbeat_enabled: toml.heartbeat.enabled,
            log_level: toml.logging.level,
        }
    }
}

/// Configuration loading errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file '{path}': {1}", path = .0.display())]
    FileRead(PathBuf, std::io::Error),
    #[error("failed to parse config file '{path}': {1}", path = .0.display())]
    TomlParse(PathBuf, toml::de::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.ip, "127.0.0.1");
        assert_eq!(config.port, 8888);
        assert_eq!(config.io_type, IoType::Epoll);
        assert_eq!(config.worker_threads, 10);
        assert!(config.ws_enable_ping);
        assert_eq!(config.ws_ping_interval, Duration::from_secs(30));
        assert_eq!(config.ws_max_frame_size, 65536);
        assert_eq!(config.heartbeat_interval, Duration::from_secs(10));
        assert_eq!(config.heartbeat_timeout, Duration::from_secs(60));
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn toml_parsing() {
        let toml_str = r#"
            [network]
            ip = "0.0.0.0"
            port = 9000
            io_type = "poll"

            [threading]
            worker_threads = 4

            [websocket]
            enable_ping = false
            ping_interval = 15
            max_frame_size = 1048576

            [heartbeat]
            interval = 5
            timeout = 30

            [logging]
            level = "debug"
        "#;

        let parsed: TomlConfig = toml::from_str(toml_str).unwrap();
        let config = Config::resolve(parsed);
        assert_eq!(config.ip, "0.0.0.0");
        assert_eq!(config.port, 9000);
        assert_eq!(config.io_type, IoType::Poll);
        assert_eq!(config.worker_threads, 4);
        assert!(!config.ws_enable_ping);
        assert_eq!(config.ws_ping_interval, Duration::from_secs(15));
        assert_eq!(config.ws_max_frame_size, 1048576);
        assert_eq!(config.heartbeat_interval, Duration::from_secs(5));
        assert_eq!(config.heartbeat_timeout, Duration::from_secs(30));
        assert_eq!(config.log_level, "debug");
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let parsed: TomlConfig = toml::from_str("[network]\nport = 7777\n").unwrap();
        let config = Config::resolve(parsed);
        assert_eq!(config.port, 7777);
        assert_eq!(config.ip, "127.0.0.1");
        assert_eq!(config.worker_threads, 10);
    }

    #[test]
    fn cli_overrides_toml_defaults() {
        let cli = CliArgs {
            config: None,
            ip: Some("10.0.0.1".into()),
            port: Some(1234),
            io_type: Some(IoType::Select),
            worker_threads: Some(2),
            log_level: Some("trace".into()),
        };
        let config = Config::from_cli(cli).unwrap();
        assert_eq!(config.ip, "10.0.0.1");
        assert_eq!(config.port, 1234);
        assert_eq!(config.io_type, IoType::Select);
        assert_eq!(config.worker_threads, 2);
        assert_eq!(config.log_level, "trace");
    }
}
