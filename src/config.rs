use std::{net::SocketAddr, time::Duration};

use clap::Parser;
use serde::Deserialize;
use thiserror::Error;

#[derive(Parser, Debug)]
#[command(name = "ledgerd", about = "ledgerd - account ledger with deposits, withdrawals and transfers")]
pub struct CliArgs {
    /// Path to config file
    #[arg(short, long, default_value = "ledgerd.toml")]
    pub config: String,

    /// Port to listen on (overrides config file)
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Log level (overrides config file)
    #[arg(short, long)]
    pub log_level: Option<String>,

    /// Storage backend: memory, sqlite or postgres (overrides config file)
    #[arg(short, long)]
    pub backend: Option<Backend>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {0}: {1}")]
    Read(String, std::io::Error),

    #[error("failed to parse config file {0}: {1}")]
    Parse(String, toml::de::Error),

    #[error("invalid listen address {0}: {1}")]
    ListenAddr(String, std::net::AddrParseError),
}

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default = "default_server")]
    pub server: ServerConfig,

    #[serde(default = "default_logging")]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default = "default_metrics")]
    pub metrics: MetricsConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub json: bool,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    #[default]
    Memory,
    Sqlite,
    Postgres,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    #[serde(default)]
    pub backend: Backend,

    /// SQLite database file, or ":memory:".
    #[serde(default = "default_sqlite_path")]
    pub path: String,

    /// PostgreSQL connection string. When unset, the discrete fields below
    /// are used instead.
    #[serde(default)]
    pub url: Option<String>,

    #[serde(default = "default_host_localhost")]
    pub host: String,

    #[serde(default = "default_pg_port")]
    pub port: u16,

    #[serde(default = "default_pg_user")]
    pub user: String,

    #[serde(default)]
    pub password: Option<String>,

    #[serde(default = "default_pg_name")]
    pub name: String,

    #[serde(default = "default_isolation")]
    pub isolation: String,

    /// How long a unit of work waits for an account lock.
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,

    /// PostgreSQL pool size.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// How long a caller waits for a pooled PostgreSQL connection.
    #[serde(default = "default_connection_timeout_ms")]
    pub connection_timeout_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct MetricsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_server() -> ServerConfig {
    ServerConfig {
        host: default_host(),
        port: default_port(),
    }
}

fn default_logging() -> LoggingConfig {
    LoggingConfig {
        level: default_log_level(),
        json: false,
    }
}

fn default_metrics() -> MetricsConfig {
    MetricsConfig { enabled: true }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    3000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_sqlite_path() -> String {
    "ledgerd.db".to_string()
}

fn default_host_localhost() -> String {
    "localhost".to_string()
}

fn default_pg_port() -> u16 {
    5432
}

fn default_pg_user() -> String {
    "postgres".to_string()
}

fn default_pg_name() -> String {
    "ledgerd".to_string()
}

fn default_isolation() -> String {
    "read committed".to_string()
}

fn default_lock_timeout_ms() -> u64 {
    5000
}

fn default_max_connections() -> u32 {
    16
}

fn default_connection_timeout_ms() -> u64 {
    5000
}

fn default_true() -> bool {
    true
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        DatabaseConfig {
            backend: Backend::default(),
            path: default_sqlite_path(),
            url: None,
            host: default_host_localhost(),
            port: default_pg_port(),
            user: default_pg_user(),
            password: None,
            name: default_pg_name(),
            isolation: default_isolation(),
            lock_timeout_ms: default_lock_timeout_ms(),
            max_connections: default_max_connections(),
            connection_timeout_ms: default_connection_timeout_ms(),
        }
    }
}

impl DatabaseConfig {
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            server: default_server(),
            logging: default_logging(),
            database: DatabaseConfig::default(),
            metrics: default_metrics(),
        }
    }
}

impl Config {
    /// Reads the config file and applies CLI overrides. A missing file means
    /// defaults; an unreadable or malformed one is an error.
    pub fn load(cli: &CliArgs) -> Result<Self, ConfigError> {
        let mut config = match std::fs::read_to_string(&cli.config) {
            Ok(contents) => Self::parse(&contents).map_err(|e| ConfigError::Parse(cli.config.clone(), e))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Config::default(),
            Err(e) => return Err(ConfigError::Read(cli.config.clone(), e)),
        };

        // CLI overrides
        if let Some(port) = cli.port {
            config.server.port = port;
        }
        if let Some(ref level) = cli.log_level {
            config.logging.level = level.clone();
        }
        if let Some(backend) = cli.backend {
            config.database.backend = backend;
        }

        Ok(config)
    }

    pub fn parse(contents: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }

    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        let addr = format!("{}:{}", self.server.host, self.server.port);
        addr.parse().map_err(|e| ConfigError::ListenAddr(addr, e))
    }
}
