//! Layered daemon configuration.
//!
//! Sources, lowest priority first: built-in defaults, an optional TOML file,
//! then `FLEETD__SECTION__KEY` environment variables.

use std::env;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

pub const APP_NAME: &str = "fleetd";
pub const ENV_PREFIX: &str = "FLEETD";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("configuration error: {0}")]
    Load(#[from] config::ConfigError),

    #[error("failed to expand path '{path}': {message}")]
    Expand { path: String, message: String },

    #[error("unable to determine {0} directory")]
    NoDirectory(&'static str),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub store: StoreConfig,
    pub orchestrator: OrchestratorConfig,
    pub websocket: WebSocketConfig,
    pub events: EventsConfig,
}

/// HTTP listener settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: SocketAddr,
    /// Treat every request as coming from an administrator.
    pub dev_mode: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 8080)),
            dev_mode: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Host database file. Defaults to `$XDG_DATA_HOME/fleetd/hosts.json`.
    pub path: Option<String>,
}

impl StoreConfig {
    pub fn resolved_path(&self) -> ConfigResult<PathBuf> {
        match &self.path {
            Some(path) => expand_str_path(path),
            None => Ok(default_data_dir()?.join("hosts.json")),
        }
    }
}

/// Reconciliation loop and host HTTP timeouts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub enabled: bool,
    pub refresh_interval_secs: u64,
    /// Inventory calls.
    pub request_timeout_secs: u64,
    /// Health probe calls.
    pub health_check_timeout_secs: u64,
    /// VM verbs and other mutations.
    pub operation_timeout_secs: u64,
    /// How long a login token is reused before fetching a new one.
    pub token_ttl_secs: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            refresh_interval_secs: 30,
            request_timeout_secs: 120,
            health_check_timeout_secs: 5,
            operation_timeout_secs: 180,
            token_ttl_secs: 600,
        }
    }
}

impl OrchestratorConfig {
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs.max(1))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn health_check_timeout(&self) -> Duration {
        Duration::from_secs(self.health_check_timeout_secs)
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_timeout_secs)
    }

    pub fn token_ttl(&self) -> Duration {
        Duration::from_secs(self.token_ttl_secs)
    }
}

/// Outbound host WebSocket connections.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebSocketConfig {
    pub enabled: bool,
    pub handshake_timeout_secs: u64,
    pub probe_timeout_secs: u64,
    pub ping_interval_secs: u64,
    pub reconnect_base_secs: u64,
    pub reconnect_max_secs: u64,
    pub monitor_interval_secs: u64,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            handshake_timeout_secs: 10,
            probe_timeout_secs: 2,
            ping_interval_secs: 30,
            reconnect_base_secs: 5,
            reconnect_max_secs: 60,
            monitor_interval_secs: 30,
        }
    }
}

/// Inbound subscriber hub.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventsConfig {
    pub enabled: bool,
    pub command_buffer: usize,
    pub mailbox_size: usize,
    pub write_timeout_secs: u64,
    pub ping_interval_secs: u64,
    pub pong_timeout_secs: u64,
    pub allow_multiple_connections_per_ip: bool,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            command_buffer: 4096,
            mailbox_size: 1024,
            write_timeout_secs: 10,
            ping_interval_secs: 30,
            pong_timeout_secs: 60,
            allow_multiple_connections_per_ip: true,
        }
    }
}

impl AppConfig {
    /// Load configuration from defaults, `path` (if it exists) and the environment.
    pub fn load(path: Option<&Path>) -> ConfigResult<Self> {
        let mut builder = Config::builder()
            .set_default("logging.level", "info")?
            .set_default("orchestrator.refresh_interval_secs", 30_i64)?;

        if let Some(path) = path {
            builder = builder.add_source(File::from(path).format(FileFormat::Toml).required(false));
        }

        let built = builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(built.try_deserialize()?)
    }
}

pub fn default_config_file() -> ConfigResult<PathBuf> {
    if let Some(dir) = env::var_os("XDG_CONFIG_HOME").filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(dir).join(APP_NAME).join("config.toml"));
    }

    dirs::config_dir()
        .map(|dir| dir.join(APP_NAME).join("config.toml"))
        .ok_or(ConfigError::NoDirectory("configuration"))
}

fn default_data_dir() -> ConfigResult<PathBuf> {
    if let Some(dir) = env::var_os("XDG_DATA_HOME").filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(dir).join(APP_NAME));
    }

    dirs::data_dir()
        .map(|dir| dir.join(APP_NAME))
        .ok_or(ConfigError::NoDirectory("data"))
}

pub fn expand_str_path(text: &str) -> ConfigResult<PathBuf> {
    let expanded = shellexpand::full(text).map_err(|e| ConfigError::Expand {
        path: text.to_string(),
        message: e.to_string(),
    })?;
    Ok(PathBuf::from(expanded.to_string()))
}
