//! Configuration types
//!
//! Client configuration: server endpoint, timeouts and stream options.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_SERVER_URL: &str = "http://127.0.0.1:5000";
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_WRITE_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_READ_TIMEOUT_MS: u64 = 300_000;

/// Minimum ratio between the read timeout and the larger of connect/write.
/// Generation is long-lived, so reads must outlast the handshake budget.
const READ_TIMEOUT_FACTOR: u64 = 10;

/// Errors raised while reading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid config file: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Invalid value for {key}: {value}")]
    InvalidEnv { key: &'static str, value: String },
}

/// Client configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Base URL of the inference server
    #[serde(default = "default_server_url")]
    pub server_url: String,
    /// TCP connect timeout
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Budget for sending a request
    #[serde(default = "default_write_timeout_ms")]
    pub write_timeout_ms: u64,
    /// Maximum silence between two chunks of a response
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
    /// Surface `processing` status lines as events instead of skipping them
    #[serde(default)]
    pub emit_processing_events: bool,
    /// User-Agent header sent with every request
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

fn default_server_url() -> String {
    DEFAULT_SERVER_URL.to_string()
}

fn default_connect_timeout_ms() -> u64 {
    DEFAULT_CONNECT_TIMEOUT_MS
}

fn default_write_timeout_ms() -> u64 {
    DEFAULT_WRITE_TIMEOUT_MS
}

fn default_read_timeout_ms() -> u64 {
    DEFAULT_READ_TIMEOUT_MS
}

fn default_user_agent() -> String {
    format!("lmlink/{}", env!("CARGO_PKG_VERSION"))
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: default_server_url(),
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            write_timeout_ms: DEFAULT_WRITE_TIMEOUT_MS,
            read_timeout_ms: DEFAULT_READ_TIMEOUT_MS,
            emit_processing_events: false,
            user_agent: default_user_agent(),
        }
    }
}

impl ClientConfig {
    /// Config pointing at `server_url` with default timeouts
    pub fn with_server(server_url: impl Into<String>) -> Self {
        let mut config = Self {
            server_url: server_url.into(),
            ..Self::default()
        };
        config.validate();
        config
    }

    /// Normalize values in place.
    ///
    /// Zero timeouts fall back to defaults and the read timeout is raised so it
    /// stays well above the connect/write budget.
    pub fn validate(&mut self) {
        let trimmed = self.server_url.trim().trim_end_matches('/');
        self.server_url = if trimmed.is_empty() {
            default_server_url()
        } else {
            trimmed.to_string()
        };

        if self.connect_timeout_ms == 0 {
            self.connect_timeout_ms = DEFAULT_CONNECT_TIMEOUT_MS;
        }
        if self.write_timeout_ms == 0 {
            self.write_timeout_ms = DEFAULT_WRITE_TIMEOUT_MS;
        }
        if self.read_timeout_ms == 0 {
            self.read_timeout_ms = DEFAULT_READ_TIMEOUT_MS;
        }

        let floor = self
            .connect_timeout_ms
            .max(self.write_timeout_ms)
            .saturating_mul(READ_TIMEOUT_FACTOR);
        if self.read_timeout_ms < floor {
            tracing::warn!(
                "Read timeout {}ms too short for streaming, raising to {}ms",
                self.read_timeout_ms,
                floor
            );
            self.read_timeout_ms = floor;
        }

        if self.user_agent.trim().is_empty() {
            self.user_agent = default_user_agent();
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    /// Apply `LMLINK_SERVER_URL` and `LMLINK_READ_TIMEOUT_MS` if set
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(
            std::env::var("LMLINK_SERVER_URL").ok(),
            std::env::var("LMLINK_READ_TIMEOUT_MS").ok(),
        )
    }

    fn apply_overrides(
        &mut self,
        server_url: Option<String>,
        read_timeout_ms: Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(url) = server_url {
            self.server_url = url;
        }
        if let Some(raw) = read_timeout_ms {
            self.read_timeout_ms = raw.trim().parse().map_err(|_| ConfigError::InvalidEnv {
                key: "LMLINK_READ_TIMEOUT_MS",
                value: raw.clone(),
            })?;
        }
        self.validate();
        Ok(())
    }
}

/// Default location of the config file in the platform config directory
pub fn default_config_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", "lmlink").map(|dirs| dirs.config_dir().join("config.json"))
}

/// Load configuration from disk
///
/// Returns default configuration if the file doesn't exist or is corrupted
pub fn load_config(path: &Path) -> ClientConfig {
    match try_load_config(path) {
        Ok(config) => config,
        Err(e) => {
            tracing::warn!("Failed to load config, using defaults: {}", e);
            ClientConfig::default()
        }
    }
}

/// Load configuration with error propagation
pub fn try_load_config(path: &Path) -> Result<ClientConfig, ConfigError> {
    if !path.exists() {
        tracing::info!("Config file not found, using defaults");
        return Ok(ClientConfig::default());
    }

    let json = fs::read_to_string(path)?;
    let mut config: ClientConfig = serde_json::from_str(&json)?;
    config.validate();

    tracing::debug!("Loaded config from {:?}", path);
    Ok(config)
}
