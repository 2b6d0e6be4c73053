//! Runtime configuration for lm-shim.
//!
//! Configuration is loaded from an optional JSON file and then overridden by
//! command-line flags and environment variables. The listening port and the
//! backend base URL have no defaults: startup fails unless both are supplied.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Command-line arguments.
#[derive(Parser, Debug, Clone, Default)]
#[command(name = "lm-shim", about = "LM Studio compatible shim for an OpenAI-compatible model router")]
pub struct Cli {
    /// Path to configuration file (JSON).
    #[arg(short, long, default_value = "shim.json")]
    pub config: PathBuf,

    /// Interface to listen on.
    #[arg(long)]
    pub host: Option<String>,

    /// Port to listen on.
    #[arg(short, long, env = "SHIM_PORT")]
    pub port: Option<u16>,

    /// Base URL of the backend model router (e.g. http://localhost:4000).
    #[arg(short, long, env = "SHIM_BACKEND_URL")]
    pub backend_url: Option<String>,

    /// Enable verbose logging.
    #[arg(short, long)]
    pub verbose: bool,

    /// Emit logs as JSON lines.
    #[arg(long)]
    pub log_json: bool,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Listening port is not configured (set --port or SHIM_PORT)")]
    MissingPort,

    #[error("Listening port must be non-zero")]
    ZeroPort,

    #[error("Backend base URL is not configured (set --backend-url or SHIM_BACKEND_URL)")]
    MissingBackendUrl,

    #[error("Backend base URL {url:?} is invalid: {reason}")]
    InvalidBackendUrl { url: String, reason: String },

    #[error("Listen address {0:?} is invalid")]
    InvalidListenAddr(String),

    #[error("Timeout {0} must be greater than zero")]
    ZeroTimeout(&'static str),
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Listener settings.
    pub server: ServerConfig,

    /// Backend router connection settings.
    pub backend: BackendConfig,

    /// Placeholder values for the model catalog.
    pub catalog: CatalogConfig,

    /// Request tidying switches.
    pub compat: CompatConfig,

    /// Value written to `system_fingerprint` on every response and chunk.
    pub fingerprint: Fingerprint,
}

/// HTTP listener settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Interface to bind.
    pub host: String,

    /// Port to bind. Required.
    pub port: Option<u16>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: None,
        }
    }
}

/// Backend router settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Base URL, without the `/v1` suffix. Required.
    pub base_url: String,

    /// TCP connect timeout in seconds.
    pub connect_timeout_secs: u64,

    /// Bound on a full buffered chat response, and on stream headers.
    pub request_timeout_secs: u64,

    /// Bound on the model catalog request.
    pub models_timeout_secs: u64,

    /// Maximum silence between two streamed chunks.
    pub stream_idle_timeout_secs: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            connect_timeout_secs: 5,
            request_timeout_secs: 30,
            models_timeout_secs: 5,
            stream_idle_timeout_secs: 60,
        }
    }
}

impl BackendConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn models_timeout(&self) -> Duration {
        Duration::from_secs(self.models_timeout_secs)
    }

    pub fn stream_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.stream_idle_timeout_secs)
    }

    /// Join a path such as `/v1/models` onto the base URL.
    pub fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }
}

/// Values synthesized for catalog fields the backend does not report.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CatalogConfig {
    /// `publisher` / `owned_by` when the backend omits `owned_by`.
    pub default_publisher: String,

    /// Model id used for catalog entries without an id.
    pub default_model_alias: String,

    /// Advertised context length for every model.
    pub max_context_length: u64,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            default_publisher: "backend-router".to_string(),
            default_model_alias: "default".to_string(),
            max_context_length: 32768,
        }
    }
}

/// Message tidying applied before forwarding.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompatConfig {
    /// Drop `tool_calls` from non-assistant messages and drop empty lists.
    pub strip_tool_calls: bool,

    /// Turn user messages carrying the system marker into system messages.
    pub promote_system_marker: bool,

    /// Append a user turn when every message is a system message.
    pub ensure_user_turn: bool,
}

impl Default for CompatConfig {
    fn default() -> Self {
        Self {
            strip_tool_calls: true,
            promote_system_marker: false,
            ensure_user_turn: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct Fingerprint(pub String);

impl Default for Fingerprint {
    fn default() -> Self {
        Self("lm-shim".to_string())
    }
}

impl Config {
    /// Load configuration from a JSON file, falling back to defaults for missing fields.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let data = std::fs::read_to_string(path)?;
            let config: Config = serde_json::from_str(&data)?;
            Ok(config)
        } else {
            tracing::warn!("Config file not found at {:?}, using defaults", path);
            Ok(Config::default())
        }
    }

    /// Apply command-line and environment overrides.
    pub fn apply_cli(mut self, cli: &Cli) -> Self {
        if let Some(host) = &cli.host {
            self.server.host = host.clone();
        }
        if let Some(port) = cli.port {
            self.server.port = Some(port);
        }
        if let Some(url) = &cli.backend_url {
            self.backend.base_url = url.clone();
        }
        self
    }

    /// Check that everything needed to accept traffic is present.
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.server.port {
            None => return Err(ConfigError::MissingPort),
            Some(0) => return Err(ConfigError::ZeroPort),
            Some(_) => {}
        }
        self.listen_addr()?;

        let url = self.backend.base_url.trim();
        if url.is_empty() {
            return Err(ConfigError::MissingBackendUrl);
        }
        let parsed = reqwest::Url::parse(url).map_err(|e| ConfigError::InvalidBackendUrl {
            url: url.to_string(),
            reason: e.to_string(),
        })?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(ConfigError::InvalidBackendUrl {
                url: url.to_string(),
                reason: format!("unsupported scheme {:?}", parsed.scheme()),
            });
        }

        let timeouts = [
            ("connect_timeout_secs", self.backend.connect_timeout_secs),
            ("request_timeout_secs", self.backend.request_timeout_secs),
            ("models_timeout_secs", self.backend.models_timeout_secs),
            ("stream_idle_timeout_secs", self.backend.stream_idle_timeout_secs),
        ];
        for (name, secs) in timeouts {
            if secs == 0 {
                return Err(ConfigError::ZeroTimeout(name));
            }
        }
        Ok(())
    }

    /// Socket address to bind.
    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        let port = self.server.port.ok_or(ConfigError::MissingPort)?;
        let addr = format!("{}:{}", self.server.host, port);
        addr.parse().map_err(|_| ConfigError::InvalidListenAddr(addr))
    }
}
