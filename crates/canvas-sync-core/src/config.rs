//! Configuration loading and validation.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Top-level Canvas Sync configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub relay: Option<RelayConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub client: Option<ClientConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub logging: Option<LoggingConfig>,
}

/// Relay/mirror service settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_bind")]
    pub bind: String,

    /// How long an artifact request waits for a client response.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Send an `ACK` frame back to the sender of every relayed mutation.
    #[serde(default)]
    pub acknowledge_mutations: bool,

    /// Per-connection outbound queue depth; a full queue drops frames for that connection.
    #[serde(default = "default_outbound_buffer")]
    pub outbound_buffer: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            bind: default_bind(),
            request_timeout_secs: default_request_timeout_secs(),
            acknowledge_mutations: false,
            outbound_buffer: default_outbound_buffer(),
        }
    }
}

impl RelayConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

fn default_port() -> u16 {
    8765
}

fn default_bind() -> String {
    "127.0.0.1".into()
}

fn default_request_timeout_secs() -> u64 {
    10
}

fn default_outbound_buffer() -> usize {
    256
}

/// Editing client settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    #[serde(default = "default_relay_url")]
    pub relay_url: String,

    /// Role announced in the handshake.
    #[serde(default = "default_role")]
    pub role: String,

    #[serde(default = "default_reconnect_interval_secs")]
    pub reconnect_interval_secs: u64,

    /// Directory used by the snapshot store for `save_to_cloud`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub store_dir: Option<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            relay_url: default_relay_url(),
            role: default_role(),
            reconnect_interval_secs: default_reconnect_interval_secs(),
            store_dir: None,
        }
    }
}

impl ClientConfig {
    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_secs(self.reconnect_interval_secs)
    }

    pub fn store_dir(&self) -> PathBuf {
        self.store_dir
            .as_ref()
            .map(|d| {
                let expanded = shellexpand::tilde(d);
                PathBuf::from(expanded.as_ref())
            })
            .unwrap_or_else(|| data_dir().join("snapshots"))
    }
}

fn default_relay_url() -> String {
    "ws://127.0.0.1:8765/ws".into()
}

fn default_role() -> String {
    "editor".into()
}

fn default_reconnect_interval_secs() -> u64 {
    3
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log format: "plain" (default) or "json".
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Log level override (trace/debug/info/warn/error).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,

    /// Per-crate log level overrides (e.g. "canvas_sync_relay=debug").
    #[serde(default)]
    pub filters: Vec<String>,

    /// Output target: "stderr" (default) or "stdout".
    #[serde(default = "default_log_output")]
    pub output: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: default_log_format(),
            level: None,
            filters: Vec::new(),
            output: default_log_output(),
        }
    }
}

fn default_log_format() -> String {
    "plain".into()
}

fn default_log_output() -> String {
    "stderr".into()
}

/// Substitute `${ENV_VAR}` patterns in a string with their environment variable values.
fn substitute_env_vars(input: &str) -> String {
    let re = match regex::Regex::new(r"\$\{([^}]+)\}") {
        Ok(re) => re,
        Err(_) => return input.to_string(),
    };
    re.replace_all(input, |caps: &regex::Captures| {
        let var_name = &caps[1];
        std::env::var(var_name).unwrap_or_default()
    })
    .into_owned()
}

impl Config {
    /// Load config from a JSON5 file, substituting `${ENV_VAR}` references.
    pub fn load(path: &Path) -> crate::error::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(path).map_err(crate::error::SyncError::Io)?;

        // Substitute ${ENV_VAR} references before parsing
        let substituted = substitute_env_vars(&raw);

        let config: Config = json5::from_str(&substituted)
            .map_err(|e| crate::error::SyncError::Config(e.to_string()))?;

        Ok(config)
    }

    /// Default config file path.
    pub fn config_path() -> PathBuf {
        data_dir().join("config.json")
    }

    pub fn relay(&self) -> RelayConfig {
        self.relay.clone().unwrap_or_default()
    }

    pub fn client(&self) -> ClientConfig {
        self.client.clone().unwrap_or_default()
    }

    pub fn logging(&self) -> LoggingConfig {
        self.logging.clone().unwrap_or_default()
    }

    pub fn relay_port(&self) -> u16 {
        self.relay.as_ref().map(|r| r.port).unwrap_or_else(default_port)
    }

    /// Validate the config, returning `(warnings, errors)`.
    pub fn validate(&self) -> (Vec<String>, Vec<String>) {
        let mut warnings = Vec::new();
        let mut errors = Vec::new();

        if let Some(relay) = &self.relay {
            if relay.port == 0 {
                errors.push("Relay port cannot be 0".to_string());
            }
            if relay.request_timeout_secs == 0 {
                errors.push("Relay request_timeout_secs must be at least 1".to_string());
            }
            if relay.outbound_buffer == 0 {
                errors.push("Relay outbound_buffer must be at least 1".to_string());
            }
            if relay.bind != "127.0.0.1" && relay.bind != "localhost" {
                warnings.push(format!(
                    "Relay binds to {} and accepts unauthenticated peers from the network",
                    relay.bind
                ));
            }
        }

        if let Some(client) = &self.client {
            if !client.relay_url.starts_with("ws://") && !client.relay_url.starts_with("wss://") {
                errors.push(format!(
                    "Client relay_url must be a ws:// or wss:// URL, got {}",
                    client.relay_url
                ));
            }
            if client.reconnect_interval_secs == 0 {
                warnings.push(
                    "Client reconnect_interval_secs is 0; reconnects will spin without delay"
                        .to_string(),
                );
            }
        }

        if let Some(logging) = &self.logging {
            if logging.format != "plain" && logging.format != "json" {
                warnings.push(format!(
                    "Unknown logging format '{}', falling back to plain",
                    logging.format
                ));
            }
        }

        (warnings, errors)
    }

    /// Save config to a file.
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }
}

/// Base directory for Canvas Sync data: `~/.canvas_sync/`
pub fn data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".canvas_sync")
}
