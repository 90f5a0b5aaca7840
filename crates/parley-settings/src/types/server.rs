//! Server, storage, and logging settings.

use serde::{Deserialize, Serialize};

/// HTTP ingress and outbound webhook settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    /// HTTP ingress port.
    pub port: u16,
    /// Outbound actions are POSTed here. Without it, actions are only logged.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub webhook_url: Option<String>,
    /// Webhook request timeout in milliseconds.
    pub webhook_timeout_ms: u64,
    /// SQLite database path (relative to `~/.parley`).
    pub db_path: String,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8090,
            webhook_url: None,
            webhook_timeout_ms: 10_000,
            db_path: "parley.db".to_string(),
        }
    }
}

/// Logging configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default filter directive when `RUST_LOG` is unset.
    pub level: String,
    /// Persist warn+ records to the database.
    pub persist_warnings: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            persist_warnings: true,
        }
    }
}
