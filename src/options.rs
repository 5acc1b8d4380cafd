use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::app::config::App;
use crate::error::{Error, Result};

/// Server configuration. Deserialized from a JSON config file; every
/// field has a default so a partial file (or none at all) works.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerOptions {
    pub host: String,
    pub port: u16,
    pub debug: bool,

    /// Server-wide cap on concurrent WebSocket connections.
    pub max_connections: usize,
    pub max_channels_per_connection: usize,
    /// Subscribe frames allowed per connection per second.
    pub max_subscriptions_per_second: u32,

    /// Client events: sustained rate and burst per connection.
    pub events_per_second: u32,
    pub event_burst: u32,

    /// Largest accepted event payload, client or REST.
    pub max_event_payload_kb: usize,
    /// Most channels one REST publish may target.
    pub max_channels_per_publish: usize,

    // Timeouts, in seconds.
    pub activity_timeout: u64,
    pub pong_timeout: u64,
    pub ping_interval: u64,
    pub handshake_timeout: u64,
    pub read_timeout: u64,
    pub write_timeout: u64,
    pub shutdown_grace_period: u64,

    /// Outbound queue depth per connection.
    pub message_buffer_size: usize,

    pub allow_origins: Vec<String>,

    pub apps: Vec<App>,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            debug: false,

            max_connections: 100_000,
            max_channels_per_connection: 100,
            max_subscriptions_per_second: 10,

            events_per_second: 100,
            event_burst: 200,

            max_event_payload_kb: 10,
            max_channels_per_publish: 100,

            activity_timeout: 120,
            pong_timeout: 10,
            ping_interval: 30,
            handshake_timeout: 5,
            read_timeout: 60,
            write_timeout: 10,
            shutdown_grace_period: 10,

            message_buffer_size: 256,

            allow_origins: vec!["*".to_string()],

            apps: Vec::new(),
        }
    }
}

impl ServerOptions {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {e}", path.display())))?;
        serde_json::from_str(&raw)
            .map_err(|e| Error::Config(format!("cannot parse {}: {e}", path.display())))
    }

    pub fn allows_any_origin(&self) -> bool {
        self.allow_origins.iter().any(|o| o == "*")
    }
}
