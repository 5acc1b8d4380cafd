use serde::{Deserialize, Serialize};

/// One backend application, loaded from configuration at startup and
/// immutable afterwards. `key` identifies the app on WebSocket upgrades
/// and REST requests; `secret` signs subscribe and REST signatures.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct App {
    pub id: String,
    pub key: String,
    #[serde(skip_serializing)]
    pub secret: String,
    pub enabled: bool,
    /// Per-app connection cap; 0 means only the server-wide cap applies.
    pub max_connections: usize,
    /// Per-connection channel cap; 0 falls back to the server default.
    pub max_channels_per_connection: usize,
}

impl Default for App {
    fn default() -> Self {
        Self {
            id: String::new(),
            key: String::new(),
            secret: String::new(),
            enabled: true,
            max_connections: 0,
            max_channels_per_connection: 0,
        }
    }
}

impl App {
    /// The channel cap that applies to connections of this app.
    pub fn channel_limit(&self, server_default: usize) -> usize {
        if self.max_channels_per_connection > 0 {
            self.max_channels_per_connection
        } else {
            server_default
        }
    }
}
