//! Server endpoint configuration.
//!
//! The server address is an explicit value handed to session
//! construction, not ambient process state, so the client stays
//! testable against arbitrary endpoints.

use std::time::Duration;

/// Connection settings for one ComfyUI server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// HTTP base URL, e.g. `http://127.0.0.1:8188`.
    pub api_url: String,
    /// WebSocket base URL, e.g. `ws://127.0.0.1:8188`.
    pub ws_url: String,
    /// HTTP request timeout.
    pub timeout: Duration,
}

impl ServerConfig {
    /// Build both URLs from a `host:port` address.
    pub fn from_host(host: &str) -> Self {
        Self {
            api_url: format!("http://{host}"),
            ws_url: format!("ws://{host}"),
            timeout: Duration::from_secs(30),
        }
    }
}
