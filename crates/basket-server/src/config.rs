//! Server configuration.

use serde::{Deserialize, Serialize};

/// Configuration for the basket server.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Host to bind (default `"0.0.0.0"`).
    pub host: String,
    /// Port to bind. `0` picks a free port.
    pub port: u16,
    /// Capacity of each client's outbound queue. A client whose queue is full
    /// when a broadcast arrives is evicted.
    pub max_send_queue: usize,
    /// Capacity of the hub's command queue.
    pub hub_queue: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 8080,
            max_send_queue: 256,
            hub_queue: 1024,
        }
    }
}

impl ServerConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
