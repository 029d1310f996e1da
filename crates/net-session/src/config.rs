//! Session configuration.

use std::time::Duration;

/// Settings shared by clients and servers.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Sleep between pump cycles.
    pub poll_interval: Duration,
    /// Name of the pump thread.
    pub thread_name: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(10),
            thread_name: "net-pump".into(),
        }
    }
}

/// Server settings.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Port to listen on (0 for OS-assigned)
    pub port: u16,
    pub session: SessionConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 27020,
            session: SessionConfig {
                thread_name: "net-server-pump".into(),
                ..Default::default()
            },
        }
    }
}

impl ServerConfig {
    pub fn with_port(port: u16) -> Self {
        Self {
            port,
            ..Default::default()
        }
    }
}
