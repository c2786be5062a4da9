//! Transport configuration.

use std::time::Duration;

use greeter_settings::ServerSettings;

/// Runtime configuration for [`GreeterServer`](crate::GreeterServer).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServerConfig {
    /// Host to bind.
    pub host: String,
    /// Port to bind (`0` picks a free port).
    pub port: u16,
    /// Upgrades beyond this many open sockets are refused.
    pub max_connections: usize,
    /// Time between server pings.
    pub heartbeat_interval: Duration,
    /// Silence after which a socket is closed.
    pub heartbeat_timeout: Duration,
    /// Largest accepted inbound frame, in bytes.
    pub max_message_size: usize,
    /// Outbound frames buffered per socket before new ones are dropped.
    pub send_queue_size: usize,
}

impl ServerConfig {
    /// Bind address as `host:port`.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for ServerConfig {
    /// Loopback on an ephemeral port; everything else as in [`ServerSettings`].
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 0,
            ..Self::from(&ServerSettings::default())
        }
    }
}

impl From<&ServerSettings> for ServerConfig {
    fn from(s: &ServerSettings) -> Self {
        Self {
            host: s.host.clone(),
            port: s.port,
            max_connections: s.max_connections,
            heartbeat_interval: Duration::from_secs(s.heartbeat_interval_secs),
            heartbeat_timeout: Duration::from_secs(s.heartbeat_timeout_secs),
            max_message_size: s.max_message_size,
            send_queue_size: s.send_queue_size,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_binds_loopback_ephemeral() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.host, "127.0.0.1");
        assert_eq!(cfg.port, 0);
        assert_eq!(cfg.bind_addr(), "127.0.0.1:0");
    }

    #[test]
    fn default_heartbeat() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.heartbeat_interval, Duration::from_secs(30));
        assert_eq!(cfg.heartbeat_timeout, Duration::from_secs(90));
    }

    #[test]
    fn from_settings() {
        let settings = ServerSettings {
            host: "0.0.0.0".into(),
            port: 9000,
            max_connections: 3,
            heartbeat_interval_secs: 5,
            heartbeat_timeout_secs: 12,
            max_message_size: 1024,
            send_queue_size: 8,
        };
        let cfg = ServerConfig::from(&settings);
        assert_eq!(cfg.bind_addr(), "0.0.0.0:9000");
        assert_eq!(cfg.max_connections, 3);
        assert_eq!(cfg.heartbeat_interval, Duration::from_secs(5));
        assert_eq!(cfg.heartbeat_timeout, Duration::from_secs(12));
        assert_eq!(cfg.max_message_size, 1024);
        assert_eq!(cfg.send_queue_size, 8);
    }
}
