//! Settings type definitions.
//!
//! All types use `#[serde(rename_all = "camelCase", default)]`, so a partial
//! JSON file only needs the keys it changes.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings type.
///
/// ```json
/// {
///   "server": { "port": 9000 },
///   "routing": { "rnaTimeoutMs": 15000 }
/// }
/// ```
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GreeterSettings {
    /// Network and WebSocket transport.
    pub server: ServerSettings,
    /// Routing engine timers and limits.
    pub routing: RoutingSettings,
    /// Log output.
    pub logging: LoggingSettings,
}

impl GreeterSettings {
    /// Reject combinations the server cannot run with.
    pub fn validate(&self) -> Result<()> {
        let r = &self.routing;
        let s = &self.server;
        if r.rna_timeout_ms == 0 {
            return Err(SettingsError::InvalidValue("routing.rnaTimeoutMs must be > 0".into()));
        }
        if r.staleness_sweep_interval_ms == 0 {
            return Err(SettingsError::InvalidValue(
                "routing.stalenessSweepIntervalMs must be > 0".into(),
            ));
        }
        if r.default_max_simulations == 0 {
            return Err(SettingsError::InvalidValue(
                "routing.defaultMaxSimulations must be > 0".into(),
            ));
        }
        if r.side_effect_queue_size == 0 || s.send_queue_size == 0 {
            return Err(SettingsError::InvalidValue("queue sizes must be > 0".into()));
        }
        if s.heartbeat_timeout_secs <= s.heartbeat_interval_secs {
            return Err(SettingsError::InvalidValue(format!(
                "server.heartbeatTimeoutSecs ({}) must exceed heartbeatIntervalSecs ({})",
                s.heartbeat_timeout_secs, s.heartbeat_interval_secs
            )));
        }
        Ok(())
    }
}

/// Server network and transport settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    /// Listen port (HTTP, WebSocket, health and metrics share it).
    pub port: u16,
    /// Maximum concurrent WebSocket connections.
    pub max_connections: usize,
    /// Seconds between server pings.
    pub heartbeat_interval_secs: u64,
    /// Seconds without a pong before the socket is closed.
    pub heartbeat_timeout_secs: u64,
    /// Maximum inbound frame size in bytes.
    pub max_message_size: usize,
    /// Per-connection outbound queue depth.
    pub send_queue_size: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            max_connections: 10_000,
            heartbeat_interval_secs: 30,
            heartbeat_timeout_secs: 90,
            max_message_size: 64 * 1024,
            send_queue_size: 256,
        }
    }
}

/// Routing engine settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RoutingSettings {
    /// Ring-no-answer window.
    pub rna_timeout_ms: u64,
    /// How long a disconnected agent's session survives.
    pub disconnect_grace_ms: u64,
    /// Period of the heartbeat staleness sweep.
    pub staleness_sweep_interval_ms: u64,
    /// Heartbeat age after which an agent counts as stale.
    pub stale_threshold_ms: u64,
    /// Simulation capacity when neither login nor directory sets one.
    pub default_max_simulations: usize,
    /// Depth of the fire-and-forget side-effect queue.
    pub side_effect_queue_size: usize,
}

impl RoutingSettings {
    /// RNA window as a [`Duration`].
    pub fn rna_timeout(&self) -> Duration {
        Duration::from_millis(self.rna_timeout_ms)
    }

    /// Grace period as a [`Duration`].
    pub fn disconnect_grace(&self) -> Duration {
        Duration::from_millis(self.disconnect_grace_ms)
    }

    /// Sweep period as a [`Duration`].
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.staleness_sweep_interval_ms)
    }

    /// Staleness threshold as a [`Duration`].
    pub fn stale_threshold(&self) -> Duration {
        Duration::from_millis(self.stale_threshold_ms)
    }
}

impl Default for RoutingSettings {
    fn default() -> Self {
        Self {
            rna_timeout_ms: 20_000,
            disconnect_grace_ms: 10_000,
            staleness_sweep_interval_ms: 60_000,
            stale_threshold_ms: 120_000,
            default_max_simulations: 5,
            side_effect_queue_size: 1024,
        }
    }
}

/// Logging settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default filter directive when `RUST_LOG` is unset.
    pub level: String,
    /// Emit one JSON object per line instead of compact text.
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        GreeterSettings::default().validate().unwrap();
    }

    #[test]
    fn serializes_camel_case() {
        let json = serde_json::to_value(GreeterSettings::default()).unwrap();
        assert_eq!(json["routing"]["rnaTimeoutMs"], 20_000);
        assert_eq!(json["server"]["heartbeatTimeoutSecs"], 90);
        assert_eq!(json["logging"]["level"], "info");
    }

    #[test]
    fn partial_section_keeps_defaults() {
        let s: GreeterSettings =
            serde_json::from_str(r#"{"routing": {"disconnectGraceMs": 5000}}"#).unwrap();
        assert_eq!(s.routing.disconnect_grace(), Duration::from_secs(5));
        assert_eq!(s.routing.rna_timeout(), Duration::from_secs(20));
        assert_eq!(s.server.port, 8080);
    }

    #[test]
    fn heartbeat_timeout_must_exceed_interval() {
        let mut s = GreeterSettings::default();
        s.server.heartbeat_timeout_secs = 30;
        let err = s.validate().unwrap_err();
        assert!(err.to_string().contains("heartbeatTimeoutSecs"));
    }

    #[test]
    fn zero_rna_timeout_rejected() {
        let mut s = GreeterSettings::default();
        s.routing.rna_timeout_ms = 0;
        assert!(matches!(s.validate(), Err(SettingsError::InvalidValue(_))));
    }
}
