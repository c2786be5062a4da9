//! Prometheus recorder and transport metric names.

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use tracing::info;

/// Install the global Prometheus recorder.
///
/// Returns the handle that renders `/metrics`. Call once at startup, before
/// anything is recorded.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    info!("prometheus metrics recorder installed");
    Ok(handle)
}

/// Render Prometheus text format from the installed recorder.
pub fn render(handle: &PrometheusHandle) -> String {
    handle.render()
}

/// WebSocket connections opened (counter).
pub const WS_CONNECTIONS_TOTAL: &str = "greeter_ws_connections_total";
/// WebSocket connections closed (counter, labels: reason).
pub const WS_DISCONNECTIONS_TOTAL: &str = "greeter_ws_disconnections_total";
/// Open WebSocket connections (gauge).
pub const WS_CONNECTIONS_ACTIVE: &str = "greeter_ws_connections_active";
/// Upgrades refused at `maxConnections` (counter).
pub const WS_CONNECTIONS_REJECTED_TOTAL: &str = "greeter_ws_connections_rejected_total";
/// Outbound frames dropped on a full or closed queue (counter).
pub const WS_SEND_DROPS_TOTAL: &str = "greeter_ws_send_drops_total";
/// Connection lifetime (histogram).
pub const WS_CONNECTION_DURATION_SECONDS: &str = "greeter_ws_connection_duration_seconds";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_without_global_install() {
        let handle = PrometheusBuilder::new().build_recorder().handle();
        let output = render(&handle);
        assert!(output.is_empty() || output.contains('\n'));
    }

    #[test]
    fn names_are_prefixed_snake_case() {
        for name in [
            WS_CONNECTIONS_TOTAL,
            WS_DISCONNECTIONS_TOTAL,
            WS_CONNECTIONS_ACTIVE,
            WS_CONNECTIONS_REJECTED_TOTAL,
            WS_SEND_DROPS_TOTAL,
            WS_CONNECTION_DURATION_SECONDS,
        ] {
            assert!(name.starts_with("greeter_ws_"), "{name}");
            assert!(name.chars().all(|c| c.is_ascii_lowercase() || c == '_'), "{name}");
        }
    }
}
