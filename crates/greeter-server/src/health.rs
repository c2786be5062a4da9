//! `/health` endpoint.

use std::time::Instant;

use greeter_router::RouterCounts;
use serde::Serialize;

/// Health check response body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    /// Always `"ok"` while the server is running.
    pub status: &'static str,
    /// Seconds since the server started.
    pub uptime_secs: u64,
    /// Open WebSocket connections.
    pub connections: usize,
    /// Registered visitors.
    pub visitors: usize,
    /// Agent sessions, including those inside their grace period.
    pub agents: usize,
    /// Calls in progress.
    pub active_calls: usize,
}

/// Build a health response from live counters.
pub fn health_check(start_time: Instant, connections: usize, counts: RouterCounts) -> HealthResponse {
    HealthResponse {
        status: "ok",
        uptime_secs: start_time.elapsed().as_secs(),
        connections,
        visitors: counts.visitors,
        agents: counts.agents,
        active_calls: counts.active_calls,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_server_is_ok() {
        let resp = health_check(Instant::now(), 0, RouterCounts::default());
        assert_eq!(resp.status, "ok");
        assert!(resp.uptime_secs < 2);
    }

    #[test]
    fn uptime_increases() {
        let start = Instant::now()
            .checked_sub(std::time::Duration::from_secs(60))
            .unwrap();
        let resp = health_check(start, 0, RouterCounts::default());
        assert!(resp.uptime_secs >= 59);
    }

    #[test]
    fn serializes_camel_case() {
        let counts = RouterCounts {
            visitors: 4,
            agents: 2,
            active_calls: 1,
        };
        let resp = health_check(Instant::now(), 6, counts);
        let parsed = serde_json::to_value(&resp).unwrap();
        assert_eq!(parsed["status"], "ok");
        assert_eq!(parsed["connections"], 6);
        assert_eq!(parsed["visitors"], 4);
        assert_eq!(parsed["agents"], 2);
        assert_eq!(parsed["activeCalls"], 1);
        assert!(parsed["uptimeSecs"].is_number());
    }
}
