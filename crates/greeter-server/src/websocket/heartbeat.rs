//! Ping/pong liveness monitoring.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{self, MissedTickBehavior};
use tracing::debug;

use super::connection::ClientConnection;

/// Outcome of the heartbeat loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatResult {
    /// Nothing was heard from the client within the timeout.
    TimedOut,
    /// The connection was closed for another reason.
    Cancelled,
}

/// Ping `connection` every `interval` until it has been silent for
/// `timeout` or its token is cancelled.
///
/// Any inbound frame counts as a sign of life, not only pongs.
pub async fn run_heartbeat(connection: Arc<ClientConnection>, interval: Duration, timeout: Duration) -> HeartbeatResult {
    let mut ticker = time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately.
    let _ = ticker.tick().await;
    let cancel = connection.cancel_token().clone();

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if connection.idle_for() >= timeout {
                    return HeartbeatResult::TimedOut;
                }
                if !connection.ping() {
                    debug!(conn_id = %connection.id, "ping not queued");
                }
            }
            () = cancel.cancelled() => return HeartbeatResult::Cancelled,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use greeter_core::ConnectionId;
    use greeter_router::ClientInfo;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    use crate::websocket::connection::WireFrame;

    fn make_connection() -> (Arc<ClientConnection>, mpsc::Receiver<WireFrame>) {
        let (tx, rx) = mpsc::channel(32);
        let conn = ClientConnection::new(
            ConnectionId::from_raw("hb_conn"),
            ClientInfo::default(),
            tx,
            CancellationToken::new(),
        );
        (Arc::new(conn), rx)
    }

    #[tokio::test(start_paused = true)]
    async fn silent_client_times_out() {
        let (conn, mut rx) = make_connection();
        let result = run_heartbeat(conn, Duration::from_secs(1), Duration::from_secs(3)).await;
        assert_eq!(result, HeartbeatResult::TimedOut);
        // Pings went out before giving up.
        assert_eq!(rx.try_recv(), Ok(WireFrame::Ping));
    }

    #[tokio::test(start_paused = true)]
    async fn active_client_stays_alive() {
        let (conn, _rx) = make_connection();
        let handle = tokio::spawn(run_heartbeat(conn.clone(), Duration::from_secs(1), Duration::from_secs(3)));

        for _ in 0..10 {
            time::sleep(Duration::from_secs(1)).await;
            conn.mark_alive();
        }
        assert!(!handle.is_finished());

        conn.close();
        assert_eq!(handle.await.unwrap(), HeartbeatResult::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_before_first_tick() {
        let (conn, _rx) = make_connection();
        conn.close();
        let result = run_heartbeat(conn, Duration::from_secs(100), Duration::from_secs(300)).await;
        assert_eq!(result, HeartbeatResult::Cancelled);
    }
}
