//! WebSocket session lifecycle: one connected client from upgrade through
//! disconnect.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocket};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use metrics::{counter, histogram};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::connection::{ClientConnection, WireFrame};
use super::heartbeat::{HeartbeatResult, run_heartbeat};
use crate::metrics::{WS_CONNECTION_DURATION_SECONDS, WS_CONNECTIONS_TOTAL, WS_DISCONNECTIONS_TOTAL};
use crate::server::AppState;

/// How long the writer gets to flush queued frames after the reader stops.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Why a session ended, for logs and metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CloseReason {
    Client,
    Server,
    TimedOut,
    Error,
}

impl CloseReason {
    fn as_str(self) -> &'static str {
        match self {
            Self::Client => "client",
            Self::Server => "server",
            Self::TimedOut => "timeout",
            Self::Error => "error",
        }
    }
}

/// Run a WebSocket session for a registered connection.
///
/// Inbound text frames reach the router one at a time, in arrival order.
/// The session ends when the client closes, the router or shutdown cancels
/// the connection, or the heartbeat gives up. The router then learns of the
/// disconnect exactly once.
#[instrument(skip_all, fields(conn_id = %connection.id))]
pub async fn run_ws_session(
    socket: WebSocket,
    connection: Arc<ClientConnection>,
    rx: mpsc::Receiver<WireFrame>,
    state: &AppState,
) {
    let (ws_tx, mut ws_rx) = socket.split();
    let cancel = connection.cancel_token().clone();

    info!(ip = ?connection.client.ip_address, "client connected");
    counter!(WS_CONNECTIONS_TOTAL).increment(1);

    let mut writer = tokio::spawn(write_frames(ws_tx, rx, cancel.clone()));
    let heartbeat = {
        let connection = connection.clone();
        let (interval, timeout) = (state.config.heartbeat_interval, state.config.heartbeat_timeout);
        tokio::spawn(async move {
            let result = run_heartbeat(connection.clone(), interval, timeout).await;
            if result == HeartbeatResult::TimedOut {
                connection.close();
            }
            result
        })
    };

    let mut reason = CloseReason::Server;
    loop {
        let next = tokio::select! {
            next = ws_rx.next() => next,
            () = cancel.cancelled() => break,
        };
        let text = match next {
            Some(Ok(Message::Text(text))) => text.as_str().to_owned(),
            Some(Ok(Message::Binary(data))) => match String::from_utf8(data.to_vec()) {
                Ok(text) => text,
                Err(_) => {
                    debug!(len = data.len(), "ignoring non-UTF8 binary frame");
                    connection.mark_alive();
                    continue;
                }
            },
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => {
                connection.mark_alive();
                continue;
            }
            Some(Ok(Message::Close(_))) | None => {
                reason = CloseReason::Client;
                break;
            }
            Some(Err(error)) => {
                debug!(%error, "websocket read failed");
                reason = CloseReason::Error;
                break;
            }
        };
        connection.mark_alive();
        state.router.handle_text(&connection.id, &connection.client, &text).await;
    }

    connection.close();
    if heartbeat.await.ok() == Some(HeartbeatResult::TimedOut) {
        reason = CloseReason::TimedOut;
        warn!(idle_secs = connection.idle_for().as_secs(), "client unresponsive, disconnected");
    }
    let _ = state.hub.remove(&connection.id);
    state.router.on_disconnect(&connection.id).await;

    if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut writer).await.is_err() {
        debug!("writer did not drain in time");
        writer.abort();
    }

    info!(reason = reason.as_str(), dropped = connection.drop_count(), "client disconnected");
    counter!(WS_DISCONNECTIONS_TOTAL, "reason" => reason.as_str()).increment(1);
    histogram!(WS_CONNECTION_DURATION_SECONDS).record(connection.age().as_secs_f64());
}

/// Forward queued frames to the socket. On cancellation, flush what is
/// already queued and send a close frame.
async fn write_frames(
    mut sink: SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<WireFrame>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            frame = rx.recv() => {
                let Some(frame) = frame else { break };
                if sink.send(to_message(frame)).await.is_err() {
                    break;
                }
            }
            () = cancel.cancelled() => {
                while let Ok(frame) = rx.try_recv() {
                    if sink.send(to_message(frame)).await.is_err() {
                        break;
                    }
                }
                let _ = sink.send(Message::Close(None)).await;
                break;
            }
        }
    }
    // A dead socket must stop the reader too.
    cancel.cancel();
}

fn to_message(frame: WireFrame) -> Message {
    match frame {
        WireFrame::Text(text) => Message::Text(text.into()),
        WireFrame::Ping => Message::Ping(Bytes::new()),
    }
}

#[cfg(test)]
mod tests {
    // Socket-level behaviour is covered by tests/integration.rs.
    use super::*;

    #[test]
    fn wire_frames_map_to_messages() {
        assert!(matches!(to_message(WireFrame::Ping), Message::Ping(p) if p.is_empty()));
        assert!(matches!(
            to_message(WireFrame::Text("{}".into())),
            Message::Text(t) if t.as_str() == "{}"
        ));
    }

    #[test]
    fn close_reasons_are_metric_labels() {
        for reason in [CloseReason::Client, CloseReason::Server, CloseReason::TimedOut, CloseReason::Error] {
            assert!(reason.as_str().chars().all(|c| c.is_ascii_lowercase()));
        }
    }
}
