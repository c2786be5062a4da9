//! WebSocket client connection state.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use greeter_core::ConnectionId;
use greeter_router::ClientInfo;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// A frame queued for the socket's writer task.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WireFrame {
    /// Serialized event or ack.
    Text(String),
    /// Liveness probe.
    Ping,
}

/// Represents a connected WebSocket client.
pub struct ClientConnection {
    /// Unique connection ID.
    pub id: ConnectionId,
    /// Transport facts handed to the router with every frame.
    pub client: ClientInfo,
    tx: mpsc::Sender<WireFrame>,
    cancel: CancellationToken,
    connected_at: Instant,
    /// Last pong or inbound frame.
    last_seen: Mutex<Instant>,
    dropped_messages: AtomicU64,
}

impl ClientConnection {
    /// Create a new connection. Cancelling `cancel` closes the socket.
    pub fn new(
        id: ConnectionId,
        client: ClientInfo,
        tx: mpsc::Sender<WireFrame>,
        cancel: CancellationToken,
    ) -> Self {
        let now = Instant::now();
        Self {
            id,
            client,
            tx,
            cancel,
            connected_at: now,
            last_seen: Mutex::new(now),
            dropped_messages: AtomicU64::new(0),
        }
    }

    /// Queue a text frame.
    ///
    /// Returns `false` if the queue is full or the writer is gone, and
    /// increments the dropped message counter.
    pub fn send(&self, text: String) -> bool {
        if self.tx.try_send(WireFrame::Text(text)).is_ok() {
            true
        } else {
            let _ = self.dropped_messages.fetch_add(1, Ordering::Relaxed);
            false
        }
    }

    /// Queue a ping. Not counted as a drop when the queue is full.
    pub fn ping(&self) -> bool {
        self.tx.try_send(WireFrame::Ping).is_ok()
    }

    /// Total frames dropped for this connection.
    pub fn drop_count(&self) -> u64 {
        self.dropped_messages.load(Ordering::Relaxed)
    }

    /// Record client activity (pong or any inbound frame).
    pub fn mark_alive(&self) {
        *self.last_seen.lock() = Instant::now();
    }

    /// Time since the client was last heard from.
    pub fn idle_for(&self) -> Duration {
        self.last_seen.lock().elapsed()
    }

    /// Ask the session to close the socket.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    /// Whether a close has been requested.
    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// The token that closes this socket.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Connection age.
    pub fn age(&self) -> Duration {
        self.connected_at.elapsed()
    }
}
