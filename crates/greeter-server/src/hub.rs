//! Connection hub: the router's view of open sockets.

use std::collections::HashMap;
use std::sync::Arc;

use greeter_core::ConnectionId;
use greeter_router::{ClientInfo, Notifier, Outbound};
use metrics::{counter, gauge};
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::metrics::{WS_CONNECTIONS_ACTIVE, WS_SEND_DROPS_TOTAL};
use crate::websocket::connection::{ClientConnection, WireFrame};

/// Every open socket, keyed by connection id.
pub struct ConnectionHub {
    connections: RwLock<HashMap<ConnectionId, Arc<ClientConnection>>>,
    max_connections: usize,
    send_queue_size: usize,
}

impl ConnectionHub {
    /// Create an empty hub.
    pub fn new(max_connections: usize, send_queue_size: usize) -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            max_connections,
            send_queue_size: send_queue_size.max(1),
        }
    }

    /// Register a new socket. Returns `None` at `max_connections`.
    ///
    /// The receiver feeds the socket's writer task.
    pub fn register(
        &self,
        client: ClientInfo,
        cancel: CancellationToken,
    ) -> Option<(Arc<ClientConnection>, mpsc::Receiver<WireFrame>)> {
        let mut connections = self.connections.write();
        if connections.len() >= self.max_connections {
            return None;
        }
        let (tx, rx) = mpsc::channel(self.send_queue_size);
        let id = ConnectionId::new();
        let connection = Arc::new(ClientConnection::new(id.clone(), client, tx, cancel));
        let _ = connections.insert(id, connection.clone());
        #[allow(clippy::cast_precision_loss)]
        gauge!(WS_CONNECTIONS_ACTIVE).set(connections.len() as f64);
        Some((connection, rx))
    }

    /// Forget a socket. Later deliveries to it fail.
    pub fn remove(&self, id: &ConnectionId) -> Option<Arc<ClientConnection>> {
        let mut connections = self.connections.write();
        let removed = connections.remove(id);
        #[allow(clippy::cast_precision_loss)]
        gauge!(WS_CONNECTIONS_ACTIVE).set(connections.len() as f64);
        removed
    }

    /// Look up an open socket.
    pub fn get(&self, id: &ConnectionId) -> Option<Arc<ClientConnection>> {
        self.connections.read().get(id).cloned()
    }

    /// Number of open sockets.
    pub fn len(&self) -> usize {
        self.connections.read().len()
    }

    /// Whether no sockets are open.
    pub fn is_empty(&self) -> bool {
        self.connections.read().is_empty()
    }

    /// Whether a new socket would be refused.
    pub fn is_full(&self) -> bool {
        self.len() >= self.max_connections
    }

    /// Close every socket.
    pub fn close_all(&self) {
        for connection in self.connections.read().values() {
            connection.close();
        }
    }
}

impl Notifier for ConnectionHub {
    fn deliver(&self, conn: &ConnectionId, message: Outbound) -> bool {
        let Some(connection) = self.get(conn) else {
            debug!(conn_id = %conn, frame = message.name(), "no such connection");
            return false;
        };
        let text = match message.to_frame() {
            Ok(text) => text,
            Err(error) => {
                warn!(conn_id = %conn, frame = message.name(), %error, "failed to serialize frame");
                return false;
            }
        };
        if connection.send(text) {
            true
        } else {
            counter!(WS_SEND_DROPS_TOTAL).increment(1);
            warn!(
                conn_id = %conn,
                frame = message.name(),
                dropped = connection.drop_count(),
                "outbound queue full, frame dropped"
            );
            false
        }
    }

    fn disconnect(&self, conn: &ConnectionId) {
        if let Some(connection) = self.get(conn) {
            debug!(conn_id = %conn, "closing connection");
            connection.close();
        }
    }

    fn is_connected(&self, conn: &ConnectionId) -> bool {
        self.get(conn).is_some_and(|c| !c.is_closed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use greeter_core::ErrorCode;
    use greeter_core::protocol::OutboundEvent;

    fn error_frame() -> Outbound {
        OutboundEvent::error(ErrorCode::InvalidMessage, "nope").into()
    }

    #[test]
    fn register_respects_capacity() {
        let hub = ConnectionHub::new(2, 4);
        let first = hub.register(ClientInfo::default(), CancellationToken::new());
        let second = hub.register(ClientInfo::default(), CancellationToken::new());
        assert!(first.is_some() && second.is_some());
        assert!(hub.is_full());
        assert!(hub.register(ClientInfo::default(), CancellationToken::new()).is_none());

        let (conn, _rx) = first.unwrap();
        assert!(hub.remove(&conn.id).is_some());
        assert_eq!(hub.len(), 1);
        assert!(!hub.is_full());
    }

    #[tokio::test]
    async fn deliver_serializes_into_queue() {
        let hub = ConnectionHub::new(10, 4);
        let (conn, mut rx) = hub.register(ClientInfo::default(), CancellationToken::new()).unwrap();

        assert!(hub.deliver(&conn.id, error_frame()));
        let Some(WireFrame::Text(text)) = rx.recv().await else {
            panic!("expected a text frame");
        };
        let frame: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(frame["type"], "ERROR");
        assert_eq!(frame["payload"]["code"], "INVALID_MESSAGE");
    }

    #[test]
    fn deliver_to_unknown_or_full_connection_fails() {
        let hub = ConnectionHub::new(10, 1);
        assert!(!hub.deliver(&ConnectionId::from_raw("ghost"), error_frame()));

        let (conn, _rx) = hub.register(ClientInfo::default(), CancellationToken::new()).unwrap();
        assert!(hub.deliver(&conn.id, error_frame()));
        assert!(!hub.deliver(&conn.id, error_frame()));
        assert_eq!(conn.drop_count(), 1);
    }

    #[test]
    fn disconnect_closes_but_keeps_entry_until_removed() {
        let hub = ConnectionHub::new(10, 4);
        let (conn, _rx) = hub.register(ClientInfo::default(), CancellationToken::new()).unwrap();
        assert!(hub.is_connected(&conn.id));

        hub.disconnect(&conn.id);
        assert!(conn.is_closed());
        assert!(!hub.is_connected(&conn.id));
        assert_eq!(hub.len(), 1);

        let _ = hub.remove(&conn.id);
        assert!(hub.is_empty());
    }

    #[test]
    fn close_all_cancels_every_socket() {
        let hub = ConnectionHub::new(10, 4);
        let (a, _ra) = hub.register(ClientInfo::default(), CancellationToken::new()).unwrap();
        let (b, _rb) = hub.register(ClientInfo::default(), CancellationToken::new()).unwrap();
        hub.close_all();
        assert!(a.is_closed() && b.is_closed());
    }
}
