//! Delivery of outbound frames to connections.
//!
//! The router never writes to sockets itself. While it holds the registry
//! lock it only records what should be sent in an [`Outbox`]; the outbox is
//! flushed through a [`Notifier`] after the lock is released.

use std::collections::BTreeSet;

use greeter_core::protocol::{Ack, OutboundEvent};
use greeter_core::{AgentId, ConnectionId, OrgId, PoolId, VisitorId};

/// A frame for one connection.
#[derive(Clone, Debug, PartialEq)]
pub enum Outbound {
    /// Server-pushed event.
    Event(OutboundEvent),
    /// Reply to an inbound frame.
    Ack(Ack),
}

impl Outbound {
    /// Wire name, for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Event(event) => event.name(),
            Self::Ack(_) => "ACK",
        }
    }

    /// Serialize to a text frame.
    pub fn to_frame(&self) -> Result<String, serde_json::Error> {
        match self {
            Self::Event(event) => event.to_frame(),
            Self::Ack(ack) => ack.to_frame(),
        }
    }
}

impl From<OutboundEvent> for Outbound {
    fn from(event: OutboundEvent) -> Self {
        Self::Event(event)
    }
}

impl From<Ack> for Outbound {
    fn from(ack: Ack) -> Self {
        Self::Ack(ack)
    }
}

/// Transport seam: how frames reach connected clients.
///
/// Implementations must not block; a slow client should lose frames rather
/// than stall the router.
pub trait Notifier: Send + Sync {
    /// Queue `message` for `conn`. Returns `false` if it was not queued.
    fn deliver(&self, conn: &ConnectionId, message: Outbound) -> bool;

    /// Close `conn`.
    fn disconnect(&self, conn: &ConnectionId);

    /// Whether `conn` is still open.
    fn is_connected(&self, conn: &ConnectionId) -> bool;
}

/// An `AGENT_ASSIGNED` that still needs widget settings.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct PendingAssignment {
    pub visitor_id: VisitorId,
    pub agent_id: AgentId,
    pub org_id: OrgId,
    pub pool_id: Option<PoolId>,
}

#[derive(Clone, Debug)]
pub(crate) enum Step {
    Send(ConnectionId, Outbound),
    Assign(PendingAssignment),
    Close(ConnectionId),
}

/// Notifications collected under the registry lock, in emission order.
#[derive(Debug, Default)]
pub(crate) struct Outbox {
    pub steps: Vec<Step>,
    pub touched: BTreeSet<AgentId>,
}

impl Outbox {
    pub fn send(&mut self, conn: &ConnectionId, event: OutboundEvent) {
        self.steps.push(Step::Send(conn.clone(), event.into()));
    }

    pub fn assign(&mut self, assignment: PendingAssignment) {
        self.steps.push(Step::Assign(assignment));
    }

    pub fn close(&mut self, conn: ConnectionId) {
        self.steps.push(Step::Close(conn));
    }

    /// Mark an agent whose dashboard counters changed.
    pub fn touch(&mut self, agent_id: &AgentId) {
        let _ = self.touched.insert(agent_id.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use greeter_core::ErrorCode;

    #[test]
    fn outbound_frames() {
        let event: Outbound = OutboundEvent::error(ErrorCode::CallNotFound, "gone").into();
        assert_eq!(event.name(), "ERROR");
        let frame: serde_json::Value = serde_json::from_str(&event.to_frame().unwrap()).unwrap();
        assert_eq!(frame["payload"]["code"], "CALL_NOT_FOUND");

        let ack: Outbound = Ack::success(Some("7".into()), serde_json::json!({"ok": true})).into();
        assert_eq!(ack.name(), "ACK");
        let frame: serde_json::Value = serde_json::from_str(&ack.to_frame().unwrap()).unwrap();
        assert_eq!(frame["type"], "ACK");
        assert_eq!(frame["id"], "7");
    }

    #[test]
    fn outbox_keeps_order_and_dedups_touched() {
        let mut out = Outbox::default();
        let conn = ConnectionId::from_raw("c1");
        out.send(&conn, OutboundEvent::AgentUnavailable {
            visitor_id: VisitorId::from_raw("v1"),
        });
        out.close(conn.clone());
        out.touch(&AgentId::from_raw("a1"));
        out.touch(&AgentId::from_raw("a1"));
        assert_eq!(out.steps.len(), 2);
        assert!(matches!(out.steps[1], Step::Close(ref c) if c == &conn));
        assert_eq!(out.touched.len(), 1);
    }
}
