//! Event router: inbound events → registry operations → outbound frames.
//!
//! Every handler follows the same shape. It awaits whatever collaborators it
//! needs first, then applies its registry mutation in one synchronous
//! critical section ([`EventRouter::with_registry`]) that also records the
//! resulting notifications, and finally flushes those notifications with the
//! lock released. The registry lock is a `parking_lot` mutex whose guard is
//! not `Send`, so it can never be held across an `.await`. Handlers that
//! await after mutating re-validate the entities they touch.

mod agent;
mod calls;
mod recovery;
mod visitor;

use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use metrics::{counter, gauge, histogram};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tracing::{debug, warn};

use greeter_core::protocol::{Ack, AgentCard, InboundEvent, InboundFrame, OutboundEvent};
use greeter_core::{AgentId, ConnectionId, ErrorCode, RequestId, VisitorId};
use greeter_registry::{AgentMatch, AgentSession, Party, Reassignment, SessionRegistry};
use greeter_settings::RoutingSettings;

use crate::collaborators::Collaborators;
use crate::error::{Result, RouterError};
use crate::metrics::{
    AGENTS_ACTIVE, CALLS_ACTIVE, EVENT_DURATION_SECONDS, EVENT_ERRORS_TOTAL, EVENTS_TOTAL,
    VISITORS_ACTIVE,
};
use crate::notifier::{Notifier, Outbound, Outbox, PendingAssignment, Step};
use crate::side_effects::{SideEffect, SideEffectQueue};
use crate::timers::TimerSet;

const SLOW_EVENT: Duration = Duration::from_secs(1);

/// Transport-level facts about a connection.
#[derive(Clone, Debug, Default)]
pub struct ClientInfo {
    /// Client IP (first `X-Forwarded-For` hop, else the peer address).
    pub ip_address: Option<String>,
}

/// Counts for the health endpoint.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RouterCounts {
    /// Connected visitors.
    pub visitors: usize,
    /// Agent sessions.
    pub agents: usize,
    /// Active calls.
    pub active_calls: usize,
}

/// The routing engine. One per process.
pub struct EventRouter {
    registry: Mutex<SessionRegistry>,
    notifier: Arc<dyn Notifier>,
    collaborators: Collaborators,
    side_effects: SideEffectQueue,
    rna: TimerSet<RequestId>,
    grace: TimerSet<AgentId>,
    settings: RoutingSettings,
    this: Weak<EventRouter>,
}

impl EventRouter {
    /// Build the router and start its side-effect worker.
    ///
    /// Must be called from inside a Tokio runtime.
    pub fn new(
        settings: RoutingSettings,
        collaborators: Collaborators,
        notifier: Arc<dyn Notifier>,
    ) -> Arc<Self> {
        let (side_effects, _worker) =
            SideEffectQueue::spawn(settings.side_effect_queue_size, collaborators.clone());
        Arc::new_cyclic(|this| Self {
            registry: Mutex::new(SessionRegistry::new()),
            notifier,
            collaborators,
            side_effects,
            rna: TimerSet::new(),
            grace: TimerSet::new(),
            settings,
            this: this.clone(),
        })
    }

    /// Routing settings in effect.
    pub fn settings(&self) -> &RoutingSettings {
        &self.settings
    }

    /// Decode and handle one text frame from `conn`.
    pub async fn handle_text(&self, conn: &ConnectionId, client: &ClientInfo, text: &str) {
        match InboundFrame::parse(text) {
            Ok(frame) => self.handle_frame(conn, client, frame).await,
            Err(err) => {
                counter!(EVENT_ERRORS_TOTAL, "type" => "unparsed", "code" => ErrorCode::InvalidMessage.as_str())
                    .increment(1);
                debug!(conn_id = %conn, error = %err.error, "rejecting malformed frame");
                let message = err.error.to_string();
                self.deliver(conn, OutboundEvent::error(ErrorCode::InvalidMessage, message.clone()).into());
                if err.id.is_some() {
                    self.deliver(conn, Ack::failure(err.id, ErrorCode::InvalidMessage, message).into());
                }
            }
        }
    }

    /// Handle one decoded frame from `conn`.
    ///
    /// Failures become an `ERROR` event, plus a failed `ACK` when the frame
    /// asked for one. `AGENT_AWAY` and `AGENT_BACK` are always acknowledged.
    pub async fn handle_frame(&self, conn: &ConnectionId, client: &ClientInfo, frame: InboundFrame) {
        let kind = frame.event.name();
        counter!(EVENTS_TOTAL, "type" => kind).increment(1);
        let wants_ack =
            frame.id.is_some() || matches!(frame.event, InboundEvent::AgentAway(_) | InboundEvent::AgentBack);

        let start = Instant::now();
        let result = self.dispatch(conn, client, frame.event).await;
        let elapsed = start.elapsed();
        histogram!(EVENT_DURATION_SECONDS, "type" => kind).record(elapsed.as_secs_f64());
        if elapsed >= SLOW_EVENT {
            warn!(event = kind, duration_secs = elapsed.as_secs_f64(), "slow event");
        }

        match result {
            Ok(value) => {
                if wants_ack {
                    self.deliver(conn, Ack::success(frame.id, value).into());
                }
            }
            Err(err) if err.is_silent() => {
                debug!(conn_id = %conn, event = kind, "dropping connection without error frame");
            }
            Err(err) => {
                let code = err.code();
                counter!(EVENT_ERRORS_TOTAL, "type" => kind, "code" => code.as_str()).increment(1);
                if code == ErrorCode::InternalError {
                    warn!(conn_id = %conn, event = kind, error = %err, "event failed");
                } else {
                    debug!(conn_id = %conn, event = kind, error = %err, "event rejected");
                }
                let message = err.to_string();
                self.deliver(conn, OutboundEvent::error(code, message.clone()).into());
                if wants_ack {
                    self.deliver(conn, Ack::failure(frame.id, code, message).into());
                }
            }
        }
    }

    async fn dispatch(&self, conn: &ConnectionId, client: &ClientInfo, event: InboundEvent) -> Result<Value> {
        match event {
            InboundEvent::VisitorJoin(join) => self.visitor_join(conn, client, join).await,
            InboundEvent::VisitorInteraction(p) => self.visitor_interaction(conn, &p),
            InboundEvent::WidgetPageview(p) => self.widget_pageview(conn, p).await,
            InboundEvent::CallRequest(p) => self.call_request(conn, p).await,
            InboundEvent::CallCancel(r) => self.call_cancel(conn, r).await,
            InboundEvent::CallAccept(r) => self.call_accept(conn, r).await,
            InboundEvent::CallReject(r) => self.call_reject(conn, r).await,
            InboundEvent::CallEnd(p) => self.call_end(conn, p).await,
            InboundEvent::AgentLogin(login) => self.agent_login(conn, login).await,
            InboundEvent::AgentStatus(p) => self.agent_status(conn, p).await,
            InboundEvent::AgentAway(p) => self.agent_away(conn, p).await,
            InboundEvent::AgentBack => self.agent_back(conn).await,
            InboundEvent::WebrtcSignal(p) => self.webrtc_signal(conn, p).await,
            InboundEvent::Heartbeat => Ok(self.heartbeat(conn)),
        }
    }

    /// Stop every pending timer. Timers that already fired finish normally.
    pub fn shutdown(&self) {
        self.rna.cancel_all();
        self.grace.cancel_all();
        debug!("router timers cancelled");
    }

    /// Current counts.
    pub fn counts(&self) -> RouterCounts {
        let reg = self.registry.lock();
        RouterCounts {
            visitors: reg.visitor_count(),
            agents: reg.agent_count(),
            active_calls: reg.active_call_count(),
        }
    }

    /// Read the registry under its lock.
    pub fn inspect<T>(&self, f: impl FnOnce(&SessionRegistry) -> T) -> T {
        let reg = self.registry.lock();
        f(&*reg)
    }

    /// Whether a ring-no-answer timer is pending for `request_id`.
    pub fn is_ringing_timer_armed(&self, request_id: &RequestId) -> bool {
        self.rna.is_armed(request_id)
    }

    /// Whether `agent_id` is inside its disconnect grace period.
    pub fn is_grace_timer_armed(&self, agent_id: &AgentId) -> bool {
        self.grace.is_armed(agent_id)
    }

    // ── Plumbing ────────────────────────────────────────────────────

    /// Run `f` against the registry, then queue `STATS_UPDATE` for every
    /// agent it touched.
    fn with_registry<T>(&self, f: impl FnOnce(&mut SessionRegistry, &mut Outbox) -> T) -> (T, Outbox) {
        let mut out = Outbox::default();
        let mut reg = self.registry.lock();
        let value = f(&mut *reg, &mut out);
        for agent_id in std::mem::take(&mut out.touched) {
            if let Some(stats) = reg.get_agent_stats(&agent_id) {
                to_agent(&reg, &mut out, &agent_id, OutboundEvent::StatsUpdate(stats));
            }
        }
        record_gauges(&reg);
        (value, out)
    }

    async fn flush(&self, out: Outbox) {
        for step in out.steps {
            match step {
                Step::Send(conn, message) => self.deliver(&conn, message),
                Step::Close(conn) => self.notifier.disconnect(&conn),
                Step::Assign(assignment) => self.complete_assignment(assignment).await,
            }
        }
    }

    /// Fetch widget settings, then send `AGENT_ASSIGNED` if the assignment
    /// survived the wait.
    async fn complete_assignment(&self, assignment: PendingAssignment) {
        let widget_settings = match self
            .collaborators
            .widgets
            .get_widget_settings(&assignment.org_id, assignment.pool_id.as_ref())
            .await
        {
            Ok(settings) => settings,
            Err(error) => {
                debug!(org_id = %assignment.org_id, %error, "widget settings unavailable, using defaults");
                json!({})
            }
        };
        let Some((conn, agent)) = self.assignment_target(&assignment) else {
            debug!(visitor_id = %assignment.visitor_id, "assignment changed before it was announced");
            return;
        };
        self.deliver(
            &conn,
            OutboundEvent::AgentAssigned {
                visitor_id: assignment.visitor_id,
                agent,
                pool_id: assignment.pool_id,
                widget_settings,
            }
            .into(),
        );
    }

    fn assignment_target(&self, assignment: &PendingAssignment) -> Option<(ConnectionId, AgentCard)> {
        let reg = self.registry.lock();
        let visitor = reg.visitor(&assignment.visitor_id)?;
        if visitor.assigned_agent_id.as_ref() != Some(&assignment.agent_id) {
            return None;
        }
        let agent = reg.agent(&assignment.agent_id)?;
        Some((visitor.connection_id.clone(), agent.card()))
    }

    fn deliver(&self, conn: &ConnectionId, message: Outbound) {
        let name = message.name();
        if !self.notifier.deliver(conn, message) {
            debug!(conn_id = %conn, event = name, "frame not delivered");
        }
    }

    fn effect(&self, effect: SideEffect) {
        let _ = self.side_effects.push(effect);
    }

    fn arm_rna(&self, request_id: RequestId) {
        let router = self.this.clone();
        let key = request_id.clone();
        self.rna.arm(request_id, self.settings.rna_timeout(), async move {
            if let Some(router) = router.upgrade() {
                router.on_ring_timeout(&key).await;
            }
        });
    }

    fn arm_grace(&self, agent_id: AgentId) {
        let router = self.this.clone();
        let key = agent_id.clone();
        self.grace.arm(agent_id, self.settings.disconnect_grace(), async move {
            if let Some(router) = router.upgrade() {
                router.on_grace_expired(&key).await;
            }
        });
    }

    /// Queue `AGENT_ASSIGNED` for a freshly routed visitor.
    fn announce_assignment(&self, reg: &SessionRegistry, out: &mut Outbox, visitor_id: &VisitorId, m: &AgentMatch) {
        let Some(visitor) = reg.visitor(visitor_id) else {
            return;
        };
        out.assign(PendingAssignment {
            visitor_id: visitor_id.clone(),
            agent_id: m.agent_id.clone(),
            org_id: visitor.org_id.clone(),
            pool_id: Some(m.pool_id.clone()),
        });
        out.touch(&m.agent_id);
        self.effect(SideEffect::WidgetView {
            org_id: visitor.org_id.clone(),
            visitor_id: visitor_id.clone(),
        });
    }

    /// Tell displaced visitors where they went.
    fn announce_reassignment(reg: &SessionRegistry, out: &mut Outbox, from: &AgentId, outcome: Reassignment) {
        for (visitor_id, agent_id) in outcome.reassigned {
            if let Some(agent) = reg.agent(&agent_id).map(AgentSession::card) {
                to_visitor(
                    reg,
                    out,
                    &visitor_id,
                    OutboundEvent::AgentReassigned {
                        visitor_id: visitor_id.clone(),
                        previous_agent_id: Some(from.clone()),
                        agent,
                    },
                );
            }
            out.touch(&agent_id);
        }
        for visitor_id in outcome.unassigned {
            to_visitor(reg, out, &visitor_id, OutboundEvent::AgentUnavailable {
                visitor_id: visitor_id.clone(),
            });
        }
        out.touch(from);
    }
}

impl std::fmt::Debug for EventRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventRouter")
            .field("rna", &self.rna)
            .field("grace", &self.grace)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

/// Clock used for registry timestamps. Follows Tokio's (pausable) clock.
fn now() -> Instant {
    tokio::time::Instant::now().into_std()
}

fn visitor_sender(reg: &SessionRegistry, conn: &ConnectionId) -> Result<VisitorId> {
    match reg.party_for_connection(conn) {
        Some(Party::Visitor(visitor_id)) => Ok(visitor_id.clone()),
        _ => Err(RouterError::NotAVisitor),
    }
}

fn agent_sender(reg: &SessionRegistry, conn: &ConnectionId) -> Result<AgentId> {
    match reg.party_for_connection(conn) {
        Some(Party::Agent(agent_id)) => Ok(agent_id.clone()),
        _ => Err(RouterError::NotAnAgent),
    }
}

fn to_visitor(reg: &SessionRegistry, out: &mut Outbox, visitor_id: &VisitorId, event: OutboundEvent) {
    if let Some(visitor) = reg.visitor(visitor_id) {
        out.send(&visitor.connection_id, event);
    }
}

/// Agents inside their grace period have no live socket and are skipped.
fn to_agent(reg: &SessionRegistry, out: &mut Outbox, agent_id: &AgentId, event: OutboundEvent) {
    if reg.pending_disconnect(agent_id).is_some() {
        return;
    }
    if let Some(agent) = reg.agent(agent_id) {
        out.send(&agent.connection_id, event);
    }
}

#[allow(clippy::cast_precision_loss)]
fn record_gauges(reg: &SessionRegistry) {
    gauge!(VISITORS_ACTIVE).set(reg.visitor_count() as f64);
    gauge!(AGENTS_ACTIVE).set(reg.agent_count() as f64);
    gauge!(CALLS_ACTIVE).set(reg.active_call_count() as f64);
}
