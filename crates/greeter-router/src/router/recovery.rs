//! Disconnects, grace expiry, ring-no-answer and the staleness sweep.

use std::sync::Arc;

use metrics::counter;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use greeter_core::protocol::{AgentStatus, CancelReason, EndReason, OutboundEvent};
use greeter_core::{AgentId, ConnectionId, RequestId, VisitorId};
use greeter_registry::{AgentSession, CallRequest, CallRequestState, Party, SessionRegistry};

use super::calls::log_entry;
use super::{EventRouter, now, to_agent, to_visitor};
use crate::error::Result;
use crate::metrics::{AGENTS_MARKED_AWAY_TOTAL, CALLS_TOTAL, REROUTES_TOTAL};
use crate::notifier::Outbox;
use crate::side_effects::SideEffect;

impl EventRouter {
    /// A socket closed. Call once per connection, after its last frame.
    #[instrument(skip_all, fields(conn_id = %conn))]
    pub async fn on_disconnect(&self, conn: &ConnectionId) {
        let ((), out) = self.with_registry(|reg, out| match reg.party_for_connection(conn).cloned() {
            Some(Party::Visitor(visitor_id)) => self.visitor_left(reg, out, &visitor_id),
            Some(Party::Agent(agent_id)) => self.agent_dropped(reg, out, &agent_id, conn),
            None => debug!("anonymous connection closed"),
        });
        self.flush(out).await;
    }

    pub(super) fn visitor_left(&self, reg: &mut SessionRegistry, out: &mut Outbox, visitor_id: &VisitorId) {
        if let Some(call_id) = reg.get_active_call_by_visitor_id(visitor_id).map(|c| c.call_id.clone()) {
            if let Err(error) = self.close_call(reg, out, &call_id, EndReason::VisitorDisconnected) {
                warn!(call_id = %call_id, %error, "failed to end call of departing visitor");
            }
        }
        let live: Vec<RequestId> = reg
            .get_requests_for_visitor(visitor_id)
            .iter()
            .map(|r| r.request_id.clone())
            .collect();
        for request_id in live {
            if let Err(error) = self.withdraw(reg, out, &request_id, CancelReason::VisitorLeft) {
                warn!(request_id = %request_id, %error, "failed to cancel request of departing visitor");
            }
        }

        let Some(visitor) = reg.unregister_visitor(visitor_id) else {
            return;
        };
        info!(visitor_id = %visitor_id, "visitor left");
        if let Some(agent_id) = visitor.assigned_agent_id {
            out.touch(&agent_id);
            self.backfill(reg, out, &agent_id);
        }
    }

    /// Start the grace period. The agent's call is over (its media is gone)
    /// but its watchers stay put in case it comes back.
    fn agent_dropped(&self, reg: &mut SessionRegistry, out: &mut Outbox, agent_id: &AgentId, conn: &ConnectionId) {
        let restore = match reg.mark_agent_disconnected(agent_id, conn, now()) {
            Ok(Some(previous)) => previous,
            Ok(None) => {
                debug!(agent_id = %agent_id, "superseded agent socket closed");
                return;
            }
            Err(error) => {
                warn!(agent_id = %agent_id, %error, "disconnect for unknown agent");
                return;
            }
        };

        if let Some(call_id) = reg.get_active_call_by_agent_id(agent_id).map(|c| c.call_id.clone()) {
            if let Err(error) = self.close_call(reg, out, &call_id, EndReason::AgentDisconnected) {
                warn!(call_id = %call_id, %error, "failed to end call of dropped agent");
            }
        }
        let ringing: Vec<RequestId> = reg
            .get_requests_for_agent(agent_id)
            .into_iter()
            .filter(|r| r.state == CallRequestState::Ringing)
            .map(|r| r.request_id.clone())
            .collect();
        for request_id in ringing {
            let _ = self.rna.cancel(&request_id);
            if let Err(error) = reg.requeue(&request_id) {
                warn!(request_id = %request_id, %error, "failed to requeue request of dropped agent");
            }
        }

        self.arm_grace(agent_id.clone());
        self.effect(SideEffect::StatusChange {
            agent_id: agent_id.clone(),
            status: AgentStatus::Offline,
            reason: "disconnected".into(),
        });
        info!(
            agent_id = %agent_id,
            restore = restore.as_str(),
            grace_ms = self.settings.disconnect_grace_ms,
            "agent disconnected, grace period started"
        );
    }

    /// The grace timer fired without a reconnect.
    #[instrument(skip(self))]
    pub(super) async fn on_grace_expired(&self, agent_id: &AgentId) {
        let ((), out) = self.with_registry(|reg, out| {
            if reg.pending_disconnect(agent_id).is_none() {
                debug!("agent came back before grace expiry");
                return;
            }
            info!("grace period expired, removing agent");
            self.remove_agent(reg, out, agent_id, EndReason::AgentDisconnected, "disconnect_grace_expired");
        });
        self.flush(out).await;
    }

    /// Drop an agent for good: end its call, move its watchers, and send its
    /// outstanding requests to other agents where possible.
    pub(super) fn remove_agent(
        &self,
        reg: &mut SessionRegistry,
        out: &mut Outbox,
        agent_id: &AgentId,
        reason: EndReason,
        status_reason: &str,
    ) {
        let _ = self.grace.cancel(agent_id);
        // offline first so ending the call does not backfill this agent
        if let Err(error) = reg.update_status(agent_id, AgentStatus::Offline) {
            debug!(agent_id = %agent_id, %error, "agent already gone");
            return;
        }
        if let Some(call_id) = reg.get_active_call_by_agent_id(agent_id).map(|c| c.call_id.clone()) {
            if let Err(error) = self.close_call(reg, out, &call_id, reason) {
                warn!(call_id = %call_id, %error, "failed to end call of removed agent");
            }
        }

        let pending: Vec<CallRequest> = reg
            .get_requests_for_agent(agent_id)
            .into_iter()
            .cloned()
            .collect();
        for request in &pending {
            let _ = self.rna.cancel(&request.request_id);
            if let Err(error) = reg.cancel_call(&request.request_id) {
                warn!(request_id = %request.request_id, %error, "failed to cancel request of removed agent");
                continue;
            }
            self.effect(SideEffect::CallCancelled(request.request_id.clone()));
            counter!(CALLS_TOTAL, "outcome" => "cancelled").increment(1);
        }

        let orphans = reg.unregister_agent(agent_id);
        for visitor_id in orphans {
            match reg.route_visitor(&visitor_id, std::slice::from_ref(agent_id)) {
                Some(m) => {
                    if let Some(agent) = reg.agent(&m.agent_id).map(AgentSession::card) {
                        to_visitor(reg, out, &visitor_id, OutboundEvent::AgentReassigned {
                            visitor_id: visitor_id.clone(),
                            previous_agent_id: Some(agent_id.clone()),
                            agent,
                        });
                    }
                    out.touch(&m.agent_id);
                }
                None => to_visitor(reg, out, &visitor_id, OutboundEvent::AgentUnavailable {
                    visitor_id: visitor_id.clone(),
                }),
            }
        }

        for request in pending {
            self.reroute_orphaned_request(reg, out, &request);
        }

        self.effect(SideEffect::StatusChange {
            agent_id: agent_id.clone(),
            status: AgentStatus::Offline,
            reason: status_reason.to_owned(),
        });
        self.effect(SideEffect::SessionEnded(agent_id.clone()));
        info!(agent_id = %agent_id, reason = status_reason, "agent removed");
    }

    fn reroute_orphaned_request(&self, reg: &mut SessionRegistry, out: &mut Outbox, request: &CallRequest) {
        if reg.visitor(&request.visitor_id).is_none() {
            return;
        }
        let visitor_id = &request.visitor_id;
        let Some(m) = reg.find_best_agent_for_visitor(&request.org_id, &request.page_url) else {
            debug!(visitor_id = %visitor_id, "no agent left for orphaned request");
            to_visitor(reg, out, visitor_id, OutboundEvent::CallCancelled {
                request_id: request.request_id.clone(),
                reason: CancelReason::AgentUnavailable,
            });
            return;
        };
        let rerouted = match reg.create_call_request(visitor_id, &m.agent_id, now()) {
            Ok(fresh) => {
                self.effect(SideEffect::CreateCallLog(log_entry(&fresh)));
                self.ring_or_queue(reg, out, fresh)
            }
            Err(error) => Err(error.into()),
        };
        match rerouted {
            Ok(fresh) => {
                counter!(REROUTES_TOTAL).increment(1);
                info!(from = %request.request_id, to = %fresh.request_id, agent_id = %m.agent_id, "request rerouted");
            }
            Err(error) => warn!(visitor_id = %visitor_id, %error, "failed to reroute orphaned request"),
        }
    }

    // ── Ring-no-answer ──────────────────────────────────────────────

    /// The RNA timer fired: the request is missed, the agent is forced away
    /// and the caller moves on to someone else if anyone is free.
    #[instrument(skip(self))]
    pub(super) async fn on_ring_timeout(&self, request_id: &RequestId) {
        let ((), out) = self.with_registry(|reg, out| {
            let still_ringing = reg
                .get_call_request(request_id)
                .is_some_and(|r| r.state == CallRequestState::Ringing);
            if !still_ringing {
                debug!("request settled before ring timeout");
                return;
            }
            let missed = match reg.mark_missed(request_id) {
                Ok(missed) => missed,
                Err(error) => {
                    warn!(%error, "failed to mark request missed");
                    return;
                }
            };
            self.effect(SideEffect::CallMissed(request_id.clone()));
            counter!(CALLS_TOTAL, "outcome" => "missed").increment(1);
            info!(agent_id = %missed.agent_id, visitor_id = %missed.visitor_id, "ring timed out");

            to_agent(reg, out, &missed.agent_id, OutboundEvent::CallCancelled {
                request_id: request_id.clone(),
                reason: CancelReason::RingNoAnswer,
            });
            if let Err(error) = self.force_away(reg, out, &missed.agent_id, "ring_no_answer") {
                warn!(agent_id = %missed.agent_id, %error, "failed to mark agent away");
            }
            self.reroute_missed(reg, out, &missed);
        });
        self.flush(out).await;
    }

    /// Try every other eligible agent in turn until one rings. With nobody
    /// left the visitor queues against the original agent again.
    fn reroute_missed(&self, reg: &mut SessionRegistry, out: &mut Outbox, missed: &CallRequest) {
        let visitor_id = &missed.visitor_id;
        if reg.visitor(visitor_id).is_none() {
            return;
        }
        let mut exclude = vec![missed.agent_id.clone()];
        while let Some(m) = reg.find_best_agent_excluding(&missed.org_id, &missed.page_url, &exclude) {
            match self.try_ring(reg, out, visitor_id, &m.agent_id) {
                Ok(fresh) => {
                    counter!(REROUTES_TOTAL).increment(1);
                    info!(from = %missed.request_id, to = %fresh.request_id, agent_id = %m.agent_id, "missed call rerouted");
                    return;
                }
                Err(error) => {
                    debug!(agent_id = %m.agent_id, %error, "reroute candidate failed, trying next");
                    exclude.push(m.agent_id);
                }
            }
        }

        match reg.create_call_request(visitor_id, &missed.agent_id, now()) {
            Ok(queued) => {
                self.effect(SideEffect::CreateCallLog(log_entry(&queued)));
                out.touch(&missed.agent_id);
                debug!(request_id = %queued.request_id, "no alternative agent, request queued");
            }
            Err(error) => warn!(visitor_id = %visitor_id, %error, "failed to requeue missed call"),
        }
    }

    fn try_ring(
        &self,
        reg: &mut SessionRegistry,
        out: &mut Outbox,
        visitor_id: &VisitorId,
        agent_id: &AgentId,
    ) -> Result<CallRequest> {
        let fresh = reg.create_call_request(visitor_id, agent_id, now())?;
        match self.ring(reg, out, &fresh.request_id) {
            Ok(ringing) => {
                self.effect(SideEffect::CreateCallLog(log_entry(&ringing)));
                Ok(ringing)
            }
            Err(error) => {
                let _ = reg.cancel_call(&fresh.request_id);
                Err(error)
            }
        }
    }

    /// Server-side `away`, announced to the agent with `AGENT_MARKED_AWAY`.
    fn force_away(
        &self,
        reg: &mut SessionRegistry,
        out: &mut Outbox,
        agent_id: &AgentId,
        reason: &'static str,
    ) -> Result<AgentStatus> {
        let previous = self.go_away(reg, out, agent_id, reason)?;
        to_agent(reg, out, agent_id, OutboundEvent::AgentMarkedAway {
            reason: reason.to_owned(),
        });
        counter!(AGENTS_MARKED_AWAY_TOTAL, "reason" => reason).increment(1);
        Ok(previous)
    }

    // ── Staleness sweep ─────────────────────────────────────────────

    /// Mark every idle agent with an old heartbeat away. Returns who was
    /// swept.
    ///
    /// Agents on a call are skipped even when their heartbeat is old. A dead
    /// in-call socket is caught by the WebSocket ping timeout instead, which
    /// ends the call and starts the grace period.
    pub async fn sweep_stale_agents(&self) -> Vec<AgentId> {
        let threshold = self.settings.stale_threshold();
        let (swept, out) = self.with_registry(|reg, out| {
            let stale = reg.get_stale_agents(now(), threshold);
            for agent_id in &stale {
                warn!(agent_id = %agent_id, "agent heartbeat stale, marking away");
                if let Err(error) = self.force_away(reg, out, agent_id, "heartbeat_stale") {
                    warn!(agent_id = %agent_id, %error, "failed to mark stale agent away");
                }
            }
            stale
        });
        self.flush(out).await;
        swept
    }

    /// Run [`Self::sweep_stale_agents`] every sweep interval until `cancel`
    /// fires or the router is dropped.
    pub fn spawn_staleness_sweep(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let router = Arc::downgrade(self);
        let period = self.settings.sweep_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // first tick completes immediately
            let _ = ticker.tick().await;
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let Some(router) = router.upgrade() else {
                    break;
                };
                let swept = router.sweep_stale_agents().await;
                if !swept.is_empty() {
                    info!(swept = swept.len(), "staleness sweep");
                }
            }
            debug!("staleness sweep stopped");
        })
    }
}
