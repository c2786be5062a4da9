//! Call admission events and the shared ring/queue/close helpers.

use std::slice;

use metrics::counter;
use serde_json::{Value, json};
use tracing::{debug, info, instrument, warn};

use greeter_core::protocol::{
    AgentStatus, CallEndPayload, CallRequestPayload, CancelReason, EndReason, OutboundEvent, RequestRef,
};
use greeter_core::{AgentId, CallId, ConnectionId, OrgId, RequestId};
use greeter_registry::{
    Accepted, ActiveCall, AgentSession, CallRequest, CallRequestState, Party, RegistryError, SessionRegistry,
};

use super::{EventRouter, agent_sender, now, to_agent, to_visitor, visitor_sender};
use crate::collaborators::CallLogEntry;
use crate::error::{Result, RouterError};
use crate::metrics::CALLS_TOTAL;
use crate::notifier::Outbox;
use crate::side_effects::SideEffect;

impl EventRouter {
    /// `CALL_REQUEST`.
    #[instrument(skip_all, fields(conn_id = %conn, agent_id = %payload.agent_id))]
    pub(super) async fn call_request(&self, conn: &ConnectionId, payload: CallRequestPayload) -> Result<Value> {
        let (result, out) = self.with_registry(|reg, out| self.open_request(reg, out, conn, &payload.agent_id));
        self.flush(out).await;
        let request = result?;
        Ok(json!({
            "requestId": request.request_id,
            "agentId": request.agent_id,
            "state": request.state,
        }))
    }

    fn open_request(
        &self,
        reg: &mut SessionRegistry,
        out: &mut Outbox,
        conn: &ConnectionId,
        requested: &AgentId,
    ) -> Result<CallRequest> {
        let visitor_id = visitor_sender(reg, conn)?;

        // A visitor re-dialling while a call is still up: end the stale call first.
        if let Some(call_id) = reg.get_active_call_by_visitor_id(&visitor_id).map(|c| c.call_id.clone()) {
            debug!(visitor_id = %visitor_id, call_id = %call_id, "ending stale call before new request");
            let _ = self.close_call(reg, out, &call_id, EndReason::Superseded)?;
        }
        let live: Vec<RequestId> = reg
            .get_requests_for_visitor(&visitor_id)
            .iter()
            .map(|r| r.request_id.clone())
            .collect();
        for request_id in live {
            let _ = self.withdraw(reg, out, &request_id, CancelReason::Superseded)?;
        }

        let (org_id, page_url) = reg
            .visitor(&visitor_id)
            .map(|v| (v.org_id.clone(), v.page_url.clone()))
            .ok_or_else(|| RegistryError::VisitorNotFound(visitor_id.clone()))?;
        let target = choose_target(reg, &org_id, &page_url, requested)?;
        if &target != requested {
            info!(requested = %requested, target = %target, "requested agent unavailable, using alternative");
        }

        let request = reg.create_call_request(&visitor_id, &target, now())?;
        self.effect(SideEffect::CreateCallLog(log_entry(&request)));
        counter!(CALLS_TOTAL, "outcome" => "requested").increment(1);
        self.ring_or_queue(reg, out, request)
    }

    /// `CALL_CANCEL`. Without a request id every live request of the
    /// visitor is withdrawn.
    #[instrument(skip_all, fields(conn_id = %conn))]
    pub(super) async fn call_cancel(&self, conn: &ConnectionId, target: RequestRef) -> Result<Value> {
        let (result, out) = self.with_registry(|reg, out| -> Result<usize> {
            let visitor_id = visitor_sender(reg, conn)?;
            let ids: Vec<RequestId> = match target.request_id {
                Some(request_id) => {
                    let owned = reg
                        .get_call_request(&request_id)
                        .is_some_and(|r| r.visitor_id == visitor_id);
                    if !owned {
                        return Err(RegistryError::RequestNotFound(request_id).into());
                    }
                    vec![request_id]
                }
                None => reg
                    .get_requests_for_visitor(&visitor_id)
                    .iter()
                    .map(|r| r.request_id.clone())
                    .collect(),
            };
            for request_id in &ids {
                let _ = self.withdraw(reg, out, request_id, CancelReason::VisitorCancelled)?;
            }
            Ok(ids.len())
        });
        self.flush(out).await;
        Ok(json!({ "cancelled": result? }))
    }

    /// `CALL_ACCEPT`.
    ///
    /// The registry transition and the displacement of other watchers happen
    /// first. The call-log update is awaited next (its id goes into
    /// `CALL_ACCEPTED`), after any queued row creation for the request, and
    /// only a call that survived the wait is announced.
    #[instrument(skip_all, fields(conn_id = %conn))]
    pub(super) async fn call_accept(&self, conn: &ConnectionId, target: RequestRef) -> Result<Value> {
        let request_id = target
            .request_id
            .ok_or_else(|| RouterError::InvalidMessage("requestId is required".into()))?;

        let (accepted, out) = self.with_registry(|reg, out| self.accept(reg, out, conn, &request_id));
        self.flush(out).await;
        let accepted = accepted?;
        let call_id = accepted.call.call_id.clone();

        // The row is opened through the side-effect queue; let it land first.
        let _ = self.side_effects.fence().await;
        self.ensure_call_log(&accepted.request).await;
        if let Err(error) = self
            .collaborators
            .call_logs
            .mark_call_accepted(&request_id, &call_id)
            .await
        {
            warn!(request_id = %request_id, %error, "failed to record accepted call");
        }
        let call_log_id = match self.collaborators.call_logs.get_call_log_id(&request_id).await {
            Ok(id) => id,
            Err(error) => {
                debug!(request_id = %request_id, %error, "call log id unavailable");
                None
            }
        };

        let (announced, out) = self.with_registry(|reg, out| -> Result<()> {
            let call = reg
                .get_active_call(&call_id)
                .cloned()
                .ok_or_else(|| RegistryError::CallNotFound(call_id.clone()))?;
            let agent = reg
                .agent(&call.agent_id)
                .map(AgentSession::card)
                .ok_or_else(|| RegistryError::AgentNotFound(call.agent_id.clone()))?;
            to_agent(reg, out, &call.agent_id, OutboundEvent::CallAccepted {
                request_id: call.request_id.clone(),
                call_id: call.call_id.clone(),
                visitor_id: call.visitor_id.clone(),
                call_log_id,
            });
            to_visitor(reg, out, &call.visitor_id, OutboundEvent::CallStarted {
                call_id: call.call_id.clone(),
                request_id: call.request_id.clone(),
                agent,
            });
            Ok(())
        });
        self.flush(out).await;
        announced?;
        Ok(json!({ "callId": call_id, "requestId": request_id }))
    }

    /// Open the call-log row directly when the queued one never landed.
    async fn ensure_call_log(&self, request: &CallRequest) {
        let logs = &self.collaborators.call_logs;
        if matches!(logs.get_call_log_id(&request.request_id).await, Ok(Some(_))) {
            return;
        }
        if let Err(error) = logs.create_call_log(&log_entry(request)).await {
            warn!(request_id = %request.request_id, %error, "failed to open call log");
        }
    }

    fn accept(
        &self,
        reg: &mut SessionRegistry,
        out: &mut Outbox,
        conn: &ConnectionId,
        request_id: &RequestId,
    ) -> Result<Accepted> {
        let agent_id = agent_sender(reg, conn)?;
        let owned = reg.get_call_request(request_id).is_some_and(|r| r.agent_id == agent_id);
        if !owned {
            return Err(RegistryError::RequestNotFound(request_id.clone()).into());
        }

        let accepted = reg.accept_call(request_id)?;
        let _ = self.rna.cancel(request_id);
        for requeued in &accepted.requeued {
            let _ = self.rna.cancel(requeued);
            to_agent(reg, out, &agent_id, OutboundEvent::CallCancelled {
                request_id: requeued.clone(),
                reason: CancelReason::Requeued,
            });
        }
        Self::announce_reassignment(reg, out, &agent_id, accepted.displaced.clone());
        if let Some(previous) = &accepted.previous_agent_id {
            out.touch(previous);
            self.backfill(reg, out, previous);
        }

        self.effect(SideEffect::StatusChange {
            agent_id: agent_id.clone(),
            status: AgentStatus::InCall,
            reason: "call_accepted".into(),
        });
        self.effect(SideEffect::CallStarted {
            org_id: accepted.request.org_id.clone(),
            visitor_id: accepted.call.visitor_id.clone(),
            agent_id: agent_id.clone(),
        });
        counter!(CALLS_TOTAL, "outcome" => "accepted").increment(1);
        info!(request_id = %request_id, call_id = %accepted.call.call_id, "call accepted");
        Ok(accepted)
    }

    /// `CALL_REJECT`.
    ///
    /// A rejected request is immediately replaced by a fresh one against
    /// the same agent; no alternative is searched. Ring-no-answer and
    /// busy-at-request both look for another agent, so this path is the odd
    /// one out (see DESIGN.md).
    #[instrument(skip_all, fields(conn_id = %conn))]
    pub(super) async fn call_reject(&self, conn: &ConnectionId, target: RequestRef) -> Result<Value> {
        let request_id = target
            .request_id
            .ok_or_else(|| RouterError::InvalidMessage("requestId is required".into()))?;

        let (result, out) = self.with_registry(|reg, out| -> Result<CallRequest> {
            let agent_id = agent_sender(reg, conn)?;
            let owned = reg.get_call_request(&request_id).is_some_and(|r| r.agent_id == agent_id);
            if !owned {
                return Err(RegistryError::RequestNotFound(request_id.clone()).into());
            }
            let rejected = reg.reject_call(&request_id)?;
            let _ = self.rna.cancel(&request_id);
            self.effect(SideEffect::CallRejected(request_id.clone()));
            counter!(CALLS_TOTAL, "outcome" => "rejected").increment(1);

            let retry = reg.create_call_request(&rejected.visitor_id, &agent_id, now())?;
            self.effect(SideEffect::CreateCallLog(log_entry(&retry)));
            debug!(rejected = %request_id, retry = %retry.request_id, "re-ringing after reject");
            self.ring_or_queue(reg, out, retry)
        });
        self.flush(out).await;
        let retry = result?;
        Ok(json!({ "requestId": request_id, "retryRequestId": retry.request_id }))
    }

    /// `CALL_END` from either party.
    #[instrument(skip_all, fields(conn_id = %conn))]
    pub(super) async fn call_end(&self, conn: &ConnectionId, payload: CallEndPayload) -> Result<Value> {
        let (result, out) = self.with_registry(|reg, out| -> Result<CallId> {
            let party = reg
                .party_for_connection(conn)
                .cloned()
                .ok_or(RouterError::NoActiveCall)?;
            let own_call = match &party {
                Party::Visitor(v) => reg.get_active_call_by_visitor_id(v),
                Party::Agent(a) => reg.get_active_call_by_agent_id(a),
            }
            .map(|c| c.call_id.clone());
            let call_id = match (payload.call_id, own_call) {
                (Some(asked), Some(own)) if asked == own => own,
                (Some(asked), _) => return Err(RegistryError::CallNotFound(asked).into()),
                (None, Some(own)) => own,
                (None, None) => return Err(RouterError::NoActiveCall),
            };
            let reason = match party {
                Party::Visitor(_) => EndReason::Visitor,
                Party::Agent(_) => EndReason::Agent,
            };
            let _ = self.close_call(reg, out, &call_id, reason)?;
            Ok(call_id)
        });
        self.flush(out).await;
        Ok(json!({ "callId": result? }))
    }

    // ── Shared helpers ──────────────────────────────────────────────

    /// Ring the request's agent if it is idle, else leave the request queued.
    pub(super) fn ring_or_queue(
        &self,
        reg: &mut SessionRegistry,
        out: &mut Outbox,
        request: CallRequest,
    ) -> Result<CallRequest> {
        out.touch(&request.agent_id);
        let idle = reg
            .agent(&request.agent_id)
            .is_some_and(|a| a.status == AgentStatus::Idle);
        if !idle {
            debug!(request_id = %request.request_id, agent_id = %request.agent_id, "agent busy, request queued");
            return Ok(request);
        }
        self.ring(reg, out, &request.request_id)
    }

    /// `waiting → ringing`: arm the RNA timer and send `CALL_INCOMING`.
    pub(super) fn ring(&self, reg: &mut SessionRegistry, out: &mut Outbox, request_id: &RequestId) -> Result<CallRequest> {
        let request = reg.mark_ringing(request_id)?;
        self.arm_rna(request.request_id.clone());
        let location = reg.visitor(&request.visitor_id).and_then(|v| v.location.clone());
        to_agent(reg, out, &request.agent_id, OutboundEvent::CallIncoming {
            request_id: request.request_id.clone(),
            visitor_id: request.visitor_id.clone(),
            page_url: request.page_url.clone(),
            location,
        });
        out.touch(&request.agent_id);
        debug!(request_id = %request.request_id, agent_id = %request.agent_id, "ringing");
        Ok(request)
    }

    /// Cancel a live request, telling the agent if it was ringing.
    pub(super) fn withdraw(
        &self,
        reg: &mut SessionRegistry,
        out: &mut Outbox,
        request_id: &RequestId,
        reason: CancelReason,
    ) -> Result<CallRequest> {
        let was_ringing = reg
            .get_call_request(request_id)
            .is_some_and(|r| r.state == CallRequestState::Ringing);
        let cancelled = reg.cancel_call(request_id)?;
        let _ = self.rna.cancel(request_id);
        if was_ringing {
            to_agent(reg, out, &cancelled.agent_id, OutboundEvent::CallCancelled {
                request_id: request_id.clone(),
                reason,
            });
        }
        self.effect(SideEffect::CallCancelled(request_id.clone()));
        counter!(CALLS_TOTAL, "outcome" => "cancelled").increment(1);
        out.touch(&cancelled.agent_id);
        if was_ringing {
            self.backfill(reg, out, &cancelled.agent_id);
        }
        Ok(cancelled)
    }

    /// End an active call, notify both parties and backfill the agent.
    pub(super) fn close_call(
        &self,
        reg: &mut SessionRegistry,
        out: &mut Outbox,
        call_id: &CallId,
        reason: EndReason,
    ) -> Result<ActiveCall> {
        let call = reg.end_call(call_id)?;
        let ended = OutboundEvent::CallEnded {
            call_id: call.call_id.clone(),
            reason,
        };
        to_visitor(reg, out, &call.visitor_id, ended.clone());
        to_agent(reg, out, &call.agent_id, ended);
        self.effect(SideEffect::CallEnded {
            request_id: call.request_id.clone(),
            call_id: call.call_id.clone(),
            reason,
        });
        counter!(CALLS_TOTAL, "outcome" => "ended").increment(1);
        info!(call_id = %call.call_id, ?reason, "call ended");

        out.touch(&call.agent_id);
        if reg
            .agent(&call.agent_id)
            .is_some_and(|a| a.status == AgentStatus::Idle)
        {
            self.effect(SideEffect::StatusChange {
                agent_id: call.agent_id.clone(),
                status: AgentStatus::Idle,
                reason: "call_ended".into(),
            });
            self.backfill(reg, out, &call.agent_id);
        }
        Ok(call)
    }

    /// An agent just became free: ring its oldest waiting request (unless
    /// something is already ringing), then route the org's unassigned
    /// visitors.
    pub(super) fn backfill(&self, reg: &mut SessionRegistry, out: &mut Outbox, agent_id: &AgentId) {
        let Some(agent) = reg.agent(agent_id) else {
            return;
        };
        if agent.status != AgentStatus::Idle {
            return;
        }
        let org_id = agent.profile.org_id.clone();

        let ringing = reg
            .get_requests_for_agent(agent_id)
            .iter()
            .any(|r| r.state == CallRequestState::Ringing);
        if !ringing {
            if let Some(next) = reg.get_next_waiting_request(agent_id).map(|r| r.request_id.clone()) {
                if let Err(error) = self.ring(reg, out, &next) {
                    warn!(request_id = %next, %error, "failed to ring queued request");
                }
            }
        }

        let Some(org_id) = org_id else {
            return;
        };
        for visitor_id in reg.unassigned_visitors(&org_id) {
            if let Some(m) = reg.route_visitor(&visitor_id, &[]) {
                debug!(visitor_id = %visitor_id, agent_id = %m.agent_id, "backfilled visitor");
                self.announce_assignment(reg, out, &visitor_id, &m);
            }
        }
    }
}

/// Pick the agent a new request should target.
///
/// An absent agent falls back to the best match for the page; a busy,
/// away or offline agent is swapped for a different eligible agent when
/// one exists, else the request queues against it.
fn choose_target(reg: &SessionRegistry, org_id: &OrgId, page_url: &str, requested: &AgentId) -> Result<AgentId> {
    match reg.agent(requested) {
        None => reg
            .find_best_agent_for_visitor(org_id, page_url)
            .map(|m| m.agent_id)
            .ok_or_else(|| RegistryError::AgentNotFound(requested.clone()).into()),
        Some(agent) if agent.profile.org_id.as_ref().is_some_and(|o| o != org_id) => Err(RouterError::Unavailable(
            format!("agent {requested} does not serve this organization"),
        )),
        Some(agent) if agent.status == AgentStatus::Idle => Ok(requested.clone()),
        Some(_) => Ok(reg
            .find_best_agent_excluding(org_id, page_url, slice::from_ref(requested))
            .map_or_else(|| requested.clone(), |m| m.agent_id)),
    }
}

pub(super) fn log_entry(request: &CallRequest) -> CallLogEntry {
    CallLogEntry {
        request_id: request.request_id.clone(),
        visitor_id: request.visitor_id.clone(),
        agent_id: request.agent_id.clone(),
        org_id: request.org_id.clone(),
        page_url: request.page_url.clone(),
    }
}
