//! Call admission: requests and active calls.
//!
//! ```text
//! (none) ──create──▶ waiting ──mark_ringing──▶ ringing ──accept──▶ accepted ─▶ ActiveCall
//!                       │  ▲                      │ └──reject──▶ rejected
//!                       │  └──────requeue─────────┤ └──missed──▶ missed
//!                       └──────────cancel─────────┴────────────▶ cancelled
//! ```
//!
//! Terminal requests leave the map; the operation that terminated them
//! returns the final snapshot.

use std::time::Instant;

use chrono::Utc;

use greeter_core::protocol::AgentStatus;
use greeter_core::{AgentId, CallId, RequestId, VisitorId};

use crate::error::{RegistryError, Result};
use crate::model::{Accepted, ActiveCall, CallRequest, CallRequestState};
use crate::registry::SessionRegistry;

impl SessionRegistry {
    /// Open a `waiting` request from `visitor_id` to `agent_id`.
    pub fn create_call_request(
        &mut self,
        visitor_id: &VisitorId,
        agent_id: &AgentId,
        now: Instant,
    ) -> Result<CallRequest> {
        let visitor = self
            .visitors
            .get(visitor_id)
            .ok_or_else(|| RegistryError::VisitorNotFound(visitor_id.clone()))?;
        if !self.agents.contains_key(agent_id) {
            return Err(RegistryError::AgentNotFound(agent_id.clone()));
        }
        let request = CallRequest {
            request_id: RequestId::new(),
            visitor_id: visitor_id.clone(),
            agent_id: agent_id.clone(),
            org_id: visitor.org_id.clone(),
            page_url: visitor.page_url.clone(),
            created_at: now,
            state: CallRequestState::Waiting,
        };
        let _ = self.requests.insert(request.request_id.clone(), request.clone());
        self.settle_visitor(visitor_id);
        Ok(request)
    }

    /// Look up a live (non-terminal) request.
    pub fn get_call_request(&self, request_id: &RequestId) -> Option<&CallRequest> {
        self.requests.get(request_id)
    }

    /// `waiting → ringing`. Ringing again is a no-op.
    pub fn mark_ringing(&mut self, request_id: &RequestId) -> Result<CallRequest> {
        let request = self.live_request_mut(request_id)?;
        request.state = CallRequestState::Ringing;
        Ok(request.clone())
    }

    /// `ringing → waiting`, used when the agent becomes busy.
    pub fn requeue(&mut self, request_id: &RequestId) -> Result<CallRequest> {
        let request = self.live_request_mut(request_id)?;
        request.state = CallRequestState::Waiting;
        Ok(request.clone())
    }

    /// `ringing → accepted`, creating the [`ActiveCall`].
    ///
    /// The agent goes `in_call`, the caller is attached to the agent, every
    /// other visitor watching the agent is reassigned, and the agent's other
    /// ringing requests go back to `waiting`.
    pub fn accept_call(&mut self, request_id: &RequestId) -> Result<Accepted> {
        let request = self.expect_state(request_id, "accept", &[CallRequestState::Ringing])?;
        let (visitor_id, agent_id) = (request.visitor_id.clone(), request.agent_id.clone());
        if !self.visitors.contains_key(&visitor_id) {
            return Err(RegistryError::VisitorNotFound(visitor_id));
        }
        if !self.agents.contains_key(&agent_id) {
            return Err(RegistryError::AgentNotFound(agent_id));
        }
        if self.get_active_call_by_agent_id(&agent_id).is_some() {
            return Err(RegistryError::AlreadyInCall(agent_id.to_string()));
        }
        if self.get_active_call_by_visitor_id(&visitor_id).is_some() {
            return Err(RegistryError::AlreadyInCall(visitor_id.to_string()));
        }

        let mut request = self
            .requests
            .remove(request_id)
            .ok_or_else(|| RegistryError::RequestNotFound(request_id.clone()))?;
        request.state = CallRequestState::Accepted;

        let displaced = self.reassign_visitors(&agent_id, Some(&visitor_id));

        let previous_agent_id = match self.visitors.get(&visitor_id).and_then(|v| v.assigned_agent_id.clone()) {
            Some(current) if current == agent_id => None,
            other => {
                let _ = self.detach_visitor(&visitor_id);
                other
            }
        };
        if let Some(agent) = self.agents.get_mut(&agent_id) {
            let _ = agent.current_simulations.insert(visitor_id.clone());
            agent.status = AgentStatus::InCall;
        }
        if let Some(visitor) = self.visitors.get_mut(&visitor_id) {
            visitor.assigned_agent_id = Some(agent_id.clone());
        }

        let call = ActiveCall {
            call_id: CallId::new(),
            request_id: request.request_id.clone(),
            visitor_id: visitor_id.clone(),
            agent_id: agent_id.clone(),
            started_at: Utc::now(),
        };
        let _ = self.calls.insert(call.call_id.clone(), call.clone());

        let mut requeued: Vec<RequestId> = self
            .requests
            .values()
            .filter(|r| r.agent_id == agent_id && r.state == CallRequestState::Ringing)
            .map(|r| r.request_id.clone())
            .collect();
        requeued.sort();
        for id in &requeued {
            let _ = self.requeue(id);
        }

        self.settle_visitor(&visitor_id);
        Ok(Accepted {
            request,
            call,
            displaced,
            previous_agent_id,
            requeued,
        })
    }

    /// `ringing → rejected`.
    pub fn reject_call(&mut self, request_id: &RequestId) -> Result<CallRequest> {
        self.terminate(request_id, "reject", &[CallRequestState::Ringing], CallRequestState::Rejected)
    }

    /// `waiting | ringing → cancelled`.
    pub fn cancel_call(&mut self, request_id: &RequestId) -> Result<CallRequest> {
        self.terminate(
            request_id,
            "cancel",
            &[CallRequestState::Waiting, CallRequestState::Ringing],
            CallRequestState::Cancelled,
        )
    }

    /// `ringing → missed`.
    pub fn mark_missed(&mut self, request_id: &RequestId) -> Result<CallRequest> {
        self.terminate(request_id, "miss", &[CallRequestState::Ringing], CallRequestState::Missed)
    }

    /// Tear down an active call. The agent goes back to `idle` (unless it
    /// already moved on, e.g. to `offline`); the visitor keeps watching it.
    pub fn end_call(&mut self, call_id: &CallId) -> Result<ActiveCall> {
        let call = self
            .calls
            .remove(call_id)
            .ok_or_else(|| RegistryError::CallNotFound(call_id.clone()))?;
        if let Some(agent) = self.agents.get_mut(&call.agent_id) {
            if agent.status == AgentStatus::InCall {
                agent.status = AgentStatus::Idle;
            }
        }
        self.settle_visitor(&call.visitor_id);
        Ok(call)
    }

    /// Look up an active call.
    pub fn get_active_call(&self, call_id: &CallId) -> Option<&ActiveCall> {
        self.calls.get(call_id)
    }

    /// The visitor's active call.
    pub fn get_active_call_by_visitor_id(&self, visitor_id: &VisitorId) -> Option<&ActiveCall> {
        self.calls.values().find(|c| &c.visitor_id == visitor_id)
    }

    /// The agent's active call.
    pub fn get_active_call_by_agent_id(&self, agent_id: &AgentId) -> Option<&ActiveCall> {
        self.calls.values().find(|c| &c.agent_id == agent_id)
    }

    /// The visitor's live requests, oldest first.
    pub fn get_requests_for_visitor(&self, visitor_id: &VisitorId) -> Vec<&CallRequest> {
        let mut out: Vec<&CallRequest> = self
            .requests
            .values()
            .filter(|r| &r.visitor_id == visitor_id)
            .collect();
        out.sort_by(|a, b| (a.created_at, &a.request_id).cmp(&(b.created_at, &b.request_id)));
        out
    }

    /// Live requests targeting the agent, oldest first.
    pub fn get_requests_for_agent(&self, agent_id: &AgentId) -> Vec<&CallRequest> {
        let mut out: Vec<&CallRequest> = self
            .requests
            .values()
            .filter(|r| &r.agent_id == agent_id)
            .collect();
        out.sort_by(|a, b| (a.created_at, &a.request_id).cmp(&(b.created_at, &b.request_id)));
        out
    }

    /// Requests queued for the agent and not yet ringing, oldest first.
    pub fn get_waiting_requests_for_agent(&self, agent_id: &AgentId) -> Vec<&CallRequest> {
        self.get_requests_for_agent(agent_id)
            .into_iter()
            .filter(|r| r.state == CallRequestState::Waiting)
            .collect()
    }

    /// Oldest waiting request for the agent.
    pub fn get_next_waiting_request(&self, agent_id: &AgentId) -> Option<&CallRequest> {
        self.get_waiting_requests_for_agent(agent_id).into_iter().next()
    }

    fn live_request_mut(&mut self, request_id: &RequestId) -> Result<&mut CallRequest> {
        self.requests
            .get_mut(request_id)
            .ok_or_else(|| RegistryError::RequestNotFound(request_id.clone()))
    }

    fn expect_state(
        &self,
        request_id: &RequestId,
        action: &'static str,
        allowed: &[CallRequestState],
    ) -> Result<&CallRequest> {
        let request = self
            .requests
            .get(request_id)
            .ok_or_else(|| RegistryError::RequestNotFound(request_id.clone()))?;
        if allowed.contains(&request.state) {
            Ok(request)
        } else {
            Err(RegistryError::InvalidTransition {
                request_id: request_id.clone(),
                action,
                state: request.state.as_str(),
            })
        }
    }

    fn terminate(
        &mut self,
        request_id: &RequestId,
        action: &'static str,
        allowed: &[CallRequestState],
        to: CallRequestState,
    ) -> Result<CallRequest> {
        let _ = self.expect_state(request_id, action, allowed)?;
        let mut request = self
            .requests
            .remove(request_id)
            .ok_or_else(|| RegistryError::RequestNotFound(request_id.clone()))?;
        request.state = to;
        self.settle_visitor(&request.visitor_id);
        Ok(request)
    }
}
