//! Agent-side events: login, presence, heartbeat, signalling relay.

use serde_json::{Value, json};
use tracing::{debug, info, instrument, warn};

use greeter_core::protocol::{
    AgentAwayPayload, AgentLogin, AgentStatus, AgentStatusPayload, CancelReason, EndReason, OutboundEvent,
    WebrtcSignalPayload,
};
use greeter_core::{AgentId, ConnectionId, RequestId};
use greeter_registry::{AgentProfile, CallRequestState, Party, SessionRegistry};

use super::{EventRouter, agent_sender, now, to_agent, to_visitor};
use crate::error::{Result, RouterError};
use crate::notifier::Outbox;
use crate::side_effects::SideEffect;

impl EventRouter {
    /// `AGENT_LOGIN`: verify, load pools, register.
    ///
    /// A login inside the disconnect grace period resumes the old session
    /// with its previous status; a fresh session starts `away`.
    #[instrument(skip_all, fields(conn_id = %conn, agent_id = %login.agent_id))]
    pub(super) async fn agent_login(&self, conn: &ConnectionId, login: AgentLogin) -> Result<Value> {
        match self.inspect(|reg| reg.party_for_connection(conn).cloned()) {
            Some(Party::Visitor(_)) => {
                return Err(RouterError::InvalidMessage("visitor connections cannot log in as agents".into()));
            }
            Some(Party::Agent(current)) if current != login.agent_id => {
                return Err(RouterError::InvalidMessage(format!(
                    "connection is already logged in as agent {current}"
                )));
            }
            _ => {}
        }

        let verification = self
            .collaborators
            .auth
            .verify_agent_token(&login.token, &login.agent_id)
            .await?;
        if !verification.valid {
            warn!("agent token rejected");
            return Err(RouterError::AuthInvalidToken(
                verification.error.unwrap_or_else(|| "token rejected".into()),
            ));
        }
        let memberships = self
            .collaborators
            .pools
            .fetch_agent_pool_memberships(&login.agent_id)
            .await?;
        let catalogue = match &verification.organization_id {
            Some(org_id) => Some(self.collaborators.pools.fetch_org_pools(org_id).await?),
            None => None,
        };
        if !self.notifier.is_connected(conn) {
            debug!("connection closed while logging in");
            return Ok(json!({}));
        }

        let (result, out) = self.with_registry(|reg, out| -> Result<Value> {
            if let (Some(org_id), Some(configs)) = (&verification.organization_id, catalogue) {
                let loaded = reg.load_pools(org_id, configs)?;
                debug!(org_id = %org_id, pools = loaded, "pool catalogue loaded");
            }
            let profile = AgentProfile {
                agent_id: login.agent_id.clone(),
                org_id: verification.organization_id.clone(),
                display_name: login.display_name.unwrap_or_else(|| login.agent_id.to_string()),
                avatar_url: login.avatar_url,
                video_url: login.video_url,
                max_simultaneous_simulations: login
                    .max_simultaneous_simulations
                    .unwrap_or(self.settings.default_max_simulations),
            };
            let registration = reg.register_agent(conn.clone(), profile, memberships, now());
            let agent_id = registration.session.agent_id().clone();
            let status = registration.session.status;

            if self.grace.cancel(&agent_id) {
                info!(status = status.as_str(), "agent reconnected within grace period");
            }
            if let Some(old) = registration.replaced_connection.clone() {
                info!(old_conn = %old, "agent logged in elsewhere, closing previous connection");
                out.close(old);
            }
            if !registration.reconnected && registration.replaced_connection.is_none() {
                self.effect(SideEffect::SessionStarted(agent_id.clone()));
            }
            self.effect(SideEffect::StatusChange {
                agent_id: agent_id.clone(),
                status,
                reason: if registration.reconnected { "reconnected" } else { "login" }.into(),
            });

            let stats = reg.get_agent_stats(&agent_id).unwrap_or_default();
            out.send(conn, OutboundEvent::LoginSuccess {
                agent_id: agent_id.clone(),
                status,
                reconnected: registration.reconnected,
                stats,
            });
            if status == AgentStatus::Idle {
                self.backfill(reg, out, &agent_id);
            }
            info!(reconnected = registration.reconnected, "agent logged in");
            Ok(json!({
                "agentId": agent_id,
                "status": status,
                "reconnected": registration.reconnected,
            }))
        });
        self.flush(out).await;
        result
    }

    /// `AGENT_STATUS`. `offline` is an explicit logout; `in_call` is only
    /// ever set by accepting a call.
    #[instrument(skip_all, fields(conn_id = %conn, status = payload.status.as_str()))]
    pub(super) async fn agent_status(&self, conn: &ConnectionId, payload: AgentStatusPayload) -> Result<Value> {
        let (result, out) = self.with_registry(|reg, out| -> Result<AgentStatus> {
            let agent_id = agent_sender(reg, conn)?;
            match payload.status {
                AgentStatus::Offline => {
                    info!(agent_id = %agent_id, "agent logged out");
                    self.remove_agent(reg, out, &agent_id, EndReason::Agent, "logout");
                    Ok(AgentStatus::Offline)
                }
                AgentStatus::InCall => Err(RouterError::InvalidMessage(
                    "in_call is set by accepting a call".into(),
                )),
                AgentStatus::Away => self.go_away(reg, out, &agent_id, "manual").map(|_| AgentStatus::Away),
                AgentStatus::Idle => self.go_idle(reg, out, &agent_id, "manual").map(|_| AgentStatus::Idle),
            }
        });
        self.flush(out).await;
        Ok(json!({ "status": result? }))
    }

    /// `AGENT_AWAY`. Always acknowledged with the resulting status.
    #[instrument(skip_all, fields(conn_id = %conn))]
    pub(super) async fn agent_away(&self, conn: &ConnectionId, payload: AgentAwayPayload) -> Result<Value> {
        let reason = payload.reason.unwrap_or_else(|| "away".into());
        let (result, out) = self.with_registry(|reg, out| -> Result<()> {
            let agent_id = agent_sender(reg, conn)?;
            let _ = self.go_away(reg, out, &agent_id, &reason)?;
            Ok(())
        });
        self.flush(out).await;
        result?;
        Ok(json!({ "status": AgentStatus::Away }))
    }

    /// `AGENT_BACK`. An agent on a call stays `in_call`.
    #[instrument(skip_all, fields(conn_id = %conn))]
    pub(super) async fn agent_back(&self, conn: &ConnectionId) -> Result<Value> {
        let (result, out) = self.with_registry(|reg, out| -> Result<AgentStatus> {
            let agent_id = agent_sender(reg, conn)?;
            if reg.get_active_call_by_agent_id(&agent_id).is_some() {
                return Ok(AgentStatus::InCall);
            }
            let _ = self.go_idle(reg, out, &agent_id, "back")?;
            Ok(AgentStatus::Idle)
        });
        self.flush(out).await;
        Ok(json!({ "status": result? }))
    }

    /// `WEBRTC_SIGNAL`: relay to the other party of the sender's call or
    /// ringing request. No state changes.
    pub(super) async fn webrtc_signal(&self, conn: &ConnectionId, payload: WebrtcSignalPayload) -> Result<Value> {
        let (result, out) = self.with_registry(|reg, out| -> Result<()> {
            let party = reg
                .party_for_connection(conn)
                .cloned()
                .ok_or(RouterError::NoActiveCall)?;
            match party {
                Party::Visitor(visitor_id) => {
                    let peer = reg
                        .get_active_call_by_visitor_id(&visitor_id)
                        .map(|c| c.agent_id.clone())
                        .or_else(|| {
                            reg.get_requests_for_visitor(&visitor_id)
                                .into_iter()
                                .find(|r| r.state == CallRequestState::Ringing)
                                .map(|r| r.agent_id.clone())
                        })
                        .ok_or(RouterError::NoActiveCall)?;
                    to_agent(reg, out, &peer, OutboundEvent::WebrtcSignal {
                        from: visitor_id.to_string(),
                        signal: payload.signal,
                    });
                }
                Party::Agent(agent_id) => {
                    let peer = match reg.get_active_call_by_agent_id(&agent_id) {
                        Some(call) => call.visitor_id.clone(),
                        None => {
                            let ringing: Vec<_> = reg
                                .get_requests_for_agent(&agent_id)
                                .into_iter()
                                .filter(|r| r.state == CallRequestState::Ringing)
                                .map(|r| r.visitor_id.clone())
                                .collect();
                            match <[_; 1]>::try_from(ringing) {
                                Ok([visitor_id]) => visitor_id,
                                Err(_) => return Err(RouterError::NoActiveCall),
                            }
                        }
                    };
                    to_visitor(reg, out, &peer, OutboundEvent::WebrtcSignal {
                        from: agent_id.to_string(),
                        signal: payload.signal,
                    });
                }
            }
            Ok(())
        });
        self.flush(out).await;
        result?;
        Ok(json!({}))
    }

    /// `heartbeat`. Only agents are tracked; visitors rely on socket pings.
    pub(super) fn heartbeat(&self, conn: &ConnectionId) -> Value {
        let mut reg = self.registry.lock();
        if let Some(Party::Agent(agent_id)) = reg.party_for_connection(conn).cloned() {
            if let Err(error) = reg.record_heartbeat(&agent_id, now()) {
                debug!(agent_id = %agent_id, %error, "heartbeat for unknown agent");
            }
        }
        json!({})
    }

    // ── Presence transitions ────────────────────────────────────────

    /// Move an agent to `away`: ringing requests go back to the queue and
    /// watching visitors are moved to other agents. Returns the previous
    /// status.
    pub(super) fn go_away(
        &self,
        reg: &mut SessionRegistry,
        out: &mut Outbox,
        agent_id: &AgentId,
        reason: &str,
    ) -> Result<AgentStatus> {
        let previous = reg.update_status(agent_id, AgentStatus::Away)?;

        let ringing: Vec<RequestId> = reg
            .get_requests_for_agent(agent_id)
            .into_iter()
            .filter(|r| r.state == CallRequestState::Ringing)
            .map(|r| r.request_id.clone())
            .collect();
        for request_id in ringing {
            let _ = reg.requeue(&request_id)?;
            let _ = self.rna.cancel(&request_id);
            to_agent(reg, out, agent_id, OutboundEvent::CallCancelled {
                request_id,
                reason: CancelReason::Requeued,
            });
        }

        let outcome = reg.reassign_visitors(agent_id, None);
        if !outcome.is_empty() {
            debug!(
                agent_id = %agent_id,
                reassigned = outcome.reassigned.len(),
                unassigned = outcome.unassigned.len(),
                "visitors moved off away agent"
            );
        }
        Self::announce_reassignment(reg, out, agent_id, outcome);

        if previous != AgentStatus::Away {
            self.effect(SideEffect::StatusChange {
                agent_id: agent_id.clone(),
                status: AgentStatus::Away,
                reason: reason.to_owned(),
            });
        }
        info!(agent_id = %agent_id, reason, "agent away");
        Ok(previous)
    }

    /// Move an agent to `idle` and backfill it. Returns the previous status.
    pub(super) fn go_idle(
        &self,
        reg: &mut SessionRegistry,
        out: &mut Outbox,
        agent_id: &AgentId,
        reason: &str,
    ) -> Result<AgentStatus> {
        let previous = reg.update_status(agent_id, AgentStatus::Idle)?;
        if previous != AgentStatus::Idle {
            self.effect(SideEffect::StatusChange {
                agent_id: agent_id.clone(),
                status: AgentStatus::Idle,
                reason: reason.to_owned(),
            });
            info!(agent_id = %agent_id, reason, "agent available");
        }
        out.touch(agent_id);
        self.backfill(reg, out, agent_id);
        Ok(previous)
    }
}
