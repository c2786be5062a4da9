//! Visitors, agents, pools and routing.
//!
//! Call admission lives in [`crate::calls`] as a second `impl` block on the
//! same type. Every public method leaves the registry consistent:
//!
//! - a visitor's `assigned_agent_id` names an agent whose
//!   `current_simulations` contains that visitor, and vice versa
//! - no agent shows more simulations than its capacity
//! - at most one active call exists per visitor and per agent

use std::cmp::Reverse;
use std::collections::{BTreeSet, HashMap};
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::debug;

use greeter_core::protocol::{AgentStats, AgentStatus, Location};
use greeter_core::{AgentId, CallId, ConnectionId, OrgId, PoolId, RequestId, VisitorId};

use crate::error::{RegistryError, Result};
use crate::matching::PageLocation;
use crate::model::{
    ActiveCall, AgentProfile, AgentRegistration, AgentSession, CallRequest, CallRequestState,
    InteractionState, Party, Pool, PoolConfig, PoolMembership, Reassignment, RoutingRule, Visitor,
};

/// Data a visitor brings to [`SessionRegistry::register_visitor`].
#[derive(Clone, Debug)]
pub struct NewVisitor {
    /// Id the widget remembered from an earlier page, if any.
    pub visitor_id: Option<VisitorId>,
    /// Organization.
    pub org_id: OrgId,
    /// Current page.
    pub page_url: String,
    /// Client IP.
    pub ip_address: Option<String>,
    /// Resolved location.
    pub location: Option<Location>,
}

/// An agent chosen for a visitor.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AgentMatch {
    /// Chosen agent.
    pub agent_id: AgentId,
    /// Pool the page routed to.
    pub pool_id: PoolId,
}

/// Agent whose socket dropped and may still come back.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PendingDisconnect {
    /// Status to restore on reconnect.
    pub previous_status: AgentStatus,
    /// When the socket dropped.
    pub disconnected_at: Instant,
}

/// Authoritative in-memory routing state.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    pub(crate) visitors: HashMap<VisitorId, Visitor>,
    pub(crate) agents: HashMap<AgentId, AgentSession>,
    pub(crate) connections: HashMap<ConnectionId, Party>,
    pub(crate) pools: HashMap<PoolId, Pool>,
    pub(crate) requests: HashMap<RequestId, CallRequest>,
    pub(crate) calls: HashMap<CallId, ActiveCall>,
    pub(crate) pending_disconnects: HashMap<AgentId, PendingDisconnect>,
    seq: u64,
}

impl SessionRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    // ── Connections ─────────────────────────────────────────────────

    /// Who owns `conn`.
    pub fn party_for_connection(&self, conn: &ConnectionId) -> Option<&Party> {
        self.connections.get(conn)
    }

    fn unlink_connection(&mut self, conn: &ConnectionId, party: &Party) {
        if self.connections.get(conn) == Some(party) {
            let _ = self.connections.remove(conn);
        }
    }

    // ── Visitors ────────────────────────────────────────────────────

    /// Create a visitor, or resume it on a new socket when the id is known.
    ///
    /// A missing id yields a freshly minted one.
    pub fn register_visitor(&mut self, conn: ConnectionId, join: NewVisitor) -> Visitor {
        let visitor_id = join.visitor_id.unwrap_or_default();
        let party = Party::Visitor(visitor_id.clone());

        if let Some(existing) = self.visitors.get(&visitor_id) {
            let old_conn = existing.connection_id.clone();
            if old_conn != conn {
                self.unlink_connection(&old_conn, &party);
            }
        }

        let seq = self.next_seq();
        let visitor = self
            .visitors
            .entry(visitor_id.clone())
            .and_modify(|v| {
                v.connection_id = conn.clone();
                v.page_url.clone_from(&join.page_url);
                if join.ip_address.is_some() {
                    v.ip_address.clone_from(&join.ip_address);
                }
                if join.location.is_some() {
                    v.location.clone_from(&join.location);
                }
            })
            .or_insert_with(|| Visitor {
                visitor_id: visitor_id.clone(),
                org_id: join.org_id.clone(),
                page_url: join.page_url.clone(),
                connection_id: conn.clone(),
                ip_address: join.ip_address.clone(),
                location: join.location.clone(),
                connected_at: Utc::now(),
                assigned_agent_id: None,
                pool_id: None,
                interaction_state: InteractionState::Unassigned,
                has_interacted: false,
                seq,
            })
            .clone();

        let _ = self.connections.insert(conn, party);
        debug!(visitor_id = %visitor_id, "visitor registered");
        visitor
    }

    /// Remove a visitor and everything hanging off it.
    ///
    /// Live requests are dropped and an active call is closed without
    /// notification; callers that need to notify do so first.
    pub fn unregister_visitor(&mut self, visitor_id: &VisitorId) -> Option<Visitor> {
        let _ = self.detach_visitor(visitor_id);
        let visitor = self.visitors.remove(visitor_id)?;
        self.unlink_connection(&visitor.connection_id, &Party::Visitor(visitor_id.clone()));
        self.requests.retain(|_, r| &r.visitor_id != visitor_id);
        let orphaned: Vec<CallId> = self
            .calls
            .values()
            .filter(|c| &c.visitor_id == visitor_id)
            .map(|c| c.call_id.clone())
            .collect();
        for call_id in orphaned {
            let _ = self.end_call(&call_id);
        }
        Some(visitor)
    }

    /// Look up a visitor.
    pub fn visitor(&self, visitor_id: &VisitorId) -> Option<&Visitor> {
        self.visitors.get(visitor_id)
    }

    /// Record a page navigation and re-resolve the visitor's pool.
    ///
    /// Returns the pool the new page routes to. The assignment is untouched.
    pub fn update_visitor_page(&mut self, visitor_id: &VisitorId, page_url: &str) -> Result<Option<PoolId>> {
        let org_id = self
            .visitors
            .get(visitor_id)
            .map(|v| v.org_id.clone())
            .ok_or_else(|| RegistryError::VisitorNotFound(visitor_id.clone()))?;
        let pool_id = self.match_path_to_pool(&org_id, page_url);
        if let Some(visitor) = self.visitors.get_mut(visitor_id) {
            page_url.clone_into(&mut visitor.page_url);
            visitor.pool_id.clone_from(&pool_id);
        }
        Ok(pool_id)
    }

    /// Mark the visitor as engaged. Returns `true` on the first interaction.
    pub fn record_interaction(&mut self, visitor_id: &VisitorId) -> Result<bool> {
        let visitor = self
            .visitors
            .get_mut(visitor_id)
            .ok_or_else(|| RegistryError::VisitorNotFound(visitor_id.clone()))?;
        let first = !visitor.has_interacted;
        visitor.has_interacted = true;
        Ok(first)
    }

    /// Unassigned visitors of `org`, oldest registration first.
    pub fn unassigned_visitors(&self, org_id: &OrgId) -> Vec<VisitorId> {
        let mut waiting: Vec<&Visitor> = self
            .visitors
            .values()
            .filter(|v| &v.org_id == org_id && v.assigned_agent_id.is_none())
            .filter(|v| v.interaction_state == InteractionState::Unassigned)
            .collect();
        waiting.sort_by_key(|v| v.seq);
        waiting.into_iter().map(|v| v.visitor_id.clone()).collect()
    }

    /// Recompute a visitor's funnel state from the maps.
    pub(crate) fn settle_visitor(&mut self, visitor_id: &VisitorId) {
        let in_call = self.calls.values().any(|c| &c.visitor_id == visitor_id);
        let requested = self.requests.values().any(|r| &r.visitor_id == visitor_id);
        if let Some(visitor) = self.visitors.get_mut(visitor_id) {
            visitor.interaction_state = if in_call {
                InteractionState::InCall
            } else if requested {
                InteractionState::CallRequested
            } else if visitor.assigned_agent_id.is_some() {
                InteractionState::WatchingSimulation
            } else {
                InteractionState::Unassigned
            };
        }
    }

    /// Drop the visitor from its agent's simulations.
    pub(crate) fn detach_visitor(&mut self, visitor_id: &VisitorId) -> Option<AgentId> {
        let previous = self.visitors.get_mut(visitor_id)?.assigned_agent_id.take()?;
        if let Some(agent) = self.agents.get_mut(&previous) {
            let _ = agent.current_simulations.remove(visitor_id);
        }
        Some(previous)
    }

    // ── Agents ──────────────────────────────────────────────────────

    /// Log an agent in, or resume its session.
    ///
    /// A session inside its disconnect grace period gets its pre-disconnect
    /// status back; a brand-new session starts `away`.
    pub fn register_agent(
        &mut self,
        conn: ConnectionId,
        mut profile: AgentProfile,
        mut memberships: Vec<PoolMembership>,
        now: Instant,
    ) -> AgentRegistration {
        memberships.sort_by_key(|m| m.priority_rank);
        let agent_id = profile.agent_id.clone();
        let party = Party::Agent(agent_id.clone());
        let pending = self.pending_disconnects.remove(&agent_id);

        let mut replaced_connection = None;
        if let Some(existing) = self.agents.get(&agent_id) {
            let old_conn = existing.connection_id.clone();
            if old_conn != conn {
                self.unlink_connection(&old_conn, &party);
                if pending.is_none() {
                    replaced_connection = Some(old_conn);
                }
            }
        }

        let seq = self.next_seq();
        let session = match self.agents.get_mut(&agent_id) {
            Some(session) => {
                // never below the number of visitors already watching
                profile.max_simultaneous_simulations = profile
                    .max_simultaneous_simulations
                    .max(session.current_simulations.len());
                session.profile = profile;
                session.connection_id = conn.clone();
                session.pool_memberships = memberships;
                session.last_heartbeat_at = now;
                if let Some(p) = pending {
                    session.status = p.previous_status;
                }
                session.clone()
            }
            None => {
                profile.max_simultaneous_simulations = profile.max_simultaneous_simulations.max(1);
                let session = AgentSession {
                    profile,
                    connection_id: conn.clone(),
                    status: AgentStatus::Away,
                    current_simulations: BTreeSet::new(),
                    pool_memberships: memberships,
                    last_heartbeat_at: now,
                    connected_at: Utc::now(),
                    registration_seq: seq,
                };
                let _ = self.agents.insert(agent_id.clone(), session.clone());
                session
            }
        };

        let _ = self.connections.insert(conn, party);
        debug!(agent_id = %agent_id, reconnected = pending.is_some(), "agent registered");
        AgentRegistration {
            session,
            reconnected: pending.is_some(),
            replaced_connection,
        }
    }

    /// Remove an agent. Returns the visitors that were watching it, now
    /// unassigned and ready for reassignment.
    pub fn unregister_agent(&mut self, agent_id: &AgentId) -> Vec<VisitorId> {
        let _ = self.pending_disconnects.remove(agent_id);
        let Some(session) = self.agents.remove(agent_id) else {
            return Vec::new();
        };
        self.unlink_connection(&session.connection_id, &Party::Agent(agent_id.clone()));
        let orphaned: Vec<VisitorId> = session.current_simulations.into_iter().collect();
        for visitor_id in &orphaned {
            if let Some(visitor) = self.visitors.get_mut(visitor_id) {
                visitor.assigned_agent_id = None;
            }
            self.settle_visitor(visitor_id);
        }
        debug!(agent_id = %agent_id, orphaned = orphaned.len(), "agent unregistered");
        orphaned
    }

    /// Look up an agent session.
    pub fn agent(&self, agent_id: &AgentId) -> Option<&AgentSession> {
        self.agents.get(agent_id)
    }

    /// Change an agent's status. Returns the previous one.
    pub fn update_status(&mut self, agent_id: &AgentId, status: AgentStatus) -> Result<AgentStatus> {
        let agent = self
            .agents
            .get_mut(agent_id)
            .ok_or_else(|| RegistryError::AgentNotFound(agent_id.clone()))?;
        Ok(std::mem::replace(&mut agent.status, status))
    }

    /// Refresh an agent's liveness timestamp.
    pub fn record_heartbeat(&mut self, agent_id: &AgentId, now: Instant) -> Result<()> {
        let agent = self
            .agents
            .get_mut(agent_id)
            .ok_or_else(|| RegistryError::AgentNotFound(agent_id.clone()))?;
        agent.last_heartbeat_at = now;
        Ok(())
    }

    /// Start an agent's disconnect grace period.
    ///
    /// Only the agent's current socket counts; a stale socket closing after
    /// a re-login returns `Ok(None)`. Otherwise the agent goes `offline`
    /// and the status to restore is returned.
    pub fn mark_agent_disconnected(
        &mut self,
        agent_id: &AgentId,
        conn: &ConnectionId,
        now: Instant,
    ) -> Result<Option<AgentStatus>> {
        let agent = self
            .agents
            .get_mut(agent_id)
            .ok_or_else(|| RegistryError::AgentNotFound(agent_id.clone()))?;
        if &agent.connection_id != conn {
            return Ok(None);
        }
        let previous_status = match agent.status {
            AgentStatus::InCall => AgentStatus::Idle,
            other => other,
        };
        agent.status = AgentStatus::Offline;
        let _ = self.pending_disconnects.insert(
            agent_id.clone(),
            PendingDisconnect {
                previous_status,
                disconnected_at: now,
            },
        );
        self.unlink_connection(conn, &Party::Agent(agent_id.clone()));
        Ok(Some(previous_status))
    }

    /// The agent's grace-period record, if its socket is down.
    pub fn pending_disconnect(&self, agent_id: &AgentId) -> Option<&PendingDisconnect> {
        self.pending_disconnects.get(agent_id)
    }

    /// Idle agents whose last heartbeat is older than `threshold`, in id order.
    ///
    /// Agents already away or offline are not reported. Neither are agents
    /// on a call: a silent in-call agent is left to the transport ping
    /// timeout, which ends the call through the disconnect path.
    pub fn get_stale_agents(&self, now: Instant, threshold: Duration) -> Vec<AgentId> {
        let mut stale: Vec<AgentId> = self
            .agents
            .values()
            .filter(|a| a.status == AgentStatus::Idle)
            .filter(|a| now.saturating_duration_since(a.last_heartbeat_at) > threshold)
            .map(|a| a.profile.agent_id.clone())
            .collect();
        stale.sort();
        stale
    }

    /// Dashboard counters for an agent.
    pub fn get_agent_stats(&self, agent_id: &AgentId) -> Option<AgentStats> {
        let agent = self.agents.get(agent_id)?;
        let (mut waiting, mut ringing) = (0, 0);
        for r in self.requests.values().filter(|r| &r.agent_id == agent_id) {
            match r.state {
                CallRequestState::Waiting => waiting += 1,
                CallRequestState::Ringing => ringing += 1,
                _ => {}
            }
        }
        Some(AgentStats {
            watching: agent.current_simulations.len(),
            waiting,
            ringing,
            in_call: self.calls.values().any(|c| &c.agent_id == agent_id),
            max_simulations: agent.profile.max_simultaneous_simulations,
        })
    }

    // ── Pools and routing ───────────────────────────────────────────

    /// Replace the pool catalogue of `org`. Nothing changes if any rule
    /// fails to compile.
    pub fn load_pools(&mut self, org_id: &OrgId, configs: Vec<PoolConfig>) -> Result<usize> {
        let compiled = configs
            .into_iter()
            .filter(|c| &c.org_id == org_id)
            .map(Pool::compile)
            .collect::<Result<Vec<_>>>()?;
        self.pools.retain(|_, p| &p.org_id != org_id);
        let count = compiled.len();
        for pool in compiled {
            let _ = self.pools.insert(pool.pool_id.clone(), pool);
        }
        Ok(count)
    }

    /// Whether `org` has any pools loaded.
    pub fn has_pools(&self, org_id: &OrgId) -> bool {
        self.pools.values().any(|p| &p.org_id == org_id)
    }

    /// Resolve the pool serving `page_url`.
    ///
    /// Rules from all of the org's pools are tried highest priority first
    /// (ties by pool id); the first rule whose domain and path patterns
    /// both match wins. Failing that, the org's catch-all pool.
    pub fn match_path_to_pool(&self, org_id: &OrgId, page_url: &str) -> Option<PoolId> {
        let page = PageLocation::parse(page_url);
        let mut org_pools: Vec<&Pool> = self.pools.values().filter(|p| &p.org_id == org_id).collect();
        org_pools.sort_by(|a, b| a.pool_id.cmp(&b.pool_id));

        let mut rules: Vec<(i32, &PoolId, &RoutingRule)> = org_pools
            .iter()
            .flat_map(|p| p.rules.iter().map(move |r| (r.priority, &p.pool_id, r)))
            .collect();
        rules.sort_by_key(|(priority, pool_id, _)| (Reverse(*priority), *pool_id));

        rules
            .into_iter()
            .find(|(_, _, rule)| rule.matches(&page))
            .map(|(_, pool_id, _)| pool_id.clone())
            .or_else(|| {
                org_pools
                    .iter()
                    .find(|p| p.is_catch_all)
                    .map(|p| p.pool_id.clone())
            })
    }

    /// Best agent for a visitor on `page_url`.
    ///
    /// Tiers are scanned in ascending `priority_rank`; inside a tier the
    /// idle agent with spare capacity and the fewest simulations wins, then
    /// the earliest registered.
    pub fn find_best_agent_for_visitor(&self, org_id: &OrgId, page_url: &str) -> Option<AgentMatch> {
        self.find_best_agent_excluding(org_id, page_url, &[])
    }

    /// [`Self::find_best_agent_for_visitor`] ignoring the agents in `exclude`.
    pub fn find_best_agent_excluding(
        &self,
        org_id: &OrgId,
        page_url: &str,
        exclude: &[AgentId],
    ) -> Option<AgentMatch> {
        let pool_id = self.match_path_to_pool(org_id, page_url)?;
        self.agents
            .values()
            .filter(|a| !exclude.contains(a.agent_id()))
            .filter(|a| a.status == AgentStatus::Idle && a.has_capacity())
            .filter_map(|a| a.rank_in(&pool_id).map(|rank| (rank, a)))
            .min_by_key(|(rank, a)| (*rank, a.current_simulations.len(), a.registration_seq))
            .map(|(_, a)| AgentMatch {
                agent_id: a.profile.agent_id.clone(),
                pool_id: pool_id.clone(),
            })
    }

    /// Show `agent_id`'s simulation to `visitor_id`, moving the visitor off
    /// any previous agent.
    pub fn assign_visitor_to_agent(&mut self, visitor_id: &VisitorId, agent_id: &AgentId) -> Result<()> {
        let visitor = self
            .visitors
            .get(visitor_id)
            .ok_or_else(|| RegistryError::VisitorNotFound(visitor_id.clone()))?;
        if visitor.assigned_agent_id.as_ref() == Some(agent_id) {
            return Ok(());
        }
        let agent = self
            .agents
            .get(agent_id)
            .ok_or_else(|| RegistryError::AgentNotFound(agent_id.clone()))?;
        if !agent.has_capacity() {
            return Err(RegistryError::AgentAtCapacity {
                agent_id: agent_id.clone(),
                max: agent.profile.max_simultaneous_simulations,
            });
        }

        let _ = self.detach_visitor(visitor_id);
        if let Some(agent) = self.agents.get_mut(agent_id) {
            let _ = agent.current_simulations.insert(visitor_id.clone());
        }
        if let Some(visitor) = self.visitors.get_mut(visitor_id) {
            visitor.assigned_agent_id = Some(agent_id.clone());
        }
        self.settle_visitor(visitor_id);
        Ok(())
    }

    /// Find and assign the best agent for a visitor's current page.
    ///
    /// On failure the visitor is left unassigned.
    pub fn route_visitor(&mut self, visitor_id: &VisitorId, exclude: &[AgentId]) -> Option<AgentMatch> {
        let visitor = self.visitors.get(visitor_id)?;
        let (org_id, page_url) = (visitor.org_id.clone(), visitor.page_url.clone());

        if let Some(m) = self.find_best_agent_excluding(&org_id, &page_url, exclude) {
            if self.assign_visitor_to_agent(visitor_id, &m.agent_id).is_ok() {
                if let Some(visitor) = self.visitors.get_mut(visitor_id) {
                    visitor.pool_id = Some(m.pool_id.clone());
                }
                return Some(m);
            }
        }

        let _ = self.detach_visitor(visitor_id);
        let pool_id = self.match_path_to_pool(&org_id, &page_url);
        if let Some(visitor) = self.visitors.get_mut(visitor_id) {
            visitor.pool_id = pool_id;
        }
        self.settle_visitor(visitor_id);
        None
    }

    /// Move every visitor watching `agent_id` (except `exclude`) to another
    /// agent. Visitors on a call with this agent are never moved.
    pub fn reassign_visitors(&mut self, agent_id: &AgentId, exclude: Option<&VisitorId>) -> Reassignment {
        let Some(agent) = self.agents.get(agent_id) else {
            return Reassignment::default();
        };
        let in_call_with: Option<VisitorId> = self
            .calls
            .values()
            .find(|c| &c.agent_id == agent_id)
            .map(|c| c.visitor_id.clone());
        let movers: Vec<VisitorId> = agent
            .current_simulations
            .iter()
            .filter(|v| Some(*v) != exclude && Some(*v) != in_call_with.as_ref())
            .cloned()
            .collect();

        let mut outcome = Reassignment::default();
        let exclude_agents = std::slice::from_ref(agent_id);
        for visitor_id in movers {
            let _ = self.detach_visitor(&visitor_id);
            match self.route_visitor(&visitor_id, exclude_agents) {
                Some(m) => outcome.reassigned.push((visitor_id, m.agent_id)),
                None => outcome.unassigned.push(visitor_id),
            }
        }
        outcome
    }

    // ── Introspection ───────────────────────────────────────────────

    /// Connected visitors.
    pub fn visitor_count(&self) -> usize {
        self.visitors.len()
    }

    /// Agent sessions (including those in their grace period).
    pub fn agent_count(&self) -> usize {
        self.agents.len()
    }

    /// Active calls.
    pub fn active_call_count(&self) -> usize {
        self.calls.len()
    }

    /// Describe every broken consistency rule. Empty when healthy.
    pub fn invariant_violations(&self) -> Vec<String> {
        let mut out = Vec::new();
        for v in self.visitors.values() {
            if let Some(agent_id) = &v.assigned_agent_id {
                match self.agents.get(agent_id) {
                    Some(a) if a.current_simulations.contains(&v.visitor_id) => {}
                    Some(_) => out.push(format!("{} not in {}'s simulations", v.visitor_id, agent_id)),
                    None => out.push(format!("{} assigned to missing agent {}", v.visitor_id, agent_id)),
                }
            }
        }
        for a in self.agents.values() {
            if a.current_simulations.len() > a.profile.max_simultaneous_simulations {
                out.push(format!("{} over capacity", a.profile.agent_id));
            }
            for v in &a.current_simulations {
                let back = self.visitors.get(v).and_then(|v| v.assigned_agent_id.as_ref());
                if back != Some(a.agent_id()) {
                    out.push(format!("{} lists {} which is not assigned to it", a.profile.agent_id, v));
                }
            }
        }
        let mut visitors_in_call = BTreeSet::new();
        let mut agents_in_call = BTreeSet::new();
        for c in self.calls.values() {
            if !visitors_in_call.insert(&c.visitor_id) {
                out.push(format!("{} has more than one call", c.visitor_id));
            }
            if !agents_in_call.insert(&c.agent_id) {
                out.push(format!("{} has more than one call", c.agent_id));
            }
        }
        out
    }
}
