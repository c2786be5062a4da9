//! Registry entities.

use std::collections::BTreeSet;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use greeter_core::protocol::{AgentCard, AgentStatus, Location};
use greeter_core::{AgentId, CallId, ConnectionId, OrgId, PoolId, RequestId, VisitorId};

use crate::error::{RegistryError, Result};
use crate::matching::{PageLocation, RoutePattern};

/// Who owns a connection.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Party {
    /// A visitor widget.
    Visitor(VisitorId),
    /// An agent dashboard.
    Agent(AgentId),
}

/// Where a visitor is in the greeting funnel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InteractionState {
    /// No agent available; widget hidden.
    Unassigned,
    /// Watching an agent's simulation.
    WatchingSimulation,
    /// Has a live call request.
    CallRequested,
    /// On a call.
    InCall,
}

/// A connected visitor.
#[derive(Clone, Debug)]
pub struct Visitor {
    /// Visitor id.
    pub visitor_id: VisitorId,
    /// Organization whose widget the visitor loaded.
    pub org_id: OrgId,
    /// Current page.
    pub page_url: String,
    /// Current socket.
    pub connection_id: ConnectionId,
    /// Client IP.
    pub ip_address: Option<String>,
    /// Resolved location.
    pub location: Option<Location>,
    /// First join on this server.
    pub connected_at: DateTime<Utc>,
    /// Agent whose simulation the visitor watches.
    pub assigned_agent_id: Option<AgentId>,
    /// Pool the current page routed to.
    pub pool_id: Option<PoolId>,
    /// Funnel state.
    pub interaction_state: InteractionState,
    /// Whether the visitor has engaged with the widget.
    pub has_interacted: bool,
    pub(crate) seq: u64,
}

/// Membership of an agent in a pool.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolMembership {
    /// Pool.
    pub pool_id: PoolId,
    /// Tier; lower is more senior and is tried first.
    pub priority_rank: u32,
}

/// What an agent brings to `register_agent`.
#[derive(Clone, Debug)]
pub struct AgentProfile {
    /// Agent id.
    pub agent_id: AgentId,
    /// Organization the agent works for.
    pub org_id: Option<OrgId>,
    /// Name shown to visitors.
    pub display_name: String,
    /// Avatar image URL.
    pub avatar_url: Option<String>,
    /// Simulation video URL.
    pub video_url: Option<String>,
    /// Simulation capacity.
    pub max_simultaneous_simulations: usize,
}

/// A logged-in agent.
#[derive(Clone, Debug)]
pub struct AgentSession {
    /// Identity and presentation.
    pub profile: AgentProfile,
    /// Current socket.
    pub connection_id: ConnectionId,
    /// Availability.
    pub status: AgentStatus,
    /// Visitors watching this agent's simulation.
    pub current_simulations: BTreeSet<VisitorId>,
    /// Pool memberships ordered by `priority_rank`.
    pub pool_memberships: Vec<PoolMembership>,
    /// Last heartbeat (or login).
    pub last_heartbeat_at: Instant,
    /// Login time.
    pub connected_at: DateTime<Utc>,
    pub(crate) registration_seq: u64,
}

impl AgentSession {
    /// Agent id.
    pub fn agent_id(&self) -> &AgentId {
        &self.profile.agent_id
    }

    /// Whether another visitor can be shown this agent's simulation.
    pub fn has_capacity(&self) -> bool {
        self.current_simulations.len() < self.profile.max_simultaneous_simulations
    }

    /// Rank in `pool_id`, if a member.
    pub fn rank_in(&self, pool_id: &PoolId) -> Option<u32> {
        self.pool_memberships
            .iter()
            .find(|m| &m.pool_id == pool_id)
            .map(|m| m.priority_rank)
    }

    /// Public card sent to visitors.
    pub fn card(&self) -> AgentCard {
        AgentCard {
            agent_id: self.profile.agent_id.clone(),
            display_name: self.profile.display_name.clone(),
            avatar_url: self.profile.avatar_url.clone(),
            video_url: self.profile.video_url.clone(),
        }
    }
}

/// Routing rule as stored in the directory.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RuleConfig {
    /// Host wildcard; empty matches any.
    pub domain_pattern: String,
    /// Path wildcard; empty matches any.
    pub path_pattern: String,
    /// Higher priorities are evaluated first.
    pub priority: i32,
}

/// Pool as stored in the directory.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolConfig {
    /// Pool id.
    pub pool_id: PoolId,
    /// Owning organization.
    pub org_id: OrgId,
    /// Display name.
    #[serde(default)]
    pub name: String,
    /// Matched when no rule in the org matches.
    #[serde(default)]
    pub is_catch_all: bool,
    /// Routing rules.
    #[serde(default)]
    pub rules: Vec<RuleConfig>,
}

/// A compiled routing rule.
#[derive(Clone, Debug)]
pub struct RoutingRule {
    /// Host pattern.
    pub domain: RoutePattern,
    /// Path pattern.
    pub path: RoutePattern,
    /// Evaluation priority (higher first).
    pub priority: i32,
}

impl RoutingRule {
    /// Both patterns must match.
    pub fn matches(&self, page: &PageLocation) -> bool {
        self.domain.is_match(&page.host) && self.path.is_match(&page.path)
    }
}

/// A routing pool with compiled rules.
#[derive(Clone, Debug)]
pub struct Pool {
    /// Pool id.
    pub pool_id: PoolId,
    /// Owning organization.
    pub org_id: OrgId,
    /// Display name.
    pub name: String,
    /// Catch-all flag.
    pub is_catch_all: bool,
    /// Rules.
    pub rules: Vec<RoutingRule>,
}

impl Pool {
    /// Compile a directory entry.
    pub fn compile(config: PoolConfig) -> Result<Self> {
        let invalid = |pattern: &str, source| RegistryError::InvalidPattern {
            pool_id: config.pool_id.clone(),
            pattern: pattern.to_owned(),
            source,
        };
        let rules = config
            .rules
            .iter()
            .map(|rule| {
                Ok(RoutingRule {
                    domain: RoutePattern::domain(&rule.domain_pattern)
                        .map_err(|e| invalid(&rule.domain_pattern, e))?,
                    path: RoutePattern::path(&rule.path_pattern)
                        .map_err(|e| invalid(&rule.path_pattern, e))?,
                    priority: rule.priority,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            pool_id: config.pool_id,
            org_id: config.org_id,
            name: config.name,
            is_catch_all: config.is_catch_all,
            rules,
        })
    }
}

/// Lifecycle of a call attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallRequestState {
    /// Queued against a busy or absent agent.
    Waiting,
    /// The agent is being rung.
    Ringing,
    /// The agent picked up.
    Accepted,
    /// The agent declined.
    Rejected,
    /// The visitor withdrew (or left).
    Cancelled,
    /// The ring timed out.
    Missed,
}

impl CallRequestState {
    /// Terminal states never transition again.
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Waiting | Self::Ringing)
    }

    /// Lower-case name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Ringing => "ringing",
            Self::Accepted => "accepted",
            Self::Rejected => "rejected",
            Self::Cancelled => "cancelled",
            Self::Missed => "missed",
        }
    }
}

/// One call attempt from a visitor to an agent.
#[derive(Clone, Debug)]
pub struct CallRequest {
    /// Request id.
    pub request_id: RequestId,
    /// Caller.
    pub visitor_id: VisitorId,
    /// Callee.
    pub agent_id: AgentId,
    /// Caller's organization.
    pub org_id: OrgId,
    /// Caller's page at request time.
    pub page_url: String,
    /// Creation time.
    pub created_at: Instant,
    /// State.
    pub state: CallRequestState,
}

/// A connected call.
#[derive(Clone, Debug)]
pub struct ActiveCall {
    /// Call id.
    pub call_id: CallId,
    /// Request that became this call.
    pub request_id: RequestId,
    /// Visitor side.
    pub visitor_id: VisitorId,
    /// Agent side.
    pub agent_id: AgentId,
    /// Start time.
    pub started_at: DateTime<Utc>,
}

/// Outcome of [`crate::SessionRegistry::register_agent`].
#[derive(Clone, Debug)]
pub struct AgentRegistration {
    /// The session after registration.
    pub session: AgentSession,
    /// Whether a session inside its disconnect grace period was resumed.
    pub reconnected: bool,
    /// Connection that was replaced, if the agent was live on another socket.
    pub replaced_connection: Option<ConnectionId>,
}

/// Outcome of [`crate::SessionRegistry::reassign_visitors`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Reassignment {
    /// Visitor → new agent, in visitor id order.
    pub reassigned: Vec<(VisitorId, AgentId)>,
    /// Visitors left without an agent.
    pub unassigned: Vec<VisitorId>,
}

impl Reassignment {
    /// Nothing moved.
    pub fn is_empty(&self) -> bool {
        self.reassigned.is_empty() && self.unassigned.is_empty()
    }
}

/// Outcome of [`crate::SessionRegistry::accept_call`].
#[derive(Clone, Debug)]
pub struct Accepted {
    /// The accepted request (terminal snapshot).
    pub request: CallRequest,
    /// The new call.
    pub call: ActiveCall,
    /// Other visitors that were watching the agent.
    pub displaced: Reassignment,
    /// Agent the caller was watching before, if it was someone else.
    pub previous_agent_id: Option<AgentId>,
    /// The agent's other ringing requests, now back to `waiting`.
    pub requeued: Vec<RequestId>,
}
