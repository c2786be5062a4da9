//! Narrow contracts to the services the router depends on but does not own.
//!
//! Only three calls sit on the routing path and are awaited: token
//! verification and pool lookup at login, location and country blocking at
//! visitor join, and widget settings before `AGENT_ASSIGNED`. Accepting a
//! call also awaits the call-log update to learn the log id. Everything else
//! goes through the side-effect queue.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use greeter_core::protocol::{AgentStatus, EndReason, Location};
use greeter_core::{AgentId, CallId, OrgId, PoolId, RequestId, VisitorId};
use greeter_registry::{PoolConfig, PoolMembership};

/// Failure reported by a collaborator.
#[derive(Debug, thiserror::Error)]
pub enum CollaboratorError {
    /// The backing service could not be reached or failed.
    #[error("{service} unavailable: {message}")]
    Unavailable {
        /// Service name.
        service: &'static str,
        /// Detail.
        message: String,
    },
    /// The referenced record does not exist.
    #[error("{0} not found")]
    NotFound(String),
}

/// Result alias for collaborator calls.
pub type CollabResult<T> = std::result::Result<T, CollaboratorError>;

/// Outcome of agent token verification.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenVerification {
    /// Whether the token is good for the claimed agent.
    pub valid: bool,
    /// Authenticated user id.
    #[serde(default)]
    pub user_id: Option<String>,
    /// Organization the agent belongs to.
    #[serde(default)]
    pub organization_id: Option<OrgId>,
    /// Reason for rejection.
    #[serde(default)]
    pub error: Option<String>,
}

/// A new call-log row.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallLogEntry {
    /// Request the row tracks.
    pub request_id: RequestId,
    /// Caller.
    pub visitor_id: VisitorId,
    /// Callee.
    pub agent_id: AgentId,
    /// Caller's organization.
    pub org_id: OrgId,
    /// Page the call started from.
    pub page_url: String,
}

/// Verifies agent credentials.
#[async_trait]
pub trait AgentAuthenticator: Send + Sync {
    /// Check `token` for `agent_id`.
    async fn verify_agent_token(&self, token: &str, agent_id: &AgentId) -> CollabResult<TokenVerification>;
}

/// Pool catalogue and agent memberships.
#[async_trait]
pub trait PoolDirectory: Send + Sync {
    /// Pools the agent belongs to, with tier ranks.
    async fn fetch_agent_pool_memberships(&self, agent_id: &AgentId) -> CollabResult<Vec<PoolMembership>>;

    /// Every pool of an organization, with routing rules.
    async fn fetch_org_pools(&self, org_id: &OrgId) -> CollabResult<Vec<PoolConfig>>;
}

/// Persistent call log.
#[async_trait]
pub trait CallLogStore: Send + Sync {
    /// Open a row for a new request. Returns the log id.
    async fn create_call_log(&self, entry: &CallLogEntry) -> CollabResult<String>;

    /// Record that the request was answered.
    async fn mark_call_accepted(&self, request_id: &RequestId, call_id: &CallId) -> CollabResult<()>;

    /// Record the end of a call.
    async fn mark_call_ended(&self, request_id: &RequestId, call_id: &CallId, reason: EndReason) -> CollabResult<()>;

    /// Record a ring-no-answer.
    async fn mark_call_missed(&self, request_id: &RequestId) -> CollabResult<()>;

    /// Record a rejection.
    async fn mark_call_rejected(&self, request_id: &RequestId) -> CollabResult<()>;

    /// Record a cancellation.
    async fn mark_call_cancelled(&self, request_id: &RequestId) -> CollabResult<()>;

    /// Log id of a request, if a row exists.
    async fn get_call_log_id(&self, request_id: &RequestId) -> CollabResult<Option<String>>;
}

/// Agent activity and site analytics.
#[async_trait]
pub trait ActivityRecorder: Send + Sync {
    /// Agent status transition.
    async fn record_status_change(&self, agent_id: &AgentId, status: AgentStatus, reason: &str) -> CollabResult<()>;

    /// Agent logged in.
    async fn start_session(&self, agent_id: &AgentId) -> CollabResult<()>;

    /// Agent session ended.
    async fn end_session(&self, agent_id: &AgentId) -> CollabResult<()>;

    /// Visitor page view.
    async fn record_pageview(
        &self,
        org_id: &OrgId,
        visitor_id: &VisitorId,
        page_url: &str,
        pool_id: Option<&PoolId>,
    ) -> CollabResult<()>;

    /// The widget was seen running on `page_url`.
    async fn record_embed_verification(&self, org_id: &OrgId, page_url: &str) -> CollabResult<()>;
}

/// Location lookup and country blocking.
#[async_trait]
pub trait VisitorIntel: Send + Sync {
    /// Resolve an IP to a location.
    async fn get_location_from_ip(&self, ip: &str) -> CollabResult<Option<Location>>;

    /// Whether `org_id` refuses visitors from `country_code`.
    async fn is_country_blocked(&self, org_id: &OrgId, country_code: &str) -> CollabResult<bool>;
}

/// Widget appearance settings.
#[async_trait]
pub trait WidgetSettingsStore: Send + Sync {
    /// Settings for an org, refined by pool when one matched.
    async fn get_widget_settings(&self, org_id: &OrgId, pool_id: Option<&PoolId>) -> CollabResult<Value>;
}

/// Retargeting pixels.
#[async_trait]
pub trait EngagementTracker: Send + Sync {
    /// The widget was shown to a visitor.
    async fn track_widget_view(&self, org_id: &OrgId, visitor_id: &VisitorId) -> CollabResult<()>;

    /// A visitor's call connected.
    async fn track_call_started(&self, org_id: &OrgId, visitor_id: &VisitorId, agent_id: &AgentId) -> CollabResult<()>;
}

/// Every collaborator the router talks to.
#[derive(Clone)]
pub struct Collaborators {
    /// Token verification.
    pub auth: Arc<dyn AgentAuthenticator>,
    /// Pools and memberships.
    pub pools: Arc<dyn PoolDirectory>,
    /// Call log.
    pub call_logs: Arc<dyn CallLogStore>,
    /// Activity analytics.
    pub activity: Arc<dyn ActivityRecorder>,
    /// Geolocation and blocking.
    pub intel: Arc<dyn VisitorIntel>,
    /// Widget settings.
    pub widgets: Arc<dyn WidgetSettingsStore>,
    /// Retargeting.
    pub engagement: Arc<dyn EngagementTracker>,
}

impl Collaborators {
    /// Use one backend for every contract.
    pub fn uniform<B>(backend: Arc<B>) -> Self
    where
        B: AgentAuthenticator
            + PoolDirectory
            + CallLogStore
            + ActivityRecorder
            + VisitorIntel
            + WidgetSettingsStore
            + EngagementTracker
            + 'static,
    {
        Self {
            auth: backend.clone(),
            pools: backend.clone(),
            call_logs: backend.clone(),
            activity: backend.clone(),
            intel: backend.clone(),
            widgets: backend.clone(),
            engagement: backend,
        }
    }
}

impl std::fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collaborators").finish_non_exhaustive()
    }
}
