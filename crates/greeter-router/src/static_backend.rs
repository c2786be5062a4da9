//! Self-contained collaborator backend driven by a JSON directory file.
//!
//! ```json
//! {
//!   "orgs": [{ "orgId": "org-1", "blockedCountries": ["KP"], "widgetSettings": {"theme": "dark"} }],
//!   "pools": [{ "poolId": "sales", "orgId": "org-1", "rules": [{ "pathPattern": "/pricing*" }] }],
//!   "agents": [{ "agentId": "a1", "token": "t0k", "orgId": "org-1",
//!                "memberships": [{ "poolId": "sales", "priorityRank": 1 }] }],
//!   "ipLocations": { "203.0.113.7": { "countryCode": "DE", "city": "Berlin" } }
//! }
//! ```
//!
//! Call logs and activity are kept in memory.

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use greeter_core::protocol::{AgentStatus, EndReason, Location};
use greeter_core::{AgentId, CallId, OrgId, PoolId, RequestId, VisitorId};
use greeter_registry::{PoolConfig, PoolMembership};

use crate::collaborators::{
    ActivityRecorder, AgentAuthenticator, CallLogEntry, CallLogStore, CollabResult,
    CollaboratorError, EngagementTracker, PoolDirectory, TokenVerification, VisitorIntel,
    WidgetSettingsStore,
};

/// Failure loading a directory file.
#[derive(Debug, thiserror::Error)]
pub enum DirectoryError {
    /// Could not read the file.
    #[error("failed to read directory file: {0}")]
    Io(#[from] std::io::Error),
    /// Could not parse the file.
    #[error("failed to parse directory file: {0}")]
    Json(#[from] serde_json::Error),
}

/// One organization.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrgEntry {
    /// Org id.
    pub org_id: OrgId,
    /// ISO country codes whose visitors are refused.
    #[serde(default)]
    pub blocked_countries: Vec<String>,
    /// Widget settings for the org.
    #[serde(default)]
    pub widget_settings: Value,
    /// Per-pool overrides, shallow-merged over `widget_settings`.
    #[serde(default)]
    pub pool_widget_settings: HashMap<PoolId, Value>,
}

/// One agent account.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentEntry {
    /// Agent id.
    pub agent_id: AgentId,
    /// Accepted bearer token.
    pub token: String,
    /// Organization.
    pub org_id: OrgId,
    /// Pool memberships.
    #[serde(default)]
    pub memberships: Vec<PoolMembership>,
}

/// Whole directory file.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Directory {
    /// Organizations.
    pub orgs: Vec<OrgEntry>,
    /// Pools across all orgs.
    pub pools: Vec<PoolConfig>,
    /// Agent accounts.
    pub agents: Vec<AgentEntry>,
    /// Static IP → location table.
    pub ip_locations: HashMap<String, Location>,
}

/// Stored call-log row.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CallLogRecord {
    /// Log id.
    pub log_id: String,
    /// Original entry.
    pub entry: CallLogEntry,
    /// Latest status (`ringing`, `accepted`, `ended`, `missed`, ...).
    pub status: String,
    /// Call id once accepted.
    pub call_id: Option<CallId>,
    /// End reason once ended.
    pub end_reason: Option<EndReason>,
}

/// Recorded analytics event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ActivityEvent {
    /// Agent status change.
    Status {
        /// Agent.
        agent_id: AgentId,
        /// New status.
        status: AgentStatus,
        /// Why.
        reason: String,
    },
    /// Session started.
    SessionStarted(AgentId),
    /// Session ended.
    SessionEnded(AgentId),
    /// Page view.
    Pageview {
        /// Visitor.
        visitor_id: VisitorId,
        /// Page.
        page_url: String,
    },
    /// Embed seen on a page.
    EmbedVerified {
        /// Org.
        org_id: OrgId,
        /// Page.
        page_url: String,
    },
    /// Widget shown.
    WidgetView(VisitorId),
    /// Call connected.
    CallStarted {
        /// Visitor.
        visitor_id: VisitorId,
        /// Agent.
        agent_id: AgentId,
    },
}

/// In-memory implementation of every collaborator contract.
#[derive(Debug, Default)]
pub struct StaticBackend {
    directory: Directory,
    call_logs: Mutex<HashMap<RequestId, CallLogRecord>>,
    activity: Mutex<Vec<ActivityEvent>>,
}

impl StaticBackend {
    /// Wrap a parsed directory.
    pub fn new(directory: Directory) -> Self {
        Self {
            directory,
            ..Self::default()
        }
    }

    /// Load a directory file.
    pub fn from_path(path: &Path) -> Result<Self, DirectoryError> {
        let content = std::fs::read_to_string(path)?;
        let directory: Directory = serde_json::from_str(&content)?;
        tracing::info!(
            ?path,
            orgs = directory.orgs.len(),
            pools = directory.pools.len(),
            agents = directory.agents.len(),
            "directory loaded"
        );
        Ok(Self::new(directory))
    }

    /// The loaded directory.
    pub fn directory(&self) -> &Directory {
        &self.directory
    }

    /// Snapshot of one call-log row.
    pub fn call_log(&self, request_id: &RequestId) -> Option<CallLogRecord> {
        self.call_logs.lock().get(request_id).cloned()
    }

    /// Snapshot of every recorded analytics event, oldest first.
    pub fn activity(&self) -> Vec<ActivityEvent> {
        self.activity.lock().clone()
    }

    fn org(&self, org_id: &OrgId) -> Option<&OrgEntry> {
        self.directory.orgs.iter().find(|o| &o.org_id == org_id)
    }

    fn record(&self, event: ActivityEvent) {
        self.activity.lock().push(event);
    }

    fn set_status(&self, request_id: &RequestId, status: &str) -> CollabResult<()> {
        let mut logs = self.call_logs.lock();
        let record = logs
            .get_mut(request_id)
            .ok_or_else(|| CollaboratorError::NotFound(format!("call log for {request_id}")))?;
        status.clone_into(&mut record.status);
        Ok(())
    }
}

#[async_trait]
impl AgentAuthenticator for StaticBackend {
    async fn verify_agent_token(&self, token: &str, agent_id: &AgentId) -> CollabResult<TokenVerification> {
        let entry = self.directory.agents.iter().find(|a| &a.agent_id == agent_id);
        Ok(match entry {
            Some(a) if a.token == token => TokenVerification {
                valid: true,
                user_id: Some(a.agent_id.to_string()),
                organization_id: Some(a.org_id.clone()),
                error: None,
            },
            Some(_) => TokenVerification {
                valid: false,
                error: Some("token mismatch".into()),
                ..TokenVerification::default()
            },
            None => TokenVerification {
                valid: false,
                error: Some("unknown agent".into()),
                ..TokenVerification::default()
            },
        })
    }
}

#[async_trait]
impl PoolDirectory for StaticBackend {
    async fn fetch_agent_pool_memberships(&self, agent_id: &AgentId) -> CollabResult<Vec<PoolMembership>> {
        self.directory
            .agents
            .iter()
            .find(|a| &a.agent_id == agent_id)
            .map(|a| a.memberships.clone())
            .ok_or_else(|| CollaboratorError::NotFound(format!("agent {agent_id}")))
    }

    async fn fetch_org_pools(&self, org_id: &OrgId) -> CollabResult<Vec<PoolConfig>> {
        Ok(self
            .directory
            .pools
            .iter()
            .filter(|p| &p.org_id == org_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl CallLogStore for StaticBackend {
    async fn create_call_log(&self, entry: &CallLogEntry) -> CollabResult<String> {
        let log_id = format!("log_{}", entry.request_id);
        let _ = self.call_logs.lock().insert(
            entry.request_id.clone(),
            CallLogRecord {
                log_id: log_id.clone(),
                entry: entry.clone(),
                status: "ringing".into(),
                call_id: None,
                end_reason: None,
            },
        );
        Ok(log_id)
    }

    async fn mark_call_accepted(&self, request_id: &RequestId, call_id: &CallId) -> CollabResult<()> {
        self.set_status(request_id, "accepted")?;
        if let Some(record) = self.call_logs.lock().get_mut(request_id) {
            record.call_id = Some(call_id.clone());
        }
        Ok(())
    }

    async fn mark_call_ended(&self, request_id: &RequestId, _call_id: &CallId, reason: EndReason) -> CollabResult<()> {
        self.set_status(request_id, "ended")?;
        if let Some(record) = self.call_logs.lock().get_mut(request_id) {
            record.end_reason = Some(reason);
        }
        Ok(())
    }

    async fn mark_call_missed(&self, request_id: &RequestId) -> CollabResult<()> {
        self.set_status(request_id, "missed")
    }

    async fn mark_call_rejected(&self, request_id: &RequestId) -> CollabResult<()> {
        self.set_status(request_id, "rejected")
    }

    async fn mark_call_cancelled(&self, request_id: &RequestId) -> CollabResult<()> {
        self.set_status(request_id, "cancelled")
    }

    async fn get_call_log_id(&self, request_id: &RequestId) -> CollabResult<Option<String>> {
        Ok(self.call_logs.lock().get(request_id).map(|r| r.log_id.clone()))
    }
}

#[async_trait]
impl ActivityRecorder for StaticBackend {
    async fn record_status_change(&self, agent_id: &AgentId, status: AgentStatus, reason: &str) -> CollabResult<()> {
        self.record(ActivityEvent::Status {
            agent_id: agent_id.clone(),
            status,
            reason: reason.to_owned(),
        });
        Ok(())
    }

    async fn start_session(&self, agent_id: &AgentId) -> CollabResult<()> {
        self.record(ActivityEvent::SessionStarted(agent_id.clone()));
        Ok(())
    }

    async fn end_session(&self, agent_id: &AgentId) -> CollabResult<()> {
        self.record(ActivityEvent::SessionEnded(agent_id.clone()));
        Ok(())
    }

    async fn record_pageview(
        &self,
        _org_id: &OrgId,
        visitor_id: &VisitorId,
        page_url: &str,
        _pool_id: Option<&PoolId>,
    ) -> CollabResult<()> {
        self.record(ActivityEvent::Pageview {
            visitor_id: visitor_id.clone(),
            page_url: page_url.to_owned(),
        });
        Ok(())
    }

    async fn record_embed_verification(&self, org_id: &OrgId, page_url: &str) -> CollabResult<()> {
        self.record(ActivityEvent::EmbedVerified {
            org_id: org_id.clone(),
            page_url: page_url.to_owned(),
        });
        Ok(())
    }
}

#[async_trait]
impl VisitorIntel for StaticBackend {
    async fn get_location_from_ip(&self, ip: &str) -> CollabResult<Option<Location>> {
        Ok(self.directory.ip_locations.get(ip).cloned())
    }

    async fn is_country_blocked(&self, org_id: &OrgId, country_code: &str) -> CollabResult<bool> {
        Ok(self.org(org_id).is_some_and(|o| {
            o.blocked_countries
                .iter()
                .any(|c| c.eq_ignore_ascii_case(country_code))
        }))
    }
}

#[async_trait]
impl WidgetSettingsStore for StaticBackend {
    async fn get_widget_settings(&self, org_id: &OrgId, pool_id: Option<&PoolId>) -> CollabResult<Value> {
        let Some(org) = self.org(org_id) else {
            return Ok(Value::Object(serde_json::Map::new()));
        };
        let mut settings = match &org.widget_settings {
            Value::Object(map) => map.clone(),
            _ => serde_json::Map::new(),
        };
        if let Some(Value::Object(overrides)) = pool_id.and_then(|p| org.pool_widget_settings.get(p)) {
            for (k, v) in overrides {
                let _ = settings.insert(k.clone(), v.clone());
            }
        }
        Ok(Value::Object(settings))
    }
}

#[async_trait]
impl EngagementTracker for StaticBackend {
    async fn track_widget_view(&self, _org_id: &OrgId, visitor_id: &VisitorId) -> CollabResult<()> {
        self.record(ActivityEvent::WidgetView(visitor_id.clone()));
        Ok(())
    }

    async fn track_call_started(&self, _org_id: &OrgId, visitor_id: &VisitorId, agent_id: &AgentId) -> CollabResult<()> {
        self.record(ActivityEvent::CallStarted {
            visitor_id: visitor_id.clone(),
            agent_id: agent_id.clone(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn backend() -> StaticBackend {
        let directory: Directory = serde_json::from_value(json!({
            "orgs": [{
                "orgId": "org-1",
                "blockedCountries": ["kp"],
                "widgetSettings": {"theme": "dark", "position": "right"},
                "poolWidgetSettings": {"sales": {"position": "left"}}
            }],
            "pools": [
                {"poolId": "sales", "orgId": "org-1", "rules": [{"pathPattern": "/pricing*", "priority": 5}]},
                {"poolId": "other", "orgId": "org-2", "isCatchAll": true}
            ],
            "agents": [{
                "agentId": "a1", "token": "secret", "orgId": "org-1",
                "memberships": [{"poolId": "sales", "priorityRank": 1}]
            }],
            "ipLocations": {"203.0.113.7": {"countryCode": "KP"}}
        }))
        .unwrap();
        StaticBackend::new(directory)
    }

    #[tokio::test]
    async fn token_verification() {
        let b = backend();
        let ok = b.verify_agent_token("secret", &AgentId::from_raw("a1")).await.unwrap();
        assert!(ok.valid);
        assert_eq!(ok.organization_id, Some(OrgId::from_raw("org-1")));

        let bad = b.verify_agent_token("nope", &AgentId::from_raw("a1")).await.unwrap();
        assert!(!bad.valid);
        let unknown = b.verify_agent_token("secret", &AgentId::from_raw("zz")).await.unwrap();
        assert_eq!(unknown.error.as_deref(), Some("unknown agent"));
    }

    #[tokio::test]
    async fn pools_are_filtered_by_org() {
        let b = backend();
        let pools = b.fetch_org_pools(&OrgId::from_raw("org-1")).await.unwrap();
        assert_eq!(pools.len(), 1);
        assert_eq!(pools[0].rules[0].path_pattern, "/pricing*");
        let members = b.fetch_agent_pool_memberships(&AgentId::from_raw("a1")).await.unwrap();
        assert_eq!(members[0].priority_rank, 1);
        assert!(b.fetch_agent_pool_memberships(&AgentId::from_raw("zz")).await.is_err());
    }

    #[tokio::test]
    async fn blocking_and_location() {
        let b = backend();
        let loc = b.get_location_from_ip("203.0.113.7").await.unwrap().unwrap();
        assert_eq!(loc.country_code.as_deref(), Some("KP"));
        assert!(b.is_country_blocked(&OrgId::from_raw("org-1"), "KP").await.unwrap());
        assert!(!b.is_country_blocked(&OrgId::from_raw("org-1"), "DE").await.unwrap());
        assert!(b.get_location_from_ip("198.51.100.1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn widget_settings_merge_pool_overrides() {
        let b = backend();
        let org = OrgId::from_raw("org-1");
        let base = b.get_widget_settings(&org, None).await.unwrap();
        assert_eq!(base["position"], "right");
        let sales = b.get_widget_settings(&org, Some(&PoolId::from_raw("sales"))).await.unwrap();
        assert_eq!(sales["position"], "left");
        assert_eq!(sales["theme"], "dark");
        assert_eq!(b.get_widget_settings(&OrgId::from_raw("x"), None).await.unwrap(), json!({}));
    }

    #[tokio::test]
    async fn call_log_ledger_tracks_status() {
        let b = backend();
        let entry = CallLogEntry {
            request_id: RequestId::from_raw("req_1"),
            visitor_id: VisitorId::from_raw("v1"),
            agent_id: AgentId::from_raw("a1"),
            org_id: OrgId::from_raw("org-1"),
            page_url: "/pricing".into(),
        };
        let log_id = b.create_call_log(&entry).await.unwrap();
        assert_eq!(b.get_call_log_id(&entry.request_id).await.unwrap(), Some(log_id));

        b.mark_call_accepted(&entry.request_id, &CallId::from_raw("call_1")).await.unwrap();
        b.mark_call_ended(&entry.request_id, &CallId::from_raw("call_1"), EndReason::Agent)
            .await
            .unwrap();
        let record = b.call_log(&entry.request_id).unwrap();
        assert_eq!(record.status, "ended");
        assert_eq!(record.end_reason, Some(EndReason::Agent));

        assert!(b.mark_call_missed(&RequestId::from_raw("nope")).await.is_err());
    }

    #[test]
    fn loads_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("directory.json");
        std::fs::write(&path, r#"{"orgs": [{"orgId": "o"}]}"#).unwrap();
        let b = StaticBackend::from_path(&path).unwrap();
        assert_eq!(b.directory().orgs.len(), 1);

        std::fs::write(&path, "{").unwrap();
        assert!(matches!(StaticBackend::from_path(&path), Err(DirectoryError::Json(_))));
    }
}
