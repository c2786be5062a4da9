//! Fire-and-forget side effects.
//!
//! The router never awaits analytics, retargeting or call-log bookkeeping.
//! It pushes a [`SideEffect`] onto a bounded queue with `try_send`; a single
//! worker task drains the queue against the collaborators and discards
//! failures. A full queue drops the effect.
//!
//! [`SideEffectQueue::fence`] lets a caller wait until everything queued
//! before it has been applied, so a follow-up write it awaits itself lands
//! after them.

use metrics::counter;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use greeter_core::protocol::{AgentStatus, EndReason};
use greeter_core::{AgentId, CallId, OrgId, PoolId, RequestId, VisitorId};

use crate::collaborators::{CallLogEntry, CollabResult, Collaborators};
use crate::metrics::{SIDE_EFFECTS_DROPPED_TOTAL, SIDE_EFFECT_FAILURES_TOTAL};

/// A best-effort call to a collaborator.
#[derive(Clone, Debug, PartialEq)]
pub enum SideEffect {
    /// Open a call-log row.
    CreateCallLog(CallLogEntry),
    /// Close a call-log row as ended.
    CallEnded {
        /// Request behind the call.
        request_id: RequestId,
        /// Call.
        call_id: CallId,
        /// Why.
        reason: EndReason,
    },
    /// Close a call-log row as missed.
    CallMissed(RequestId),
    /// Close a call-log row as rejected.
    CallRejected(RequestId),
    /// Close a call-log row as cancelled.
    CallCancelled(RequestId),
    /// Agent status transition.
    StatusChange {
        /// Agent.
        agent_id: AgentId,
        /// New status.
        status: AgentStatus,
        /// Why.
        reason: String,
    },
    /// Agent session opened.
    SessionStarted(AgentId),
    /// Agent session closed.
    SessionEnded(AgentId),
    /// Visitor page view.
    Pageview {
        /// Org.
        org_id: OrgId,
        /// Visitor.
        visitor_id: VisitorId,
        /// Page.
        page_url: String,
        /// Matched pool.
        pool_id: Option<PoolId>,
    },
    /// Widget seen on a page.
    EmbedVerification {
        /// Org.
        org_id: OrgId,
        /// Page.
        page_url: String,
    },
    /// Widget shown to a visitor.
    WidgetView {
        /// Org.
        org_id: OrgId,
        /// Visitor.
        visitor_id: VisitorId,
    },
    /// Call connected.
    CallStarted {
        /// Org.
        org_id: OrgId,
        /// Visitor.
        visitor_id: VisitorId,
        /// Agent.
        agent_id: AgentId,
    },
}

impl SideEffect {
    /// Short label for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::CreateCallLog(_) => "create_call_log",
            Self::CallEnded { .. } => "call_ended",
            Self::CallMissed(_) => "call_missed",
            Self::CallRejected(_) => "call_rejected",
            Self::CallCancelled(_) => "call_cancelled",
            Self::StatusChange { .. } => "status_change",
            Self::SessionStarted(_) => "session_started",
            Self::SessionEnded(_) => "session_ended",
            Self::Pageview { .. } => "pageview",
            Self::EmbedVerification { .. } => "embed_verification",
            Self::WidgetView { .. } => "widget_view",
            Self::CallStarted { .. } => "call_started",
        }
    }

    async fn apply(&self, c: &Collaborators) -> CollabResult<()> {
        match self {
            Self::CreateCallLog(entry) => c.call_logs.create_call_log(entry).await.map(|_| ()),
            Self::CallEnded {
                request_id,
                call_id,
                reason,
            } => c.call_logs.mark_call_ended(request_id, call_id, *reason).await,
            Self::CallMissed(id) => c.call_logs.mark_call_missed(id).await,
            Self::CallRejected(id) => c.call_logs.mark_call_rejected(id).await,
            Self::CallCancelled(id) => c.call_logs.mark_call_cancelled(id).await,
            Self::StatusChange {
                agent_id,
                status,
                reason,
            } => c.activity.record_status_change(agent_id, *status, reason).await,
            Self::SessionStarted(agent_id) => c.activity.start_session(agent_id).await,
            Self::SessionEnded(agent_id) => c.activity.end_session(agent_id).await,
            Self::Pageview {
                org_id,
                visitor_id,
                page_url,
                pool_id,
            } => {
                c.activity
                    .record_pageview(org_id, visitor_id, page_url, pool_id.as_ref())
                    .await
            }
            Self::EmbedVerification { org_id, page_url } => {
                c.activity.record_embed_verification(org_id, page_url).await
            }
            Self::WidgetView { org_id, visitor_id } => {
                c.engagement.track_widget_view(org_id, visitor_id).await
            }
            Self::CallStarted {
                org_id,
                visitor_id,
                agent_id,
            } => c.engagement.track_call_started(org_id, visitor_id, agent_id).await,
        }
    }
}

#[derive(Debug)]
enum Job {
    Apply(SideEffect),
    Fence(oneshot::Sender<()>),
}

/// Producer half of the side-effect queue.
#[derive(Clone, Debug)]
pub struct SideEffectQueue {
    tx: mpsc::Sender<Job>,
}

impl SideEffectQueue {
    /// Create the queue and spawn its worker.
    pub fn spawn(capacity: usize, collaborators: Collaborators) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let worker = tokio::spawn(run_worker(rx, collaborators));
        (Self { tx }, worker)
    }

    /// Enqueue without waiting. Returns `false` when the effect was dropped.
    pub fn push(&self, effect: SideEffect) -> bool {
        let kind = effect.kind();
        match self.tx.try_send(Job::Apply(effect)) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                counter!(SIDE_EFFECTS_DROPPED_TOTAL).increment(1);
                warn!(kind, "side-effect queue full, dropping");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(kind, "side-effect worker gone, dropping");
                false
            }
        }
    }

    /// Wait until every effect pushed before this call has been applied or
    /// failed. Returns `false` when the worker is gone.
    pub async fn fence(&self) -> bool {
        let (done, wait) = oneshot::channel();
        if self.tx.send(Job::Fence(done)).await.is_err() {
            return false;
        }
        wait.await.is_ok()
    }
}

async fn run_worker(mut rx: mpsc::Receiver<Job>, collaborators: Collaborators) {
    while let Some(job) = rx.recv().await {
        let effect = match job {
            Job::Apply(effect) => effect,
            Job::Fence(done) => {
                let _ = done.send(());
                continue;
            }
        };
        if let Err(error) = effect.apply(&collaborators).await {
            counter!(SIDE_EFFECT_FAILURES_TOTAL, "kind" => effect.kind()).increment(1);
            debug!(kind = effect.kind(), %error, "side effect failed");
        }
    }
    debug!("side-effect worker stopped");
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::static_backend::{ActivityEvent, Directory, StaticBackend};

    #[tokio::test]
    async fn worker_applies_effects_in_order() {
        let backend = Arc::new(StaticBackend::new(Directory::default()));
        let (queue, _worker) = SideEffectQueue::spawn(8, Collaborators::uniform(backend.clone()));

        let agent = AgentId::from_raw("a1");
        assert!(queue.push(SideEffect::SessionStarted(agent.clone())));
        assert!(queue.push(SideEffect::StatusChange {
            agent_id: agent.clone(),
            status: AgentStatus::Idle,
            reason: "back".into(),
        }));

        for _ in 0..50 {
            if backend.activity().len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(
            backend.activity(),
            vec![
                ActivityEvent::SessionStarted(agent.clone()),
                ActivityEvent::Status {
                    agent_id: agent,
                    status: AgentStatus::Idle,
                    reason: "back".into()
                }
            ]
        );
    }

    #[tokio::test]
    async fn failures_are_swallowed() {
        let backend = Arc::new(StaticBackend::new(Directory::default()));
        let (queue, worker) = SideEffectQueue::spawn(8, Collaborators::uniform(backend.clone()));
        // no call log exists, so the collaborator errors
        assert!(queue.push(SideEffect::CallMissed(RequestId::from_raw("req_x"))));
        assert!(queue.push(SideEffect::SessionEnded(AgentId::from_raw("a1"))));
        drop(queue);
        worker.await.unwrap();
        assert_eq!(
            backend.activity(),
            vec![ActivityEvent::SessionEnded(AgentId::from_raw("a1"))]
        );
    }

    #[tokio::test]
    async fn fence_waits_for_earlier_effects() {
        let backend = Arc::new(StaticBackend::new(Directory::default()));
        let (queue, _worker) = SideEffectQueue::spawn(8, Collaborators::uniform(backend.clone()));
        let entry = CallLogEntry {
            request_id: RequestId::from_raw("req_1"),
            org_id: OrgId::from_raw("org-1"),
            visitor_id: VisitorId::from_raw("v1"),
            agent_id: AgentId::from_raw("a1"),
            page_url: "/pricing".into(),
        };
        assert!(queue.push(SideEffect::CreateCallLog(entry)));

        assert!(queue.fence().await);
        assert!(backend.call_log(&RequestId::from_raw("req_1")).is_some());
    }

    #[tokio::test]
    async fn fence_reports_stopped_worker() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let queue = SideEffectQueue { tx };
        assert!(!queue.fence().await);
    }

    #[tokio::test]
    async fn full_queue_drops() {
        let (tx, _rx) = mpsc::channel(1);
        let queue = SideEffectQueue { tx };
        assert!(queue.push(SideEffect::SessionStarted(AgentId::from_raw("a"))));
        assert!(!queue.push(SideEffect::SessionStarted(AgentId::from_raw("b"))));
    }
}
