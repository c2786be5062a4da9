//! Visitor-side events: join, interaction, navigation.

use serde_json::{Value, json};
use tracing::{debug, info, instrument};

use greeter_core::protocol::{Location, OutboundEvent, VisitorInteraction, VisitorJoin, WidgetPageview};
use greeter_core::{AgentId, ConnectionId, OrgId, PoolId, VisitorId};
use greeter_registry::{AgentSession, InteractionState, NewVisitor, Party, SessionRegistry};

use super::{ClientInfo, EventRouter, to_visitor, visitor_sender};
use crate::error::{Result, RouterError};
use crate::notifier::{Outbox, PendingAssignment};
use crate::side_effects::SideEffect;

impl EventRouter {
    /// `VISITOR_JOIN`: locate, screen, register, route.
    #[instrument(skip_all, fields(conn_id = %conn, org_id = %join.org_id))]
    pub(super) async fn visitor_join(&self, conn: &ConnectionId, client: &ClientInfo, join: VisitorJoin) -> Result<Value> {
        if matches!(self.inspect(|reg| reg.party_for_connection(conn).cloned()), Some(Party::Agent(_))) {
            return Err(RouterError::InvalidMessage("agent connections cannot join as visitors".into()));
        }

        let location = match client.ip_address.as_deref() {
            Some(ip) => self.locate(ip).await,
            None => None,
        };
        if let Some(country_code) = location.as_ref().and_then(|l| l.country_code.as_deref()) {
            if self.is_blocked(&join.org_id, country_code).await {
                info!(country_code, "refusing visitor from blocked country");
                self.notifier.disconnect(conn);
                return Err(RouterError::Blocked);
            }
        }
        if !self.notifier.is_connected(conn) {
            debug!("connection closed while joining");
            return Ok(json!({}));
        }

        let (visitor_id, out) = self.with_registry(|reg, out| {
            // A different identity on this socket replaces the one it carried.
            if let Some(Party::Visitor(previous)) = reg.party_for_connection(conn).cloned() {
                if join.visitor_id.as_ref() != Some(&previous) {
                    debug!(previous = %previous, "connection rejoined as another visitor");
                    self.visitor_left(reg, out, &previous);
                }
            }
            let visitor = reg.register_visitor(
                conn.clone(),
                NewVisitor {
                    visitor_id: join.visitor_id,
                    org_id: join.org_id.clone(),
                    page_url: join.page_url.clone(),
                    ip_address: client.ip_address.clone(),
                    location,
                },
            );
            let visitor_id = visitor.visitor_id;
            let resumed_with = visitor
                .assigned_agent_id
                .filter(|agent_id| reg.agent(agent_id).is_some());

            let pool_id = match resumed_with {
                Some(agent_id) => {
                    let pool_id = reg.update_visitor_page(&visitor_id, &join.page_url).ok().flatten();
                    out.assign(PendingAssignment {
                        visitor_id: visitor_id.clone(),
                        agent_id: agent_id.clone(),
                        org_id: join.org_id.clone(),
                        pool_id: pool_id.clone(),
                    });
                    out.touch(&agent_id);
                    self.effect(SideEffect::WidgetView {
                        org_id: join.org_id.clone(),
                        visitor_id: visitor_id.clone(),
                    });
                    pool_id
                }
                None => self.place_visitor(reg, out, &visitor_id),
            };

            self.effect(SideEffect::Pageview {
                org_id: join.org_id.clone(),
                visitor_id: visitor_id.clone(),
                page_url: join.page_url.clone(),
                pool_id,
            });
            self.effect(SideEffect::EmbedVerification {
                org_id: join.org_id.clone(),
                page_url: join.page_url.clone(),
            });
            info!(visitor_id = %visitor_id, "visitor joined");
            visitor_id
        });
        self.flush(out).await;
        Ok(json!({ "visitorId": visitor_id }))
    }

    /// `VISITOR_INTERACTION`.
    pub(super) fn visitor_interaction(&self, conn: &ConnectionId, interaction: &VisitorInteraction) -> Result<Value> {
        let mut reg = self.registry.lock();
        let visitor_id = visitor_sender(&reg, conn)?;
        let first = reg.record_interaction(&visitor_id)?;
        if first {
            debug!(visitor_id = %visitor_id, kind = ?interaction.kind, "first interaction");
        }
        Ok(json!({ "firstInteraction": first }))
    }

    /// `WIDGET_PAGEVIEW`: record the navigation and move the visitor when the
    /// new page belongs to a pool its agent does not serve.
    ///
    /// Visitors with a live request or call stay where they are.
    #[instrument(skip_all, fields(conn_id = %conn))]
    pub(super) async fn widget_pageview(&self, conn: &ConnectionId, pageview: WidgetPageview) -> Result<Value> {
        let (result, out) = self.with_registry(|reg, out| -> Result<Option<PoolId>> {
            let visitor_id = visitor_sender(reg, conn)?;
            let (org_id, assigned, busy) = {
                let visitor = reg
                    .visitor(&visitor_id)
                    .ok_or_else(|| RouterError::Internal(format!("{visitor_id} indexed but missing")))?;
                (
                    visitor.org_id.clone(),
                    visitor.assigned_agent_id.clone(),
                    matches!(
                        visitor.interaction_state,
                        InteractionState::CallRequested | InteractionState::InCall
                    ),
                )
            };
            let pool_id = reg.update_visitor_page(&visitor_id, &pageview.page_url)?;
            self.effect(SideEffect::Pageview {
                org_id,
                visitor_id: visitor_id.clone(),
                page_url: pageview.page_url.clone(),
                pool_id: pool_id.clone(),
            });
            if busy {
                return Ok(pool_id);
            }

            match assigned {
                Some(agent_id) => {
                    let still_serves = pool_id
                        .as_ref()
                        .is_some_and(|p| reg.agent(&agent_id).and_then(|a| a.rank_in(p)).is_some());
                    if !still_serves {
                        Self::move_after_navigation(reg, out, &visitor_id, &agent_id);
                    }
                }
                None => {
                    if let Some(m) = reg.route_visitor(&visitor_id, &[]) {
                        self.announce_assignment(reg, out, &visitor_id, &m);
                    }
                }
            }
            Ok(pool_id)
        });
        self.flush(out).await;
        let pool_id = result?;
        Ok(json!({ "poolId": pool_id }))
    }

    fn move_after_navigation(
        reg: &mut SessionRegistry,
        out: &mut Outbox,
        visitor_id: &VisitorId,
        previous: &AgentId,
    ) {
        out.touch(previous);
        match reg.route_visitor(visitor_id, &[]) {
            Some(m) if &m.agent_id == previous => {}
            Some(m) => {
                if let Some(agent) = reg.agent(&m.agent_id).map(AgentSession::card) {
                    to_visitor(reg, out, visitor_id, OutboundEvent::AgentReassigned {
                        visitor_id: visitor_id.clone(),
                        previous_agent_id: Some(previous.clone()),
                        agent,
                    });
                }
                out.touch(&m.agent_id);
                debug!(visitor_id = %visitor_id, to = %m.agent_id, "visitor moved after navigation");
            }
            None => to_visitor(reg, out, visitor_id, OutboundEvent::AgentUnavailable {
                visitor_id: visitor_id.clone(),
            }),
        }
    }

    /// Route a new visitor, queueing `AGENT_ASSIGNED` or `AGENT_UNAVAILABLE`.
    /// Returns the pool the page matched.
    fn place_visitor(&self, reg: &mut SessionRegistry, out: &mut Outbox, visitor_id: &VisitorId) -> Option<PoolId> {
        match reg.route_visitor(visitor_id, &[]) {
            Some(m) => {
                self.announce_assignment(reg, out, visitor_id, &m);
                Some(m.pool_id)
            }
            None => {
                to_visitor(reg, out, visitor_id, OutboundEvent::AgentUnavailable {
                    visitor_id: visitor_id.clone(),
                });
                reg.visitor(visitor_id).and_then(|v| v.pool_id.clone())
            }
        }
    }

    async fn locate(&self, ip: &str) -> Option<Location> {
        match self.collaborators.intel.get_location_from_ip(ip).await {
            Ok(location) => location,
            Err(error) => {
                debug!(ip, %error, "location lookup failed");
                None
            }
        }
    }

    async fn is_blocked(&self, org_id: &OrgId, country_code: &str) -> bool {
        match self.collaborators.intel.is_country_blocked(org_id, country_code).await {
            Ok(blocked) => blocked,
            Err(error) => {
                debug!(org_id = %org_id, country_code, %error, "blocklist lookup failed, allowing");
                false
            }
        }
    }
}
