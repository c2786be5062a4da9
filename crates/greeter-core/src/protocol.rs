//! WebSocket wire format.
//!
//! Inbound frames: `{"type": "<EVENT>", "id"?: string, "payload"?: object}`.
//! Outbound frames: `{"type": "<EVENT>", "payload": object, "timestamp": string}`.
//! Acknowledgements: `{"type": "ACK", "id", "success", "result"?, "error"?}`.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::ErrorCode;
use crate::ids::{AgentId, CallId, OrgId, PoolId, RequestId, VisitorId};

// ── Shared payload types ────────────────────────────────────────────

/// Agent availability as seen by routing.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    /// Not connected (or inside the disconnect grace period).
    Offline,
    /// Connected but not taking visitors.
    #[default]
    Away,
    /// Ready to be shown to visitors and rung.
    Idle,
    /// On a call.
    InCall,
}

impl AgentStatus {
    /// Wire representation.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Offline => "offline",
            Self::Away => "away",
            Self::Idle => "idle",
            Self::InCall => "in_call",
        }
    }
}

/// Public face of an agent, sent to visitors.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentCard {
    /// Agent id.
    pub agent_id: AgentId,
    /// Name shown in the widget.
    pub display_name: String,
    /// Avatar image URL.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
    /// Simulation video URL.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub video_url: Option<String>,
}

/// Coarse visitor location resolved from the client IP.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Location {
    /// ISO 3166-1 alpha-2 country code.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub country_code: Option<String>,
    /// Country name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
    /// Region or state.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    /// City.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,
}

/// Counts shown on the agent dashboard.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentStats {
    /// Visitors currently watching this agent's simulation.
    pub watching: usize,
    /// Requests queued against this agent but not ringing.
    pub waiting: usize,
    /// Requests currently ringing this agent.
    pub ringing: usize,
    /// Whether the agent has an active call.
    pub in_call: bool,
    /// Simulation capacity.
    pub max_simulations: usize,
}

/// Why a call ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    /// The visitor hung up.
    Visitor,
    /// The agent hung up.
    Agent,
    /// The visitor's socket went away.
    VisitorDisconnected,
    /// The agent's socket went away.
    AgentDisconnected,
    /// The visitor dialled again while still in this call.
    Superseded,
}

/// Why a ringing or waiting request was withdrawn.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelReason {
    /// The visitor withdrew.
    VisitorCancelled,
    /// The visitor left the page.
    VisitorLeft,
    /// The agent did not answer in time.
    RingNoAnswer,
    /// The visitor dialled again before this request resolved.
    Superseded,
    /// The target agent is gone and nobody else can take the call.
    AgentUnavailable,
    /// The agent picked up another call; the request went back to the queue.
    Requeued,
}

// ── Inbound ─────────────────────────────────────────────────────────

/// `VISITOR_JOIN` payload.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VisitorJoin {
    /// Organization that owns the widget.
    pub org_id: OrgId,
    /// Page the widget is embedded on.
    pub page_url: String,
    /// Previously issued visitor id, if the widget has one.
    #[serde(default)]
    pub visitor_id: Option<VisitorId>,
}

/// `VISITOR_INTERACTION` payload.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VisitorInteraction {
    /// Free-form interaction kind (`scroll`, `hover`, ...).
    pub kind: Option<String>,
}

/// `WIDGET_PAGEVIEW` payload.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WidgetPageview {
    /// Page the visitor navigated to.
    pub page_url: String,
}

/// `CALL_REQUEST` payload.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallRequestPayload {
    /// Agent the visitor wants to talk to.
    pub agent_id: AgentId,
}

/// Payload naming a call request.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestRef {
    /// Request id; optional only for `CALL_CANCEL`.
    #[serde(default)]
    pub request_id: Option<RequestId>,
}

/// `CALL_END` payload.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CallEndPayload {
    /// Call to end; defaults to the sender's active call.
    pub call_id: Option<CallId>,
}

/// `AGENT_LOGIN` payload.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentLogin {
    /// Claimed agent id.
    pub agent_id: AgentId,
    /// Bearer token to verify.
    pub token: String,
    /// Display name override.
    #[serde(default)]
    pub display_name: Option<String>,
    /// Avatar image URL.
    #[serde(default)]
    pub avatar_url: Option<String>,
    /// Simulation video URL.
    #[serde(default)]
    pub video_url: Option<String>,
    /// Simulation capacity override.
    #[serde(default)]
    pub max_simultaneous_simulations: Option<usize>,
}

/// `AGENT_STATUS` payload.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AgentStatusPayload {
    /// Requested status.
    pub status: AgentStatus,
}

/// `AGENT_AWAY` payload.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentAwayPayload {
    /// Why the agent stepped away.
    pub reason: Option<String>,
}

/// `WEBRTC_SIGNAL` payload.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WebrtcSignalPayload {
    /// Opaque SDP / ICE blob.
    pub signal: Value,
}

/// A parsed inbound event.
#[derive(Clone, Debug)]
pub enum InboundEvent {
    /// Visitor widget connected.
    VisitorJoin(VisitorJoin),
    /// Visitor engaged with the widget.
    VisitorInteraction(VisitorInteraction),
    /// Visitor navigated within the site.
    WidgetPageview(WidgetPageview),
    /// Visitor asked to talk to an agent.
    CallRequest(CallRequestPayload),
    /// Visitor withdrew a call request.
    CallCancel(RequestRef),
    /// Agent answered a ringing request.
    CallAccept(RequestRef),
    /// Agent declined a ringing request.
    CallReject(RequestRef),
    /// Either party hung up.
    CallEnd(CallEndPayload),
    /// Agent authenticated.
    AgentLogin(AgentLogin),
    /// Agent changed status.
    AgentStatus(AgentStatusPayload),
    /// Agent stepped away (acknowledged).
    AgentAway(AgentAwayPayload),
    /// Agent came back (acknowledged).
    AgentBack,
    /// Opaque WebRTC signalling relay.
    WebrtcSignal(WebrtcSignalPayload),
    /// Liveness ping.
    Heartbeat,
}

impl InboundEvent {
    /// Wire name of the event.
    pub fn name(&self) -> &'static str {
        match self {
            Self::VisitorJoin(_) => "VISITOR_JOIN",
            Self::VisitorInteraction(_) => "VISITOR_INTERACTION",
            Self::WidgetPageview(_) => "WIDGET_PAGEVIEW",
            Self::CallRequest(_) => "CALL_REQUEST",
            Self::CallCancel(_) => "CALL_CANCEL",
            Self::CallAccept(_) => "CALL_ACCEPT",
            Self::CallReject(_) => "CALL_REJECT",
            Self::CallEnd(_) => "CALL_END",
            Self::AgentLogin(_) => "AGENT_LOGIN",
            Self::AgentStatus(_) => "AGENT_STATUS",
            Self::AgentAway(_) => "AGENT_AWAY",
            Self::AgentBack => "AGENT_BACK",
            Self::WebrtcSignal(_) => "WEBRTC_SIGNAL",
            Self::Heartbeat => "heartbeat",
        }
    }
}

/// Frame-level parse failure.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// Not a JSON object with a string `type`.
    #[error("malformed frame: {0}")]
    Malformed(#[source] serde_json::Error),
    /// `type` names no known event.
    #[error("unknown event type: {0}")]
    UnknownType(String),
    /// Payload does not match the event's schema.
    #[error("invalid {kind} payload: {source}")]
    InvalidPayload {
        /// Event type.
        kind: String,
        /// Decoder error.
        #[source]
        source: serde_json::Error,
    },
}

/// Raw envelope before payload decoding.
#[derive(Debug, Deserialize)]
struct RawFrame {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    payload: Value,
}

/// A decoded inbound frame.
#[derive(Clone, Debug)]
pub struct InboundFrame {
    /// Correlation id; when present the server replies with an `ACK`.
    pub id: Option<String>,
    /// The event.
    pub event: InboundEvent,
}

/// Parse failure that still carries the correlation id, if one was readable.
#[derive(Debug)]
pub struct FrameError {
    /// Correlation id from the frame.
    pub id: Option<String>,
    /// What went wrong.
    pub error: ProtocolError,
}

impl InboundFrame {
    /// Decode a text frame.
    pub fn parse(text: &str) -> Result<Self, FrameError> {
        let raw: RawFrame = serde_json::from_str(text).map_err(|e| FrameError {
            id: None,
            error: ProtocolError::Malformed(e),
        })?;
        let id = raw.id;
        match decode_event(&raw.kind, raw.payload) {
            Ok(event) => Ok(Self { id, event }),
            Err(error) => Err(FrameError { id, error }),
        }
    }
}

fn payload<T: DeserializeOwned>(kind: &str, value: Value) -> Result<T, ProtocolError> {
    // An absent payload is treated as an empty object so all-optional payloads decode.
    let value = if value.is_null() {
        Value::Object(serde_json::Map::new())
    } else {
        value
    };
    serde_json::from_value(value).map_err(|source| ProtocolError::InvalidPayload {
        kind: kind.to_owned(),
        source,
    })
}

fn decode_event(kind: &str, value: Value) -> Result<InboundEvent, ProtocolError> {
    let event = match kind {
        "VISITOR_JOIN" => InboundEvent::VisitorJoin(payload(kind, value)?),
        "VISITOR_INTERACTION" => InboundEvent::VisitorInteraction(payload(kind, value)?),
        "WIDGET_PAGEVIEW" => InboundEvent::WidgetPageview(payload(kind, value)?),
        "CALL_REQUEST" => InboundEvent::CallRequest(payload(kind, value)?),
        "CALL_CANCEL" => InboundEvent::CallCancel(payload(kind, value)?),
        "CALL_ACCEPT" => InboundEvent::CallAccept(payload(kind, value)?),
        "CALL_REJECT" => InboundEvent::CallReject(payload(kind, value)?),
        "CALL_END" => InboundEvent::CallEnd(payload(kind, value)?),
        "AGENT_LOGIN" => InboundEvent::AgentLogin(payload(kind, value)?),
        "AGENT_STATUS" => InboundEvent::AgentStatus(payload(kind, value)?),
        "AGENT_AWAY" => InboundEvent::AgentAway(payload(kind, value)?),
        "AGENT_BACK" => InboundEvent::AgentBack,
        "WEBRTC_SIGNAL" => InboundEvent::WebrtcSignal(payload(kind, value)?),
        "heartbeat" | "HEARTBEAT" => InboundEvent::Heartbeat,
        other => return Err(ProtocolError::UnknownType(other.to_owned())),
    };
    Ok(event)
}

// ── Outbound ────────────────────────────────────────────────────────

/// Server-pushed event.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(
    tag = "type",
    content = "payload",
    rename_all = "SCREAMING_SNAKE_CASE",
    rename_all_fields = "camelCase"
)]
pub enum OutboundEvent {
    /// Visitor now watches this agent's simulation.
    AgentAssigned {
        /// Visitor id (new visitors learn theirs here).
        visitor_id: VisitorId,
        /// Assigned agent.
        agent: AgentCard,
        /// Pool that matched the page.
        #[serde(skip_serializing_if = "Option::is_none")]
        pool_id: Option<PoolId>,
        /// Widget appearance settings for the org/pool.
        widget_settings: Value,
    },
    /// Visitor moved to a different agent.
    AgentReassigned {
        /// Visitor id.
        visitor_id: VisitorId,
        /// Agent the visitor was watching before.
        #[serde(skip_serializing_if = "Option::is_none")]
        previous_agent_id: Option<AgentId>,
        /// New agent.
        agent: AgentCard,
    },
    /// No agent is available; the widget should hide.
    AgentUnavailable {
        /// Visitor id.
        visitor_id: VisitorId,
    },
    /// Error surfaced to the triggering connection.
    Error {
        /// Error code.
        code: ErrorCode,
        /// Human-readable message.
        message: String,
    },
    /// A request is ringing this agent.
    CallIncoming {
        /// Request id to accept or reject.
        request_id: RequestId,
        /// Caller.
        visitor_id: VisitorId,
        /// Page the visitor is on.
        page_url: String,
        /// Visitor location, if known.
        #[serde(skip_serializing_if = "Option::is_none")]
        location: Option<Location>,
    },
    /// Sent to the agent after it accepted.
    CallAccepted {
        /// Accepted request.
        request_id: RequestId,
        /// New call id.
        call_id: CallId,
        /// Caller.
        visitor_id: VisitorId,
        /// Persistent call-log id, when storage returned one.
        #[serde(skip_serializing_if = "Option::is_none")]
        call_log_id: Option<String>,
    },
    /// A request stopped ringing without being answered.
    CallCancelled {
        /// Request id.
        request_id: RequestId,
        /// Why.
        reason: CancelReason,
    },
    /// Sent to the visitor when the agent picked up.
    CallStarted {
        /// New call id.
        call_id: CallId,
        /// Accepted request.
        request_id: RequestId,
        /// The agent on the call.
        agent: AgentCard,
    },
    /// The call is over.
    CallEnded {
        /// Call id.
        call_id: CallId,
        /// Why it ended.
        reason: EndReason,
    },
    /// Agent dashboard counters.
    StatsUpdate(AgentStats),
    /// The server forced the agent to `away`.
    AgentMarkedAway {
        /// Why (`ring_no_answer`, `heartbeat_stale`).
        reason: String,
    },
    /// Agent login succeeded.
    LoginSuccess {
        /// Agent id.
        agent_id: AgentId,
        /// Status after login.
        status: AgentStatus,
        /// Whether this login resumed a session inside the grace period.
        reconnected: bool,
        /// Current dashboard counters.
        stats: AgentStats,
    },
    /// Relayed WebRTC signal.
    WebrtcSignal {
        /// Sender (visitor or agent id).
        from: String,
        /// Opaque blob.
        signal: Value,
    },
}

impl OutboundEvent {
    /// Wire name of the event.
    pub fn name(&self) -> &'static str {
        match self {
            Self::AgentAssigned { .. } => "AGENT_ASSIGNED",
            Self::AgentReassigned { .. } => "AGENT_REASSIGNED",
            Self::AgentUnavailable { .. } => "AGENT_UNAVAILABLE",
            Self::Error { .. } => "ERROR",
            Self::CallIncoming { .. } => "CALL_INCOMING",
            Self::CallAccepted { .. } => "CALL_ACCEPTED",
            Self::CallCancelled { .. } => "CALL_CANCELLED",
            Self::CallStarted { .. } => "CALL_STARTED",
            Self::CallEnded { .. } => "CALL_ENDED",
            Self::StatsUpdate(_) => "STATS_UPDATE",
            Self::AgentMarkedAway { .. } => "AGENT_MARKED_AWAY",
            Self::LoginSuccess { .. } => "LOGIN_SUCCESS",
            Self::WebrtcSignal { .. } => "WEBRTC_SIGNAL",
        }
    }

    /// Build an `ERROR` event.
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Error {
            code,
            message: message.into(),
        }
    }

    /// Serialize to a wire frame with the current UTC timestamp.
    pub fn to_frame(&self) -> Result<String, serde_json::Error> {
        let mut value = serde_json::to_value(self)?;
        if let Value::Object(map) = &mut value {
            let _ = map.insert("timestamp".into(), Value::String(now_rfc3339()));
        }
        serde_json::to_string(&value)
    }
}

/// Structured error inside an [`Ack`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Error code.
    pub code: ErrorCode,
    /// Human-readable message.
    pub message: String,
}

/// Reply to an inbound frame that carried an `id` (and always to
/// `AGENT_AWAY` / `AGENT_BACK`).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Ack {
    /// Echoed correlation id.
    pub id: Option<String>,
    /// Whether the event was applied.
    pub success: bool,
    /// Result payload on success.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Error payload on failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl Ack {
    /// Successful ack.
    pub fn success(id: Option<String>, result: Value) -> Self {
        Self {
            id,
            success: true,
            result: Some(result),
            error: None,
        }
    }

    /// Failed ack.
    pub fn failure(id: Option<String>, code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            id,
            success: false,
            result: None,
            error: Some(ErrorBody {
                code,
                message: message.into(),
            }),
        }
    }

    /// Serialize to a wire frame.
    pub fn to_frame(&self) -> Result<String, serde_json::Error> {
        let mut value = serde_json::to_value(self)?;
        if let Value::Object(map) = &mut value {
            let _ = map.insert("type".into(), Value::String("ACK".into()));
        }
        serde_json::to_string(&value)
    }
}

fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde_json::json;

    #[test]
    fn parses_visitor_join() {
        let frame = InboundFrame::parse(
            r#"{"type":"VISITOR_JOIN","payload":{"orgId":"org-1","pageUrl":"https://acme.test/pricing"}}"#,
        )
        .unwrap();
        assert!(frame.id.is_none());
        assert_matches!(frame.event, InboundEvent::VisitorJoin(join) => {
            assert_eq!(join.org_id.as_str(), "org-1");
            assert!(join.visitor_id.is_none());
        });
    }

    #[test]
    fn missing_payload_decodes_optional_structs() {
        let frame = InboundFrame::parse(r#"{"type":"AGENT_AWAY","id":"a1"}"#).unwrap();
        assert_eq!(frame.id.as_deref(), Some("a1"));
        assert_matches!(frame.event, InboundEvent::AgentAway(p) if p.reason.is_none());

        let frame = InboundFrame::parse(r#"{"type":"heartbeat"}"#).unwrap();
        assert_matches!(frame.event, InboundEvent::Heartbeat);
    }

    #[test]
    fn unknown_type_keeps_id() {
        let err = InboundFrame::parse(r#"{"type":"NOPE","id":"x"}"#).unwrap_err();
        assert_eq!(err.id.as_deref(), Some("x"));
        assert_matches!(err.error, ProtocolError::UnknownType(t) if t == "NOPE");
    }

    #[test]
    fn invalid_payload_reports_kind() {
        let err = InboundFrame::parse(r#"{"type":"CALL_REQUEST","payload":{}}"#).unwrap_err();
        assert_matches!(err.error, ProtocolError::InvalidPayload { ref kind, .. } if kind == "CALL_REQUEST");
    }

    #[test]
    fn garbage_is_malformed() {
        let err = InboundFrame::parse("not json").unwrap_err();
        assert!(err.id.is_none());
        assert_matches!(err.error, ProtocolError::Malformed(_));
    }

    #[test]
    fn agent_status_uses_snake_case() {
        let frame =
            InboundFrame::parse(r#"{"type":"AGENT_STATUS","payload":{"status":"in_call"}}"#)
                .unwrap();
        assert_matches!(frame.event, InboundEvent::AgentStatus(p) if p.status == AgentStatus::InCall);
    }

    #[test]
    fn outbound_frame_shape() {
        let event = OutboundEvent::CallIncoming {
            request_id: RequestId::from_raw("req_1"),
            visitor_id: VisitorId::from_raw("v1"),
            page_url: "https://acme.test/".into(),
            location: None,
        };
        let frame: Value = serde_json::from_str(&event.to_frame().unwrap()).unwrap();
        assert_eq!(frame["type"], "CALL_INCOMING");
        assert_eq!(frame["payload"]["requestId"], "req_1");
        assert_eq!(frame["payload"]["visitorId"], "v1");
        assert!(frame["payload"].get("location").is_none());
        assert!(frame["timestamp"].as_str().unwrap().ends_with('Z'));
    }

    #[test]
    fn stats_update_payload_is_flat() {
        let event = OutboundEvent::StatsUpdate(AgentStats {
            watching: 2,
            waiting: 1,
            ringing: 0,
            in_call: false,
            max_simulations: 5,
        });
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "STATS_UPDATE");
        assert_eq!(value["payload"]["maxSimulations"], 5);
        assert_eq!(value["payload"]["inCall"], false);
        assert_eq!(event.name(), "STATS_UPDATE");
    }

    #[test]
    fn error_event_carries_code() {
        let value =
            serde_json::to_value(OutboundEvent::error(ErrorCode::CallNotFound, "gone")).unwrap();
        assert_eq!(value, json!({"type": "ERROR", "payload": {"code": "CALL_NOT_FOUND", "message": "gone"}}));
    }

    #[test]
    fn ack_frames() {
        let ok: Value = serde_json::from_str(
            &Ack::success(Some("r1".into()), json!({"status": "away"}))
                .to_frame()
                .unwrap(),
        )
        .unwrap();
        assert_eq!(ok["type"], "ACK");
        assert_eq!(ok["success"], true);
        assert_eq!(ok["result"]["status"], "away");

        let err: Value = serde_json::from_str(
            &Ack::failure(None, ErrorCode::AgentNotFound, "who?")
                .to_frame()
                .unwrap(),
        )
        .unwrap();
        assert_eq!(err["success"], false);
        assert_eq!(err["error"]["code"], "AGENT_NOT_FOUND");
        assert!(err.get("result").is_none());
    }
}
