//! `GET /ws` upgrade handling.

use std::convert::Infallible;
use std::net::{IpAddr, SocketAddr};

use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, FromRequestParts, State};
use axum::http::request::Parts;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use greeter_router::ClientInfo;
use metrics::counter;
use tracing::warn;

use super::session::run_ws_session;
use crate::metrics::WS_CONNECTIONS_REJECTED_TOTAL;
use crate::server::AppState;

/// Client IP as the router should see it.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ClientAddr(pub Option<String>);

impl<S: Send + Sync> FromRequestParts<S> for ClientAddr {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let peer = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip());
        Ok(Self(client_ip(&parts.headers, peer)))
    }
}

/// First `X-Forwarded-For` hop, else the socket peer.
pub fn client_ip(headers: &HeaderMap, peer: Option<IpAddr>) -> Option<String> {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|hop| !hop.is_empty())
        .map(str::to_owned)
        .or_else(|| peer.map(|ip| ip.to_string()))
}

/// Upgrade to a WebSocket unless the server is at capacity.
pub async fn ws_handler(ws: WebSocketUpgrade, ClientAddr(ip): ClientAddr, State(state): State<AppState>) -> Response {
    if state.hub.is_full() {
        counter!(WS_CONNECTIONS_REJECTED_TOTAL).increment(1);
        warn!(ip = ?ip, "connection limit reached, refusing upgrade");
        return (StatusCode::SERVICE_UNAVAILABLE, "too many connections").into_response();
    }
    ws.max_message_size(state.config.max_message_size)
        .on_upgrade(move |socket| accept_socket(socket, ClientInfo { ip_address: ip }, state))
        .into_response()
}

async fn accept_socket(socket: WebSocket, client: ClientInfo, state: AppState) {
    let Some((connection, rx)) = state.hub.register(client, state.shutdown.child_token()) else {
        counter!(WS_CONNECTIONS_REJECTED_TOTAL).increment(1);
        warn!("connection limit reached after upgrade, closing socket");
        return;
    };
    run_ws_session(socket, connection, rx, &state).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use std::net::Ipv4Addr;

    fn peer() -> Option<IpAddr> {
        Some(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 9)))
    }

    #[test]
    fn forwarded_for_first_hop_wins() {
        let mut headers = HeaderMap::new();
        let _ = headers.insert("x-forwarded-for", HeaderValue::from_static(" 203.0.113.7 , 10.0.0.1"));
        assert_eq!(client_ip(&headers, peer()).as_deref(), Some("203.0.113.7"));
    }

    #[test]
    fn falls_back_to_peer() {
        assert_eq!(client_ip(&HeaderMap::new(), peer()).as_deref(), Some("10.0.0.9"));

        let mut headers = HeaderMap::new();
        let _ = headers.insert("x-forwarded-for", HeaderValue::from_static(""));
        assert_eq!(client_ip(&headers, peer()).as_deref(), Some("10.0.0.9"));
    }

    #[test]
    fn unknown_without_header_or_peer() {
        assert_eq!(client_ip(&HeaderMap::new(), None), None);
    }
}
