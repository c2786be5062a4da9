//! End-to-end tests over real WebSocket connections.

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use greeter_router::{Collaborators, Directory, EventRouter, StaticBackend};
use greeter_server::{ConnectionHub, GreeterServer, ServerConfig};
use greeter_settings::RoutingSettings;
use serde_json::{Value, json};
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;

const TIMEOUT: Duration = Duration::from_secs(5);

type WsStream = tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

fn directory() -> Directory {
    serde_json::from_value(json!({
        "orgs": [{"orgId": "org-1", "blockedCountries": ["KP"]}],
        "pools": [
            {"poolId": "general", "orgId": "org-1", "isCatchAll": true}
        ],
        "agents": [
            {"agentId": "A1", "token": "t1", "orgId": "org-1",
             "memberships": [{"poolId": "general", "priorityRank": 1}]}
        ],
        "ipLocations": {
            "198.51.100.7": {"countryCode": "KP"}
        }
    }))
    .unwrap()
}

/// Boot a server on an ephemeral port and return its WS URL.
async fn boot_server(config: ServerConfig) -> (String, GreeterServer) {
    let hub = Arc::new(ConnectionHub::new(config.max_connections, config.send_queue_size));
    let router = EventRouter::new(
        RoutingSettings::default(),
        Collaborators::uniform(Arc::new(StaticBackend::new(directory()))),
        hub.clone(),
    );
    let metrics = metrics_exporter_prometheus::PrometheusBuilder::new()
        .build_recorder()
        .handle();
    let server = GreeterServer::new(config, router, hub, metrics);
    let (addr, _handle) = server.listen().await.unwrap();
    (format!("ws://{addr}/ws"), server)
}

async fn connect(url: &str) -> WsStream {
    let (ws, _) = timeout(TIMEOUT, connect_async(url)).await.unwrap().unwrap();
    ws
}

async fn connect_from(url: &str, ip: &'static str) -> WsStream {
    let mut request = url.into_client_request().unwrap();
    let _ = request.headers_mut().insert("x-forwarded-for", ip.parse().unwrap());
    let (ws, _) = timeout(TIMEOUT, connect_async(request)).await.unwrap().unwrap();
    ws
}

async fn send(ws: &mut WsStream, frame: Value) {
    ws.send(Message::text(frame.to_string())).await.unwrap();
}

/// Read until a frame of type `kind` arrives, skipping everything else.
async fn recv_type(ws: &mut WsStream, kind: &str) -> Value {
    timeout(TIMEOUT, async {
        loop {
            let msg = ws.next().await.expect("socket closed").unwrap();
            let Message::Text(text) = msg else { continue };
            let frame: Value = serde_json::from_str(text.as_str()).unwrap();
            if frame["type"] == kind {
                return frame;
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {kind}"))
}

/// Read until the server closes the socket; returns every text frame seen.
async fn recv_until_closed(ws: &mut WsStream) -> Vec<Value> {
    timeout(TIMEOUT, async {
        let mut frames = Vec::new();
        while let Some(Ok(msg)) = ws.next().await {
            match msg {
                Message::Text(text) => frames.push(serde_json::from_str(text.as_str()).unwrap()),
                Message::Close(_) => break,
                _ => {}
            }
        }
        frames
    })
    .await
    .expect("socket stayed open")
}

async fn login_idle(ws: &mut WsStream) {
    send(ws, json!({"type": "AGENT_LOGIN", "id": "login", "payload": {"agentId": "A1", "token": "t1"}})).await;
    let ack = recv_type(ws, "ACK").await;
    assert_eq!(ack["success"], true, "{ack}");
    send(ws, json!({"type": "AGENT_BACK"})).await;
    let ack = recv_type(ws, "ACK").await;
    assert_eq!(ack["result"]["status"], "idle");
}

#[tokio::test]
async fn heartbeat_is_acknowledged() {
    let (url, _server) = boot_server(ServerConfig::default()).await;
    let mut ws = connect(&url).await;

    send(&mut ws, json!({"type": "heartbeat", "id": "hb-1"})).await;
    let ack = recv_type(&mut ws, "ACK").await;
    assert_eq!(ack["id"], "hb-1");
    assert_eq!(ack["success"], true);
}

#[tokio::test]
async fn malformed_frame_returns_error() {
    let (url, _server) = boot_server(ServerConfig::default()).await;
    let mut ws = connect(&url).await;

    ws.send(Message::text("not json")).await.unwrap();
    let err = recv_type(&mut ws, "ERROR").await;
    assert_eq!(err["payload"]["code"], "INVALID_MESSAGE");

    // The connection survives.
    send(&mut ws, json!({"type": "heartbeat", "id": "after"})).await;
    assert_eq!(recv_type(&mut ws, "ACK").await["id"], "after");
}

#[tokio::test]
async fn visitor_call_flow_end_to_end() {
    let (url, server) = boot_server(ServerConfig::default()).await;

    let mut agent = connect(&url).await;
    login_idle(&mut agent).await;

    let mut visitor = connect(&url).await;
    send(
        &mut visitor,
        json!({"type": "VISITOR_JOIN", "payload": {"orgId": "org-1", "pageUrl": "https://acme.test/"}}),
    )
    .await;
    let assigned = recv_type(&mut visitor, "AGENT_ASSIGNED").await;
    assert_eq!(assigned["payload"]["agent"]["agentId"], "A1");

    send(&mut visitor, json!({"type": "CALL_REQUEST", "id": "c1", "payload": {"agentId": "A1"}})).await;
    let incoming = recv_type(&mut agent, "CALL_INCOMING").await;
    let request_id = incoming["payload"]["requestId"].clone();
    assert_eq!(incoming["payload"]["visitorId"], assigned["payload"]["visitorId"]);

    send(&mut agent, json!({"type": "CALL_ACCEPT", "payload": {"requestId": request_id}})).await;
    let started = recv_type(&mut visitor, "CALL_STARTED").await;
    assert_eq!(started["payload"]["agent"]["agentId"], "A1");
    let accepted = recv_type(&mut agent, "CALL_ACCEPTED").await;
    assert_eq!(accepted["payload"]["callId"], started["payload"]["callId"]);
    assert_eq!(server.event_router().counts().active_calls, 1);

    // Visitor drops: the agent hears the call ended.
    drop(visitor);
    let ended = recv_type(&mut agent, "CALL_ENDED").await;
    assert_eq!(ended["payload"]["callId"], started["payload"]["callId"]);
    assert_eq!(server.event_router().counts().active_calls, 0);
    assert_eq!(server.event_router().counts().visitors, 0);
}

#[tokio::test]
async fn blocked_visitor_is_closed_without_error() {
    let (url, server) = boot_server(ServerConfig::default()).await;
    let mut visitor = connect_from(&url, "198.51.100.7").await;

    send(
        &mut visitor,
        json!({"type": "VISITOR_JOIN", "payload": {"orgId": "org-1", "pageUrl": "https://acme.test/"}}),
    )
    .await;
    let frames = recv_until_closed(&mut visitor).await;
    assert!(frames.iter().all(|f| f["type"] != "ERROR"), "{frames:?}");
    assert_eq!(server.event_router().counts().visitors, 0);
}

#[tokio::test]
async fn second_login_closes_previous_socket() {
    let (url, _server) = boot_server(ServerConfig::default()).await;
    let mut first = connect(&url).await;
    login_idle(&mut first).await;

    let mut second = connect(&url).await;
    send(&mut second, json!({"type": "AGENT_LOGIN", "id": "again", "payload": {"agentId": "A1", "token": "t1"}})).await;
    assert_eq!(recv_type(&mut second, "ACK").await["success"], true);

    let _ = recv_until_closed(&mut first).await;
}

#[tokio::test]
async fn upgrade_refused_at_connection_limit() {
    let config = ServerConfig {
        max_connections: 1,
        ..ServerConfig::default()
    };
    let (url, server) = boot_server(config).await;
    let mut ws = connect(&url).await;
    // Registration happens after the upgrade; an ack proves it is done.
    send(&mut ws, json!({"type": "heartbeat", "id": "1"})).await;
    let _ = recv_type(&mut ws, "ACK").await;
    assert_eq!(server.hub().len(), 1);

    let refused = timeout(TIMEOUT, connect_async(url.as_str())).await.unwrap();
    assert!(refused.is_err());
}

#[tokio::test]
async fn shutdown_closes_open_sockets() {
    let (url, server) = boot_server(ServerConfig::default()).await;
    let mut ws = connect(&url).await;
    send(&mut ws, json!({"type": "heartbeat", "id": "1"})).await;
    let _ = recv_type(&mut ws, "ACK").await;

    server.shutdown().shutdown();
    let _ = recv_until_closed(&mut ws).await;
}
