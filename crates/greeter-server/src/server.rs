//! `GreeterServer`: Axum HTTP + WebSocket server.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use axum::extract::State;
use axum::response::Json;
use axum::routing::get;
use greeter_router::EventRouter;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::config::ServerConfig;
use crate::health::{self, HealthResponse};
use crate::hub::ConnectionHub;
use crate::metrics;
use crate::shutdown::ShutdownCoordinator;
use crate::websocket::handler::ws_handler;

/// Shared state accessible from Axum handlers.
#[derive(Clone)]
pub struct AppState {
    /// Routing engine.
    pub router: Arc<EventRouter>,
    /// Open sockets.
    pub hub: Arc<ConnectionHub>,
    /// Shutdown coordinator.
    pub shutdown: Arc<ShutdownCoordinator>,
    /// Transport settings.
    pub config: Arc<ServerConfig>,
    /// When the server started.
    pub start_time: Instant,
    /// Renders `/metrics`.
    pub metrics: PrometheusHandle,
}

/// The greeter transport server.
///
/// `hub` must be the notifier `router` was built with.
pub struct GreeterServer {
    state: AppState,
}

impl GreeterServer {
    /// Create a new server.
    pub fn new(
        config: ServerConfig,
        router: Arc<EventRouter>,
        hub: Arc<ConnectionHub>,
        metrics: PrometheusHandle,
    ) -> Self {
        Self {
            state: AppState {
                router,
                hub,
                shutdown: Arc::new(ShutdownCoordinator::new()),
                config: Arc::new(config),
                start_time: Instant::now(),
                metrics,
            },
        }
    }

    /// Build the Axum app with all routes.
    pub fn app(&self) -> Router {
        Router::new()
            .route("/ws", get(ws_handler))
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .with_state(self.state.clone())
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive())
    }

    /// Bind and serve in a background task until shutdown.
    ///
    /// Returns the bound address (useful with port `0`) and the serve task.
    pub async fn listen(&self) -> std::io::Result<(SocketAddr, JoinHandle<()>)> {
        let listener = TcpListener::bind(self.state.config.bind_addr()).await?;
        let addr = listener.local_addr()?;
        let app = self.app().into_make_service_with_connect_info::<SocketAddr>();
        let token = self.state.shutdown.token();

        let handle = tokio::spawn(async move {
            let shutdown = async move { token.cancelled().await };
            if let Err(err) = axum::serve(listener, app).with_graceful_shutdown(shutdown).await {
                error!(error = %err, "server terminated");
            }
        });
        info!(%addr, "greeter server listening");
        Ok((addr, handle))
    }

    /// The routing engine.
    pub fn event_router(&self) -> &Arc<EventRouter> {
        &self.state.router
    }

    /// Open sockets.
    pub fn hub(&self) -> &Arc<ConnectionHub> {
        &self.state.hub
    }

    /// Get the shutdown coordinator.
    pub fn shutdown(&self) -> &Arc<ShutdownCoordinator> {
        &self.state.shutdown
    }

    /// Get the server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.state.config
    }
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(health::health_check(
        state.start_time,
        state.hub.len(),
        state.router.counts(),
    ))
}

/// GET /metrics
async fn metrics_handler(State(state): State<AppState>) -> String {
    metrics::render(&state.metrics)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use greeter_router::{Collaborators, StaticBackend};
    use greeter_settings::RoutingSettings;
    use metrics_exporter_prometheus::PrometheusBuilder;
    use tower::ServiceExt;

    fn make_server() -> GreeterServer {
        let config = ServerConfig::default();
        let hub = Arc::new(ConnectionHub::new(config.max_connections, config.send_queue_size));
        let router = EventRouter::new(
            RoutingSettings::default(),
            Collaborators::uniform(Arc::new(StaticBackend::default())),
            hub.clone(),
        );
        let handle = PrometheusBuilder::new().build_recorder().handle();
        GreeterServer::new(config, router, hub, handle)
    }

    async fn get_json(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let req = Request::builder().uri(uri).body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        let status = resp.status();
        let body = axum::body::to_bytes(resp.into_body(), 10_000).await.unwrap();
        (status, serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null))
    }

    #[tokio::test]
    async fn health_reports_counts() {
        let server = make_server();
        let (status, body) = get_json(server.app(), "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["connections"], 0);
        assert_eq!(body["visitors"], 0);
        assert_eq!(body["agents"], 0);
        assert_eq!(body["activeCalls"], 0);
        assert!(body["uptimeSecs"].is_number());
    }

    #[tokio::test]
    async fn metrics_endpoint_serves_text() {
        let server = make_server();
        let req = Request::builder().uri("/metrics").body(Body::empty()).unwrap();
        let resp = server.app().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn ws_without_upgrade_is_rejected() {
        let server = make_server();
        let (status, _) = get_json(server.app(), "/ws").await;
        assert!(status.is_client_error(), "{status}");
    }

    #[tokio::test]
    async fn unknown_route_returns_404() {
        let server = make_server();
        let (status, _) = get_json(server.app(), "/nonexistent").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn shutdown_propagates_to_coordinator() {
        let server = make_server();
        assert!(!server.shutdown().is_shutting_down());
        server.shutdown().shutdown();
        assert!(server.shutdown().is_shutting_down());
    }

    #[tokio::test]
    async fn listen_binds_ephemeral_port_and_stops() {
        let server = make_server();
        let (addr, handle) = server.listen().await.unwrap();
        assert_ne!(addr.port(), 0);
        server.shutdown().shutdown();
        tokio::time::timeout(std::time::Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
