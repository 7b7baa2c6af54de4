//! Gateway service: HTTP surface, liveness task and shutdown.

use crate::domain::config::GatewayConfig;
use crate::domain::error::GatewayError;
use crate::middleware::{AuthLayer, GatewayMetrics, TokenVerifier};
use crate::ws::liveness::LivenessMonitor;
use crate::ws::router::SubscriptionRouter;
use crate::ws::session::{SessionConfig, SessionManager};
use crate::ws::WebSocketHandler;
use axum::{
    extract::{ws::WebSocketUpgrade, State},
    response::Response,
    routing::get,
    Extension, Json, Router,
};
use relay_store::{AccountId, Database};
use serde_json::{json, Value};
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

/// Transport-level message limit, as a multiple of the session frame limit.
/// Frames between the two limits reach the session and are answered with
/// `BAD_INPUT` instead of a dropped connection.
const TRANSPORT_LIMIT_FACTOR: usize = 4;

/// WebSocket subscription gateway.
pub struct GatewayService {
    config: GatewayConfig,
    sessions: SessionManager,
    liveness: Arc<LivenessMonitor>,
    metrics: Arc<GatewayMetrics>,
    verifier: Arc<dyn TokenVerifier>,
}

impl GatewayService {
    pub fn new(
        config: GatewayConfig,
        database: Database,
        router: SubscriptionRouter,
        verifier: Arc<dyn TokenVerifier>,
    ) -> Result<Self, GatewayError> {
        config
            .validate()
            .map_err(|e| GatewayError::Config(e.to_string()))?;

        let metrics = Arc::new(GatewayMetrics::new());
        let sessions = SessionManager::new(
            router,
            database,
            SessionConfig::from_gateway(&config),
            Arc::clone(&metrics),
        );
        let liveness = Arc::new(LivenessMonitor::new(Arc::clone(&metrics)));

        Ok(Self {
            config,
            sessions,
            liveness,
            metrics,
            verifier,
        })
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn metrics(&self) -> Arc<GatewayMetrics> {
        Arc::clone(&self.metrics)
    }

    pub fn liveness(&self) -> Arc<LivenessMonitor> {
        Arc::clone(&self.liveness)
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    /// `GET /` upgrades authenticated clients; `GET /health` reports counters.
    pub fn router(&self) -> Router {
        let state = AppState {
            sessions: self.sessions.clone(),
            liveness: Arc::clone(&self.liveness),
            metrics: Arc::clone(&self.metrics),
            max_message_size: self
                .config
                .websocket
                .max_frame_size
                .saturating_mul(TRANSPORT_LIMIT_FACTOR),
        };

        let upgrade = Router::new()
            .route("/", get(upgrade_socket))
            .route_layer(AuthLayer::new(
                Arc::clone(&self.verifier),
                Arc::clone(&self.metrics),
            ));

        Router::new()
            .merge(upgrade)
            .route("/health", get(health_check))
            .layer(TraceLayer::new_for_http())
            .with_state(state)
    }

    /// Bind the configured address and serve until `shutdown` resolves.
    pub async fn start<F>(self, shutdown: F) -> Result<(), GatewayError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = self.config.addr();
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| GatewayError::Bind(format!("{addr}: {e}")))?;
        self.serve(listener, shutdown).await
    }

    /// Serve on `listener` until `shutdown` resolves.
    ///
    /// On shutdown every open connection is terminated, which closes its
    /// session and releases its subscriptions.
    pub async fn serve<F>(self, listener: TcpListener, shutdown: F) -> Result<(), GatewayError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = listener
            .local_addr()
            .map_err(|e| GatewayError::Bind(e.to_string()))?;
        let app = self.router();
        let monitor = self.liveness.spawn(self.config.websocket.ping_interval);

        info!(
            %addr,
            environment = ?self.config.environment,
            ping_interval = ?self.config.websocket.ping_interval,
            "Gateway listening"
        );

        let liveness = Arc::clone(&self.liveness);
        let result = axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                shutdown.await;
                let terminated = liveness.terminate_all();
                info!(terminated, "Shutting down gateway");
            })
            .await;

        monitor.abort();
        match result {
            Ok(()) => {
                info!("Gateway stopped");
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "Gateway server error");
                Err(GatewayError::Serve(e.to_string()))
            }
        }
    }
}

/// Application state shared across handlers
#[derive(Clone)]
struct AppState {
    sessions: SessionManager,
    liveness: Arc<LivenessMonitor>,
    metrics: Arc<GatewayMetrics>,
    max_message_size: usize,
}

async fn upgrade_socket(
    State(state): State<AppState>,
    Extension(account): Extension<AccountId>,
    ws: WebSocketUpgrade,
) -> Response {
    let handler = WebSocketHandler::new(state.sessions, state.liveness, state.metrics);
    ws.max_message_size(state.max_message_size)
        .on_upgrade(move |socket| handler.handle(socket, account))
}

async fn health_check(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "connections": state.liveness.tracked(),
        "metrics": state.metrics.snapshot(),
    }))
}
