//! Axum-based WebSocket server.

use std::future::Future;
use std::sync::Arc;

use axum::{
    Router,
    Json,
    extract::{Path, Query, State, WebSocketUpgrade},
    http::{HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::json;
use tower::ServiceBuilder;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use facetalk_pipeline::{Job, JobError, RenderJob};

use crate::connection::handle_ws_connection;
use crate::state::GatewayState;

#[derive(Debug, Default, Deserialize)]
pub struct ConnectParams {
    /// Avatar bound when the session opens.
    pub avatar_id: Option<String>,
}

/// Replies to render ahead of time for one avatar.
#[derive(Debug, Deserialize)]
pub struct PrewarmRequest {
    pub avatar_id: String,
    pub texts: Vec<String>,
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    if origins.is_empty() {
        return CorsLayer::permissive();
    }
    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|o| match HeaderValue::from_str(o) {
            Ok(v) => Some(v),
            Err(_) => {
                warn!(origin = %o, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();
    CorsLayer::new()
        .allow_origin(AllowOrigin::list(allowed))
        .allow_methods(tower_http::cors::Any)
        .allow_headers(tower_http::cors::Any)
}

/// Build the gateway router: `/ws/session/{id}`, `/health`, `/prewarm`,
/// `/media`, and `/metrics` when enabled.
pub fn router(state: Arc<GatewayState>) -> Router {
    let origins = state
        .config
        .gateway
        .as_ref()
        .map(|g| g.cors_origins.clone())
        .unwrap_or_default();

    let mut app = Router::new()
        .route("/ws/session/{session_id}", get(ws_handler))
        .route("/health", get(health_handler))
        .route("/prewarm", post(prewarm_handler));

    #[cfg(feature = "metrics")]
    if state.metrics.is_some() {
        app = app.route("/metrics", get(crate::metrics::metrics_handler));
    }

    if let Some(dir) = &state.media_dir {
        app = app.nest_service("/media", ServeDir::new(dir));
    }

    app.with_state(state).layer(
        ServiceBuilder::new()
            .layer(TraceLayer::new_for_http())
            .layer(cors_layer(&origins)),
    )
}

/// Serve on an already-bound listener until `shutdown` resolves, then stop
/// background jobs and close every live session.
pub async fn serve(
    state: Arc<GatewayState>,
    listener: tokio::net::TcpListener,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let registry = state.registry.clone();
    let jobs = state.jobs.clone();
    let app = router(state);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    jobs.shutdown();
    registry.shutdown_all();
    Ok(())
}

/// Start the gateway on the configured bind address and `port`.
pub async fn start_gateway(state: Arc<GatewayState>, port: u16) -> anyhow::Result<()> {
    let addr = format!("{}:{port}", state.config.bind_addr());
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Gateway listening on {addr}");

    serve(state, listener, shutdown_signal()).await
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(session_id): Path<String>,
    Query(params): Query<ConnectParams>,
    State(state): State<Arc<GatewayState>>,
) -> Response {
    let max = state.config.max_connections();
    if state.registry.len() >= max {
        warn!(session_id = %session_id, max, "Connection limit reached, refusing session");
        #[cfg(feature = "metrics")]
        crate::metrics::record_rejected("capacity");
        return (StatusCode::SERVICE_UNAVAILABLE, "Too many active sessions").into_response();
    }

    ws.on_upgrade(move |socket| handle_ws_connection(state, socket, session_id, params.avatar_id))
}

async fn health_handler(State(state): State<Arc<GatewayState>>) -> impl IntoResponse {
    let version = env!("CARGO_PKG_VERSION");
    let cache = state.registry.pipeline().cache().stats();

    axum::Json(json!({
        "status": "ok",
        "version": version,
        "sessions": state.registry.len(),
        "cache": cache,
    }))
}

/// Queue one render job per text. Texts already being rendered are skipped.
async fn prewarm_handler(
    State(state): State<Arc<GatewayState>>,
    Json(req): Json<PrewarmRequest>,
) -> Response {
    if req.avatar_id.trim().is_empty() {
        return (StatusCode::BAD_REQUEST, "avatar_id is required").into_response();
    }

    let mut accepted = Vec::new();
    for text in req.texts.into_iter().filter(|t| !t.trim().is_empty()) {
        let job = RenderJob::new(state.registry.pipeline().clone(), req.avatar_id.clone(), text);
        let key = job.idempotency_key();
        if state.jobs.is_running(&key) || accepted.contains(&key) {
            continue;
        }
        accepted.push(key.clone());

        let jobs = state.jobs.clone();
        tokio::spawn(async move {
            match jobs.run(&job).await {
                Ok(rendered) => debug!(key = %key, video_url = %rendered.video_url, "Pre-render done"),
                Err(JobError::Duplicate(_)) => {}
                Err(e) => warn!(key = %key, error = %e, "Pre-render failed"),
            }
        });
    }

    info!(avatar_id = %req.avatar_id, jobs = accepted.len(), "Pre-render queued");
    (StatusCode::ACCEPTED, Json(json!({ "accepted": accepted }))).into_response()
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Shutdown signal received"),
        Err(e) => {
            error!("Failed to install CTRL+C handler: {e}");
            std::future::pending::<()>().await;
        }
    }
}
