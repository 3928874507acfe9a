//! Admin and ingest HTTP surface

use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tower_http::{catch_panic::CatchPanicLayer, trace::TraceLayer};
use tracing::{error, info, warn};

use crate::config::Config;
use crate::recovery::{Orchestrator, RecoveryRequest};
use crate::{Error, Result};

/// Shared application state
pub struct AppState {
    /// Recovery engine
    pub orchestrator: Arc<Orchestrator>,
    /// Cancelled on shutdown; in-flight recoveries stop early
    pub shutdown: CancellationToken,
}

/// Create the router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/recover", post(recover_handler))
        .route("/playbooks", get(playbooks_handler))
        .route("/circuits", get(circuits_handler))
        .route("/circuits/open", get(open_circuits_handler))
        .route(
            "/circuits/{classification}/{resource_id}",
            get(circuit_handler),
        )
        .route(
            "/circuits/{classification}/{resource_id}/reset",
            post(reset_circuit_handler),
        )
        .layer(CatchPanicLayer::new())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let open = state.orchestrator.open_circuits();
    Json(json!({
        "status": if open.is_empty() { "healthy" } else { "degraded" },
        "version": env!("CARGO_PKG_VERSION"),
        "playbooks": state.orchestrator.playbooks().len(),
        "circuits": state.orchestrator.breakers().len(),
        "open_circuits": open,
    }))
}

async fn recover_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<RecoveryRequest>,
) -> impl IntoResponse {
    if request.classification.trim().is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "classification is required");
    }
    let result = state
        .orchestrator
        .recover_with_cancel(&request, state.shutdown.child_token())
        .await;
    Json(result).into_response()
}

#[derive(Debug, Deserialize)]
struct PlaybookQuery {
    platform: Option<String>,
}

async fn playbooks_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<PlaybookQuery>,
) -> impl IntoResponse {
    let registry = state.orchestrator.playbooks();
    let playbooks = match query.platform.as_deref() {
        Some(platform) => registry.by_platform(platform),
        None => registry.all(),
    };
    Json(json!({
        "count": playbooks.len(),
        "playbooks": playbooks,
    }))
}

async fn circuits_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.orchestrator.all_circuits())
}

async fn open_circuits_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.orchestrator.open_circuits())
}

async fn circuit_handler(
    State(state): State<Arc<AppState>>,
    Path((classification, resource_id)): Path<(String, String)>,
) -> Response {
    match state
        .orchestrator
        .circuit_status(&classification, &resource_id)
    {
        Some(status) => Json(json!({
            "status": status,
            "message": state.orchestrator.circuit_message(&classification, &resource_id),
        }))
        .into_response(),
        None => error_response(
            StatusCode::NOT_FOUND,
            &format!("No circuit breaker for '{classification}:{resource_id}'"),
        ),
    }
}

async fn reset_circuit_handler(
    State(state): State<Arc<AppState>>,
    Path((classification, resource_id)): Path<(String, String)>,
) -> Response {
    if state
        .orchestrator
        .reset_circuit(&classification, &resource_id)
    {
        Json(json!({
            "reset": true,
            "status": state.orchestrator.circuit_status(&classification, &resource_id),
        }))
        .into_response()
    } else {
        error_response(
            StatusCode::NOT_FOUND,
            &format!("No circuit breaker for '{classification}:{resource_id}'"),
        )
    }
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}

/// HTTP server wrapping the recovery engine
pub struct RecoveryServer {
    config: Config,
    orchestrator: Arc<Orchestrator>,
}

impl RecoveryServer {
    /// Create a server
    #[must_use]
    pub fn new(config: Config, orchestrator: Arc<Orchestrator>) -> Self {
        Self {
            config,
            orchestrator,
        }
    }

    /// Serve until Ctrl+C / SIGTERM
    pub async fn run(self) -> Result<()> {
        let addr: SocketAddr = format!("{}:{}", self.config.server.host, self.config.server.port)
            .parse()
            .map_err(|e| Error::Config(format!("Invalid listen address: {e}")))?;

        let shutdown = CancellationToken::new();
        let state = Arc::new(AppState {
            orchestrator: Arc::clone(&self.orchestrator),
            shutdown: shutdown.clone(),
        });
        let app = create_router(state);

        let listener = TcpListener::bind(addr).await?;

        info!("============================================================");
        info!("PIPELINE RECOVERY v{}", env!("CARGO_PKG_VERSION"));
        info!("============================================================");
        info!(host = %self.config.server.host, port = %self.config.server.port, "Listening");
        info!(playbooks = self.orchestrator.playbooks().len(), "Playbooks loaded");
        info!(
            "  POST http://{}:{}/recover",
            self.config.server.host, self.config.server.port
        );
        info!("============================================================");

        // Idle breaker sweep
        let orchestrator = Arc::clone(&self.orchestrator);
        let sweep_interval = self
            .config
            .circuit_breaker
            .sweep_interval
            .max(Duration::from_secs(1));
        let sweep_shutdown = shutdown.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(sweep_interval);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let removed = orchestrator.evict_idle_circuits();
                        if removed > 0 {
                            info!(removed, "Evicted idle circuit breakers");
                        }
                    }
                    () = sweep_shutdown.cancelled() => break,
                }
            }
        });

        let grace = self.config.server.shutdown_timeout;
        let server = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
            .into_future();
        let drain_deadline = async {
            shutdown.cancelled().await;
            tokio::time::sleep(grace).await;
        };

        tokio::select! {
            served = server => served.map_err(|e| Error::Internal(e.to_string()))?,
            () = drain_deadline => {
                warn!(grace_secs = grace.as_secs(), "Connections still open after shutdown grace period");
            }
        }

        info!("Server stopped");
        Ok(())
    }
}

/// Resolve on Ctrl+C or SIGTERM and cancel `shutdown`
async fn shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received, cancelling in-flight recoveries");
    shutdown.cancel();
}
