use crate::scan::{dispatch, ScanRequest, ScanResult, ScannerContext};
use anyhow::Result;
use axum::{
    http::StatusCode,
    routing::{get, post},
    Extension, Json, Router,
};
use serde::{Deserialize, Serialize};
use std::net::{SocketAddr, TcpListener};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

/// Controller notice that this scanner's session is over.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionNotice {
    #[serde(default)]
    pub scanner_id: String,
    #[serde(default)]
    pub reason: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub scanner_id: String,
    pub db_version: Option<String>,
}

struct ListenerState {
    ctx: Arc<ScannerContext>,
    notices: mpsc::Sender<SessionNotice>,
    scanner_id: String,
}

/// Inbound HTTP surface the controller calls into.
pub struct Listener {
    state: Arc<ListenerState>,
}

impl Listener {
    pub fn new(
        ctx: Arc<ScannerContext>,
        notices: mpsc::Sender<SessionNotice>,
        scanner_id: &str,
    ) -> Self {
        Self {
            state: Arc::new(ListenerState {
                ctx,
                notices,
                scanner_id: scanner_id.to_string(),
            }),
        }
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/v1/scan", post(handle_scan))
            .route("/v1/session/shutdown", post(handle_session_shutdown))
            .route("/v1/health", get(handle_health))
            .layer(Extension(self.state.clone()))
    }

    /// Serves until `shutdown` turns true.
    pub async fn start(self, port: u16, shutdown: watch::Receiver<bool>) -> Result<()> {
        let listener = TcpListener::bind(SocketAddr::from(([0, 0, 0, 0], port)))?;
        self.serve(listener, shutdown).await
    }

    pub async fn serve(self, listener: TcpListener, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        listener.set_nonblocking(true)?;
        let addr = listener.local_addr()?;
        tracing::info!(scanner_id = %self.state.scanner_id, %addr, "Scanner listener started");

        axum::Server::from_tcp(listener)?
            .serve(self.router().into_make_service())
            .with_graceful_shutdown(async move {
                while !*shutdown.borrow() {
                    if shutdown.changed().await.is_err() {
                        std::future::pending::<()>().await;
                    }
                }
            })
            .await
            .map_err(|e| anyhow::anyhow!("Scanner listener error: {}", e))
    }
}

async fn handle_scan(
    Extension(state): Extension<Arc<ListenerState>>,
    Json(request): Json<ScanRequest>,
) -> Result<Json<ScanResult>, (StatusCode, String)> {
    match dispatch(&state.ctx, &request, None).await {
        Ok(result) => Ok(Json(result)),
        Err(e) => Err((StatusCode::INTERNAL_SERVER_ERROR, e.to_string())),
    }
}

async fn handle_session_shutdown(
    Extension(state): Extension<Arc<ListenerState>>,
    Json(notice): Json<SessionNotice>,
) -> StatusCode {
    tracing::info!(reason = %notice.reason, "Controller ended the session");
    match state.notices.try_send(notice) {
        Ok(()) => StatusCode::ACCEPTED,
        // one pending notice is enough
        Err(mpsc::error::TrySendError::Full(_)) => StatusCode::ACCEPTED,
        Err(mpsc::error::TrySendError::Closed(_)) => StatusCode::SERVICE_UNAVAILABLE,
    }
}

async fn handle_health(Extension(state): Extension<Arc<ListenerState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        scanner_id: state.scanner_id.clone(),
        db_version: state.ctx.loader.version(),
    })
}
