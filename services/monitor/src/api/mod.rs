//! HTTP surface of the monitor.

pub mod camera_routes;
pub mod mobile_routes;

use crate::camera_session::SessionError;
use crate::config::ServerConfig;
use crate::monitor::{MonitorError, ParkingMonitor};
use crate::network::ShareLinkBuilder;
use crate::publisher::StreamPublisher;
use crate::relay::MobileRelay;
use anyhow::{Context, Result};
use axum::{
    extract::DefaultBodyLimit,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub monitor: Arc<ParkingMonitor>,
    pub publisher: Arc<StreamPublisher>,
    pub relay: Arc<MobileRelay>,
    pub links: Arc<ShareLinkBuilder>,
}

/// Errors returned to HTTP clients as `{"status": "error", "message": ..}`.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    Unavailable(String),

    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Prefix the message of a client error, keeping the status.
    pub(crate) fn with_context(self, context: &str) -> Self {
        match self {
            ApiError::BadRequest(msg) => ApiError::BadRequest(format!("{}: {}", context, msg)),
            other => other,
        }
    }
}

impl From<MonitorError> for ApiError {
    fn from(e: MonitorError) -> Self {
        match e {
            MonitorError::Session(SessionError::Busy(_) | SessionError::Reconfigured) => {
                ApiError::Unavailable("Camera is being reconfigured, try again".to_string())
            }
            MonitorError::Session(SessionError::TaskFailed(msg)) => ApiError::Internal(msg),
            other => ApiError::BadRequest(other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(status = status.as_u16(), error = %self, "Request failed");
        }

        (
            status,
            Json(serde_json::json!({
                "status": "error",
                "message": self.to_string(),
            })),
        )
            .into_response()
    }
}

/// Run blocking monitor work off the async workers.
pub(crate) async fn blocking<T, F>(f: F) -> Result<T, ApiError>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ApiError::Internal(format!("Worker task failed: {}", e)))
}

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    // Pushed frames arrive base64-encoded
    let ingest_limit = state.relay.settings().max_frame_bytes / 3 * 4 + 4096;

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(camera_routes::health_check))
        .route("/set_camera", post(camera_routes::set_camera))
        .route("/reset_background", post(camera_routes::reset_background))
        .route("/update_slots", post(camera_routes::update_slots))
        .route("/status", get(camera_routes::status))
        .route("/debug", get(camera_routes::debug))
        .route("/test_camera", get(camera_routes::test_camera))
        .route("/video", get(camera_routes::video))
        .route(
            "/generate_mobile_link",
            post(mobile_routes::generate_mobile_link),
        )
        .route("/mobile/:token", get(mobile_routes::mobile_page))
        .route("/mobile_video/:token", get(mobile_routes::mobile_video))
        .route("/mobile_ws", get(mobile_routes::mobile_ws))
        .route(
            "/mobile_frame",
            post(mobile_routes::mobile_frame).layer(DefaultBodyLimit::max(ingest_limit)),
        )
        .route("/set_public_url", post(mobile_routes::set_public_url))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Start the HTTP server
pub async fn start_api_server(state: AppState, config: &ServerConfig) -> Result<()> {
    let router = create_router(state);
    let addr = format!("{}:{}", config.host, config.port);

    info!(address = %addr, "Starting HTTP server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .context("HTTP server error")?;

    Ok(())
}
