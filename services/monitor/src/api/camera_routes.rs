//! Camera, region and occupancy endpoints.

use super::{blocking, ApiError, AppState};
use crate::detector::OccupancyMap;
use crate::mjpeg;
use crate::monitor::Diagnostics;
use crate::region_registry::Region;
use axum::{extract::State, response::IntoResponse, response::Response, Json};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, instrument};

/// `POST /set_camera` body.
#[derive(Debug, Deserialize)]
pub struct SetCameraRequest {
    #[serde(default)]
    pub ip: Option<String>,
    #[serde(default)]
    pub index: Option<Value>,
}

/// `POST /update_slots` body.
#[derive(Debug, Deserialize)]
pub struct UpdateSlotsRequest {
    #[serde(default)]
    pub slots: Vec<Region>,
}

/// Device index from a number or a numeric string. Anything else falls back to 0.
fn parse_index(value: Option<&Value>) -> Option<u32> {
    match value? {
        Value::Null => None,
        Value::Number(n) => Some(n.as_u64().and_then(|n| u32::try_from(n).ok()).unwrap_or(0)),
        Value::String(s) => Some(s.trim().parse().unwrap_or(0)),
        _ => Some(0),
    }
}

/// Health check endpoint
pub async fn health_check() -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "service": "lotwatch-monitor"
    }))
}

#[instrument(skip(state))]
pub async fn set_camera(
    State(state): State<AppState>,
    Json(request): Json<SetCameraRequest>,
) -> Result<Json<Value>, ApiError> {
    let source = state
        .monitor
        .resolve_source(request.ip.as_deref(), parse_index(request.index.as_ref()))?;
    info!(source = %source, "Setting camera");

    let monitor = state.monitor.clone();
    let report = blocking(move || monitor.set_source(source)).await??;

    Ok(Json(json!({
        "status": "ok",
        "camera": report.camera,
        "resolution": report.resolution,
    })))
}

#[instrument(skip(state))]
pub async fn reset_background(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let monitor = state.monitor.clone();
    let reference = blocking(move || monitor.capture_reference())
        .await?
        .map_err(|e| ApiError::from(e).with_context("Failed to capture a frame for the background"))?;
    let (width, height) = reference.dimensions();

    Ok(Json(json!({
        "status": "ok",
        "message": "Background reset, this frame is now the empty reference",
        "resolution": format!("{}x{}", width, height),
        "captured_at": reference.captured_at,
    })))
}

#[instrument(skip(state, request))]
pub async fn update_slots(
    State(state): State<AppState>,
    Json(request): Json<UpdateSlotsRequest>,
) -> Json<Value> {
    let count = state.monitor.update_regions(request.slots);
    Json(json!({ "status": "ok", "slots_count": count }))
}

#[instrument(skip(state))]
pub async fn status(State(state): State<AppState>) -> Result<Json<OccupancyMap>, ApiError> {
    let monitor = state.monitor.clone();
    Ok(Json(blocking(move || monitor.status()).await?))
}

#[instrument(skip(state))]
pub async fn debug(State(state): State<AppState>) -> Result<Json<Diagnostics>, ApiError> {
    let monitor = state.monitor.clone();
    Ok(Json(blocking(move || monitor.diagnostics()).await?))
}

#[instrument(skip(state))]
pub async fn test_camera(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let monitor = state.monitor.clone();
    let cameras = blocking(move || monitor.enumerate_devices()).await?;

    Ok(Json(json!({
        "total": cameras.len(),
        "available_cameras": cameras,
    })))
}

/// Primary MJPEG stream
pub async fn video(State(state): State<AppState>) -> Response {
    mjpeg::response(state.publisher.stream())
}
