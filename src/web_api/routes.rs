//! API Routes

use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::IntoResponse,
    routing::{delete, get, post, put},
    Json, Router,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use bytes::BytesMut;
use serde_json::json;
use std::collections::BTreeMap;
use tokio_stream::{wrappers::BroadcastStream, StreamExt};
use uuid::Uuid;

use crate::ai_client::VisionClient;
use crate::capture::RtspSource;
use crate::config_store::{CaptureMode, CaptureSettings};
use crate::detection_registry::{CreateDetectionRequest, UpdateDetectionRequest};
use crate::error::{Error, Result};
use crate::models::ApiResponse;
use crate::state::AppState;

/// Placeholder the admin UI echoes back for masked secrets; such values
/// must never be written to the settings file
const MASKED_VALUE: &str = "********";

/// Create API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health & Status
        .route("/healthz", get(super::health_check))
        .route("/api/status", get(super::device_status))
        // Capture session
        .route("/api/capture/start", post(start_capture))
        .route("/api/capture/stop", post(stop_capture))
        .route("/api/capture/status", get(capture_status))
        // Detections
        .route("/api/detections", get(list_detections))
        .route("/api/detections", post(create_detection))
        .route("/api/detections/:id", put(update_detection))
        .route("/api/detections/:id", delete(delete_detection))
        // Analysis results
        .route("/api/metrics", get(get_metrics))
        .route("/api/analysis", get(get_analysis))
        // Admin configuration
        .route("/api/config", get(get_config))
        .route("/api/config", put(put_config))
        .route("/api/config/reload", post(reload_config))
        // Connectivity tests
        .route("/api/test/ai", post(test_ai))
        .route("/api/test/mqtt", post(test_mqtt))
        .route("/api/test/rtsp", post(test_rtsp))
        // Frames
        .route("/api/current_frame", get(current_frame))
        .route("/video_feed", get(video_feed))
        .with_state(state)
}

// ========================================
// Capture Handlers
// ========================================

async fn start_capture(State(state): State<AppState>) -> Result<impl IntoResponse> {
    state.orchestrator.start().await?;
    Ok(Json(json!({ "status": "started" })))
}

async fn stop_capture(State(state): State<AppState>) -> Result<impl IntoResponse> {
    state.orchestrator.stop().await?;
    Ok(Json(json!({ "status": "stopped" })))
}

async fn capture_status(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.orchestrator.status().await)
}

// ========================================
// Detection Handlers
// ========================================

async fn list_detections(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.registry.list().await)
}

async fn create_detection(
    State(state): State<AppState>,
    Json(req): Json<CreateDetectionRequest>,
) -> Result<impl IntoResponse> {
    let detection = state.registry.create(req).await?;

    // entity announcement is best-effort; the rule exists either way
    if let Err(e) = state.mqtt.announce_detection(&detection).await {
        tracing::warn!(detection_id = %detection.id, error = %e, "Entity announcement failed");
    }

    Ok((StatusCode::CREATED, Json(ApiResponse::success(detection))))
}

async fn update_detection(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<UpdateDetectionRequest>,
) -> Result<impl IntoResponse> {
    let detection = state.registry.update(id, req).await?;

    // the display name may have changed; unique_id stays stable
    if let Err(e) = state.mqtt.announce_detection(&detection).await {
        tracing::warn!(detection_id = %detection.id, error = %e, "Entity announcement failed");
    }

    Ok(Json(ApiResponse::success(detection)))
}

async fn delete_detection(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse> {
    state.registry.delete(id).await?;

    if let Err(e) = state.mqtt.remove_detection(id).await {
        tracing::warn!(detection_id = %id, error = %e, "Entity retraction failed");
    }

    Ok(Json(json!({ "ok": true })))
}

// ========================================
// Analysis Handlers
// ========================================

async fn get_metrics(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.orchestrator.metrics().await)
}

async fn get_analysis(State(state): State<AppState>) -> Result<impl IntoResponse> {
    match state.orchestrator.last_result().await {
        Some(result) => Ok(Json(result)),
        None => Err(Error::NotFound("No analysis has run yet".into())),
    }
}

// ========================================
// Config Handlers
// ========================================

async fn get_config(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.config_store.masked_entries().await)
}

async fn put_config(
    State(state): State<AppState>,
    Json(entries): Json<BTreeMap<String, String>>,
) -> Result<impl IntoResponse> {
    // masked placeholders echoed back by the UI keep their stored value
    let updates: BTreeMap<String, String> = entries
        .into_iter()
        .filter(|(_, value)| value != MASKED_VALUE)
        .collect();

    state.config_store.save(updates).await?;
    Ok(Json(json!({ "status": "saved" })))
}

async fn reload_config(State(state): State<AppState>) -> Result<impl IntoResponse> {
    state.config_store.reload().await?;
    Ok(Json(json!({ "status": "reloaded" })))
}

// ========================================
// Connectivity Test Handlers
// ========================================

async fn test_ai(State(state): State<AppState>) -> Result<impl IntoResponse> {
    let settings = state.config_store.ai_settings().await?;
    let client = VisionClient::from_settings(&settings)?;
    let response = client.test_connection().await?;

    Ok(Json(json!({
        "ok": true,
        "backend": client.backend().as_str(),
        "model": client.model(),
        "response": response,
    })))
}

async fn test_mqtt(State(state): State<AppState>) -> impl IntoResponse {
    let status = state.mqtt.connection_status();
    let ok = status["connected"].as_bool().unwrap_or(false);
    Json(json!({ "ok": ok, "mqtt": status }))
}

async fn test_rtsp(State(state): State<AppState>) -> Result<impl IntoResponse> {
    let rtsp_url = state
        .config_store
        .get("RTSP_URL")
        .await
        .filter(|u| !u.is_empty())
        .ok_or_else(|| Error::Validation("RTSP_URL is not configured".into()))?;

    let settings = CaptureSettings {
        mode: CaptureMode::Rtsp,
        rtsp_url: Some(rtsp_url),
        rtsp_username: state.config_store.get("RTSP_USERNAME").await,
        rtsp_password: state.config_store.get("RTSP_PASSWORD").await,
        ha_base_url: None,
        ha_token: None,
        ha_entity_id: None,
        ha_image_attr: String::new(),
        poll_interval: std::time::Duration::from_secs(1),
    };

    let bytes = RtspSource::probe(&settings).await?;
    Ok(Json(json!({ "ok": true, "frame_bytes": bytes })))
}

// ========================================
// Frame Handlers
// ========================================

async fn current_frame(State(state): State<AppState>) -> Result<impl IntoResponse> {
    match state.frame_hub.latest().await {
        Some(frame) => Ok(Json(json!({
            "image": format!("data:image/jpeg;base64,{}", BASE64.encode(frame.as_slice())),
        }))),
        None => Err(Error::NotFound("No frame available".into())),
    }
}

/// Continuous MJPEG stream while capturing
async fn video_feed(State(state): State<AppState>) -> impl IntoResponse {
    let rx = state.frame_hub.subscribe();
    let stream = BroadcastStream::new(rx)
        .filter_map(|result| result.ok())
        .map(|frame| {
            let mut buf = BytesMut::new();
            buf.extend_from_slice(b"--frame\r\n");
            buf.extend_from_slice(b"Content-Type: image/jpeg\r\n");
            buf.extend_from_slice(format!("Content-Length: {}\r\n\r\n", frame.len()).as_bytes());
            buf.extend_from_slice(&frame);
            buf.extend_from_slice(b"\r\n");
            Ok::<_, std::io::Error>(buf.freeze())
        });

    (
        StatusCode::OK,
        [(
            header::CONTENT_TYPE,
            "multipart/x-mixed-replace; boundary=frame",
        )],
        axum::body::Body::from_stream(stream),
    )
}
