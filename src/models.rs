//! Shared models and types for Camwatch
//!
//! This module contains types shared across multiple modules
//! to avoid circular dependencies.

use serde::{Deserialize, Serialize};

/// Standard API response wrapper
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(msg: impl Into<String>) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(msg.into()),
        }
    }
}

/// Health check response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub mqtt_connected: bool,
    pub capturing: bool,
}

/// Lightweight metrics snapshot read by the UI poller
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsResponse {
    /// Analyses per second, derived from the last analysis duration
    pub fps: f64,
    /// Duration of the last analysis in seconds
    pub duration_seconds: f64,
    /// Timestamp of the last analysis (RFC 3339), if any ran yet
    pub timestamp: Option<String>,
    /// People count from the last analysis
    pub people_count: Option<u32>,
}

/// One detection's answer within an analysis cycle
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionAnswer {
    pub detection_id: uuid::Uuid,
    pub name: String,
    pub matched: bool,
}

/// Result of one analysis cycle; overwrites the previous snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub people_count: u32,
    /// Per-detection answers in detection creation order
    pub answers: Vec<DetectionAnswer>,
    pub duration_seconds: f64,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl AnalysisResult {
    /// Analyses per second implied by the last duration
    pub fn fps(&self) -> f64 {
        if self.duration_seconds > 0.0 {
            1.0 / self.duration_seconds
        } else {
            0.0
        }
    }
}

/// Capture session lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureState {
    Stopped,
    Starting,
    Running,
    Reconnecting,
}

/// Capture session status snapshot, replaced whole-value on transitions
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureStatus {
    pub state: CaptureState,
    pub is_capturing: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_frame_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl CaptureStatus {
    pub fn stopped() -> Self {
        Self {
            state: CaptureState::Stopped,
            is_capturing: false,
            source: None,
            started_at: None,
            last_frame_at: None,
        }
    }
}

impl Default for CaptureStatus {
    fn default() -> Self {
        Self::stopped()
    }
}
