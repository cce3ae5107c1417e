//! Application state
//!
//! Holds all shared components and state

use crate::config_store::ConfigStore;
use crate::detection_registry::DetectionRegistry;
use crate::frame_hub::FrameHub;
use crate::mqtt_publisher::MqttPublisher;
use crate::orchestrator::AnalysisOrchestrator;
use std::path::PathBuf;
use std::sync::Arc;

/// Application configuration
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Server host
    pub host: String,
    /// Server port
    pub port: u16,
    /// Path to the flat settings file managed by the admin UI
    pub settings_path: PathBuf,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            host: std::env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: std::env::var("PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(8080),
            settings_path: std::env::var("SETTINGS_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(".env")),
        }
    }
}

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    /// Application config
    pub config: AppConfig,
    /// ConfigStore (SSoT for runtime settings)
    pub config_store: Arc<ConfigStore>,
    /// DetectionRegistry (user-defined detection rules)
    pub registry: Arc<DetectionRegistry>,
    /// MqttPublisher (Home Assistant autodiscovery)
    pub mqtt: Arc<MqttPublisher>,
    /// AnalysisOrchestrator (capture-and-analysis loop)
    pub orchestrator: Arc<AnalysisOrchestrator>,
    /// FrameHub (MJPEG stream distribution)
    pub frame_hub: FrameHub,
}
