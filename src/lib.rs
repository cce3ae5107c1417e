//! Camwatch
//!
//! Camera AI watcher: vision-model frame analysis bridged to Home
//! Assistant over MQTT.
//!
//! ## Architecture (7 Components)
//!
//! 1. ConfigStore - flat-file settings with hot reload
//! 2. CaptureSource - RTSP stream reader / Home Assistant polling
//! 3. VisionClient - vision model communication adapter
//! 4. DetectionRegistry - user-defined detection rules
//! 5. AnalysisOrchestrator - the capture-and-analysis loop
//! 6. MqttPublisher - Home Assistant autodiscovery over MQTT
//! 7. WebAPI - REST API endpoints
//!
//! ## Design Principles
//!
//! - SSoT: ConfigStore is the single source of truth for settings
//! - One capture session at a time, one background worker task
//! - Snapshots (status, result) are replaced whole-value, never mutated
//!   in place under a reader

pub mod ai_client;
pub mod capture;
pub mod config_store;
pub mod detection_registry;
pub mod frame_hub;
pub mod mqtt_publisher;
pub mod orchestrator;
pub mod web_api;
pub mod models;
pub mod error;
pub mod state;

pub use error::{Error, Result};
pub use state::AppState;
