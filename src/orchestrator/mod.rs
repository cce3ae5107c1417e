//! AnalysisOrchestrator - the capture-and-analysis loop
//!
//! ## Responsibilities
//!
//! - Own the capture source lifecycle for the single active session
//! - Throttle AI calls to one per analysis window
//! - Diff per-detection boolean answers and fire webhooks on rising edges
//! - Keep the published AnalysisResult/CaptureStatus snapshots current
//!
//! One background task per session; HTTP handlers talk to it through the
//! stop flag and read whole-value snapshots. Start while a session is
//! active is a conflict, never a second loop. Stop is cooperative: the
//! loop finishes its in-flight blocking call (bounded by that call's own
//! timeout) before the source is released and `stopped` is acknowledged.

mod webhook;

pub use webhook::WebhookNotifier;

use crate::ai_client::VisionClient;
use crate::capture::{CaptureSource, Frame, ReadOutcome};
use crate::config_store::{CaptureSettings, ConfigStore};
use crate::detection_registry::DetectionRegistry;
use crate::error::{Error, Result};
use crate::frame_hub::FrameHub;
use crate::models::{AnalysisResult, CaptureState, CaptureStatus, DetectionAnswer, MetricsResponse};
use crate::mqtt_publisher::MqttPublisher;
use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};

/// Extra stop grace on top of the AI timeout and poll interval
const STOP_GRACE_MARGIN: Duration = Duration::from_secs(10);

/// Throttle gate for AI invocations: at most one per window, measured
/// from invocation start
struct AnalysisGate {
    min_interval: Duration,
    last_invocation: Option<Instant>,
}

impl AnalysisGate {
    fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_invocation: None,
        }
    }

    /// True when enough time has elapsed; arms the gate as a side effect
    fn try_pass(&mut self, now: Instant) -> bool {
        let due = self
            .last_invocation
            .map_or(true, |last| now.duration_since(last) >= self.min_interval);
        if due {
            self.last_invocation = Some(now);
        }
        due
    }
}

/// AnalysisOrchestrator instance. Cheap to clone: all state is shared,
/// a clone drives the same single session slot.
#[derive(Clone)]
pub struct AnalysisOrchestrator {
    config_store: Arc<ConfigStore>,
    registry: Arc<DetectionRegistry>,
    mqtt: Arc<MqttPublisher>,
    frame_hub: FrameHub,
    webhooks: WebhookNotifier,
    status: Arc<RwLock<CaptureStatus>>,
    last_result: Arc<RwLock<Option<AnalysisResult>>>,
    /// Session slot and cooperative stop flag in one
    running: Arc<AtomicBool>,
    worker: Arc<Mutex<Option<JoinHandle<()>>>>,
    stop_grace: Arc<RwLock<Duration>>,
}

impl AnalysisOrchestrator {
    pub fn new(
        config_store: Arc<ConfigStore>,
        registry: Arc<DetectionRegistry>,
        mqtt: Arc<MqttPublisher>,
        frame_hub: FrameHub,
    ) -> Self {
        Self {
            config_store,
            registry,
            mqtt,
            frame_hub,
            webhooks: WebhookNotifier::new(),
            status: Arc::new(RwLock::new(CaptureStatus::stopped())),
            last_result: Arc::new(RwLock::new(None)),
            running: Arc::new(AtomicBool::new(false)),
            worker: Arc::new(Mutex::new(None)),
            stop_grace: Arc::new(RwLock::new(STOP_GRACE_MARGIN)),
        }
    }

    /// Start a capture session. Conflict while one is active; config
    /// errors release the slot so a corrected start can follow.
    pub async fn start(&self) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(Error::Conflict("Capture already running".into()));
        }

        let startup = async {
            let capture = self.config_store.capture_settings().await?;
            let ai = self.config_store.ai_settings().await?;
            let vision = VisionClient::from_settings(&ai)?;
            let min_interval = self.config_store.min_analysis_interval().await?;
            Ok::<_, Error>((capture, ai, vision, min_interval))
        };

        let (capture, ai, vision, min_interval) = match startup.await {
            Ok(parts) => parts,
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };

        *self.stop_grace.write().await = ai.timeout + capture.poll_interval + STOP_GRACE_MARGIN;

        {
            let mut status = self.status.write().await;
            *status = CaptureStatus {
                state: CaptureState::Starting,
                is_capturing: true,
                source: None,
                started_at: Some(Utc::now()),
                last_frame_at: None,
            };
        }

        let this = self.clone();
        let handle = tokio::spawn(async move {
            this.run_session(vision, capture, min_interval).await;
        });
        *self.worker.lock().await = Some(handle);

        tracing::info!(
            backend = ai.backend.as_str(),
            min_interval_ms = min_interval.as_millis() as u64,
            "Capture session started"
        );
        Ok(())
    }

    /// Cooperative stop; waits for the worker to finish its in-flight
    /// cycle, bounded by the stop grace. Idempotent.
    pub async fn stop(&self) -> Result<()> {
        let was_running = self.running.swap(false, Ordering::SeqCst);
        let handle = self.worker.lock().await.take();

        if let Some(handle) = handle {
            let grace = *self.stop_grace.read().await;
            if timeout(grace, handle).await.is_err() {
                tracing::warn!(
                    grace_sec = grace.as_secs(),
                    "Worker did not stop within grace, abandoning handle"
                );
            }
        }

        if was_running {
            tracing::info!("Capture session stopped");
        }
        Ok(())
    }

    /// Current capture status snapshot
    pub async fn status(&self) -> CaptureStatus {
        self.status.read().await.clone()
    }

    /// Last analysis result snapshot, if any cycle ran
    pub async fn last_result(&self) -> Option<AnalysisResult> {
        self.last_result.read().await.clone()
    }

    /// Lightweight metrics view over the last result
    pub async fn metrics(&self) -> MetricsResponse {
        match self.last_result().await {
            Some(result) => MetricsResponse {
                fps: result.fps(),
                duration_seconds: result.duration_seconds,
                timestamp: Some(result.timestamp.to_rfc3339()),
                people_count: Some(result.people_count),
            },
            None => MetricsResponse {
                fps: 0.0,
                duration_seconds: 0.0,
                timestamp: None,
                people_count: None,
            },
        }
    }

    async fn run_session(
        &self,
        vision: VisionClient,
        capture: CaptureSettings,
        min_interval: Duration,
    ) {
        let mut source = match CaptureSource::open(&capture) {
            Ok(source) => source,
            Err(e) => {
                tracing::error!(error = %e, "Capture source failed to open");
                self.finish_stopped().await;
                self.running.store(false, Ordering::SeqCst);
                return;
            }
        };

        {
            let mut status = self.status.write().await;
            status.state = CaptureState::Running;
            status.source = Some(source.descriptor());
        }
        if let Err(e) = self.mqtt.publish_capture_status(true).await {
            tracing::warn!(error = %e, "Capture status publish failed");
        }
        tracing::info!(source = %source.descriptor(), "Capture source running");

        let mut gate = AnalysisGate::new(min_interval);

        while self.running.load(Ordering::SeqCst) {
            match source.read_frame().await {
                Ok(ReadOutcome::Unchanged) => {
                    // snapshot identical: liveness only, no AI cost
                    self.touch_liveness().await;
                }
                Ok(ReadOutcome::Frame(frame)) => {
                    self.note_frame().await;
                    self.frame_hub.publish(frame.data.clone()).await;

                    if !gate.try_pass(Instant::now()) {
                        continue;
                    }
                    self.analyze_frame(&vision, &frame).await;
                }
                Err(Error::SourceUnavailable(message)) => {
                    tracing::error!(error = %message, "Capture source unavailable, stopping session");
                    source.close().await;
                    self.frame_hub.clear().await;
                    self.finish_stopped().await;
                    self.running.store(false, Ordering::SeqCst);
                    return;
                }
                Err(e) => {
                    // transient read failure; the source backs off internally
                    self.set_reconnecting(&e.to_string()).await;
                }
            }
        }

        // cooperative stop
        source.close().await;
        self.frame_hub.clear().await;
        self.finish_stopped().await;
    }

    /// One AI invocation: snapshot the detection list, batch the
    /// questions, apply the answers
    async fn analyze_frame(&self, vision: &VisionClient, frame: &Frame) {
        let detections = self.registry.list().await;
        let phrases: Vec<String> = detections.iter().map(|d| d.phrase.clone()).collect();

        let started = Instant::now();
        let answers = match vision.analyze(&frame.data, &phrases).await {
            Ok(answers) => answers,
            Err(e) => {
                // prior result and detection states stay untouched; one
                // failed call must not flap the sensors
                tracing::warn!(error = %e, "AI analysis failed, keeping previous state");
                return;
            }
        };

        let mut result_answers = Vec::with_capacity(detections.len());
        for (i, detection) in detections.iter().enumerate() {
            let matched = answers.matches.get(i).copied().unwrap_or(false);

            if let Some(change) = self.registry.apply_answer(detection.id, matched).await {
                if change.rising {
                    if let Some(url) = change.detection.webhook_url.clone() {
                        self.webhooks.fire(url, &change.detection);
                    }
                }
            }

            result_answers.push(DetectionAnswer {
                detection_id: detection.id,
                name: detection.name.clone(),
                matched,
            });
        }

        let result = AnalysisResult {
            people_count: answers.people_count,
            answers: result_answers,
            duration_seconds: started.elapsed().as_secs_f64(),
            timestamp: Utc::now(),
        };

        tracing::info!(
            people_count = result.people_count,
            detections = result.answers.len(),
            duration_ms = (result.duration_seconds * 1000.0) as u64,
            "Analysis cycle complete"
        );

        *self.last_result.write().await = Some(result.clone());
        if let Err(e) = self.mqtt.publish_result(&result).await {
            tracing::warn!(error = %e, "Result publish failed");
        }
    }

    async fn touch_liveness(&self) {
        self.status.write().await.last_frame_at = Some(Utc::now());
    }

    async fn note_frame(&self) {
        let mut status = self.status.write().await;
        status.last_frame_at = Some(Utc::now());
        if status.state == CaptureState::Reconnecting {
            status.state = CaptureState::Running;
            tracing::info!("Capture source recovered");
        }
    }

    async fn set_reconnecting(&self, message: &str) {
        let mut status = self.status.write().await;
        if status.state != CaptureState::Reconnecting {
            status.state = CaptureState::Reconnecting;
            tracing::warn!(error = %message, "Capture source reconnecting");
        }
    }

    async fn finish_stopped(&self) {
        *self.status.write().await = CaptureStatus::stopped();
        if let Err(e) = self.mqtt.publish_capture_status(false).await {
            tracing::warn!(error = %e, "Capture status publish failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config_store::MqttSettings;
    use std::path::PathBuf;

    fn write_temp(content: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.env");
        std::fs::write(&path, content).unwrap();
        (dir, path)
    }

    async fn orchestrator_with(config: &str) -> (tempfile::TempDir, AnalysisOrchestrator) {
        let (dir, path) = write_temp(config);
        let config_store = Arc::new(ConfigStore::load(path).await.unwrap());
        let registry = Arc::new(DetectionRegistry::new());
        let mqtt = MqttPublisher::connect(
            MqttSettings {
                broker: "localhost".into(),
                port: 1883,
                username: None,
                password: None,
                topic_prefix: "camwatch".into(),
                device_name: "Camwatch Camera AI".into(),
                device_id: "camwatch_camera_ai".into(),
            },
            registry.clone(),
        );
        let orchestrator =
            AnalysisOrchestrator::new(config_store, registry, mqtt, FrameHub::new());
        (dir, orchestrator)
    }

    #[test]
    fn test_gate_passes_first_frame() {
        let mut gate = AnalysisGate::new(Duration::from_secs(1));
        assert!(gate.try_pass(Instant::now()));
    }

    #[test]
    fn test_gate_throttles_within_window() {
        let mut gate = AnalysisGate::new(Duration::from_secs(1));
        let t0 = Instant::now();
        assert!(gate.try_pass(t0));
        // two frames inside the window: second invocation is skipped
        assert!(!gate.try_pass(t0 + Duration::from_millis(300)));
        assert!(!gate.try_pass(t0 + Duration::from_millis(900)));
        assert!(gate.try_pass(t0 + Duration::from_millis(1000)));
    }

    #[test]
    fn test_gate_skip_does_not_rearm() {
        let mut gate = AnalysisGate::new(Duration::from_secs(1));
        let t0 = Instant::now();
        assert!(gate.try_pass(t0));
        // a skipped frame must not push the window forward
        assert!(!gate.try_pass(t0 + Duration::from_millis(600)));
        assert!(gate.try_pass(t0 + Duration::from_millis(1100)));
    }

    #[tokio::test]
    async fn test_start_with_bad_config_releases_slot() {
        // rtsp mode but no RTSP_URL: start must fail with a config error
        let (_dir, orchestrator) = orchestrator_with("CAPTURE_MODE=rtsp\n").await;

        let err = orchestrator.start().await.unwrap_err();
        assert!(matches!(err, Error::Config(_)));

        // the slot was released: the next start fails on config again,
        // not on a phantom conflict
        let err = orchestrator.start().await.unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert!(!orchestrator.status().await.is_capturing);
    }

    #[tokio::test]
    async fn test_stop_is_idempotent_when_not_running() {
        let (_dir, orchestrator) = orchestrator_with("CAPTURE_MODE=rtsp\n").await;
        orchestrator.stop().await.unwrap();
        orchestrator.stop().await.unwrap();
        assert_eq!(orchestrator.status().await.state, CaptureState::Stopped);
    }

    #[tokio::test]
    async fn test_metrics_empty_before_first_analysis() {
        let (_dir, orchestrator) = orchestrator_with("").await;
        let metrics = orchestrator.metrics().await;
        assert_eq!(metrics.fps, 0.0);
        assert!(metrics.timestamp.is_none());
        assert!(metrics.people_count.is_none());
    }

    #[tokio::test]
    async fn test_status_transitions_on_session_helpers() {
        let (_dir, orchestrator) = orchestrator_with("").await;

        orchestrator.set_reconnecting("stream ended").await;
        assert_eq!(orchestrator.status().await.state, CaptureState::Reconnecting);

        orchestrator.note_frame().await;
        let status = orchestrator.status().await;
        assert_eq!(status.state, CaptureState::Running);
        assert!(status.last_frame_at.is_some());

        orchestrator.finish_stopped().await;
        let status = orchestrator.status().await;
        assert_eq!(status.state, CaptureState::Stopped);
        assert!(!status.is_capturing);
    }
}
