//! MqttPublisher - Home Assistant autodiscovery over MQTT
//!
//! ## Responsibilities
//!
//! - Announce fixed sensors (analysis FPS, duration, people count) and one
//!   binary sensor per detection, with stable unique ids
//! - Publish state updates whenever the orchestrator produces new values
//! - Maintain one broker connection; re-announce entities on reconnect
//!
//! Autodiscovery configs are retained; broker-side restarts are covered by
//! re-announcing on every ConnAck rather than assuming retained state
//! survived.

use crate::config_store::MqttSettings;
use crate::detection_registry::{Detection, DetectionRegistry};
use crate::error::{Error, Result};
use crate::models::AnalysisResult;
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Delay before re-polling the event loop after a connection error
const RECONNECT_DELAY: Duration = Duration::from_secs(2);

/// MQTT publisher instance
pub struct MqttPublisher {
    client: AsyncClient,
    settings: MqttSettings,
    connected: AtomicBool,
    /// Last published binary-sensor states; states are republished only on
    /// change to keep the broker traffic proportional to transitions
    binary_state_cache: Mutex<HashMap<Uuid, bool>>,
}

impl MqttPublisher {
    /// Create the publisher and spawn its event-loop task.
    /// The registry is held for entity re-announcement on reconnect.
    pub fn connect(settings: MqttSettings, registry: Arc<DetectionRegistry>) -> Arc<Self> {
        let client_id = format!("camwatch_{}", settings.device_id);
        let mut options = MqttOptions::new(client_id, settings.broker.clone(), settings.port);
        options.set_keep_alive(Duration::from_secs(30));
        if let Some(ref username) = settings.username {
            options.set_credentials(
                username.clone(),
                settings.password.clone().unwrap_or_default(),
            );
        }

        let (client, eventloop) = AsyncClient::new(options, 10);

        let publisher = Arc::new(Self {
            client,
            settings,
            connected: AtomicBool::new(false),
            binary_state_cache: Mutex::new(HashMap::new()),
        });

        tokio::spawn(run_event_loop(publisher.clone(), registry, eventloop));
        publisher
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    /// Connection info for the connectivity-test endpoint
    pub fn connection_status(&self) -> Value {
        json!({
            "connected": self.is_connected(),
            "broker": self.settings.broker,
            "port": self.settings.port,
            "topic_prefix": self.settings.topic_prefix,
            "device_id": self.settings.device_id,
        })
    }

    /// Idempotently (re)publish autodiscovery configs for the fixed
    /// sensors, the capture binary sensor and every detection
    pub async fn announce_entities(&self, detections: &[Detection]) -> Result<()> {
        let (topic, payload) = self.sensor_config(
            "analysis_fps",
            "Analysis FPS",
            None,
            Some("FPS"),
            "mdi:speedometer",
        );
        self.publish_retained(&topic, payload.to_string()).await?;

        let (topic, payload) = self.sensor_config(
            "analysis_duration",
            "Analysis duration",
            Some("duration"),
            Some("s"),
            "mdi:timer",
        );
        self.publish_retained(&topic, payload.to_string()).await?;

        let (topic, payload) =
            self.sensor_config("people_count", "People count", None, None, "mdi:account-group");
        self.publish_retained(&topic, payload.to_string()).await?;

        let (topic, payload) =
            self.binary_sensor_config("capture_active", "Capture active", "running");
        self.publish_retained(&topic, payload.to_string()).await?;

        for detection in detections {
            self.announce_detection(detection).await?;
        }

        tracing::info!(
            detections = detections.len(),
            device_id = %self.settings.device_id,
            "Autodiscovery entities announced"
        );
        Ok(())
    }

    /// Announce the binary sensor for one detection
    pub async fn announce_detection(&self, detection: &Detection) -> Result<()> {
        let (topic, payload) = self.binary_sensor_config(
            &detection_object_id(detection.id),
            &format!("Detection: {}", detection.name),
            "motion",
        );
        self.publish_retained(&topic, payload.to_string()).await
    }

    /// Retract a detection's entity: empty retained config payload
    pub async fn remove_detection(&self, detection_id: Uuid) -> Result<()> {
        let topic = self.config_topic("binary_sensor", &detection_object_id(detection_id));
        self.binary_state_cache.lock().await.remove(&detection_id);
        self.publish_retained(&topic, String::new()).await
    }

    /// Publish sensor states for one analysis result
    pub async fn publish_result(&self, result: &AnalysisResult) -> Result<()> {
        if !self.is_connected() {
            tracing::debug!("MQTT not connected, skipping result publish");
            return Ok(());
        }

        self.publish_state("sensor", "people_count", result.people_count.to_string())
            .await?;
        self.publish_state(
            "sensor",
            "analysis_duration",
            format!("{:.2}", result.duration_seconds),
        )
        .await?;
        self.publish_state("sensor", "analysis_fps", format!("{:.2}", result.fps()))
            .await?;

        let mut cache = self.binary_state_cache.lock().await;
        for answer in &result.answers {
            if cache.get(&answer.detection_id) == Some(&answer.matched) {
                continue;
            }
            cache.insert(answer.detection_id, answer.matched);
            self.publish_state(
                "binary_sensor",
                &detection_object_id(answer.detection_id),
                if answer.matched { "ON" } else { "OFF" }.to_string(),
            )
            .await?;
        }

        Ok(())
    }

    /// Publish the capture-active binary sensor plus a status JSON
    pub async fn publish_capture_status(&self, active: bool) -> Result<()> {
        if !self.is_connected() {
            tracing::debug!("MQTT not connected, skipping capture status publish");
            return Ok(());
        }

        self.publish_state(
            "binary_sensor",
            "capture_active",
            if active { "ON" } else { "OFF" }.to_string(),
        )
        .await?;

        let status_topic = format!("{}/status", self.settings.topic_prefix);
        let payload = json!({
            "capturing": active,
            "timestamp": chrono::Utc::now().to_rfc3339(),
        });
        self.publish(&status_topic, payload.to_string()).await
    }

    fn sensor_config(
        &self,
        object_id: &str,
        name: &str,
        device_class: Option<&str>,
        unit: Option<&str>,
        icon: &str,
    ) -> (String, Value) {
        let mut payload = json!({
            "name": name,
            "unique_id": self.unique_id(object_id),
            "state_topic": self.state_topic("sensor", object_id),
            "icon": icon,
            "device": self.device_block(),
        });
        if let Some(device_class) = device_class {
            payload["device_class"] = json!(device_class);
        }
        if let Some(unit) = unit {
            payload["unit_of_measurement"] = json!(unit);
        }
        (self.config_topic("sensor", object_id), payload)
    }

    fn binary_sensor_config(
        &self,
        object_id: &str,
        name: &str,
        device_class: &str,
    ) -> (String, Value) {
        let payload = json!({
            "name": name,
            "unique_id": self.unique_id(object_id),
            "state_topic": self.state_topic("binary_sensor", object_id),
            "device_class": device_class,
            "payload_on": "ON",
            "payload_off": "OFF",
            "device": self.device_block(),
        });
        (self.config_topic("binary_sensor", object_id), payload)
    }

    fn device_block(&self) -> Value {
        json!({
            "identifiers": [self.settings.device_id],
            "name": self.settings.device_name,
            "manufacturer": "Camwatch",
            "model": "Camera AI Analyzer",
            "sw_version": env!("CARGO_PKG_VERSION"),
        })
    }

    fn unique_id(&self, object_id: &str) -> String {
        format!("{}_{}", self.settings.device_id, object_id)
    }

    fn config_topic(&self, component: &str, object_id: &str) -> String {
        format!(
            "homeassistant/{}/{}_{}/config",
            component, self.settings.device_id, object_id
        )
    }

    fn state_topic(&self, component: &str, object_id: &str) -> String {
        format!(
            "{}/{}/{}/state",
            self.settings.topic_prefix, component, object_id
        )
    }

    async fn publish_state(&self, component: &str, object_id: &str, payload: String) -> Result<()> {
        let topic = self.state_topic(component, object_id);
        self.publish(&topic, payload).await
    }

    async fn publish(&self, topic: &str, payload: String) -> Result<()> {
        // skip rather than queue while disconnected: rumqttc's request
        // queue is bounded and a blocked publish would stall the caller
        if !self.is_connected() {
            tracing::debug!(topic = %topic, "MQTT not connected, publish skipped");
            return Ok(());
        }
        self.client
            .publish(topic, QoS::AtLeastOnce, false, payload)
            .await
            .map_err(|e| Error::Mqtt(format!("Publish to {} failed: {}", topic, e)))
    }

    async fn publish_retained(&self, topic: &str, payload: String) -> Result<()> {
        if !self.is_connected() {
            tracing::debug!(topic = %topic, "MQTT not connected, publish skipped");
            return Ok(());
        }
        self.client
            .publish(topic, QoS::AtLeastOnce, true, payload)
            .await
            .map_err(|e| Error::Mqtt(format!("Publish to {} failed: {}", topic, e)))
    }
}

/// Stable per-detection object id derived from the detection uuid
fn detection_object_id(id: Uuid) -> String {
    format!("detection_{}", id.simple())
}

async fn run_event_loop(
    publisher: Arc<MqttPublisher>,
    registry: Arc<DetectionRegistry>,
    mut eventloop: rumqttc::EventLoop,
) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                publisher.connected.store(true, Ordering::Relaxed);
                tracing::info!(
                    broker = %publisher.settings.broker,
                    port = publisher.settings.port,
                    "MQTT connected"
                );

                // autodiscovery state is not assumed to survive broker restarts
                let detections = registry.list().await;
                if let Err(e) = publisher.announce_entities(&detections).await {
                    tracing::error!(error = %e, "Entity re-announcement failed");
                }
            }
            Ok(Event::Incoming(Incoming::Disconnect)) => {
                publisher.connected.store(false, Ordering::Relaxed);
                tracing::warn!("MQTT disconnected");
            }
            Ok(_) => {}
            Err(e) => {
                publisher.connected.store(false, Ordering::Relaxed);
                tracing::error!(error = %e, "MQTT event loop error");
                tokio::time::sleep(RECONNECT_DELAY).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection_registry::CreateDetectionRequest;

    fn settings() -> MqttSettings {
        MqttSettings {
            broker: "localhost".into(),
            port: 1883,
            username: None,
            password: None,
            topic_prefix: "camwatch".into(),
            device_name: "Camwatch Camera AI".into(),
            device_id: "camwatch_camera_ai".into(),
        }
    }

    fn publisher() -> Arc<MqttPublisher> {
        MqttPublisher::connect(settings(), Arc::new(DetectionRegistry::new()))
    }

    #[tokio::test]
    async fn test_sensor_config_topics_and_unique_id() {
        let publisher = publisher();
        let (topic, payload) =
            publisher.sensor_config("analysis_fps", "Analysis FPS", None, Some("FPS"), "mdi:speedometer");

        assert_eq!(
            topic,
            "homeassistant/sensor/camwatch_camera_ai_analysis_fps/config"
        );
        assert_eq!(payload["unique_id"], "camwatch_camera_ai_analysis_fps");
        assert_eq!(payload["state_topic"], "camwatch/sensor/analysis_fps/state");
        assert_eq!(payload["unit_of_measurement"], "FPS");
        assert!(payload.get("device_class").is_none());
        assert_eq!(payload["device"]["identifiers"][0], "camwatch_camera_ai");
    }

    #[tokio::test]
    async fn test_announce_is_idempotent_on_unique_ids() {
        let publisher = publisher();
        let (_, first) = publisher.binary_sensor_config("capture_active", "Capture active", "running");
        let (_, second) = publisher.binary_sensor_config("capture_active", "Capture active", "running");
        // repeated announcement carries the same unique id, so Home
        // Assistant replaces the entity instead of duplicating it
        assert_eq!(first["unique_id"], second["unique_id"]);
    }

    #[tokio::test]
    async fn test_detection_object_id_is_stable() {
        let registry = DetectionRegistry::new();
        let detection = registry
            .create(CreateDetectionRequest {
                name: "Hat".into(),
                phrase: "a person wearing a hat".into(),
                webhook_url: None,
            })
            .await
            .unwrap();

        let a = detection_object_id(detection.id);
        let b = detection_object_id(detection.id);
        assert_eq!(a, b);
        assert!(a.starts_with("detection_"));
        // uuid simple form carries no hyphens (MQTT object id safe)
        assert!(!a.contains('-'));
    }

    #[tokio::test]
    async fn test_binary_sensor_config_payloads() {
        let publisher = publisher();
        let (topic, payload) = publisher.binary_sensor_config("detection_abc", "Detection: Hat", "motion");
        assert_eq!(
            topic,
            "homeassistant/binary_sensor/camwatch_camera_ai_detection_abc/config"
        );
        assert_eq!(payload["payload_on"], "ON");
        assert_eq!(payload["payload_off"], "OFF");
        assert_eq!(payload["device_class"], "motion");
    }
}
