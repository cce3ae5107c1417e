//! Webhook delivery for detection state changes
//!
//! Fire-and-forget: delivery runs on its own task with a bounded timeout,
//! failures are logged and never reach the analysis loop. No retry.

use crate::detection_registry::Detection;
use serde_json::json;
use std::time::Duration;

/// Upper bound on one webhook POST
const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(10);

/// Webhook notifier instance
#[derive(Clone)]
pub struct WebhookNotifier {
    client: reqwest::Client,
}

impl WebhookNotifier {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(WEBHOOK_TIMEOUT)
            .build()
            .expect("Failed to create HTTP client");
        Self { client }
    }

    /// POST the state-change payload; returns immediately
    pub fn fire(&self, url: String, detection: &Detection) {
        let client = self.client.clone();
        let payload = json!({
            "detection_id": detection.id,
            "name": detection.name,
            "phrase": detection.phrase,
            "state": "on",
            "triggered_at": detection.last_triggered,
        });
        let detection_id = detection.id;

        tokio::spawn(async move {
            match client.post(&url).json(&payload).send().await {
                Ok(response) if response.status().is_success() => {
                    tracing::debug!(detection_id = %detection_id, url = %url, "Webhook delivered");
                }
                Ok(response) => {
                    tracing::warn!(
                        detection_id = %detection_id,
                        url = %url,
                        status = %response.status(),
                        "Webhook rejected"
                    );
                }
                Err(e) => {
                    tracing::warn!(
                        detection_id = %detection_id,
                        url = %url,
                        error = %e,
                        "Webhook delivery failed"
                    );
                }
            }
        });
    }
}

impl Default for WebhookNotifier {
    fn default() -> Self {
        Self::new()
    }
}
