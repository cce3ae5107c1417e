//! DetectionRegistry - User-defined detection rules
//!
//! ## Responsibilities
//!
//! - CRUD for {name, phrase, webhook} detection rules
//! - Per-detection boolean state and trigger bookkeeping
//!
//! Single lock around the whole registry: HTTP handlers are the writers
//! for the rule set, the orchestrator is the single writer for
//! `current_state`. Mutations are immediately visible to the next cycle.

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use uuid::Uuid;

/// A user-defined yes/no question evaluated against each analyzed frame
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Detection {
    pub id: Uuid,
    pub name: String,
    pub phrase: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub webhook_url: Option<String>,
    pub current_state: bool,
    pub last_changed_at: Option<DateTime<Utc>>,
    pub last_triggered: Option<DateTime<Utc>>,
    pub trigger_count: u64,
    pub created_at: DateTime<Utc>,
}

/// Create request
#[derive(Debug, Clone, Deserialize)]
pub struct CreateDetectionRequest {
    pub name: String,
    pub phrase: String,
    #[serde(default)]
    pub webhook_url: Option<String>,
}

/// Partial update request; absent fields are left unchanged,
/// an empty `webhook_url` clears the webhook
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateDetectionRequest {
    pub name: Option<String>,
    pub phrase: Option<String>,
    pub webhook_url: Option<String>,
}

/// Outcome of applying an AI answer to a detection
#[derive(Debug, Clone)]
pub struct StateChange {
    pub detection: Detection,
    /// true on a false->true transition (webhook edge)
    pub rising: bool,
}

/// DetectionRegistry instance
pub struct DetectionRegistry {
    /// Detections in creation order
    inner: Mutex<Vec<Detection>>,
}

impl DetectionRegistry {
    /// Create empty registry
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Vec::new()),
        }
    }

    /// Create a detection; name and phrase must be non-empty
    pub async fn create(&self, req: CreateDetectionRequest) -> Result<Detection> {
        let name = req.name.trim().to_string();
        let phrase = req.phrase.trim().to_string();
        if name.is_empty() || phrase.is_empty() {
            return Err(Error::Validation("name and phrase are required".into()));
        }
        let webhook_url = validate_webhook(req.webhook_url)?;

        let detection = Detection {
            id: Uuid::new_v4(),
            name,
            phrase,
            webhook_url,
            current_state: false,
            last_changed_at: None,
            last_triggered: None,
            trigger_count: 0,
            created_at: Utc::now(),
        };

        let mut inner = self.inner.lock().await;
        inner.push(detection.clone());
        tracing::info!(detection_id = %detection.id, name = %detection.name, "Detection created");
        Ok(detection)
    }

    /// Update a detection; `NotFound` if the id is absent
    pub async fn update(&self, id: Uuid, req: UpdateDetectionRequest) -> Result<Detection> {
        let mut inner = self.inner.lock().await;
        let detection = inner
            .iter_mut()
            .find(|d| d.id == id)
            .ok_or_else(|| Error::NotFound(format!("Detection {} not found", id)))?;

        if let Some(name) = req.name {
            let name = name.trim().to_string();
            if name.is_empty() {
                return Err(Error::Validation("name must not be empty".into()));
            }
            detection.name = name;
        }
        if let Some(phrase) = req.phrase {
            let phrase = phrase.trim().to_string();
            if phrase.is_empty() {
                return Err(Error::Validation("phrase must not be empty".into()));
            }
            detection.phrase = phrase;
        }
        if let Some(webhook) = req.webhook_url {
            detection.webhook_url = if webhook.trim().is_empty() {
                None
            } else {
                validate_webhook(Some(webhook))?
            };
        }

        tracing::info!(detection_id = %detection.id, "Detection updated");
        Ok(detection.clone())
    }

    /// Delete a detection; `NotFound` if the id is absent (second delete
    /// of the same id is a clean `NotFound`, never a crash)
    pub async fn delete(&self, id: Uuid) -> Result<Detection> {
        let mut inner = self.inner.lock().await;
        let pos = inner
            .iter()
            .position(|d| d.id == id)
            .ok_or_else(|| Error::NotFound(format!("Detection {} not found", id)))?;
        let removed = inner.remove(pos);
        tracing::info!(detection_id = %removed.id, name = %removed.name, "Detection deleted");
        Ok(removed)
    }

    /// Get one detection
    pub async fn get(&self, id: Uuid) -> Result<Detection> {
        self.inner
            .lock()
            .await
            .iter()
            .find(|d| d.id == id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("Detection {} not found", id)))
    }

    /// All detections in creation order
    pub async fn list(&self) -> Vec<Detection> {
        self.inner.lock().await.clone()
    }

    /// Detection count
    pub async fn count(&self) -> usize {
        self.inner.lock().await.len()
    }

    /// Apply an AI answer to a detection's boolean state.
    ///
    /// Returns `Some(StateChange)` only when the state flipped; a repeated
    /// identical answer is a no-op. Returns `None` for an id deleted
    /// between the orchestrator's snapshot and this call.
    pub async fn apply_answer(&self, id: Uuid, matched: bool) -> Option<StateChange> {
        let mut inner = self.inner.lock().await;
        let detection = inner.iter_mut().find(|d| d.id == id)?;

        if detection.current_state == matched {
            return None;
        }

        let now = Utc::now();
        detection.current_state = matched;
        detection.last_changed_at = Some(now);
        if matched {
            detection.last_triggered = Some(now);
            detection.trigger_count += 1;
        }

        tracing::debug!(
            detection_id = %detection.id,
            name = %detection.name,
            state = matched,
            "Detection state changed"
        );

        Some(StateChange {
            detection: detection.clone(),
            rising: matched,
        })
    }
}

impl Default for DetectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn validate_webhook(url: Option<String>) -> Result<Option<String>> {
    match url {
        None => Ok(None),
        Some(url) => {
            let url = url.trim().to_string();
            if url.is_empty() {
                return Ok(None);
            }
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err(Error::Validation(format!(
                    "webhook_url must be an http(s) URL, got '{}'",
                    url
                )));
            }
            Ok(Some(url))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req(name: &str, phrase: &str) -> CreateDetectionRequest {
        CreateDetectionRequest {
            name: name.to_string(),
            phrase: phrase.to_string(),
            webhook_url: None,
        }
    }

    #[tokio::test]
    async fn test_create_then_list() {
        let registry = DetectionRegistry::new();
        let created = registry.create(req("Hat", "a person wearing a hat")).await.unwrap();

        let listed = registry.list().await;
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, created.id);
        assert_eq!(listed[0].name, "Hat");
        assert_eq!(listed[0].phrase, "a person wearing a hat");
        assert!(!listed[0].current_state);
    }

    #[tokio::test]
    async fn test_list_preserves_creation_order() {
        let registry = DetectionRegistry::new();
        let a = registry.create(req("A", "first")).await.unwrap();
        let b = registry.create(req("B", "second")).await.unwrap();
        let c = registry.create(req("C", "third")).await.unwrap();

        registry.delete(b.id).await.unwrap();
        let d = registry.create(req("D", "fourth")).await.unwrap();

        let ids: Vec<Uuid> = registry.list().await.iter().map(|x| x.id).collect();
        assert_eq!(ids, vec![a.id, c.id, d.id]);
    }

    #[tokio::test]
    async fn test_create_rejects_empty_fields() {
        let registry = DetectionRegistry::new();
        assert!(matches!(
            registry.create(req("", "phrase")).await.unwrap_err(),
            Error::Validation(_)
        ));
        assert!(matches!(
            registry.create(req("name", "  ")).await.unwrap_err(),
            Error::Validation(_)
        ));
    }

    #[tokio::test]
    async fn test_create_rejects_bad_webhook() {
        let registry = DetectionRegistry::new();
        let result = registry
            .create(CreateDetectionRequest {
                name: "n".into(),
                phrase: "p".into(),
                webhook_url: Some("ftp://example.com".into()),
            })
            .await;
        assert!(matches!(result.unwrap_err(), Error::Validation(_)));
    }

    #[tokio::test]
    async fn test_double_delete_is_not_found() {
        let registry = DetectionRegistry::new();
        let d = registry.create(req("n", "p")).await.unwrap();

        registry.delete(d.id).await.unwrap();
        assert!(matches!(
            registry.delete(d.id).await.unwrap_err(),
            Error::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_update_not_found() {
        let registry = DetectionRegistry::new();
        let result = registry
            .update(Uuid::new_v4(), UpdateDetectionRequest::default())
            .await;
        assert!(matches!(result.unwrap_err(), Error::NotFound(_)));
    }

    #[tokio::test]
    async fn test_update_clears_webhook_with_empty_string() {
        let registry = DetectionRegistry::new();
        let d = registry
            .create(CreateDetectionRequest {
                name: "n".into(),
                phrase: "p".into(),
                webhook_url: Some("https://hooks.local/fire".into()),
            })
            .await
            .unwrap();

        let updated = registry
            .update(
                d.id,
                UpdateDetectionRequest {
                    webhook_url: Some(String::new()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(updated.webhook_url.is_none());
    }

    #[tokio::test]
    async fn test_apply_answer_rising_edge() {
        let registry = DetectionRegistry::new();
        let d = registry.create(req("n", "p")).await.unwrap();

        let change = registry.apply_answer(d.id, true).await.unwrap();
        assert!(change.rising);
        assert!(change.detection.current_state);
        assert_eq!(change.detection.trigger_count, 1);
        assert!(change.detection.last_changed_at.is_some());
        assert!(change.detection.last_triggered.is_some());

        // repeated true answer: no change, no extra trigger
        assert!(registry.apply_answer(d.id, true).await.is_none());
        assert_eq!(registry.get(d.id).await.unwrap().trigger_count, 1);
    }

    #[tokio::test]
    async fn test_apply_answer_falling_edge() {
        let registry = DetectionRegistry::new();
        let d = registry.create(req("n", "p")).await.unwrap();
        registry.apply_answer(d.id, true).await.unwrap();

        let change = registry.apply_answer(d.id, false).await.unwrap();
        assert!(!change.rising);
        assert!(!change.detection.current_state);
        // falling edge does not count as a trigger
        assert_eq!(change.detection.trigger_count, 1);
    }

    #[tokio::test]
    async fn test_apply_answer_deleted_id() {
        let registry = DetectionRegistry::new();
        let d = registry.create(req("n", "p")).await.unwrap();
        registry.delete(d.id).await.unwrap();
        assert!(registry.apply_answer(d.id, true).await.is_none());
    }
}
