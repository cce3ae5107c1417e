//! Home Assistant polling capture source
//!
//! Polls the camera entity state, resolves the snapshot URL from the
//! entity attributes, downloads the image and deduplicates identical
//! consecutive snapshots by content hash so an unchanged camera image
//! never costs an AI call.
//!
//! Two safety rules carried over from the admin-facing deployments this
//! targets: a cache-busting parameter is only appended to same-host,
//! unsigned URLs (extra query parameters break presigned URLs), and the
//! Home Assistant bearer token is never sent to third-party hosts.

use super::{Frame, ReadOutcome, MAX_CONSECUTIVE_FAILURES};
use crate::config_store::CaptureSettings;
use crate::error::{Error, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde_json::Value;
use sha1::{Digest, Sha1};
use std::time::Duration;
use tokio::time::Instant;

/// Timeout for the entity-state request
const STATE_TIMEOUT: Duration = Duration::from_secs(5);

/// Timeout for the snapshot download
const IMAGE_TIMEOUT: Duration = Duration::from_secs(8);

/// Attribute names tried when the configured one is absent
const FALLBACK_ATTRS: &[&str] = &[
    "entity_picture",
    "entity_picture_local",
    "image",
    "file",
    "thumbnail",
    "last_thumbnail",
    "picture",
];

/// Query keys that mark a signed URL (must not be altered)
const SIGNED_URL_MARKERS: &[&str] = &[
    "AWSAccessKeyId",
    "Signature",
    "X-Amz-Signature",
    "X-Amz-Algorithm",
    "X-Amz-Credential",
    "X-Amz-Expires",
];

/// Home Assistant polling source
pub struct HaPollSource {
    client: reqwest::Client,
    base_url: String,
    token: String,
    entity_id: String,
    image_attr: String,
    poll_interval: Duration,
    last_image_hash: Option<String>,
    last_source_url: Option<String>,
    consecutive_failures: u32,
}

impl HaPollSource {
    pub fn new(settings: &CaptureSettings) -> Result<Self> {
        let base_url = settings
            .ha_base_url
            .clone()
            .ok_or_else(|| Error::Config("HA_BASE_URL is required in ha_polling mode".into()))?;
        let token = settings
            .ha_token
            .clone()
            .ok_or_else(|| Error::Config("HA_TOKEN is required in ha_polling mode".into()))?;
        let entity_id = settings
            .ha_entity_id
            .clone()
            .ok_or_else(|| Error::Config("HA_ENTITY_ID is required in ha_polling mode".into()))?;

        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| Error::Internal(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
            entity_id,
            image_attr: settings.ha_image_attr.clone(),
            poll_interval: settings.poll_interval,
            last_image_hash: None,
            last_source_url: None,
            consecutive_failures: 0,
        })
    }

    pub fn descriptor(&self) -> String {
        format!("ha_polling:{}", self.entity_id)
    }

    /// Poll once; blocks the remainder of the poll interval so calls
    /// arrive roughly once per interval regardless of fetch latency
    pub async fn read_frame(&mut self) -> Result<ReadOutcome> {
        let tick_start = Instant::now();
        let outcome = self.poll_once().await;
        self.sleep_remainder(tick_start).await;

        match outcome {
            Ok(Some(data)) => {
                self.consecutive_failures = 0;
                Ok(ReadOutcome::Frame(Frame::new(data)))
            }
            Ok(None) => {
                self.consecutive_failures = 0;
                Ok(ReadOutcome::Unchanged)
            }
            Err(message) => {
                self.consecutive_failures += 1;
                tracing::warn!(
                    entity_id = %self.entity_id,
                    attempt = self.consecutive_failures,
                    error = %message,
                    "HA poll failed"
                );
                if self.consecutive_failures >= MAX_CONSECUTIVE_FAILURES {
                    Err(Error::SourceUnavailable(format!(
                        "HA polling failed {} consecutive reads: {}",
                        self.consecutive_failures, message
                    )))
                } else {
                    Err(Error::Capture(message))
                }
            }
        }
    }

    /// Ok(Some(bytes)) = new snapshot, Ok(None) = unchanged, Err = transient
    async fn poll_once(&mut self) -> std::result::Result<Option<Vec<u8>>, String> {
        let state_url = format!("{}/api/states/{}", self.base_url, self.entity_id);

        let response = self
            .client
            .get(&state_url)
            .bearer_auth(&self.token)
            .timeout(STATE_TIMEOUT)
            .send()
            .await
            .map_err(|e| format!("entity state request failed: {}", e))?;

        if !response.status().is_success() {
            return Err(format!("entity state returned {}", response.status()));
        }

        let state: Value = response
            .json()
            .await
            .map_err(|e| format!("entity state is not JSON: {}", e))?;

        let attrs = state.get("attributes").cloned().unwrap_or(Value::Null);
        let Some(attr_value) = self.resolve_image_attr(&attrs) else {
            return Err(format!(
                "no image attribute on {} (looked for '{}' and fallbacks)",
                self.entity_id, self.image_attr
            ));
        };

        // Inline payloads: data URI or { "content": <base64> }
        if let Some(text) = attr_value.as_str() {
            if text.starts_with("data:") {
                return self.handle_inline_base64(data_uri_payload(text), "data-uri");
            }
        }
        if let Some(content) = attr_value.get("content").and_then(Value::as_str) {
            return self.handle_inline_base64(content, "base64-object");
        }

        let Some(path) = attr_value.as_str() else {
            return Err("image attribute has an unsupported shape".into());
        };
        let image_url = self.to_absolute_url(path);

        // Same source URL as last time: nothing new to download
        if self.last_source_url.as_deref() == Some(image_url.as_str()) {
            tracing::debug!(entity_id = %self.entity_id, "Snapshot URL unchanged, skipping download");
            return Ok(None);
        }

        let same_host = is_same_host(&image_url, &self.base_url);
        let fetch_url = if same_host && !is_signed_url(&image_url) {
            cache_busted(&image_url)
        } else {
            image_url.clone()
        };

        // HA bearer token only goes to the HA host itself
        let mut request = self.client.get(&fetch_url).timeout(IMAGE_TIMEOUT);
        if same_host {
            request = request.bearer_auth(&self.token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| format!("snapshot download failed: {}", e))?;
        if !response.status().is_success() {
            return Err(format!("snapshot download returned {}", response.status()));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| format!("snapshot read failed: {}", e))?
            .to_vec();

        let hash = sha1_hex(&bytes);
        if self.last_image_hash.as_deref() == Some(hash.as_str()) {
            tracing::debug!(entity_id = %self.entity_id, "Snapshot identical to previous (hash match), skipping");
            self.last_source_url = Some(image_url);
            return Ok(None);
        }

        self.last_image_hash = Some(hash);
        self.last_source_url = Some(image_url);
        Ok(Some(bytes))
    }

    fn handle_inline_base64(
        &mut self,
        payload: &str,
        source: &str,
    ) -> std::result::Result<Option<Vec<u8>>, String> {
        let bytes = BASE64
            .decode(payload.trim())
            .map_err(|e| format!("{} decode failed: {}", source, e))?;

        let hash = sha1_hex(&bytes);
        if self.last_image_hash.as_deref() == Some(hash.as_str()) {
            return Ok(None);
        }
        self.last_image_hash = Some(hash);
        self.last_source_url = Some(source.to_string());
        Ok(Some(bytes))
    }

    /// Configured attribute first, then the documented fallback list
    fn resolve_image_attr(&self, attrs: &Value) -> Option<Value> {
        if let Some(value) = attrs.get(&self.image_attr) {
            if !value.is_null() {
                return Some(normalize_attr_value(value));
            }
        }
        for key in FALLBACK_ATTRS {
            if let Some(value) = attrs.get(*key) {
                if !value.is_null() {
                    tracing::debug!(attr = key, "Using fallback image attribute");
                    return Some(normalize_attr_value(value));
                }
            }
        }
        None
    }

    fn to_absolute_url(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            return path.to_string();
        }
        if path.starts_with('/') {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}/{}", self.base_url, path)
        }
    }

    async fn sleep_remainder(&self, tick_start: Instant) {
        let elapsed = tick_start.elapsed();
        if elapsed < self.poll_interval {
            tokio::time::sleep(self.poll_interval - elapsed).await;
        }
    }
}

/// A dict-shaped attribute may wrap the URL under a common key
fn normalize_attr_value(value: &Value) -> Value {
    if value.is_object() {
        for key in ["url", "href", "link", "image", "file"] {
            if let Some(url) = value.get(key).and_then(Value::as_str) {
                return Value::String(url.to_string());
            }
        }
    }
    value.clone()
}

fn data_uri_payload(uri: &str) -> &str {
    match uri.find(',') {
        Some(comma) => &uri[comma + 1..],
        None => uri,
    }
}

fn host_of(url: &str) -> Option<&str> {
    let rest = url.split("://").nth(1)?;
    let authority = rest.split('/').next()?;
    // strip userinfo if present
    Some(authority.rsplit('@').next().unwrap_or(authority))
}

fn is_same_host(url: &str, base_url: &str) -> bool {
    match (host_of(url), host_of(base_url)) {
        (Some(a), Some(b)) => !b.is_empty() && a == b,
        _ => false,
    }
}

fn is_signed_url(url: &str) -> bool {
    let Some(query) = url.split_once('?').map(|(_, q)| q) else {
        return false;
    };
    SIGNED_URL_MARKERS.iter().any(|marker| query.contains(marker))
}

fn cache_busted(url: &str) -> String {
    let sep = if url.contains('?') { '&' } else { '?' };
    format!("{}{}t={}", url, sep, chrono::Utc::now().timestamp_millis())
}

fn sha1_hex(data: &[u8]) -> String {
    let mut hasher = Sha1::new();
    hasher.update(data);
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config_store::CaptureMode;
    use serde_json::json;

    fn settings() -> CaptureSettings {
        CaptureSettings {
            mode: CaptureMode::HaPolling,
            rtsp_url: None,
            rtsp_username: None,
            rtsp_password: None,
            ha_base_url: Some("http://ha.local:8123".into()),
            ha_token: Some("tok".into()),
            ha_entity_id: Some("camera.front".into()),
            ha_image_attr: "entity_picture".into(),
            poll_interval: Duration::from_millis(100),
        }
    }

    #[test]
    fn test_same_host_detection() {
        assert!(is_same_host(
            "http://ha.local:8123/api/camera_proxy/camera.front",
            "http://ha.local:8123"
        ));
        assert!(!is_same_host(
            "https://bucket.s3.amazonaws.com/snap.jpg",
            "http://ha.local:8123"
        ));
    }

    #[test]
    fn test_signed_url_detection() {
        assert!(is_signed_url(
            "https://bucket.s3.amazonaws.com/x.jpg?X-Amz-Signature=abc"
        ));
        assert!(!is_signed_url("http://ha.local:8123/pic.jpg?width=640"));
        assert!(!is_signed_url("http://ha.local:8123/pic.jpg"));
    }

    #[test]
    fn test_cache_busted_separator() {
        assert!(cache_busted("http://h/p.jpg").contains("?t="));
        assert!(cache_busted("http://h/p.jpg?a=1").contains("&t="));
    }

    #[test]
    fn test_resolve_image_attr_fallback() {
        let source = HaPollSource::new(&settings()).unwrap();
        let attrs = json!({ "last_thumbnail": "/api/thumb.jpg" });
        let resolved = source.resolve_image_attr(&attrs).unwrap();
        assert_eq!(resolved.as_str().unwrap(), "/api/thumb.jpg");

        let attrs = json!({ "entity_picture": "/api/pic.jpg", "image": "/other.jpg" });
        let resolved = source.resolve_image_attr(&attrs).unwrap();
        assert_eq!(resolved.as_str().unwrap(), "/api/pic.jpg");
    }

    #[test]
    fn test_normalize_dict_attr() {
        let value = json!({ "url": "http://ha.local/pic.jpg" });
        assert_eq!(
            normalize_attr_value(&value).as_str().unwrap(),
            "http://ha.local/pic.jpg"
        );
    }

    #[test]
    fn test_to_absolute_url() {
        let source = HaPollSource::new(&settings()).unwrap();
        assert_eq!(
            source.to_absolute_url("/api/pic.jpg"),
            "http://ha.local:8123/api/pic.jpg"
        );
        assert_eq!(
            source.to_absolute_url("api/pic.jpg"),
            "http://ha.local:8123/api/pic.jpg"
        );
        assert_eq!(
            source.to_absolute_url("https://cdn.example/pic.jpg"),
            "https://cdn.example/pic.jpg"
        );
    }

    #[test]
    fn test_inline_base64_dedup() {
        let mut source = HaPollSource::new(&settings()).unwrap();
        let payload = BASE64.encode(b"jpeg-bytes");

        let first = source.handle_inline_base64(&payload, "data-uri").unwrap();
        assert_eq!(first.unwrap(), b"jpeg-bytes");

        // identical payload: deduplicated
        let second = source.handle_inline_base64(&payload, "data-uri").unwrap();
        assert!(second.is_none());
    }

    #[test]
    fn test_data_uri_payload() {
        assert_eq!(
            data_uri_payload("data:image/jpeg;base64,QUJD"),
            "QUJD"
        );
    }

    #[test]
    fn test_sha1_hex_stable() {
        assert_eq!(sha1_hex(b"abc"), "a9993e364706816aba3e25717850c26c9cd0d89d");
    }
}
