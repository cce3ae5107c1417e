//! ConfigStore - Single Source of Truth (SSoT)
//!
//! ## Responsibilities
//!
//! - Flat `key=value` settings file (AI backend, MQTT broker, capture mode)
//! - Hot reload without process restart
//! - Typed settings views with env-style defaults
//!
//! ## Design Principles
//!
//! - SSoT: all runtime configuration reads/writes go through here
//! - A running capture session snapshots its settings at start; reload
//!   takes effect on the next start

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;
use tokio::fs;
use tokio::sync::RwLock;

/// Keys whose values are masked in API responses
const SECRET_MARKERS: &[&str] = &["PASSWORD", "TOKEN", "API_KEY", "SECRET"];

/// Minimum accepted poll interval
const MIN_POLL_INTERVAL_MS: u64 = 100;

/// AI backend selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AiBackend {
    /// Hosted API with API key auth
    OpenAi,
    /// Local OpenAI-compatible endpoint
    LmStudio,
    /// Local endpoint with native chat API
    Ollama,
}

impl AiBackend {
    fn parse(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "openai" => Ok(Self::OpenAi),
            "lmstudio" => Ok(Self::LmStudio),
            "ollama" => Ok(Self::Ollama),
            other => Err(Error::Config(format!(
                "Unknown AI_BACKEND '{}' (expected openai, lmstudio or ollama)",
                other
            ))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OpenAi => "openai",
            Self::LmStudio => "lmstudio",
            Self::Ollama => "ollama",
        }
    }
}

/// AI client settings
#[derive(Debug, Clone)]
pub struct AiSettings {
    pub backend: AiBackend,
    pub openai_api_key: String,
    pub openai_model: String,
    pub lmstudio_url: String,
    pub lmstudio_model: String,
    pub ollama_url: String,
    pub ollama_model: String,
    pub timeout: Duration,
}

/// MQTT broker and Home Assistant device settings
#[derive(Debug, Clone)]
pub struct MqttSettings {
    pub broker: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub topic_prefix: String,
    pub device_name: String,
    pub device_id: String,
}

/// Capture mode selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureMode {
    Rtsp,
    HaPolling,
}

impl CaptureMode {
    fn parse(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "rtsp" => Ok(Self::Rtsp),
            "ha_polling" => Ok(Self::HaPolling),
            other => Err(Error::Config(format!(
                "Unknown CAPTURE_MODE '{}' (expected rtsp or ha_polling)",
                other
            ))),
        }
    }
}

/// Capture source settings; exactly one mode is active at a time
#[derive(Debug, Clone)]
pub struct CaptureSettings {
    pub mode: CaptureMode,
    pub rtsp_url: Option<String>,
    pub rtsp_username: Option<String>,
    pub rtsp_password: Option<String>,
    pub ha_base_url: Option<String>,
    pub ha_token: Option<String>,
    pub ha_entity_id: Option<String>,
    pub ha_image_attr: String,
    pub poll_interval: Duration,
}

impl CaptureSettings {
    /// Validate that the keys the selected mode requires are present
    pub fn validate(&self) -> Result<()> {
        match self.mode {
            CaptureMode::Rtsp => {
                if self.rtsp_url.as_deref().unwrap_or("").is_empty() {
                    return Err(Error::Config("RTSP_URL is required in rtsp mode".into()));
                }
            }
            CaptureMode::HaPolling => {
                for (key, value) in [
                    ("HA_BASE_URL", &self.ha_base_url),
                    ("HA_TOKEN", &self.ha_token),
                    ("HA_ENTITY_ID", &self.ha_entity_id),
                ] {
                    if value.as_deref().unwrap_or("").is_empty() {
                        return Err(Error::Config(format!(
                            "{} is required in ha_polling mode",
                            key
                        )));
                    }
                }
            }
        }
        Ok(())
    }
}

/// ConfigStore instance
pub struct ConfigStore {
    path: PathBuf,
    /// In-memory cache of the settings file
    cache: RwLock<BTreeMap<String, String>>,
}

impl ConfigStore {
    /// Load the settings file (missing file is not an error; defaults apply)
    pub async fn load(path: PathBuf) -> Result<Self> {
        let store = Self {
            path,
            cache: RwLock::new(BTreeMap::new()),
        };
        store.reload().await?;
        Ok(store)
    }

    /// Re-read the settings file into the cache
    pub async fn reload(&self) -> Result<()> {
        let entries = match fs::read_to_string(&self.path).await {
            Ok(text) => parse_flat_file(&text),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(path = %self.path.display(), "Settings file not found, using defaults");
                BTreeMap::new()
            }
            Err(e) => return Err(e.into()),
        };

        let count = entries.len();
        *self.cache.write().await = entries;
        tracing::info!(path = %self.path.display(), keys = count, "Settings loaded");
        Ok(())
    }

    /// Merge the given entries into the cache and rewrite the file.
    /// Empty values delete the key.
    pub async fn save(&self, updates: BTreeMap<String, String>) -> Result<()> {
        let mut cache = self.cache.write().await;
        for (key, value) in updates {
            let key = key.trim().to_string();
            if key.is_empty() {
                return Err(Error::Validation("Empty setting key".into()));
            }
            if value.is_empty() {
                cache.remove(&key);
            } else {
                cache.insert(key, value);
            }
        }

        let mut out = String::new();
        for (key, value) in cache.iter() {
            out.push_str(key);
            out.push('=');
            out.push_str(value);
            out.push('\n');
        }
        fs::write(&self.path, out).await?;
        tracing::info!(path = %self.path.display(), keys = cache.len(), "Settings saved");
        Ok(())
    }

    /// Get one setting
    pub async fn get(&self, key: &str) -> Option<String> {
        self.cache.read().await.get(key).cloned()
    }

    async fn get_or(&self, key: &str, default: &str) -> String {
        self.get(key).await.unwrap_or_else(|| default.to_string())
    }

    async fn get_opt(&self, key: &str) -> Option<String> {
        self.get(key).await.filter(|v| !v.is_empty())
    }

    /// All settings with secret values masked (for the admin UI)
    pub async fn masked_entries(&self) -> BTreeMap<String, String> {
        self.cache
            .read()
            .await
            .iter()
            .map(|(k, v)| {
                let upper = k.to_uppercase();
                if !v.is_empty() && SECRET_MARKERS.iter().any(|m| upper.contains(m)) {
                    (k.clone(), "********".to_string())
                } else {
                    (k.clone(), v.clone())
                }
            })
            .collect()
    }

    /// Assemble AI settings from the cache
    pub async fn ai_settings(&self) -> Result<AiSettings> {
        let backend = AiBackend::parse(&self.get_or("AI_BACKEND", "openai").await)?;
        let timeout_sec = self.parse_u64("AI_TIMEOUT", 60).await?;

        Ok(AiSettings {
            backend,
            openai_api_key: self.get_or("OPENAI_API_KEY", "").await,
            openai_model: self.get_or("OPENAI_MODEL", "gpt-4o").await,
            lmstudio_url: self
                .get_or("LMSTUDIO_URL", "http://localhost:1234/v1")
                .await,
            lmstudio_model: self.get_or("LMSTUDIO_MODEL", "local-model").await,
            ollama_url: self.get_or("OLLAMA_BASE_URL", "http://localhost:11434").await,
            ollama_model: self
                .get_or("OLLAMA_MODEL", "llama3.2-vision:latest")
                .await,
            timeout: Duration::from_secs(timeout_sec),
        })
    }

    /// Assemble MQTT settings from the cache
    pub async fn mqtt_settings(&self) -> Result<MqttSettings> {
        let port = self.parse_u64("MQTT_PORT", 1883).await?;
        let port = u16::try_from(port)
            .map_err(|_| Error::Config(format!("MQTT_PORT {} out of range", port)))?;

        Ok(MqttSettings {
            broker: self.get_or("MQTT_BROKER", "localhost").await,
            port,
            username: self.get_opt("MQTT_USERNAME").await,
            password: self.get_opt("MQTT_PASSWORD").await,
            topic_prefix: self.get_or("MQTT_TOPIC_PREFIX", "camwatch").await,
            device_name: self.get_or("HA_DEVICE_NAME", "Camwatch Camera AI").await,
            device_id: self.get_or("HA_DEVICE_ID", "camwatch_camera_ai").await,
        })
    }

    /// Assemble capture settings from the cache and validate the active mode
    pub async fn capture_settings(&self) -> Result<CaptureSettings> {
        let mode = CaptureMode::parse(&self.get_or("CAPTURE_MODE", "rtsp").await)?;
        let poll_secs = self.parse_f64("POLL_INTERVAL_SECONDS", 1.0).await?;
        let poll_interval = Duration::from_secs_f64(poll_secs.max(0.0))
            .max(Duration::from_millis(MIN_POLL_INTERVAL_MS));

        let settings = CaptureSettings {
            mode,
            rtsp_url: self.get_opt("RTSP_URL").await,
            rtsp_username: self.get_opt("RTSP_USERNAME").await,
            rtsp_password: self.get_opt("RTSP_PASSWORD").await,
            ha_base_url: self
                .get_opt("HA_BASE_URL")
                .await
                .map(|u| u.trim_end_matches('/').to_string()),
            ha_token: self.get_opt("HA_TOKEN").await,
            ha_entity_id: self.get_opt("HA_ENTITY_ID").await,
            ha_image_attr: self.get_or("HA_IMAGE_ATTR", "entity_picture").await,
            poll_interval,
        };
        settings.validate()?;
        Ok(settings)
    }

    /// Minimum interval between AI analysis invocations
    pub async fn min_analysis_interval(&self) -> Result<Duration> {
        let secs = self.parse_f64("MIN_ANALYSIS_INTERVAL_SECONDS", 1.0).await?;
        Ok(Duration::from_secs_f64(secs.max(0.0)))
    }

    async fn parse_u64(&self, key: &str, default: u64) -> Result<u64> {
        match self.get_opt(key).await {
            Some(v) => v
                .trim()
                .parse()
                .map_err(|_| Error::Config(format!("{} must be an integer, got '{}'", key, v))),
            None => Ok(default),
        }
    }

    async fn parse_f64(&self, key: &str, default: f64) -> Result<f64> {
        match self.get_opt(key).await {
            Some(v) => v
                .trim()
                .parse()
                .ok()
                .filter(|n: &f64| n.is_finite())
                .ok_or_else(|| Error::Config(format!("{} must be a number, got '{}'", key, v))),
            None => Ok(default),
        }
    }
}

/// Parse `key=value` lines; `#` comments and blank lines are ignored,
/// values may be single- or double-quoted
fn parse_flat_file(text: &str) -> BTreeMap<String, String> {
    let mut entries = BTreeMap::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            tracing::warn!(line = %line, "Ignoring malformed settings line");
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        let value = value.trim();
        let value = value
            .strip_prefix('"')
            .and_then(|v| v.strip_suffix('"'))
            .or_else(|| value.strip_prefix('\'').and_then(|v| v.strip_suffix('\'')))
            .unwrap_or(value);
        entries.insert(key.to_string(), value.to_string());
    }
    entries
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_temp(content: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.env");
        std::fs::write(&path, content).unwrap();
        (dir, path)
    }

    #[test]
    fn test_parse_flat_file() {
        let entries = parse_flat_file(
            "# comment\nMQTT_BROKER=broker.local\n\nMQTT_PORT = 1884\nHA_TOKEN=\"abc=def\"\nbadline\n",
        );
        assert_eq!(entries.get("MQTT_BROKER").unwrap(), "broker.local");
        assert_eq!(entries.get("MQTT_PORT").unwrap(), "1884");
        assert_eq!(entries.get("HA_TOKEN").unwrap(), "abc=def");
        assert_eq!(entries.len(), 3);
    }

    #[tokio::test]
    async fn test_load_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::load(dir.path().join("absent.env")).await.unwrap();
        let mqtt = store.mqtt_settings().await.unwrap();
        assert_eq!(mqtt.broker, "localhost");
        assert_eq!(mqtt.port, 1883);
    }

    #[tokio::test]
    async fn test_save_then_reload_round_trip() {
        let (_dir, path) = write_temp("AI_BACKEND=ollama\nCUSTOM_KEY=kept\n");
        let store = ConfigStore::load(path.clone()).await.unwrap();

        let mut updates = BTreeMap::new();
        updates.insert("MQTT_BROKER".to_string(), "10.0.0.5".to_string());
        store.save(updates).await.unwrap();

        let reloaded = ConfigStore::load(path).await.unwrap();
        assert_eq!(reloaded.get("MQTT_BROKER").await.unwrap(), "10.0.0.5");
        // unknown keys survive a save
        assert_eq!(reloaded.get("CUSTOM_KEY").await.unwrap(), "kept");
        assert_eq!(
            reloaded.ai_settings().await.unwrap().backend,
            AiBackend::Ollama
        );
    }

    #[tokio::test]
    async fn test_save_empty_value_deletes_key() {
        let (_dir, path) = write_temp("RTSP_URL=rtsp://cam/stream\n");
        let store = ConfigStore::load(path).await.unwrap();

        let mut updates = BTreeMap::new();
        updates.insert("RTSP_URL".to_string(), String::new());
        store.save(updates).await.unwrap();

        assert!(store.get("RTSP_URL").await.is_none());
    }

    #[tokio::test]
    async fn test_capture_settings_rtsp_requires_url() {
        let (_dir, path) = write_temp("CAPTURE_MODE=rtsp\n");
        let store = ConfigStore::load(path).await.unwrap();
        let err = store.capture_settings().await.unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[tokio::test]
    async fn test_capture_settings_ha_polling() {
        let (_dir, path) = write_temp(
            "CAPTURE_MODE=ha_polling\nHA_BASE_URL=http://ha.local:8123/\nHA_TOKEN=tok\nHA_ENTITY_ID=camera.front\nPOLL_INTERVAL_SECONDS=0.5\n",
        );
        let store = ConfigStore::load(path).await.unwrap();
        let settings = store.capture_settings().await.unwrap();
        assert_eq!(settings.mode, CaptureMode::HaPolling);
        // trailing slash trimmed
        assert_eq!(settings.ha_base_url.as_deref(), Some("http://ha.local:8123"));
        assert_eq!(settings.poll_interval, Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_poll_interval_floor() {
        let (_dir, path) = write_temp(
            "CAPTURE_MODE=rtsp\nRTSP_URL=rtsp://cam/stream\nPOLL_INTERVAL_SECONDS=0.001\n",
        );
        let store = ConfigStore::load(path).await.unwrap();
        let settings = store.capture_settings().await.unwrap();
        assert_eq!(settings.poll_interval, Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_malformed_numeric_is_config_error() {
        let (_dir, path) = write_temp("MQTT_PORT=not-a-port\n");
        let store = ConfigStore::load(path).await.unwrap();
        assert!(matches!(
            store.mqtt_settings().await.unwrap_err(),
            Error::Config(_)
        ));
    }

    #[tokio::test]
    async fn test_masked_entries() {
        let (_dir, path) = write_temp("MQTT_PASSWORD=hunter2\nMQTT_BROKER=localhost\nHA_TOKEN=tok\n");
        let store = ConfigStore::load(path).await.unwrap();
        let masked = store.masked_entries().await;
        assert_eq!(masked.get("MQTT_PASSWORD").unwrap(), "********");
        assert_eq!(masked.get("HA_TOKEN").unwrap(), "********");
        assert_eq!(masked.get("MQTT_BROKER").unwrap(), "localhost");
    }

    #[tokio::test]
    async fn test_unknown_backend_rejected() {
        let (_dir, path) = write_temp("AI_BACKEND=claude\n");
        let store = ConfigStore::load(path).await.unwrap();
        assert!(matches!(
            store.ai_settings().await.unwrap_err(),
            Error::Config(_)
        ));
    }
}
