//! VisionClient - Vision model communication adapter
//!
//! ## Responsibilities
//!
//! - Send one frame plus a batched question set to the vision backend
//! - Enforce the configured timeout
//! - Lenient parsing of the structured answer
//!
//! Three interchangeable backends sit behind one enum, selected once at
//! configuration load. The orchestrator never branches on the backend.
//!
//! Answer parsing is deliberately lenient: any response containing an
//! affirmative token counts as yes, anything else (including "uncertain")
//! is no, and an unparseable people count is 0 while the rest of the
//! response is still used.

use crate::config_store::{AiBackend, AiSettings};
use crate::error::{AiError, Error, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde_json::{json, Value};
use std::time::Duration;

/// The fixed first question of every analysis batch
const PEOPLE_COUNT_QUESTION: &str =
    "How many people are visible in the image? (answer with an integer number)";

/// Hosted API base URL
const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";

/// Answer cap, generous for a JSON object with one entry per detection
const MAX_ANSWER_TOKENS: u32 = 500;

/// Parsed answers for one analysis batch
#[derive(Debug, Clone)]
pub struct AnalysisAnswers {
    /// People count, clamped to >= 0; 0 when the field is unparseable
    pub people_count: u32,
    /// One boolean per detection question, in question order; questions
    /// missing from the response default to false
    pub matches: Vec<bool>,
}

/// Vision model client
#[derive(Debug)]
pub struct VisionClient {
    client: reqwest::Client,
    backend: AiBackend,
    base_url: String,
    api_key: Option<String>,
    model: String,
    timeout: Duration,
}

impl VisionClient {
    /// Build a client from settings; the backend selection happens here,
    /// once, not per call
    pub fn from_settings(settings: &AiSettings) -> Result<Self> {
        let (base_url, api_key, model) = match settings.backend {
            AiBackend::OpenAi => {
                if settings.openai_api_key.is_empty() {
                    return Err(Error::Config(
                        "OPENAI_API_KEY is required for the openai backend".into(),
                    ));
                }
                (
                    OPENAI_BASE_URL.to_string(),
                    Some(settings.openai_api_key.clone()),
                    settings.openai_model.clone(),
                )
            }
            AiBackend::LmStudio => (
                settings.lmstudio_url.trim_end_matches('/').to_string(),
                // dummy key, required by OpenAI-compatible servers
                Some("lm-studio".to_string()),
                settings.lmstudio_model.clone(),
            ),
            AiBackend::Ollama => (
                settings.ollama_url.trim_end_matches('/').to_string(),
                None,
                settings.ollama_model.clone(),
            ),
        };

        let client = reqwest::Client::builder()
            .timeout(settings.timeout)
            .build()
            .map_err(|e| Error::Internal(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            backend: settings.backend,
            base_url,
            api_key,
            model,
            timeout: settings.timeout,
        })
    }

    pub fn backend(&self) -> AiBackend {
        self.backend
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Analyze one frame against the people-count question plus one yes/no
    /// question per phrase, as a single batched request.
    ///
    /// Phrases are sent as given: two detections with identical phrases get
    /// two independent questions and two independent answers.
    pub async fn analyze(&self, image: &[u8], phrases: &[String]) -> Result<AnalysisAnswers> {
        let prompt = build_combined_prompt(phrases);
        let text = self.send_vision_prompt(image, &prompt).await?;
        parse_answers(&text, phrases.len()).map_err(Error::from)
    }

    /// Minimal text-only round trip used by the connectivity-test endpoint
    pub async fn test_connection(&self) -> Result<String> {
        let body = match self.backend {
            AiBackend::OpenAi | AiBackend::LmStudio => json!({
                "model": self.model,
                "messages": [{"role": "user", "content": "Hello, are you working?"}],
                "max_tokens": 10,
            }),
            AiBackend::Ollama => json!({
                "model": self.model,
                "messages": [{"role": "user", "content": "Hello, are you working?"}],
                "stream": false,
            }),
        };
        self.send_chat(body).await.map_err(Error::from)
    }

    async fn send_vision_prompt(&self, image: &[u8], prompt: &str) -> Result<String> {
        let image_b64 = BASE64.encode(image);

        let body = match self.backend {
            AiBackend::OpenAi | AiBackend::LmStudio => json!({
                "model": self.model,
                "messages": [{
                    "role": "user",
                    "content": [
                        {"type": "text", "text": prompt},
                        {"type": "image_url", "image_url": {
                            "url": format!("data:image/jpeg;base64,{}", image_b64)
                        }},
                    ],
                }],
                "max_tokens": MAX_ANSWER_TOKENS,
            }),
            AiBackend::Ollama => json!({
                "model": self.model,
                "messages": [{
                    "role": "user",
                    "content": prompt,
                    "images": [image_b64],
                }],
                "stream": false,
            }),
        };

        self.send_chat(body).await.map_err(Error::from)
    }

    async fn send_chat(&self, body: Value) -> std::result::Result<String, AiError> {
        let url = match self.backend {
            AiBackend::OpenAi | AiBackend::LmStudio => {
                format!("{}/chat/completions", self.base_url)
            }
            AiBackend::Ollama => format!("{}/api/chat", self.base_url),
        };

        let mut request = self.client.post(&url).json(&body);
        if let Some(ref key) = self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                AiError::Timeout(format!(
                    "No response from {} within {}s",
                    self.backend.as_str(),
                    self.timeout.as_secs()
                ))
            } else {
                AiError::InvalidResponse(format!(
                    "Request to {} failed: {}",
                    self.backend.as_str(),
                    e
                ))
            }
        })?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(AiError::Unauthorized(format!(
                "{} rejected the credentials ({})",
                self.backend.as_str(),
                status
            )));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AiError::InvalidResponse(format!(
                "{} returned {}: {}",
                self.backend.as_str(),
                status,
                body.chars().take(200).collect::<String>()
            )));
        }

        let payload: Value = response.json().await.map_err(|e| {
            AiError::InvalidResponse(format!("Response body is not JSON: {}", e))
        })?;

        let content = match self.backend {
            AiBackend::OpenAi | AiBackend::LmStudio => payload
                .pointer("/choices/0/message/content")
                .and_then(Value::as_str),
            AiBackend::Ollama => payload.pointer("/message/content").and_then(Value::as_str),
        };

        content
            .map(|s| s.to_string())
            .ok_or_else(|| AiError::InvalidResponse("Response carries no message content".into()))
    }
}

/// Build the combined prompt: people count plus one numbered yes/no
/// question per phrase, requesting a strict JSON answer
fn build_combined_prompt(phrases: &[String]) -> String {
    let mut detection_block = String::new();
    for (i, phrase) in phrases.iter().enumerate() {
        detection_block.push_str(&format!(
            "\nDetection {}: {} (Answer with YES or NO)",
            i + 1,
            phrase
        ));
    }

    format!(
        "Analyze this image and answer the following questions in a structured JSON format:\n\
         \n\
         1. {}\n\
         {}\n\
         \n\
         Format your response as valid JSON like this:\n\
         {{\n\
           \"people_count\": number_of_people,\n\
           \"detections\": [\n\
             {{ \"id\": 1, \"result\": \"YES/NO\" }},\n\
             {{ \"id\": 2, \"result\": \"YES/NO\" }}\n\
           ]\n\
         }}\n\
         \n\
         Make sure your response is valid JSON without any additional text before or after.",
        PEOPLE_COUNT_QUESTION, detection_block
    )
}

/// Parse the model's reply. Models wrap JSON in prose often enough that we
/// extract the first balanced object instead of parsing the whole text.
fn parse_answers(text: &str, question_count: usize) -> std::result::Result<AnalysisAnswers, AiError> {
    let object = extract_json_object(text).ok_or_else(|| {
        AiError::InvalidResponse(format!(
            "No JSON object in response: {}",
            text.chars().take(120).collect::<String>()
        ))
    })?;

    let value: Value = serde_json::from_str(object).map_err(|e| {
        AiError::InvalidResponse(format!("Malformed JSON in response: {}", e))
    })?;

    let people_count = parse_people_count(value.get("people_count"));

    let empty = Vec::new();
    let entries = value
        .get("detections")
        .and_then(Value::as_array)
        .unwrap_or(&empty);

    let matches = (0..question_count)
        .map(|i| {
            entries
                .get(i)
                .and_then(|e| e.get("result"))
                .and_then(Value::as_str)
                .map(is_affirmative)
                .unwrap_or(false)
        })
        .collect();

    Ok(AnalysisAnswers {
        people_count,
        matches,
    })
}

/// First balanced `{...}` object in the text
fn extract_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, ch) in text[start..].char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + offset + ch.len_utf8()]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Lenient yes/no normalization: case-insensitive affirmative match,
/// anything else is false
fn is_affirmative(answer: &str) -> bool {
    let upper = answer.trim().to_uppercase();
    upper.contains("YES") || upper.contains("OUI")
}

/// Lenient people-count parse: number or numeric string, clamped to >= 0,
/// 0 on parse failure so the rest of the response is still usable
fn parse_people_count(value: Option<&Value>) -> u32 {
    let Some(value) = value else { return 0 };
    if let Some(n) = value.as_u64() {
        return u32::try_from(n).unwrap_or(u32::MAX);
    }
    if let Some(n) = value.as_i64() {
        return u32::try_from(n.max(0)).unwrap_or(u32::MAX);
    }
    if let Some(n) = value.as_f64() {
        return if n.is_finite() && n > 0.0 { n as u32 } else { 0 };
    }
    if let Some(s) = value.as_str() {
        if let Ok(n) = s.trim().parse::<i64>() {
            return u32::try_from(n.max(0)).unwrap_or(u32::MAX);
        }
    }
    0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_affirmative_matching() {
        assert!(is_affirmative("YES"));
        assert!(is_affirmative("Yes, clearly"));
        assert!(is_affirmative("oui"));
        assert!(!is_affirmative("NO"));
        assert!(!is_affirmative("uncertain"));
        assert!(!is_affirmative(""));
    }

    #[test]
    fn test_people_count_variants() {
        assert_eq!(parse_people_count(Some(&json!(3))), 3);
        assert_eq!(parse_people_count(Some(&json!("3"))), 3);
        assert_eq!(parse_people_count(Some(&json!(" 7 "))), 7);
        assert_eq!(parse_people_count(Some(&json!(-2))), 0);
        assert_eq!(parse_people_count(Some(&json!("many"))), 0);
        assert_eq!(parse_people_count(None), 0);
    }

    #[test]
    fn test_parse_answers_happy_path() {
        let text = r#"{"people_count": "3", "detections": [{"id": 1, "result": "Yes, clearly"}, {"id": 2, "result": "no"}]}"#;
        let answers = parse_answers(text, 2).unwrap();
        assert_eq!(answers.people_count, 3);
        assert_eq!(answers.matches, vec![true, false]);
    }

    #[test]
    fn test_parse_answers_with_surrounding_prose() {
        let text = "Sure! Here is the JSON you asked for:\n{\"people_count\": 1, \"detections\": [{\"id\": 1, \"result\": \"NO\"}]}\nLet me know if you need more.";
        let answers = parse_answers(text, 1).unwrap();
        assert_eq!(answers.people_count, 1);
        assert_eq!(answers.matches, vec![false]);
    }

    #[test]
    fn test_parse_answers_missing_entries_default_false() {
        let text = r#"{"people_count": 0, "detections": [{"id": 1, "result": "YES"}]}"#;
        let answers = parse_answers(text, 3).unwrap();
        assert_eq!(answers.matches, vec![true, false, false]);
    }

    #[test]
    fn test_parse_answers_no_json_is_invalid_response() {
        let err = parse_answers("I cannot analyze this image.", 1).unwrap_err();
        assert!(matches!(err, AiError::InvalidResponse(_)));
    }

    #[test]
    fn test_extract_json_skips_braces_in_strings() {
        let text = r#"note {"people_count": 2, "detections": [{"id": 1, "result": "no } yes"}]} tail"#;
        let object = extract_json_object(text).unwrap();
        let value: Value = serde_json::from_str(object).unwrap();
        assert_eq!(value["people_count"], 2);
    }

    #[test]
    fn test_prompt_numbers_questions_independently() {
        let phrases = vec!["a red car".to_string(), "a red car".to_string()];
        let prompt = build_combined_prompt(&phrases);
        assert!(prompt.contains("Detection 1: a red car"));
        assert!(prompt.contains("Detection 2: a red car"));
    }

    #[test]
    fn test_from_settings_requires_openai_key() {
        let settings = AiSettings {
            backend: AiBackend::OpenAi,
            openai_api_key: String::new(),
            openai_model: "gpt-4o".into(),
            lmstudio_url: "http://localhost:1234/v1".into(),
            lmstudio_model: "local-model".into(),
            ollama_url: "http://localhost:11434".into(),
            ollama_model: "llama3.2-vision:latest".into(),
            timeout: Duration::from_secs(60),
        };
        assert!(matches!(
            VisionClient::from_settings(&settings).unwrap_err(),
            Error::Config(_)
        ));

        let settings = AiSettings {
            backend: AiBackend::Ollama,
            ..settings
        };
        let client = VisionClient::from_settings(&settings).unwrap();
        assert_eq!(client.backend(), AiBackend::Ollama);
        assert_eq!(client.model(), "llama3.2-vision:latest");
    }
}
