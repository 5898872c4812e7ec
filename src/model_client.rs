//! Remote generative-model adapter.
//!
//! Defines the [`ModelClient`] trait used by the analysis driver and the
//! [`VertexClient`] implementation, which calls the Vertex AI Gemini
//! `generateContent` endpoint once per chunk.
//!
//! Every call is independent: no conversation state is carried between
//! chunks, and a failed call is returned to the caller as-is (no retry).

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::time::Duration;

use crate::config::AnalysisConfig;
use crate::credentials::Credentials;

/// Fixed system instruction sent with every request.
pub const SYSTEM_INSTRUCTION: &str = "You are a text processing assistant. Follow the user's \
instruction exactly. When possible, answer in JSON (for example {\"terms\": [...]}) and list \
the extracted keywords. If you cannot produce JSON you may answer in plain text.";

/// A stateless text-generation backend.
#[async_trait]
pub trait ModelClient: Send + Sync {
    /// Model identifier used in reports.
    fn model_name(&self) -> &str;

    /// Send one chunk with the user's instruction; returns the trimmed response text.
    async fn generate(&self, prompt: &str, chunk: &str) -> Result<String>;
}

/// Sampling settings for a generation request.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationSettings {
    pub max_output_tokens: u32,
    pub temperature: f32,
    pub top_p: f32,
    pub top_k: u32,
}

impl GenerationSettings {
    fn to_json(&self) -> Value {
        json!({
            "maxOutputTokens": self.max_output_tokens,
            "temperature": self.temperature,
            "topP": self.top_p,
            "topK": self.top_k,
        })
    }
}

/// Gemini on Vertex AI.
pub struct VertexClient {
    http: reqwest::Client,
    url: String,
    model: String,
    credentials: Credentials,
    settings: GenerationSettings,
}

impl VertexClient {
    /// Build a client for `config.model` in `config.region`.
    ///
    /// # Errors
    ///
    /// Fails when the credentials carry no `project_id` or the HTTP client
    /// cannot be constructed.
    pub fn new(
        config: &AnalysisConfig,
        credentials: &Credentials,
        settings: GenerationSettings,
    ) -> Result<Self> {
        let project_id = credentials.require_project_id()?;
        let base = config
            .endpoint
            .clone()
            .unwrap_or_else(|| format!("https://{}-aiplatform.googleapis.com/v1", config.region));
        let url = format!(
            "{}/projects/{}/locations/{}/publishers/google/models/{}:generateContent",
            base.trim_end_matches('/'),
            project_id,
            config.region,
            config.model
        );

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            http,
            url,
            model: config.model.clone(),
            credentials: credentials.clone(),
            settings,
        })
    }

    fn request_body(&self, prompt: &str, chunk: &str) -> Value {
        json!({
            "systemInstruction": {
                "parts": [{ "text": SYSTEM_INSTRUCTION }]
            },
            "contents": [{
                "role": "user",
                "parts": [
                    { "text": format!(
                        "USER INSTRUCTION:\n{}\n\nPlease answer in JSON if possible (e.g. {{\"terms\": [...]}})",
                        prompt
                    ) },
                    { "text": format!("TEXT CHUNK:\n{}", chunk) }
                ]
            }],
            "generationConfig": self.settings.to_json(),
        })
    }
}

#[async_trait]
impl ModelClient for VertexClient {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn generate(&self, prompt: &str, chunk: &str) -> Result<String> {
        let response = self
            .http
            .post(&self.url)
            .header("Authorization", self.credentials.bearer().await?)
            .json(&self.request_body(prompt, chunk))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            bail!("Vertex AI error {}: {}", status, body_text);
        }

        let json: Value = response.json().await?;
        Ok(candidate_text(&json))
    }
}

/// Concatenate the text parts of the first candidate.
fn candidate_text(json: &Value) -> String {
    json.pointer("/candidates/0/content/parts")
        .and_then(Value::as_array)
        .map(|parts| {
            parts
                .iter()
                .filter_map(|p| p.get("text").and_then(Value::as_str))
                .collect::<String>()
        })
        .unwrap_or_default()
        .trim()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::CLOUD_PLATFORM_SCOPE;
    use std::fs;
    use tempfile::TempDir;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn credentials(tmp: &TempDir) -> Credentials {
        let p = tmp.path().join("sa.json");
        fs::write(&p, r#"{"project_id":"proj-1","access_token":"secret"}"#).unwrap();
        Credentials::load(&p, CLOUD_PLATFORM_SCOPE).unwrap()
    }

    fn settings() -> GenerationSettings {
        GenerationSettings {
            max_output_tokens: 2048,
            temperature: 0.0,
            top_p: 0.9,
            top_k: 40,
        }
    }

    #[test]
    fn candidate_text_joins_parts() {
        let json = serde_json::json!({
            "candidates": [{ "content": { "parts": [{"text": " {\"terms\":"}, {"text": "[\"a\"]} \n"}] } }]
        });
        assert_eq!(candidate_text(&json), "{\"terms\":[\"a\"]}");
        assert_eq!(candidate_text(&serde_json::json!({})), "");
    }

    #[tokio::test]
    async fn posts_generate_content_request() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(
                "/projects/proj-1/locations/us-central1/publishers/google/models/gemini-test:generateContent",
            ))
            .and(header("Authorization", "Bearer secret"))
            .and(body_partial_json(serde_json::json!({
                "generationConfig": { "maxOutputTokens": 2048, "topK": 40 }
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "candidates": [{ "content": { "parts": [{ "text": "{\"terms\": [\"x\"]}" }] } }]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let tmp = TempDir::new().unwrap();
        let config = AnalysisConfig {
            model: "gemini-test".to_string(),
            endpoint: Some(server.uri()),
            ..AnalysisConfig::default()
        };
        let client = VertexClient::new(&config, &credentials(&tmp), settings()).unwrap();
        let text = client.generate("extract terms", "some text").await.unwrap();
        assert_eq!(text, "{\"terms\": [\"x\"]}");
    }

    #[tokio::test]
    async fn error_status_is_returned_without_retry() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .expect(1)
            .mount(&server)
            .await;

        let tmp = TempDir::new().unwrap();
        let config = AnalysisConfig {
            endpoint: Some(server.uri()),
            ..AnalysisConfig::default()
        };
        let client = VertexClient::new(&config, &credentials(&tmp), settings()).unwrap();
        let err = client.generate("p", "c").await.unwrap_err();
        assert!(err.to_string().contains("500"));
    }
}
