//! The boundary to the external multimodal model. An `InferenceBackend`
//! takes an instruction and an image and returns the model's text, if any.
//! `GeminiClient` is the production backend, speaking the Gemini
//! `generateContent` REST API.

use crate::config::Settings;
use async_trait::async_trait;
use std::fmt::Debug;
use thiserror::Error;
use tracing::debug;

/// Longest upstream error body kept in an `InferenceError`
const MAX_ERROR_BODY: usize = 512;

/// An image ready to hand to the model: bare base 64 plus its MIME type
#[derive(Clone, PartialEq, Eq)]
pub struct ImagePayload {
    pub mime_type: String,
    pub data: String,
}

impl Debug for ImagePayload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "ImagePayload {{ mime_type: {:?}, data: <{} bytes> }}",
            self.mime_type,
            self.data.len()
        )
    }
}

#[derive(Error, Debug)]
pub enum InferenceError {
    #[error("inference request failed: {0}")]
    Transport(String),

    #[error("inference service returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("inference reply was malformed: {0}")]
    Malformed(String),
}

impl InferenceError {
    /// Whether the same call may succeed if simply tried again
    pub fn is_transient(&self) -> bool {
        match self {
            InferenceError::Transport(_) => true,
            InferenceError::Status { status, .. } => *status == 429 || *status >= 500,
            InferenceError::Malformed(_) => false,
        }
    }
}

impl From<reqwest::Error> for InferenceError {
    fn from(err: reqwest::Error) -> Self {
        InferenceError::Transport(err.to_string())
    }
}

#[async_trait]
pub trait InferenceBackend: Send + Sync {
    /// Run the model once. `Ok(None)` means the service answered but
    /// produced no text
    async fn generate(
        &self,
        instruction: &str,
        image: &ImagePayload,
    ) -> Result<Option<String>, InferenceError>;
}

/// Wire types for `models/{model}:generateContent`
mod wire {
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Serialize)]
    #[serde(rename_all = "camelCase")]
    pub struct GenerateContentRequest {
        pub contents: Vec<Content>,
        pub generation_config: GenerationConfig,
    }

    #[derive(Debug, Serialize)]
    pub struct GenerationConfig {
        pub temperature: f32,
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct Content {
        #[serde(skip_serializing_if = "Option::is_none")]
        pub role: Option<String>,
        #[serde(default)]
        pub parts: Vec<Part>,
    }

    /// Variant order matters for untagged decoding
    #[derive(Debug, Clone, Serialize, Deserialize)]
    #[serde(untagged)]
    pub enum Part {
        Text {
            text: String,
        },
        InlineData {
            #[serde(rename = "inlineData")]
            inline_data: InlineData,
        },
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct InlineData {
        pub mime_type: String,
        pub data: String,
    }

    #[derive(Debug, Deserialize)]
    pub struct GenerateContentResponse {
        #[serde(default)]
        pub candidates: Vec<Candidate>,
    }

    #[derive(Debug, Deserialize)]
    pub struct Candidate {
        pub content: Option<Content>,
    }

    impl GenerateContentResponse {
        /// Text of the first part of the first candidate
        pub fn first_text(self) -> Option<String> {
            let content = self.candidates.into_iter().next()?.content?;
            match content.parts.into_iter().next()? {
                Part::Text { text } => Some(text),
                Part::InlineData { .. } => None,
            }
        }
    }
}

use wire::*;

/// Client for the Gemini REST API
pub struct GeminiClient {
    http: reqwest::Client,
    base_url: String,
    model: String,
    api_key: String,
    temperature: f32,
}

impl Debug for GeminiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "GeminiClient {{ base_url: {:?}, model: {:?} }}",
            self.base_url, self.model
        )
    }
}

impl GeminiClient {
    pub fn new(settings: &Settings) -> Result<Self, InferenceError> {
        Ok(GeminiClient {
            http: reqwest::Client::builder().build()?,
            base_url: settings.api_base_url.trim_end_matches('/').to_string(),
            model: settings.model.clone(),
            api_key: settings.api_key.clone(),
            temperature: settings.temperature,
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/models/{}:generateContent", self.base_url, self.model)
    }

    fn request_body(&self, instruction: &str, image: &ImagePayload) -> GenerateContentRequest {
        GenerateContentRequest {
            contents: vec![Content {
                role: Some("user".into()),
                parts: vec![
                    Part::Text {
                        text: instruction.to_string(),
                    },
                    Part::InlineData {
                        inline_data: InlineData {
                            mime_type: image.mime_type.clone(),
                            data: image.data.clone(),
                        },
                    },
                ],
            }],
            generation_config: GenerationConfig {
                temperature: self.temperature,
            },
        }
    }
}

#[async_trait]
impl InferenceBackend for GeminiClient {
    #[tracing::instrument(skip(self, instruction))]
    async fn generate(
        &self,
        instruction: &str,
        image: &ImagePayload,
    ) -> Result<Option<String>, InferenceError> {
        let response = self
            .http
            .post(self.endpoint())
            .header("x-goog-api-key", &self.api_key)
            .json(&self.request_body(instruction, image))
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        debug!(%status, bytes = body.len(), "inference service replied");

        if !status.is_success() {
            let mut body = body;
            if let Some((cut, _)) = body.char_indices().nth(MAX_ERROR_BODY) {
                body.truncate(cut);
            }
            return Err(InferenceError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let reply: GenerateContentResponse =
            serde_json::from_str(&body).map_err(|e| InferenceError::Malformed(e.to_string()))?;
        Ok(reply.first_text())
    }
}

#[cfg(test)]
pub(crate) mod stub {
    //! A scripted backend for exercising the analysis path without a network

    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    pub type Outcome = Result<Option<String>, InferenceError>;

    #[derive(Default)]
    pub struct StubBackend {
        outcomes: Mutex<VecDeque<Outcome>>,
        delay: Option<Duration>,
        calls: AtomicUsize,
        last_image: Mutex<Option<ImagePayload>>,
    }

    impl StubBackend {
        pub fn new(outcomes: Vec<Outcome>) -> Self {
            Self {
                outcomes: Mutex::new(outcomes.into()),
                ..Default::default()
            }
        }

        pub fn replying(text: &str) -> Self {
            Self::new(vec![Ok(Some(text.to_string()))])
        }

        pub fn slow(delay: Duration) -> Self {
            Self {
                delay: Some(delay),
                ..Self::replying(r#"{"score":1,"analysis":"late"}"#)
            }
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        pub fn last_image(&self) -> Option<ImagePayload> {
            self.last_image.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl InferenceBackend for StubBackend {
        async fn generate(
            &self,
            _instruction: &str,
            image: &ImagePayload,
        ) -> Result<Option<String>, InferenceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            *self.last_image.lock().unwrap() = Some(image.clone());
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            let next = self.outcomes.lock().unwrap().pop_front();
            next.unwrap_or_else(|| Err(InferenceError::Transport("stub exhausted".into())))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn settings() -> Settings {
        Settings {
            host: "127.0.0.1".into(),
            port: 0,
            api_key: "k".into(),
            api_base_url: "https://example.test/v1beta/".into(),
            model: "gemini-test".into(),
            temperature: 0.5,
            request_timeout_secs: 1,
            max_attempts: 1,
            backoff_base_ms: 1,
            backoff_max_ms: 1,
            max_body_bytes: 1024,
        }
    }

    #[test]
    fn builds_generate_content_request() {
        let client = GeminiClient::new(&settings()).unwrap();
        assert_eq!(
            client.endpoint(),
            "https://example.test/v1beta/models/gemini-test:generateContent"
        );

        let image = ImagePayload {
            mime_type: "image/png".into(),
            data: "AAAA".into(),
        };
        let body = serde_json::to_value(client.request_body("rate me", &image)).unwrap();
        assert_eq!(
            body,
            json!({
                "contents": [{
                    "role": "user",
                    "parts": [
                        { "text": "rate me" },
                        { "inlineData": { "mimeType": "image/png", "data": "AAAA" } }
                    ]
                }],
                "generationConfig": { "temperature": 0.5 }
            })
        );
    }

    #[test]
    fn extracts_first_candidate_text() {
        let reply: GenerateContentResponse = serde_json::from_value(json!({
            "candidates": [
                { "content": { "role": "model", "parts": [{ "text": "{\"score\": 3}" }] } },
                { "content": { "role": "model", "parts": [{ "text": "ignored" }] } }
            ]
        }))
        .unwrap();
        assert_eq!(reply.first_text().as_deref(), Some("{\"score\": 3}"));
    }

    #[test]
    fn no_candidates_means_no_text() {
        let reply: GenerateContentResponse = serde_json::from_value(json!({})).unwrap();
        assert_eq!(reply.first_text(), None);

        let blocked: GenerateContentResponse =
            serde_json::from_value(json!({ "candidates": [{ "finishReason": "SAFETY" }] })).unwrap();
        assert_eq!(blocked.first_text(), None);
    }

    #[test]
    fn classifies_transient_failures() {
        assert!(InferenceError::Transport("reset".into()).is_transient());
        assert!(InferenceError::Status { status: 503, body: String::new() }.is_transient());
        assert!(InferenceError::Status { status: 429, body: String::new() }.is_transient());
        assert!(!InferenceError::Status { status: 401, body: String::new() }.is_transient());
        assert!(!InferenceError::Malformed("eof".into()).is_transient());
    }

    #[test]
    fn debug_hides_image_data() {
        let image = ImagePayload {
            mime_type: "image/jpeg".into(),
            data: "c2VjcmV0".into(),
        };
        assert!(!format!("{image:?}").contains("c2VjcmV0"));
    }
}
