//! The analyzer turns an uploaded photo into an `AnalysisResult`. It strips
//! the data-URL wrapper, asks the inference backend for a verdict, and
//! normalizes whatever comes back. Upstream call failures are errors. A reply
//! that is not the JSON we asked for is not: it degrades to a random fallback
//! score.

use crate::config::Settings;
use crate::inference::{GeminiClient, ImagePayload, InferenceBackend, InferenceError};
use crate::retry::RetryPolicy;
use crate::server::protocol::AnalysisResult;
use crate::util;
use base64::{engine::general_purpose, Engine as _};
use once_cell::sync::Lazy;
use rand::Rng;
use regex::Regex;
use serde::{Deserialize, Deserializer};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

/// MIME type assumed when neither the prefix nor the bytes say otherwise
pub const DEFAULT_MIME_TYPE: &str = "image/jpeg";

/// Score the model is told to return when it cannot find a face
pub const NO_FACE_SENTINEL: f64 = -1.0;

/// Shown when the model's reply could not be parsed
pub const FALLBACK_ANALYSIS: &str = "The AI had trouble reading this one, but going by the vibes alone you look pretty chill.";

/// Instruction sent alongside every photo
pub const PROMPT: &str = r#"You are a playful AI that looks at faces and guesses, purely for entertainment, whether the person seems "elevated" (cannabis-influenced).

Look at the photo and give:
1. A score from 0 to 100, where 100 means they definitely look elevated and 0 means completely sober.
2. A short, funny but respectful explanation in cannabis-culture slang ("elevated", "vibing", "chilled out", "in the clouds").

Things worth noticing: red or droopy eyes, a relaxed or sleepy expression, dilated pupils, a spaced-out or blissful look, general mellow vibes.

Reply with JSON only, in exactly this shape:
{
  "score": <number between 0 and 100>,
  "analysis": "<two or three sentences>"
}

If no face is clearly visible, say so in the analysis and use a score of -1. If there are several faces, assess all of them and say which is which."#;

/// Only the leading bytes are needed to recognise an image container
const SNIFF_CHARS: usize = 64;

static DATA_URL_PREFIX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^data:image/([a-z]+);base64,").expect("valid data URL regex"));

#[derive(Error, Debug)]
pub enum AnalysisError {
    #[error("No image provided")]
    MissingInput,

    #[error("inference service returned no text")]
    UpstreamEmpty,

    #[error("inference service unavailable: {0}")]
    UpstreamUnavailable(#[from] InferenceError),

    #[error("inference service did not answer within {0:?}")]
    UpstreamTimeout(Duration),
}

/// Strip a `data:image/<subtype>;base64,` prefix and work out the MIME type.
/// Without a prefix the payload is passed through and the type is sniffed
/// from its decoded leading bytes
pub fn normalize_image(image: &str) -> ImagePayload {
    if let Some(caps) = DATA_URL_PREFIX.captures(image) {
        let subtype = caps[1].to_ascii_lowercase();
        let mime_type = match subtype.as_str() {
            "jpg" => DEFAULT_MIME_TYPE.to_string(),
            subtype => format!("image/{subtype}"),
        };
        return ImagePayload {
            mime_type,
            data: image[caps[0].len()..].to_string(),
        };
    }

    let head = image.get(..SNIFF_CHARS).unwrap_or(image);
    let mime_type = general_purpose::STANDARD
        .decode(head)
        .ok()
        .and_then(|bytes| util::sniff_mime_type(&bytes))
        .unwrap_or(DEFAULT_MIME_TYPE);

    ImagePayload {
        mime_type: mime_type.to_string(),
        data: image.to_string(),
    }
}

/// The JSON object the model is asked to produce
#[derive(Debug, Deserialize, PartialEq)]
pub struct ModelReply {
    #[serde(deserialize_with = "lenient_score")]
    pub score: f64,
    pub analysis: String,
}

/// Models sometimes quote the score (`"85"`); accept that as a number
fn lenient_score<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Score {
        Num(f64),
        Str(String),
    }

    match Score::deserialize(deserializer)? {
        Score::Num(score) => Ok(score),
        Score::Str(raw) => raw
            .trim()
            .parse()
            .map_err(|_| serde::de::Error::custom(format!("score {raw:?} is not a number"))),
    }
}

/// Parse the model's reply, tolerating a Markdown code fence around it
pub fn parse_reply(text: &str) -> Result<ModelReply, serde_json::Error> {
    serde_json::from_str(strip_code_fence(text))
}

fn strip_code_fence(text: &str) -> &str {
    let text = text.trim();
    let Some(inner) = text.strip_prefix("```") else {
        return text;
    };
    // drop the info string (`json`) on the opening line
    let inner = inner.split_once('\n').map_or("", |(_, rest)| rest);
    inner.trim_end().strip_suffix("```").unwrap_or(inner).trim()
}

/// Round and force a score into `0..=100`. NaN counts as 0
pub fn clamp_score(score: f64) -> u8 {
    if score.is_nan() {
        return 0;
    }
    score.round().max(0.0).min(100.0) as u8
}

impl From<ModelReply> for AnalysisResult {
    fn from(reply: ModelReply) -> Self {
        AnalysisResult {
            score: clamp_score(reply.score),
            analysis: reply.analysis,
            no_face_detected: reply.score == NO_FACE_SENTINEL,
        }
    }
}

impl AnalysisResult {
    /// Stand-in result for a reply that could not be parsed
    pub fn fallback() -> Self {
        AnalysisResult {
            score: rand::thread_rng().gen_range(0, 101),
            analysis: FALLBACK_ANALYSIS.to_string(),
            no_face_detected: false,
        }
    }
}

/// Stateless request handler shared by every server worker
pub struct Analyzer {
    backend: Arc<dyn InferenceBackend>,
    retry: RetryPolicy,
    timeout: Duration,
}

impl Analyzer {
    pub fn new(backend: Arc<dyn InferenceBackend>, retry: RetryPolicy, timeout: Duration) -> Self {
        Analyzer {
            backend,
            retry,
            timeout,
        }
    }

    /// Build an analyzer backed by the Gemini API
    pub fn from_settings(settings: &Settings) -> Result<Self, InferenceError> {
        let backend = GeminiClient::new(settings)?;
        info!(?backend, "using inference backend");
        Ok(Self::new(
            Arc::new(backend),
            RetryPolicy::from(settings),
            settings.request_timeout(),
        ))
    }

    /// Score one photo
    pub async fn analyze(&self, image: &str) -> Result<AnalysisResult, AnalysisError> {
        if image.trim().is_empty() {
            return Err(AnalysisError::MissingInput);
        }

        let payload = normalize_image(image);
        let text = self
            .generate(&payload)
            .await?
            .filter(|text| !text.trim().is_empty())
            .ok_or(AnalysisError::UpstreamEmpty)?;

        let result = match parse_reply(&text) {
            Ok(reply) => AnalysisResult::from(reply),
            Err(e) => {
                warn!(error = %e, "could not parse model reply, substituting a fallback");
                AnalysisResult::fallback()
            }
        };

        Ok(result)
    }

    /// Call the backend, retrying transient failures and timeouts with backoff
    async fn generate(&self, payload: &ImagePayload) -> Result<Option<String>, AnalysisError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let err = match tokio::time::timeout(self.timeout, self.backend.generate(PROMPT, payload)).await {
                Ok(Ok(reply)) => return Ok(reply),
                Ok(Err(e)) if !e.is_transient() => return Err(e.into()),
                Ok(Err(e)) => AnalysisError::UpstreamUnavailable(e),
                Err(_) => AnalysisError::UpstreamTimeout(self.timeout),
            };

            if !self.retry.should_retry(attempt) {
                return Err(err);
            }

            let delay = self.retry.delay_for(attempt);
            warn!(
                attempt,
                max = self.retry.max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "inference call failed, will retry"
            );
            tokio::time::sleep(delay).await;
        }
    }
}
