use serde::{Deserialize, Serialize};
use std::fmt::Debug;

/// A face photo to analyze, as a data URL or bare base 64. A missing `image`
/// field is treated the same as an empty one
#[derive(Default, Serialize, Deserialize)]
pub struct AnalysisRequest {
    #[serde(default)]
    pub image: Option<String>,
}

impl Debug for AnalysisRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.image {
            Some(image) => write!(f, "AnalysisRequest {{ image: <{} bytes> }}", image.len()),
            None => write!(f, "AnalysisRequest {{ image: None }}"),
        }
    }
}

/// The verdict returned to the client. `score` is always within `0..=100`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisResult {
    pub score: u8,
    pub analysis: String,

    /// Set when the model reported that it could not find a face
    #[serde(default, skip_serializing_if = "is_false")]
    pub no_face_detected: bool,
}

fn is_false(b: &bool) -> bool {
    !*b
}

/// Body of every non-200 response
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}
