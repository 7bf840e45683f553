use crate::analysis::AnalysisError;
use actix_web::http::header::ContentType;
use actix_web::http::StatusCode;
use actix_web::HttpResponse;
use protocol::ErrorBody;
use tracing::{error, warn};

pub mod protocol;
pub mod routes;

/// Message for upstream failures. Internal detail stays in the logs
const GENERIC_FAILURE: &str = "Failed to analyze image";

/// An error on its way to the HTTP client: a status and a message that is
/// safe to show
#[derive(Debug)]
pub struct WebError {
    status: StatusCode,
    message: String,
}

impl WebError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        WebError {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for WebError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl actix_web::error::ResponseError for WebError {
    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code())
            .insert_header(ContentType::json())
            .json(ErrorBody {
                error: self.message.clone(),
            })
    }

    fn status_code(&self) -> StatusCode {
        self.status
    }
}

impl From<AnalysisError> for WebError {
    fn from(err: AnalysisError) -> WebError {
        match err {
            AnalysisError::MissingInput => {
                warn!("rejected request without an image");
                WebError::bad_request(err.to_string())
            }
            AnalysisError::UpstreamEmpty => {
                error!(error = %err, "analysis failed");
                WebError {
                    status: StatusCode::INTERNAL_SERVER_ERROR,
                    message: "Inference service did not return a valid response".into(),
                }
            }
            AnalysisError::UpstreamTimeout(_) => {
                error!(error = %err, "analysis failed");
                WebError {
                    status: StatusCode::GATEWAY_TIMEOUT,
                    message: "Analysis timed out, please try again".into(),
                }
            }
            AnalysisError::UpstreamUnavailable(_) => {
                error!(error = %err, "analysis failed");
                WebError {
                    status: StatusCode::INTERNAL_SERVER_ERROR,
                    message: GENERIC_FAILURE.into(),
                }
            }
        }
    }
}
