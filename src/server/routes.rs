//! The JSON web server the capture client talks to. A single route accepts a
//! photo and answers with a score.

use super::protocol::{AnalysisRequest, AnalysisResult};
use super::WebError;
use crate::analysis::Analyzer;
use crate::config::ANALYZE_PATH;
use actix_web::{web, Responder};
use tracing::{info, warn};

type Result<T> = std::result::Result<T, WebError>;

/// Register every route on an actix `App`
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(web::resource(ANALYZE_PATH).route(web::post().to(analyze_face)));
}

/// JSON extractor settings. Photos arrive as base 64, well over actix's
/// default body limit
pub fn json_config(limit: usize) -> web::JsonConfig {
    web::JsonConfig::default()
        .limit(limit)
        .error_handler(|err, _req| {
            warn!(error = %err, "rejected malformed request body");
            WebError::bad_request("Invalid request body").into()
        })
}

pub async fn analyze_face(
    req: web::Json<AnalysisRequest>,
    analyzer: web::Data<Analyzer>,
) -> Result<impl Responder> {
    let image = req.into_inner().image.unwrap_or_default();
    let result: AnalysisResult = analyzer.analyze(&image).await?;

    info!(
        score = result.score,
        no_face = result.no_face_detected,
        "finished serving analysis request"
    );

    Ok(web::Json(result))
}
