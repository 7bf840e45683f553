//! The capture client. A `CaptureSession` owns one capture/analysis cycle as
//! an explicit state machine:
//!
//! ```text
//! Idle --start_camera--> Capturing --take_snapshot--> ImageCaptured
//! Idle --select_file--------------------------------> ImageCaptured
//! ImageCaptured | ResultReady --begin_analysis--> Analyzing
//! Analyzing --success--> ResultReady
//! Analyzing --failure--> ImageCaptured (with a notice)
//! any --reset--> Idle
//! ```
//!
//! The camera is released whenever the session leaves `Capturing`, and when
//! the session is dropped.

use crate::config::ANALYZE_PATH;
use crate::server::protocol::{AnalysisRequest, AnalysisResult, ErrorBody};
use crate::util;
use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Shown when an analysis request fails, mirroring the front end's alert
pub const ANALYSIS_FAILED_NOTICE: &str = "Analysis failed. Please try again.";

/// Shown when the camera could not be started
pub const CAMERA_FAILED_NOTICE: &str = "Could not access the camera. Please check permissions.";

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("camera unavailable: {0}")]
    CameraUnavailable(String),

    #[error("snapshot failed: {0}")]
    SnapshotFailed(String),

    #[error("cannot {action} while {state}")]
    InvalidTransition {
        action: &'static str,
        state: &'static str,
    },
}

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("could not reach the analysis server: {0}")]
    Transport(String),

    #[error("analysis rejected ({status}): {message}")]
    Rejected { status: u16, message: String },
}

impl From<reqwest::Error> for ClientError {
    fn from(err: reqwest::Error) -> Self {
        ClientError::Transport(err.to_string())
    }
}

/// A capture device producing still frames
pub trait Camera {
    /// Acquire the device and start streaming
    fn start(&mut self) -> Result<(), CaptureError>;

    /// Grab the current frame, encoded as a data URL
    fn snapshot(&mut self) -> Result<String, CaptureError>;

    /// Release the device. Must be harmless when already stopped
    fn stop(&mut self);
}

/// For front ends with no capture hardware: every start fails
#[derive(Debug, Default)]
pub struct NoCamera;

impl Camera for NoCamera {
    fn start(&mut self) -> Result<(), CaptureError> {
        Err(CaptureError::CameraUnavailable("no capture device configured".into()))
    }

    fn snapshot(&mut self) -> Result<String, CaptureError> {
        Err(CaptureError::CameraUnavailable("no capture device configured".into()))
    }

    fn stop(&mut self) {}
}

/// Something that can score a photo
#[async_trait]
pub trait AnalysisApi: Send + Sync {
    async fn analyze(&self, image: &str) -> Result<AnalysisResult, ClientError>;
}

/// Talks to the analysis endpoint over HTTP
#[derive(Debug, Clone)]
pub struct HttpAnalysisApi {
    http: reqwest::Client,
    url: String,
}

impl HttpAnalysisApi {
    /// `server` is the base URL, e.g. `http://localhost:3000`
    pub fn new(server: &str) -> Self {
        HttpAnalysisApi {
            http: reqwest::Client::new(),
            url: format!("{}{}", server.trim_end_matches('/'), ANALYZE_PATH),
        }
    }
}

#[async_trait]
impl AnalysisApi for HttpAnalysisApi {
    async fn analyze(&self, image: &str) -> Result<AnalysisResult, ClientError> {
        let body = AnalysisRequest {
            image: Some(image.to_string()),
        };
        let response = self.http.post(&self.url).json(&body).send().await?;

        let status = response.status();
        if status.is_success() {
            return Ok(response.json().await?);
        }

        let message = match response.json::<ErrorBody>().await {
            Ok(body) => body.error,
            Err(_) => status.canonical_reason().unwrap_or("unknown error").to_string(),
        };
        Err(ClientError::Rejected {
            status: status.as_u16(),
            message,
        })
    }
}

/// Encode an uploaded file as a data URL, sniffing its image type
pub fn data_url_from_bytes(bytes: &[u8]) -> String {
    let mime = util::sniff_mime_type(bytes).unwrap_or("image/jpeg");
    format!("data:{mime};base64,{}", general_purpose::STANDARD.encode(bytes))
}

/// Identifies one in-flight analysis. Outcomes carrying an older ticket are
/// discarded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ticket(u64);

/// What `begin_analysis` hands out: the image to send and its ticket
#[derive(Debug, Clone)]
pub struct Submission {
    pub ticket: Ticket,
    pub image: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CaptureState {
    Idle,
    Capturing,
    ImageCaptured { image: String },
    Analyzing { image: String, ticket: Ticket },
    ResultReady { image: String, result: AnalysisResult },
}

impl CaptureState {
    pub fn name(&self) -> &'static str {
        match self {
            CaptureState::Idle => "idle",
            CaptureState::Capturing => "capturing",
            CaptureState::ImageCaptured { .. } => "holding an image",
            CaptureState::Analyzing { .. } => "analyzing",
            CaptureState::ResultReady { .. } => "showing a result",
        }
    }
}

/// One user's capture/analysis cycle
pub struct CaptureSession<C: Camera> {
    camera: C,
    state: CaptureState,
    notice: Option<String>,
    last_error: Option<String>,
    next_ticket: u64,
}

impl<C: Camera> CaptureSession<C> {
    pub fn new(camera: C) -> Self {
        CaptureSession {
            camera,
            state: CaptureState::Idle,
            notice: None,
            last_error: None,
            next_ticket: 0,
        }
    }

    pub fn state(&self) -> &CaptureState {
        &self.state
    }

    /// The last error worth showing to the user, if any
    pub fn notice(&self) -> Option<&str> {
        self.notice.as_deref()
    }

    /// Detail behind the current notice, e.g. the server's error message
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    fn set_notice(&mut self, notice: &str, err: &dyn std::fmt::Display) {
        self.notice = Some(notice.to_string());
        self.last_error = Some(err.to_string());
    }

    fn clear_notice(&mut self) {
        self.notice = None;
        self.last_error = None;
    }

    pub fn image(&self) -> Option<&str> {
        match &self.state {
            CaptureState::ImageCaptured { image }
            | CaptureState::Analyzing { image, .. }
            | CaptureState::ResultReady { image, .. } => Some(image),
            CaptureState::Idle | CaptureState::Capturing => None,
        }
    }

    pub fn result(&self) -> Option<&AnalysisResult> {
        match &self.state {
            CaptureState::ResultReady { result, .. } => Some(result),
            _ => None,
        }
    }

    /// Whether a submit action would do anything right now
    pub fn can_submit(&self) -> bool {
        matches!(
            self.state,
            CaptureState::ImageCaptured { .. } | CaptureState::ResultReady { .. }
        )
    }

    fn invalid(&self, action: &'static str) -> CaptureError {
        CaptureError::InvalidTransition {
            action,
            state: self.state.name(),
        }
    }

    pub fn start_camera(&mut self) -> Result<(), CaptureError> {
        if self.state != CaptureState::Idle {
            return Err(self.invalid("start the camera"));
        }
        if let Err(e) = self.camera.start() {
            warn!(error = %e, "could not start camera");
            self.set_notice(CAMERA_FAILED_NOTICE, &e);
            return Err(e);
        }
        self.clear_notice();
        self.state = CaptureState::Capturing;
        debug!("camera started");
        Ok(())
    }

    /// Capture the current frame. The camera is released once a frame is
    /// taken; a failed snapshot leaves it running so the user can try again
    pub fn take_snapshot(&mut self) -> Result<(), CaptureError> {
        if self.state != CaptureState::Capturing {
            return Err(self.invalid("take a snapshot"));
        }
        let image = self.camera.snapshot()?;
        self.camera.stop();
        self.state = CaptureState::ImageCaptured { image };
        debug!("snapshot taken, camera released");
        Ok(())
    }

    pub fn cancel_camera(&mut self) -> Result<(), CaptureError> {
        if self.state != CaptureState::Capturing {
            return Err(self.invalid("cancel the camera"));
        }
        self.camera.stop();
        self.state = CaptureState::Idle;
        Ok(())
    }

    /// Use an uploaded image (a data URL) instead of the camera
    pub fn select_file(&mut self, image: String) -> Result<(), CaptureError> {
        if self.state != CaptureState::Idle {
            return Err(self.invalid("select a file"));
        }
        self.clear_notice();
        self.state = CaptureState::ImageCaptured { image };
        Ok(())
    }

    /// Move to `Analyzing` and hand out the image to submit. Returns `None`
    /// when there is nothing to submit or a request is already in flight
    pub fn begin_analysis(&mut self) -> Option<Submission> {
        let image = match &self.state {
            CaptureState::ImageCaptured { image } | CaptureState::ResultReady { image, .. } => {
                image.clone()
            }
            CaptureState::Analyzing { .. } => {
                debug!("analysis already in flight, ignoring submit");
                return None;
            }
            CaptureState::Idle | CaptureState::Capturing => return None,
        };

        self.next_ticket += 1;
        let ticket = Ticket(self.next_ticket);
        self.clear_notice();
        self.state = CaptureState::Analyzing {
            image: image.clone(),
            ticket,
        };
        Some(Submission { ticket, image })
    }

    /// Record the outcome of the request started with `ticket`. Returns
    /// false if the outcome was stale and ignored
    pub fn complete_analysis(
        &mut self,
        ticket: Ticket,
        outcome: Result<AnalysisResult, ClientError>,
    ) -> bool {
        let image = match &mut self.state {
            CaptureState::Analyzing { image, ticket: current } if *current == ticket => {
                std::mem::take(image)
            }
            _ => {
                debug!(?ticket, "dropping stale analysis outcome");
                return false;
            }
        };

        self.state = match outcome {
            Ok(result) => {
                info!(score = result.score, "analysis complete");
                CaptureState::ResultReady { image, result }
            }
            Err(e) => {
                warn!(error = %e, "analysis failed");
                self.set_notice(ANALYSIS_FAILED_NOTICE, &e);
                CaptureState::ImageCaptured { image }
            }
        };
        true
    }

    /// Submit the held image and wait for the verdict. A no-op returning
    /// `None` when nothing can be submitted
    pub async fn analyze(&mut self, api: &dyn AnalysisApi) -> Option<&CaptureState> {
        let submission = self.begin_analysis()?;
        let outcome = api.analyze(&submission.image).await;
        self.complete_analysis(submission.ticket, outcome);
        Some(&self.state)
    }

    /// Back to `Idle` from anywhere, discarding the image and result and
    /// releasing the camera
    pub fn reset(&mut self) {
        if self.state == CaptureState::Capturing {
            self.camera.stop();
        }
        self.state = CaptureState::Idle;
        self.clear_notice();
    }
}

impl<C: Camera> Drop for CaptureSession<C> {
    fn drop(&mut self) {
        if self.state == CaptureState::Capturing {
            self.camera.stop();
        }
    }
}
