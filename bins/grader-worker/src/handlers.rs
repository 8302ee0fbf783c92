// HTTP route handlers for the grader

use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Json, Response,
    },
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use futures_util::stream::{self, Stream};
use grader_common::{GraderResult, HiddenTestSpec};
use serde::Deserialize;
use std::convert::Infallible;
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::engine::ContainerRuntime;
use crate::executor::GradeRequest;
use crate::metrics;
use crate::notifier::{ProgressEvent, ProgressStream};
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct SubmitRequest {
    #[serde(alias = "archiveBase64")]
    pub archive_base64: String,
    #[serde(default, alias = "hiddenTests")]
    pub hidden_tests: Vec<HiddenTestSpec>,
    #[serde(default, alias = "checkstyleRules")]
    pub checkstyle_rules: serde_json::Value,
}

/// Why a submission body was refused before any job existed
#[derive(Debug, PartialEq)]
pub enum IntakeError {
    InvalidBase64,
    EmptyArchive,
    TooLarge { limit: usize },
}

impl IntakeError {
    fn reason(&self) -> &'static str {
        match self {
            IntakeError::InvalidBase64 => "invalid_base64",
            IntakeError::EmptyArchive => "empty_archive",
            IntakeError::TooLarge { .. } => "archive_too_large",
        }
    }

    fn message(&self) -> String {
        match self {
            IntakeError::InvalidBase64 => "archive_base64 is not valid base64".to_string(),
            IntakeError::EmptyArchive => "archive is empty".to_string(),
            IntakeError::TooLarge { limit } => format!("archive exceeds {} bytes", limit),
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            IntakeError::TooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            _ => StatusCode::BAD_REQUEST,
        }
    }
}

impl IntoResponse for IntakeError {
    fn into_response(self) -> Response {
        metrics::record_submission_rejected(self.reason());
        (self.status(), Json(serde_json::json!({ "error": self.message() }))).into_response()
    }
}

/// Decode and bound the archive; everything else passes through untouched
pub fn decode_request(payload: SubmitRequest, max_archive_bytes: usize) -> Result<GradeRequest, IntakeError> {
    let archive = STANDARD
        .decode(payload.archive_base64.trim())
        .map_err(|_| IntakeError::InvalidBase64)?;
    if archive.is_empty() {
        return Err(IntakeError::EmptyArchive);
    }
    if archive.len() > max_archive_bytes {
        return Err(IntakeError::TooLarge {
            limit: max_archive_bytes,
        });
    }

    Ok(GradeRequest {
        archive,
        hidden_tests: payload.hidden_tests,
        style_rules: payload.checkstyle_rules,
    })
}

fn invalid_id() -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(serde_json::json!({ "error": "Invalid submission ID format" })),
    )
        .into_response()
}

/// POST /submissions - Create a job and start grading it
pub async fn submit<R: ContainerRuntime>(
    State(state): State<Arc<AppState<R>>>,
    Json(payload): Json<SubmitRequest>,
) -> Response {
    let request = match decode_request(payload, state.config.max_archive_bytes) {
        Ok(request) => request,
        Err(e) => {
            warn!(reason = e.reason(), "Submission rejected");
            return e.into_response();
        }
    };

    match state.orchestrator.submit(request).await {
        Ok(job) => (StatusCode::ACCEPTED, Json(job)).into_response(),
        Err(e) => {
            error!(error = %e, "Failed to create job");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "error": format!("Failed to create job: {}", e) })),
            )
                .into_response()
        }
    }
}

/// GET /submissions/{id} - Current job record
pub async fn get_submission<R: ContainerRuntime>(
    State(state): State<Arc<AppState<R>>>,
    Path(job_id): Path<String>,
) -> Response {
    let Ok(job_uuid) = Uuid::parse_str(&job_id) else {
        return invalid_id();
    };

    match state.orchestrator.lookup(&job_uuid).await {
        Ok(Some(job)) => (StatusCode::OK, Json(job)).into_response(),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": "Submission not found" })),
        )
            .into_response(),
        Err(e) => {
            error!(job_id = %job_id, error = %e, "Failed to fetch job");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "error": format!("Failed to query job: {}", e) })),
            )
                .into_response()
        }
    }
}

/// SSE data fields may not carry `\r`; sandbox output often does
fn normalize_line_endings(text: &str) -> String {
    text.replace("\r\n", "\n").replace('\r', "\n")
}

/// Map a progress event to its SSE frame; `None` means skip
pub fn to_sse_event(event: &ProgressEvent) -> Option<Event> {
    let frame = match event {
        ProgressEvent::Log(text) => Ok(Event::default()
            .event("log")
            .data(normalize_line_endings(text))),
        ProgressEvent::Status { status, score } => Event::default()
            .event("status")
            .json_data(serde_json::json!({ "status": status, "score": score })),
        ProgressEvent::Complete(job) => Event::default().event("complete").json_data(job.as_ref()),
        ProgressEvent::Error { message } => Ok(Event::default()
            .event("error")
            .data(normalize_line_endings(message))),
        ProgressEvent::Closed => return None,
    };

    match frame {
        Ok(frame) => Some(frame),
        Err(e) => {
            warn!(event = event.name(), error = %e, "Failed to encode progress event");
            None
        }
    }
}

/// Drain a progress stream until `Closed`
fn sse_stream(progress: ProgressStream) -> impl Stream<Item = Result<Event, Infallible>> {
    stream::unfold(progress, |mut progress| async move {
        loop {
            match progress.recv().await {
                None | Some(ProgressEvent::Closed) => return None,
                Some(event) => {
                    if let Some(frame) = to_sse_event(&event) {
                        return Some((Ok(frame), progress));
                    }
                }
            }
        }
    })
}

/// GET /submissions/{id}/stream - Server-sent progress events
pub async fn stream_submission<R: ContainerRuntime>(
    State(state): State<Arc<AppState<R>>>,
    Path(job_id): Path<String>,
) -> Response {
    let Ok(job_uuid) = Uuid::parse_str(&job_id) else {
        return invalid_id();
    };

    info!(job_id = %job_uuid, "Progress stream opened");
    let progress = state.notifier.subscribe(job_uuid);
    Sse::new(sse_stream(progress))
        .keep_alive(KeepAlive::default())
        .into_response()
}

/// POST /internal/grade - Synchronous grading, always answers with a GraderResult
pub async fn grade_sync<R: ContainerRuntime>(
    State(state): State<Arc<AppState<R>>>,
    Json(payload): Json<SubmitRequest>,
) -> Json<GraderResult> {
    match decode_request(payload, state.config.max_archive_bytes) {
        Ok(request) => Json(state.orchestrator.grader().grade_to_result(request).await),
        Err(e) => {
            metrics::record_submission_rejected(e.reason());
            Json(GraderResult::from_error(&e.message()))
        }
    }
}

/// GET /health - Health check endpoint
pub async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

/// GET /metrics - Prometheus text format
pub async fn metrics_handler() -> Response {
    match metrics::render_metrics() {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(e) => {
            error!(error = %e, "Failed to render metrics");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
