// HTTP route handlers for the sandbox API

use axum::{
    extract::{rejection::JsonRejection, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
};
use primitives_common::types::{
    ErrorType, RunRequest, RunResponse, SubmitRequest, SubmitResponse, TestRequest, TestResponse,
};
use primitives_common::SandboxError;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use crate::metrics;
use crate::AppState;

/// Error leaving a handler. Security violations normally never get here,
/// the grader folds them into the response body.
#[derive(Debug)]
pub struct ApiError(pub SandboxError);

impl From<SandboxError> for ApiError {
    fn from(err: SandboxError) -> Self {
        ApiError(err)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError(SandboxError::Validation(rejection.body_text()))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            SandboxError::Validation(_) => StatusCode::BAD_REQUEST,
            SandboxError::SecurityViolation(_) => StatusCode::OK,
            SandboxError::EngineUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        };

        let mut body = serde_json::json!({
            "success": false,
            "code": self.0.code(),
            "error": self.0.to_string(),
        });
        if let SandboxError::SecurityViolation(description) = &self.0 {
            body["errorType"] = serde_json::json!(ErrorType::Syntax);
            body["securityViolation"] = serde_json::json!(description);
        }

        (status, Json(body)).into_response()
    }
}

/// Per-operation outcome label for metrics.
trait Outcome {
    fn succeeded(&self) -> bool;
    fn violation(&self) -> bool;
}

impl Outcome for RunResponse {
    fn succeeded(&self) -> bool {
        self.success
    }
    fn violation(&self) -> bool {
        self.security_violation.is_some()
    }
}

impl Outcome for TestResponse {
    fn succeeded(&self) -> bool {
        self.success
    }
    fn violation(&self) -> bool {
        self.security_violation.is_some()
    }
}

impl Outcome for SubmitResponse {
    fn succeeded(&self) -> bool {
        self.passed
    }
    fn violation(&self) -> bool {
        self.security_violation.is_some()
    }
}

fn observe<T: Outcome>(operation: &str, language: &str, result: &Result<T, SandboxError>) {
    let outcome = match result {
        Ok(response) if response.violation() => {
            metrics::record_security_violation(language);
            "security_violation"
        }
        Ok(response) if response.succeeded() => "ok",
        Ok(_) => "failed",
        Err(SandboxError::Validation(_)) => "validation_error",
        Err(SandboxError::SecurityViolation(_)) => "security_violation",
        Err(SandboxError::EngineUnavailable(e)) => {
            error!(operation, error = %e, "Sandbox engine unavailable");
            "engine_unavailable"
        }
    };
    metrics::record_request(operation, outcome);
}

/// Label value for the language, bounded to the known set.
fn language_label(language: &str) -> &'static str {
    primitives_common::types::Language::parse(language)
        .map(|l| l.as_str())
        .unwrap_or("unknown")
}

/// Cancels the execution when the request future is dropped, which is what
/// happens when the client disconnects.
fn request_token() -> (CancellationToken, tokio_util::sync::DropGuard) {
    let token = CancellationToken::new();
    let guard = token.clone().drop_guard();
    (token, guard)
}

/// POST /api/sandbox/run
pub async fn run(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<RunRequest>, JsonRejection>,
) -> Result<Json<RunResponse>, ApiError> {
    let Json(request) = payload.map_err(|e| {
        metrics::record_request("run", "validation_error");
        ApiError::from(e)
    })?;
    let language = language_label(&request.language);
    let (cancel, _guard) = request_token();

    let timer = metrics::REQUEST_DURATION_SECONDS.with_label_values(&["run"]).start_timer();
    let result = state.grader.run(request, cancel).await;
    timer.observe_duration();

    observe("run", language, &result);
    Ok(Json(result?))
}

/// POST /api/sandbox/test
pub async fn test(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<TestRequest>, JsonRejection>,
) -> Result<Json<TestResponse>, ApiError> {
    let Json(request) = payload.map_err(|e| {
        metrics::record_request("test", "validation_error");
        ApiError::from(e)
    })?;
    let language = language_label(&request.language);
    let (cancel, _guard) = request_token();

    let timer = metrics::REQUEST_DURATION_SECONDS.with_label_values(&["test"]).start_timer();
    let result = state.grader.test(request, cancel).await;
    timer.observe_duration();

    observe("test", language, &result);
    Ok(Json(result?))
}

/// POST /api/sandbox/submit
pub async fn submit(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<SubmitRequest>, JsonRejection>,
) -> Result<Json<SubmitResponse>, ApiError> {
    let Json(request) = payload.map_err(|e| {
        metrics::record_request("submit", "validation_error");
        ApiError::from(e)
    })?;
    let language = language_label(&request.language);
    let (cancel, _guard) = request_token();

    let timer = metrics::REQUEST_DURATION_SECONDS.with_label_values(&["submit"]).start_timer();
    let result = state.grader.submit(request, cancel).await;
    timer.observe_duration();

    observe("submit", language, &result);
    Ok(Json(result?))
}

/// GET /health
pub async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let languages: Vec<&str> = state.grader.languages().iter().map(|l| l.as_str()).collect();
    Json(serde_json::json!({
        "status": "ok",
        "backend": state.grader.engine_name(),
        "languages": languages,
    }))
}

/// GET /metrics
pub async fn metrics() -> Response {
    match metrics::render() {
        Ok(text) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            text,
        )
            .into_response(),
        Err(e) => {
            warn!(error = %e, "Failed to encode metrics");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
