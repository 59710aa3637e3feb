use std::error::Error as StdError;

use axum::Json;
use axum::http::{HeaderValue, StatusCode, header::RETRY_AFTER};
use axum::response::{IntoResponse, Response};
use serde::Serialize;

use crate::application::compile::PipelineError;
use crate::application::error::ErrorReport;
use crate::infra::{toolchain::InvokeError, workspace::StageError};

const SOURCE: &str = "infra::http::error";

#[derive(Debug, Serialize)]
pub struct ApiErrorBody {
    pub error: ApiErrorMessage,
}

pub mod codes {
    pub const BAD_REQUEST: &str = "bad_request";
    pub const EMPTY_SOURCE: &str = "empty_source";
    pub const PAYLOAD_TOO_LARGE: &str = "payload_too_large";
    pub const RATE_LIMITED: &str = "rate_limited";
    pub const STAGE: &str = "stage_error";
    pub const SOURCE_MISSING: &str = "source_missing";
    pub const INVOCATION: &str = "invocation_error";
    pub const INTERNAL: &str = "internal_error";
}

#[derive(Debug, Serialize)]
pub struct ApiErrorMessage {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: &'static str,
    hint: Option<String>,
    report: Option<ErrorReport>,
}

impl ApiError {
    pub fn new(
        status: StatusCode,
        code: &'static str,
        message: &'static str,
        hint: Option<String>,
    ) -> Self {
        Self {
            status,
            code,
            message,
            hint,
            report: None,
        }
    }

    pub fn bad_request(message: &'static str, hint: Option<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, codes::BAD_REQUEST, message, hint)
    }

    /// A server-side failure whose message is passed on to the client.
    pub fn server_error(code: &'static str, error: &dyn StdError) -> Self {
        let status = StatusCode::INTERNAL_SERVER_ERROR;
        Self {
            status,
            code,
            message: "Server Error",
            hint: Some(format!("Server Error: {error}")),
            report: Some(ErrorReport::from_error(SOURCE, status, error)),
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn code(&self) -> &'static str {
        self.code
    }

    pub fn rate_limited(retry_after: u64) -> Response {
        let body = ApiErrorBody {
            error: ApiErrorMessage {
                code: codes::RATE_LIMITED.to_string(),
                message: "Rate limit exceeded".to_string(),
                hint: Some(format!("Retry after {retry_after} seconds")),
            },
        };
        let mut response = (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response();
        if let Ok(value) = HeaderValue::from_str(&retry_after.to_string()) {
            response.headers_mut().insert(RETRY_AFTER, value);
        }
        ErrorReport::from_message(
            "infra::http::rate_limit",
            StatusCode::TOO_MANY_REQUESTS,
            format!("rate_limited: retry_after={retry_after}"),
        )
        .attach(&mut response);
        response
    }
}

impl From<PipelineError> for ApiError {
    fn from(error: PipelineError) -> Self {
        match &error {
            PipelineError::Stage(StageError::EmptyPayload) => ApiError::new(
                StatusCode::BAD_REQUEST,
                codes::EMPTY_SOURCE,
                "uploaded file is empty",
                None,
            ),
            PipelineError::Stage(StageError::PayloadTooLarge { .. }) => ApiError::new(
                StatusCode::PAYLOAD_TOO_LARGE,
                codes::PAYLOAD_TOO_LARGE,
                "uploaded file exceeds the size limit",
                None,
            ),
            PipelineError::Stage(StageError::PayloadStream { source }) => {
                ApiError::bad_request("failed to read upload", Some(source.to_string()))
            }
            PipelineError::Stage(_) => ApiError::server_error(codes::STAGE, &error),
            PipelineError::Invoke(InvokeError::NotFound { .. }) => {
                ApiError::server_error(codes::SOURCE_MISSING, &error)
            }
            PipelineError::Invoke(
                InvokeError::ToolchainMissing { .. } | InvokeError::Spawn(_),
            ) => ApiError::server_error(codes::INVOCATION, &error),
            PipelineError::Invoke(_) | PipelineError::Domain(_) => {
                ApiError::server_error(codes::INTERNAL, &error)
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let report = self.report.unwrap_or_else(|| {
            ErrorReport::from_message(
                "infra::http::api",
                self.status,
                format!(
                    "{}: {}",
                    self.code,
                    self.hint.as_deref().unwrap_or(self.message)
                ),
            )
        });
        let body = ApiErrorBody {
            error: ApiErrorMessage {
                code: self.code.to_string(),
                message: self.message.to_string(),
                hint: self.hint,
            },
        };
        let mut response = (self.status, Json(body)).into_response();
        // Attach a structured report so shared logging middleware can emit rich diagnostics.
        report.attach(&mut response);
        response
    }
}
