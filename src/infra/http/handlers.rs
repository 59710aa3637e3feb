use axum::{
    Json,
    body::Body,
    extract::{Multipart, State, multipart::MultipartError},
    http::{
        HeaderValue, StatusCode,
        header::{CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_TYPE},
    },
    response::{IntoResponse, Response},
};
use futures::StreamExt;
use serde_json::json;
use tokio_util::io::ReaderStream;
use tracing::error;

use crate::{
    application::{
        compile::{CompiledJob, HealthStatus, PipelineError},
        error::ErrorReport,
    },
    domain::jobs::OUTPUT_EXTENSION,
    infra::workspace::StageError,
};

use super::{
    HttpState,
    error::{ApiError, codes},
};

const SOURCE: &str = "infra::http::handlers";
const UPLOAD_FIELD: &str = "file";
const PDF_CONTENT_TYPE: &str = "application/pdf";
const LOG_CONTENT_TYPE: &str = "text/plain; charset=utf-8";
const LOG_FILENAME: &str = "error.log";

pub async fn root(State(state): State<HttpState>) -> Json<serde_json::Value> {
    Json(json!({
        "message": format!("Latex-Compiler is running on {} Environment", state.environment),
    }))
}

pub async fn health_check(State(state): State<HttpState>) -> Response {
    let health = state.service.check_toolchain().await;
    let status = match health {
        HealthStatus::Ok => StatusCode::OK,
        HealthStatus::Error => StatusCode::SERVICE_UNAVAILABLE,
    };
    let mut response = (status, Json(json!({ "status": health.as_str() }))).into_response();
    if !status.is_success() {
        ErrorReport::from_message(
            "infra::http::healthz",
            status,
            "toolchain failed to compile the health-check document",
        )
        .attach(&mut response);
    }
    response
}

/// Compile an uploaded `.tex` file and return the PDF or the compile log.
pub async fn compile_tex_file(
    State(state): State<HttpState>,
    mut multipart: Multipart,
) -> Result<Response, ApiError> {
    let field = loop {
        match multipart.next_field().await.map_err(multipart_error)? {
            Some(field) if field.name() == Some(UPLOAD_FIELD) => break field,
            Some(_) => continue,
            None => {
                return Err(ApiError::bad_request(
                    "missing upload field",
                    Some(format!("send the source in a multipart field named `{UPLOAD_FIELD}`")),
                ));
            }
        }
    };

    let filename = field
        .file_name()
        .map(str::to_owned)
        .filter(|name| !name.trim().is_empty());
    let stream = field.map(|chunk| chunk.map_err(stage_error));

    let compiled = state
        .service
        .compile_stream(filename.as_deref(), stream)
        .await?;

    artifact_response(compiled).await
}

/// Stream the artifact back; the job's cleanup guard rides along in the body.
async fn artifact_response(compiled: CompiledJob) -> Result<Response, ApiError> {
    let CompiledJob {
        job,
        result,
        cleanup,
    } = compiled;

    let file = match tokio::fs::File::open(&result.artifact_path).await {
        Ok(file) => file,
        Err(err) => {
            error!(
                target = SOURCE,
                op = "compile_tex_file",
                job_id = %job.id(),
                path = %result.artifact_path.display(),
                error = %err,
                "Failed to open compilation artifact"
            );
            return Err(ApiError::server_error(codes::INTERNAL, &err));
        }
    };
    let length = file.metadata().await.ok().map(|meta| meta.len());

    let body = ReaderStream::new(file).map(move |chunk| {
        let _ = &cleanup;
        chunk
    });

    let (status, content_type, disposition) = if result.succeeded {
        (
            StatusCode::OK,
            PDF_CONTENT_TYPE,
            format!(
                "inline; filename=\"{}{OUTPUT_EXTENSION}\"",
                job.paths().base_name()
            ),
        )
    } else {
        (
            StatusCode::UNPROCESSABLE_ENTITY,
            LOG_CONTENT_TYPE,
            format!("attachment; filename=\"{LOG_FILENAME}\""),
        )
    };

    let mut response = Response::new(Body::from_stream(body));
    *response.status_mut() = status;
    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    if let Ok(value) = HeaderValue::from_str(&disposition) {
        headers.insert(CONTENT_DISPOSITION, value);
    }
    if let Some(length) = length {
        headers.insert(CONTENT_LENGTH, HeaderValue::from(length));
    }

    if !result.succeeded {
        let summary = if result.timed_out {
            "compilation timed out".to_string()
        } else {
            match result.exit_code {
                Some(code) => format!("compilation failed with exit code {code}"),
                None => "compilation failed".to_string(),
            }
        };
        ErrorReport::from_message("infra::http::compile", status, summary).attach(&mut response);
    }

    Ok(response)
}

fn multipart_error(err: MultipartError) -> ApiError {
    if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
        return PipelineError::Stage(stage_error(err)).into();
    }
    ApiError::bad_request("invalid multipart payload", Some(err.body_text()))
}

fn stage_error(err: MultipartError) -> StageError {
    if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
        StageError::PayloadTooLarge {
            source: Box::new(err),
        }
    } else {
        StageError::PayloadStream {
            source: Box::new(err),
        }
    }
}
