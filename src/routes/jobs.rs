//! Job submission route
//!
//! `POST /api/v1/jobs` takes a multipart form with an `operation` field, one
//! or more `file` parts and any number of extra text fields (operation
//! parameters). The response body is the operation's output.

use axum::{
    body::Body,
    extract::{multipart::MultipartError, DefaultBodyLimit, Multipart, State},
    http::{header, StatusCode},
    response::Response,
    routing::post,
    Router,
};
use tracing::Instrument;

use crate::delivery::deliver;
use crate::error::JobError;
use crate::intake::{UploadRequest, UploadedFile};
use crate::state::AppState;

/// Allowance for multipart boundaries and text fields on top of the file limit
const MULTIPART_OVERHEAD: usize = 1024 * 1024;

/// Create the jobs router
pub fn router(max_upload_bytes: u64) -> Router<AppState> {
    let body_limit = usize::try_from(max_upload_bytes)
        .unwrap_or(usize::MAX)
        .saturating_add(MULTIPART_OVERHEAD);

    Router::new()
        .route("/", post(create_job))
        .layer(DefaultBodyLimit::max(body_limit))
}

/// Run one job end to end and stream its output
async fn create_job(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<Response, JobError> {
    let max_upload_bytes = state.config().limits.max_upload_bytes;
    let request = read_upload(multipart, max_upload_bytes).await?;

    let span = tracing::info_span!(
        "job",
        operation = %request.operation,
        job_id = tracing::field::Empty
    );

    process(state, request).instrument(span).await
}

async fn process(state: AppState, request: UploadRequest) -> Result<Response, JobError> {
    let mut job = state.intake().accept(request).await?;
    tracing::Span::current().record("job_id", tracing::field::display(job.id));

    let Some(spec) = state.registry().get(&job.selector.name) else {
        let err = JobError::InvalidInput(format!("unknown operation '{}'", job.selector.name));
        job.discard().await;
        return Err(err);
    };

    if let Err(e) = state.dispatcher().run(&mut job).await {
        job.discard().await;
        return Err(e);
    }

    let job_id = job.id;
    let delivery = deliver(job, spec).await?;

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, delivery.content_type.as_str())
        .header(header::CONTENT_LENGTH, delivery.content_length.to_string())
        .header(
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{}\"", delivery.file_name),
        )
        .header("x-job-id", job_id.to_string())
        .body(Body::from_stream(delivery.body))
        .map_err(|e| JobError::Io(std::io::Error::other(e)))
}

/// Collect the multipart form into an [`UploadRequest`]
async fn read_upload(mut multipart: Multipart, max_upload_bytes: u64) -> Result<UploadRequest, JobError> {
    let mut request = UploadRequest::default();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| multipart_error(e, max_upload_bytes))?
    {
        let name = field.name().unwrap_or("").to_string();

        match name.as_str() {
            "file" | "files" => {
                let file_name = field
                    .file_name()
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| format!("upload-{}", request.files.len() + 1));
                let content_type = field.content_type().map(|s| s.to_string());
                let data = field
                    .bytes()
                    .await
                    .map_err(|e| multipart_error(e, max_upload_bytes))?;

                tracing::debug!(file_name = %file_name, bytes = data.len(), "Received file");
                request.files.push(UploadedFile {
                    file_name,
                    content_type,
                    data,
                });
            }
            "operation" => {
                request.operation = field
                    .text()
                    .await
                    .map_err(|e| multipart_error(e, max_upload_bytes))?;
            }
            "" => continue,
            _ if field.file_name().is_some() => {
                return Err(JobError::InvalidInput(format!(
                    "unexpected file field '{}'",
                    name
                )));
            }
            _ => {
                let value = field
                    .text()
                    .await
                    .map_err(|e| multipart_error(e, max_upload_bytes))?;
                request.params.insert(name, value);
            }
        }
    }

    if request.operation.trim().is_empty() {
        return Err(JobError::InvalidInput("missing 'operation' field".to_string()));
    }

    Ok(request)
}

fn multipart_error(e: MultipartError, max_upload_bytes: u64) -> JobError {
    tracing::warn!("Failed to read multipart upload: {}", e);
    if e.status() == StatusCode::PAYLOAD_TOO_LARGE {
        JobError::PayloadTooLarge {
            size: max_upload_bytes.saturating_add(1),
            max: max_upload_bytes,
        }
    } else {
        JobError::InvalidInput(format!("malformed upload: {}", e.body_text()))
    }
}
