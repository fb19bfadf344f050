//! Job endpoints: submit, status, list, delete and wait.

use crate::error::AppError;
use crate::jobs::poller::WaitStrategy;
use crate::jobs::session::{ClientSession, SESSION_HEADER};
use crate::jobs::submitter::SubmitRequest;
use crate::jobs::{JobSource, JobStatus};
use crate::state::AppState;
use actix_multipart::{Field, Multipart};
use actix_web::{web, HttpRequest, HttpResponse};
use futures_util::stream::StreamExt;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info};

pub const DEFAULT_LIST_LIMIT: usize = 50;
pub const MAX_LIST_LIMIT: usize = 500;

/// Session named by the `X-Session-Id` header, or an ephemeral one.
pub fn client_session(req: &HttpRequest, state: &AppState) -> Arc<ClientSession> {
    let header = req
        .headers()
        .get(SESSION_HEADER)
        .and_then(|value| value.to_str().ok());
    state.sessions.resolve(header)
}

/// Read one multipart field into memory, stopping one byte past `limit`
/// so oversize uploads are rejected without buffering them whole.
async fn read_field(field: &mut Field, limit: u64) -> Result<Vec<u8>, AppError> {
    let mut bytes = Vec::new();
    while let Some(chunk) = field.next().await {
        let chunk = chunk.map_err(|e| AppError::ValidationError(format!("Chunk error: {}", e)))?;
        bytes.extend_from_slice(&chunk);
        if bytes.len() as u64 > limit {
            break;
        }
    }
    Ok(bytes)
}

/// Submit an audio file for transcription.
///
/// ## Endpoint: `POST /api/v1/jobs`
///
/// ## Request:
/// Multipart form data with an `audio` file field and an optional `source`
/// text field (`file` or `microphone`, default `file`).
///
/// ## Response: `201 Created`
/// ```json
/// { "id": "6f1c0c7e-..." }
/// ```
pub async fn submit_job(
    req: HttpRequest,
    state: web::Data<AppState>,
    mut payload: Multipart,
) -> Result<HttpResponse, AppError> {
    let limit = state.get_config().storage.max_upload_bytes;

    let mut audio: Option<(Vec<u8>, String, Option<String>)> = None;
    let mut source = JobSource::File;

    while let Some(item) = payload.next().await {
        let mut field = item.map_err(|e| AppError::ValidationError(format!("Multipart error: {}", e)))?;

        let content_disposition = field
            .content_disposition()
            .ok_or_else(|| AppError::ValidationError("Missing content disposition".to_string()))?;
        let field_name = content_disposition
            .get_name()
            .ok_or_else(|| AppError::ValidationError("Missing field name".to_string()))?
            .to_string();
        let filename = content_disposition.get_filename().map(str::to_string);

        match field_name.as_str() {
            "audio" => {
                let content_type = field.content_type().map(|mime| mime.essence_str().to_string());
                let bytes = read_field(&mut field, limit).await?;
                let filename = filename.unwrap_or_else(|| "audio".to_string());
                audio = Some((bytes, filename, content_type));
            }
            "source" => {
                let bytes = read_field(&mut field, 64).await?;
                let text = String::from_utf8_lossy(&bytes);
                source = text.parse().map_err(AppError::ValidationError)?;
            }
            other => {
                debug!(field = other, "Ignoring unknown multipart field");
                while let Some(chunk) = field.next().await {
                    chunk.map_err(|e| AppError::ValidationError(format!("Chunk error: {}", e)))?;
                }
            }
        }
    }

    let (audio, filename, content_type) =
        audio.ok_or_else(|| AppError::ValidationError("No audio file provided".to_string()))?;

    let job = state
        .engine
        .submit(SubmitRequest {
            audio,
            filename,
            content_type,
            source,
        })
        .await?;

    client_session(&req, &state).record_pending(job.clone());

    Ok(HttpResponse::Created().json(json!({ "id": job.id })))
}

/// `GET /api/v1/jobs/{id}`: current row, refreshed from the managed service
/// while the job is in progress.
pub async fn get_job(state: web::Data<AppState>, path: web::Path<String>) -> Result<HttpResponse, AppError> {
    let job = state.engine.status(&path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(job))
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub status: Option<String>,
    pub limit: Option<usize>,
}

/// `GET /api/v1/jobs?status=&limit=`: newest first.
pub async fn list_jobs(state: web::Data<AppState>, query: web::Query<ListQuery>) -> Result<HttpResponse, AppError> {
    let status = query
        .status
        .as_deref()
        .map(str::parse::<JobStatus>)
        .transpose()
        .map_err(AppError::ValidationError)?;

    let limit = query.limit.unwrap_or(DEFAULT_LIST_LIMIT);
    if limit == 0 {
        return Err(AppError::ValidationError("limit must be greater than 0".to_string()));
    }

    let jobs = state.engine.list(status, limit.min(MAX_LIST_LIMIT)).await?;
    Ok(HttpResponse::Ok().json(json!({
        "count": jobs.len(),
        "jobs": jobs
    })))
}

/// `DELETE /api/v1/jobs/{id}`: hard delete, 204 or 404.
pub async fn delete_job(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse, AppError> {
    let id = path.into_inner();
    let session = client_session(&req, &state);
    session.abandon_poll(&id);
    session.forget(&id);

    state.engine.remove(&id).await?;
    info!(job_id = %id, "Job deleted");
    Ok(HttpResponse::NoContent().finish())
}

#[derive(Debug, Deserialize)]
pub struct WaitQuery {
    #[serde(default)]
    pub strategy: WaitStrategy,
}

/// Keeps the active-wait gauge honest when the client disconnects and the
/// handler future is dropped mid-wait.
struct ActiveWait<'a>(&'a AppState);

impl<'a> ActiveWait<'a> {
    fn begin(state: &'a AppState) -> Self {
        state.increment_active_waits();
        Self(state)
    }
}

impl Drop for ActiveWait<'_> {
    fn drop(&mut self) {
        self.0.decrement_active_waits();
    }
}

/// Block until the job is terminal.
///
/// ## Endpoint: `GET /api/v1/jobs/{id}/wait?strategy=standard|smart`
///
/// ## Responses:
/// - `200`: the completed job
/// - `422 job_failure`: the managed service failed the job
/// - `202 timeout`: still running after the poll budget; try again later
/// - `409 cancelled`: abandoned via `DELETE /jobs/{id}/wait` or superseded
///   by a newer wait from the same session
pub async fn wait_for_job(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<String>,
    query: web::Query<WaitQuery>,
) -> Result<HttpResponse, AppError> {
    let id = path.into_inner();
    let session = client_session(&req, &state);

    let guard = session.begin_poll(&id);
    let _active = ActiveWait::begin(&state);
    let outcome = state.engine.wait(&id, query.strategy, guard.token()).await;

    let job = outcome.into_result(&id)?;
    Ok(HttpResponse::Ok().json(job))
}

/// `DELETE /api/v1/jobs/{id}/wait`: cancel this session's wait on the job.
pub async fn abandon_wait(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse, AppError> {
    let id = path.into_inner();
    let abandoned = client_session(&req, &state).abandon_poll(&id);
    Ok(HttpResponse::Ok().json(json!({
        "id": id,
        "abandoned": abandoned
    })))
}

pub fn configure_job_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/jobs")
            .route("", web::post().to(submit_job))
            .route("", web::get().to(list_jobs))
            .route("/{id}", web::get().to(get_job))
            .route("/{id}", web::delete().to(delete_job))
            .route("/{id}/wait", web::get().to(wait_for_job))
            .route("/{id}/wait", web::delete().to(abandon_wait)),
    );
}
