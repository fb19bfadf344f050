//! Debug endpoints that drive the simulated managed service.
//!
//! Only mounted when the simulation is in use. They let a developer (or a
//! test) finish, fail or reject jobs without a real provider.

use crate::error::AppError;
use crate::jobs::transcript::{TranscriptArtifact, TranscriptWord};
use crate::state::AppState;
use crate::stores::simulated::SimulatedTranscriptionService;
use crate::stores::ServiceError;
use actix_web::{web, HttpResponse};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

/// Request to complete a simulated job
#[derive(Debug, Deserialize)]
pub struct CompleteJobRequest {
    pub transcript: String,
    /// Word timings and confidences; generated from the transcript when absent
    pub items: Option<Vec<TranscriptWord>>,
}

#[derive(Debug, Deserialize)]
pub struct FailJobRequest {
    pub reason: String,
}

#[derive(Debug, Deserialize)]
pub struct RejectStartRequest {
    pub reason: String,
}

fn simulator(state: &AppState) -> Result<Arc<SimulatedTranscriptionService>, AppError> {
    state
        .simulator
        .clone()
        .ok_or_else(|| AppError::NotFound("Simulated transcription service is not in use".to_string()))
}

fn service_error(err: ServiceError) -> AppError {
    match err {
        ServiceError::NotFound(name) => AppError::NotFound(format!("Managed job {} not found", name)),
        ServiceError::Rejected(reason) => AppError::BadRequest(reason),
        ServiceError::Unavailable(reason) => AppError::TransientIo(reason),
    }
}

/// Half-second words with full confidence, one per whitespace-separated token.
fn words_for(transcript: &str) -> Vec<TranscriptWord> {
    transcript
        .split_whitespace()
        .enumerate()
        .map(|(i, word)| TranscriptWord {
            content: word.to_string(),
            confidence: 1.0,
            start_time: i as f64 * 0.5,
            end_time: i as f64 * 0.5 + 0.5,
        })
        .collect()
}

/// List jobs known to the simulated service.
///
/// GET /debug/service/jobs
pub async fn list_service_jobs(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let jobs = simulator(&state)?.jobs().await;
    Ok(HttpResponse::Ok().json(json!({ "count": jobs.len(), "jobs": jobs })))
}

/// Write a transcript artifact and mark the managed job completed.
///
/// POST /debug/service/jobs/{job_name}/complete
/// Body: {"transcript": "hello world", "items": [...]}
pub async fn complete_service_job(
    state: web::Data<AppState>,
    path: web::Path<String>,
    body: web::Json<CompleteJobRequest>,
) -> Result<HttpResponse, AppError> {
    let job_name = path.into_inner();
    let request = body.into_inner();
    let words = request.items.unwrap_or_else(|| words_for(&request.transcript));
    let artifact = TranscriptArtifact::from_words(job_name.as_str(), request.transcript, &words);

    let result_location = simulator(&state)?
        .complete_job(&job_name, &artifact)
        .await
        .map_err(service_error)?;

    tracing::info!(job_name = %job_name, "Debug: simulated job completed");
    Ok(HttpResponse::Ok().json(json!({
        "job_name": job_name,
        "status": "COMPLETED",
        "result_location": result_location
    })))
}

/// POST /debug/service/jobs/{job_name}/fail
/// Body: {"reason": "unsupported codec"}
pub async fn fail_service_job(
    state: web::Data<AppState>,
    path: web::Path<String>,
    body: web::Json<FailJobRequest>,
) -> Result<HttpResponse, AppError> {
    let job_name = path.into_inner();
    simulator(&state)?
        .fail_job(&job_name, body.into_inner().reason)
        .await
        .map_err(service_error)?;

    Ok(HttpResponse::Ok().json(json!({
        "job_name": job_name,
        "status": "FAILED"
    })))
}

/// Make the next `start_job` call fail.
///
/// POST /debug/service/reject-next-start
pub async fn reject_next_start(
    state: web::Data<AppState>,
    body: web::Json<RejectStartRequest>,
) -> Result<HttpResponse, AppError> {
    simulator(&state)?.reject_next_start(body.into_inner().reason).await;
    Ok(HttpResponse::Accepted().finish())
}

/// Configuration for debug routes
pub fn configure_debug_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/debug/service")
            .route("/jobs", web::get().to(list_service_jobs))
            .route("/jobs/{job_name}/complete", web::post().to(complete_service_job))
            .route("/jobs/{job_name}/fail", web::post().to(fail_service_job))
            .route("/reject-next-start", web::post().to(reject_next_start)),
    );
}
