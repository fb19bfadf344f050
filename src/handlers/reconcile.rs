//! Reconciliation trigger and the managed-service completion callback.

use crate::error::AppError;
use crate::state::AppState;
use crate::stores::ServiceJobStatus;
use actix_web::{web, HttpResponse};
use serde::Deserialize;
use serde_json::json;
use tracing::info;

/// `POST /api/v1/reconcile`: run one sweep now.
///
/// ## Response:
/// ```json
/// { "processed": 12, "fixed": 1, "created": 0 }
/// ```
pub async fn reconcile(state: web::Data<AppState>) -> HttpResponse {
    let report = state.engine.reconcile().await;
    info!(
        processed = report.processed,
        fixed = report.fixed,
        created = report.created,
        "Reconciliation requested"
    );
    HttpResponse::Ok().json(report)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStateCallback {
    pub job_name: String,
    pub status: ServiceJobStatus,
}

/// `POST /api/v1/callbacks/job-state`
///
/// Body: `{"jobName": "transcribe-...", "status": "COMPLETED"}`. The reported
/// status is only a hint; the managed service is asked for the real state.
pub async fn job_state_callback(
    state: web::Data<AppState>,
    body: web::Json<JobStateCallback>,
) -> Result<HttpResponse, AppError> {
    let callback = body.into_inner();
    let updated = state.engine.notify(&callback.job_name, callback.status).await?;

    Ok(HttpResponse::Ok().json(json!({
        "jobName": callback.job_name,
        "matched": updated.is_some(),
        "job": updated
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::jobs::tests::upload;
    use crate::handlers::jobs::configure_job_routes;
    use crate::jobs::testing::artifact;
    use crate::state::tests::test_state;
    use actix_web::{test, App};

    #[actix_web::test]
    async fn test_reconcile_repairs_stale_row() {
        let state = test_state();
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state.clone()))
                .configure(configure_job_routes)
                .route("/reconcile", web::post().to(reconcile)),
        )
        .await;

        test::call_service(&app, upload("clip.wav", "audio/wav", &[0u8; 128]).to_request()).await;
        let job_name = state.engine.list(None, 1).await.unwrap()[0].job_name.clone().unwrap();
        state
            .simulator
            .clone()
            .unwrap()
            .complete_job(&job_name, &artifact(&job_name, "swept", &[0.5]))
            .await
            .unwrap();

        let req = test::TestRequest::post().uri("/reconcile").to_request();
        let report: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(report["processed"], 1);
        assert_eq!(report["fixed"], 1);
        assert_eq!(report["created"], 0);

        let req = test::TestRequest::post().uri("/reconcile").to_request();
        let report: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(report["fixed"], 0);
    }

    #[actix_web::test]
    async fn test_callback_completes_job() {
        let state = test_state();
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state.clone()))
                .configure(configure_job_routes)
                .route("/callbacks/job-state", web::post().to(job_state_callback)),
        )
        .await;

        test::call_service(&app, upload("clip.wav", "audio/wav", &[0u8; 128]).to_request()).await;
        let job_name = state.engine.list(None, 1).await.unwrap()[0].job_name.clone().unwrap();
        state
            .simulator
            .clone()
            .unwrap()
            .complete_job(&job_name, &artifact(&job_name, "pushed", &[0.75]))
            .await
            .unwrap();

        let req = test::TestRequest::post()
            .uri("/callbacks/job-state")
            .set_json(json!({ "jobName": job_name, "status": "COMPLETED" }))
            .to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["matched"], true);
        assert_eq!(body["job"]["status"], "COMPLETED");
        assert_eq!(body["job"]["text"], "pushed");

        // Non-terminal reports are acknowledged but change nothing.
        let req = test::TestRequest::post()
            .uri("/callbacks/job-state")
            .set_json(json!({ "jobName": job_name, "status": "IN_PROGRESS" }))
            .to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["matched"], false);
    }
}
