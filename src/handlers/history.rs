use crate::error::AppError;
use crate::handlers::jobs::client_session;
use crate::state::AppState;
use actix_web::{web, HttpRequest, HttpResponse};
use serde_json::json;

/// Server rows fetched per history refresh.
pub const HISTORY_LIMIT: usize = 100;

/// `GET /api/v1/history`: server rows merged with this session's pending
/// submissions, newest first. Server refreshes are rate-limited per session;
/// inside the interval the last server rows are reused.
pub async fn get_history(req: HttpRequest, state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let session = client_session(&req, &state);
    let entries = session.history(state.engine.list(None, HISTORY_LIMIT)).await?;

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "count": entries.len(),
        "jobs": entries
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::jobs::configure_job_routes;
    use crate::handlers::jobs::tests::upload;
    use crate::jobs::session::SESSION_HEADER;
    use crate::jobs::JobStatus;
    use crate::state::tests::test_state;
    use actix_web::{test, App};

    #[actix_web::test]
    async fn test_history_lists_submitted_jobs() {
        let state = test_state();
        state.update_config(r#"{"polling": {"refresh_interval_ms": 0}}"#).unwrap();
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state.clone()))
                .configure(configure_job_routes)
                .route("/history", web::get().to(get_history)),
        )
        .await;

        test::call_service(&app, upload("clip.wav", "audio/wav", &[0u8; 128]).to_request()).await;

        let req = test::TestRequest::get()
            .uri("/history")
            .insert_header((SESSION_HEADER, "client-1"))
            .to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["count"], 1);
        assert_eq!(body["jobs"][0]["provenance"], "server");
        assert_eq!(body["jobs"][0]["status"], JobStatus::InProgress.as_str());
        // Confirmed by the server, so no longer pending locally.
        assert_eq!(state.sessions.get_or_create("client-1").pending_len(), 0);
    }

    #[actix_web::test]
    async fn test_history_shows_new_submission_inside_interval() {
        let state = test_state();
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state.clone()))
                .configure(configure_job_routes)
                .route("/history", web::get().to(get_history)),
        )
        .await;

        let history = || {
            test::TestRequest::get()
                .uri("/history")
                .insert_header((SESSION_HEADER, "client-1"))
                .to_request()
        };

        let first: serde_json::Value = test::call_and_read_body_json(&app, history()).await;
        assert_eq!(first["count"], 0);

        test::call_service(&app, upload("clip.wav", "audio/wav", &[0u8; 128]).to_request()).await;
        let second: serde_json::Value = test::call_and_read_body_json(&app, history()).await;
        assert_eq!(second["count"], 1);
        assert_eq!(second["jobs"][0]["provenance"], "local-pending");
        assert_eq!(second["jobs"][0]["originalFileName"], "clip.wav");
    }
}
