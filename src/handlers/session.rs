//! HTTP endpoints for the live session: start, stop and inspect.

use crate::{error::AppError, state::AppState};
use actix_web::{web, HttpResponse};
use serde_json::json;
use tracing::warn;

/// `POST /api/v1/session/start`
///
/// Blocks until the session is listening or has failed. Failures map to
/// `409` (not in `Standby`) or `503` with a generic message (device or
/// network trouble).
pub async fn start_session(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let settings = state.session_settings();
    let result = state.session.start(settings).await;
    state.record_session_start(result.is_ok());

    if let Err(e) = result {
        warn!(kind = e.kind(), "Session start rejected");
        return Err(e.into());
    }

    Ok(HttpResponse::Ok().json(json!({
        "status": "success",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "session": state.session.snapshot()
    })))
}

/// `POST /api/v1/session/stop`. Always succeeds.
pub async fn stop_session(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    state.session.stop();

    Ok(HttpResponse::Ok().json(json!({
        "status": "success",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "session": state.session.snapshot()
    })))
}

/// `GET /api/v1/session`
pub async fn get_session(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "session": state.session.snapshot()
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::tests::test_state;
    use actix_web::{http::StatusCode, test, App};

    #[actix_web::test]
    async fn test_start_without_microphone_is_unavailable() {
        let state = web::Data::new(test_state());
        let app = test::init_service(
            App::new()
                .app_data(state.clone())
                .route("/api/v1/session/start", web::post().to(start_session))
                .route("/api/v1/session/stop", web::post().to(stop_session))
                .route("/api/v1/session", web::get().to(get_session)),
        )
        .await;

        let req = test::TestRequest::post().uri("/api/v1/session/start").to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body: serde_json::Value = test::read_body_json(resp).await;
        assert_eq!(body["error"]["message"], "connection error");

        let req = test::TestRequest::get().uri("/api/v1/session").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["session"]["status"], "Error");

        // A second start from Error is a state conflict
        let req = test::TestRequest::post().uri("/api/v1/session/start").to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::CONFLICT);

        let req = test::TestRequest::post().uri("/api/v1/session/stop").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["session"]["status"], "Standby");

        let metrics = state.get_metrics_snapshot();
        assert_eq!(metrics.sessions_started, 0);
        assert_eq!(metrics.sessions_failed, 2);
    }
}
