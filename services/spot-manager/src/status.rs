//! Read-only status API.
//!
//! - `GET /healthz`: liveness
//! - `GET /v1/status`: tracked groups and cached prices

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use tokio::sync::watch;
use tower_http::trace::TraceLayer;

use crate::controller::StatusSnapshot;

/// Create the status router.
pub fn create_router(status: watch::Receiver<StatusSnapshot>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/v1/status", get(status_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(status)
}

async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

async fn status_handler(State(status): State<watch::Receiver<StatusSnapshot>>) -> impl IntoResponse {
    let snapshot = status.borrow().clone();
    Json(snapshot)
}

#[cfg(test)]
mod tests {
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tower::ServiceExt;

    use super::*;

    #[tokio::test]
    async fn test_healthz_returns_ok() {
        let response = healthz().await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_status_serves_latest_snapshot() {
        let (tx, rx) = watch::channel(StatusSnapshot::default());
        tx.send_replace(StatusSnapshot {
            in_flight: 2,
            ..Default::default()
        });

        let response = create_router(rx)
            .oneshot(Request::builder().uri("/v1/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["in_flight"], 2);
        assert!(json["asgs"].as_array().unwrap().is_empty());
    }
}
