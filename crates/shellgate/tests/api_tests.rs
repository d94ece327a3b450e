//! HTTP sidecar endpoint tests.

mod common;

use axum::Router;
use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use common::{test_controller, test_settings};
use serde_json::Value;
use shellgate::api::{AppState, build_router};
use tower::ServiceExt;

fn test_app() -> Router {
    let (controller, _supervisor) = test_controller(test_settings());
    build_router(AppState::new(controller), &[])
}

#[tokio::test]
async fn health_endpoint_returns_plain_ok() {
    let app = test_app();

    let response = app
        .oneshot(
            Request::builder()
                .uri("/health")
                .method(Method::GET)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
    assert_eq!(&body[..], b"OK");
}

#[tokio::test]
async fn stats_endpoint_reports_snapshot() {
    let app = test_app();

    let response = app
        .oneshot(
            Request::builder()
                .uri("/stats")
                .method(Method::GET)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .unwrap();
    let json: Value = serde_json::from_slice(&body).unwrap();

    assert_eq!(json["sessions"]["active"], 0);
    assert_eq!(json["sessions"]["limit"], 8);
    assert_eq!(json["alerts"]["credentialMismatches"], 0);
    assert_eq!(json["alerts"]["rateLimitRejections"], 0);
    assert_eq!(json["alerts"]["oversizedMessages"], 0);
    assert!(json["rateLimiting"]["ipEntries"].is_number());
    assert!(json["uptimeSecs"].is_number());
}

#[tokio::test]
async fn unknown_route_is_not_found() {
    let app = test_app();

    let response = app
        .oneshot(
            Request::builder()
                .uri("/nope")
                .method(Method::GET)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
