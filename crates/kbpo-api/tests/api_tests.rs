//! API Integration Tests
//!
//! Every test runs against the in-memory store and a mock crowd, with
//! follow-up stages executed inline.
//!
//! Author: hephaex@gmail.com

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use kbpo_api::{create_router, state::AppState};
use kbpo_core::AppConfig;
use kbpo_pipeline::{MockCrowd, Pipeline};
use kbpo_store::MemoryStore;
use serde_json::Value;
use std::sync::Arc;
use tower::ServiceExt;

const MINIMAL_KB: &str = "d1:0-5\tPER\tAlice\t\t1.0
d1:0-5\tlink\twiki:Alice_Q1\t\t1.0
d1:0-5\tcanonical_mention\td1:0-5\t\t1.0
d1:10-20\tORG\tAcme\t\t1.0
d1:10-20\tcanonical_mention\td1:10-20\t\t1.0
d1:0-5\tper:employee_or_member_of\td1:10-20\td1:0-20\t1.0
";

fn test_app() -> Router {
    let mut config = AppConfig::default();
    config.sampling.num_samples = 10;
    config.sampling.seed = Some(5);
    config.scoring.seed = Some(5);
    let pipeline = Arc::new(Pipeline::new(
        Arc::new(MemoryStore::new()),
        Arc::new(MockCrowd::new()),
        config.clone(),
    ));
    create_router(Arc::new(AppState::new(config, pipeline)))
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn post_text(uri: &str, body: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("Content-Type", "text/plain")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn body_json(response: axum::response::Response) -> Value {
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&body).unwrap()
}

// =============================================================================
// Health Check Tests
// =============================================================================

#[tokio::test]
async fn test_health_check() {
    let app = test_app();

    let response = app.oneshot(get("/health")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let json = body_json(response).await;
    assert_eq!(json["status"], "ok");
    assert!(json["version"].is_string());
    assert!(json["leaderboard_cache"]["hits"].is_u64());
}

#[tokio::test]
async fn test_openapi_spec() {
    let app = test_app();

    let response = app.oneshot(get("/api-docs/openapi.json")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let json = body_json(response).await;
    assert!(json["paths"]["/api/v1/leaderboard"].is_object());
    assert!(json["paths"]["/api/v1/batches/{id}/revoke"].is_object());
}

// =============================================================================
// Leaderboard Tests
// =============================================================================

#[tokio::test]
async fn test_empty_leaderboard() {
    let app = test_app();

    let response = app.oneshot(get("/api/v1/leaderboard")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await, Value::Array(vec![]));
}

#[tokio::test]
async fn test_leaderboard_rejects_unknown_score_type() {
    let app = test_app();

    let response = app
        .oneshot(get("/api/v1/leaderboard?score_type=slot"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(response).await["code"], "BAD_REQUEST");
}

// =============================================================================
// Submission Tests
// =============================================================================

#[tokio::test]
async fn test_upload_submission() {
    let app = test_app();

    let response = app
        .clone()
        .oneshot(post_text(
            "/api/v1/submissions?name=run1&corpus_tag=kbp2016",
            MINIMAL_KB,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);

    let json = body_json(response).await;
    assert_eq!(json["validation"]["mentions"], 2);
    assert_eq!(json["validation"]["relations"], 2);
    assert_eq!(json["submission"]["name"], "run1");
    // Sampling and posting ran inline; HITs are now waiting on the crowd
    assert_eq!(json["submission"]["state"], "pending-aggregation");

    let id = json["submission"]["id"].as_str().unwrap().to_string();
    let response = app
        .clone()
        .oneshot(get(&format!("/api/v1/submissions/{id}")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["corpus_tag"], "kbp2016");
    assert!(json["scores"].as_array().unwrap().is_empty());

    let response = app.oneshot(get("/api/v1/submissions")).await.unwrap();
    assert_eq!(body_json(response).await.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_upload_invalid_submission() {
    let app = test_app();

    let response = app
        .oneshot(post_text(
            "/api/v1/submissions?name=bad&corpus_tag=kbp2016",
            "this is not an entry file\n",
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body_json(response).await["code"], "VALIDATION_FAILED");
}

#[tokio::test]
async fn test_upload_rejects_empty_body_and_format() {
    let app = test_app();

    let response = app
        .clone()
        .oneshot(post_text("/api/v1/submissions?name=x&corpus_tag=kbp2016", "  "))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = app
        .oneshot(post_text(
            "/api/v1/submissions?name=x&corpus_tag=kbp2016&format=xml",
            MINIMAL_KB,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_get_submission_not_found() {
    let app = test_app();

    let response = app
        .clone()
        .oneshot(get(
            "/api/v1/submissions/550e8400-e29b-41d4-a716-446655440000",
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(body_json(response).await["code"], "NOT_FOUND");

    let response = app
        .oneshot(get("/api/v1/submissions/not-a-uuid"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

// =============================================================================
// Batch Tests
// =============================================================================

#[tokio::test]
async fn test_revoke_unknown_batch() {
    let app = test_app();

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/v1/batches/550e8400-e29b-41d4-a716-446655440000/revoke")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_get_unknown_batch() {
    let app = test_app();

    let response = app
        .oneshot(get(
            "/api/v1/batches/550e8400-e29b-41d4-a716-446655440000",
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
