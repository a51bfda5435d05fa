//! KBPO API - REST server
//!
//! Provides HTTP endpoints for uploading submissions, following their
//! progress, revoking question batches and reading the leaderboard.

pub mod error;
pub mod handlers;
pub mod middleware;
pub mod routes;
pub mod state;

use axum::{
    extract::DefaultBodyLimit,
    http::{HeaderValue, Method},
    routing::get,
    Router,
};
use handlers::{batches, health, leaderboard, submissions};
use state::AppState;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::CorsLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

#[derive(OpenApi)]
#[openapi(
    info(title = "KBPO API", description = "Statistical evaluation of knowledge base population systems"),
    paths(
        health::health_check,
        leaderboard::get_leaderboard,
        submissions::upload_submission,
        submissions::list_submissions,
        submissions::get_submission,
        batches::get_batch,
        batches::revoke_batch
    ),
    components(schemas(
        error::ApiError,
        health::HealthResponse,
        health::CacheStats,
        leaderboard::LeaderboardRow,
        submissions::SubmissionInfo,
        submissions::ScoreSummary,
        submissions::ValidationSummary,
        submissions::UploadResponse,
        batches::BatchStatus,
        batches::RevokeResponse
    )),
    tags(
        (name = "health", description = "Liveness"),
        (name = "leaderboard", description = "Ranked submission scores"),
        (name = "submissions", description = "Upload and lifecycle of submissions"),
        (name = "batches", description = "Question batches sent to the crowd")
    )
)]
pub struct ApiDoc;

fn cors_layer(origins: &[String]) -> CorsLayer {
    if origins.is_empty() {
        CorsLayer::new()
    } else if origins.iter().any(|o| o == "*") {
        CorsLayer::permissive()
    } else {
        let mut cors = CorsLayer::new()
            .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
            .allow_headers([axum::http::header::CONTENT_TYPE]);
        for origin in origins {
            if let Ok(value) = HeaderValue::from_str(origin) {
                cors = cors.allow_origin(value);
            }
        }
        cors
    }
}

/// Build the router with all endpoints
pub fn create_router(state: Arc<AppState>) -> Router {
    let server = &state.config.server;
    let cors = cors_layer(&server.cors_origins);
    let timeout = Duration::from_secs(server.request_timeout_secs.max(1));
    let body_limit = server.max_body_size;

    Router::new()
        .route("/health", get(health::health_check))
        .nest("/api/v1", routes::api_routes())
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .layer(axum::middleware::from_fn(middleware::log_requests))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TimeoutLayer::new(timeout))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
