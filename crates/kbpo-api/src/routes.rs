//! API route definitions
//!
//! Author: hephaex@gmail.com

use crate::handlers::{batches, leaderboard, submissions};
use crate::state::AppState;
use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;

/// Create API v1 routes
pub fn api_routes() -> Router<Arc<AppState>> {
    Router::new()
        // Leaderboard
        .route("/leaderboard", get(leaderboard::get_leaderboard))
        // Submissions
        .route(
            "/submissions",
            get(submissions::list_submissions).post(submissions::upload_submission),
        )
        .route("/submissions/:id", get(submissions::get_submission))
        // Question batches
        .route("/batches/:id", get(batches::get_batch))
        .route("/batches/:id/revoke", post(batches::revoke_batch))
}
