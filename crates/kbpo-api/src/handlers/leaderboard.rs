//! Leaderboard handlers
//!
//! Author: hephaex@gmail.com

use crate::error::AppError;
use crate::state::AppState;
use axum::{
    extract::{Query, State},
    Json,
};
use chrono::{DateTime, Utc};
use kbpo_core::ScoreType;
use kbpo_pipeline::LeaderboardEntry;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;

/// One ranked submission
#[derive(Debug, Serialize, ToSchema)]
pub struct LeaderboardRow {
    pub id: Uuid,
    #[schema(example = "stanford-run1")]
    pub name: String,
    pub details: String,
    pub timestamp: DateTime<Utc>,
    #[schema(example = "kbp2016")]
    pub corpus_tag: String,
    #[schema(example = "entity")]
    pub score_type: String,
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
    /// Bootstrap interval `[left, right]`
    #[schema(value_type = Vec<f64>)]
    pub precision_range: [f64; 2],
    #[schema(value_type = Vec<f64>)]
    pub recall_range: [f64; 2],
    #[schema(value_type = Vec<f64>)]
    pub f1_range: [f64; 2],
}

impl From<&LeaderboardEntry> for LeaderboardRow {
    fn from(entry: &LeaderboardEntry) -> Self {
        Self {
            id: entry.id,
            name: entry.name.clone(),
            details: entry.details.clone(),
            timestamp: entry.timestamp,
            corpus_tag: entry.corpus_tag.clone(),
            score_type: entry.score_type.to_string(),
            precision: entry.precision,
            recall: entry.recall,
            f1: entry.f1,
            precision_range: entry.precision_range,
            recall_range: entry.recall_range,
            f1_range: entry.f1_range,
        }
    }
}

#[derive(Debug, Deserialize, IntoParams)]
pub struct LeaderboardQuery {
    /// `entity` or `relation`
    #[param(default = "entity")]
    pub score_type: Option<String>,
}

/// Latest scores of every active submission, best F1 first
#[utoipa::path(
    get,
    path = "/api/v1/leaderboard",
    tag = "leaderboard",
    params(LeaderboardQuery),
    responses(
        (status = 200, description = "Ranked submissions", body = Vec<LeaderboardRow>),
        (status = 400, description = "Unknown score type", body = crate::error::ApiError)
    )
)]
pub async fn get_leaderboard(
    State(state): State<Arc<AppState>>,
    Query(params): Query<LeaderboardQuery>,
) -> Result<Json<Vec<LeaderboardRow>>, AppError> {
    state.increment_requests();
    let score_type = match params.score_type.as_deref() {
        Some(s) => s
            .parse::<ScoreType>()
            .map_err(|e| AppError::BadRequest(e.to_string()))?,
        None => ScoreType::Entity,
    };
    let rows = state
        .pipeline
        .leaderboard()
        .get(state.store(), score_type)
        .await?;
    Ok(Json(rows.iter().map(LeaderboardRow::from).collect()))
}
