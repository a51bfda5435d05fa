//! Question batch handlers
//!
//! Author: hephaex@gmail.com

use crate::error::AppError;
use crate::state::AppState;
use axum::{
    extract::{Path, State},
    Json,
};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use utoipa::ToSchema;
use uuid::Uuid;

/// Question counts of a batch by state
#[derive(Debug, Serialize, ToSchema)]
pub struct BatchStatus {
    pub id: Uuid,
    #[schema(example = "selective_relations")]
    pub batch_type: String,
    pub questions: usize,
    pub states: BTreeMap<String, usize>,
    pub hits: usize,
}

/// Outcome of a revocation
#[derive(Debug, Serialize, ToSchema)]
pub struct RevokeResponse {
    pub id: Uuid,
    /// HITs withdrawn at the crowd marketplace
    pub cancelled: usize,
    /// HITs whose cancellation failed; revoke again to retry
    pub failed: usize,
    pub revoked_questions: usize,
}

/// Get question and HIT counts of a batch
#[utoipa::path(
    get,
    path = "/api/v1/batches/{id}",
    tag = "batches",
    params(
        ("id" = Uuid, Path, description = "Question batch UUID")
    ),
    responses(
        (status = 200, description = "Batch status", body = BatchStatus),
        (status = 404, description = "Batch not found", body = crate::error::ApiError)
    )
)]
pub async fn get_batch(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<BatchStatus>, AppError> {
    state.increment_requests();
    let batch = state
        .store()
        .get_question_batch(id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Question batch {id}")))?;
    let questions = state.store().list_questions(Some(id), None).await?;
    let mut states = BTreeMap::new();
    for question in &questions {
        *states.entry(question.state.to_string()).or_insert(0) += 1;
    }
    let hits = state.store().hits_for_batch(id).await?.len();
    Ok(Json(BatchStatus {
        id,
        batch_type: batch.batch_type.to_string(),
        questions: questions.len(),
        states,
        hits,
    }))
}

/// Withdraw a question batch from the crowd
#[utoipa::path(
    post,
    path = "/api/v1/batches/{id}/revoke",
    tag = "batches",
    params(
        ("id" = Uuid, Path, description = "Question batch UUID")
    ),
    responses(
        (status = 200, description = "Batch revoked", body = RevokeResponse),
        (status = 404, description = "Batch not found", body = crate::error::ApiError)
    )
)]
pub async fn revoke_batch(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<RevokeResponse>, AppError> {
    state.increment_requests();
    let report = state.pipeline.revoke(id).await?;
    Ok(Json(RevokeResponse {
        id,
        cancelled: report.cancelled,
        failed: report.failed,
        revoked_questions: report.revoked_questions,
    }))
}
