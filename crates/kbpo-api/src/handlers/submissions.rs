//! Submission handlers
//!
//! Author: hephaex@gmail.com

use crate::error::AppError;
use crate::state::AppState;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use chrono::{DateTime, Utc};
use kbpo_core::{KbpoError, ScoreRecord, Submission};
use kbpo_parser::InputFormat;
use kbpo_pipeline::{latest_scores, Task, ValidationReport};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;

/// Latest score of one type
#[derive(Debug, Serialize, ToSchema)]
pub struct ScoreSummary {
    #[schema(example = "entity")]
    pub score_type: String,
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
    #[schema(value_type = Vec<f64>)]
    pub f1_range: [f64; 2],
    pub updated: DateTime<Utc>,
}

impl From<&ScoreRecord> for ScoreSummary {
    fn from(record: &ScoreRecord) -> Self {
        Self {
            score_type: record.score_type.to_string(),
            precision: record.score.precision,
            recall: record.score.recall,
            f1: record.score.f1,
            f1_range: [record.left.f1, record.right.f1],
            updated: record.updated,
        }
    }
}

/// Submission information
#[derive(Debug, Serialize, ToSchema)]
pub struct SubmissionInfo {
    pub id: Uuid,
    #[schema(example = "stanford-run1")]
    pub name: String,
    pub details: String,
    #[schema(example = "kbp2016")]
    pub corpus_tag: String,
    pub active: bool,
    #[schema(example = "pending-turking")]
    pub state: String,
    /// Failure message when the state is `error`
    pub message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub scores: Vec<ScoreSummary>,
}

impl SubmissionInfo {
    fn new(submission: Submission, scores: Vec<ScoreSummary>) -> Self {
        Self {
            id: submission.id,
            name: submission.name,
            details: submission.details,
            corpus_tag: submission.corpus_tag,
            active: submission.active,
            state: submission.state.to_string(),
            message: submission.message,
            created_at: submission.created_at,
            updated_at: submission.updated_at,
            scores,
        }
    }
}

/// Validator outcome for an upload
#[derive(Debug, Serialize, ToSchema)]
pub struct ValidationSummary {
    pub mentions: usize,
    pub links: usize,
    pub relations: usize,
    pub errors: usize,
    pub warnings: usize,
    /// One line per dropped or suspicious input line
    pub diagnostics: Vec<String>,
}

impl From<ValidationReport> for ValidationSummary {
    fn from(report: ValidationReport) -> Self {
        Self {
            mentions: report.mentions,
            links: report.links,
            relations: report.relations,
            errors: report.errors,
            warnings: report.warnings,
            diagnostics: report.diagnostics,
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct UploadResponse {
    pub submission: SubmissionInfo,
    pub validation: ValidationSummary,
}

/// Query parameters describing an upload
#[derive(Debug, Deserialize, IntoParams)]
pub struct UploadQuery {
    /// Submission name shown on the leaderboard
    pub name: String,
    /// Corpus the submission was run on
    pub corpus_tag: String,
    pub details: Option<String>,
    /// `mfile` (entry file) or `tackb`
    #[param(default = "mfile")]
    pub format: Option<String>,
}

async fn submission_info(state: &AppState, submission: Submission) -> Result<SubmissionInfo, AppError> {
    let scores = latest_scores(state.store(), submission.id).await?;
    let scores = scores.values().map(ScoreSummary::from).collect();
    Ok(SubmissionInfo::new(submission, scores))
}

/// Upload and validate a submission, then queue it for sampling
#[utoipa::path(
    post,
    path = "/api/v1/submissions",
    tag = "submissions",
    params(UploadQuery),
    request_body(content = String, description = "Entry file or TAC-KB content", content_type = "text/plain"),
    responses(
        (status = 201, description = "Submission accepted", body = UploadResponse),
        (status = 400, description = "Bad request", body = crate::error::ApiError),
        (status = 422, description = "Submission failed validation", body = crate::error::ApiError)
    )
)]
pub async fn upload_submission(
    State(state): State<Arc<AppState>>,
    Query(params): Query<UploadQuery>,
    body: String,
) -> Result<impl IntoResponse, AppError> {
    state.increment_requests();

    let format = match params.format.as_deref() {
        Some(f) => f
            .parse::<InputFormat>()
            .map_err(|e| AppError::BadRequest(e.to_string()))?,
        None => InputFormat::Mfile,
    };
    if body.trim().is_empty() {
        return Err(AppError::BadRequest("Submission body is empty".to_string()));
    }
    if params.name.trim().is_empty() || params.corpus_tag.trim().is_empty() {
        return Err(AppError::BadRequest(
            "name and corpus_tag are required".to_string(),
        ));
    }

    let mut submission = Submission::new(params.name.trim(), params.corpus_tag.trim());
    if let Some(details) = params.details {
        submission = submission.with_details(details);
    }
    let submission = state.pipeline.submit(submission).await?;
    let id = submission.id;

    let report = match state.pipeline.validate(id, &body, format).await {
        Ok(report) => report,
        Err(KbpoError::Validation(msg)) => {
            return Err(AppError::Unprocessable(format!("submission {id}: {msg}")));
        }
        Err(e) => return Err(e.into()),
    };

    if let Err(e) = state.dispatch(Task::Sample { submission_id: id }).await {
        tracing::error!(submission_id = %id, error = %e, "failed to start sampling");
    }

    let current = state
        .store()
        .get_submission(id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Submission {id}")))?;
    let response = UploadResponse {
        submission: submission_info(&state, current).await?,
        validation: report.into(),
    };
    Ok((StatusCode::CREATED, Json(response)))
}

/// List submissions
#[utoipa::path(
    get,
    path = "/api/v1/submissions",
    tag = "submissions",
    responses(
        (status = 200, description = "All submissions", body = Vec<SubmissionInfo>)
    )
)]
pub async fn list_submissions(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<SubmissionInfo>>, AppError> {
    state.increment_requests();
    let mut infos = Vec::new();
    for submission in state.store().list_submissions().await? {
        infos.push(submission_info(&state, submission).await?);
    }
    Ok(Json(infos))
}

/// Get a submission with its latest scores
#[utoipa::path(
    get,
    path = "/api/v1/submissions/{id}",
    tag = "submissions",
    params(
        ("id" = Uuid, Path, description = "Submission UUID")
    ),
    responses(
        (status = 200, description = "Submission", body = SubmissionInfo),
        (status = 404, description = "Submission not found", body = crate::error::ApiError)
    )
)]
pub async fn get_submission(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<SubmissionInfo>, AppError> {
    state.increment_requests();
    let submission = state
        .store()
        .get_submission(id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Submission {id}")))?;
    Ok(Json(submission_info(&state, submission).await?))
}
