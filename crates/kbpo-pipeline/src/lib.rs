//! KBPO Pipeline - Submission lifecycle, crowd tasks and scoring
//!
//! This crate moves submissions and question batches through their states:
//! - Questions: content-addressed annotation units drawn from samples
//! - Crowd: posting HITs and collecting assignments
//! - Aggregation: turning K responses into one set of verdicts
//! - Scoring: estimators and bootstrap intervals over the judged samples
//! - Workers: a bounded queue that chains stages together
//!
//! Author: hephaex@gmail.com

pub mod aggregate;
pub mod crowd;
pub mod questions;
pub mod scoring;
pub mod tasks;
pub mod worker;

pub use aggregate::{aggregate, clique_size, judgment_count};
pub use crowd::{CrowdAssignment, CrowdClient, HitRequest, HttpCrowdClient, MockCrowd};
pub use questions::{question_id, QuestionPlan};
pub use scoring::{latest_scores, leaderboard, score_corpus, LeaderboardCache, LeaderboardEntry};
pub use tasks::{
    AggregateReport, ExpireReport, IngestReport, Pipeline, RevokeReport, SampleReport, Task,
    ValidationReport,
};
pub use worker::WorkerPool;
