//! Evaluation store query surface
//!
//! The store is the single source of truth for submissions, samples,
//! questions, crowd tasks, responses, verdicts and scores. Every method that
//! writes more than one row must be atomic: either all rows land or the
//! prior state is left intact.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use uuid::Uuid;

use crate::judgment::{ResponseSet, VerdictSet};
use crate::model::KnowledgeBase;
use crate::span::Provenance;
use crate::{
    AssignmentState, BatchType, DistributionKind, DocumentDistribution, HitState, QuestionState,
    Result, Score, ScoreType, SubmissionState,
};

// ============================================================================
// Submissions and Documents
// ============================================================================

/// A system run uploaded for evaluation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Submission {
    pub id: Uuid,
    /// Run name, e.g. `SF_UMass_IESL1`
    pub name: String,
    pub details: String,
    pub corpus_tag: String,
    /// Shown on the leaderboard
    pub active: bool,
    pub state: SubmissionState,
    /// Stage-level message, set on error
    pub message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Submission {
    pub fn new(name: impl Into<String>, corpus_tag: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            details: String::new(),
            corpus_tag: corpus_tag.into(),
            active: true,
            state: SubmissionState::PendingUpload,
            message: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = details.into();
        self
    }
}

/// A corpus document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub doc_id: String,
    pub corpus_tag: String,
    /// Length of the document text in characters
    pub length: usize,
    /// Glosses of the suggested canonical mentions
    pub glosses: Vec<String>,
}

impl Document {
    pub fn new(doc_id: impl Into<String>, corpus_tag: impl Into<String>, length: usize) -> Self {
        Self {
            doc_id: doc_id.into(),
            corpus_tag: corpus_tag.into(),
            length,
            glosses: Vec::new(),
        }
    }

    pub fn with_glosses(mut self, glosses: Vec<String>) -> Self {
        self.glosses = glosses;
        self
    }

    /// True if the span lies within this document's text
    pub fn contains(&self, span: &Provenance) -> bool {
        span.doc_id == self.doc_id && span.end <= self.length
    }
}

// ============================================================================
// Samples
// ============================================================================

/// What a sample batch was drawn from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "scope", content = "distribution", rename_all = "snake_case")]
pub enum SampleKind {
    /// Relation instances of one submission
    Submission(DistributionKind),
    /// Corpus documents for exhaustive annotation
    Document(DocumentDistribution),
}

/// A recorded draw and its parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleBatch {
    pub id: Uuid,
    /// `None` for document batches
    pub submission_id: Option<Uuid>,
    pub kind: SampleKind,
    pub num_samples: usize,
    pub with_replacement: bool,
    pub seed: u64,
    pub created_at: DateTime<Utc>,
}

/// One drawn relation instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmissionSample {
    pub batch_id: Uuid,
    pub submission_id: Uuid,
    pub doc_id: String,
    pub subject: Provenance,
    pub object: Provenance,
    pub created_at: DateTime<Utc>,
}

impl SubmissionSample {
    /// Uniqueness key `(submission, doc, subject, object, batch)`
    pub fn key(&self) -> (Uuid, &str, &Provenance, &Provenance, Uuid) {
        (
            self.submission_id,
            &self.doc_id,
            &self.subject,
            &self.object,
            self.batch_id,
        )
    }
}

/// One drawn document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentSample {
    pub batch_id: Uuid,
    pub doc_id: String,
    pub created_at: DateTime<Utc>,
}

// ============================================================================
// Questions and Crowd Tasks
// ============================================================================

/// A set of questions materialized from one sample batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuestionBatch {
    pub id: Uuid,
    pub batch_type: BatchType,
    pub sample_batch_id: Option<Uuid>,
    pub params: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// One annotation unit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Question {
    /// Content hash of `params`
    pub id: String,
    pub batch_id: Uuid,
    pub batch_type: BatchType,
    pub params: serde_json::Value,
    pub state: QuestionState,
    pub message: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A task posted to the crowd collaborator for one question
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hit {
    /// Handle returned by the crowd collaborator
    pub id: String,
    pub question_batch_id: Uuid,
    pub question_id: String,
    pub state: HitState,
    pub max_assignments: u32,
    pub expires_at: DateTime<Utc>,
    pub message: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// One worker's submitted answer on a HIT
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assignment {
    pub id: String,
    pub hit_id: String,
    pub question_id: String,
    pub worker_id: String,
    pub state: AssignmentState,
    /// Raw response as received
    pub response: serde_json::Value,
    pub message: Option<String>,
    pub created_at: DateTime<Utc>,
}

// ============================================================================
// Scores
// ============================================================================

/// A score with its interval bounds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreRecord {
    pub submission_id: Uuid,
    pub score_type: ScoreType,
    pub score: Score,
    pub left: Score,
    pub right: Score,
    pub updated: DateTime<Utc>,
}

// ============================================================================
// Store Trait
// ============================================================================

/// Query surface over the evaluation store
#[async_trait]
pub trait KbStore: Send + Sync {
    // Submissions

    async fn create_submission(&self, submission: &Submission) -> Result<()>;

    async fn get_submission(&self, id: Uuid) -> Result<Option<Submission>>;

    async fn list_submissions(&self) -> Result<Vec<Submission>>;

    async fn set_submission_state(
        &self,
        id: Uuid,
        state: SubmissionState,
        message: Option<String>,
    ) -> Result<()>;

    /// Replace the submission's knowledge base in one transaction
    async fn put_knowledge_base(&self, id: Uuid, kb: &KnowledgeBase) -> Result<()>;

    async fn get_knowledge_base(&self, id: Uuid) -> Result<Option<KnowledgeBase>>;

    // Documents

    async fn upsert_documents(&self, documents: &[Document]) -> Result<usize>;

    async fn get_document(&self, doc_id: &str) -> Result<Option<Document>>;

    async fn list_documents(&self, corpus_tag: &str) -> Result<Vec<Document>>;

    // Samples

    async fn create_sample_batch(&self, batch: &SampleBatch) -> Result<()>;

    /// Batches of one submission, or document batches when `None`
    async fn list_sample_batches(&self, submission_id: Option<Uuid>) -> Result<Vec<SampleBatch>>;

    /// Insert samples, skipping rows that violate the uniqueness key.
    /// Returns the number inserted.
    async fn insert_submission_samples(&self, samples: &[SubmissionSample]) -> Result<usize>;

    async fn submission_samples(&self, batch_id: Uuid) -> Result<Vec<SubmissionSample>>;

    async fn insert_document_samples(&self, samples: &[DocumentSample]) -> Result<usize>;

    async fn document_samples(&self) -> Result<Vec<DocumentSample>>;

    // Questions

    async fn create_question_batch(&self, batch: &QuestionBatch) -> Result<()>;

    async fn get_question_batch(&self, id: Uuid) -> Result<Option<QuestionBatch>>;

    /// Insert questions whose id is new; returns the number inserted
    async fn insert_questions(&self, questions: &[Question]) -> Result<usize>;

    /// Subset of `ids` already present
    async fn existing_question_ids(&self, ids: &[String]) -> Result<HashSet<String>>;

    async fn get_question(&self, id: &str) -> Result<Option<Question>>;

    async fn list_questions(
        &self,
        batch_id: Option<Uuid>,
        state: Option<QuestionState>,
    ) -> Result<Vec<Question>>;

    async fn set_question_state(
        &self,
        id: &str,
        state: QuestionState,
        message: Option<String>,
    ) -> Result<()>;

    // HITs and assignments

    async fn insert_hit(&self, hit: &Hit) -> Result<()>;

    async fn get_hit(&self, id: &str) -> Result<Option<Hit>>;

    async fn hits_for_batch(&self, question_batch_id: Uuid) -> Result<Vec<Hit>>;

    async fn hits_for_question(&self, question_id: &str) -> Result<Vec<Hit>>;

    async fn set_hit_state(&self, id: &str, state: HitState, message: Option<String>) -> Result<()>;

    /// Record an assignment and its parsed rows together.
    /// Returns `false` if the assignment was already recorded.
    async fn insert_assignment(
        &self,
        assignment: &Assignment,
        responses: Option<&ResponseSet>,
    ) -> Result<bool>;

    async fn assignments_for_hit(&self, hit_id: &str) -> Result<Vec<Assignment>>;

    async fn assignments_for_question(&self, question_id: &str) -> Result<Vec<Assignment>>;

    async fn set_assignment_state(
        &self,
        id: &str,
        state: AssignmentState,
        message: Option<String>,
    ) -> Result<()>;

    /// Parsed responses of the question's assignments not marked `error`
    async fn responses_for_question(&self, question_id: &str) -> Result<Vec<ResponseSet>>;

    // Verdicts

    /// Atomically replace all verdicts of `verdicts.question_id`
    async fn replace_verdicts(&self, verdicts: &VerdictSet) -> Result<()>;

    async fn get_verdicts(&self, question_id: &str) -> Result<Option<VerdictSet>>;

    async fn list_verdicts(&self) -> Result<Vec<VerdictSet>>;

    // Scores

    async fn insert_score(&self, score: &ScoreRecord) -> Result<()>;

    /// Row with the latest `updated` for the submission and score type
    async fn latest_score(
        &self,
        submission_id: Uuid,
        score_type: ScoreType,
    ) -> Result<Option<ScoreRecord>>;

    async fn score_history(&self, submission_id: Uuid) -> Result<Vec<ScoreRecord>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_kind_serde() {
        let kind = SampleKind::Submission(DistributionKind::Relation);
        let json = serde_json::to_value(kind).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"scope": "submission", "distribution": "relation"})
        );
        let back: SampleKind = serde_json::from_value(json).unwrap();
        assert_eq!(back, kind);
    }

    #[test]
    fn test_document_contains() {
        let doc = Document::new("d1", "kbp2016", 100);
        assert!(doc.contains(&Provenance::new("d1", 90, 100)));
        assert!(!doc.contains(&Provenance::new("d1", 90, 101)));
        assert!(!doc.contains(&Provenance::new("d2", 0, 1)));
    }

    #[test]
    fn test_new_submission_is_pending_upload() {
        let s = Submission::new("SF_UMass_IESL1", "kbp2016").with_details("baseline");
        assert_eq!(s.state, SubmissionState::PendingUpload);
        assert!(s.active);
        assert_eq!(s.details, "baseline");
    }
}
