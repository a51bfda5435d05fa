//! PostgreSQL evaluation store
//!
//! Knowledge bases, parsed responses and verdicts are stored as JSONB
//! documents; everything that is filtered or joined on has its own column.
//! Spans are stored in their `doc:begin-end` text form.

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kbpo_core::store::{
    Assignment, Document, DocumentSample, Hit, Question, QuestionBatch, SampleBatch, SampleKind,
    SubmissionSample,
};
use kbpo_core::{
    AssignmentState, HitState, KbStore, KbpoError, KnowledgeBase, Provenance, QuestionState,
    ResponseSet, Result, Score, ScoreRecord, ScoreType, Submission, SubmissionState, VerdictSet,
};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::FromRow;
use tracing::{debug, info};
use uuid::Uuid;

/// PostgreSQL-backed store
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Connect with a pool of `max_connections`
    pub async fn new(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(|e| KbpoError::Database(format!("PostgreSQL connection failed: {e}")))?;

        Ok(Self { pool })
    }

    /// Create from an existing pool
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the bundled schema migrations
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| KbpoError::Database(format!("Migration failed: {e}")))?;
        info!("Store schema is up to date");
        Ok(())
    }
}

fn db(context: &str) -> impl Fn(sqlx::Error) -> KbpoError + '_ {
    move |e| KbpoError::Database(format!("{context}: {e}"))
}

fn json<T: serde::Serialize>(value: &T) -> Result<serde_json::Value> {
    serde_json::to_value(value).map_err(|e| KbpoError::Database(format!("Failed to encode: {e}")))
}

fn from_json<T: serde::de::DeserializeOwned>(value: serde_json::Value) -> Result<T> {
    serde_json::from_value(value).map_err(|e| KbpoError::Database(format!("Failed to decode: {e}")))
}

fn span(text: &str) -> Result<Provenance> {
    text.parse()
        .map_err(|e| KbpoError::Database(format!("Stored span '{text}' is invalid: {e}")))
}

fn ensure_updated(rows: u64, kind: &str, id: impl std::fmt::Display) -> Result<()> {
    if rows == 0 {
        Err(KbpoError::NotFound(format!("{kind} {id}")))
    } else {
        Ok(())
    }
}

// ============================================================================
// Rows
// ============================================================================

#[derive(Debug, FromRow)]
struct SubmissionRow {
    id: Uuid,
    name: String,
    details: String,
    corpus_tag: String,
    active: bool,
    state: String,
    message: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<SubmissionRow> for Submission {
    type Error = KbpoError;

    fn try_from(row: SubmissionRow) -> Result<Self> {
        Ok(Submission {
            id: row.id,
            name: row.name,
            details: row.details,
            corpus_tag: row.corpus_tag,
            active: row.active,
            state: row.state.parse()?,
            message: row.message,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct DocumentRow {
    doc_id: String,
    corpus_tag: String,
    length: i64,
    glosses: Vec<String>,
}

impl From<DocumentRow> for Document {
    fn from(row: DocumentRow) -> Self {
        Document::new(row.doc_id, row.corpus_tag, row.length.max(0) as usize)
            .with_glosses(row.glosses)
    }
}

#[derive(Debug, FromRow)]
struct SampleBatchRow {
    id: Uuid,
    submission_id: Option<Uuid>,
    kind: serde_json::Value,
    num_samples: i64,
    with_replacement: bool,
    seed: i64,
    created_at: DateTime<Utc>,
}

impl TryFrom<SampleBatchRow> for SampleBatch {
    type Error = KbpoError;

    fn try_from(row: SampleBatchRow) -> Result<Self> {
        Ok(SampleBatch {
            id: row.id,
            submission_id: row.submission_id,
            kind: from_json::<SampleKind>(row.kind)?,
            num_samples: row.num_samples.max(0) as usize,
            with_replacement: row.with_replacement,
            // Seeds round-trip bit for bit through BIGINT
            seed: row.seed as u64,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct SubmissionSampleRow {
    batch_id: Uuid,
    submission_id: Uuid,
    doc_id: String,
    subject: String,
    object: String,
    created_at: DateTime<Utc>,
}

impl TryFrom<SubmissionSampleRow> for SubmissionSample {
    type Error = KbpoError;

    fn try_from(row: SubmissionSampleRow) -> Result<Self> {
        Ok(SubmissionSample {
            batch_id: row.batch_id,
            submission_id: row.submission_id,
            doc_id: row.doc_id,
            subject: span(&row.subject)?,
            object: span(&row.object)?,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct QuestionBatchRow {
    id: Uuid,
    batch_type: String,
    sample_batch_id: Option<Uuid>,
    params: serde_json::Value,
    created_at: DateTime<Utc>,
}

impl TryFrom<QuestionBatchRow> for QuestionBatch {
    type Error = KbpoError;

    fn try_from(row: QuestionBatchRow) -> Result<Self> {
        Ok(QuestionBatch {
            id: row.id,
            batch_type: row.batch_type.parse()?,
            sample_batch_id: row.sample_batch_id,
            params: row.params,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct QuestionRow {
    id: String,
    batch_id: Uuid,
    batch_type: String,
    params: serde_json::Value,
    state: String,
    message: Option<String>,
    created_at: DateTime<Utc>,
}

impl TryFrom<QuestionRow> for Question {
    type Error = KbpoError;

    fn try_from(row: QuestionRow) -> Result<Self> {
        Ok(Question {
            id: row.id,
            batch_id: row.batch_id,
            batch_type: row.batch_type.parse()?,
            params: row.params,
            state: row.state.parse()?,
            message: row.message,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct HitRow {
    id: String,
    question_batch_id: Uuid,
    question_id: String,
    state: String,
    max_assignments: i32,
    expires_at: DateTime<Utc>,
    message: Option<String>,
    created_at: DateTime<Utc>,
}

impl TryFrom<HitRow> for Hit {
    type Error = KbpoError;

    fn try_from(row: HitRow) -> Result<Self> {
        Ok(Hit {
            id: row.id,
            question_batch_id: row.question_batch_id,
            question_id: row.question_id,
            state: row.state.parse()?,
            max_assignments: row.max_assignments.max(0) as u32,
            expires_at: row.expires_at,
            message: row.message,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct AssignmentRow {
    id: String,
    hit_id: String,
    question_id: String,
    worker_id: String,
    state: String,
    response: serde_json::Value,
    message: Option<String>,
    created_at: DateTime<Utc>,
}

impl TryFrom<AssignmentRow> for Assignment {
    type Error = KbpoError;

    fn try_from(row: AssignmentRow) -> Result<Self> {
        Ok(Assignment {
            id: row.id,
            hit_id: row.hit_id,
            question_id: row.question_id,
            worker_id: row.worker_id,
            state: row.state.parse()?,
            response: row.response,
            message: row.message,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct ScoreRow {
    submission_id: Uuid,
    score_type: String,
    p: f64,
    r: f64,
    f1: f64,
    left_p: f64,
    left_r: f64,
    left_f1: f64,
    right_p: f64,
    right_r: f64,
    right_f1: f64,
    updated: DateTime<Utc>,
}

impl TryFrom<ScoreRow> for ScoreRecord {
    type Error = KbpoError;

    fn try_from(row: ScoreRow) -> Result<Self> {
        Ok(ScoreRecord {
            submission_id: row.submission_id,
            score_type: row.score_type.parse()?,
            score: Score::with_f1(row.p, row.r, row.f1),
            left: Score::with_f1(row.left_p, row.left_r, row.left_f1),
            right: Score::with_f1(row.right_p, row.right_r, row.right_f1),
            updated: row.updated,
        })
    }
}

fn convert<R, T: TryFrom<R, Error = KbpoError>>(rows: Vec<R>) -> Result<Vec<T>> {
    rows.into_iter().map(T::try_from).collect()
}

const SUBMISSION_COLUMNS: &str =
    "id, name, details, corpus_tag, active, state, message, created_at, updated_at";
const QUESTION_COLUMNS: &str = "id, batch_id, batch_type, params, state, message, created_at";
const HIT_COLUMNS: &str =
    "id, question_batch_id, question_id, state, max_assignments, expires_at, message, created_at";
const ASSIGNMENT_COLUMNS: &str =
    "id, hit_id, question_id, worker_id, state, response, message, created_at";
const SCORE_COLUMNS: &str =
    "submission_id, score_type, p, r, f1, left_p, left_r, left_f1, right_p, right_r, right_f1, updated";

// ============================================================================
// Store
// ============================================================================

#[async_trait]
impl KbStore for PgStore {
    async fn create_submission(&self, submission: &Submission) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO submission (
                id, name, details, corpus_tag, active, state, message, created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(submission.id)
        .bind(&submission.name)
        .bind(&submission.details)
        .bind(&submission.corpus_tag)
        .bind(submission.active)
        .bind(submission.state.as_str())
        .bind(&submission.message)
        .bind(submission.created_at)
        .bind(submission.updated_at)
        .execute(&self.pool)
        .await
        .map_err(db("Failed to create submission"))?;
        Ok(())
    }

    async fn get_submission(&self, id: Uuid) -> Result<Option<Submission>> {
        let row: Option<SubmissionRow> =
            sqlx::query_as(&format!("SELECT {SUBMISSION_COLUMNS} FROM submission WHERE id = $1"))
                .bind(id)
                .fetch_optional(&self.pool)
                .await
                .map_err(db("Failed to get submission"))?;
        row.map(Submission::try_from).transpose()
    }

    async fn list_submissions(&self) -> Result<Vec<Submission>> {
        let rows: Vec<SubmissionRow> = sqlx::query_as(&format!(
            "SELECT {SUBMISSION_COLUMNS} FROM submission ORDER BY created_at, id"
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(db("Failed to list submissions"))?;
        convert(rows)
    }

    async fn set_submission_state(
        &self,
        id: Uuid,
        state: SubmissionState,
        message: Option<String>,
    ) -> Result<()> {
        let result = sqlx::query(
            "UPDATE submission SET state = $2, message = $3, updated_at = NOW() WHERE id = $1",
        )
        .bind(id)
        .bind(state.as_str())
        .bind(message)
        .execute(&self.pool)
        .await
        .map_err(db("Failed to update submission"))?;
        ensure_updated(result.rows_affected(), "submission", id)
    }

    async fn put_knowledge_base(&self, id: Uuid, kb: &KnowledgeBase) -> Result<()> {
        let kb_json = json(kb)?;
        let result = sqlx::query(
            r#"
            INSERT INTO submission_kb (submission_id, kb, updated_at)
            SELECT id, $2, NOW() FROM submission WHERE id = $1
            ON CONFLICT (submission_id) DO UPDATE SET kb = EXCLUDED.kb, updated_at = NOW()
            "#,
        )
        .bind(id)
        .bind(&kb_json)
        .execute(&self.pool)
        .await
        .map_err(db("Failed to store knowledge base"))?;
        ensure_updated(result.rows_affected(), "submission", id)
    }

    async fn get_knowledge_base(&self, id: Uuid) -> Result<Option<KnowledgeBase>> {
        let row: Option<(serde_json::Value,)> =
            sqlx::query_as("SELECT kb FROM submission_kb WHERE submission_id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await
                .map_err(db("Failed to get knowledge base"))?;
        row.map(|(kb,)| from_json(kb)).transpose()
    }

    async fn upsert_documents(&self, documents: &[Document]) -> Result<usize> {
        let mut tx = self.pool.begin().await.map_err(db("Failed to begin"))?;
        for document in documents {
            sqlx::query(
                r#"
                INSERT INTO document (doc_id, corpus_tag, length, glosses)
                VALUES ($1, $2, $3, $4)
                ON CONFLICT (doc_id) DO UPDATE SET
                    corpus_tag = EXCLUDED.corpus_tag,
                    length = EXCLUDED.length,
                    glosses = EXCLUDED.glosses
                "#,
            )
            .bind(&document.doc_id)
            .bind(&document.corpus_tag)
            .bind(document.length as i64)
            .bind(&document.glosses)
            .execute(&mut *tx)
            .await
            .map_err(db("Failed to upsert document"))?;
        }
        tx.commit().await.map_err(db("Failed to commit documents"))?;
        Ok(documents.len())
    }

    async fn get_document(&self, doc_id: &str) -> Result<Option<Document>> {
        let row: Option<DocumentRow> = sqlx::query_as(
            "SELECT doc_id, corpus_tag, length, glosses FROM document WHERE doc_id = $1",
        )
        .bind(doc_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db("Failed to get document"))?;
        Ok(row.map(Document::from))
    }

    async fn list_documents(&self, corpus_tag: &str) -> Result<Vec<Document>> {
        let rows: Vec<DocumentRow> = sqlx::query_as(
            r#"
            SELECT doc_id, corpus_tag, length, glosses
            FROM document
            WHERE corpus_tag = $1
            ORDER BY doc_id
            "#,
        )
        .bind(corpus_tag)
        .fetch_all(&self.pool)
        .await
        .map_err(db("Failed to list documents"))?;
        Ok(rows.into_iter().map(Document::from).collect())
    }

    async fn create_sample_batch(&self, batch: &SampleBatch) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sample_batch (
                id, submission_id, kind, num_samples, with_replacement, seed, created_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(batch.id)
        .bind(batch.submission_id)
        .bind(json(&batch.kind)?)
        .bind(batch.num_samples as i64)
        .bind(batch.with_replacement)
        .bind(batch.seed as i64)
        .bind(batch.created_at)
        .execute(&self.pool)
        .await
        .map_err(db("Failed to create sample batch"))?;
        Ok(())
    }

    async fn list_sample_batches(&self, submission_id: Option<Uuid>) -> Result<Vec<SampleBatch>> {
        let rows: Vec<SampleBatchRow> = sqlx::query_as(
            r#"
            SELECT id, submission_id, kind, num_samples, with_replacement, seed, created_at
            FROM sample_batch
            WHERE submission_id IS NOT DISTINCT FROM $1
            ORDER BY created_at, id
            "#,
        )
        .bind(submission_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db("Failed to list sample batches"))?;
        convert(rows)
    }

    async fn insert_submission_samples(&self, samples: &[SubmissionSample]) -> Result<usize> {
        let mut tx = self.pool.begin().await.map_err(db("Failed to begin"))?;
        let mut inserted = 0;
        for sample in samples {
            let result = sqlx::query(
                r#"
                INSERT INTO submission_sample (
                    batch_id, submission_id, doc_id, subject, object, created_at
                ) VALUES ($1, $2, $3, $4, $5, $6)
                ON CONFLICT DO NOTHING
                "#,
            )
            .bind(sample.batch_id)
            .bind(sample.submission_id)
            .bind(&sample.doc_id)
            .bind(sample.subject.to_string())
            .bind(sample.object.to_string())
            .bind(sample.created_at)
            .execute(&mut *tx)
            .await
            .map_err(db("Failed to insert sample"))?;
            inserted += result.rows_affected() as usize;
        }
        tx.commit().await.map_err(db("Failed to commit samples"))?;
        debug!(inserted, requested = samples.len(), "inserted submission samples");
        Ok(inserted)
    }

    async fn submission_samples(&self, batch_id: Uuid) -> Result<Vec<SubmissionSample>> {
        let rows: Vec<SubmissionSampleRow> = sqlx::query_as(
            r#"
            SELECT batch_id, submission_id, doc_id, subject, object, created_at
            FROM submission_sample
            WHERE batch_id = $1
            ORDER BY doc_id, subject, object
            "#,
        )
        .bind(batch_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db("Failed to get samples"))?;
        convert(rows)
    }

    async fn insert_document_samples(&self, samples: &[DocumentSample]) -> Result<usize> {
        let mut tx = self.pool.begin().await.map_err(db("Failed to begin"))?;
        let mut inserted = 0;
        for sample in samples {
            let result = sqlx::query(
                r#"
                INSERT INTO document_sample (batch_id, doc_id, created_at)
                VALUES ($1, $2, $3)
                ON CONFLICT DO NOTHING
                "#,
            )
            .bind(sample.batch_id)
            .bind(&sample.doc_id)
            .bind(sample.created_at)
            .execute(&mut *tx)
            .await
            .map_err(db("Failed to insert document sample"))?;
            inserted += result.rows_affected() as usize;
        }
        tx.commit()
            .await
            .map_err(db("Failed to commit document samples"))?;
        Ok(inserted)
    }

    async fn document_samples(&self) -> Result<Vec<DocumentSample>> {
        let rows: Vec<(Uuid, String, DateTime<Utc>)> = sqlx::query_as(
            "SELECT batch_id, doc_id, created_at FROM document_sample ORDER BY created_at, doc_id",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(db("Failed to list document samples"))?;
        Ok(rows
            .into_iter()
            .map(|(batch_id, doc_id, created_at)| DocumentSample {
                batch_id,
                doc_id,
                created_at,
            })
            .collect())
    }

    async fn create_question_batch(&self, batch: &QuestionBatch) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO question_batch (id, batch_type, sample_batch_id, params, created_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(batch.id)
        .bind(batch.batch_type.as_str())
        .bind(batch.sample_batch_id)
        .bind(&batch.params)
        .bind(batch.created_at)
        .execute(&self.pool)
        .await
        .map_err(db("Failed to create question batch"))?;
        Ok(())
    }

    async fn get_question_batch(&self, id: Uuid) -> Result<Option<QuestionBatch>> {
        let row: Option<QuestionBatchRow> = sqlx::query_as(
            "SELECT id, batch_type, sample_batch_id, params, created_at FROM question_batch WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db("Failed to get question batch"))?;
        row.map(QuestionBatch::try_from).transpose()
    }

    async fn insert_questions(&self, questions: &[Question]) -> Result<usize> {
        let mut tx = self.pool.begin().await.map_err(db("Failed to begin"))?;
        let mut inserted = 0;
        for question in questions {
            let result = sqlx::query(
                r#"
                INSERT INTO question (id, batch_id, batch_type, params, state, message, created_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                ON CONFLICT (id) DO NOTHING
                "#,
            )
            .bind(&question.id)
            .bind(question.batch_id)
            .bind(question.batch_type.as_str())
            .bind(&question.params)
            .bind(question.state.as_str())
            .bind(&question.message)
            .bind(question.created_at)
            .execute(&mut *tx)
            .await
            .map_err(db("Failed to insert question"))?;
            inserted += result.rows_affected() as usize;
        }
        tx.commit().await.map_err(db("Failed to commit questions"))?;
        Ok(inserted)
    }

    async fn existing_question_ids(&self, ids: &[String]) -> Result<HashSet<String>> {
        let rows: Vec<(String,)> = sqlx::query_as("SELECT id FROM question WHERE id = ANY($1)")
            .bind(ids)
            .fetch_all(&self.pool)
            .await
            .map_err(db("Failed to look up questions"))?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    async fn get_question(&self, id: &str) -> Result<Option<Question>> {
        let row: Option<QuestionRow> =
            sqlx::query_as(&format!("SELECT {QUESTION_COLUMNS} FROM question WHERE id = $1"))
                .bind(id)
                .fetch_optional(&self.pool)
                .await
                .map_err(db("Failed to get question"))?;
        row.map(Question::try_from).transpose()
    }

    async fn list_questions(
        &self,
        batch_id: Option<Uuid>,
        state: Option<QuestionState>,
    ) -> Result<Vec<Question>> {
        let rows: Vec<QuestionRow> = sqlx::query_as(&format!(
            r#"
            SELECT {QUESTION_COLUMNS}
            FROM question
            WHERE ($1::uuid IS NULL OR batch_id = $1)
              AND ($2::text IS NULL OR state = $2)
            ORDER BY id
            "#
        ))
        .bind(batch_id)
        .bind(state.map(|s| s.as_str()))
        .fetch_all(&self.pool)
        .await
        .map_err(db("Failed to list questions"))?;
        convert(rows)
    }

    async fn set_question_state(
        &self,
        id: &str,
        state: QuestionState,
        message: Option<String>,
    ) -> Result<()> {
        let result = sqlx::query("UPDATE question SET state = $2, message = $3 WHERE id = $1")
            .bind(id)
            .bind(state.as_str())
            .bind(message)
            .execute(&self.pool)
            .await
            .map_err(db("Failed to update question"))?;
        ensure_updated(result.rows_affected(), "question", id)
    }

    async fn insert_hit(&self, hit: &Hit) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO hit (
                id, question_batch_id, question_id, state, max_assignments,
                expires_at, message, created_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (id) DO UPDATE SET
                state = EXCLUDED.state,
                expires_at = EXCLUDED.expires_at,
                message = EXCLUDED.message
            "#,
        )
        .bind(&hit.id)
        .bind(hit.question_batch_id)
        .bind(&hit.question_id)
        .bind(hit.state.as_str())
        .bind(hit.max_assignments as i32)
        .bind(hit.expires_at)
        .bind(&hit.message)
        .bind(hit.created_at)
        .execute(&self.pool)
        .await
        .map_err(db("Failed to insert hit"))?;
        Ok(())
    }

    async fn get_hit(&self, id: &str) -> Result<Option<Hit>> {
        let row: Option<HitRow> =
            sqlx::query_as(&format!("SELECT {HIT_COLUMNS} FROM hit WHERE id = $1"))
                .bind(id)
                .fetch_optional(&self.pool)
                .await
                .map_err(db("Failed to get hit"))?;
        row.map(Hit::try_from).transpose()
    }

    async fn hits_for_batch(&self, question_batch_id: Uuid) -> Result<Vec<Hit>> {
        let rows: Vec<HitRow> = sqlx::query_as(&format!(
            "SELECT {HIT_COLUMNS} FROM hit WHERE question_batch_id = $1 ORDER BY id"
        ))
        .bind(question_batch_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db("Failed to list hits"))?;
        convert(rows)
    }

    async fn hits_for_question(&self, question_id: &str) -> Result<Vec<Hit>> {
        let rows: Vec<HitRow> = sqlx::query_as(&format!(
            "SELECT {HIT_COLUMNS} FROM hit WHERE question_id = $1 ORDER BY id"
        ))
        .bind(question_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db("Failed to list hits"))?;
        convert(rows)
    }

    async fn set_hit_state(&self, id: &str, state: HitState, message: Option<String>) -> Result<()> {
        let result = sqlx::query("UPDATE hit SET state = $2, message = $3 WHERE id = $1")
            .bind(id)
            .bind(state.as_str())
            .bind(message)
            .execute(&self.pool)
            .await
            .map_err(db("Failed to update hit"))?;
        ensure_updated(result.rows_affected(), "hit", id)
    }

    async fn insert_assignment(
        &self,
        assignment: &Assignment,
        responses: Option<&ResponseSet>,
    ) -> Result<bool> {
        let mut tx = self.pool.begin().await.map_err(db("Failed to begin"))?;
        let result = sqlx::query(
            r#"
            INSERT INTO assignment (
                id, hit_id, question_id, worker_id, state, response, message, created_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(&assignment.id)
        .bind(&assignment.hit_id)
        .bind(&assignment.question_id)
        .bind(&assignment.worker_id)
        .bind(assignment.state.as_str())
        .bind(&assignment.response)
        .bind(&assignment.message)
        .bind(assignment.created_at)
        .execute(&mut *tx)
        .await
        .map_err(db("Failed to insert assignment"))?;

        if result.rows_affected() == 0 {
            tx.rollback().await.map_err(db("Failed to roll back"))?;
            return Ok(false);
        }
        if let Some(responses) = responses {
            sqlx::query("INSERT INTO response (assignment_id, question_id, parsed) VALUES ($1, $2, $3)")
                .bind(&assignment.id)
                .bind(&assignment.question_id)
                .bind(json(responses)?)
                .execute(&mut *tx)
                .await
                .map_err(db("Failed to insert responses"))?;
        }
        tx.commit().await.map_err(db("Failed to commit assignment"))?;
        Ok(true)
    }

    async fn assignments_for_hit(&self, hit_id: &str) -> Result<Vec<Assignment>> {
        let rows: Vec<AssignmentRow> = sqlx::query_as(&format!(
            "SELECT {ASSIGNMENT_COLUMNS} FROM assignment WHERE hit_id = $1 ORDER BY id"
        ))
        .bind(hit_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db("Failed to list assignments"))?;
        convert(rows)
    }

    async fn assignments_for_question(&self, question_id: &str) -> Result<Vec<Assignment>> {
        let rows: Vec<AssignmentRow> = sqlx::query_as(&format!(
            "SELECT {ASSIGNMENT_COLUMNS} FROM assignment WHERE question_id = $1 ORDER BY id"
        ))
        .bind(question_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db("Failed to list assignments"))?;
        convert(rows)
    }

    async fn set_assignment_state(
        &self,
        id: &str,
        state: AssignmentState,
        message: Option<String>,
    ) -> Result<()> {
        let result = sqlx::query("UPDATE assignment SET state = $2, message = $3 WHERE id = $1")
            .bind(id)
            .bind(state.as_str())
            .bind(message)
            .execute(&self.pool)
            .await
            .map_err(db("Failed to update assignment"))?;
        ensure_updated(result.rows_affected(), "assignment", id)
    }

    async fn responses_for_question(&self, question_id: &str) -> Result<Vec<ResponseSet>> {
        let rows: Vec<(serde_json::Value,)> = sqlx::query_as(
            r#"
            SELECT r.parsed
            FROM response r
            JOIN assignment a ON a.id = r.assignment_id
            WHERE a.question_id = $1 AND a.state <> $2
            ORDER BY a.id
            "#,
        )
        .bind(question_id)
        .bind(AssignmentState::Error.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(db("Failed to list responses"))?;
        rows.into_iter().map(|(rows,)| from_json(rows)).collect()
    }

    async fn replace_verdicts(&self, verdicts: &VerdictSet) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO verdict (question_id, verdicts, updated_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (question_id) DO UPDATE SET
                verdicts = EXCLUDED.verdicts,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(&verdicts.question_id)
        .bind(json(verdicts)?)
        .bind(verdicts.updated_at)
        .execute(&self.pool)
        .await
        .map_err(db("Failed to replace verdicts"))?;
        Ok(())
    }

    async fn get_verdicts(&self, question_id: &str) -> Result<Option<VerdictSet>> {
        let row: Option<(serde_json::Value,)> =
            sqlx::query_as("SELECT verdicts FROM verdict WHERE question_id = $1")
                .bind(question_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(db("Failed to get verdicts"))?;
        row.map(|(v,)| from_json(v)).transpose()
    }

    async fn list_verdicts(&self) -> Result<Vec<VerdictSet>> {
        let rows: Vec<(serde_json::Value,)> =
            sqlx::query_as("SELECT verdicts FROM verdict ORDER BY question_id")
                .fetch_all(&self.pool)
                .await
                .map_err(db("Failed to list verdicts"))?;
        rows.into_iter().map(|(v,)| from_json(v)).collect()
    }

    async fn insert_score(&self, score: &ScoreRecord) -> Result<()> {
        sqlx::query(&format!(
            "INSERT INTO score ({SCORE_COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)"
        ))
        .bind(score.submission_id)
        .bind(score.score_type.as_str())
        .bind(score.score.precision)
        .bind(score.score.recall)
        .bind(score.score.f1)
        .bind(score.left.precision)
        .bind(score.left.recall)
        .bind(score.left.f1)
        .bind(score.right.precision)
        .bind(score.right.recall)
        .bind(score.right.f1)
        .bind(score.updated)
        .execute(&self.pool)
        .await
        .map_err(db("Failed to insert score"))?;
        Ok(())
    }

    async fn latest_score(
        &self,
        submission_id: Uuid,
        score_type: ScoreType,
    ) -> Result<Option<ScoreRecord>> {
        let row: Option<ScoreRow> = sqlx::query_as(&format!(
            r#"
            SELECT {SCORE_COLUMNS}
            FROM score
            WHERE submission_id = $1 AND score_type = $2
            ORDER BY updated DESC
            LIMIT 1
            "#
        ))
        .bind(submission_id)
        .bind(score_type.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(db("Failed to get score"))?;
        row.map(ScoreRecord::try_from).transpose()
    }

    async fn score_history(&self, submission_id: Uuid) -> Result<Vec<ScoreRecord>> {
        let rows: Vec<ScoreRow> = sqlx::query_as(&format!(
            "SELECT {SCORE_COLUMNS} FROM score WHERE submission_id = $1 ORDER BY updated"
        ))
        .bind(submission_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db("Failed to get score history"))?;
        convert(rows)
    }
}
