//! In-memory evaluation store

use std::collections::{BTreeMap, HashMap, HashSet};

use async_trait::async_trait;
use chrono::Utc;
use kbpo_core::store::{
    Assignment, Document, DocumentSample, Hit, Question, QuestionBatch, SampleBatch,
    SubmissionSample,
};
use kbpo_core::{
    AssignmentState, HitState, KbStore, KbpoError, KnowledgeBase, QuestionState, ResponseSet,
    Result, ScoreRecord, ScoreType, Submission, SubmissionState, VerdictSet,
};
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Default)]
struct Inner {
    submissions: BTreeMap<Uuid, Submission>,
    kbs: HashMap<Uuid, KnowledgeBase>,
    documents: BTreeMap<String, Document>,
    sample_batches: Vec<SampleBatch>,
    submission_samples: Vec<SubmissionSample>,
    document_samples: Vec<DocumentSample>,
    question_batches: HashMap<Uuid, QuestionBatch>,
    questions: BTreeMap<String, Question>,
    hits: BTreeMap<String, Hit>,
    assignments: BTreeMap<String, Assignment>,
    responses: HashMap<String, ResponseSet>,
    verdicts: BTreeMap<String, VerdictSet>,
    scores: Vec<ScoreRecord>,
}

/// Store held entirely in process memory
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn not_found(kind: &str, id: impl std::fmt::Display) -> KbpoError {
    KbpoError::NotFound(format!("{kind} {id}"))
}

#[async_trait]
impl KbStore for MemoryStore {
    async fn create_submission(&self, submission: &Submission) -> Result<()> {
        let mut inner = self.inner.write().await;
        if inner.submissions.contains_key(&submission.id) {
            return Err(KbpoError::Validation(format!(
                "submission {} already exists",
                submission.id
            )));
        }
        inner.submissions.insert(submission.id, submission.clone());
        Ok(())
    }

    async fn get_submission(&self, id: Uuid) -> Result<Option<Submission>> {
        Ok(self.inner.read().await.submissions.get(&id).cloned())
    }

    async fn list_submissions(&self) -> Result<Vec<Submission>> {
        let inner = self.inner.read().await;
        let mut submissions: Vec<Submission> = inner.submissions.values().cloned().collect();
        submissions.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(submissions)
    }

    async fn set_submission_state(
        &self,
        id: Uuid,
        state: SubmissionState,
        message: Option<String>,
    ) -> Result<()> {
        let mut inner = self.inner.write().await;
        let submission = inner
            .submissions
            .get_mut(&id)
            .ok_or_else(|| not_found("submission", id))?;
        submission.state = state;
        submission.message = message;
        submission.updated_at = Utc::now();
        Ok(())
    }

    async fn put_knowledge_base(&self, id: Uuid, kb: &KnowledgeBase) -> Result<()> {
        let mut inner = self.inner.write().await;
        if !inner.submissions.contains_key(&id) {
            return Err(not_found("submission", id));
        }
        inner.kbs.insert(id, kb.clone());
        debug!(submission_id = %id, mentions = kb.mentions.len(), "stored knowledge base");
        Ok(())
    }

    async fn get_knowledge_base(&self, id: Uuid) -> Result<Option<KnowledgeBase>> {
        Ok(self.inner.read().await.kbs.get(&id).cloned())
    }

    async fn upsert_documents(&self, documents: &[Document]) -> Result<usize> {
        let mut inner = self.inner.write().await;
        for document in documents {
            inner
                .documents
                .insert(document.doc_id.clone(), document.clone());
        }
        Ok(documents.len())
    }

    async fn get_document(&self, doc_id: &str) -> Result<Option<Document>> {
        Ok(self.inner.read().await.documents.get(doc_id).cloned())
    }

    async fn list_documents(&self, corpus_tag: &str) -> Result<Vec<Document>> {
        Ok(self
            .inner
            .read()
            .await
            .documents
            .values()
            .filter(|d| d.corpus_tag == corpus_tag)
            .cloned()
            .collect())
    }

    async fn create_sample_batch(&self, batch: &SampleBatch) -> Result<()> {
        let mut inner = self.inner.write().await;
        if let Some(id) = batch.submission_id {
            if !inner.submissions.contains_key(&id) {
                return Err(not_found("submission", id));
            }
        }
        inner.sample_batches.push(batch.clone());
        Ok(())
    }

    async fn list_sample_batches(&self, submission_id: Option<Uuid>) -> Result<Vec<SampleBatch>> {
        Ok(self
            .inner
            .read()
            .await
            .sample_batches
            .iter()
            .filter(|b| b.submission_id == submission_id)
            .cloned()
            .collect())
    }

    async fn insert_submission_samples(&self, samples: &[SubmissionSample]) -> Result<usize> {
        let mut inner = self.inner.write().await;
        let mut inserted = 0;
        for sample in samples {
            if inner
                .submission_samples
                .iter()
                .any(|s| s.key() == sample.key())
            {
                continue;
            }
            inner.submission_samples.push(sample.clone());
            inserted += 1;
        }
        Ok(inserted)
    }

    async fn submission_samples(&self, batch_id: Uuid) -> Result<Vec<SubmissionSample>> {
        Ok(self
            .inner
            .read()
            .await
            .submission_samples
            .iter()
            .filter(|s| s.batch_id == batch_id)
            .cloned()
            .collect())
    }

    async fn insert_document_samples(&self, samples: &[DocumentSample]) -> Result<usize> {
        let mut inner = self.inner.write().await;
        let mut inserted = 0;
        for sample in samples {
            if inner
                .document_samples
                .iter()
                .any(|s| s.batch_id == sample.batch_id && s.doc_id == sample.doc_id)
            {
                continue;
            }
            inner.document_samples.push(sample.clone());
            inserted += 1;
        }
        Ok(inserted)
    }

    async fn document_samples(&self) -> Result<Vec<DocumentSample>> {
        Ok(self.inner.read().await.document_samples.clone())
    }

    async fn create_question_batch(&self, batch: &QuestionBatch) -> Result<()> {
        self.inner
            .write()
            .await
            .question_batches
            .insert(batch.id, batch.clone());
        Ok(())
    }

    async fn get_question_batch(&self, id: Uuid) -> Result<Option<QuestionBatch>> {
        Ok(self.inner.read().await.question_batches.get(&id).cloned())
    }

    async fn insert_questions(&self, questions: &[Question]) -> Result<usize> {
        let mut inner = self.inner.write().await;
        let mut inserted = 0;
        for question in questions {
            if inner.questions.contains_key(&question.id) {
                continue;
            }
            inner.questions.insert(question.id.clone(), question.clone());
            inserted += 1;
        }
        Ok(inserted)
    }

    async fn existing_question_ids(&self, ids: &[String]) -> Result<HashSet<String>> {
        let inner = self.inner.read().await;
        Ok(ids
            .iter()
            .filter(|id| inner.questions.contains_key(*id))
            .cloned()
            .collect())
    }

    async fn get_question(&self, id: &str) -> Result<Option<Question>> {
        Ok(self.inner.read().await.questions.get(id).cloned())
    }

    async fn list_questions(
        &self,
        batch_id: Option<Uuid>,
        state: Option<QuestionState>,
    ) -> Result<Vec<Question>> {
        Ok(self
            .inner
            .read()
            .await
            .questions
            .values()
            .filter(|q| batch_id.map_or(true, |b| q.batch_id == b))
            .filter(|q| state.map_or(true, |s| q.state == s))
            .cloned()
            .collect())
    }

    async fn set_question_state(
        &self,
        id: &str,
        state: QuestionState,
        message: Option<String>,
    ) -> Result<()> {
        let mut inner = self.inner.write().await;
        let question = inner
            .questions
            .get_mut(id)
            .ok_or_else(|| not_found("question", id))?;
        question.state = state;
        question.message = message;
        Ok(())
    }

    async fn insert_hit(&self, hit: &Hit) -> Result<()> {
        let mut inner = self.inner.write().await;
        if !inner.questions.contains_key(&hit.question_id) {
            return Err(not_found("question", &hit.question_id));
        }
        inner.hits.insert(hit.id.clone(), hit.clone());
        Ok(())
    }

    async fn get_hit(&self, id: &str) -> Result<Option<Hit>> {
        Ok(self.inner.read().await.hits.get(id).cloned())
    }

    async fn hits_for_batch(&self, question_batch_id: Uuid) -> Result<Vec<Hit>> {
        Ok(self
            .inner
            .read()
            .await
            .hits
            .values()
            .filter(|h| h.question_batch_id == question_batch_id)
            .cloned()
            .collect())
    }

    async fn hits_for_question(&self, question_id: &str) -> Result<Vec<Hit>> {
        Ok(self
            .inner
            .read()
            .await
            .hits
            .values()
            .filter(|h| h.question_id == question_id)
            .cloned()
            .collect())
    }

    async fn set_hit_state(&self, id: &str, state: HitState, message: Option<String>) -> Result<()> {
        let mut inner = self.inner.write().await;
        let hit = inner.hits.get_mut(id).ok_or_else(|| not_found("hit", id))?;
        hit.state = state;
        hit.message = message;
        Ok(())
    }

    async fn insert_assignment(
        &self,
        assignment: &Assignment,
        responses: Option<&ResponseSet>,
    ) -> Result<bool> {
        let mut inner = self.inner.write().await;
        if inner.assignments.contains_key(&assignment.id) {
            return Ok(false);
        }
        if !inner.hits.contains_key(&assignment.hit_id) {
            return Err(not_found("hit", &assignment.hit_id));
        }
        inner
            .assignments
            .insert(assignment.id.clone(), assignment.clone());
        if let Some(responses) = responses {
            inner
                .responses
                .insert(assignment.id.clone(), responses.clone());
        }
        Ok(true)
    }

    async fn assignments_for_hit(&self, hit_id: &str) -> Result<Vec<Assignment>> {
        Ok(self
            .inner
            .read()
            .await
            .assignments
            .values()
            .filter(|a| a.hit_id == hit_id)
            .cloned()
            .collect())
    }

    async fn assignments_for_question(&self, question_id: &str) -> Result<Vec<Assignment>> {
        Ok(self
            .inner
            .read()
            .await
            .assignments
            .values()
            .filter(|a| a.question_id == question_id)
            .cloned()
            .collect())
    }

    async fn set_assignment_state(
        &self,
        id: &str,
        state: AssignmentState,
        message: Option<String>,
    ) -> Result<()> {
        let mut inner = self.inner.write().await;
        let assignment = inner
            .assignments
            .get_mut(id)
            .ok_or_else(|| not_found("assignment", id))?;
        assignment.state = state;
        assignment.message = message;
        Ok(())
    }

    async fn responses_for_question(&self, question_id: &str) -> Result<Vec<ResponseSet>> {
        let inner = self.inner.read().await;
        Ok(inner
            .assignments
            .values()
            .filter(|a| a.question_id == question_id && a.state != AssignmentState::Error)
            .filter_map(|a| inner.responses.get(&a.id).cloned())
            .collect())
    }

    async fn replace_verdicts(&self, verdicts: &VerdictSet) -> Result<()> {
        self.inner
            .write()
            .await
            .verdicts
            .insert(verdicts.question_id.clone(), verdicts.clone());
        Ok(())
    }

    async fn get_verdicts(&self, question_id: &str) -> Result<Option<VerdictSet>> {
        Ok(self.inner.read().await.verdicts.get(question_id).cloned())
    }

    async fn list_verdicts(&self) -> Result<Vec<VerdictSet>> {
        Ok(self.inner.read().await.verdicts.values().cloned().collect())
    }

    async fn insert_score(&self, score: &ScoreRecord) -> Result<()> {
        let mut inner = self.inner.write().await;
        if !inner.submissions.contains_key(&score.submission_id) {
            return Err(not_found("submission", score.submission_id));
        }
        inner.scores.push(score.clone());
        Ok(())
    }

    async fn latest_score(
        &self,
        submission_id: Uuid,
        score_type: ScoreType,
    ) -> Result<Option<ScoreRecord>> {
        Ok(self
            .inner
            .read()
            .await
            .scores
            .iter()
            .filter(|s| s.submission_id == submission_id && s.score_type == score_type)
            .max_by_key(|s| s.updated)
            .cloned())
    }

    async fn score_history(&self, submission_id: Uuid) -> Result<Vec<ScoreRecord>> {
        let mut history: Vec<ScoreRecord> = self
            .inner
            .read()
            .await
            .scores
            .iter()
            .filter(|s| s.submission_id == submission_id)
            .cloned()
            .collect();
        history.sort_by_key(|s| s.updated);
        Ok(history)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use kbpo_core::{BatchType, DistributionKind, Provenance, Score};
    use kbpo_core::store::SampleKind;

    async fn store_with_submission() -> (MemoryStore, Submission) {
        let store = MemoryStore::new();
        let submission = Submission::new("SF_Team1", "kbp2016");
        store.create_submission(&submission).await.unwrap();
        (store, submission)
    }

    fn question(id: &str, batch_id: Uuid) -> Question {
        Question {
            id: id.to_string(),
            batch_id,
            batch_type: BatchType::SelectiveRelations,
            params: serde_json::json!({"doc_id": "d1"}),
            state: QuestionState::PendingTurking,
            message: None,
            created_at: Utc::now(),
        }
    }

    fn hit(id: &str, batch_id: Uuid, question_id: &str) -> Hit {
        Hit {
            id: id.to_string(),
            question_batch_id: batch_id,
            question_id: question_id.to_string(),
            state: HitState::PendingAnnotation,
            max_assignments: 3,
            expires_at: Utc::now() + Duration::hours(1),
            message: None,
            created_at: Utc::now(),
        }
    }

    fn assignment(id: &str, hit_id: &str, question_id: &str) -> Assignment {
        Assignment {
            id: id.to_string(),
            hit_id: hit_id.to_string(),
            question_id: question_id.to_string(),
            worker_id: "w1".to_string(),
            state: AssignmentState::Submitted,
            response: serde_json::json!({}),
            message: None,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_submission_lifecycle() {
        let (store, submission) = store_with_submission().await;
        assert!(store.create_submission(&submission).await.is_err());

        store
            .set_submission_state(submission.id, SubmissionState::Error, Some("bad".into()))
            .await
            .unwrap();
        let loaded = store.get_submission(submission.id).await.unwrap().unwrap();
        assert_eq!(loaded.state, SubmissionState::Error);
        assert_eq!(loaded.message.as_deref(), Some("bad"));

        let missing = store
            .set_submission_state(Uuid::new_v4(), SubmissionState::Done, None)
            .await;
        assert!(matches!(missing, Err(KbpoError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_samples_are_unique_per_key() {
        let (store, submission) = store_with_submission().await;
        let batch = SampleBatch {
            id: Uuid::new_v4(),
            submission_id: Some(submission.id),
            kind: SampleKind::Submission(DistributionKind::Relation),
            num_samples: 2,
            with_replacement: true,
            seed: 1,
            created_at: Utc::now(),
        };
        store.create_sample_batch(&batch).await.unwrap();
        let sample = SubmissionSample {
            batch_id: batch.id,
            submission_id: submission.id,
            doc_id: "d1".into(),
            subject: Provenance::new("d1", 0, 5),
            object: Provenance::new("d1", 10, 20),
            created_at: Utc::now(),
        };
        let inserted = store
            .insert_submission_samples(&[sample.clone(), sample.clone()])
            .await
            .unwrap();
        assert_eq!(inserted, 1);
        assert_eq!(store.submission_samples(batch.id).await.unwrap().len(), 1);
        assert_eq!(
            store.list_sample_batches(Some(submission.id)).await.unwrap().len(),
            1
        );
        assert!(store.list_sample_batches(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_questions_are_never_reinserted() {
        let store = MemoryStore::new();
        let batch_id = Uuid::new_v4();
        let q = question("q1", batch_id);
        assert_eq!(store.insert_questions(&[q.clone()]).await.unwrap(), 1);
        assert_eq!(store.insert_questions(&[q]).await.unwrap(), 0);

        let existing = store
            .existing_question_ids(&["q1".to_string(), "q2".to_string()])
            .await
            .unwrap();
        assert!(existing.contains("q1"));
        assert!(!existing.contains("q2"));

        let pending = store
            .list_questions(Some(batch_id), Some(QuestionState::PendingTurking))
            .await
            .unwrap();
        assert_eq!(pending.len(), 1);
    }

    #[tokio::test]
    async fn test_responses_skip_errored_assignments() {
        let store = MemoryStore::new();
        let batch_id = Uuid::new_v4();
        store.insert_questions(&[question("q1", batch_id)]).await.unwrap();
        store.insert_hit(&hit("h1", batch_id, "q1")).await.unwrap();

        for id in ["a1", "a2"] {
            let rows = ResponseSet::new(id, "q1", 3);
            assert!(store
                .insert_assignment(&assignment(id, "h1", "q1"), Some(&rows))
                .await
                .unwrap());
        }
        assert!(!store
            .insert_assignment(&assignment("a1", "h1", "q1"), None)
            .await
            .unwrap());

        store
            .set_assignment_state("a2", AssignmentState::Error, Some("unparseable".into()))
            .await
            .unwrap();
        let responses = store.responses_for_question("q1").await.unwrap();
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].assignment_id, "a1");
    }

    #[tokio::test]
    async fn test_latest_score_wins() {
        let (store, submission) = store_with_submission().await;
        let now = Utc::now();
        for (offset, p) in [(0, 0.1), (2, 0.3), (1, 0.2)] {
            store
                .insert_score(&ScoreRecord {
                    submission_id: submission.id,
                    score_type: ScoreType::Relation,
                    score: Score::new(p, p),
                    left: Score::default(),
                    right: Score::default(),
                    updated: now + Duration::seconds(offset),
                })
                .await
                .unwrap();
        }
        let latest = store
            .latest_score(submission.id, ScoreType::Relation)
            .await
            .unwrap()
            .unwrap();
        assert!((latest.score.precision - 0.3).abs() < 1e-12);
        assert!(store
            .latest_score(submission.id, ScoreType::Entity)
            .await
            .unwrap()
            .is_none());
        assert_eq!(store.score_history(submission.id).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_verdicts_are_replaced() {
        let store = MemoryStore::new();
        let mut verdicts = VerdictSet::new("q1");
        store.replace_verdicts(&verdicts).await.unwrap();
        verdicts.relations.push(kbpo_core::RelationInstance::new(
            Provenance::new("d1", 0, 5),
            kbpo_core::RelationLabel::PerEmployeeOrMemberOf,
            Provenance::new("d1", 10, 20),
        ));
        store.replace_verdicts(&verdicts).await.unwrap();
        let stored = store.get_verdicts("q1").await.unwrap().unwrap();
        assert_eq!(stored.relations.len(), 1);
        assert_eq!(store.list_verdicts().await.unwrap().len(), 1);
    }
}
