//! Submission lifecycle stages
//!
//! Each stage checks the submission's current state before doing anything,
//! performs its work, and then advances the state. A stage that fails after
//! the guard moves the submission to `error` with the failure message.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use kbpo_core::store::{
    Assignment, Document, DocumentSample, Hit, Question, QuestionBatch, SampleBatch, SampleKind,
    SubmissionSample,
};
use kbpo_core::{
    AppConfig, AssignmentState, BatchType, DistributionKind, DocumentDistribution, HitState,
    KbStore, KbpoError, Provenance, QuestionState, ResponseSet, Result, ScoreRecord, ScoreType, Submission,
    SubmissionState, VerdictSet,
};
use kbpo_eval::{document_entity, document_uniform, submission_distribution, Sampler};
use kbpo_parser::{parse_kb, parse_response, InputFormat, ParseError, ParseOptions};
use serde::Serialize;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::aggregate::aggregate;
use crate::crowd::{CrowdClient, HitRequest};
use crate::questions::{
    batch_submission, entity_questions, relation_questions, selective_questions, QuestionPlan,
};
use crate::scoring::{score_corpus, LeaderboardCache};

// ============================================================================
// Tasks and Reports
// ============================================================================

/// Unit of work handled by the worker pool
#[derive(Debug, Clone)]
pub enum Task {
    Validate {
        submission_id: Uuid,
        content: String,
        format: InputFormat,
    },
    Sample {
        submission_id: Uuid,
    },
    Turk {
        submission_id: Uuid,
    },
    /// Post the re-queued questions of one batch
    TurkBatch {
        question_batch_id: Uuid,
    },
    /// Fetch assignments of every live HIT
    Poll,
    Ingest {
        hit_id: String,
    },
    Aggregate {
        question_batch_id: Uuid,
    },
    Score {
        submission_id: Uuid,
    },
    Revoke {
        question_batch_id: Uuid,
    },
    Expire,
}

impl Task {
    pub fn name(&self) -> &'static str {
        match self {
            Task::Validate { .. } => "validate",
            Task::Sample { .. } => "sample",
            Task::Turk { .. } => "turk",
            Task::TurkBatch { .. } => "turk-batch",
            Task::Poll => "poll",
            Task::Ingest { .. } => "ingest",
            Task::Aggregate { .. } => "aggregate",
            Task::Score { .. } => "score",
            Task::Revoke { .. } => "revoke",
            Task::Expire => "expire",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ValidationReport {
    pub submission_id: Uuid,
    pub mentions: usize,
    pub links: usize,
    pub relations: usize,
    pub errors: usize,
    pub warnings: usize,
    /// Rendered diagnostics, one per dropped or suspicious line
    pub diagnostics: Vec<String>,
}

/// Outcome of drawing one sample batch
#[derive(Debug, Clone)]
pub struct SampleReport {
    pub batch: SampleBatch,
    /// Question batch holding the not-yet-asked questions, if any
    pub questions: Option<QuestionBatch>,
    pub new_questions: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct IngestReport {
    pub question_batch_id: Option<Uuid>,
    pub received: usize,
    pub failed: usize,
    /// The question has all the judgments it needs
    pub complete: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct AggregateReport {
    pub aggregated: usize,
    pub skipped: usize,
    /// Submissions whose questions are all settled
    pub ready: Vec<Uuid>,
    /// Exhaustive relation batch created from entity verdicts
    pub followup: Option<Uuid>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ExpireReport {
    pub expired: usize,
    /// Batches with questions waiting to be posted again
    pub requeued: Vec<Uuid>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RevokeReport {
    pub cancelled: usize,
    pub failed: usize,
    pub revoked_questions: usize,
}

// ============================================================================
// Pipeline
// ============================================================================

const OUTSTANDING: [QuestionState; 3] = [
    QuestionState::PendingTurking,
    QuestionState::PendingAnnotation,
    QuestionState::PendingAggregation,
];

/// Drives submissions and question batches through their lifecycles
pub struct Pipeline {
    store: Arc<dyn KbStore>,
    crowd: Arc<dyn CrowdClient>,
    config: AppConfig,
    leaderboard: LeaderboardCache,
}

impl Pipeline {
    pub fn new(store: Arc<dyn KbStore>, crowd: Arc<dyn CrowdClient>, config: AppConfig) -> Self {
        Self {
            store,
            crowd,
            config,
            leaderboard: LeaderboardCache::default(),
        }
    }

    pub fn with_leaderboard(mut self, leaderboard: LeaderboardCache) -> Self {
        self.leaderboard = leaderboard;
        self
    }

    pub fn store(&self) -> &Arc<dyn KbStore> {
        &self.store
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn leaderboard(&self) -> &LeaderboardCache {
        &self.leaderboard
    }

    /// Run one task; returns the tasks it unlocks
    pub async fn run(&self, task: Task) -> Result<Vec<Task>> {
        match task {
            Task::Validate {
                submission_id,
                content,
                format,
            } => {
                self.validate(submission_id, &content, format).await?;
                Ok(vec![Task::Sample { submission_id }])
            }
            Task::Sample { submission_id } => {
                self.sample(submission_id).await?;
                Ok(vec![Task::Turk { submission_id }])
            }
            Task::Turk { submission_id } => {
                self.turk(submission_id).await?;
                let state = self.require(submission_id).await?.state;
                Ok(if state == SubmissionState::PendingScoring {
                    vec![Task::Score { submission_id }]
                } else {
                    Vec::new()
                })
            }
            Task::Poll => self.live_hits().await,
            Task::Ingest { hit_id } => {
                let report = self.ingest(&hit_id).await?;
                Ok(match report.question_batch_id {
                    Some(question_batch_id) if report.complete => {
                        vec![Task::Aggregate { question_batch_id }]
                    }
                    _ => Vec::new(),
                })
            }
            Task::Aggregate { question_batch_id } => {
                let report = self.aggregate(question_batch_id).await?;
                Ok(report
                    .ready
                    .into_iter()
                    .map(|submission_id| Task::Score { submission_id })
                    .collect())
            }
            Task::Score { submission_id } => {
                self.score(submission_id).await?;
                Ok(Vec::new())
            }
            Task::Revoke { question_batch_id } => {
                self.revoke(question_batch_id).await?;
                Ok(Vec::new())
            }
            Task::TurkBatch { question_batch_id } => {
                self.turk_batch(question_batch_id).await?;
                Ok(Vec::new())
            }
            Task::Expire => Ok(self
                .expire(Utc::now())
                .await?
                .requeued
                .into_iter()
                .map(|question_batch_id| Task::TurkBatch { question_batch_id })
                .collect()),
        }
    }

    async fn require(&self, id: Uuid) -> Result<Submission> {
        self.store
            .get_submission(id)
            .await?
            .ok_or_else(|| KbpoError::NotFound(format!("submission {id}")))
    }

    /// Load the submission and check it is in `expected`
    async fn require_state(&self, id: Uuid, expected: SubmissionState) -> Result<Submission> {
        let submission = self.require(id).await?;
        if submission.state != expected {
            return Err(KbpoError::InvalidState {
                entity: format!("submission {id}"),
                expected: expected.to_string(),
                found: submission.state.to_string(),
            });
        }
        Ok(submission)
    }

    /// Move the submission to `error` if a stage failed
    async fn finish<T>(&self, id: Uuid, stage: &str, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            error!(submission_id = %id, stage, error = %e, "stage failed");
            self.store
                .set_submission_state(id, SubmissionState::Error, Some(format!("{stage}: {e}")))
                .await?;
        }
        result
    }

    // ========================================================================
    // Upload and Validation
    // ========================================================================

    /// Register a new submission awaiting validation
    pub async fn submit(&self, submission: Submission) -> Result<Submission> {
        self.store.create_submission(&submission).await?;
        self.store
            .set_submission_state(submission.id, SubmissionState::PendingValidation, None)
            .await?;
        info!(submission_id = %submission.id, name = %submission.name, "submission uploaded");
        self.require(submission.id).await
    }

    pub async fn validate(
        &self,
        id: Uuid,
        content: &str,
        format: InputFormat,
    ) -> Result<ValidationReport> {
        let submission = self
            .require_state(id, SubmissionState::PendingValidation)
            .await?;
        let result = self.validate_inner(&submission, content, format).await;
        self.finish(id, "validate", result).await
    }

    async fn validate_inner(
        &self,
        submission: &Submission,
        content: &str,
        format: InputFormat,
    ) -> Result<ValidationReport> {
        let documents = self.store.list_documents(&submission.corpus_tag).await?;
        let mut options = ParseOptions::default();
        if !documents.is_empty() {
            options = options.with_documents(
                documents
                    .iter()
                    .map(|d| (d.doc_id.clone(), d.length))
                    .collect::<HashMap<_, _>>(),
            );
        }

        let outcome = parse_kb(content.as_bytes(), format, &options)
            .map_err(|e| KbpoError::Validation(e.to_string()))?;
        let kb = outcome.kb;
        if kb.mentions.is_empty() || kb.relations.is_empty() {
            return Err(KbpoError::Validation(
                "submission has no valid mentions or relations".to_string(),
            ));
        }

        for (code, count) in outcome.diagnostics.summary() {
            debug!(submission_id = %submission.id, code = %code, count, "diagnostics");
        }
        self.store.put_knowledge_base(submission.id, &kb).await?;
        self.store
            .set_submission_state(submission.id, SubmissionState::PendingSampling, None)
            .await?;

        let report = ValidationReport {
            submission_id: submission.id,
            mentions: kb.mentions.len(),
            links: kb.links.len(),
            relations: kb.relations.len(),
            errors: outcome.diagnostics.errors().count(),
            warnings: outcome.diagnostics.warnings().count(),
            diagnostics: outcome
                .diagnostics
                .entries()
                .iter()
                .map(|d| d.to_string())
                .collect(),
        };
        info!(
            submission_id = %submission.id,
            mentions = report.mentions,
            relations = report.relations,
            errors = report.errors,
            warnings = report.warnings,
            "validated submission"
        );
        Ok(report)
    }

    // ========================================================================
    // Sampling
    // ========================================================================

    /// Draw the entity and relation batches the scorer reads
    pub async fn sample(&self, id: Uuid) -> Result<Vec<SampleReport>> {
        self.require_state(id, SubmissionState::PendingSampling)
            .await?;
        let result = self.sample_inner(id).await;
        self.finish(id, "sample", result).await
    }

    async fn sample_inner(&self, id: Uuid) -> Result<Vec<SampleReport>> {
        let sampling = &self.config.sampling;
        let mut reports = Vec::new();
        for score_type in [ScoreType::Entity, ScoreType::Relation] {
            reports.push(
                self.sample_batch(
                    id,
                    score_type.distribution(),
                    sampling.num_samples,
                    sampling.with_replacement,
                    sampling.seed,
                )
                .await?,
            );
        }
        self.store
            .set_submission_state(id, SubmissionState::PendingTurking, None)
            .await?;
        Ok(reports)
    }

    /// Draw one sample batch from a submission and queue its new questions
    pub async fn sample_batch(
        &self,
        id: Uuid,
        kind: DistributionKind,
        n: usize,
        with_replacement: bool,
        seed: Option<u64>,
    ) -> Result<SampleReport> {
        let kb = self
            .store
            .get_knowledge_base(id)
            .await?
            .ok_or_else(|| KbpoError::NotFound(format!("knowledge base of {id}")))?;
        let distribution = submission_distribution(&kb, kind)?;
        let mut sampler = Sampler::from_option(seed);
        let draws = sampler.draw(&distribution, n, with_replacement)?;

        let batch = SampleBatch {
            id: Uuid::new_v4(),
            submission_id: Some(id),
            kind: SampleKind::Submission(kind),
            num_samples: draws.len(),
            with_replacement,
            seed: sampler.seed(),
            created_at: Utc::now(),
        };
        self.store.create_sample_batch(&batch).await?;

        let samples: Vec<SubmissionSample> = draws
            .into_iter()
            .map(|(subject, object)| SubmissionSample {
                batch_id: batch.id,
                submission_id: id,
                doc_id: subject.doc_id.clone(),
                subject,
                object,
                created_at: batch.created_at,
            })
            .collect();
        let inserted = self.store.insert_submission_samples(&samples).await?;

        let plan = selective_questions(&kb, batch.id, &samples);
        let (questions, new_questions) = self.materialize(plan).await?;
        info!(
            submission_id = %id,
            batch_id = %batch.id,
            kind = %kind,
            samples = inserted,
            new_questions,
            "drew submission sample"
        );
        Ok(SampleReport {
            batch,
            questions,
            new_questions,
        })
    }

    /// Draw documents for exhaustive annotation
    ///
    /// The entity distribution needs earlier document samples to compare
    /// against.
    pub async fn sample_documents(
        &self,
        corpus_tag: &str,
        distribution: DocumentDistribution,
        n: usize,
        seed: Option<u64>,
    ) -> Result<SampleReport> {
        let documents = self.store.list_documents(corpus_tag).await?;
        let seeds: BTreeSet<String> = self
            .store
            .document_samples()
            .await?
            .into_iter()
            .map(|s| s.doc_id)
            .collect();

        let dist = match distribution {
            DocumentDistribution::Uniform => {
                let unsampled: Vec<_> = documents
                    .into_iter()
                    .filter(|d| !seeds.contains(&d.doc_id))
                    .collect();
                if unsampled.is_empty() {
                    return Err(KbpoError::Sampling(format!(
                        "no unsampled documents in corpus {corpus_tag}"
                    )));
                }
                document_uniform(&unsampled)?
            }
            DocumentDistribution::Entity => document_entity(&documents, &seeds)?,
        };

        let mut sampler = Sampler::from_option(seed);
        let draws = sampler.without_replacement(&dist, n)?;
        let batch = SampleBatch {
            id: Uuid::new_v4(),
            submission_id: None,
            kind: SampleKind::Document(distribution),
            num_samples: draws.len(),
            with_replacement: false,
            seed: sampler.seed(),
            created_at: Utc::now(),
        };
        self.store.create_sample_batch(&batch).await?;

        let samples: Vec<DocumentSample> = draws
            .into_iter()
            .map(|doc_id| DocumentSample {
                batch_id: batch.id,
                doc_id,
                created_at: batch.created_at,
            })
            .collect();
        self.store.insert_document_samples(&samples).await?;

        let (questions, new_questions) = self
            .materialize(entity_questions(batch.id, &samples))
            .await?;
        info!(
            corpus_tag,
            batch_id = %batch.id,
            distribution = %distribution,
            documents = samples.len(),
            "drew document sample"
        );
        Ok(SampleReport {
            batch,
            questions,
            new_questions,
        })
    }

    /// Persist the questions of a plan that were never asked before
    async fn materialize(&self, mut plan: QuestionPlan) -> Result<(Option<QuestionBatch>, usize)> {
        let existing = self.store.existing_question_ids(&plan.ids()).await?;
        plan.retain_new(&existing);
        if plan.is_empty() {
            debug!(batch_type = %plan.batch.batch_type, "every question already asked");
            return Ok((None, 0));
        }
        self.store.create_question_batch(&plan.batch).await?;
        let inserted = self.store.insert_questions(&plan.questions).await?;
        Ok((Some(plan.batch), inserted))
    }

    // ========================================================================
    // Crowd Tasks
    // ========================================================================

    /// Selective questions of a submission grouped by batch
    async fn submission_questions(
        &self,
        id: Uuid,
        states: &[QuestionState],
    ) -> Result<BTreeMap<Uuid, (QuestionBatch, Vec<Question>)>> {
        let samples: HashSet<Uuid> = self
            .store
            .list_sample_batches(Some(id))
            .await?
            .into_iter()
            .map(|b| b.id)
            .collect();

        let mut owned: HashMap<Uuid, Option<QuestionBatch>> = HashMap::new();
        let mut grouped: BTreeMap<Uuid, (QuestionBatch, Vec<Question>)> = BTreeMap::new();
        for state in states {
            for question in self.store.list_questions(None, Some(*state)).await? {
                if !owned.contains_key(&question.batch_id) {
                    let batch = self
                        .store
                        .get_question_batch(question.batch_id)
                        .await?
                        .filter(|b| b.sample_batch_id.is_some_and(|s| samples.contains(&s)));
                    owned.insert(question.batch_id, batch);
                }
                if let Some(Some(batch)) = owned.get(&question.batch_id) {
                    grouped
                        .entry(batch.id)
                        .or_insert_with(|| (batch.clone(), Vec::new()))
                        .1
                        .push(question);
                }
            }
        }
        Ok(grouped)
    }

    async fn outstanding(&self, id: Uuid) -> Result<usize> {
        Ok(self
            .submission_questions(id, &OUTSTANDING)
            .await?
            .values()
            .map(|(_, questions)| questions.len())
            .sum())
    }

    /// Post a HIT for every question of the submission awaiting one
    pub async fn turk(&self, id: Uuid) -> Result<usize> {
        self.require_state(id, SubmissionState::PendingTurking)
            .await?;
        let result = self.turk_inner(id).await;
        self.finish(id, "turk", result).await
    }

    async fn turk_inner(&self, id: Uuid) -> Result<usize> {
        let mut posted = 0;
        for (batch, questions) in self
            .submission_questions(id, &[QuestionState::PendingTurking])
            .await?
            .values()
        {
            posted += self.post_questions(batch, questions).await?;
        }

        let next = if self.outstanding(id).await? > 0 {
            SubmissionState::PendingAggregation
        } else {
            SubmissionState::PendingScoring
        };
        self.store.set_submission_state(id, next, None).await?;
        info!(submission_id = %id, posted, state = %next, "posted hits");
        Ok(posted)
    }

    /// Post HITs for the pending questions of one batch
    pub async fn turk_batch(&self, question_batch_id: Uuid) -> Result<usize> {
        let batch = self
            .store
            .get_question_batch(question_batch_id)
            .await?
            .ok_or_else(|| KbpoError::NotFound(format!("question batch {question_batch_id}")))?;
        let questions = self
            .store
            .list_questions(Some(question_batch_id), Some(QuestionState::PendingTurking))
            .await?;
        self.post_questions(&batch, &questions).await
    }

    async fn valid_assignments(&self, question_id: &str) -> Result<usize> {
        Ok(self
            .store
            .assignments_for_question(question_id)
            .await?
            .iter()
            .filter(|a| a.state != AssignmentState::Error)
            .count())
    }

    async fn post_questions(&self, batch: &QuestionBatch, questions: &[Question]) -> Result<usize> {
        let crowd = &self.config.crowd;
        let mut posted = 0;
        for question in questions {
            let have = self.valid_assignments(&question.id).await? as u32;
            let remaining = crowd.max_assignments.saturating_sub(have);
            if remaining == 0 {
                self.store
                    .set_question_state(&question.id, QuestionState::PendingAggregation, None)
                    .await?;
                continue;
            }

            let request = HitRequest {
                question_id: question.id.clone(),
                batch_type: question.batch_type,
                params: question.params.clone(),
                max_assignments: remaining,
                lifetime_secs: crowd.assignment_lifetime_secs,
                reward_cents: crowd.reward_cents,
            };
            match self.crowd.post_hit(&request).await {
                Ok(hit_id) => {
                    let now = Utc::now();
                    let hit = Hit {
                        id: hit_id,
                        question_batch_id: batch.id,
                        question_id: question.id.clone(),
                        state: HitState::PendingAnnotation,
                        max_assignments: remaining,
                        expires_at: now
                            + Duration::seconds(crowd.assignment_lifetime_secs as i64),
                        message: None,
                        created_at: now,
                    };
                    self.store.insert_hit(&hit).await?;
                    self.store
                        .set_question_state(&question.id, QuestionState::PendingAnnotation, None)
                        .await?;
                    posted += 1;
                }
                Err(e) => {
                    warn!(question_id = %question.id, error = %e, "failed to post hit");
                    self.store
                        .set_question_state(&question.id, QuestionState::Error, Some(e.to_string()))
                        .await?;
                }
            }
        }
        Ok(posted)
    }

    /// Ingest tasks for every HIT still collecting answers
    async fn live_hits(&self) -> Result<Vec<Task>> {
        let mut tasks = Vec::new();
        for question in self
            .store
            .list_questions(None, Some(QuestionState::PendingAnnotation))
            .await?
        {
            for hit in self.store.hits_for_question(&question.id).await? {
                if hit.state == HitState::PendingAnnotation {
                    tasks.push(Task::Ingest { hit_id: hit.id });
                }
            }
        }
        Ok(tasks)
    }

    /// Record the assignments submitted so far on one HIT
    pub async fn ingest(&self, hit_id: &str) -> Result<IngestReport> {
        let hit = self
            .store
            .get_hit(hit_id)
            .await?
            .ok_or_else(|| KbpoError::NotFound(format!("hit {hit_id}")))?;
        let mut report = IngestReport {
            question_batch_id: Some(hit.question_batch_id),
            ..IngestReport::default()
        };
        if hit.state != HitState::PendingAnnotation {
            debug!(hit_id, state = %hit.state, "hit not collecting answers");
            return Ok(report);
        }
        let question = self
            .store
            .get_question(&hit.question_id)
            .await?
            .ok_or_else(|| KbpoError::NotFound(format!("question {}", hit.question_id)))?;
        if question.state != QuestionState::PendingAnnotation {
            debug!(hit_id, state = %question.state, "question not awaiting answers");
            return Ok(report);
        }

        let fetched = match self.crowd.fetch_assignments(hit_id).await {
            Ok(fetched) => fetched,
            Err(e) => {
                self.store
                    .set_hit_state(hit_id, HitState::Error, Some(e.to_string()))
                    .await?;
                return Err(e);
            }
        };

        let document = match question.params.get("doc_id").and_then(|d| d.as_str()) {
            Some(doc_id) => self.store.get_document(doc_id).await?,
            None => None,
        };

        let k = self.config.crowd.max_assignments;
        for crowd_assignment in fetched {
            let parsed = parse_response(
                question.batch_type,
                &question.params,
                &crowd_assignment.response,
                &crowd_assignment.id,
                &question.id,
                k,
            );
            let parsed = parsed.and_then(|responses| {
                let outside = document
                    .as_ref()
                    .and_then(|d| outside_document(d, &responses))
                    .map(|span| span.to_string());
                match outside {
                    Some(span) => Err(ParseError::MalformedResponse(format!(
                        "span outside document text: {span}"
                    ))),
                    None => Ok(responses),
                }
            });
            let (state, message, responses) = match parsed {
                Ok(responses) => (AssignmentState::Submitted, None, Some(responses)),
                Err(e) => {
                    warn!(assignment_id = %crowd_assignment.id, error = %e, "unparseable response");
                    (AssignmentState::Error, Some(e.to_string()), None)
                }
            };
            let assignment = Assignment {
                id: crowd_assignment.id,
                hit_id: hit_id.to_string(),
                question_id: question.id.clone(),
                worker_id: crowd_assignment.worker_id,
                state,
                response: crowd_assignment.response,
                message,
                created_at: crowd_assignment.submitted_at,
            };
            if self
                .store
                .insert_assignment(&assignment, responses.as_ref())
                .await?
            {
                report.received += 1;
                if state == AssignmentState::Error {
                    report.failed += 1;
                }
            }
        }

        report.complete = self.valid_assignments(&question.id).await? as u32 >= k;
        if report.complete {
            self.store
                .set_hit_state(hit_id, HitState::PendingAggregation, None)
                .await?;
            self.store
                .set_question_state(&question.id, QuestionState::PendingAggregation, None)
                .await?;
        }
        debug!(hit_id, received = report.received, complete = report.complete, "ingested hit");
        Ok(report)
    }

    // ========================================================================
    // Aggregation and Scoring
    // ========================================================================

    /// Aggregate every question of the batch that has all its judgments
    pub async fn aggregate(&self, question_batch_id: Uuid) -> Result<AggregateReport> {
        let batch = self
            .store
            .get_question_batch(question_batch_id)
            .await?
            .ok_or_else(|| KbpoError::NotFound(format!("question batch {question_batch_id}")))?;
        let mut report = AggregateReport::default();

        for question in self
            .store
            .list_questions(Some(batch.id), Some(QuestionState::PendingAggregation))
            .await?
        {
            match self.aggregate_question(&question).await {
                Ok(()) => report.aggregated += 1,
                Err(e) => {
                    warn!(question_id = %question.id, error = %e, "aggregation skipped");
                    report.skipped += 1;
                }
            }
        }

        let questions = self.store.list_questions(Some(batch.id), None).await?;
        let settled = questions.iter().all(|q| !OUTSTANDING.contains(&q.state));
        if settled {
            match batch.batch_type {
                BatchType::SelectiveRelations => {
                    if let Some(id) = batch_submission(&batch) {
                        if self.ready_to_score(id).await? {
                            report.ready.push(id);
                        }
                    }
                }
                BatchType::ExhaustiveEntities => {
                    report.followup = self.exhaustive_relations(&batch, &questions).await?;
                }
                BatchType::ExhaustiveRelations => {}
            }
        }
        info!(
            question_batch_id = %batch.id,
            aggregated = report.aggregated,
            skipped = report.skipped,
            settled,
            "aggregated batch"
        );
        Ok(report)
    }

    async fn aggregate_question(&self, question: &Question) -> Result<()> {
        let responses = self.store.responses_for_question(&question.id).await?;
        let verdicts = aggregate(&question.id, &responses)?;
        self.store.replace_verdicts(&verdicts).await?;
        for hit in self.store.hits_for_question(&question.id).await? {
            if hit.state == HitState::PendingAggregation {
                self.store.set_hit_state(&hit.id, HitState::Done, None).await?;
            }
        }
        for assignment in self.store.assignments_for_question(&question.id).await? {
            if assignment.state == AssignmentState::Submitted {
                self.store
                    .set_assignment_state(&assignment.id, AssignmentState::Aggregated, None)
                    .await?;
            }
        }
        self.store
            .set_question_state(&question.id, QuestionState::Done, None)
            .await
    }

    async fn ready_to_score(&self, id: Uuid) -> Result<bool> {
        let Some(submission) = self.store.get_submission(id).await? else {
            return Ok(false);
        };
        if submission.state != SubmissionState::PendingAggregation || self.outstanding(id).await? > 0 {
            return Ok(false);
        }
        self.store
            .set_submission_state(id, SubmissionState::PendingScoring, None)
            .await?;
        Ok(true)
    }

    /// Turn entity verdicts of a document batch into relation questions
    async fn exhaustive_relations(
        &self,
        batch: &QuestionBatch,
        questions: &[Question],
    ) -> Result<Option<Uuid>> {
        let mut verdicts: Vec<VerdictSet> = Vec::new();
        for question in questions.iter().filter(|q| q.state == QuestionState::Done) {
            if let Some(v) = self.store.get_verdicts(&question.id).await? {
                verdicts.push(v);
            }
        }
        let plan = relation_questions(batch.sample_batch_id, &verdicts);
        let (created, new_questions) = self.materialize(plan).await?;
        if let Some(created) = &created {
            info!(
                entity_batch = %batch.id,
                relation_batch = %created.id,
                new_questions,
                "queued exhaustive relation questions"
            );
        }
        Ok(created.map(|b| b.id))
    }

    /// Score the submission's corpus and finish the submission
    pub async fn score(&self, id: Uuid) -> Result<Vec<ScoreRecord>> {
        let submission = self
            .require_state(id, SubmissionState::PendingScoring)
            .await?;
        let result = self.score_inner(&submission).await;
        self.finish(id, "score", result).await
    }

    async fn score_inner(&self, submission: &Submission) -> Result<Vec<ScoreRecord>> {
        let records =
            score_corpus(self.store.as_ref(), &submission.corpus_tag, &self.config.scoring).await?;
        if !records.iter().any(|r| r.submission_id == submission.id) {
            warn!(submission_id = %submission.id, "submission has no judged samples");
        }
        self.store
            .set_submission_state(submission.id, SubmissionState::Done, None)
            .await?;
        self.leaderboard.invalidate().await;
        Ok(records)
    }

    // ========================================================================
    // Revocation and Expiry
    // ========================================================================

    /// Withdraw a question batch. Collected responses are kept; later
    /// aggregation and scoring skip the revoked questions. Safe to retry.
    pub async fn revoke(&self, question_batch_id: Uuid) -> Result<RevokeReport> {
        if self.store.get_question_batch(question_batch_id).await?.is_none() {
            return Err(KbpoError::NotFound(format!(
                "question batch {question_batch_id}"
            )));
        }
        let mut report = RevokeReport::default();

        for question in self.store.list_questions(Some(question_batch_id), None).await? {
            if question.state == QuestionState::Revoked {
                continue;
            }
            let mut failure = None;
            for hit in self.store.hits_for_question(&question.id).await? {
                match hit.state {
                    HitState::PendingAnnotation | HitState::Error => {
                        match self.crowd.cancel_hit(&hit.id).await {
                            Ok(()) => {
                                self.store
                                    .set_hit_state(&hit.id, HitState::Revoked, None)
                                    .await?;
                                report.cancelled += 1;
                            }
                            Err(e) => {
                                warn!(hit_id = %hit.id, error = %e, "failed to cancel hit");
                                self.store
                                    .set_hit_state(&hit.id, HitState::Error, Some(e.to_string()))
                                    .await?;
                                report.failed += 1;
                                failure = Some(e.to_string());
                            }
                        }
                    }
                    HitState::PendingAggregation | HitState::Expired => {
                        self.store
                            .set_hit_state(&hit.id, HitState::Revoked, None)
                            .await?;
                    }
                    HitState::Done | HitState::Revoked => {}
                }
            }
            match failure {
                Some(message) => {
                    self.store
                        .set_question_state(&question.id, QuestionState::Error, Some(message))
                        .await?;
                }
                None => {
                    self.store
                        .set_question_state(&question.id, QuestionState::Revoked, None)
                        .await?;
                    report.revoked_questions += 1;
                }
            }
        }
        self.leaderboard.invalidate().await;
        info!(
            question_batch_id = %question_batch_id,
            cancelled = report.cancelled,
            failed = report.failed,
            revoked = report.revoked_questions,
            "revoked batch"
        );
        Ok(report)
    }

    /// Expire HITs whose lifetime passed before they collected every
    /// assignment. Their questions go back to be posted again.
    pub async fn expire(&self, now: DateTime<Utc>) -> Result<ExpireReport> {
        let mut report = ExpireReport::default();
        for question in self
            .store
            .list_questions(None, Some(QuestionState::PendingAnnotation))
            .await?
        {
            let mut live = 0;
            for hit in self.store.hits_for_question(&question.id).await? {
                if hit.state != HitState::PendingAnnotation {
                    continue;
                }
                if hit.expires_at > now {
                    live += 1;
                    continue;
                }
                self.store
                    .set_hit_state(
                        &hit.id,
                        HitState::Expired,
                        Some("assignment lifetime elapsed".to_string()),
                    )
                    .await?;
                report.expired += 1;
            }
            if live == 0 {
                let have = self.valid_assignments(&question.id).await? as u32;
                let next = if have >= self.config.crowd.max_assignments {
                    QuestionState::PendingAggregation
                } else {
                    QuestionState::PendingTurking
                };
                self.store.set_question_state(&question.id, next, None).await?;
                if next == QuestionState::PendingTurking
                    && !report.requeued.contains(&question.batch_id)
                {
                    report.requeued.push(question.batch_id);
                }
            }
        }
        if report.expired > 0 {
            info!(
                expired = report.expired,
                requeued = report.requeued.len(),
                "expired hits"
            );
        }
        Ok(report)
    }
}

/// First answered span that runs past the end of the document
fn outside_document<'a>(document: &Document, responses: &'a ResponseSet) -> Option<&'a Provenance> {
    let mentions = responses
        .mentions
        .iter()
        .flat_map(|m| [&m.provenance, &m.canonical]);
    let links = responses.links.iter().map(|l| &l.provenance);
    let relations = responses
        .relations
        .iter()
        .flat_map(|r| [&r.subject, &r.object].into_iter().chain(&r.provenances));
    mentions
        .chain(links)
        .chain(relations)
        .find(|span| !document.contains(span))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crowd::MockCrowd;
    use kbpo_store::MemoryStore;
    use serde_json::json;

    fn pipeline(crowd: Arc<MockCrowd>) -> Pipeline {
        let mut config = AppConfig::default();
        config.crowd.max_assignments = 1;
        config.sampling.num_samples = 5;
        config.sampling.seed = Some(7);
        Pipeline::new(Arc::new(MemoryStore::new()), crowd, config)
    }

    const ENTRIES: &str = "d1:0-5\tPER\tAlice\t\t1.0
d1:0-5\tcanonical_mention\td1:0-5\t\t1.0
d1:10-20\tORG\tAcme\t\t1.0
d1:10-20\tcanonical_mention\td1:10-20\t\t1.0
d1:0-5\tper:employee_or_member_of\td1:10-20\td1:0-20\t1.0
";

    #[tokio::test]
    async fn test_stage_guards_reject_wrong_state() {
        let p = pipeline(Arc::new(MockCrowd::new()));
        let submission = p.submit(Submission::new("sys", "corpus")).await.unwrap();
        assert_eq!(submission.state, SubmissionState::PendingValidation);

        let err = p.sample(submission.id).await.unwrap_err();
        assert!(matches!(err, KbpoError::InvalidState { .. }));
        let unchanged = p.store().get_submission(submission.id).await.unwrap().unwrap();
        assert_eq!(unchanged.state, SubmissionState::PendingValidation);
        assert!(unchanged.message.is_none());
    }

    #[tokio::test]
    async fn test_validation_failure_sets_error() {
        let p = pipeline(Arc::new(MockCrowd::new()));
        let submission = p.submit(Submission::new("sys", "corpus")).await.unwrap();
        assert!(p
            .validate(submission.id, "garbage line\n", InputFormat::Mfile)
            .await
            .is_err());
        let failed = p.store().get_submission(submission.id).await.unwrap().unwrap();
        assert_eq!(failed.state, SubmissionState::Error);
        assert!(failed.message.unwrap().starts_with("validate"));
    }

    #[tokio::test]
    async fn test_validate_sample_turk() {
        let crowd = Arc::new(MockCrowd::new());
        let p = pipeline(Arc::clone(&crowd));
        let submission = p.submit(Submission::new("sys", "corpus")).await.unwrap();

        let report = p
            .validate(submission.id, ENTRIES, InputFormat::Mfile)
            .await
            .unwrap();
        assert_eq!(report.mentions, 2);
        // the inverse is added during validation
        assert_eq!(report.relations, 2);

        let samples = p.sample(submission.id).await.unwrap();
        assert_eq!(samples.len(), 2);
        // the symmetric pair is asked once across both batches
        let new: usize = samples.iter().map(|s| s.new_questions).sum();
        assert_eq!(new, 1);

        assert_eq!(p.turk(submission.id).await.unwrap(), 1);
        let state = p.store().get_submission(submission.id).await.unwrap().unwrap().state;
        assert_eq!(state, SubmissionState::PendingAggregation);
        assert_eq!(crowd.hits().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_ingest_marks_bad_response_error() {
        let crowd = Arc::new(MockCrowd::new());
        let p = pipeline(Arc::clone(&crowd));
        let submission = p.submit(Submission::new("sys", "corpus")).await.unwrap();
        p.validate(submission.id, ENTRIES, InputFormat::Mfile).await.unwrap();
        p.sample(submission.id).await.unwrap();
        p.turk(submission.id).await.unwrap();

        let (hit_id, _) = crowd.hits().unwrap().remove(0);
        crowd.answer(&hit_id, "w1", json!({"nonsense": true})).unwrap();
        let report = p.ingest(&hit_id).await.unwrap();
        assert_eq!(report.received, 1);
        assert_eq!(report.failed, 1);
        assert!(!report.complete);

        // already recorded assignments are not counted twice
        let again = p.ingest(&hit_id).await.unwrap();
        assert_eq!(again.received, 0);
    }

    #[tokio::test]
    async fn test_expire_requeues_question() {
        let crowd = Arc::new(MockCrowd::new());
        let p = pipeline(Arc::clone(&crowd));
        let submission = p.submit(Submission::new("sys", "corpus")).await.unwrap();
        p.validate(submission.id, ENTRIES, InputFormat::Mfile).await.unwrap();
        p.sample(submission.id).await.unwrap();
        p.turk(submission.id).await.unwrap();

        assert_eq!(p.expire(Utc::now()).await.unwrap().expired, 0);
        let later = Utc::now() + Duration::days(30);
        let report = p.expire(later).await.unwrap();
        assert_eq!(report.expired, 1);
        assert_eq!(report.requeued.len(), 1);
        let pending = p
            .store()
            .list_questions(None, Some(QuestionState::PendingTurking))
            .await
            .unwrap();
        assert_eq!(pending.len(), 1);
    }

    #[tokio::test]
    async fn test_revoke_unknown_batch() {
        let p = pipeline(Arc::new(MockCrowd::new()));
        assert!(matches!(
            p.revoke(Uuid::new_v4()).await,
            Err(KbpoError::NotFound(_))
        ));
    }
}
