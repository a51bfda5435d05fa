//! Score assembly and the leaderboard
//!
//! Scores are computed from verdicts only. For each score type, every
//! scoreable submission of a corpus contributes its sampling distribution
//! `P`, its judged sample `Xh` and the exhaustively judged truth slice `Y0`;
//! the estimators then run over all of them at once.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use kbpo_core::store::SampleKind;
use kbpo_core::{
    BatchType, KbStore, KnowledgeBase, QuestionState, RelationInstance, Result, ScoreRecord,
    ScoreType, ScoringConfig, Submission, VerdictSet,
};
use kbpo_eval::{
    submission_distribution, Bootstrap, Distribution, Estimator, Flat, InstanceKey, Labeled,
    Sampler, TruthItem,
};
use moka::future::Cache;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::questions::{pair_of, selective_question_id};

// ============================================================================
// Labels
// ============================================================================

/// True if `judged` agrees with `emitted` in either orientation
fn agrees(emitted: &RelationInstance, judged: &RelationInstance) -> bool {
    if judged.label.is_no_relation() {
        return false;
    }
    if emitted.subject == judged.subject && emitted.object == judged.object {
        return emitted.label == judged.label;
    }
    emitted.subject == judged.object
        && emitted.object == judged.subject
        && (judged.label.inverses().contains(&emitted.label)
            || emitted.label.inverses().contains(&judged.label))
}

/// Label of a sampled instance from its question's verdicts, if judged
pub fn sample_label(kb: &KnowledgeBase, key: &InstanceKey, verdicts: &VerdictSet) -> Option<f64> {
    let (subject, object) = key;
    let emitted = kb.relation(subject, object)?;
    let judged: Vec<&RelationInstance> = verdicts
        .relations
        .iter()
        .filter(|r| {
            (&r.subject == subject && &r.object == object)
                || (&r.subject == object && &r.object == subject)
        })
        .collect();
    if judged.is_empty() {
        return None;
    }
    let correct = judged.iter().any(|r| agrees(emitted, r));
    Some(if correct { 1.0 } else { 0.0 })
}

/// True if the knowledge base emits the judged relation
pub fn emits(kb: &KnowledgeBase, judged: &RelationInstance) -> bool {
    [
        kb.relation(&judged.subject, &judged.object),
        kb.relation(&judged.object, &judged.subject),
    ]
    .into_iter()
    .flatten()
    .any(|r| agrees(r, judged))
}

// ============================================================================
// Scoring Inputs
// ============================================================================

/// Verdicts of live questions, keyed by question id
pub struct VerdictIndex {
    verdicts: HashMap<String, VerdictSet>,
    truth: Vec<RelationInstance>,
}

impl VerdictIndex {
    /// Load verdicts, dropping revoked questions, and collect the truth slice
    /// from exhaustive relation questions on sampled documents
    pub async fn load(store: &dyn KbStore) -> Result<Self> {
        let revoked: HashSet<String> = store
            .list_questions(None, Some(QuestionState::Revoked))
            .await?
            .into_iter()
            .map(|q| q.id)
            .collect();
        let sampled_docs: HashSet<String> = store
            .document_samples()
            .await?
            .into_iter()
            .map(|d| d.doc_id)
            .collect();
        let exhaustive: HashSet<String> = store
            .list_questions(None, Some(QuestionState::Done))
            .await?
            .into_iter()
            .filter(|q| q.batch_type == BatchType::ExhaustiveRelations)
            .filter(|q| {
                pair_of(&q.params)
                    .map(|(s, _)| sampled_docs.contains(&s.doc_id))
                    .unwrap_or(false)
            })
            .map(|q| q.id)
            .collect();

        let mut verdicts = HashMap::new();
        let mut truth = Vec::new();
        for v in store.list_verdicts().await? {
            if revoked.contains(&v.question_id) {
                continue;
            }
            if exhaustive.contains(&v.question_id) {
                truth.extend(
                    v.relations
                        .iter()
                        .filter(|r| r.weight > 0.5 && !r.label.is_no_relation())
                        .cloned(),
                );
            }
            verdicts.insert(v.question_id.clone(), v);
        }
        truth.sort_by(|a, b| a.pair().cmp(&b.pair()).then(a.label.cmp(&b.label)));
        truth.dedup_by(|a, b| a.pair() == b.pair() && a.label == b.label);
        debug!(verdicts = verdicts.len(), truth = truth.len(), "loaded verdicts");
        Ok(Self { verdicts, truth })
    }

    pub fn get(&self, question_id: &str) -> Option<&VerdictSet> {
        self.verdicts.get(question_id)
    }

    pub fn truth(&self) -> &[RelationInstance] {
        &self.truth
    }
}

/// One submission's contribution to a score type
pub struct SystemInput {
    pub submission: Submission,
    pub kb: KnowledgeBase,
    pub distribution: Distribution<InstanceKey>,
    pub sample: Vec<Labeled<InstanceKey>>,
}

async fn system_input(
    store: &dyn KbStore,
    submission: Submission,
    score_type: ScoreType,
    verdicts: &VerdictIndex,
) -> Result<Option<SystemInput>> {
    let Some(kb) = store.get_knowledge_base(submission.id).await? else {
        return Ok(None);
    };
    let kind = SampleKind::Submission(score_type.distribution());
    let mut sample = Vec::new();
    for batch in store.list_sample_batches(Some(submission.id)).await? {
        if batch.kind != kind {
            continue;
        }
        for s in store.submission_samples(batch.id).await? {
            let key = (s.subject, s.object);
            let qid = selective_question_id(&kb, &key.0, &key.1);
            if let Some(label) = verdicts.get(&qid).and_then(|v| sample_label(&kb, &key, v)) {
                sample.push((key, label));
            }
        }
    }
    if sample.is_empty() {
        return Ok(None);
    }
    let distribution = submission_distribution(&kb, score_type.distribution())?;
    Ok(Some(SystemInput {
        submission,
        kb,
        distribution,
        sample,
    }))
}

/// Score every scoreable submission of a corpus for one score type
pub async fn score_type(
    store: &dyn KbStore,
    corpus_tag: &str,
    score_type: ScoreType,
    config: &ScoringConfig,
    verdicts: &VerdictIndex,
) -> Result<Vec<ScoreRecord>> {
    let mut systems = Vec::new();
    for submission in store.list_submissions().await? {
        if submission.corpus_tag != corpus_tag || submission.state.is_terminal() {
            continue;
        }
        if let Some(input) = system_input(store, submission, score_type, verdicts).await? {
            systems.push(input);
        }
    }
    if systems.is_empty() {
        debug!(corpus_tag, score_type = %score_type, "no judged samples to score");
        return Ok(Vec::new());
    }

    let ps: Vec<Distribution<InstanceKey>> =
        systems.iter().map(|s| s.distribution.clone()).collect();
    let xhs: Vec<Vec<Labeled<InstanceKey>>> = systems.iter().map(|s| s.sample.clone()).collect();
    let y0: Vec<TruthItem<InstanceKey>> = verdicts
        .truth()
        .iter()
        .map(|r| TruthItem::new(r.pair(), systems.iter().map(|s| emits(&s.kb, r)).collect()))
        .collect();

    let estimator = Estimator::new(&ps, &xhs, &y0, &Flat, config.weight_method)?;
    let bootstrap = Bootstrap::from_config(config)?;
    let mut sampler = Sampler::from_option(config.seed);
    let intervals = bootstrap.score_intervals(&estimator, config.mode, &mut sampler);

    let updated = Utc::now();
    let records: Vec<ScoreRecord> = systems
        .iter()
        .zip(intervals)
        .map(|(system, interval)| ScoreRecord {
            submission_id: system.submission.id,
            score_type,
            score: interval.estimate,
            left: interval.left,
            right: interval.right,
            updated,
        })
        .collect();
    info!(
        corpus_tag,
        score_type = %score_type,
        mode = %config.mode,
        systems = records.len(),
        truth = y0.len(),
        "scored submissions"
    );
    Ok(records)
}

/// Score a corpus for both score types and persist the rows
pub async fn score_corpus(
    store: &dyn KbStore,
    corpus_tag: &str,
    config: &ScoringConfig,
) -> Result<Vec<ScoreRecord>> {
    let verdicts = VerdictIndex::load(store).await?;
    let mut all = Vec::new();
    for st in [ScoreType::Entity, ScoreType::Relation] {
        let records = score_type(store, corpus_tag, st, config, &verdicts).await?;
        for record in &records {
            store.insert_score(record).await?;
        }
        all.extend(records);
    }
    if all.is_empty() {
        warn!(corpus_tag, "nothing to score");
    }
    Ok(all)
}

// ============================================================================
// Leaderboard
// ============================================================================

/// One leaderboard row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeaderboardEntry {
    pub id: Uuid,
    pub name: String,
    pub details: String,
    pub timestamp: DateTime<Utc>,
    pub corpus_tag: String,
    pub score_type: ScoreType,
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
    pub precision_range: [f64; 2],
    pub recall_range: [f64; 2],
    pub f1_range: [f64; 2],
}

impl LeaderboardEntry {
    pub fn new(submission: &Submission, record: &ScoreRecord) -> Self {
        Self {
            id: submission.id,
            name: submission.name.clone(),
            details: submission.details.clone(),
            timestamp: record.updated,
            corpus_tag: submission.corpus_tag.clone(),
            score_type: record.score_type,
            precision: record.score.precision,
            recall: record.score.recall,
            f1: record.score.f1,
            precision_range: [record.left.precision, record.right.precision],
            recall_range: [record.left.recall, record.right.recall],
            f1_range: [record.left.f1, record.right.f1],
        }
    }
}

/// Active submissions with their latest score, best F1 first
pub async fn leaderboard(store: &dyn KbStore, score_type: ScoreType) -> Result<Vec<LeaderboardEntry>> {
    let mut rows = Vec::new();
    for submission in store.list_submissions().await? {
        if !submission.active || submission.state.is_terminal() {
            continue;
        }
        if let Some(record) = store.latest_score(submission.id, score_type).await? {
            rows.push(LeaderboardEntry::new(&submission, &record));
        }
    }
    rows.sort_by(|a, b| b.f1.total_cmp(&a.f1).then_with(|| a.name.cmp(&b.name)));
    Ok(rows)
}

/// Leaderboard rows cached per score type until the next scoring run
#[derive(Clone)]
pub struct LeaderboardCache {
    cache: Cache<ScoreType, Arc<Vec<LeaderboardEntry>>>,
    hits: Arc<AtomicU64>,
    misses: Arc<AtomicU64>,
}

impl LeaderboardCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            cache: Cache::builder().max_capacity(8).time_to_live(ttl).build(),
            hits: Arc::new(AtomicU64::new(0)),
            misses: Arc::new(AtomicU64::new(0)),
        }
    }

    pub async fn get(
        &self,
        store: &dyn KbStore,
        score_type: ScoreType,
    ) -> Result<Arc<Vec<LeaderboardEntry>>> {
        if let Some(rows) = self.cache.get(&score_type).await {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(rows);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        let rows = Arc::new(leaderboard(store, score_type).await?);
        self.cache.insert(score_type, Arc::clone(&rows)).await;
        Ok(rows)
    }

    pub async fn invalidate(&self) {
        self.cache.invalidate_all();
        self.cache.run_pending_tasks().await;
    }

    /// `(hits, misses)`
    pub fn stats(&self) -> (u64, u64) {
        (
            self.hits.load(Ordering::Relaxed),
            self.misses.load(Ordering::Relaxed),
        )
    }
}

impl Default for LeaderboardCache {
    fn default() -> Self {
        Self::new(Duration::from_secs(300))
    }
}

/// Latest rows per submission for every score type
pub async fn latest_scores(store: &dyn KbStore, submission_id: Uuid) -> Result<BTreeMap<String, ScoreRecord>> {
    let mut latest = BTreeMap::new();
    for st in [ScoreType::Entity, ScoreType::Relation] {
        if let Some(record) = store.latest_score(submission_id, st).await? {
            latest.insert(st.to_string(), record);
        }
    }
    Ok(latest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use kbpo_core::{Provenance, RelationLabel, Score};

    fn span(b: usize, e: usize) -> Provenance {
        Provenance::new("d1", b, e)
    }

    fn kb_with(label: RelationLabel) -> KnowledgeBase {
        let mut kb = KnowledgeBase::new();
        let r = RelationInstance::new(span(0, 5), label, span(10, 14));
        kb.relations.insert(r.pair(), r);
        kb
    }

    #[test]
    fn test_sample_label_orientation() {
        let kb = kb_with(RelationLabel::PerEmployeeOrMemberOf);
        let key = (span(0, 5), span(10, 14));

        let mut v = VerdictSet::new("q");
        assert_eq!(sample_label(&kb, &key, &v), None);

        v.relations = vec![RelationInstance::new(
            span(10, 14),
            RelationLabel::OrgEmployeesOrMembers,
            span(0, 5),
        )];
        assert_eq!(sample_label(&kb, &key, &v), Some(1.0));

        v.relations = vec![RelationInstance::new(span(0, 5), RelationLabel::NoRelation, span(10, 14))];
        assert_eq!(sample_label(&kb, &key, &v), Some(0.0));

        v.relations = vec![RelationInstance::new(
            span(0, 5),
            RelationLabel::PerSchoolsAttended,
            span(10, 14),
        )];
        assert_eq!(sample_label(&kb, &key, &v), Some(0.0));
    }

    #[test]
    fn test_emits() {
        let kb = kb_with(RelationLabel::PerEmployeeOrMemberOf);
        let judged = RelationInstance::new(span(10, 14), RelationLabel::OrgEmployeesOrMembers, span(0, 5));
        assert!(emits(&kb, &judged));
        let other = RelationInstance::new(span(0, 5), RelationLabel::PerTitle, span(10, 14));
        assert!(!emits(&kb, &other));
    }

    #[test]
    fn test_leaderboard_entry_ranges() {
        let submission = Submission::new("run1", "kbp2016");
        let record = ScoreRecord {
            submission_id: submission.id,
            score_type: ScoreType::Entity,
            score: Score::new(0.5, 0.25),
            left: Score::new(0.4, 0.2),
            right: Score::new(0.6, 0.3),
            updated: Utc::now(),
        };
        let row = LeaderboardEntry::new(&submission, &record);
        assert_eq!(row.precision_range, [0.4, 0.6]);
        assert_eq!(row.recall_range, [0.2, 0.3]);
        assert!((row.f1 - Score::new(0.5, 0.25).f1).abs() < 1e-12);
    }
}
