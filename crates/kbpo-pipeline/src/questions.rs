//! Question materialization
//!
//! A question is identified by the SHA-256 of its canonical parameter JSON,
//! so the same annotation unit drawn twice (by two submissions, or twice by
//! one) is only ever asked once. Relation questions whose label has an
//! inverse are stored with the lexicographically smaller span first.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use chrono::Utc;
use kbpo_core::store::{DocumentSample, Question, QuestionBatch, SubmissionSample};
use kbpo_core::{
    BatchType, KnowledgeBase, Mention, MentionType, Provenance, QuestionState, VerdictSet,
};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use uuid::Uuid;

// ============================================================================
// Identity
// ============================================================================

/// Serialize with object keys in sorted order
///
/// `Value::to_string` follows map insertion order once any crate in the
/// build enables serde_json's `preserve_order`, which would change ids.
pub fn canonical_json(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let sorted: BTreeMap<&String, &Value> = map.iter().collect();
            let fields: Vec<String> = sorted
                .into_iter()
                .map(|(k, v)| format!("{}:{}", Value::String(k.clone()), canonical_json(v)))
                .collect();
            format!("{{{}}}", fields.join(","))
        }
        Value::Array(items) => {
            let items: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", items.join(","))
        }
        other => other.to_string(),
    }
}

/// Content hash of question parameters
pub fn question_id(params: &Value) -> String {
    format!("{:x}", Sha256::digest(canonical_json(params).as_bytes()))
}

fn offsets(span: &Provenance) -> Value {
    json!([span.begin, span.end])
}

/// Parameters of a relation question over one mention pair
pub fn relation_params(batch_type: BatchType, subject: &Provenance, object: &Provenance) -> Value {
    json!({
        "batch_type": batch_type.as_str(),
        "doc_id": subject.doc_id,
        "subject": offsets(subject),
        "object": offsets(object),
    })
}

/// Parameters of an exhaustive entity question over one document
pub fn document_params(doc_id: &str) -> Value {
    json!({
        "batch_type": BatchType::ExhaustiveEntities.as_str(),
        "doc_id": doc_id,
    })
}

/// Order a pair for asking: symmetric pairs put the smaller span first
pub fn canonical_pair(
    subject: &Provenance,
    object: &Provenance,
    symmetric: bool,
) -> (Provenance, Provenance) {
    if symmetric && object < subject {
        (object.clone(), subject.clone())
    } else {
        (subject.clone(), object.clone())
    }
}

/// Id of the selective question that judges a sampled instance
pub fn selective_question_id(kb: &KnowledgeBase, subject: &Provenance, object: &Provenance) -> String {
    let symmetric = kb
        .relation(subject, object)
        .map(|r| r.label.has_inverse())
        .unwrap_or(false);
    let (s, o) = canonical_pair(subject, object, symmetric);
    question_id(&relation_params(BatchType::SelectiveRelations, &s, &o))
}

/// Read the `(doc_id, subject, object)` back out of relation parameters
pub fn pair_of(params: &Value) -> Option<(Provenance, Provenance)> {
    let doc_id = params.get("doc_id")?.as_str()?;
    let span = |key: &str| -> Option<Provenance> {
        let pair = params.get(key)?.as_array()?;
        let begin = pair.first()?.as_u64()? as usize;
        let end = pair.get(1)?.as_u64()? as usize;
        Some(Provenance::new(doc_id, begin, end))
    };
    Some((span("subject")?, span("object")?))
}

// ============================================================================
// Batches
// ============================================================================

/// Submission a selective question batch was drawn for
pub fn batch_submission(batch: &QuestionBatch) -> Option<Uuid> {
    batch
        .params
        .get("submission_id")
        .and_then(Value::as_str)
        .and_then(|s| s.parse().ok())
}

/// A question batch and the questions it introduces
#[derive(Debug, Clone)]
pub struct QuestionPlan {
    pub batch: QuestionBatch,
    pub questions: Vec<Question>,
}

impl QuestionPlan {
    pub fn new(batch_type: BatchType, sample_batch_id: Option<Uuid>, params: Value) -> Self {
        Self {
            batch: QuestionBatch {
                id: Uuid::new_v4(),
                batch_type,
                sample_batch_id,
                params,
                created_at: Utc::now(),
            },
            questions: Vec::new(),
        }
    }

    /// Add a question unless one with the same id is already planned
    pub fn push(&mut self, params: Value) -> bool {
        let id = question_id(&params);
        if self.questions.iter().any(|q| q.id == id) {
            return false;
        }
        self.questions.push(Question {
            id,
            batch_id: self.batch.id,
            batch_type: self.batch.batch_type,
            params,
            state: QuestionState::PendingTurking,
            message: None,
            created_at: Utc::now(),
        });
        true
    }

    pub fn ids(&self) -> Vec<String> {
        self.questions.iter().map(|q| q.id.clone()).collect()
    }

    /// Drop questions already asked in an earlier batch
    pub fn retain_new(&mut self, existing: &HashSet<String>) {
        self.questions.retain(|q| !existing.contains(&q.id));
    }

    pub fn is_empty(&self) -> bool {
        self.questions.is_empty()
    }
}

/// Selective relation questions for a submission sample
pub fn selective_questions(
    kb: &KnowledgeBase,
    sample_batch_id: Uuid,
    samples: &[SubmissionSample],
) -> QuestionPlan {
    let submission_id = samples.first().map(|s| s.submission_id);
    let mut plan = QuestionPlan::new(
        BatchType::SelectiveRelations,
        Some(sample_batch_id),
        json!({ "sample_batch_id": sample_batch_id, "submission_id": submission_id }),
    );
    for sample in samples {
        let symmetric = kb
            .relation(&sample.subject, &sample.object)
            .map(|r| r.label.has_inverse())
            .unwrap_or(false);
        let (s, o) = canonical_pair(&sample.subject, &sample.object, symmetric);
        plan.push(relation_params(BatchType::SelectiveRelations, &s, &o));
    }
    plan
}

/// Exhaustive entity questions, one per sampled document
pub fn entity_questions(sample_batch_id: Uuid, samples: &[DocumentSample]) -> QuestionPlan {
    let mut plan = QuestionPlan::new(
        BatchType::ExhaustiveEntities,
        Some(sample_batch_id),
        json!({ "sample_batch_id": sample_batch_id }),
    );
    for sample in samples {
        plan.push(document_params(&sample.doc_id));
    }
    plan
}

// ============================================================================
// Exhaustive Relation Candidates
// ============================================================================

/// Subject/object types worth asking about
pub fn admissible_pair(subject: MentionType, object: MentionType) -> bool {
    match subject {
        MentionType::Per => true,
        MentionType::Org => !matches!(object, MentionType::Per | MentionType::Title),
        _ => false,
    }
}

/// Entity attributes a candidate pair is compared on
struct EntityView<'a> {
    mention: &'a Mention,
    gloss: String,
    link: Option<&'a str>,
}

impl EntityView<'_> {
    /// Mentions of the same entity are never paired
    fn same_entity(&self, other: &EntityView<'_>) -> bool {
        if self.gloss.eq_ignore_ascii_case(&other.gloss) {
            return true;
        }
        matches!((self.link, other.link), (Some(a), Some(b)) if a == b)
    }
}

/// Exhaustive relation questions over the mention pairs of judged documents
pub fn relation_questions(sample_batch_id: Option<Uuid>, verdicts: &[VerdictSet]) -> QuestionPlan {
    let mut plan = QuestionPlan::new(
        BatchType::ExhaustiveRelations,
        sample_batch_id,
        json!({ "source": BatchType::ExhaustiveEntities.as_str() }),
    );

    for verdict in verdicts {
        let canonical: BTreeMap<&Provenance, &Mention> =
            verdict.mentions.iter().map(|m| (&m.provenance, m)).collect();
        let links: BTreeMap<&Provenance, &str> = verdict
            .links
            .iter()
            .filter(|l| l.correct != Some(false))
            .map(|l| (&l.provenance, l.link_name.as_str()))
            .collect();

        let views: Vec<EntityView<'_>> = verdict
            .mentions
            .iter()
            .map(|m| {
                let gloss = canonical
                    .get(&m.canonical)
                    .map(|c| c.gloss.clone())
                    .unwrap_or_else(|| m.gloss.clone());
                EntityView {
                    mention: m,
                    gloss,
                    link: links.get(&m.canonical).copied(),
                }
            })
            .collect();

        let mut asked: BTreeSet<(Provenance, Provenance)> = BTreeSet::new();
        for a in &views {
            for b in &views {
                if a.mention.provenance == b.mention.provenance || a.same_entity(b) {
                    continue;
                }
                let forward = admissible_pair(a.mention.mention_type, b.mention.mention_type);
                let backward = admissible_pair(b.mention.mention_type, a.mention.mention_type);
                if !forward {
                    continue;
                }
                let (s, o) =
                    canonical_pair(&a.mention.provenance, &b.mention.provenance, backward);
                if asked.insert((s.clone(), o.clone())) {
                    plan.push(relation_params(BatchType::ExhaustiveRelations, &s, &o));
                }
            }
        }
    }
    plan
}

#[cfg(test)]
mod tests {
    use super::*;
    use kbpo_core::{Link, RelationInstance, RelationLabel};

    fn span(b: usize, e: usize) -> Provenance {
        Provenance::new("d1", b, e)
    }

    #[test]
    fn test_question_id_ignores_key_order() {
        let a: Value = serde_json::from_str(r#"{"doc_id":"d1","batch_type":"x"}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"batch_type":"x","doc_id":"d1"}"#).unwrap();
        assert_eq!(question_id(&a), question_id(&b));
        assert_eq!(question_id(&a).len(), 64);
        assert_ne!(question_id(&a), question_id(&document_params("d2")));
    }

    #[test]
    fn test_canonical_json_sorts_nested_keys() {
        let v = json!({"b": {"z": 1, "a": [2, {"y": null, "x": "s"}]}, "a": true});
        assert_eq!(
            canonical_json(&v),
            r#"{"a":true,"b":{"a":[2,{"x":"s","y":null}],"z":1}}"#
        );
    }

    #[test]
    fn test_symmetric_pairs_share_a_question() {
        let mut kb = KnowledgeBase::new();
        let (alice, bob) = (span(0, 5), span(10, 13));
        let r = RelationInstance::new(alice.clone(), RelationLabel::PerSiblings, bob.clone());
        kb.relations.insert(r.pair(), r.clone());
        let inverse = r.inverted(RelationLabel::PerSiblings);
        kb.relations.insert(inverse.pair(), inverse);

        let id1 = selective_question_id(&kb, &alice, &bob);
        let id2 = selective_question_id(&kb, &bob, &alice);
        assert_eq!(id1, id2);

        let batch = Uuid::new_v4();
        let samples: Vec<SubmissionSample> = [(alice.clone(), bob.clone()), (bob, alice)]
            .into_iter()
            .map(|(subject, object)| SubmissionSample {
                batch_id: batch,
                submission_id: Uuid::new_v4(),
                doc_id: "d1".to_string(),
                subject,
                object,
                created_at: Utc::now(),
            })
            .collect();
        let plan = selective_questions(&kb, batch, &samples);
        assert_eq!(plan.questions.len(), 1);
        assert_eq!(plan.questions[0].id, id1);
        assert_eq!(batch_submission(&plan.batch), Some(samples[0].submission_id));
        assert_eq!(
            pair_of(&plan.questions[0].params),
            Some((span(0, 5), span(10, 13)))
        );
    }

    #[test]
    fn test_asymmetric_pair_keeps_orientation() {
        let mut kb = KnowledgeBase::new();
        let r = RelationInstance::new(span(10, 13), RelationLabel::PerTitle, span(0, 5));
        kb.relations.insert(r.pair(), r);
        let (s, o) = pair_of(&relation_params(
            BatchType::SelectiveRelations,
            &span(10, 13),
            &span(0, 5),
        ))
        .unwrap();
        assert_eq!((s, o), (span(10, 13), span(0, 5)));
        assert_ne!(
            selective_question_id(&kb, &span(10, 13), &span(0, 5)),
            selective_question_id(&kb, &span(0, 5), &span(10, 13))
        );
    }

    #[test]
    fn test_retain_new_drops_asked_questions() {
        let mut plan = entity_questions(
            Uuid::new_v4(),
            &["d1", "d2", "d1"]
                .iter()
                .map(|d| DocumentSample {
                    batch_id: Uuid::nil(),
                    doc_id: d.to_string(),
                    created_at: Utc::now(),
                })
                .collect::<Vec<_>>(),
        );
        assert_eq!(plan.questions.len(), 2);
        let asked: HashSet<String> = [question_id(&document_params("d1"))].into();
        plan.retain_new(&asked);
        assert_eq!(plan.questions.len(), 1);
        assert_eq!(plan.questions[0].params["doc_id"], "d2");
    }

    #[test]
    fn test_admissible_pairs() {
        assert!(admissible_pair(MentionType::Per, MentionType::Title));
        assert!(admissible_pair(MentionType::Org, MentionType::Gpe));
        assert!(!admissible_pair(MentionType::Org, MentionType::Per));
        assert!(!admissible_pair(MentionType::Gpe, MentionType::Per));
    }

    #[test]
    fn test_relation_candidates() {
        let mut verdict = VerdictSet::new("q");
        let alice = Mention::new(span(0, 5), MentionType::Per, "Alice");
        let she = Mention::new(span(30, 33), MentionType::Per, "she").with_canonical(span(0, 5));
        let acme = Mention::new(span(10, 14), MentionType::Org, "Acme");
        let ibm = Mention::new(span(40, 43), MentionType::Org, "IBM");
        verdict.mentions = vec![alice, acme, she, ibm];
        verdict.links = vec![Link::new(span(0, 5), "wiki:Alice", 1.0)];

        let plan = relation_questions(None, &[verdict]);
        let pairs: BTreeSet<(Provenance, Provenance)> =
            plan.questions.iter().filter_map(|q| pair_of(&q.params)).collect();

        // Alice and "she" are one entity; PER subjects pair with both ORGs
        assert!(!pairs.contains(&(span(0, 5), span(30, 33))));
        assert!(pairs.contains(&(span(0, 5), span(10, 14))));
        assert!(pairs.contains(&(span(30, 33), span(40, 43))));
        // ORG-PER is never asked; ORG-ORG once in canonical order
        assert!(!pairs.contains(&(span(10, 14), span(0, 5))));
        assert!(pairs.contains(&(span(10, 14), span(40, 43))));
        assert!(!pairs.contains(&(span(40, 43), span(10, 14))));
        assert_eq!(pairs.len(), 5);
        assert!(plan
            .questions
            .iter()
            .all(|q| q.batch_type == BatchType::ExhaustiveRelations));
    }
}
