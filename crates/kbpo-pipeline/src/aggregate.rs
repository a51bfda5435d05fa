//! Verdict aggregation
//!
//! Merges the redundant crowd responses of one question into verdicts.
//!
//! Mentions are the delicate part because annotators disagree on span
//! boundaries. Every observed `(span, type)` row is credited with the number
//! of assignments that marked a span containing it. Rows are then swept in
//! document order: within a run of overlapping rows the widest row credited
//! by a strict majority wins and the other rows are folded into it. A
//! winner's weight is its credited share `count / D`, except that when a
//! strict majority marked exactly the winning span the weight is that exact
//! share, so a minority answering a strictly wider span lowers it.
//!
//! Links and relations are plain majority votes over their `(span)` and
//! `(subject, object)` groups.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use kbpo_core::{
    KbpoError, Link, Mention, MentionType, Provenance, RelationInstance, RelationLabel,
    ResponseSet, Result, VerdictSet,
};
use tracing::debug;

// ============================================================================
// Helpers
// ============================================================================

/// Judgments requested per question: the most common `max_assignments`
/// among the responses, never fewer than the responses received
pub fn judgment_count(responses: &[ResponseSet]) -> usize {
    let mut freq: BTreeMap<u32, usize> = BTreeMap::new();
    for r in responses {
        *freq.entry(r.max_assignments).or_default() += 1;
    }
    let mode = freq
        .iter()
        .max_by(|a, b| a.1.cmp(b.1).then(a.0.cmp(b.0)))
        .map(|(k, _)| *k as usize)
        .unwrap_or(0);
    mode.max(responses.len())
}

/// Size of a clique with `pairs` edges: solves `n(n-1)/2 = pairs`
pub fn clique_size(pairs: usize) -> usize {
    (0.5 + (0.25 + 2.0 * pairs as f64).sqrt()).round() as usize
}

/// Most frequent value; ties go to the smallest
fn majority<T: Ord + Clone>(values: impl IntoIterator<Item = T>) -> Option<T> {
    let mut freq: BTreeMap<T, usize> = BTreeMap::new();
    for v in values {
        *freq.entry(v).or_default() += 1;
    }
    freq.into_iter()
        .max_by(|a, b| a.1.cmp(&b.1).then(b.0.cmp(&a.0)))
        .map(|(v, _)| v)
}

// ============================================================================
// Mentions
// ============================================================================

/// One distinct `(span, type)` and the mentions that chose it exactly
struct Row<'a> {
    span: Provenance,
    mention_type: MentionType,
    count: usize,
    exact: Vec<&'a Mention>,
}

/// A run of overlapping rows
struct Window {
    rows: Vec<usize>,
    winner: Option<usize>,
    end: usize,
}

fn mention_rows(responses: &[ResponseSet]) -> Vec<Row<'_>> {
    // (span, type) -> (assignment index, mention), one vote per assignment
    let mut votes: BTreeMap<(&Provenance, MentionType), Vec<(usize, &Mention)>> = BTreeMap::new();
    for (a, response) in responses.iter().enumerate() {
        for m in &response.mentions {
            let entry = votes.entry((&m.provenance, m.mention_type)).or_default();
            if !entry.iter().any(|(voter, _)| *voter == a) {
                entry.push((a, m));
            }
        }
    }

    votes
        .iter()
        .map(|((span, mention_type), exact)| {
            // Self-join: pairs of distinct assignments whose spans contain this one
            let supporters: Vec<usize> = votes
                .iter()
                .filter(|((other, t), _)| t == mention_type && other.contains(span))
                .flat_map(|(_, vs)| vs.iter().map(|(a, _)| *a))
                .collect::<BTreeSet<usize>>()
                .into_iter()
                .collect();
            let pairs: BTreeSet<(usize, usize)> = supporters
                .iter()
                .flat_map(|a| supporters.iter().filter(move |b| a < *b).map(move |b| (*a, *b)))
                .collect();
            Row {
                span: (*span).clone(),
                mention_type: *mention_type,
                count: clique_size(pairs.len()),
                exact: exact.iter().map(|(_, m)| *m).collect(),
            }
        })
        .collect()
}

fn sweep(rows: &[Row<'_>], judgments: usize) -> Vec<Window> {
    let mut windows = Vec::new();
    let mut current: Option<Window> = None;

    for (i, row) in rows.iter().enumerate() {
        if let Some(window) = &current {
            let first = &rows[window.rows[0]];
            let closed = row.span.doc_id != first.span.doc_id
                || match window.winner {
                    Some(w) => !row.span.overlaps(&rows[w].span),
                    None => row.span.begin >= window.end,
                };
            if closed {
                windows.extend(current.take());
            }
        }
        let window = current.get_or_insert_with(|| Window {
            rows: Vec::new(),
            winner: None,
            end: 0,
        });
        window.rows.push(i);
        window.end = window.end.max(row.span.end);

        if 2 * row.count > judgments {
            let wider = window
                .winner
                .map(|w| row.span.len() > rows[w].span.len())
                .unwrap_or(true);
            if wider {
                window.winner = Some(i);
            }
        }
    }
    windows.extend(current);
    windows
}

/// Exact share when the exact span has a majority, else the credited share
fn mention_weight(row: &Row<'_>, judgments: usize) -> f64 {
    let support = if 2 * row.exact.len() > judgments {
        row.exact.len()
    } else {
        row.count
    };
    support.min(judgments) as f64 / judgments as f64
}

fn merge_mentions(
    responses: &[ResponseSet],
    judgments: usize,
) -> (Vec<Mention>, HashMap<Provenance, Provenance>) {
    let rows = mention_rows(responses);
    let windows = sweep(&rows, judgments);

    // Fold every row overlapping a winner into it
    let mut folded: HashMap<Provenance, Provenance> = HashMap::new();
    let mut winners: Vec<(usize, Vec<usize>)> = Vec::new();
    for window in &windows {
        let Some(w) = window.winner else { continue };
        let members: Vec<usize> = window
            .rows
            .iter()
            .copied()
            .filter(|&i| rows[i].span.overlaps(&rows[w].span))
            .collect();
        for &i in &members {
            folded.insert(rows[i].span.clone(), rows[w].span.clone());
        }
        winners.push((w, members));
    }
    let kept: BTreeSet<&Provenance> = winners.iter().map(|(w, _)| &rows[*w].span).collect();

    let mentions = winners
        .iter()
        .map(|(w, members)| {
            let row = &rows[*w];
            let gloss = majority(row.exact.iter().map(|m| m.gloss.clone())).unwrap_or_default();
            let canonical = majority(
                members
                    .iter()
                    .flat_map(|&i| rows[i].exact.iter())
                    .map(|m| folded.get(&m.canonical).unwrap_or(&m.canonical).clone()),
            )
            .filter(|c| kept.contains(c))
            .unwrap_or_else(|| row.span.clone());
            Mention::new(row.span.clone(), row.mention_type, gloss)
                .with_canonical(canonical)
                .with_weight(mention_weight(row, judgments))
        })
        .collect();

    (mentions, folded)
}

// ============================================================================
// Links and Relations
// ============================================================================

fn merge_links(responses: &[ResponseSet], folded: &HashMap<Provenance, Provenance>) -> Vec<Link> {
    let mut votes: BTreeMap<(Provenance, String, Option<bool>), f64> = BTreeMap::new();
    let mut totals: BTreeMap<Provenance, f64> = BTreeMap::new();
    for link in responses.iter().flat_map(|r| &r.links) {
        let span = folded.get(&link.provenance).unwrap_or(&link.provenance).clone();
        *votes
            .entry((span.clone(), link.link_name.clone(), link.correct))
            .or_default() += link.weight;
        *totals.entry(span).or_default() += link.weight;
    }

    votes
        .into_iter()
        .filter_map(|((span, name, correct), weight)| {
            let total = totals.get(&span).copied().unwrap_or(0.0);
            let share = if total > 0.0 { weight / total } else { 0.0 };
            (share > 0.5).then(|| {
                let mut link = Link::new(span, name, share);
                link.correct = correct;
                link
            })
        })
        .collect()
}

fn merge_relations(responses: &[ResponseSet]) -> Vec<RelationInstance> {
    let mut votes: BTreeMap<(Provenance, Provenance), BTreeMap<RelationLabel, f64>> =
        BTreeMap::new();
    for r in responses.iter().flat_map(|r| &r.relations) {
        *votes
            .entry(r.pair())
            .or_default()
            .entry(r.label)
            .or_default() += r.weight;
    }

    votes
        .into_iter()
        .filter_map(|((subject, object), labels)| {
            let total: f64 = labels.values().sum();
            labels.into_iter().find_map(|(label, weight)| {
                let share = if total > 0.0 { weight / total } else { 0.0 };
                (share > 0.5).then(|| {
                    RelationInstance::new(subject.clone(), label, object.clone()).with_weight(share)
                })
            })
        })
        .collect()
}

// ============================================================================
// Entry Point
// ============================================================================

/// Merge one question's responses into its verdicts
pub fn aggregate(question_id: &str, responses: &[ResponseSet]) -> Result<VerdictSet> {
    if responses.is_empty() {
        return Err(KbpoError::Aggregation(format!(
            "no responses for question {question_id}"
        )));
    }
    let judgments = judgment_count(responses);

    let (mentions, folded) = merge_mentions(responses, judgments);
    let mut verdicts = VerdictSet::new(question_id);
    verdicts.mentions = mentions;
    verdicts.links = merge_links(responses, &folded);
    verdicts.relations = merge_relations(responses);

    debug!(
        question_id,
        responses = responses.len(),
        judgments,
        mentions = verdicts.mentions.len(),
        links = verdicts.links.len(),
        relations = verdicts.relations.len(),
        "aggregated question"
    );
    Ok(verdicts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn span(b: usize, e: usize) -> Provenance {
        Provenance::new("d1", b, e)
    }

    fn response(id: &str, mentions: Vec<Mention>) -> ResponseSet {
        let mut r = ResponseSet::new(id, "q1", 3);
        r.mentions = mentions;
        r
    }

    fn per(b: usize, e: usize, gloss: &str) -> Mention {
        Mention::new(span(b, e), MentionType::Per, gloss)
    }

    #[test]
    fn test_clique_size() {
        assert_eq!(clique_size(0), 1);
        assert_eq!(clique_size(1), 2);
        assert_eq!(clique_size(3), 3);
        assert_eq!(clique_size(10), 5);
    }

    #[test]
    fn test_judgment_count_is_mode() {
        let mut rs = vec![response("a", vec![]), response("b", vec![])];
        rs.push({
            let mut r = response("c", vec![]);
            r.max_assignments = 5;
            r
        });
        assert_eq!(judgment_count(&rs), 3);
        assert_eq!(judgment_count(&rs[..1]), 3);
    }

    #[test]
    fn test_no_responses_is_an_error() {
        assert!(matches!(aggregate("q1", &[]), Err(KbpoError::Aggregation(_))));
    }

    #[test]
    fn test_unanimous_mention() {
        let rs: Vec<ResponseSet> = ["a", "b", "c"]
            .iter()
            .map(|id| response(id, vec![per(0, 5, "Alice")]))
            .collect();
        let v = aggregate("q1", &rs).unwrap();
        assert_eq!(v.mentions.len(), 1);
        let m = &v.mentions[0];
        assert_eq!(m.provenance, span(0, 5));
        assert_eq!(m.gloss, "Alice");
        assert!((m.weight - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_containing_outlier_lowers_weight() {
        let rs = vec![
            response("a", vec![per(0, 5, "Alice")]),
            response("b", vec![per(0, 5, "Alice")]),
            response("c", vec![per(0, 11, "Alice Smith")]),
        ];
        let v = aggregate("q1", &rs).unwrap();
        assert_eq!(v.mentions.len(), 1);
        assert_eq!(v.mentions[0].provenance, span(0, 5));
        assert!((v.mentions[0].weight - 2.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_overlapping_spans_merge() {
        let rs = vec![
            response("a", vec![per(10, 20, "John Smith")]),
            response("b", vec![per(10, 15, "John")]),
            response("c", vec![per(10, 20, "John Smith")]),
        ];
        let v = aggregate("q1", &rs).unwrap();
        assert_eq!(v.mentions.len(), 1);
        let m = &v.mentions[0];
        assert_eq!(m.provenance, span(10, 20));
        assert_eq!(m.mention_type, MentionType::Per);
        assert_eq!(m.gloss, "John Smith");
        assert_eq!(m.canonical, span(10, 20));
        assert!((m.weight - 2.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_nested_spans_keep_credited_winner() {
        let rs = vec![
            response("a", vec![per(10, 15, "John")]),
            response("b", vec![per(10, 18, "John Sm")]),
            response("c", vec![per(10, 20, "John Smith")]),
        ];
        let v = aggregate("q1", &rs).unwrap();
        assert_eq!(v.mentions.len(), 1);
        let m = &v.mentions[0];
        // [10,18) is the widest span contained in two of three answers
        assert_eq!(m.provenance, span(10, 18));
        assert_eq!(m.gloss, "John Sm");
        assert!((m.weight - 2.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_minority_mention_dropped() {
        let rs = vec![
            response("a", vec![per(0, 5, "Alice"), per(30, 35, "Carol")]),
            response("b", vec![per(0, 5, "Alice")]),
            response("c", vec![per(0, 5, "Alice")]),
        ];
        let v = aggregate("q1", &rs).unwrap();
        assert_eq!(v.mentions.len(), 1);
        assert_eq!(v.mentions[0].provenance, span(0, 5));
    }

    #[test]
    fn test_canonical_rewritten_to_winner() {
        let she = |c: Provenance| {
            Mention::new(span(40, 43), MentionType::Per, "she").with_canonical(c)
        };
        let rs = vec![
            response("a", vec![per(10, 20, "John Smith"), she(span(10, 20))]),
            response("b", vec![per(10, 15, "John"), she(span(10, 15))]),
            response("c", vec![per(10, 20, "John Smith"), she(span(10, 15))]),
        ];
        let v = aggregate("q1", &rs).unwrap();
        let m = v.mentions.iter().find(|m| m.provenance == span(40, 43)).unwrap();
        assert_eq!(m.canonical, span(10, 20));
    }

    #[test]
    fn test_link_majority() {
        let mut rs = Vec::new();
        for (id, name, correct) in [("a", "wiki:A", true), ("b", "wiki:A", true), ("c", "wiki:A", false)] {
            let mut r = response(id, vec![per(0, 5, "Alice")]);
            let mut link = Link::new(span(0, 5), name, 1.0);
            link.correct = Some(correct);
            r.links.push(link);
            rs.push(r);
        }
        let v = aggregate("q1", &rs).unwrap();
        assert_eq!(v.links.len(), 1);
        assert_eq!(v.links[0].correct, Some(true));
        assert!((v.links[0].weight - 2.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_relation_majority() {
        let rel = |label| RelationInstance::new(span(0, 5), label, span(10, 14));
        let mut rs = Vec::new();
        for (id, label) in [
            ("a", RelationLabel::PerEmployeeOrMemberOf),
            ("b", RelationLabel::PerEmployeeOrMemberOf),
            ("c", RelationLabel::NoRelation),
        ] {
            let mut r = response(id, vec![]);
            r.relations.push(rel(label));
            rs.push(r);
        }
        let v = aggregate("q1", &rs).unwrap();
        assert_eq!(v.relations.len(), 1);
        assert_eq!(v.relations[0].label, RelationLabel::PerEmployeeOrMemberOf);

        // A three-way split has no majority
        rs[1].relations[0].label = RelationLabel::PerSchoolsAttended;
        let v = aggregate("q1", &rs).unwrap();
        assert!(v.relations.is_empty());
    }

    fn arb_mention() -> impl Strategy<Value = Mention> {
        (0usize..30, 1usize..8, 0usize..2, prop::sample::select(vec!["a", "b", "c"])).prop_map(
            |(b, len, t, gloss)| {
                let ty = if t == 0 { MentionType::Per } else { MentionType::Org };
                Mention::new(span(b, b + len), ty, gloss)
            },
        )
    }

    fn arb_responses() -> impl Strategy<Value = Vec<ResponseSet>> {
        prop::collection::vec(prop::collection::vec(arb_mention(), 0..6), 1..5).prop_map(|sets| {
            sets.into_iter()
                .enumerate()
                .map(|(i, ms)| response(&format!("a{i}"), ms))
                .collect()
        })
    }

    proptest! {
        #[test]
        fn test_aggregation_is_idempotent(rs in arb_responses()) {
            let first = aggregate("q1", &rs).unwrap();
            let second = aggregate("q1", &rs).unwrap();
            prop_assert!(first.same_contents(&second));

            let mut reversed = rs.clone();
            reversed.reverse();
            let third = aggregate("q1", &reversed).unwrap();
            prop_assert!(first.same_contents(&third));
        }

        #[test]
        fn test_verdict_invariants(rs in arb_responses()) {
            let v = aggregate("q1", &rs).unwrap();
            let spans: BTreeSet<&Provenance> = v.mentions.iter().map(|m| &m.provenance).collect();
            prop_assert_eq!(spans.len(), v.mentions.len());
            for m in &v.mentions {
                prop_assert!(m.weight > 0.5 && m.weight <= 1.0);
            }
        }
    }
}
