//! Sampling distributions
//!
//! Every distribution is an explicit `(support, weights)` pair, normalized
//! when it is built. Submission distributions range over a submission's
//! canonical relation instances; document distributions range over the
//! corpus and drive exhaustive annotation.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::hash::Hash;

use kbpo_core::store::Document;
use kbpo_core::{
    DistributionKind, KbpoError, KnowledgeBase, Provenance, RelationInstance, Result,
};
use tracing::debug;

/// Largest tolerated deviation of the total mass from 1
pub const NORMALIZATION_TOLERANCE: f64 = 1e-6;

/// A relation instance as `(subject, object)`; the subject names the document
pub type InstanceKey = (Provenance, Provenance);

// ============================================================================
// Mass Functions
// ============================================================================

/// Possibly unnormalized mass over items
pub trait Mass<K> {
    fn mass(&self, item: &K) -> f64;
}

/// The same mass for every item
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Flat;

impl<K> Mass<K> for Flat {
    fn mass(&self, _item: &K) -> f64 {
        1.0
    }
}

// ============================================================================
// Distribution
// ============================================================================

/// A normalized discrete distribution with finite support
#[derive(Debug, Clone)]
pub struct Distribution<K> {
    support: Vec<K>,
    weights: Vec<f64>,
    index: HashMap<K, usize>,
}

impl<K: Eq + Hash + Clone> Distribution<K> {
    /// Normalize non-negative masses. Repeated items accumulate; items with
    /// zero mass are left out of the support.
    pub fn from_masses(masses: impl IntoIterator<Item = (K, f64)>) -> Result<Self> {
        let mut support = Vec::new();
        let mut weights: Vec<f64> = Vec::new();
        let mut index = HashMap::new();

        for (item, mass) in masses {
            if !mass.is_finite() || mass < 0.0 {
                return Err(KbpoError::Sampling(format!("invalid mass {mass}")));
            }
            if mass == 0.0 {
                continue;
            }
            match index.get(&item) {
                Some(&i) => weights[i] += mass,
                None => {
                    index.insert(item.clone(), support.len());
                    support.push(item);
                    weights.push(mass);
                }
            }
        }

        let total: f64 = weights.iter().sum();
        if support.is_empty() || total <= 0.0 {
            return Err(KbpoError::Sampling("empty support".to_string()));
        }
        for w in &mut weights {
            *w /= total;
        }

        let distribution = Self {
            support,
            weights,
            index,
        };
        distribution.check_normalized()?;
        Ok(distribution)
    }

    /// Equal probability on each distinct item
    pub fn uniform(items: impl IntoIterator<Item = K>) -> Result<Self> {
        let mut seen = HashSet::new();
        let distinct: Vec<(K, f64)> = items
            .into_iter()
            .filter(|item| seen.insert(item.clone()))
            .map(|item| (item, 1.0))
            .collect();
        Self::from_masses(distinct)
    }

    /// Probability of `item`; 0 outside the support
    pub fn prob(&self, item: &K) -> f64 {
        self.index.get(item).map(|&i| self.weights[i]).unwrap_or(0.0)
    }

    pub fn contains(&self, item: &K) -> bool {
        self.index.contains_key(item)
    }

    pub fn len(&self) -> usize {
        self.support.len()
    }

    pub fn is_empty(&self) -> bool {
        self.support.is_empty()
    }

    pub fn support(&self) -> &[K] {
        &self.support
    }

    pub fn weights(&self) -> &[f64] {
        &self.weights
    }

    pub fn iter(&self) -> impl Iterator<Item = (&K, f64)> {
        self.support.iter().zip(self.weights.iter().copied())
    }

    pub fn total(&self) -> f64 {
        self.weights.iter().sum()
    }

    /// Fail unless the weights sum to 1
    pub fn check_normalized(&self) -> Result<()> {
        let total = self.total();
        if (total - 1.0).abs() > NORMALIZATION_TOLERANCE {
            return Err(KbpoError::Sampling(format!(
                "distribution is not normalized: Z = {total}"
            )));
        }
        Ok(())
    }

    /// Σₓ p(x)·q(x) over the shared support
    pub fn overlap(&self, other: &Distribution<K>) -> f64 {
        let (small, large) = if self.len() <= other.len() {
            (self, other)
        } else {
            (other, self)
        };
        small.iter().map(|(x, p)| p * large.prob(x)).sum()
    }
}

impl<K: Eq + Hash + Clone> Mass<K> for Distribution<K> {
    fn mass(&self, item: &K) -> f64 {
        self.prob(item)
    }
}

// ============================================================================
// Submission Distributions
// ============================================================================

/// Distribution of the given kind over a submission's canonical relations
pub fn submission_distribution(
    kb: &KnowledgeBase,
    kind: DistributionKind,
) -> Result<Distribution<InstanceKey>> {
    let instances: Vec<&RelationInstance> = kb.canonical_relations().collect();
    if instances.is_empty() {
        return Err(KbpoError::Sampling(
            "submission has no relations to sample".to_string(),
        ));
    }

    let masses = match kind {
        DistributionKind::Instance => instances.iter().map(|r| (r.pair(), 1.0)).collect(),
        DistributionKind::Relation => balanced(&instances, |r| r.label),
        DistributionKind::Entity => balanced(&instances, |r| subject_entity(kb, r)),
        DistributionKind::EntityRelation => {
            balanced(&instances, |r| (subject_entity(kb, r), r.label))
        }
    };

    let distribution = Distribution::from_masses(masses)?;
    debug!(kind = %kind, support = distribution.len(), "built submission distribution");
    Ok(distribution)
}

fn subject_entity(kb: &KnowledgeBase, relation: &RelationInstance) -> String {
    kb.entity_of(&relation.subject)
        .unwrap_or_else(|| relation.subject.to_string())
}

/// Uniform over groups, then uniform within the group
fn balanced<G: Ord>(
    instances: &[&RelationInstance],
    group: impl Fn(&RelationInstance) -> G,
) -> Vec<(InstanceKey, f64)> {
    let groups: Vec<G> = instances.iter().map(|r| group(r)).collect();
    let mut sizes: BTreeMap<&G, usize> = BTreeMap::new();
    for g in &groups {
        *sizes.entry(g).or_default() += 1;
    }
    let num_groups = sizes.len() as f64;

    instances
        .iter()
        .zip(&groups)
        .map(|(r, g)| {
            let size = sizes.get(g).copied().unwrap_or(1) as f64;
            (r.pair(), 1.0 / (num_groups * size))
        })
        .collect()
}

// ============================================================================
// Document Distributions
// ============================================================================

/// Uniform over the corpus documents
pub fn document_uniform(documents: &[Document]) -> Result<Distribution<String>> {
    Distribution::uniform(documents.iter().map(|d| d.doc_id.clone()))
}

/// Documents weighted by how many canonical-mention glosses they share with
/// the seed documents. Seed documents themselves get no mass.
pub fn document_entity(
    documents: &[Document],
    seeds: &BTreeSet<String>,
) -> Result<Distribution<String>> {
    let seed_glosses: BTreeSet<String> = documents
        .iter()
        .filter(|d| seeds.contains(&d.doc_id))
        .flat_map(|d| d.glosses.iter().map(|g| g.to_lowercase()))
        .collect();

    let masses = documents
        .iter()
        .filter(|d| !seeds.contains(&d.doc_id))
        .map(|d| {
            let shared: BTreeSet<String> = d
                .glosses
                .iter()
                .map(|g| g.to_lowercase())
                .filter(|g| seed_glosses.contains(g))
                .collect();
            (d.doc_id.clone(), shared.len() as f64)
        });

    let distribution = Distribution::from_masses(masses).map_err(|_| {
        KbpoError::Sampling("no unsampled document shares an entity with the seeds".to_string())
    })?;
    debug!(
        seeds = seeds.len(),
        glosses = seed_glosses.len(),
        support = distribution.len(),
        "built entity document distribution"
    );
    Ok(distribution)
}

#[cfg(test)]
mod tests {
    use super::*;
    use kbpo_core::{Link, Mention, MentionType, RelationLabel};
    use proptest::prelude::*;

    fn span(doc: &str, b: usize, e: usize) -> Provenance {
        Provenance::new(doc, b, e)
    }

    /// Two entities; A has three relations, B has one
    fn fixture() -> KnowledgeBase {
        let mut kb = KnowledgeBase::new();
        let a = span("d1", 0, 5);
        let b = span("d1", 40, 45);
        let org1 = span("d1", 10, 20);
        let org2 = span("d1", 25, 30);
        let city = span("d1", 50, 56);
        for (p, t) in [
            (&a, MentionType::Per),
            (&b, MentionType::Per),
            (&org1, MentionType::Org),
            (&org2, MentionType::Org),
            (&city, MentionType::Gpe),
        ] {
            kb.mentions.insert(p.clone(), Mention::new(p.clone(), t, "x"));
        }
        kb.links.insert(a.clone(), Link::new(a.clone(), "wiki:A", 1.0));
        kb.links.insert(b.clone(), Link::new(b.clone(), "wiki:B", 1.0));
        for (s, l, o) in [
            (&a, RelationLabel::PerEmployeeOrMemberOf, &org1),
            (&a, RelationLabel::PerEmployeeOrMemberOf, &org2),
            (&a, RelationLabel::PerPlaceOfBirth, &city),
            (&b, RelationLabel::PerPlaceOfBirth, &city),
        ] {
            let r = RelationInstance::new(s.clone(), l, o.clone());
            kb.relations.insert(r.pair(), r);
        }
        kb
    }

    #[test]
    fn test_instance_distribution_is_uniform() {
        let kb = fixture();
        let p = submission_distribution(&kb, DistributionKind::Instance).unwrap();
        assert_eq!(p.len(), 4);
        for (_, w) in p.iter() {
            assert!((w - 0.25).abs() < 1e-12);
        }
    }

    #[test]
    fn test_relation_balanced() {
        let kb = fixture();
        let p = submission_distribution(&kb, DistributionKind::Relation).unwrap();
        // Two labels, two instances each
        let key = (span("d1", 0, 5), span("d1", 10, 20));
        assert!((p.prob(&key) - 0.25).abs() < 1e-12);
    }

    #[test]
    fn test_entity_balanced() {
        let kb = fixture();
        let p = submission_distribution(&kb, DistributionKind::Entity).unwrap();
        let of_a = (span("d1", 0, 5), span("d1", 50, 56));
        let of_b = (span("d1", 40, 45), span("d1", 50, 56));
        assert!((p.prob(&of_a) - 1.0 / 6.0).abs() < 1e-12);
        assert!((p.prob(&of_b) - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_entity_relation_cells() {
        let kb = fixture();
        let p = submission_distribution(&kb, DistributionKind::EntityRelation).unwrap();
        // Cells: (A, employee) x2, (A, birth), (B, birth)
        let employee = (span("d1", 0, 5), span("d1", 10, 20));
        let birth = (span("d1", 0, 5), span("d1", 50, 56));
        assert!((p.prob(&employee) - 1.0 / 6.0).abs() < 1e-12);
        assert!((p.prob(&birth) - 1.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_inverse_only_labels_are_not_sampled() {
        let mut kb = fixture();
        let (city, a) = (span("d1", 50, 56), span("d1", 0, 5));
        let r = RelationInstance::new(city.clone(), RelationLabel::GpeBirthsInPlace, a.clone());
        kb.relations.insert(r.pair(), r);
        let p = submission_distribution(&kb, DistributionKind::Instance).unwrap();
        assert!(!p.contains(&(city, a)));
        assert_eq!(p.len(), 4);
    }

    #[test]
    fn test_empty_submission_is_an_error() {
        let kb = KnowledgeBase::new();
        assert!(matches!(
            submission_distribution(&kb, DistributionKind::Instance),
            Err(KbpoError::Sampling(_))
        ));
    }

    #[test]
    fn test_document_distributions() {
        let docs = vec![
            Document::new("d1", "t", 10).with_glosses(vec!["Alice".into(), "Acme".into()]),
            Document::new("d2", "t", 10).with_glosses(vec!["alice".into(), "acme".into()]),
            Document::new("d3", "t", 10).with_glosses(vec!["Acme".into()]),
            Document::new("d4", "t", 10).with_glosses(vec!["Bob".into()]),
        ];
        let uniform = document_uniform(&docs).unwrap();
        assert!((uniform.prob(&"d3".to_string()) - 0.25).abs() < 1e-12);

        let seeds: BTreeSet<String> = ["d1".to_string()].into();
        let entity = document_entity(&docs, &seeds).unwrap();
        assert_eq!(entity.prob(&"d1".to_string()), 0.0);
        assert_eq!(entity.prob(&"d4".to_string()), 0.0);
        assert!((entity.prob(&"d2".to_string()) - 2.0 / 3.0).abs() < 1e-12);
        assert!((entity.prob(&"d3".to_string()) - 1.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_overlap() {
        let p = Distribution::uniform(["a", "b"]).unwrap();
        let q = Distribution::uniform(["b", "c", "d", "e"]).unwrap();
        assert!((p.overlap(&q) - 0.125).abs() < 1e-12);
        assert!((q.overlap(&p) - 0.125).abs() < 1e-12);
    }

    #[test]
    fn test_invalid_masses() {
        assert!(Distribution::from_masses([("a", -1.0)]).is_err());
        assert!(Distribution::from_masses([("a", f64::NAN)]).is_err());
        assert!(Distribution::from_masses([("a", 0.0)]).is_err());
        let p = Distribution::uniform(["a", "a", "b"]).unwrap();
        assert!((p.prob(&"a") - 0.5).abs() < 1e-12);
    }

    proptest! {
        #[test]
        fn prop_balanced_distributions_are_normalized(
            rows in prop::collection::vec((0usize..6, 0usize..4, 0usize..30), 1..60)
        ) {
            let labels = [
                RelationLabel::PerEmployeeOrMemberOf,
                RelationLabel::PerSchoolsAttended,
                RelationLabel::PerOrganizationsFounded,
                RelationLabel::PerHoldsSharesIn,
            ];
            let mut kb = KnowledgeBase::new();
            for (entity, label, object) in rows {
                let subject = span("d", entity * 10, entity * 10 + 5);
                let object = span("d", 100 + object * 10, 105 + object * 10);
                kb.mentions.insert(subject.clone(), Mention::new(subject.clone(), MentionType::Per, "p"));
                kb.mentions.insert(object.clone(), Mention::new(object.clone(), MentionType::Org, "o"));
                let r = RelationInstance::new(subject, labels[label], object);
                kb.relations.insert(r.pair(), r);
            }
            for kind in DistributionKind::ALL {
                let p = submission_distribution(&kb, kind).unwrap();
                prop_assert!((p.total() - 1.0).abs() < NORMALIZATION_TOLERANCE);
                prop_assert_eq!(p.len(), kb.relations.len());
            }
        }
    }
}
