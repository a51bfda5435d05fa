//! Mention, link and relation model
//!
//! A [`KnowledgeBase`] is one system submission: typed mentions with their
//! canonical mentions, one link per mention and at most one relation per
//! ordered mention pair. Relations whose label has an inverse are kept
//! symmetric by [`KnowledgeBase::symmetrize`].

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, warn};

use crate::defs::{MentionType, RelationLabel};
use crate::span::Provenance;

// ============================================================================
// Mentions and Links
// ============================================================================

/// A typed mention
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mention {
    /// Span of the mention
    pub provenance: Provenance,

    /// Span of the mention representing this entity in the document
    pub canonical: Provenance,

    /// Mention type
    pub mention_type: MentionType,

    /// Surface text
    pub gloss: String,

    /// Confidence in [0, 1]
    pub weight: f64,
}

impl Mention {
    /// Create a mention that is its own canonical mention
    pub fn new(provenance: Provenance, mention_type: MentionType, gloss: impl Into<String>) -> Self {
        Self {
            canonical: provenance.clone(),
            provenance,
            mention_type,
            gloss: gloss.into(),
            weight: 1.0,
        }
    }

    /// Set the canonical mention
    pub fn with_canonical(mut self, canonical: Provenance) -> Self {
        self.canonical = canonical;
        self
    }

    /// Set the weight
    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }

    pub fn doc_id(&self) -> &str {
        &self.provenance.doc_id
    }

    pub fn is_canonical(&self) -> bool {
        self.provenance == self.canonical
    }
}

/// Namespace prefix for wikipedia links
pub const WIKI_NAMESPACE: &str = "wiki:";
/// Namespace prefix for string-valued links
pub const GLOSS_NAMESPACE: &str = "gloss:";
/// Namespace prefix for normalized dates
pub const DATE_NAMESPACE: &str = "date:";
/// Reserved prefix for generated NIL clusters
pub const NIL_PREFIX: &str = "NIL";

/// Name of the `n`-th generated NIL cluster, counting from 1
pub fn nil_link(n: usize) -> String {
    format!("{NIL_PREFIX}{n:04}")
}

/// True for names in the NIL namespace
pub fn is_nil_link(name: &str) -> bool {
    name.starts_with(NIL_PREFIX)
}

/// A link from a mention to an entity name
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Link {
    /// Span of the linked mention
    pub provenance: Provenance,

    /// Namespaced entity name (`wiki:`, `gloss:`, `date:` or `NIL<n>`)
    pub link_name: String,

    /// Judged correctness; `None` for submitted links
    pub correct: Option<bool>,

    /// Confidence in [0, 1]
    pub weight: f64,
}

impl Link {
    pub fn new(provenance: Provenance, link_name: impl Into<String>, weight: f64) -> Self {
        Self {
            provenance,
            link_name: link_name.into(),
            correct: None,
            weight,
        }
    }

    /// Namespace of the link name, `NIL` for generated clusters
    pub fn namespace(&self) -> &str {
        if is_nil_link(&self.link_name) {
            return NIL_PREFIX;
        }
        self.link_name
            .split_once(':')
            .map(|(ns, _)| ns)
            .unwrap_or("")
    }
}

// ============================================================================
// Relations
// ============================================================================

/// A relation between two mentions of one document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationInstance {
    pub subject: Provenance,
    pub object: Provenance,
    pub label: RelationLabel,
    /// Supporting spans, all in the subject's document
    pub provenances: Vec<Provenance>,
    pub weight: f64,
}

impl RelationInstance {
    pub fn new(subject: Provenance, label: RelationLabel, object: Provenance) -> Self {
        Self {
            subject,
            object,
            label,
            provenances: Vec::new(),
            weight: 1.0,
        }
    }

    pub fn with_provenances(mut self, provenances: Vec<Provenance>) -> Self {
        self.provenances = provenances;
        self
    }

    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }

    pub fn doc_id(&self) -> &str {
        &self.subject.doc_id
    }

    /// Ordered `(subject, object)` key
    pub fn pair(&self) -> (Provenance, Provenance) {
        (self.subject.clone(), self.object.clone())
    }

    /// The same instance seen from the object's side
    pub fn inverted(&self, label: RelationLabel) -> Self {
        Self {
            subject: self.object.clone(),
            object: self.subject.clone(),
            label,
            provenances: self.provenances.clone(),
            weight: self.weight,
        }
    }

    /// Span covering both arguments, the default provenance
    pub fn covering_span(&self) -> Option<Provenance> {
        self.subject.covering(&self.object)
    }
}

/// Why a relation cannot be kept in a knowledge base
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelationFault {
    SelfRelation,
    MissingSubject,
    MissingObject,
    TypeMismatch {
        subject: MentionType,
        object: MentionType,
    },
}

impl std::fmt::Display for RelationFault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SelfRelation => write!(f, "self-relation"),
            Self::MissingSubject => write!(f, "subject mention is not defined"),
            Self::MissingObject => write!(f, "object mention is not defined"),
            Self::TypeMismatch { subject, object } => {
                write!(f, "incompatible argument types ({subject}, {object})")
            }
        }
    }
}

/// Outcome of a symmetrization pass
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SymmetrizeReport {
    /// Inverse relations that were missing and have been added
    pub added: Vec<(Provenance, Provenance)>,

    /// Reverse relations whose label conflicted and was replaced
    pub overwritten: Vec<(Provenance, Provenance)>,
}

// ============================================================================
// Knowledge Base
// ============================================================================

/// A validated system submission
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "KbRecord", into = "KbRecord")]
pub struct KnowledgeBase {
    pub mentions: BTreeMap<Provenance, Mention>,
    pub links: BTreeMap<Provenance, Link>,
    pub relations: BTreeMap<(Provenance, Provenance), RelationInstance>,
}

/// Flat serialized form; span-keyed maps are not valid JSON objects
#[derive(Serialize, Deserialize)]
struct KbRecord {
    mentions: Vec<Mention>,
    links: Vec<Link>,
    relations: Vec<RelationInstance>,
}

impl From<KnowledgeBase> for KbRecord {
    fn from(kb: KnowledgeBase) -> Self {
        Self {
            mentions: kb.mentions.into_values().collect(),
            links: kb.links.into_values().collect(),
            relations: kb.relations.into_values().collect(),
        }
    }
}

impl From<KbRecord> for KnowledgeBase {
    fn from(record: KbRecord) -> Self {
        let mut kb = KnowledgeBase::default();
        for m in record.mentions {
            kb.mentions.insert(m.provenance.clone(), m);
        }
        for l in record.links {
            kb.links.insert(l.provenance.clone(), l);
        }
        for r in record.relations {
            kb.relations.insert(r.pair(), r);
        }
        kb
    }
}

impl KnowledgeBase {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mention(&self, p: &Provenance) -> Option<&Mention> {
        self.mentions.get(p)
    }

    pub fn mention_type(&self, p: &Provenance) -> Option<MentionType> {
        self.mentions.get(p).map(|m| m.mention_type)
    }

    pub fn link(&self, p: &Provenance) -> Option<&Link> {
        self.links.get(p)
    }

    pub fn relation(&self, subject: &Provenance, object: &Provenance) -> Option<&RelationInstance> {
        self.relations.get(&(subject.clone(), object.clone()))
    }

    /// Entity a mention refers to: the link of its canonical mention, or the
    /// canonical span itself when the canonical mention is unlinked.
    /// NIL clusters only identify an entity within their document.
    pub fn entity_of(&self, p: &Provenance) -> Option<String> {
        let mention = self.mentions.get(p)?;
        let entity = match self.links.get(&mention.canonical).or_else(|| self.links.get(p)) {
            Some(l) if is_nil_link(&l.link_name) => format!("{}:{}", p.doc_id, l.link_name),
            Some(l) => l.link_name.clone(),
            None => mention.canonical.to_string(),
        };
        Some(entity)
    }

    /// Documents with at least one mention
    pub fn doc_ids(&self) -> BTreeSet<String> {
        self.mentions.keys().map(|p| p.doc_id.clone()).collect()
    }

    /// Relations with canonical labels, the population sampled for evaluation
    pub fn canonical_relations(&self) -> impl Iterator<Item = &RelationInstance> {
        self.relations.values().filter(|r| r.label.is_canonical())
    }

    /// Relations whose subject lies in `doc_id`
    pub fn relations_in_doc<'a>(
        &'a self,
        doc_id: &'a str,
    ) -> impl Iterator<Item = &'a RelationInstance> + 'a {
        self.relations.values().filter(move |r| r.doc_id() == doc_id)
    }

    /// Check that a relation could be stored as is
    pub fn check_relation(&self, relation: &RelationInstance) -> Result<(), RelationFault> {
        if relation.subject == relation.object {
            return Err(RelationFault::SelfRelation);
        }
        let subject = self
            .mention_type(&relation.subject)
            .ok_or(RelationFault::MissingSubject)?;
        let object = self
            .mention_type(&relation.object)
            .ok_or(RelationFault::MissingObject)?;
        if !relation.label.accepts(subject, object) {
            return Err(RelationFault::TypeMismatch { subject, object });
        }
        Ok(())
    }

    /// Rewrite a relation with a non-canonical label into its canonical
    /// inverse by swapping arguments.
    ///
    /// Returns `None` when the object's type selects no inverse.
    pub fn standardize(&self, relation: &RelationInstance) -> Option<RelationInstance> {
        if relation.label.is_canonical() || relation.label.is_no_relation() {
            return Some(relation.clone());
        }
        let object_type = self.mention_type(&relation.object)?;
        let inverse = relation.label.inverse_for(object_type)?;
        Some(relation.inverted(inverse))
    }

    /// Add missing inverse relations, replacing conflicting reverse labels.
    ///
    /// Pairs are visited in span order and the inverse table is an
    /// involution, so a single pass reaches closure.
    pub fn symmetrize(&mut self) -> SymmetrizeReport {
        let mut report = SymmetrizeReport::default();
        let pairs: Vec<_> = self.relations.keys().cloned().collect();

        for pair in pairs {
            let Some(relation) = self.relations.get(&pair) else {
                continue;
            };
            let Some(object_type) = self.mention_type(&relation.object) else {
                continue;
            };
            let Some(inverse) = relation.label.inverse_for(object_type) else {
                continue;
            };
            let reversed = relation.inverted(inverse);
            let key = reversed.pair();

            match self.relations.get(&key) {
                None => {
                    debug!(subject = %key.0, object = %key.1, label = %inverse, "adding symmetrized relation");
                    self.relations.insert(key.clone(), reversed);
                    report.added.push(key);
                }
                Some(existing) if existing.label != inverse => {
                    warn!(
                        subject = %key.0,
                        object = %key.1,
                        existing = %existing.label,
                        symmetrized = %inverse,
                        "inconsistent symmetric relations, keeping the symmetrized label"
                    );
                    self.relations.insert(key.clone(), reversed);
                    report.overwritten.push(key);
                }
                Some(_) => {}
            }
        }
        report
    }

    /// True when every invertible relation has its inverse stored
    pub fn is_symmetrically_closed(&self) -> bool {
        self.relations.values().all(|r| {
            let Some(object_type) = self.mention_type(&r.object) else {
                return true;
            };
            match r.label.inverse_for(object_type) {
                Some(inverse) => self
                    .relation(&r.object, &r.subject)
                    .map(|back| back.label == inverse)
                    .unwrap_or(false),
                None => true,
            }
        })
    }
}
