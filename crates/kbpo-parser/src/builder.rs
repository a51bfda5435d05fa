//! Submission validation shared by both input formats
//!
//! Readers feed definitions line by line; [`KbBuilder::finish`] then fills
//! defaults, purges dangling references, standardizes and type-checks
//! relations and symmetrizes the result.

use std::collections::BTreeMap;

use kbpo_core::model::{nil_link, is_nil_link, RelationFault, DATE_NAMESPACE, GLOSS_NAMESPACE};
use kbpo_core::{KnowledgeBase, Link, Mention, MentionType, Provenance, RelationInstance};
use tracing::{debug, info};

use crate::{DiagnosticCode as Code, DiagnosticLog, ParseError, ParseOptions, ParseOutcome, Result};

#[derive(Debug, Clone)]
struct MentionDef {
    mention_type: MentionType,
    gloss: String,
    weight: f64,
}

/// Accumulates definitions and validates them into a [`KnowledgeBase`]
#[derive(Debug)]
pub struct KbBuilder<'a> {
    options: &'a ParseOptions,
    diagnostics: DiagnosticLog,
    mentions: BTreeMap<Provenance, MentionDef>,
    canonicals: BTreeMap<Provenance, Provenance>,
    links: BTreeMap<Provenance, Link>,
    relations: BTreeMap<(Provenance, Provenance), RelationInstance>,
}

impl<'a> KbBuilder<'a> {
    pub fn new(options: &'a ParseOptions) -> Self {
        Self {
            options,
            diagnostics: DiagnosticLog::new(),
            mentions: BTreeMap::new(),
            canonicals: BTreeMap::new(),
            links: BTreeMap::new(),
            relations: BTreeMap::new(),
        }
    }

    /// Record a diagnostic
    pub fn diagnose(&mut self, code: Code, line: Option<usize>, message: impl Into<String>) {
        self.diagnostics.push(code, line, message);
    }

    pub fn has_mention(&self, span: &Provenance) -> bool {
        self.mentions.contains_key(span)
    }

    /// Corpus membership and bounds check for a defining span
    pub fn check_span(&mut self, line: Option<usize>, span: &Provenance) -> bool {
        let options = self.options;
        let Some(documents) = &options.documents else {
            return true;
        };
        match documents.get(&span.doc_id).copied() {
            None => {
                self.diagnose(Code::E08OutsideCorpus, line, format!("ignoring mention outside corpus: {span}"));
                false
            }
            Some(length) if length > 0 && span.end > length => {
                self.diagnose(
                    Code::E32SpanOutsideDocument,
                    line,
                    format!("span {span} extends past the end of the document ({length} characters)"),
                );
                false
            }
            Some(_) => true,
        }
    }

    /// Define a typed mention
    pub fn add_mention(
        &mut self,
        line: Option<usize>,
        span: Provenance,
        mention_type: MentionType,
        gloss: impl Into<String>,
        weight: f64,
    ) {
        if !self.check_span(line, &span) {
            return;
        }
        let gloss = gloss.into();
        if let Some(existing) = self.mentions.get(&span) {
            if existing.mention_type != mention_type {
                let msg = format!(
                    "inconsistent mention type: {span} -> {mention_type} (earlier: {})",
                    existing.mention_type
                );
                self.diagnose(Code::E13InconsistentType, line, msg);
            } else if existing.gloss != gloss {
                let msg = format!(
                    "inconsistent mention gloss: {span} -> {gloss:?} (earlier: {:?})",
                    existing.gloss
                );
                self.diagnose(Code::E14InconsistentGloss, line, msg);
            } else {
                self.diagnose(Code::E12DuplicateMention, line, format!("duplicate mention definition: {span}"));
            }
            return;
        }
        self.mentions.insert(
            span,
            MentionDef {
                mention_type,
                gloss,
                weight,
            },
        );
    }

    /// Define the canonical mention of `span`
    pub fn add_canonical(&mut self, line: Option<usize>, span: Provenance, canonical: Provenance) {
        if !self.check_span(line, &span) {
            return;
        }
        if !span.same_doc(&canonical) {
            self.diagnose(
                Code::E09CanonicalOutsideDocument,
                line,
                format!("canonical mention {canonical} outside mention document of {span}"),
            );
            return;
        }
        match self.canonicals.get(&span) {
            Some(existing) if *existing != canonical => {
                let msg = format!("inconsistent canonical mention: {span} -> {canonical} (earlier: {existing})");
                self.diagnose(Code::E16InconsistentCanonicalMention, line, msg);
            }
            Some(_) => {
                self.diagnose(
                    Code::E15DuplicateCanonicalMention,
                    line,
                    format!("duplicate canonical mention definition: {span}"),
                );
            }
            None => {
                self.canonicals.insert(span, canonical);
            }
        }
    }

    /// Define the link of `span`
    pub fn add_link(&mut self, line: Option<usize>, span: Provenance, link_name: impl Into<String>, weight: f64) {
        if !self.check_span(line, &span) {
            return;
        }
        let link_name = link_name.into();
        match self.links.get(&span) {
            Some(existing) if existing.link_name != link_name => {
                let msg = format!(
                    "inconsistent link: {span} -> {link_name} (earlier: {})",
                    existing.link_name
                );
                self.diagnose(Code::E18InconsistentLink, line, msg);
            }
            Some(_) => {
                self.diagnose(Code::E17DuplicateLink, line, format!("duplicate link definition: {span}"));
            }
            None => {
                if is_nil_link(&link_name) {
                    self.diagnose(
                        Code::E19ReservedLinkNamespace,
                        line,
                        format!("using reserved NIL link namespace: {span} -> {link_name}"),
                    );
                }
                self.links.insert(span.clone(), Link::new(span, link_name, weight));
            }
        }
    }

    /// Define a relation; empty provenance defaults to the covering span
    pub fn add_relation(&mut self, line: Option<usize>, mut relation: RelationInstance) {
        if !self.check_span(line, &relation.subject) {
            return;
        }
        if !relation.subject.same_doc(&relation.object) {
            let msg = format!(
                "object mention {} outside subject mention document",
                relation.object
            );
            self.diagnose(Code::E10ObjectOutsideDocument, line, msg);
            return;
        }
        if let Some(p) = relation.provenances.iter().find(|p| !p.same_doc(&relation.subject)) {
            let msg = format!("provenance {p} outside mention document of {}", relation.subject);
            self.diagnose(Code::E11ProvenanceOutsideDocument, line, msg);
            return;
        }
        if relation.subject == relation.object {
            self.diagnose(
                Code::E23SelfRelation,
                line,
                format!("ignoring self-relation on {}", relation.subject),
            );
            return;
        }

        let key = relation.pair();
        if let Some(existing) = self.relations.get(&key) {
            if existing.label != relation.label {
                let msg = format!(
                    "inconsistent relation definition: ({}, {}) -> {} (earlier: {})",
                    key.0, key.1, relation.label, existing.label
                );
                self.diagnose(Code::E21InconsistentRelation, line, msg);
            } else {
                let msg = format!("duplicate relation definition: ({}, {})", key.0, key.1);
                self.diagnose(Code::E20DuplicateRelation, line, msg);
            }
            return;
        }

        if relation.provenances.is_empty() {
            if let Some(covering) = relation.covering_span() {
                self.diagnose(
                    Code::E22MissingProvenance,
                    line,
                    format!("missing relation provenance, using between-mention span {covering}"),
                );
                relation.provenances = vec![covering];
            }
        }
        self.relations.insert(key, relation);
    }

    /// Validate everything collected so far
    pub fn finish(mut self) -> Result<ParseOutcome> {
        self.purge_undefined();
        self.fill_defaults();

        let mut kb = KnowledgeBase::new();
        for (span, def) in &self.mentions {
            let canonical = self.canonicals.get(span).cloned().unwrap_or_else(|| span.clone());
            let mention = Mention::new(span.clone(), def.mention_type, def.gloss.clone())
                .with_canonical(canonical)
                .with_weight(def.weight);
            kb.mentions.insert(span.clone(), mention);
        }
        kb.links = std::mem::take(&mut self.links);

        let relations = std::mem::take(&mut self.relations);
        for (_, relation) in relations {
            self.admit_relation(&mut kb, relation);
        }

        let report = kb.symmetrize();
        for (subject, object) in &report.overwritten {
            self.diagnose(
                Code::E31InconsistentSymmetricRelation,
                None,
                format!("replaced conflicting reverse relation ({subject}, {object}) with its symmetrized label"),
            );
        }
        debug!(added = report.added.len(), "symmetrized relations");

        if kb.mentions.is_empty() {
            return Err(ParseError::EmptySubmission(self.diagnostics.len()));
        }
        info!(
            mentions = kb.mentions.len(),
            links = kb.links.len(),
            relations = kb.relations.len(),
            diagnostics = self.diagnostics.len(),
            "validated submission"
        );
        Ok(ParseOutcome {
            kb,
            diagnostics: self.diagnostics,
        })
    }

    fn purge_undefined(&mut self) {
        let dangling: Vec<_> = self
            .canonicals
            .iter()
            .filter(|(m, n)| !self.mentions.contains_key(*m) || !self.mentions.contains_key(*n))
            .map(|(m, n)| (m.clone(), n.clone()))
            .collect();
        for (m, n) in dangling {
            let msg = format!("ignoring canonical_mention with missing mention: {m} canonical_mention {n}");
            self.diagnose(Code::E26UndefinedCanonicalMention, None, msg);
            self.canonicals.remove(&m);
        }

        // The canonical mention must carry the same type
        let mistyped: Vec<_> = self
            .canonicals
            .iter()
            .filter(|(m, n)| {
                self.mentions.get(*m).map(|d| d.mention_type)
                    != self.mentions.get(*n).map(|d| d.mention_type)
            })
            .map(|(m, n)| (m.clone(), n.clone()))
            .collect();
        for (m, n) in mistyped {
            let msg = format!("canonical mention {n} of {m} has a different type");
            self.diagnose(Code::E16InconsistentCanonicalMention, None, msg);
            self.canonicals.remove(&m);
        }

        let dangling: Vec<_> = self
            .links
            .keys()
            .filter(|m| !self.mentions.contains_key(*m))
            .cloned()
            .collect();
        for m in dangling {
            self.diagnose(Code::E27UndefinedLinkMention, None, format!("ignoring link with missing mention: {m}"));
            self.links.remove(&m);
        }
    }

    fn fill_defaults(&mut self) {
        let spans: Vec<_> = self.mentions.keys().cloned().collect();
        for m in &spans {
            if !self.canonicals.contains_key(m) {
                self.diagnose(
                    Code::E24MissingCanonicalMention,
                    None,
                    format!("missing canonical mention definition: making {m} a canonical mention"),
                );
                self.canonicals.insert(m.clone(), m.clone());
            }
        }

        // Canonical mentions first so that the rest can inherit their link
        let canonical_spans: Vec<_> = spans
            .iter()
            .filter(|m| self.canonicals.get(*m) == Some(*m))
            .cloned()
            .collect();
        // NIL clusters are numbered within each document
        let mut nil_counts: BTreeMap<String, usize> = BTreeMap::new();
        for m in &canonical_spans {
            if self.links.contains_key(m) {
                continue;
            }
            let Some(def) = self.mentions.get(m) else {
                continue;
            };
            let name = match def.mention_type {
                MentionType::Date => format!("{DATE_NAMESPACE}{}", def.gloss),
                MentionType::Title => format!("{GLOSS_NAMESPACE}{}", def.gloss),
                _ => {
                    let n = nil_counts.entry(m.doc_id.clone()).or_default();
                    *n += 1;
                    nil_link(*n)
                }
            };
            self.diagnose(Code::E25MissingLink, None, format!("missing link definition: linking {m} to {name}"));
            self.links.insert(m.clone(), Link::new(m.clone(), name, 0.0));
        }
        for m in &spans {
            if self.links.contains_key(m) {
                continue;
            }
            let Some(name) = self
                .canonicals
                .get(m)
                .and_then(|c| self.links.get(c))
                .map(|l| l.link_name.clone())
            else {
                continue;
            };
            self.diagnose(Code::E25MissingLink, None, format!("missing link definition: linking {m} to {name}"));
            self.links.insert(m.clone(), Link::new(m.clone(), name, 0.0));
        }
    }

    fn admit_relation(&mut self, kb: &mut KnowledgeBase, relation: RelationInstance) {
        let Some(standard) = kb.standardize(&relation) else {
            if kb.mention(&relation.object).is_none() {
                self.reject(&relation, RelationFault::MissingObject);
            } else {
                let msg = format!(
                    "no canonical inverse of {} for ({}, {})",
                    relation.label, relation.subject, relation.object
                );
                self.diagnose(Code::E30UnresolvedInverse, None, msg);
            }
            return;
        };
        if let Err(fault) = kb.check_relation(&standard) {
            self.reject(&standard, fault);
            return;
        }
        let key = standard.pair();
        match kb.relations.get(&key) {
            Some(existing) if existing.label != standard.label => {
                let msg = format!(
                    "inconsistent relation definition: ({}, {}) -> {} (earlier: {})",
                    key.0, key.1, standard.label, existing.label
                );
                self.diagnose(Code::E21InconsistentRelation, None, msg);
            }
            Some(_) => {}
            None => {
                kb.relations.insert(key, standard);
            }
        }
    }

    fn reject(&mut self, relation: &RelationInstance, fault: RelationFault) {
        let code = match fault {
            RelationFault::SelfRelation => Code::E23SelfRelation,
            RelationFault::MissingSubject | RelationFault::MissingObject => {
                Code::E28UndefinedRelationMention
            }
            RelationFault::TypeMismatch { .. } => Code::E29RelationTypeMismatch,
        };
        let msg = format!(
            "ignoring relation {} {} {}: {fault}",
            relation.subject, relation.label, relation.object
        );
        self.diagnose(code, None, msg);
    }
}
