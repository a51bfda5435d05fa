//! TAC-KB reader
//!
//! TAC-KB files group mentions under entity ids. The first line names the
//! run and is skipped; every other line is one of
//!
//! ```text
//! :e1  type               PER
//! :e1  mention            "gloss"  doc:b-e
//! :e1  canonical_mention  "gloss"  doc:b-e
//! :e1  <relation>         :e2      doc:b-e[,doc:b-e...]  <weight>
//! :e1  <relation>         "value"  doc:b-e[,doc:b-e...]  <weight>
//! ```
//!
//! Relation arguments are resolved onto concrete mentions: for every
//! provenance span in turn, the first mention of the entity in that
//! document starting at or after the span is taken. For string-valued
//! relations the first provenance is the value's own span.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::io::BufRead;

use kbpo_core::model::{DATE_NAMESPACE, GLOSS_NAMESPACE};
use kbpo_core::{MentionType, Provenance, RelationInstance, RelationLabel};
use tracing::debug;

use crate::mfile::{parse_weight, SpanParser, MAX_COLUMNS};
use crate::{DiagnosticCode as Code, KbBuilder, ParseError, ParseOptions, ParseOutcome, Result};

/// A relation between entity ids, before argument resolution
#[derive(Debug, Clone)]
struct EntityRelation {
    line: usize,
    subject: String,
    label: RelationLabel,
    /// Entity id, or the value of a string-valued relation
    object: String,
    provenances: Vec<Provenance>,
    weight: f64,
}

#[derive(Debug, Clone)]
struct MentionInfo {
    gloss: String,
    weight: f64,
}

/// Entity-keyed tables collected in the first pass
#[derive(Debug, Default)]
struct EntityTable {
    types: HashMap<String, MentionType>,
    /// Mentions per `(entity, doc_id)`, in span order
    mentions: BTreeMap<(String, String), BTreeSet<Provenance>>,
    owners: HashMap<Provenance, String>,
    info: HashMap<Provenance, MentionInfo>,
    canonicals: HashMap<(String, String), Provenance>,
    relations: Vec<EntityRelation>,
}

impl EntityTable {
    fn add_type(&mut self, builder: &mut KbBuilder<'_>, line: usize, entity: &str, mention_type: MentionType) {
        match self.types.get(entity) {
            Some(existing) if *existing != mention_type => {
                let msg = format!("ignoring inconsistent type {mention_type} for {entity} (keeping {existing})");
                builder.diagnose(Code::E13InconsistentType, Some(line), msg);
            }
            Some(_) => {}
            None => {
                self.types.insert(entity.to_string(), mention_type);
            }
        }
    }

    /// Returns `false` if the mention was rejected
    fn add_mention(
        &mut self,
        builder: &mut KbBuilder<'_>,
        line: usize,
        entity: &str,
        span: Provenance,
        gloss: String,
        weight: f64,
    ) -> bool {
        if let Some(owner) = self.owners.get(&span) {
            if owner != entity {
                let msg = format!("mention {span} refers to {entity} and {owner}; keeping {owner}");
                builder.diagnose(Code::E12DuplicateMention, Some(line), msg);
                return false;
            }
            if let Some(existing) = self.info.get(&span) {
                if existing.gloss != gloss {
                    let msg = format!(
                        "ignoring inconsistent mention {span} {gloss:?} (keeping {:?})",
                        existing.gloss
                    );
                    builder.diagnose(Code::E14InconsistentGloss, Some(line), msg);
                    return false;
                }
            }
            return true;
        }
        self.owners.insert(span.clone(), entity.to_string());
        self.info.insert(span.clone(), MentionInfo { gloss, weight });
        self.mentions
            .entry((entity.to_string(), span.doc_id.clone()))
            .or_default()
            .insert(span);
        true
    }

    fn add_canonical(&mut self, builder: &mut KbBuilder<'_>, line: usize, entity: &str, span: Provenance) {
        let key = (entity.to_string(), span.doc_id.clone());
        match self.canonicals.get(&key) {
            Some(existing) if *existing != span => {
                let msg = format!(
                    "ignoring inconsistent canonical mention {span} of {entity} (keeping {existing})"
                );
                builder.diagnose(Code::E16InconsistentCanonicalMention, Some(line), msg);
            }
            Some(_) => {
                builder.diagnose(
                    Code::E15DuplicateCanonicalMention,
                    Some(line),
                    format!("duplicate canonical mention of {entity} in {}", span.doc_id),
                );
            }
            None => {
                self.canonicals.insert(key, span);
            }
        }
    }

    /// First mention of `entity` in the span's document starting at or after it
    fn first_subsequent_mention(&self, entity: &str, span: &Provenance) -> Option<Provenance> {
        self.mentions
            .get(&(entity.to_string(), span.doc_id.clone()))?
            .iter()
            .find(|m| m.begin >= span.begin)
            .cloned()
    }

    fn resolve(&self, spans: &[Provenance], entity: &str) -> Option<Provenance> {
        spans
            .iter()
            .find_map(|p| self.first_subsequent_mention(entity, p))
    }

    /// Feed resolved mentions, links and relations into the builder
    fn emit(self, builder: &mut KbBuilder<'_>) {
        let mut untyped = BTreeSet::new();
        for ((entity, doc_id), mentions) in &self.mentions {
            let Some(&mention_type) = self.types.get(entity) else {
                untyped.insert(entity.clone());
                continue;
            };
            let Some(first) = mentions.iter().next() else {
                continue;
            };
            let canonical = match self.canonicals.get(&(entity.clone(), doc_id.clone())) {
                Some(c) => c.clone(),
                None => {
                    let msg = format!(
                        "no canonical mention for {entity} in {doc_id}; using {first}"
                    );
                    builder.diagnose(Code::E24MissingCanonicalMention, None, msg);
                    first.clone()
                }
            };
            for m in mentions {
                let Some(info) = self.info.get(m) else {
                    continue;
                };
                builder.add_mention(None, m.clone(), mention_type, info.gloss.clone(), info.weight);
                builder.add_canonical(None, m.clone(), canonical.clone());
                builder.add_link(None, m.clone(), entity.clone(), info.weight);
            }
        }
        for entity in &untyped {
            builder.diagnose(
                Code::E13InconsistentType,
                None,
                format!("type not found for entity: ignoring {entity}"),
            );
        }

        for relation in &self.relations {
            if !self.types.contains_key(&relation.subject) {
                let msg = format!("type not found for subject {}: ignoring relation", relation.subject);
                builder.diagnose(Code::E28UndefinedRelationMention, Some(relation.line), msg);
                continue;
            }
            let resolved = match relation.label.string_valued() {
                Some(value_type) => self.resolve_string_valued(builder, relation, value_type),
                None => self.resolve_entities(builder, relation),
            };
            let Some((subject, object)) = resolved else {
                continue;
            };
            let instance = RelationInstance::new(subject, relation.label, object)
                .with_provenances(relation.provenances.clone())
                .with_weight(relation.weight);
            builder.add_relation(Some(relation.line), instance);
        }
    }

    fn resolve_string_valued(
        &self,
        builder: &mut KbBuilder<'_>,
        relation: &EntityRelation,
        value_type: MentionType,
    ) -> Option<(Provenance, Provenance)> {
        let (value_span, rest) = relation.provenances.split_first()?;
        let Some(subject) = self.resolve(rest, &relation.subject) else {
            let msg = format!(
                "could not find a mention of {} in the relation provenance",
                relation.subject
            );
            builder.diagnose(Code::E28UndefinedRelationMention, Some(relation.line), msg);
            return None;
        };
        if !builder.has_mention(value_span) {
            let namespace = match value_type {
                MentionType::Date => DATE_NAMESPACE,
                _ => GLOSS_NAMESPACE,
            };
            let line = Some(relation.line);
            builder.add_mention(line, value_span.clone(), value_type, relation.object.clone(), relation.weight);
            builder.add_canonical(line, value_span.clone(), value_span.clone());
            builder.add_link(line, value_span.clone(), format!("{namespace}{}", relation.object), relation.weight);
        }
        Some((subject, value_span.clone()))
    }

    fn resolve_entities(
        &self,
        builder: &mut KbBuilder<'_>,
        relation: &EntityRelation,
    ) -> Option<(Provenance, Provenance)> {
        if !self.types.contains_key(&relation.object) {
            let msg = format!("type not found for object {}: ignoring relation", relation.object);
            builder.diagnose(Code::E28UndefinedRelationMention, Some(relation.line), msg);
            return None;
        }
        let subject = self.resolve(&relation.provenances, &relation.subject);
        let object = self.resolve(&relation.provenances, &relation.object);
        match (subject, object) {
            (Some(s), Some(o)) => Some((s, o)),
            (s, _) => {
                let missing = if s.is_none() { &relation.subject } else { &relation.object };
                let msg = format!("could not find a mention of {missing} in the relation provenance");
                builder.diagnose(Code::E28UndefinedRelationMention, Some(relation.line), msg);
                None
            }
        }
    }
}

/// Strip surrounding quotes and unescape embedded ones
fn unquote(text: &str) -> String {
    let text = text.trim();
    let inner = text
        .strip_prefix('"')
        .and_then(|t| t.strip_suffix('"'))
        .unwrap_or(text);
    inner.replace("\\\"", "\"")
}

/// Parse and validate a TAC-KB file
pub fn parse_tackb<R: BufRead>(reader: R, options: &ParseOptions) -> Result<ParseOutcome> {
    let spans = SpanParser::new()?;
    let mut builder = KbBuilder::new(options);
    let mut table = EntityTable::default();

    for (index, line) in reader.lines().enumerate() {
        let lineno = index + 1;
        let line = line.map_err(|e| ParseError::IoError {
            path: format!("<tackb line {lineno}>"),
            source: e,
        })?;
        if index == 0 {
            debug!(header = %line.trim(), "skipping run header");
            continue;
        }
        let line = line.trim_end_matches(['\r', '\n']);
        if line.trim().is_empty() {
            continue;
        }
        let cols: Vec<&str> = line.split('\t').collect();
        if cols.len() > MAX_COLUMNS {
            builder.diagnose(
                Code::E01TooManyColumns,
                Some(lineno),
                format!("invalid number of columns, {} instead of {MAX_COLUMNS}", cols.len()),
            );
            continue;
        }
        let col = |i: usize| cols.get(i).copied().unwrap_or("").trim();

        let entity = col(0);
        if !entity.starts_with(':') || entity.len() < 2 {
            builder.diagnose(Code::E02MalformedSubject, Some(lineno), format!("malformed entity id {entity:?}"));
            continue;
        }
        let Some(weight) = parse_weight(&mut builder, lineno, col(4)) else {
            continue;
        };

        match col(1) {
            "type" => match col(2).parse::<MentionType>() {
                Ok(mention_type) => table.add_type(&mut builder, lineno, entity, mention_type),
                Err(_) => {
                    builder.diagnose(Code::E03MalformedObject, Some(lineno), format!("unknown entity type {:?}", col(2)));
                }
            },
            predicate @ ("mention" | "canonical_mention") => {
                let Some(span) = spans.span(col(3)) else {
                    builder.diagnose(
                        Code::E04MalformedProvenance,
                        Some(lineno),
                        format!("ignoring mention without a valid provenance: {:?}", col(3)),
                    );
                    continue;
                };
                let added = table.add_mention(&mut builder, lineno, entity, span.clone(), unquote(col(2)), weight);
                if added && predicate == "canonical_mention" {
                    table.add_canonical(&mut builder, lineno, entity, span);
                }
            }
            "nominal_mention" => {}
            predicate => {
                let label = match RelationLabel::from_alias(predicate) {
                    Some(label) if !label.is_no_relation() => label,
                    _ => {
                        builder.diagnose(
                            Code::E07UnsupportedRelation,
                            Some(lineno),
                            format!("ignoring relation: {predicate} (not supported)"),
                        );
                        continue;
                    }
                };
                let provenances = match spans.spans(col(3)) {
                    Ok(p) if !p.is_empty() => p,
                    Ok(_) => {
                        builder.diagnose(Code::E04MalformedProvenance, Some(lineno), "no provenance for relation");
                        continue;
                    }
                    Err(bad) => {
                        builder.diagnose(Code::E04MalformedProvenance, Some(lineno), format!("malformed provenance {bad:?}"));
                        continue;
                    }
                };
                let object = if label.string_valued().is_some() {
                    unquote(col(2))
                } else {
                    col(2).to_string()
                };
                if object == entity {
                    builder.diagnose(
                        Code::E23SelfRelation,
                        Some(lineno),
                        format!("ignoring self-relation on {entity}"),
                    );
                    continue;
                }
                table.relations.push(EntityRelation {
                    line: lineno,
                    subject: entity.to_string(),
                    label,
                    object,
                    provenances,
                    weight,
                });
            }
        }
    }

    table.emit(&mut builder);
    builder.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    const RUN: &str = "test_run_1
:e1\ttype\tPER
:e1\tcanonical_mention\t\"Alice\"\td1:0-5\t1.0
:e1\tmention\t\"she\"\td1:30-33\t0.9
:e2\ttype\tORG
:e2\tmention\t\"Acme\"\td1:10-20\t1.0
:e1\tper:employee_or_member_of\t:e2\td1:0-20\t0.8
:e1\tper:title\t\"CEO\"\td1:40-43,d1:25-45\t0.7
:e3\tmention\t\"Ghost\"\td1:50-55
:e1\tper:spouse\t:e1\td1:0-5
:e1\tper:alternate_names\t\"Al\"\td1:0-5
";

    fn span(doc: &str, b: usize, e: usize) -> Provenance {
        Provenance::new(doc, b, e)
    }

    #[test]
    fn test_entities_become_mentions() {
        let outcome = parse_tackb(RUN.as_bytes(), &ParseOptions::default()).unwrap();
        let kb = &outcome.kb;

        assert_eq!(kb.mentions.len(), 4);
        let she = kb.mention(&span("d1", 30, 33)).unwrap();
        assert_eq!(she.canonical, span("d1", 0, 5));
        assert_eq!(she.gloss, "she");
        assert!((she.weight - 0.9).abs() < 1e-12);
        assert!(kb.mention(&span("d1", 10, 20)).unwrap().is_canonical());
        assert!(kb.mention(&span("d1", 50, 55)).is_none());

        assert_eq!(kb.link(&span("d1", 0, 5)).unwrap().link_name, ":e1");
        assert_eq!(kb.link(&span("d1", 30, 33)).unwrap().link_name, ":e1");
        assert_eq!(kb.link(&span("d1", 40, 43)).unwrap().link_name, "gloss:CEO");

        let log = &outcome.diagnostics;
        assert!(log.has(Code::E23SelfRelation));
        assert!(log.has(Code::E07UnsupportedRelation));
        assert!(log.has(Code::E13InconsistentType));
        assert!(log.has(Code::E24MissingCanonicalMention));
    }

    #[test]
    fn test_relation_arguments_are_resolved() {
        let kb = parse_tackb(RUN.as_bytes(), &ParseOptions::default()).unwrap().kb;

        let employ = kb.relation(&span("d1", 0, 5), &span("d1", 10, 20)).unwrap();
        assert_eq!(employ.label, RelationLabel::PerEmployeeOrMemberOf);
        assert!((employ.weight - 0.8).abs() < 1e-12);
        assert!(kb.relation(&span("d1", 10, 20), &span("d1", 0, 5)).is_some());

        // The value span comes first; the subject is found after 25
        let title = kb.relation(&span("d1", 30, 33), &span("d1", 40, 43)).unwrap();
        assert_eq!(title.label, RelationLabel::PerTitle);
        assert_eq!(title.provenances, vec![span("d1", 40, 43), span("d1", 25, 45)]);
        assert_eq!(kb.mention(&span("d1", 40, 43)).unwrap().mention_type, MentionType::Title);

        assert_eq!(kb.relations.len(), 3);
    }

    #[test]
    fn test_mention_keeps_first_entity() {
        let text = "run
:e1\ttype\tPER
:e2\ttype\tPER
:e1\tmention\t\"Alice\"\td:0-5
:e2\tmention\t\"Alice\"\td:0-5
";
        let outcome = parse_tackb(text.as_bytes(), &ParseOptions::default()).unwrap();
        assert!(outcome.diagnostics.has(Code::E12DuplicateMention));
        assert_eq!(outcome.kb.link(&span("d", 0, 5)).unwrap().link_name, ":e1");
    }

    #[test]
    fn test_unquote() {
        assert_eq!(unquote("\"Alice\""), "Alice");
        assert_eq!(unquote("plain"), "plain");
        assert_eq!(unquote("\"say \\\"hi\\\"\""), "say \"hi\"");
    }
}
