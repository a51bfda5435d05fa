//! Crowd response parsing
//!
//! Each assignment's answer arrives as JSON wrapped in a version envelope:
//!
//! ```json
//! {"version": "0.2", "response": { ... }}
//! ```
//!
//! A bare payload without the envelope is read as version 0.1. Payload
//! shapes depend on the question batch type:
//!
//! * `selective_relations`: one object (or a one-element array) with a
//!   `subject`, `relation` and `object`; mentions carry their canonical
//!   `entity` and the annotator's judgment of the canonical mention and link.
//! * `exhaustive_relations`: an array of such objects; only the relations
//!   are kept.
//! * `exhaustive_entities`: an array of mentions with their canonical
//!   `entity`; canonical mentions also carry a link.
//!
//! Version 0.1 judges links and canonical mentions with `"Yes"`/`"No"`.
//! Version 0.2 uses a boolean `canonicalCorrect` and replaces `linkCorrect`
//! with `linkGold`, the title the annotator believes is correct or `null`
//! when the shown link is right.

use kbpo_core::model::{is_nil_link, DATE_NAMESPACE, GLOSS_NAMESPACE, WIKI_NAMESPACE};
use kbpo_core::{
    BatchType, Link, Mention, MentionType, Provenance, RelationInstance, RelationLabel, ResponseSet,
};
use serde::Deserialize;
use serde_json::Value;

use crate::{ParseError, Result};

/// Response format revisions
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ResponseVersion {
    #[default]
    V0_1,
    V0_2,
}

impl ResponseVersion {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::V0_1 => "0.1",
            Self::V0_2 => "0.2",
        }
    }
}

impl std::str::FromStr for ResponseVersion {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "0.1" => Ok(Self::V0_1),
            "0.2" => Ok(Self::V0_2),
            other => Err(ParseError::MalformedResponse(format!(
                "unknown response version {other:?}"
            ))),
        }
    }
}

impl std::fmt::Display for ResponseVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Payload Shapes
// ============================================================================

/// `"Yes"`/`"No"` in version 0.1, a boolean in version 0.2
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum Judgment {
    Flag(bool),
    Text(String),
}

impl Judgment {
    fn is_yes(&self) -> bool {
        match self {
            Self::Flag(b) => *b,
            Self::Text(t) => t.trim().eq_ignore_ascii_case("yes"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct TypeRef {
    name: String,
}

#[derive(Debug, Clone, Deserialize)]
struct EntityRef {
    #[serde(default)]
    link: Option<String>,
    doc_char_begin: usize,
    doc_char_end: usize,
    #[serde(rename = "canonicalCorrect", default)]
    canonical_correct: Option<Judgment>,
    #[serde(rename = "linkCorrect", default)]
    link_correct: Option<Judgment>,
    #[serde(rename = "linkGold", default)]
    link_gold: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct MentionRef {
    #[serde(default)]
    gloss: String,
    #[serde(rename = "type")]
    mention_type: TypeRef,
    doc_char_begin: usize,
    doc_char_end: usize,
    entity: EntityRef,
}

#[derive(Debug, Clone, Deserialize)]
struct RelationRef {
    subject: MentionRef,
    relation: String,
    object: MentionRef,
}

fn malformed(msg: impl Into<String>) -> ParseError {
    ParseError::MalformedResponse(msg.into())
}

fn span(doc_id: &str, begin: usize, end: usize) -> Result<Provenance> {
    Provenance::try_new(doc_id, begin, end).map_err(|e| malformed(e.to_string()))
}

impl MentionRef {
    fn provenance(&self, doc_id: &str) -> Result<Provenance> {
        span(doc_id, self.doc_char_begin, self.doc_char_end)
    }

    fn canonical(&self, doc_id: &str) -> Result<Provenance> {
        span(doc_id, self.entity.doc_char_begin, self.entity.doc_char_end)
    }

    fn mention_type(&self) -> Result<MentionType> {
        self.mention_type
            .name
            .parse()
            .map_err(|_| malformed(format!("unknown mention type {:?}", self.mention_type.name)))
    }

    /// Mention row; a rejected canonical mention leaves the mention canonical
    fn to_mention(&self, doc_id: &str) -> Result<Mention> {
        let provenance = self.provenance(doc_id)?;
        let canonical_ok = self
            .entity
            .canonical_correct
            .as_ref()
            .map(Judgment::is_yes)
            .unwrap_or(true);
        let canonical = if canonical_ok {
            self.canonical(doc_id)?
        } else {
            provenance.clone()
        };
        Ok(Mention::new(provenance, self.mention_type()?, self.gloss.trim()).with_canonical(canonical))
    }

    /// Link verdict row for a selective question, if the link was judged
    fn to_judged_link(&self, doc_id: &str, version: ResponseVersion) -> Result<Option<Link>> {
        let mention_type = self.mention_type()?;
        let Some(name) = self
            .entity
            .link
            .as_deref()
            .and_then(|l| namespaced_link(l, mention_type))
        else {
            return Ok(None);
        };
        let correct = match version {
            ResponseVersion::V0_1 => match &self.entity.link_correct {
                Some(j) => j.is_yes(),
                None => return Ok(None),
            },
            ResponseVersion::V0_2 => match self.entity.link_gold.as_deref() {
                None => true,
                Some(gold) => namespaced_link(gold, mention_type).map_or(true, |g| g == name),
            },
        };
        let mut link = Link::new(self.provenance(doc_id)?, name, 1.0);
        link.correct = Some(correct);
        Ok(Some(link))
    }
}

/// Put a raw link into its namespace; empty links yield `None`
fn namespaced_link(link: &str, mention_type: MentionType) -> Option<String> {
    let link = link.trim();
    if link.is_empty() {
        return None;
    }
    let qualified = is_nil_link(link)
        || [WIKI_NAMESPACE, GLOSS_NAMESPACE, DATE_NAMESPACE]
            .iter()
            .any(|ns| link.starts_with(ns));
    if qualified {
        return Some(link.to_string());
    }
    let namespace = match mention_type {
        MentionType::Date => DATE_NAMESPACE,
        MentionType::Title => GLOSS_NAMESPACE,
        _ => WIKI_NAMESPACE,
    };
    Some(format!("{namespace}{link}"))
}

fn relation_label(text: &str) -> Result<RelationLabel> {
    RelationLabel::from_alias(text).ok_or_else(|| malformed(format!("unknown relation {text:?}")))
}

// ============================================================================
// Entry Point
// ============================================================================

/// Split a raw response into its version and payload
pub fn unwrap_envelope(raw: &Value) -> Result<(ResponseVersion, &Value)> {
    match (raw.get("version"), raw.get("response")) {
        (Some(version), Some(payload)) => {
            let version = match version {
                Value::String(s) => s.parse()?,
                Value::Number(n) => n.to_string().parse()?,
                other => return Err(malformed(format!("invalid version marker {other}"))),
            };
            Ok((version, payload))
        }
        _ => Ok((ResponseVersion::V0_1, raw)),
    }
}

fn as_list<T: for<'de> Deserialize<'de>>(payload: &Value) -> Result<Vec<T>> {
    let items = match payload {
        Value::Array(items) => items.clone(),
        Value::Object(_) => vec![payload.clone()],
        Value::Null => Vec::new(),
        other => return Err(malformed(format!("expected an object or array, found {other}"))),
    };
    items
        .into_iter()
        .map(|item| serde_json::from_value(item).map_err(|e| malformed(e.to_string())))
        .collect()
}

/// Parse one assignment's response into mention, link and relation rows
pub fn parse_response(
    batch_type: BatchType,
    question_params: &Value,
    raw: &Value,
    assignment_id: &str,
    question_id: &str,
    max_assignments: u32,
) -> Result<ResponseSet> {
    let doc_id = question_params
        .get("doc_id")
        .and_then(Value::as_str)
        .ok_or_else(|| malformed("question has no doc_id"))?;
    let (version, payload) = unwrap_envelope(raw)?;
    let mut set = ResponseSet::new(assignment_id, question_id, max_assignments);

    match batch_type {
        BatchType::SelectiveRelations => {
            for r in as_list::<RelationRef>(payload)? {
                set.mentions.push(r.subject.to_mention(doc_id)?);
                set.mentions.push(r.object.to_mention(doc_id)?);
                set.links.extend(r.subject.to_judged_link(doc_id, version)?);
                set.links.extend(r.object.to_judged_link(doc_id, version)?);
                set.relations.push(RelationInstance::new(
                    r.subject.provenance(doc_id)?,
                    relation_label(&r.relation)?,
                    r.object.provenance(doc_id)?,
                ));
            }
        }
        BatchType::ExhaustiveRelations => {
            for r in as_list::<RelationRef>(payload)? {
                set.relations.push(RelationInstance::new(
                    r.subject.provenance(doc_id)?,
                    relation_label(&r.relation)?,
                    r.object.provenance(doc_id)?,
                ));
            }
        }
        BatchType::ExhaustiveEntities => {
            for m in as_list::<MentionRef>(payload)? {
                let mention = m.to_mention(doc_id)?;
                if mention.is_canonical() {
                    let link = m
                        .entity
                        .link
                        .as_deref()
                        .and_then(|l| namespaced_link(l, mention.mention_type));
                    if let Some(name) = link {
                        let mut link = Link::new(mention.provenance.clone(), name, 1.0);
                        link.correct = Some(true);
                        set.links.push(link);
                    }
                }
                set.mentions.push(mention);
            }
        }
    }

    set.mentions.sort_by(|a, b| a.provenance.cmp(&b.provenance));
    set.mentions.dedup_by(|a, b| a == b);
    set.links
        .sort_by(|a, b| (&a.provenance, &a.link_name).cmp(&(&b.provenance, &b.link_name)));
    set.links.dedup_by(|a, b| a == b);
    set.relations.sort_by_key(|r| r.pair());
    set.relations.dedup_by(|a, b| a == b);
    Ok(set)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn selective_v01() -> Value {
        json!({"subject":{"gloss":"Mukesh","type":{"idx":0,"name":"PER","gloss":"Person"},
            "doc_char_begin":2803,"doc_char_end":2809,
            "entity":{"gloss":"Mukesh","link":"Mukesh_Ambani","doc_char_begin":2803,"doc_char_end":2809,
                "canonicalCorrect":"Yes","linkCorrect":"No"}},
          "relation":"per:siblings",
          "object":{"gloss":"Singh","type":{"idx":0,"name":"PER","gloss":"Person"},
            "doc_char_begin":2778,"doc_char_end":2783,
            "entity":{"gloss":"Ram Singh","link":"Ram_Singh","doc_char_begin":1703,"doc_char_end":1712,
                "canonicalCorrect":"Yes","linkCorrect":"No"}}})
    }

    const DOC: &str = "NYT_ENG_20130911.0085";

    fn params() -> Value {
        json!({"doc_id": DOC, "batch_type": "selective_relations"})
    }

    #[test]
    fn test_selective_v01() {
        let set = parse_response(BatchType::SelectiveRelations, &params(), &selective_v01(), "a1", "q1", 3).unwrap();
        assert_eq!(set.mentions.len(), 2);
        assert_eq!(set.mentions[0].provenance, Provenance::new(DOC, 2778, 2783));
        assert_eq!(set.mentions[0].canonical, Provenance::new(DOC, 1703, 1712));
        assert_eq!(set.mentions[1].gloss, "Mukesh");

        assert_eq!(set.links.len(), 2);
        assert!(set.links.iter().all(|l| l.correct == Some(false)));
        assert_eq!(set.links[1].link_name, "wiki:Mukesh_Ambani");

        assert_eq!(set.relations.len(), 1);
        assert_eq!(set.relations[0].label, RelationLabel::PerSiblings);
        assert_eq!(set.relations[0].subject, Provenance::new(DOC, 2803, 2809));
        assert_eq!(set.max_assignments, 3);
    }

    #[test]
    fn test_selective_v02() {
        let mut payload = selective_v01();
        payload["subject"]["entity"]["canonicalCorrect"] = json!(true);
        payload["subject"]["entity"]["linkGold"] = Value::Null;
        payload["object"]["entity"]["canonicalCorrect"] = json!(false);
        payload["object"]["entity"]["linkGold"] = json!("Ram_Singh_(politician)");
        let raw = json!({"version": "0.2", "response": payload});

        let set = parse_response(BatchType::SelectiveRelations, &params(), &raw, "a1", "q1", 3).unwrap();
        let object = &set.mentions[0];
        assert!(object.is_canonical());
        let subject_link = set.links.iter().find(|l| l.link_name == "wiki:Mukesh_Ambani").unwrap();
        assert_eq!(subject_link.correct, Some(true));
        let object_link = set.links.iter().find(|l| l.link_name == "wiki:Ram_Singh").unwrap();
        assert_eq!(object_link.correct, Some(false));
    }

    #[test]
    fn test_exhaustive_relations_keep_relations_only() {
        let raw = json!([
            {"subject":{"gloss":" Ahmed Omar","type":{"name":"PER"},"doc_char_begin":438,"doc_char_end":448,
                "entity":{"link":"","doc_char_begin":438,"doc_char_end":448}},
             "relation":"per:employee_or_member_of",
             "object":{"gloss":" Health Ministry","type":{"name":"ORG"},"doc_char_begin":412,"doc_char_end":427,
                "entity":{"link":"Ministry_of_Health_(Egypt)","doc_char_begin":412,"doc_char_end":427}}},
            {"subject":{"gloss":"Mohamed","type":{"name":"PER"},"doc_char_begin":1229,"doc_char_end":1236,
                "entity":{"link":"Mohamed_Morsi","doc_char_begin":1229,"doc_char_end":1236}},
             "relation":"per:title",
             "object":{"gloss":"President","type":{"name":"TITLE"},"doc_char_begin":1219,"doc_char_end":1228,
                "entity":{"link":"","doc_char_begin":1219,"doc_char_end":1228}}}
        ]);
        let params = json!({"doc_id": "ENG_NW_001278_20130216_F00011Q88"});
        let set = parse_response(BatchType::ExhaustiveRelations, &params, &raw, "a", "q", 3).unwrap();
        assert!(set.mentions.is_empty());
        assert!(set.links.is_empty());
        assert_eq!(set.relations.len(), 2);
        assert_eq!(set.relations[0].label, RelationLabel::PerEmployeeOrMemberOf);
        assert_eq!(
            set.relations[0].object,
            Provenance::new("ENG_NW_001278_20130216_F00011Q88", 412, 427)
        );
    }

    #[test]
    fn test_exhaustive_entities_link_canonical_mentions() {
        let raw = json!([
            {"gloss":"China","type":{"name":"GPE"},"doc_char_begin":101,"doc_char_end":106,
             "entity":{"gloss":"China","link":"China","doc_char_begin":101,"doc_char_end":106}},
            {"gloss":"China","type":{"name":"GPE"},"doc_char_begin":207,"doc_char_end":212,
             "entity":{"gloss":"China","link":"China","doc_char_begin":101,"doc_char_end":106}},
            {"gloss":" May 15","type":{"name":"DATE"},"doc_char_begin":284,"doc_char_end":290,
             "entity":{"link":"2001-05-15","doc_char_begin":284,"doc_char_end":290}},
            {"gloss":"Police Force of Myanmar","type":{"name":"ORG"},"doc_char_begin":353,"doc_char_end":376,
             "entity":{"link":"","doc_char_begin":353,"doc_char_end":376}}
        ]);
        let set = parse_response(BatchType::ExhaustiveEntities, &params(), &raw, "a", "q", 3).unwrap();
        assert_eq!(set.mentions.len(), 4);
        assert_eq!(set.mentions[0].gloss, "China");
        assert_eq!(set.mentions[1].canonical, Provenance::new(DOC, 101, 106));
        assert_eq!(set.links.len(), 2);
        assert_eq!(set.links[0].link_name, "wiki:China");
        assert_eq!(set.links[1].link_name, "date:2001-05-15");
        assert_eq!(set.mentions[2].gloss, "May 15");
        assert!(set.relations.is_empty());
    }

    #[test]
    fn test_malformed_responses() {
        let mut bad_relation = selective_v01();
        bad_relation["relation"] = json!("per:favourite_color");
        assert!(matches!(
            parse_response(BatchType::SelectiveRelations, &params(), &bad_relation, "a", "q", 3),
            Err(ParseError::MalformedResponse(_))
        ));
        assert!(parse_response(BatchType::SelectiveRelations, &json!({}), &selective_v01(), "a", "q", 3).is_err());
        let bad_version = json!({"version": "9.9", "response": selective_v01()});
        assert!(parse_response(BatchType::SelectiveRelations, &params(), &bad_version, "a", "q", 3).is_err());
        assert!(parse_response(BatchType::ExhaustiveEntities, &params(), &json!("text"), "a", "q", 3).is_err());
    }

    #[test]
    fn test_empty_response() {
        let set = parse_response(BatchType::ExhaustiveEntities, &params(), &json!([]), "a", "q", 3).unwrap();
        assert!(set.is_empty());
    }
}
