//! Entry file reader and writer
//!
//! One definition per tab-separated line, at most five columns:
//!
//! ```text
//! <span>  PER|ORG|GPE|TITLE|DATE  <gloss>            <unused>  <weight>
//! <span>  canonical_mention        <span>            <unused>  <weight>
//! <span>  link                     <entity name>     <unused>  <weight>
//! <span>  <relation>               <span>            <spans>   <weight>
//! ```
//!
//! Spans are written `doc_id:begin-end`; relation provenances are a comma
//! separated list of spans. A missing weight reads as 0.

use std::io::{BufRead, Write};

use kbpo_core::span::join_spans;
use kbpo_core::{KnowledgeBase, MentionType, Provenance, RelationInstance, RelationLabel};
use regex::Regex;
use tracing::debug;

use crate::{DiagnosticCode as Code, KbBuilder, ParseError, ParseOptions, ParseOutcome, Result};

/// Most columns a line may carry
pub const MAX_COLUMNS: usize = 5;

const SPAN_PATTERN: &str = r"^([A-Za-z0-9_.\-]+):([0-9]+)-([0-9]+)$";

/// Span syntax shared by the entry and TAC-KB readers
#[derive(Debug, Clone)]
pub(crate) struct SpanParser {
    pattern: Regex,
}

impl SpanParser {
    pub(crate) fn new() -> Result<Self> {
        Ok(Self {
            pattern: Regex::new(SPAN_PATTERN)?,
        })
    }

    /// Parse one span; `None` if malformed or empty
    pub(crate) fn span(&self, text: &str) -> Option<Provenance> {
        let caps = self.pattern.captures(text.trim())?;
        let begin = caps.get(2)?.as_str().parse().ok()?;
        let end = caps.get(3)?.as_str().parse().ok()?;
        Provenance::try_new(caps.get(1)?.as_str(), begin, end).ok()
    }

    /// Parse a comma separated span list; `Err` names the first bad entry
    pub(crate) fn spans<'t>(&self, text: &'t str) -> std::result::Result<Vec<Provenance>, &'t str> {
        text.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| self.span(s).ok_or(s))
            .collect()
    }
}

/// Weight column: empty reads as 0, values outside [0, 1] are clamped
pub(crate) fn parse_weight(builder: &mut KbBuilder<'_>, line: usize, text: &str) -> Option<f64> {
    let text = text.trim();
    if text.is_empty() {
        return Some(0.0);
    }
    let Ok(weight) = text.parse::<f64>() else {
        builder.diagnose(Code::E05MalformedWeight, Some(line), format!("malformed weight {text:?}"));
        return None;
    };
    if !weight.is_finite() {
        builder.diagnose(Code::E05MalformedWeight, Some(line), format!("malformed weight {text:?}"));
        return None;
    }
    if !(0.0..=1.0).contains(&weight) {
        builder.diagnose(
            Code::E06WeightOutOfRange,
            Some(line),
            format!("weight {weight} outside [0, 1], clamping"),
        );
        return Some(weight.clamp(0.0, 1.0));
    }
    Some(weight)
}

// ============================================================================
// Reader
// ============================================================================

/// Parse and validate an entry file
pub fn parse_entries<R: BufRead>(reader: R, options: &ParseOptions) -> Result<ParseOutcome> {
    let spans = SpanParser::new()?;
    let mut builder = KbBuilder::new(options);

    for (index, line) in reader.lines().enumerate() {
        let lineno = index + 1;
        let line = line.map_err(|e| ParseError::IoError {
            path: format!("<entries line {lineno}>"),
            source: e,
        })?;
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

        let Some(subject) = spans.span(col(0)) else {
            builder.diagnose(Code::E02MalformedSubject, Some(lineno), format!("malformed subject span {:?}", col(0)));
            continue;
        };
        let Some(weight) = parse_weight(&mut builder, lineno, col(4)) else {
            continue;
        };

        let relation = col(1);
        if let Ok(mention_type) = relation.parse::<MentionType>() {
            builder.add_mention(Some(lineno), subject, mention_type, col(2), weight);
        } else if relation == "link" {
            if col(2).is_empty() {
                builder.diagnose(Code::E03MalformedObject, Some(lineno), "missing link name");
                continue;
            }
            builder.add_link(Some(lineno), subject, col(2), weight);
        } else if relation == "canonical_mention" {
            let Some(canonical) = spans.span(col(2)) else {
                builder.diagnose(Code::E03MalformedObject, Some(lineno), format!("malformed object span {:?}", col(2)));
                continue;
            };
            builder.add_canonical(Some(lineno), subject, canonical);
        } else if let Some(label) = RelationLabel::from_alias(relation) {
            let Some(object) = spans.span(col(2)) else {
                builder.diagnose(Code::E03MalformedObject, Some(lineno), format!("malformed object span {:?}", col(2)));
                continue;
            };
            let provenances = match spans.spans(col(3)) {
                Ok(provenances) => provenances,
                Err(bad) => {
                    builder.diagnose(Code::E04MalformedProvenance, Some(lineno), format!("malformed provenance {bad:?}"));
                    continue;
                }
            };
            let instance = RelationInstance::new(subject, label, object)
                .with_provenances(provenances)
                .with_weight(weight);
            builder.add_relation(Some(lineno), instance);
        } else {
            builder.diagnose(
                Code::E07UnsupportedRelation,
                Some(lineno),
                format!("ignoring relation: {relation} (not supported)"),
            );
        }
    }

    builder.finish()
}

// ============================================================================
// Writer
// ============================================================================

/// Write a knowledge base as an entry file
///
/// Mentions come first, then links, canonical mentions and relations, each
/// in span order. Reading the output back yields the same knowledge base.
pub fn write_entries<W: Write>(kb: &KnowledgeBase, mut writer: W) -> std::io::Result<()> {
    for m in kb.mentions.values() {
        writeln!(writer, "{}\t{}\t{}\t\t{}", m.provenance, m.mention_type, m.gloss, m.weight)?;
    }
    for l in kb.links.values() {
        writeln!(writer, "{}\tlink\t{}\t\t{}", l.provenance, l.link_name, l.weight)?;
    }
    for m in kb.mentions.values() {
        writeln!(
            writer,
            "{}\tcanonical_mention\t{}\t\t{}",
            m.provenance, m.canonical, m.weight
        )?;
    }
    for r in kb.relations.values() {
        writeln!(
            writer,
            "{}\t{}\t{}\t{}\t{}",
            r.subject,
            r.label,
            r.object,
            join_spans(&r.provenances),
            r.weight
        )?;
    }
    debug!(
        mentions = kb.mentions.len(),
        relations = kb.relations.len(),
        "wrote entries"
    );
    writer.flush()
}
