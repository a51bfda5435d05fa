//! KBPO Parser - Submission and crowd response parsing
//!
//! Supports parsing of:
//! - Entry files (`subject relation object provenance weight`, tab separated)
//! - TAC-KB files (the same columns grouped by entity id)
//! - Crowd responses for the three question batch types, versions 0.1 and 0.2
//!
//! Per-line input problems never abort a parse. They are recorded as
//! numbered [`Diagnostic`]s and the offending line is dropped; only I/O
//! failures and submissions with nothing usable left are fatal.

pub mod builder;
pub mod mfile;
pub mod response;
pub mod tackb;

pub use builder::KbBuilder;
pub use mfile::{parse_entries, write_entries};
pub use response::{parse_response, ResponseVersion};
pub use tackb::parse_tackb;

use kbpo_core::KnowledgeBase;
use std::collections::HashMap;
use std::io::BufRead;
use std::path::Path;
use thiserror::Error;

// ============================================================================
// Error Types
// ============================================================================

/// Fatal parse errors
#[derive(Error, Debug)]
pub enum ParseError {
    /// IO error while reading the input
    #[error("IO error reading {path}")]
    IoError {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Input format is not supported
    #[error("Unsupported input format: {0}")]
    UnsupportedFormat(String),

    /// Nothing usable survived validation
    #[error("Submission has no valid mentions ({0} diagnostics)")]
    EmptySubmission(usize),

    /// Crowd response could not be interpreted
    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    #[error("Invalid pattern: {0}")]
    Pattern(#[from] regex::Error),
}

pub type Result<T> = std::result::Result<T, ParseError>;

// ============================================================================
// Diagnostics
// ============================================================================

/// Numbered input problems
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DiagnosticCode {
    E01TooManyColumns,
    E02MalformedSubject,
    E03MalformedObject,
    E04MalformedProvenance,
    E05MalformedWeight,
    E06WeightOutOfRange,
    E07UnsupportedRelation,
    E08OutsideCorpus,
    E09CanonicalOutsideDocument,
    E10ObjectOutsideDocument,
    E11ProvenanceOutsideDocument,
    E12DuplicateMention,
    E13InconsistentType,
    E14InconsistentGloss,
    E15DuplicateCanonicalMention,
    E16InconsistentCanonicalMention,
    E17DuplicateLink,
    E18InconsistentLink,
    E19ReservedLinkNamespace,
    E20DuplicateRelation,
    E21InconsistentRelation,
    E22MissingProvenance,
    E23SelfRelation,
    E24MissingCanonicalMention,
    E25MissingLink,
    E26UndefinedCanonicalMention,
    E27UndefinedLinkMention,
    E28UndefinedRelationMention,
    E29RelationTypeMismatch,
    E30UnresolvedInverse,
    E31InconsistentSymmetricRelation,
    E32SpanOutsideDocument,
}

impl DiagnosticCode {
    /// Short code, e.g. `E07`
    pub fn code(&self) -> &'static str {
        use DiagnosticCode::*;
        match self {
            E01TooManyColumns => "E01",
            E02MalformedSubject => "E02",
            E03MalformedObject => "E03",
            E04MalformedProvenance => "E04",
            E05MalformedWeight => "E05",
            E06WeightOutOfRange => "E06",
            E07UnsupportedRelation => "E07",
            E08OutsideCorpus => "E08",
            E09CanonicalOutsideDocument => "E09",
            E10ObjectOutsideDocument => "E10",
            E11ProvenanceOutsideDocument => "E11",
            E12DuplicateMention => "E12",
            E13InconsistentType => "E13",
            E14InconsistentGloss => "E14",
            E15DuplicateCanonicalMention => "E15",
            E16InconsistentCanonicalMention => "E16",
            E17DuplicateLink => "E17",
            E18InconsistentLink => "E18",
            E19ReservedLinkNamespace => "E19",
            E20DuplicateRelation => "E20",
            E21InconsistentRelation => "E21",
            E22MissingProvenance => "E22",
            E23SelfRelation => "E23",
            E24MissingCanonicalMention => "E24",
            E25MissingLink => "E25",
            E26UndefinedCanonicalMention => "E26",
            E27UndefinedLinkMention => "E27",
            E28UndefinedRelationMention => "E28",
            E29RelationTypeMismatch => "E29",
            E30UnresolvedInverse => "E30",
            E31InconsistentSymmetricRelation => "E31",
            E32SpanOutsideDocument => "E32",
        }
    }

    /// Default severity of the code
    pub fn severity(&self) -> Severity {
        use DiagnosticCode::*;
        match self {
            E07UnsupportedRelation | E12DuplicateMention | E15DuplicateCanonicalMention
            | E17DuplicateLink | E20DuplicateRelation | E22MissingProvenance
            | E24MissingCanonicalMention | E25MissingLink | E19ReservedLinkNamespace
            | E06WeightOutOfRange | E08OutsideCorpus | E31InconsistentSymmetricRelation => {
                Severity::Warning
            }
            _ => Severity::Error,
        }
    }
}

impl std::fmt::Display for DiagnosticCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}

/// How serious a diagnostic is
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Warning,
    Error,
}

/// A non-fatal input problem
#[derive(Debug, Clone, PartialEq)]
pub struct Diagnostic {
    pub code: DiagnosticCode,
    pub severity: Severity,
    /// 1-based input line; `None` for whole-file checks
    pub line: Option<usize>,
    pub message: String,
}

impl std::fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let level = match self.severity {
            Severity::Warning => "warning",
            Severity::Error => "error",
        };
        match self.line {
            Some(line) => write!(f, "{} {level} line {line}: {}", self.code, self.message),
            None => write!(f, "{} {level}: {}", self.code, self.message),
        }
    }
}

/// Collected diagnostics of one parse
#[derive(Debug, Clone, Default)]
pub struct DiagnosticLog {
    entries: Vec<Diagnostic>,
}

impl DiagnosticLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a diagnostic at its default severity
    pub fn push(&mut self, code: DiagnosticCode, line: Option<usize>, message: impl Into<String>) {
        let diagnostic = Diagnostic {
            code,
            severity: code.severity(),
            line,
            message: message.into(),
        };
        match diagnostic.severity {
            Severity::Warning => tracing::warn!(code = %code, line = ?line, "{}", diagnostic.message),
            Severity::Error => tracing::debug!(code = %code, line = ?line, "{}", diagnostic.message),
        }
        self.entries.push(diagnostic);
    }

    pub fn entries(&self) -> &[Diagnostic] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn errors(&self) -> impl Iterator<Item = &Diagnostic> {
        self.entries.iter().filter(|d| d.severity == Severity::Error)
    }

    pub fn warnings(&self) -> impl Iterator<Item = &Diagnostic> {
        self.entries.iter().filter(|d| d.severity == Severity::Warning)
    }

    pub fn count(&self, code: DiagnosticCode) -> usize {
        self.entries.iter().filter(|d| d.code == code).count()
    }

    pub fn has(&self, code: DiagnosticCode) -> bool {
        self.count(code) > 0
    }

    /// Counts per code, in code order
    pub fn summary(&self) -> Vec<(DiagnosticCode, usize)> {
        let mut counts = std::collections::BTreeMap::new();
        for d in &self.entries {
            *counts.entry(d.code).or_insert(0usize) += 1;
        }
        counts.into_iter().collect()
    }
}

// ============================================================================
// Parse Options and Entry Points
// ============================================================================

/// Supported submission formats
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum InputFormat {
    #[default]
    Mfile,
    TacKb,
}

impl std::str::FromStr for InputFormat {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "mfile" | "entries" => Ok(Self::Mfile),
            "tackb" | "tac-kb" | "tac" => Ok(Self::TacKb),
            other => Err(ParseError::UnsupportedFormat(other.to_string())),
        }
    }
}

/// Options shared by both readers
#[derive(Debug, Clone, Default)]
pub struct ParseOptions {
    /// Corpus documents and their text lengths. Mentions outside the corpus
    /// are ignored; a length of 0 skips the bounds check.
    pub documents: Option<HashMap<String, usize>>,
}

impl ParseOptions {
    pub fn with_documents(mut self, documents: HashMap<String, usize>) -> Self {
        self.documents = Some(documents);
        self
    }
}

/// A validated knowledge base with the diagnostics raised on the way
#[derive(Debug, Clone)]
pub struct ParseOutcome {
    pub kb: KnowledgeBase,
    pub diagnostics: DiagnosticLog,
}

/// Parse a submission in either format
pub fn parse_kb<R: BufRead>(
    reader: R,
    format: InputFormat,
    options: &ParseOptions,
) -> Result<ParseOutcome> {
    match format {
        InputFormat::Mfile => parse_entries(reader, options),
        InputFormat::TacKb => parse_tackb(reader, options),
    }
}

/// Parse a submission file from disk
pub fn parse_kb_file(
    path: &Path,
    format: InputFormat,
    options: &ParseOptions,
) -> Result<ParseOutcome> {
    let file = std::fs::File::open(path).map_err(|e| ParseError::IoError {
        path: path.display().to_string(),
        source: e,
    })?;
    parse_kb(std::io::BufReader::new(file), format, options)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_numbered() {
        assert_eq!(DiagnosticCode::E01TooManyColumns.code(), "E01");
        assert_eq!(DiagnosticCode::E32SpanOutsideDocument.code(), "E32");
        assert_eq!(
            DiagnosticCode::E07UnsupportedRelation.severity(),
            Severity::Warning
        );
        assert_eq!(DiagnosticCode::E23SelfRelation.severity(), Severity::Error);
    }

    #[test]
    fn test_log_summary() {
        let mut log = DiagnosticLog::new();
        log.push(DiagnosticCode::E07UnsupportedRelation, Some(3), "per:alternate_names");
        log.push(DiagnosticCode::E07UnsupportedRelation, Some(4), "per:alternate_names");
        log.push(DiagnosticCode::E23SelfRelation, Some(9), "d:0-1");
        assert_eq!(log.len(), 3);
        assert_eq!(log.errors().count(), 1);
        assert_eq!(
            log.summary(),
            vec![
                (DiagnosticCode::E07UnsupportedRelation, 2),
                (DiagnosticCode::E23SelfRelation, 1)
            ]
        );
        assert_eq!(
            log.entries()[2].to_string(),
            "E23 error line 9: d:0-1"
        );
    }

    #[test]
    fn test_format_parse() {
        assert_eq!("TACKB".parse::<InputFormat>().unwrap(), InputFormat::TacKb);
        assert!("csv".parse::<InputFormat>().is_err());
    }

    #[test]
    fn test_parse_kb_file() {
        use std::io::Write;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run1.tsv");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "d1:0-5\tPER\tAlice\t\t1.0").unwrap();
        writeln!(file, "d1:10-20\tORG\tAcme\t\t1.0").unwrap();
        writeln!(file, "d1:0-5\tper:employee_or_member_of\td1:10-20\td1:0-20\t1.0").unwrap();
        drop(file);

        let outcome = parse_kb_file(&path, InputFormat::Mfile, &ParseOptions::default()).unwrap();
        assert_eq!(outcome.kb.mentions.len(), 2);
        assert_eq!(outcome.kb.relations.len(), 2);

        let missing = dir.path().join("missing.tsv");
        assert!(matches!(
            parse_kb_file(&missing, InputFormat::Mfile, &ParseOptions::default()),
            Err(ParseError::IoError { .. })
        ));
    }
}
