//! Provenance spans
//!
//! A provenance is a half-open character span `[begin, end)` inside one
//! document. Spans are totally ordered by `(doc_id, begin, end)`, which is
//! the order every sweep over mentions relies on.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::KbpoError;

/// Half-open character span within a document
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Provenance {
    /// Document identifier
    pub doc_id: String,
    /// First character offset (inclusive)
    pub begin: usize,
    /// Last character offset (exclusive)
    pub end: usize,
}

impl Provenance {
    /// Create a span without validation
    pub fn new(doc_id: impl Into<String>, begin: usize, end: usize) -> Self {
        Self {
            doc_id: doc_id.into(),
            begin,
            end,
        }
    }

    /// Create a span, rejecting empty or inverted intervals
    pub fn try_new(doc_id: impl Into<String>, begin: usize, end: usize) -> Result<Self, KbpoError> {
        let doc_id = doc_id.into();
        if doc_id.is_empty() {
            return Err(KbpoError::Validation("span has an empty document id".to_string()));
        }
        if begin >= end {
            return Err(KbpoError::Validation(format!(
                "invalid span {doc_id}:{begin}-{end}, expected begin < end"
            )));
        }
        Ok(Self { doc_id, begin, end })
    }

    /// Number of characters covered
    pub fn len(&self) -> usize {
        self.end.saturating_sub(self.begin)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True if both spans live in the same document
    pub fn same_doc(&self, other: &Provenance) -> bool {
        self.doc_id == other.doc_id
    }

    /// True if `other` lies entirely within `self`
    pub fn contains(&self, other: &Provenance) -> bool {
        self.same_doc(other) && self.begin <= other.begin && other.end <= self.end
    }

    /// True if the two spans share at least one character
    pub fn overlaps(&self, other: &Provenance) -> bool {
        self.same_doc(other) && self.begin < other.end && other.begin < self.end
    }

    /// Smallest span covering both arguments; `None` across documents
    pub fn covering(&self, other: &Provenance) -> Option<Provenance> {
        if !self.same_doc(other) {
            return None;
        }
        Some(Provenance::new(
            self.doc_id.clone(),
            self.begin.min(other.begin),
            self.end.max(other.end),
        ))
    }

    /// `(begin, end)` pair, the form used inside question parameters
    pub fn offsets(&self) -> (usize, usize) {
        (self.begin, self.end)
    }
}

impl fmt::Display for Provenance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}-{}", self.doc_id, self.begin, self.end)
    }
}

impl FromStr for Provenance {
    type Err = KbpoError;

    /// Parses `doc_id:begin-end`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (doc_id, offsets) = s
            .rsplit_once(':')
            .ok_or_else(|| KbpoError::Validation(format!("malformed span '{s}': missing ':'")))?;
        let (begin, end) = offsets
            .split_once('-')
            .ok_or_else(|| KbpoError::Validation(format!("malformed span '{s}': missing '-'")))?;
        let begin = begin
            .trim()
            .parse::<usize>()
            .map_err(|e| KbpoError::Validation(format!("malformed span '{s}': {e}")))?;
        let end = end
            .trim()
            .parse::<usize>()
            .map_err(|e| KbpoError::Validation(format!("malformed span '{s}': {e}")))?;
        Provenance::try_new(doc_id, begin, end)
    }
}

/// Join spans the way relation provenances are written: comma separated
pub fn join_spans(spans: &[Provenance]) -> String {
    spans
        .iter()
        .map(|p| p.to_string())
        .collect::<Vec<_>>()
        .join(",")
}
